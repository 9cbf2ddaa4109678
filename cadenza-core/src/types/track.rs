use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::ids::{ArtistId, TrackId, TrackUniqueId};

/// Optional identifiers of the same recording on third-party platforms.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalTrackRefs {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spotify_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub youtube_id: Option<String>,
}

impl ExternalTrackRefs {
    pub fn is_empty(&self) -> bool {
        self.spotify_id.is_none() && self.youtube_id.is_none()
    }
}

/// Job payload staged by the API layer.
///
/// `source_audio_path` and `cover_image_path` are owned by the job from the
/// moment it is enqueued: the pipeline deletes them once they are no longer
/// needed, and nothing else may touch them.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackSubmission {
    pub title: String,
    pub artist_id: ArtistId,
    /// Client-reported length of the upload. Advisory only.
    #[serde(default)]
    pub duration_seconds: Option<f64>,
    pub source_audio_path: PathBuf,
    pub original_filename: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cover_image_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_track_refs: Option<ExternalTrackRefs>,
}

/// Public locators produced by one successful job.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackArtifactSet {
    pub audio_url: String,
    #[serde(default)]
    pub cover_url: Option<String>,
    pub waveform_url: String,
    pub voice_timestamps_url: String,
    pub duration_seconds: u32,
}

/// Row written once per track after every upload has succeeded.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewTrackRecord {
    pub track_unique_id: TrackUniqueId,
    pub title: String,
    pub artist_id: ArtistId,
    pub audio_url: String,
    pub cover_url: Option<String>,
    pub duration_seconds: u32,
    pub waveform_url: String,
    pub voice_timestamps_url: String,
    #[serde(default)]
    pub external_refs: ExternalTrackRefs,
}

/// A persisted track row.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackRecord {
    pub id: TrackId,
    pub track_unique_id: TrackUniqueId,
    pub title: String,
    pub artist_id: ArtistId,
    pub audio_url: String,
    pub cover_url: Option<String>,
    pub duration_seconds: u32,
    pub waveform_url: String,
    pub voice_timestamps_url: String,
    #[serde(default)]
    pub external_refs: ExternalTrackRefs,
}

impl TrackRecord {
    pub fn from_new(id: TrackId, new: NewTrackRecord) -> Self {
        Self {
            id,
            track_unique_id: new.track_unique_id,
            title: new.title,
            artist_id: new.artist_id,
            audio_url: new.audio_url,
            cover_url: new.cover_url,
            duration_seconds: new.duration_seconds,
            waveform_url: new.waveform_url,
            voice_timestamps_url: new.voice_timestamps_url,
            external_refs: new.external_refs,
        }
    }

    pub fn artifact_set(&self) -> TrackArtifactSet {
        TrackArtifactSet {
            audio_url: self.audio_url.clone(),
            cover_url: self.cover_url.clone(),
            waveform_url: self.waveform_url.clone(),
            voice_timestamps_url: self.voice_timestamps_url.clone(),
            duration_seconds: self.duration_seconds,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn submission_uses_camel_case_and_optional_fields() {
        let json = r#"{
            "title": "Night Drive",
            "artistId": 42,
            "sourceAudioPath": "/tmp/upload-1.wav",
            "originalFilename": "night drive.wav"
        }"#;
        let sub: TrackSubmission = serde_json::from_str(json).unwrap();
        assert_eq!(sub.artist_id, ArtistId(42));
        assert!(sub.cover_image_path.is_none());
        assert!(sub.duration_seconds.is_none());
        assert!(sub.external_track_refs.is_none());
    }

    #[test]
    fn artifact_set_serializes_with_public_names() {
        let set = TrackArtifactSet {
            audio_url: "a".into(),
            cover_url: None,
            waveform_url: "w".into(),
            voice_timestamps_url: "t".into(),
            duration_seconds: 60,
        };
        let value = serde_json::to_value(&set).unwrap();
        assert_eq!(value["voiceTimestampsUrl"], "t");
        assert_eq!(value["durationSeconds"], 60);
        assert!(value["coverUrl"].is_null());
    }
}
