//! Artifact store contract.
//!
//! Every object belonging to a track lives under
//! `artists/{artistId}/tracks/{trackUniqueId}/`, so one
//! [`ArtifactStore::delete_by_prefix`] call removes a whole artifact set.

pub mod filesystem;
pub mod memory;

use std::fmt;
use std::path::Path;

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{ArtistId, TrackUniqueId};

pub use filesystem::FilesystemArtifactStore;
pub use memory::MemoryArtifactStore;

/// Blob storage consumed by the pipeline and by track deletion.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Stores `bytes` under `key` and returns its public URL. Overwrites.
    async fn put(
        &self,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<String>;

    /// Removes every object whose key starts with `prefix`; returns the count.
    async fn delete_by_prefix(&self, prefix: &str) -> Result<usize>;

    /// Keys currently stored under `prefix`, sorted.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    fn public_url_for(&self, key: &str) -> String;

    async fn put_file(
        &self,
        key: &str,
        path: &Path,
        content_type: &str,
    ) -> Result<String> {
        let bytes = tokio::fs::read(path).await?;
        self.put(key, bytes, content_type).await
    }
}

/// Named objects making up a track's artifact set.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub enum ArtifactName {
    Audio,
    Cover { extension: String },
    Waveform,
    Timestamps,
}

impl ArtifactName {
    /// Cover artifact keeping the uploaded image's extension.
    pub fn cover_for(path: &Path) -> Self {
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .filter(|e| !e.is_empty() && e.chars().all(|c| c.is_ascii_alphanumeric()))
            .unwrap_or_else(|| "jpg".to_string());
        ArtifactName::Cover { extension }
    }

    pub fn file_name(&self) -> String {
        match self {
            ArtifactName::Audio => "audio.mp3".to_string(),
            ArtifactName::Cover { extension } => format!("cover.{extension}"),
            ArtifactName::Waveform => "waveform.json".to_string(),
            ArtifactName::Timestamps => "timestamps.json".to_string(),
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            ArtifactName::Audio => "audio/mpeg",
            ArtifactName::Cover { extension } => match extension.as_str() {
                "png" => "image/png",
                "webp" => "image/webp",
                "gif" => "image/gif",
                "avif" => "image/avif",
                _ => "image/jpeg",
            },
            ArtifactName::Waveform | ArtifactName::Timestamps => {
                "application/json"
            }
        }
    }
}

/// Folder of one track in the artifact store.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct TrackLocation {
    pub artist_id: ArtistId,
    pub track_unique_id: TrackUniqueId,
}

impl TrackLocation {
    pub fn new(artist_id: ArtistId, track_unique_id: TrackUniqueId) -> Self {
        Self {
            artist_id,
            track_unique_id,
        }
    }

    /// Prefix shared by every key of this track, with a trailing slash.
    pub fn prefix(&self) -> String {
        format!(
            "artists/{}/tracks/{}/",
            self.artist_id, self.track_unique_id
        )
    }

    pub fn key(&self, name: &ArtifactName) -> String {
        format!("{}{}", self.prefix(), name.file_name())
    }
}

impl fmt::Display for TrackLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.prefix())
    }
}
