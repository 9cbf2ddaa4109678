use std::fmt;

use async_trait::async_trait;
use sqlx::PgPool;
use tracing::debug;
use uuid::Uuid;

use crate::error::{PipelineError, Result};
use crate::types::{
    ArtistId, ExternalTrackRefs, NewTrackRecord, TrackId, TrackRecord,
    TrackUniqueId,
};

use super::TrackRepository;

const TRACK_COLUMNS: &str = "id, track_unique_id, title, artist_id, audio_url, \
     cover_image_url, duration, waveform_url, voice_timestamps_url, \
     spotify_id, youtube_id";

/// [`TrackRepository`] over the `music_tracks` table.
#[derive(Clone)]
pub struct PostgresTrackRepository {
    pool: PgPool,
}

impl fmt::Debug for PostgresTrackRepository {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresTrackRepository")
            .field("pool_size", &self.pool.size())
            .field("idle_connections", &self.pool.num_idle())
            .finish()
    }
}

#[derive(sqlx::FromRow)]
struct TrackRow {
    id: i64,
    track_unique_id: Uuid,
    title: String,
    artist_id: i64,
    audio_url: String,
    cover_image_url: Option<String>,
    duration: i32,
    waveform_url: String,
    voice_timestamps_url: String,
    spotify_id: Option<String>,
    youtube_id: Option<String>,
}

impl From<TrackRow> for TrackRecord {
    fn from(row: TrackRow) -> Self {
        TrackRecord {
            id: TrackId(row.id),
            track_unique_id: TrackUniqueId(row.track_unique_id),
            title: row.title,
            artist_id: ArtistId(row.artist_id),
            audio_url: row.audio_url,
            cover_url: row.cover_image_url,
            duration_seconds: row.duration.max(0) as u32,
            waveform_url: row.waveform_url,
            voice_timestamps_url: row.voice_timestamps_url,
            external_refs: ExternalTrackRefs {
                spotify_id: row.spotify_id,
                youtube_id: row.youtube_id,
            },
        }
    }
}

impl PostgresTrackRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TrackRepository for PostgresTrackRepository {
    async fn insert_once(&self, record: NewTrackRecord) -> Result<TrackRecord> {
        let duration = i32::try_from(record.duration_seconds).map_err(|_| {
            PipelineError::Invariant(format!(
                "duration {} out of range",
                record.duration_seconds
            ))
        })?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO music_tracks
                (track_unique_id, title, artist_id, audio_url, cover_image_url,
                 duration, waveform_url, voice_timestamps_url, spotify_id, youtube_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (track_unique_id) DO NOTHING
            "#,
        )
        .bind(record.track_unique_id.0)
        .bind(&record.title)
        .bind(record.artist_id.0)
        .bind(&record.audio_url)
        .bind(&record.cover_url)
        .bind(duration)
        .bind(&record.waveform_url)
        .bind(&record.voice_timestamps_url)
        .bind(&record.external_refs.spotify_id)
        .bind(&record.external_refs.youtube_id)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            PipelineError::Internal(format!("track insert failed: {e}"))
        })?;

        if inserted.rows_affected() == 0 {
            debug!(
                track_unique_id = %record.track_unique_id,
                "track row already present; reusing"
            );
        }

        self.find_by_unique_id(record.track_unique_id)
            .await?
            .ok_or_else(|| {
                PipelineError::Invariant(format!(
                    "track {} missing right after insert",
                    record.track_unique_id
                ))
            })
    }

    async fn find_by_unique_id(
        &self,
        track_unique_id: TrackUniqueId,
    ) -> Result<Option<TrackRecord>> {
        let row = sqlx::query_as::<_, TrackRow>(&format!(
            "SELECT {TRACK_COLUMNS} FROM music_tracks WHERE track_unique_id = $1"
        ))
        .bind(track_unique_id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| PipelineError::Internal(format!("track lookup failed: {e}")))?;
        Ok(row.map(Into::into))
    }

    async fn get(&self, id: TrackId) -> Result<Option<TrackRecord>> {
        let row = sqlx::query_as::<_, TrackRow>(&format!(
            "SELECT {TRACK_COLUMNS} FROM music_tracks WHERE id = $1"
        ))
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| PipelineError::Internal(format!("track lookup failed: {e}")))?;
        Ok(row.map(Into::into))
    }

    async fn delete(&self, id: TrackId) -> Result<Option<TrackRecord>> {
        let row = sqlx::query_as::<_, TrackRow>(&format!(
            "DELETE FROM music_tracks WHERE id = $1 RETURNING {TRACK_COLUMNS}"
        ))
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| PipelineError::Internal(format!("track delete failed: {e}")))?;
        Ok(row.map(Into::into))
    }
}
