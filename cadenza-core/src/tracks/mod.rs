//! Relational track rows and track deletion.

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::error::Result;
use crate::storage::{ArtifactStore, TrackLocation};
use crate::types::{NewTrackRecord, TrackId, TrackRecord, TrackUniqueId};

pub use memory::InMemoryTrackRepository;
#[cfg(feature = "postgres")]
pub use postgres::PostgresTrackRepository;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TrackRepository: Send + Sync {
    /// Inserts the row for `record.track_unique_id` unless one already
    /// exists, and returns the stored row either way.
    async fn insert_once(&self, record: NewTrackRecord) -> Result<TrackRecord>;

    async fn find_by_unique_id(
        &self,
        track_unique_id: TrackUniqueId,
    ) -> Result<Option<TrackRecord>>;

    async fn get(&self, id: TrackId) -> Result<Option<TrackRecord>>;

    /// Removes the row and returns what was removed.
    async fn delete(&self, id: TrackId) -> Result<Option<TrackRecord>>;
}

/// Track-level operations spanning the relational store and the artifact store.
#[derive(Clone)]
pub struct TrackCatalog {
    tracks: Arc<dyn TrackRepository>,
    artifacts: Arc<dyn ArtifactStore>,
}

impl fmt::Debug for TrackCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackCatalog").finish_non_exhaustive()
    }
}

impl TrackCatalog {
    pub fn new(
        tracks: Arc<dyn TrackRepository>,
        artifacts: Arc<dyn ArtifactStore>,
    ) -> Self {
        Self { tracks, artifacts }
    }

    pub async fn get(&self, id: TrackId) -> Result<Option<TrackRecord>> {
        self.tracks.get(id).await
    }

    /// Deletes the row first, then the whole artifact folder, so no row
    /// ever points at deleted objects. Returns `false` if the track is unknown.
    pub async fn delete_track(&self, id: TrackId) -> Result<bool> {
        let Some(record) = self.tracks.delete(id).await? else {
            return Ok(false);
        };
        let location =
            TrackLocation::new(record.artist_id, record.track_unique_id);
        let removed = self.artifacts.delete_by_prefix(&location.prefix()).await?;
        info!(
            track_id = %id,
            prefix = %location,
            removed,
            "deleted track and its artifacts"
        );
        Ok(true)
    }
}
