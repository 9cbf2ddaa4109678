use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::Result;
use crate::types::{NewTrackRecord, TrackId, TrackRecord, TrackUniqueId};

use super::TrackRepository;

#[derive(Default)]
struct TrackTable {
    next_id: i64,
    rows: BTreeMap<TrackId, TrackRecord>,
}

/// Process-local [`TrackRepository`].
#[derive(Clone, Default)]
pub struct InMemoryTrackRepository {
    table: Arc<Mutex<TrackTable>>,
}

impl fmt::Debug for InMemoryTrackRepository {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("InMemoryTrackRepository");
        match self.table.try_lock() {
            Ok(table) => debug.field("rows", &table.rows.len()),
            Err(_) => debug.field("rows", &"<locked>"),
        };
        debug.finish()
    }
}

impl InMemoryTrackRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn all(&self) -> Vec<TrackRecord> {
        self.table.lock().await.rows.values().cloned().collect()
    }
}

#[async_trait]
impl TrackRepository for InMemoryTrackRepository {
    async fn insert_once(&self, record: NewTrackRecord) -> Result<TrackRecord> {
        let mut table = self.table.lock().await;
        if let Some(existing) = table
            .rows
            .values()
            .find(|row| row.track_unique_id == record.track_unique_id)
        {
            return Ok(existing.clone());
        }
        table.next_id += 1;
        let id = TrackId(table.next_id);
        let row = TrackRecord::from_new(id, record);
        table.rows.insert(id, row.clone());
        Ok(row)
    }

    async fn find_by_unique_id(
        &self,
        track_unique_id: TrackUniqueId,
    ) -> Result<Option<TrackRecord>> {
        let table = self.table.lock().await;
        Ok(table
            .rows
            .values()
            .find(|row| row.track_unique_id == track_unique_id)
            .cloned())
    }

    async fn get(&self, id: TrackId) -> Result<Option<TrackRecord>> {
        Ok(self.table.lock().await.rows.get(&id).cloned())
    }

    async fn delete(&self, id: TrackId) -> Result<Option<TrackRecord>> {
        Ok(self.table.lock().await.rows.remove(&id))
    }
}
