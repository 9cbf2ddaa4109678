use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Fixed namespace for deriving track folder ids from job ids.
const TRACK_NAMESPACE: Uuid = Uuid::from_bytes([
    0x3c, 0x5e, 0x1a, 0x90, 0x6f, 0x42, 0x4d, 0x1b, 0x9a, 0x27, 0x0e, 0x58,
    0xc4, 0x71, 0xb2, 0x3d,
]);

/// Identifier assigned to a job by the queue at admission time.
#[derive(
    Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Owner of uploaded tracks. Artist accounts live in the relational store
/// outside this crate, so only the numeric key travels with a job.
#[derive(
    Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ArtistId(pub i64);

impl fmt::Display for ArtistId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Folder key grouping every artifact of one track in the artifact store.
///
/// Derived from the [`JobId`] so a redelivered job writes to the same prefix
/// as the attempt it replaces.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrackUniqueId(pub Uuid);

impl TrackUniqueId {
    pub fn for_job(job_id: JobId) -> Self {
        Self(Uuid::new_v5(&TRACK_NAMESPACE, job_id.0.as_bytes()))
    }
}

impl fmt::Display for TrackUniqueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Primary key of a persisted track row.
#[derive(
    Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct TrackId(pub i64);

impl fmt::Display for TrackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
