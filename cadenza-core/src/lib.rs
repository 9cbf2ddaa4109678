//! # Cadenza Core
//!
//! Processing engine for the Cadenza music platform. A submitted recording is
//! leased from a durable queue, trimmed and faded, scanned for voice activity,
//! re-encoded, turned into a spectral waveform, uploaded, and finally
//! recorded in the relational store.
//!
//! ## Modules
//!
//! - [`queue`]: job admission, leases, retry/backoff and stalled-lease recovery
//! - [`pipeline`]: the per-job phase sequence plus the worker runtime that drives it
//! - [`waveform`]: the pure PCM → spectral frame transform
//! - [`process`]: timeout-bounded adapters around the transcoder and voice detector
//! - [`storage`]: the artifact store contract and its backends
//! - [`tracks`]: persisted track rows and track deletion
//! - [`config`]: [`config::PipelineConfig`], the explicit context injected everywhere
//!
//! ## Feature Flags
//!
//! - `postgres` (default): Postgres-backed queue and track repository via SQLx
//! - `postgres-tests`: enables the `#[sqlx::test]` suites (needs `DATABASE_URL`)

pub mod config;
pub mod error;
pub mod pipeline;
pub mod process;
pub mod queue;
pub mod storage;
pub mod tracks;
pub mod types;
pub mod waveform;

pub use config::PipelineConfig;
pub use error::{ErrorClass, PipelineError, Result};

/// Embedded schema migrations for the queue and track tables.
#[cfg(feature = "postgres")]
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");
