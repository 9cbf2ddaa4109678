//! # Cadenza Server
//!
//! Process wrapper around [`cadenza_core`]. One binary, two roles chosen at
//! startup:
//!
//! - **api**: a thin HTTP surface that admits track jobs, answers status
//!   polls and deletes tracks.
//! - **worker**: the pipeline worker runtime, draining on SIGINT/SIGTERM.

pub mod api;
pub mod errors;
pub mod infra;
