//! Per-job phase sequence and the worker runtime that drives it.
//!
//! [`PipelineOrchestrator`] runs Truncate+Fade, Voice Detection, Compress,
//! Waveform, Upload, Persist and Local Cleanup in that order for one leased
//! job. [`WorkerRuntime`] owns the worker slots: it leases jobs, keeps their
//! leases alive while the orchestrator works, and reports the outcome back to
//! the queue.

pub mod dispatcher;
pub mod inputs;
pub mod orchestrator;
pub mod runtime;
pub mod scratch;
pub mod state;

pub use dispatcher::{DispatchStatus, JobDispatcher, PipelineDispatcher};
pub use inputs::resolve_staged_input;
pub use orchestrator::{
    NoopProgress, PipelineFailure, PipelineOrchestrator, ProgressReporter,
};
pub use runtime::WorkerRuntime;
pub use scratch::JobScratch;
pub use state::PipelineState;
