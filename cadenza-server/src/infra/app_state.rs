use std::{fmt, sync::Arc};

use cadenza_core::PipelineConfig;
use cadenza_core::queue::QueueService;
use cadenza_core::tracks::TrackCatalog;

/// Shared handles for the HTTP role.
#[derive(Clone)]
pub struct AppState {
    pub queue: Arc<dyn QueueService>,
    pub catalog: TrackCatalog,
    /// Queue defaults applied to submissions without their own options.
    pub pipeline: Arc<PipelineConfig>,
}

impl fmt::Debug for AppState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppState").finish_non_exhaustive()
    }
}

impl AppState {
    pub fn new(
        queue: Arc<dyn QueueService>,
        catalog: TrackCatalog,
        pipeline: Arc<PipelineConfig>,
    ) -> Self {
        Self {
            queue,
            catalog,
            pipeline,
        }
    }
}
