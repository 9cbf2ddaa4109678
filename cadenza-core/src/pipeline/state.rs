use std::fmt;

use serde::{Deserialize, Serialize};

/// Per-attempt state of a job inside the orchestrator.
///
/// The happy path is strictly linear. Any state can fall to `Failed`, which
/// then resolves to `RetryScheduled` or `TerminalCleanup -> Abandoned`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Received,
    Truncating,
    VoiceDetecting,
    Compressing,
    WaveformGenerating,
    Uploading,
    Persisting,
    CleaningTemp,
    Completed,
    Failed,
    RetryScheduled,
    TerminalCleanup,
    Abandoned,
}

impl PipelineState {
    /// Phases in execution order.
    pub const PHASES: [PipelineState; 8] = [
        PipelineState::Received,
        PipelineState::Truncating,
        PipelineState::VoiceDetecting,
        PipelineState::Compressing,
        PipelineState::WaveformGenerating,
        PipelineState::Uploading,
        PipelineState::Persisting,
        PipelineState::CleaningTemp,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineState::Received => "received",
            PipelineState::Truncating => "truncating",
            PipelineState::VoiceDetecting => "voice_detecting",
            PipelineState::Compressing => "compressing",
            PipelineState::WaveformGenerating => "waveform_generating",
            PipelineState::Uploading => "uploading",
            PipelineState::Persisting => "persisting",
            PipelineState::CleaningTemp => "cleaning_temp",
            PipelineState::Completed => "completed",
            PipelineState::Failed => "failed",
            PipelineState::RetryScheduled => "retry_scheduled",
            PipelineState::TerminalCleanup => "terminal_cleanup",
            PipelineState::Abandoned => "abandoned",
        }
    }

    /// Successor on the happy path.
    pub fn next(&self) -> Option<PipelineState> {
        match self {
            PipelineState::Received => Some(PipelineState::Truncating),
            PipelineState::Truncating => Some(PipelineState::VoiceDetecting),
            PipelineState::VoiceDetecting => Some(PipelineState::Compressing),
            PipelineState::Compressing => Some(PipelineState::WaveformGenerating),
            PipelineState::WaveformGenerating => Some(PipelineState::Uploading),
            PipelineState::Uploading => Some(PipelineState::Persisting),
            PipelineState::Persisting => Some(PipelineState::CleaningTemp),
            PipelineState::CleaningTemp => Some(PipelineState::Completed),
            PipelineState::Failed => None,
            PipelineState::TerminalCleanup => Some(PipelineState::Abandoned),
            PipelineState::Completed
            | PipelineState::RetryScheduled
            | PipelineState::Abandoned => None,
        }
    }

    /// Progress reported once this phase has finished.
    pub fn progress_on_exit(&self) -> Option<u8> {
        match self {
            PipelineState::Received => Some(10),
            PipelineState::Truncating => Some(25),
            PipelineState::VoiceDetecting => Some(45),
            PipelineState::Compressing => Some(60),
            PipelineState::WaveformGenerating => Some(70),
            PipelineState::Uploading => Some(85),
            PipelineState::Persisting => Some(95),
            PipelineState::CleaningTemp => Some(100),
            _ => None,
        }
    }

    /// State a failed attempt resolves to.
    pub fn after_failure(terminal: bool) -> PipelineState {
        if terminal {
            PipelineState::TerminalCleanup
        } else {
            PipelineState::RetryScheduled
        }
    }

    pub fn can_transition_to(&self, next: PipelineState) -> bool {
        if next == PipelineState::Failed {
            return !self.is_final();
        }
        match self {
            PipelineState::Failed => matches!(
                next,
                PipelineState::RetryScheduled | PipelineState::TerminalCleanup
            ),
            _ => self.next() == Some(next),
        }
    }

    pub fn is_final(&self) -> bool {
        matches!(
            self,
            PipelineState::Completed
                | PipelineState::RetryScheduled
                | PipelineState::Abandoned
        )
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
