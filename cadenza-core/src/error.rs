use thiserror::Error;

/// Failure classes used to decide between retrying and giving up on a job.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorClass {
    /// Bad or corrupt input. Retrying cannot help.
    Content,
    /// Timeouts, crashes, network and database trouble. Eligible for retry.
    Infrastructure,
    /// A bug: the pipeline reached a state its ordering should make impossible.
    Invariant,
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[cfg(feature = "postgres")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Invalid media: {0}")]
    InvalidMedia(String),

    #[error("{tool} rejected its input (exit code {code}): {stderr}")]
    ToolRejected {
        tool: String,
        code: i32,
        stderr: String,
    },

    #[error("{tool} timed out after {timeout_ms}ms")]
    ToolTimedOut { tool: String, timeout_ms: u64 },

    #[error("{tool} crashed: {detail}")]
    ToolCrashed { tool: String, detail: String },

    #[error("{tool} produced unusable output: {detail}")]
    ToolOutput { tool: String, detail: String },

    #[error("Artifact store error: {0}")]
    Storage(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// The queue handed the job to another worker while this attempt ran.
    #[error("Lease lost: {0}")]
    LeaseLost(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Invariant violated: {0}")]
    Invariant(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    pub fn class(&self) -> ErrorClass {
        match self {
            PipelineError::InvalidMedia(_)
            | PipelineError::ToolRejected { .. } => ErrorClass::Content,
            PipelineError::Invariant(_) | PipelineError::Config(_) => {
                ErrorClass::Invariant
            }
            PipelineError::Io(_)
            | PipelineError::Serialization(_)
            | PipelineError::ToolTimedOut { .. }
            | PipelineError::ToolCrashed { .. }
            | PipelineError::ToolOutput { .. }
            | PipelineError::Storage(_)
            | PipelineError::NotFound(_)
            | PipelineError::LeaseLost(_)
            | PipelineError::Internal(_) => ErrorClass::Infrastructure,
            #[cfg(feature = "postgres")]
            PipelineError::Database(_) => ErrorClass::Infrastructure,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Infrastructure
    }

    /// One-line message safe to surface to non-admin callers polling a job.
    pub fn summary(&self) -> String {
        match self {
            PipelineError::InvalidMedia(_)
            | PipelineError::ToolRejected { .. } => {
                "the uploaded audio could not be processed".to_string()
            }
            PipelineError::ToolTimedOut { tool, .. } => {
                format!("{tool} took too long")
            }
            PipelineError::Invariant(_) | PipelineError::Config(_) => {
                "internal processing error".to_string()
            }
            _ => "temporary processing failure".to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_rejection_is_a_content_error() {
        let err = PipelineError::ToolRejected {
            tool: "ffmpeg".into(),
            code: 1,
            stderr: "Invalid data found when processing input".into(),
        };
        assert_eq!(err.class(), ErrorClass::Content);
        assert!(!err.is_retryable());
    }

    #[test]
    fn timeouts_and_crashes_are_retryable() {
        let timeout = PipelineError::ToolTimedOut {
            tool: "voice-detector".into(),
            timeout_ms: 120_000,
        };
        let crash = PipelineError::ToolCrashed {
            tool: "ffmpeg".into(),
            detail: "terminated by signal 9".into(),
        };
        assert!(timeout.is_retryable());
        assert!(crash.is_retryable());
    }

    #[test]
    fn invariant_violations_are_not_retried() {
        let err = PipelineError::Invariant("missing waveform url".into());
        assert_eq!(err.class(), ErrorClass::Invariant);
        assert!(!err.is_retryable());
        assert_eq!(err.summary(), "internal processing error");
    }
}
