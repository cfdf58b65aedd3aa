use crate::store::StoreError;
use crate::tasks::TaskOutput;
use edusense_core::ExtractError;
use edusense_media::SampleError;
use serde::Serialize;
use thiserror::Error;

/// Coarse failure class reported to callers for a failed task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    ModelUnavailable,
    StoreUnavailable,
    InputRejected,
    VideoUnreadable,
    ArchiveUnreadable,
    Internal,
}

/// Errors that end a whole pipeline run.
///
/// Per-item problems (a corrupt photo, a frame with no faces) never show up
/// here; they are recorded against the item and processing continues.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("face model failed: {0}")]
    Model(ExtractError),
    #[error("store: {0}")]
    Store(#[from] StoreError),
    #[error("input rejected: {0}")]
    InputRejected(String),
    #[error("video: {0}")]
    Video(#[from] SampleError),
    #[error("archive unreadable: {0}")]
    Archive(String),
    #[error("task cancelled")]
    Cancelled,
    #[error("internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    /// Category reported for a failed task. Cancellation is not a failure and
    /// is reported through the task status instead.
    pub fn category(&self) -> ErrorCategory {
        match self {
            PipelineError::Model(_) => ErrorCategory::ModelUnavailable,
            PipelineError::Store(e) if e.is_unavailable() => ErrorCategory::StoreUnavailable,
            PipelineError::Store(_) => ErrorCategory::InputRejected,
            PipelineError::InputRejected(_) => ErrorCategory::InputRejected,
            PipelineError::Video(SampleError::VideoNotFound(_) | SampleError::InvalidRate(_)) => {
                ErrorCategory::InputRejected
            }
            PipelineError::Video(SampleError::DecoderUnavailable { .. }) => ErrorCategory::Internal,
            PipelineError::Video(_) => ErrorCategory::VideoUnreadable,
            PipelineError::Archive(_) => ErrorCategory::ArchiveUnreadable,
            PipelineError::Cancelled | PipelineError::Internal(_) => ErrorCategory::Internal,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, PipelineError::Cancelled)
    }
}

/// A pipeline error together with whatever result had been built when it hit.
#[derive(Debug)]
pub struct PipelineFailure {
    pub error: PipelineError,
    pub partial: Option<TaskOutput>,
}

impl PipelineFailure {
    pub fn with_partial(error: PipelineError, partial: TaskOutput) -> Self {
        Self {
            error,
            partial: Some(partial),
        }
    }
}

impl From<PipelineError> for PipelineFailure {
    fn from(error: PipelineError) -> Self {
        Self { error, partial: None }
    }
}

impl From<StoreError> for PipelineFailure {
    fn from(error: StoreError) -> Self {
        PipelineError::from(error).into()
    }
}

impl From<SampleError> for PipelineFailure {
    fn from(error: SampleError) -> Self {
        PipelineError::from(error).into()
    }
}
