use std::time::Duration;

use protocol::FramingError;
use thiserror::Error;

/// Numeric result codes reported to the orchestrator in load acks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReturnCode {
    Success = 0,
    FailedToCompileJs = 1,
    NoHandlersDefined = 2,
    FailedInitBucketHandle = 3,
    OnUpdateCallFail = 4,
    OnDeleteCallFail = 5,
    ToLocalFailed = 6,
}

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("failed to compile handler: {0}")]
    Compile(String),
    #[error("handler defines neither OnUpdate nor OnDelete")]
    NoHandlersDefined,
    #[error("failed to initialise data-access handles: {0}")]
    BucketInit(String),
    #[error("OnUpdate failed: {0}")]
    OnUpdateInvocation(String),
    #[error("OnDelete failed: {0}")]
    OnDeleteInvocation(String),
    #[error("timer callback {callback} failed: {message}")]
    TimerInvocation { callback: String, message: String },
    #[error("value conversion failed: {0}")]
    ValueConversion(String),
    #[error(transparent)]
    Framing(#[from] FramingError),
    #[error("execution exceeded {0:?} and was terminated")]
    Timeout(Duration),
    #[error("timer context of {size} bytes exceeds limit of {limit}")]
    TimerContextTooLarge { size: usize, limit: usize },
    #[error("worker is shutting down")]
    ShuttingDown,
    #[error("worker thread failed: {0}")]
    Thread(String),
}

impl WorkerError {
    pub fn return_code(&self) -> ReturnCode {
        match self {
            WorkerError::Compile(_) => ReturnCode::FailedToCompileJs,
            WorkerError::NoHandlersDefined => ReturnCode::NoHandlersDefined,
            WorkerError::BucketInit(_) => ReturnCode::FailedInitBucketHandle,
            WorkerError::OnUpdateInvocation(_) => ReturnCode::OnUpdateCallFail,
            WorkerError::OnDeleteInvocation(_) => ReturnCode::OnDeleteCallFail,
            _ => ReturnCode::ToLocalFailed,
        }
    }

    /// Load errors stop the worker from starting; everything else is per event.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            WorkerError::Compile(_)
                | WorkerError::NoHandlersDefined
                | WorkerError::BucketInit(_)
                | WorkerError::Thread(_)
        )
    }
}
