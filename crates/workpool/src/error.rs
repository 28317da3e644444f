//! Error taxonomy for the pool.
//!
//! Four layers, matching where an error surfaces:
//!
//! - [`SubmitError`]: rejected at submission time, synchronously.
//! - [`TaskError`]: resolved through the task's future.
//! - [`TransportError`]: executor transport failures, translated into
//!   [`TaskError`] variants for the affected tasks.
//! - [`PoolError`]: umbrella for callers of the convenience APIs.

use poolwire::{ErrorBody, ErrorCode, WireError};
use thiserror::Error;

/// Errors surfaced synchronously by `submit` and friends.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubmitError {
    /// Back-pressure rejected the submission.
    #[error("queue is full")]
    QueueFull,

    /// The submission itself is malformed (oversized message, empty method).
    #[error("invalid submission: {0}")]
    Validation(String),

    /// No executor is alive to take the task.
    #[error("no workers available")]
    NoWorkersAvailable,

    /// The pool is shutting down or already terminated.
    #[error("pool is terminated")]
    Terminated,

    /// A fatal error poisoned the pool; it must be recreated.
    #[error("pool is poisoned: {0}")]
    Poisoned(String),
}

/// Errors resolved through a task's future.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    /// The executor does not know the requested method.
    #[error("method not found: {0}")]
    MethodNotFound(String),

    /// The executor rejected the parameters.
    #[error("invalid params: {0}")]
    InvalidParams(String),

    /// The user function raised.
    #[error("execution failed: {message}")]
    ExecutionFailed { message: String, stack: String },

    /// The task was cancelled before producing a result.
    #[error("task cancelled")]
    Cancelled,

    /// The task's deadline elapsed.
    #[error("task timed out")]
    Timeout,

    /// The executor died while the task was in flight.
    #[error("worker {executor} crashed: {reason}")]
    WorkerCrashed { executor: u32, reason: String },

    /// The executor stopped answering heartbeats.
    #[error("worker {executor} unresponsive")]
    WorkerUnresponsive { executor: u32 },

    /// The transport to the executor failed mid-flight.
    #[error("communication with worker {executor} lost")]
    CommunicationLost { executor: u32 },

    /// The pool terminated while the task was outstanding.
    #[error("pool terminated")]
    Terminated,
}

impl TaskError {
    /// The stable wire code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::MethodNotFound(_) => ErrorCode::METHOD_NOT_FOUND,
            Self::InvalidParams(_) => ErrorCode::INVALID_PARAMS,
            Self::ExecutionFailed { .. } => ErrorCode::EXECUTION_FAILED,
            Self::Cancelled | Self::Terminated => ErrorCode::CANCELLED,
            Self::Timeout => ErrorCode::TIMEOUT,
            Self::WorkerCrashed { .. } => ErrorCode::WORKER_CRASHED,
            Self::WorkerUnresponsive { .. } => ErrorCode::WORKER_UNRESPONSIVE,
            Self::CommunicationLost { .. } => ErrorCode::COMMUNICATION_LOST,
        }
    }

    /// Whether the task may be resubmitted (on a different executor for
    /// worker failures).
    pub fn is_retryable(&self) -> bool {
        self.code().is_retryable() && !matches!(self, Self::Terminated)
    }

    /// Builds the error from a wire-level error body.
    pub fn from_wire(body: &ErrorBody) -> Self {
        match body.code {
            ErrorCode::METHOD_NOT_FOUND => Self::MethodNotFound(body.message.clone()),
            ErrorCode::INVALID_PARAMS => Self::InvalidParams(body.message.clone()),
            ErrorCode::CANCELLED => Self::Cancelled,
            ErrorCode::TIMEOUT => Self::Timeout,
            _ => Self::ExecutionFailed {
                message: body.message.clone(),
                stack: body.stack.clone(),
            },
        }
    }
}

impl From<SubmitError> for TaskError {
    fn from(error: SubmitError) -> Self {
        match error {
            SubmitError::Terminated | SubmitError::Poisoned(_) => Self::Terminated,
            other => Self::ExecutionFailed {
                message: format!("submission rejected: {other}"),
                stack: String::new(),
            },
        }
    }
}

/// Failures of an executor transport.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The peer closed the connection.
    #[error("transport closed")]
    Closed,

    /// I/O-level failure.
    #[error("transport i/o error: {0}")]
    Io(String),

    /// The executor could not be spawned.
    #[error("spawn failed: {0}")]
    Spawn(String),
}

/// Umbrella error for pool-level operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    #[error(transparent)]
    Submit(#[from] SubmitError),

    #[error(transparent)]
    Task(#[from] TaskError),

    #[error("wire protocol error: {0}")]
    Wire(#[from] WireError),

    #[error("executor spawn failed: {0}")]
    Spawn(String),

    #[error("pool is poisoned: {0}")]
    Poisoned(String),
}
