/// Stable numeric error codes carried in `TaskError` payloads.
///
/// The numbering is part of the wire contract and never reshuffled:
/// worker-side failures are 1xxx, transport failures 2xxx, task-level
/// failures 3xxx.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ErrorCode(pub u16);

/// Which side of the system produced an error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Executor process/thread failures (1xxx).
    Worker,
    /// Transport and framing failures (2xxx).
    Communication,
    /// Failures of the task itself (3xxx).
    Task,
    /// Outside the reserved ranges.
    Unknown,
}

impl ErrorCode {
    pub const WORKER_CRASHED: Self = Self(1001);
    pub const WORKER_UNRESPONSIVE: Self = Self(1003);
    pub const COMMUNICATION_LOST: Self = Self(2001);
    pub const METHOD_NOT_FOUND: Self = Self(3001);
    pub const INVALID_PARAMS: Self = Self(3002);
    pub const EXECUTION_FAILED: Self = Self(3003);
    pub const CANCELLED: Self = Self(3004);
    pub const TIMEOUT: Self = Self(3005);

    /// The code's category by numbering range.
    pub fn category(self) -> ErrorCategory {
        match self.0 {
            1000..=1999 => ErrorCategory::Worker,
            2000..=2999 => ErrorCategory::Communication,
            3000..=3999 => ErrorCategory::Task,
            _ => ErrorCategory::Unknown,
        }
    }

    /// Whether the task may be resubmitted. Worker and transport failures
    /// are retryable on a *different* executor; timeouts may retry
    /// anywhere. Deterministic task failures are not worth repeating.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::WORKER_CRASHED
                | Self::WORKER_UNRESPONSIVE
                | Self::COMMUNICATION_LOST
                | Self::TIMEOUT
        )
    }

    /// Whether the failure poisons the whole pool rather than one task.
    /// None of the per-task codes do; framing-level corruption is fatal
    /// and surfaces as [`crate::WireError`] instead.
    pub fn is_fatal(self) -> bool {
        false
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match *self {
            Self::WORKER_CRASHED => "WorkerCrashed",
            Self::WORKER_UNRESPONSIVE => "WorkerUnresponsive",
            Self::COMMUNICATION_LOST => "CommunicationLost",
            Self::METHOD_NOT_FOUND => "MethodNotFound",
            Self::INVALID_PARAMS => "InvalidParams",
            Self::EXECUTION_FAILED => "ExecutionFailed",
            Self::CANCELLED => "Cancelled",
            Self::TIMEOUT => "Timeout",
            _ => return write!(f, "ErrorCode({})", self.0),
        };
        write!(f, "{name}({})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn categories_follow_ranges() {
        assert_eq!(ErrorCode::WORKER_CRASHED.category(), ErrorCategory::Worker);
        assert_eq!(
            ErrorCode::COMMUNICATION_LOST.category(),
            ErrorCategory::Communication
        );
        assert_eq!(ErrorCode::TIMEOUT.category(), ErrorCategory::Task);
        assert_eq!(ErrorCode(9999).category(), ErrorCategory::Unknown);
    }

    #[test]
    fn retry_matrix() {
        assert!(ErrorCode::TIMEOUT.is_retryable());
        assert!(ErrorCode::WORKER_CRASHED.is_retryable());
        assert!(!ErrorCode::METHOD_NOT_FOUND.is_retryable());
        assert!(!ErrorCode::INVALID_PARAMS.is_retryable());
        assert!(!ErrorCode::CANCELLED.is_retryable());
    }
}
