//! Task submission records and the caller-side future.

use crate::error::{SubmitError, TaskError};
use crate::local::MethodRegistry;
use poolwire::Priority;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// Stable task identifier, unique across the pool's lifetime.
pub type TaskId = u64;

/// Result type a task future resolves with.
pub type TaskResult = Result<Vec<u8>, TaskError>;

/// Per-task submission options.
#[derive(Debug, Clone, Default)]
pub struct TaskOptions {
    /// Dispatch priority; higher dispatches first under the priority
    /// queue strategy. Also mapped onto the wire priority class.
    pub priority: i16,
    /// Opaque routing key; tasks with the same key land on the same
    /// executor while it lives.
    pub affinity_key: Option<Vec<u8>>,
    /// Free-form task classification, given to selection policies as a hint.
    pub task_type: Option<String>,
    /// Deadline after which the task is cancelled and resolved `Timeout`.
    pub timeout: Option<Duration>,
    /// Caller's duration estimate, given to selection policies as a hint.
    pub estimated_duration: Option<Duration>,
    /// Retries on retryable executor failures before surfacing the error.
    pub max_retries: u32,
    /// Handles to zero-copy transfer regions, forwarded opaquely.
    pub transfer: Vec<u64>,
}

impl TaskOptions {
    /// Maps the signed task priority onto the wire priority class.
    pub fn wire_priority(&self) -> Priority {
        match self.priority {
            i16::MIN..=-1 => Priority::Low,
            0 => Priority::Normal,
            1..=99 => Priority::High,
            _ => Priority::Critical,
        }
    }
}

/// A method invocation to submit: name, parameter bytes, options.
#[derive(Debug, Clone, Default)]
pub struct TaskSpec {
    pub method: String,
    pub params: Vec<u8>,
    pub options: TaskOptions,
}

impl TaskSpec {
    pub fn new(method: impl Into<String>, params: Vec<u8>) -> Self {
        Self {
            method: method.into(),
            params,
            options: TaskOptions::default(),
        }
    }

    pub fn with_options(mut self, options: TaskOptions) -> Self {
        self.options = options;
        self
    }
}

/// How the dispatch loop resolves a task future.
///
/// `CallerRuns` is the back-pressure escape hatch: the pool hands the work
/// back, and [`TaskHandle::wait`] executes it in the submitting context.
#[derive(Debug)]
pub(crate) enum Resolution {
    Done(TaskResult),
    CallerRuns { method: String, params: Vec<u8> },
}

pub(crate) type Resolver = oneshot::Sender<Resolution>;

/// Commands the caller side can send the dispatch loop about one task.
#[derive(Debug)]
pub(crate) enum TaskSignal {
    Cancel(TaskId),
}

/// A pending task result.
///
/// Resolves exactly once: with the result bytes, a [`TaskError`], `Cancelled`
/// (after [`TaskHandle::cancel`]), or `Timeout`. Dropping the handle does not
/// cancel the task.
#[derive(Debug)]
pub struct TaskHandle {
    task_id: TaskId,
    receiver: oneshot::Receiver<Resolution>,
    signals: mpsc::UnboundedSender<TaskSignal>,
    inline_registry: Option<Arc<MethodRegistry>>,
}

impl TaskHandle {
    pub(crate) fn new(
        task_id: TaskId,
        receiver: oneshot::Receiver<Resolution>,
        signals: mpsc::UnboundedSender<TaskSignal>,
        inline_registry: Option<Arc<MethodRegistry>>,
    ) -> Self {
        Self {
            task_id,
            receiver,
            signals,
            inline_registry,
        }
    }

    /// The pool-unique id of this task.
    pub fn id(&self) -> TaskId {
        self.task_id
    }

    /// Requests cancellation. Idempotent; a no-op once the task resolved.
    pub fn cancel(&self) {
        let _ = self.signals.send(TaskSignal::Cancel(self.task_id));
    }

    /// A detached cancellation handle, usable after `wait` consumed the
    /// handle itself.
    pub fn canceller(&self) -> TaskCanceller {
        TaskCanceller {
            task_id: self.task_id,
            signals: self.signals.clone(),
        }
    }

    /// Waits for the task to resolve.
    pub async fn wait(self) -> TaskResult {
        match self.receiver.await {
            Ok(Resolution::Done(result)) => result,
            Ok(Resolution::CallerRuns { method, params }) => {
                run_inline(self.inline_registry, method, params).await
            }
            // The dispatch loop dropped the resolver without answering;
            // only possible when the pool is torn down.
            Err(_) => Err(TaskError::Terminated),
        }
    }

    /// Waits with an additional caller-side deadline on top of any
    /// per-task timeout option.
    pub async fn wait_timeout(self, limit: Duration) -> TaskResult {
        let signals = self.signals.clone();
        let task_id = self.task_id;
        match tokio::time::timeout(limit, self.wait()).await {
            Ok(result) => result,
            Err(_) => {
                let _ = signals.send(TaskSignal::Cancel(task_id));
                Err(TaskError::Timeout)
            }
        }
    }
}

/// Cancels one task without owning its [`TaskHandle`].
#[derive(Debug, Clone)]
pub struct TaskCanceller {
    task_id: TaskId,
    signals: mpsc::UnboundedSender<TaskSignal>,
}

impl TaskCanceller {
    pub fn cancel(&self) {
        let _ = self.signals.send(TaskSignal::Cancel(self.task_id));
    }
}

/// Runs a handed-back task in the submitting context.
async fn run_inline(
    registry: Option<Arc<MethodRegistry>>,
    method: String,
    params: Vec<u8>,
) -> TaskResult {
    let Some(registry) = registry else {
        return Err(TaskError::MethodNotFound(method));
    };
    let handler = registry
        .lookup(&method)
        .ok_or_else(|| TaskError::MethodNotFound(method.clone()))?;
    tokio::task::spawn_blocking(move || handler.invoke(&params))
        .await
        .map_err(|join| TaskError::ExecutionFailed {
            message: format!("inline task panicked: {join}"),
            stack: String::new(),
        })?
}

/// Validates a spec before it enters the pool.
pub(crate) fn validate_spec(spec: &TaskSpec, max_message_bytes: usize) -> Result<(), SubmitError> {
    if spec.method.is_empty() {
        return Err(SubmitError::Validation("empty method name".into()));
    }
    if spec.method.len() > u16::MAX as usize {
        return Err(SubmitError::Validation("method name too long".into()));
    }
    if spec.params.len() > max_message_bytes {
        return Err(SubmitError::Validation(format!(
            "params of {} bytes exceed the {} byte message limit",
            spec.params.len(),
            max_message_bytes
        )));
    }
    Ok(())
}
