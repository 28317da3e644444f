//! Batch execution: bounded-concurrency aggregation of many tasks with
//! progress reporting, fail-fast, pause/resume, and cancellation.
//!
//! The aggregator is deliberately thin: it submits through the same gate
//! as single tasks and only coordinates outcomes. Wire-level chunking
//! happens below the gate, in the dispatch loop.

use crate::error::TaskError;
use crate::pool::SubmitGate;
use crate::task::{TaskResult, TaskSpec};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;

/// Options for [`crate::Pool::submit_batch`] and [`crate::Pool::map`].
#[derive(Clone)]
pub struct BatchOptions {
    /// Concurrent tasks in flight; defaults to the pool's worker count.
    pub concurrency: Option<usize>,
    /// Cancel everything pending at the first failure.
    pub fail_fast: bool,
    /// Per-task timeout, merged into each task's options.
    pub task_timeout: Option<Duration>,
    /// Deadline for the whole batch; expiry cancels the remainder.
    pub overall_timeout: Option<Duration>,
    /// Progress callback, throttled to at most one call per interval.
    pub progress: Option<Arc<dyn Fn(BatchProgress) + Send + Sync>>,
    pub progress_throttle: Duration,
    /// Transfer handles shared by every task in the batch.
    pub transfer: Vec<u64>,
    /// Items grouped per dispatch for `map`.
    pub chunk_size: usize,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            concurrency: None,
            fail_fast: false,
            task_timeout: None,
            overall_timeout: None,
            progress: None,
            progress_throttle: Duration::from_millis(100),
            transfer: Vec::new(),
            chunk_size: 1,
        }
    }
}

impl std::fmt::Debug for BatchOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchOptions")
            .field("concurrency", &self.concurrency)
            .field("fail_fast", &self.fail_fast)
            .field("task_timeout", &self.task_timeout)
            .field("overall_timeout", &self.overall_timeout)
            .field("progress", &self.progress.is_some())
            .field("progress_throttle", &self.progress_throttle)
            .field("chunk_size", &self.chunk_size)
            .finish()
    }
}

/// Snapshot passed to the progress callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchProgress {
    pub completed: usize,
    pub failed: usize,
    pub total: usize,
}

/// Final batch record: every task outcome in original submission order.
#[derive(Debug)]
pub struct BatchOutcome {
    pub results: Vec<TaskResult>,
    pub succeeded: usize,
    pub failed: usize,
    pub duration: Duration,
    pub cancelled: bool,
    /// First failure when `fail_fast` tripped.
    pub error: Option<TaskError>,
}

/// Shared pause/cancel state between the handle and the aggregator.
#[derive(Debug, Default)]
pub(crate) struct BatchControl {
    paused: AtomicBool,
    cancelled: AtomicBool,
    resume: Notify,
    cancel: Notify,
}

impl BatchControl {
    pub fn pause(&self) {
        self.paused.store(true, Ordering::Release);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::Release);
        self.resume.notify_waiters();
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.cancel.notify_waiters();
        // A paused batch must observe the cancellation too.
        self.resume.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// Blocks dispatch while paused; in-flight tasks are unaffected.
    async fn dispatch_allowed(&self) {
        loop {
            if self.is_cancelled() || !self.is_paused() {
                return;
            }
            self.resume.notified().await;
        }
    }

    async fn cancelled_signal(&self) {
        loop {
            if self.is_cancelled() {
                return;
            }
            self.cancel.notified().await;
        }
    }
}

/// Handle to a running batch.
#[derive(Debug)]
pub struct BatchHandle {
    join: JoinHandle<BatchOutcome>,
    control: Arc<BatchControl>,
}

impl BatchHandle {
    /// Stops further dispatch; running tasks complete normally.
    pub fn pause(&self) {
        self.control.pause();
    }

    /// Reopens dispatch after [`pause`](Self::pause).
    pub fn resume(&self) {
        self.control.resume();
    }

    /// Cancels every pending and in-flight task of the batch.
    pub fn cancel(&self) {
        self.control.cancel();
    }

    /// Waits for the batch record.
    pub async fn wait(self) -> BatchOutcome {
        match self.join.await {
            Ok(outcome) => outcome,
            // The aggregator itself died; report an empty cancelled batch.
            Err(join) => BatchOutcome {
                results: Vec::new(),
                succeeded: 0,
                failed: 0,
                duration: Duration::ZERO,
                cancelled: true,
                error: Some(TaskError::ExecutionFailed {
                    message: format!("batch aggregator failed: {join}"),
                    stack: String::new(),
                }),
            },
        }
    }
}

/// One dispatch unit: a single task, or a chunk of tasks that travel in
/// one wire message and land on one executor. `start` is the index of the
/// unit's first task in the original submission order.
pub(crate) struct BatchUnit {
    pub start: usize,
    pub specs: Vec<TaskSpec>,
}

/// Spawns the aggregator for a prepared unit list.
pub(crate) fn spawn_batch(
    gate: SubmitGate,
    units: Vec<BatchUnit>,
    options: BatchOptions,
    default_concurrency: usize,
) -> BatchHandle {
    let control = Arc::new(BatchControl::default());
    let join = tokio::spawn(run_batch(
        gate,
        units,
        options,
        default_concurrency,
        Arc::clone(&control),
    ));
    BatchHandle { join, control }
}

async fn run_batch(
    gate: SubmitGate,
    units: Vec<BatchUnit>,
    options: BatchOptions,
    default_concurrency: usize,
    control: Arc<BatchControl>,
) -> BatchOutcome {
    let started = Instant::now();
    let total: usize = units.iter().map(|unit| unit.specs.len()).sum();
    let concurrency = options
        .concurrency
        .unwrap_or(default_concurrency)
        .max(1);
    let deadline = options.overall_timeout.map(|limit| started + limit);

    let semaphore = Arc::new(Semaphore::new(concurrency));
    let mut workers: JoinSet<Vec<(usize, TaskResult)>> = JoinSet::new();

    for unit in units {
        let gate = gate.clone();
        let control = Arc::clone(&control);
        let semaphore = Arc::clone(&semaphore);
        let task_timeout = options.task_timeout;
        let transfer = options.transfer.clone();
        workers.spawn(run_unit(gate, unit, control, semaphore, task_timeout, transfer));
    }

    let mut results: Vec<TaskResult> = (0..total).map(|_| Err(TaskError::Cancelled)).collect();
    let mut completed = 0usize;
    let mut failed = 0usize;
    let mut first_error: Option<TaskError> = None;
    let mut last_progress: Option<Instant> = None;

    loop {
        let joined = if let Some(deadline) = deadline {
            match tokio::time::timeout_at(deadline, workers.join_next()).await {
                Ok(joined) => joined,
                Err(_) => {
                    control.cancel();
                    // Keep reaping; cancelled tasks resolve quickly.
                    workers.join_next().await
                }
            }
        } else {
            workers.join_next().await
        };

        let Some(joined) = joined else { break };
        let Ok(unit_results) = joined else { continue };

        for (index, result) in unit_results {
            completed += 1;
            if let Err(error) = &result {
                failed += 1;
                if first_error.is_none() && !matches!(error, TaskError::Cancelled) {
                    first_error = Some(error.clone());
                    if options.fail_fast {
                        control.cancel();
                    }
                }
            }
            results[index] = result;
        }

        if let Some(progress) = &options.progress {
            let due = last_progress
                .is_none_or(|at| at.elapsed() >= options.progress_throttle);
            if due {
                last_progress = Some(Instant::now());
                progress(BatchProgress {
                    completed,
                    failed,
                    total,
                });
            }
        }
    }

    // Final progress fire so observers always see the terminal counts.
    if let Some(progress) = &options.progress {
        progress(BatchProgress {
            completed,
            failed,
            total,
        });
    }

    let succeeded = results.iter().filter(|r| r.is_ok()).count();
    let failed = results.len() - succeeded;
    BatchOutcome {
        succeeded,
        failed,
        duration: started.elapsed(),
        cancelled: control.is_cancelled(),
        error: first_error,
        results,
    }
}

/// Runs one unit under the concurrency limit.
async fn run_unit(
    gate: SubmitGate,
    unit: BatchUnit,
    control: Arc<BatchControl>,
    semaphore: Arc<Semaphore>,
    task_timeout: Option<Duration>,
    transfer: Vec<u64>,
) -> Vec<(usize, TaskResult)> {
    let indices: Vec<usize> = (unit.start..unit.start + unit.specs.len()).collect();
    let cancelled_out =
        |indices: &[usize]| indices.iter().map(|&i| (i, Err(TaskError::Cancelled))).collect();

    let Ok(permit) = semaphore.acquire_owned().await else {
        return cancelled_out(&indices);
    };

    control.dispatch_allowed().await;
    if control.is_cancelled() {
        return cancelled_out(&indices);
    }

    // Merge batch-level options into each spec.
    let mut specs = unit.specs;
    for spec in &mut specs {
        if spec.options.timeout.is_none() {
            spec.options.timeout = task_timeout;
        }
        spec.options.transfer.extend_from_slice(&transfer);
    }

    let handles = match gate.submit_unit(specs).await {
        Ok(handles) => handles,
        Err(error) => {
            let failure = TaskError::from(error);
            return indices.iter().map(|&i| (i, Err(failure.clone()))).collect();
        }
    };

    let mut out = Vec::with_capacity(handles.len());
    for (&index, handle) in indices.iter().zip(handles) {
        let canceller = handle.canceller();
        let result = tokio::select! {
            result = handle.wait() => result,
            () = control.cancelled_signal() => {
                canceller.cancel();
                Err(TaskError::Cancelled)
            }
        };
        out.push((index, result));
    }

    drop(permit);
    out
}
