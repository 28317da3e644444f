//! Pool statistics snapshots.

use serde::Serialize;

/// Worker counts by lifecycle state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkerCounts {
    pub cold: u32,
    pub warming: u32,
    pub ready: u32,
    pub busy: u32,
    pub cleaning: u32,
    pub terminating: u32,
    pub terminated: u32,
    pub unresponsive: u32,
}

impl WorkerCounts {
    /// Workers that can accept or are running tasks.
    pub fn live(&self) -> u32 {
        self.ready + self.busy + self.cleaning
    }
}

/// Cumulative task counters.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct TaskCounters {
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub timed_out: u64,
    pub retried: u64,
}

/// Selection-policy statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PolicyStats {
    pub name: String,
    pub selections: u64,
    /// `(executor_id, selections)` pairs for the live executor set.
    pub per_executor: Vec<(u32, u64)>,
}

/// Work-stealing statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StealStats {
    pub attempts: u64,
    pub successes: u64,
    pub tasks_transferred: u64,
    /// `(thief_id, tasks_received)` pairs.
    pub by_thief: Vec<(u32, u64)>,
    /// `(victim_id, tasks_taken)` pairs.
    pub by_victim: Vec<(u32, u64)>,
}

/// Scaling event counters.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ScalingStats {
    pub scale_ups: u64,
    pub scale_downs: u64,
}

/// Per-executor status line in a snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutorStats {
    pub id: u32,
    pub state: String,
    pub active_tasks: u32,
    pub total_completed: u64,
    pub total_busy_ms: u64,
    pub weight: u32,
    pub affinity_load: f64,
    pub missed_heartbeats: u32,
}

/// A point-in-time view of the whole pool.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PoolStats {
    pub workers: WorkerCounts,
    pub queued_tasks: u64,
    pub active_tasks: u64,
    pub tasks: TaskCounters,
    pub policy: PolicyStats,
    pub steal: StealStats,
    pub scaling: ScalingStats,
    pub executors: Vec<ExecutorStats>,
}

impl Default for ExecutorStats {
    fn default() -> Self {
        Self {
            id: 0,
            state: String::new(),
            active_tasks: 0,
            total_completed: 0,
            total_busy_ms: 0,
            weight: 1,
            affinity_load: 0.0,
            missed_heartbeats: 0,
        }
    }
}
