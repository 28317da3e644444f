//! Pool configuration.
//!
//! Constructors validate at construction time: a nonsensical combination
//! is a programming error and panics immediately instead of misbehaving
//! later. Named presets cover the common pool shapes; `with_*` setters
//! adjust individual knobs.

use crate::policy::PolicyKind;
use crate::stealing::VictimStrategy;
use std::time::Duration;
use taskring::QueueKind;

/// What to do when a submission cannot be queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackpressurePolicy {
    /// Fail the submission with `QueueFull`.
    Reject,
    /// Evict the longest-queued task (resolving it `QueueFull`) and admit
    /// the new one.
    DropOldest,
    /// Reject the incoming task, keeping the queue intact.
    DropNewest,
    /// Park the submission up to the bounded wait, then reject.
    Block { timeout: Duration },
    /// Hand the task back to the submitting context for inline execution.
    CallerRuns,
}

impl Default for BackpressurePolicy {
    fn default() -> Self {
        Self::Reject
    }
}

/// Work-stealing knobs.
#[derive(Debug, Clone, Copy)]
pub struct StealConfig {
    pub enabled: bool,
    /// Per-executor deque capacity.
    pub deque_capacity: usize,
    /// Upper bound on tasks moved per steal transaction.
    pub steal_cap: usize,
    /// Minimum gap between steal attempts by one thief.
    pub cooldown: Duration,
    /// How often the rebalancer examines deque sizes.
    pub rebalance_interval: Duration,
    /// Max/min deque-size ratio that triggers a rebalance.
    pub imbalance_ratio: f64,
    pub victim_strategy: VictimStrategy,
}

impl StealConfig {
    /// Creates an enabled stealing configuration.
    ///
    /// # Panics
    ///
    /// Panics if `deque_capacity` or `steal_cap` is zero.
    pub const fn new(deque_capacity: usize, steal_cap: usize) -> Self {
        assert!(deque_capacity > 0, "deque_capacity must be non-zero");
        assert!(steal_cap > 0, "steal_cap must be non-zero");
        Self {
            enabled: true,
            deque_capacity,
            steal_cap,
            cooldown: Duration::from_millis(10),
            rebalance_interval: Duration::from_secs(1),
            imbalance_ratio: 3.0,
            victim_strategy: VictimStrategy::BusiestFirst,
        }
    }
}

impl Default for StealConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            ..Self::new(256, 16)
        }
    }
}

/// Affinity-routing knobs.
#[derive(Debug, Clone, Copy)]
pub struct AffinityConfig {
    pub enabled: bool,
    /// Ring replicas per executor.
    pub virtual_nodes: u32,
    /// Sticky-map entry lifetime.
    pub sticky_ttl: Duration,
    /// Affinity load at which a candidate counts as overloaded.
    pub load_ceiling: f64,
    /// Route confidence below which the coordinator falls back to the
    /// selection policy.
    pub confidence_floor: f64,
}

impl AffinityConfig {
    /// Creates an enabled affinity configuration.
    ///
    /// # Panics
    ///
    /// Panics if `virtual_nodes` is zero.
    pub const fn new(virtual_nodes: u32, sticky_ttl: Duration) -> Self {
        assert!(virtual_nodes > 0, "virtual_nodes must be non-zero");
        Self {
            enabled: true,
            virtual_nodes,
            sticky_ttl,
            load_ceiling: 16.0,
            confidence_floor: 0.5,
        }
    }
}

impl Default for AffinityConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            ..Self::new(150, Duration::from_secs(60))
        }
    }
}

/// Adaptive-scaler knobs.
#[derive(Debug, Clone, Copy)]
pub struct ScalerConfig {
    pub enabled: bool,
    /// Evaluation interval.
    pub interval: Duration,
    /// `(queued + active) / workers` at which the pool grows.
    pub scale_up_threshold: f64,
    pub scale_up_step: u32,
    /// Idle time before a worker is a shrink candidate.
    pub scale_down_idle_timeout: Duration,
    pub scale_down_step: u32,
    /// Minimum gap between scaling actions in either direction.
    pub cooldown: Duration,
}

impl ScalerConfig {
    /// Creates an enabled scaler configuration.
    ///
    /// # Panics
    ///
    /// Panics if `scale_up_threshold` is not positive.
    pub const fn new(scale_up_threshold: f64, cooldown: Duration) -> Self {
        assert!(scale_up_threshold > 0.0, "scale_up_threshold must be positive");
        Self {
            enabled: true,
            interval: Duration::from_secs(1),
            scale_up_threshold,
            scale_up_step: 1,
            scale_down_idle_timeout: Duration::from_secs(30),
            scale_down_step: 1,
            cooldown,
        }
    }
}

impl Default for ScalerConfig {
    fn default() -> Self {
        Self::new(2.0, Duration::from_secs(5))
    }
}

/// Heartbeat-monitor knobs.
#[derive(Debug, Clone, Copy)]
pub struct HeartbeatConfig {
    pub enabled: bool,
    /// Probe interval.
    pub interval: Duration,
    /// Response deadline per probe.
    pub timeout: Duration,
    /// Consecutive misses before an executor is declared unresponsive.
    pub max_missed: u32,
}

impl HeartbeatConfig {
    /// Creates an enabled heartbeat configuration.
    ///
    /// # Panics
    ///
    /// Panics if `max_missed` is zero.
    pub const fn new(interval: Duration, timeout: Duration, max_missed: u32) -> Self {
        assert!(max_missed > 0, "max_missed must be non-zero");
        Self {
            enabled: true,
            interval,
            timeout,
            max_missed,
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self::new(Duration::from_secs(5), Duration::from_secs(3), 3)
    }
}

/// Backoff schedule for retrying tasks after retryable executor failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Delay before the given retry attempt (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let millis = self.initial_delay.as_millis() as f64
            * self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);
        Duration::from_millis(millis as u64).min(self.max_delay)
    }
}

/// Top-level pool configuration.
#[derive(Debug)]
pub struct PoolConfig {
    pub min_workers: usize,
    pub max_workers: usize,
    /// Tasks one executor runs concurrently.
    pub max_concurrency_per_worker: u32,
    /// Shared-queue capacity (also the slot-arena size).
    pub queue_capacity: usize,
    pub queue_kind: QueueKind,
    pub backpressure: BackpressurePolicy,
    /// Ceiling on a single task's parameter bytes.
    pub max_message_bytes: usize,
    pub policy: PolicyKind,
    pub stealing: StealConfig,
    pub affinity: AffinityConfig,
    pub scaler: ScalerConfig,
    pub heartbeat: HeartbeatConfig,
    pub retry: RetryConfig,
    /// Per-executor drain deadline during graceful terminate.
    pub cleanup_timeout: Duration,
    /// Broadcast buffer for the event stream.
    pub event_capacity: usize,
    /// Selection weights assigned to executors by id (cycled when more
    /// executors exist than weights). Empty means weight 1 everywhere.
    pub worker_weights: Vec<u32>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_workers: 1,
            max_workers: 4,
            max_concurrency_per_worker: 1,
            queue_capacity: 1024,
            queue_kind: QueueKind::Fifo,
            backpressure: BackpressurePolicy::default(),
            max_message_bytes: poolwire::MAX_PAYLOAD,
            policy: PolicyKind::RoundRobin,
            stealing: StealConfig::default(),
            affinity: AffinityConfig::default(),
            scaler: ScalerConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            retry: RetryConfig::default(),
            cleanup_timeout: Duration::from_secs(5),
            event_capacity: 256,
            worker_weights: Vec::new(),
        }
    }
}

impl PoolConfig {
    /// Creates a configuration with the given worker bounds.
    ///
    /// # Panics
    ///
    /// Panics if `max_workers` is zero or below `min_workers`.
    pub fn new(min_workers: usize, max_workers: usize) -> Self {
        assert!(max_workers > 0, "max_workers must be non-zero");
        assert!(
            min_workers <= max_workers,
            "min_workers exceeds max_workers"
        );
        Self {
            min_workers,
            max_workers,
            ..Default::default()
        }
    }

    /// Creates a fixed-size pool: `workers` executors for the pool's
    /// lifetime, no adaptive scaling.
    ///
    /// # Panics
    ///
    /// Panics if `workers` is zero.
    pub fn fixed(workers: usize) -> Self {
        assert!(workers > 0, "a fixed pool needs at least one worker");
        let mut config = Self::new(workers, workers);
        config.scaler.enabled = false;
        config
    }

    /// Creates an elastic pool that scales between the given bounds.
    pub fn elastic(min_workers: usize, max_workers: usize) -> Self {
        Self::new(min_workers, max_workers)
    }

    /// Sets the shared-queue discipline and capacity.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn with_queue(mut self, kind: QueueKind, capacity: usize) -> Self {
        assert!(capacity > 0, "queue_capacity must be non-zero");
        self.queue_kind = kind;
        self.queue_capacity = capacity;
        self
    }

    /// Sets the selection policy.
    pub fn with_policy(mut self, policy: PolicyKind) -> Self {
        self.policy = policy;
        self
    }

    /// Sets the back-pressure policy.
    pub fn with_backpressure(mut self, backpressure: BackpressurePolicy) -> Self {
        self.backpressure = backpressure;
        self
    }

    /// The selection weight for a given executor id.
    pub fn weight_for(&self, executor: u32) -> u32 {
        if self.worker_weights.is_empty() {
            return 1;
        }
        self.worker_weights[executor as usize % self.worker_weights.len()].max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_pool_pins_bounds_and_disables_scaling() {
        let config = PoolConfig::fixed(3);
        assert_eq!(config.min_workers, 3);
        assert_eq!(config.max_workers, 3);
        assert!(!config.scaler.enabled);
    }

    #[test]
    fn elastic_pool_keeps_scaling_on() {
        let config = PoolConfig::elastic(2, 8);
        assert_eq!(config.min_workers, 2);
        assert_eq!(config.max_workers, 8);
        assert!(config.scaler.enabled);
    }

    #[test]
    #[should_panic(expected = "min_workers exceeds max_workers")]
    fn inverted_worker_bounds_panic_at_construction() {
        let _ = PoolConfig::new(8, 2);
    }

    #[test]
    #[should_panic(expected = "at least one worker")]
    fn zero_worker_fixed_pool_panics() {
        let _ = PoolConfig::fixed(0);
    }

    #[test]
    fn setters_chain() {
        let config = PoolConfig::fixed(2)
            .with_queue(QueueKind::Priority, 64)
            .with_policy(PolicyKind::LeastBusy)
            .with_backpressure(BackpressurePolicy::DropOldest);
        assert_eq!(config.queue_kind, QueueKind::Priority);
        assert_eq!(config.queue_capacity, 64);
        assert_eq!(config.backpressure, BackpressurePolicy::DropOldest);
    }

    #[test]
    #[should_panic(expected = "max_missed")]
    fn heartbeat_rejects_zero_miss_limit() {
        let _ = HeartbeatConfig::new(Duration::from_secs(5), Duration::from_secs(3), 0);
    }

    #[test]
    fn sub_config_constructors_enable() {
        assert!(StealConfig::new(128, 8).enabled);
        assert!(AffinityConfig::new(150, Duration::from_secs(60)).enabled);
        assert!(ScalerConfig::new(2.0, Duration::from_secs(5)).enabled);
        // Defaults keep the optional subsystems off.
        assert!(!StealConfig::default().enabled);
        assert!(!AffinityConfig::default().enabled);
    }

    #[test]
    fn retry_delays_grow_and_cap() {
        let retry = RetryConfig::default();
        assert_eq!(retry.delay_for_attempt(0), Duration::ZERO);
        assert_eq!(retry.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(retry.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(retry.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(retry.delay_for_attempt(20), Duration::from_secs(10));
    }

    #[test]
    fn weights_cycle_by_executor_id() {
        let mut config = PoolConfig::fixed(4);
        config.worker_weights = vec![4, 2];
        assert_eq!(config.weight_for(0), 4);
        assert_eq!(config.weight_for(1), 2);
        assert_eq!(config.weight_for(2), 4);
        let plain = PoolConfig::fixed(1);
        assert_eq!(plain.weight_for(7), 1);
    }
}
