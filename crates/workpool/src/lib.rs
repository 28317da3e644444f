//! A worker-pool scheduler over isolated executors.
//!
//! The pool offloads method invocations to a bounded set of executors
//! running in separate protection domains, multiplexes concurrent callers
//! onto them, and returns results as cancellable futures. The moving
//! parts:
//!
//! - A single-writer **dispatch loop** owns all task and executor
//!   bookkeeping. Callers reach it over a command channel; executor I/O
//!   pumps feed it through a lock-free MPMC completion queue.
//! - **Selection policies** (round-robin, least-busy, least-used,
//!   fair-share, weighted, interleaved-weighted, custom) pick the target
//!   executor, optionally steered by the consistent-hash
//!   **affinity router**.
//! - Queued work sits in arena-backed structures from `taskring`: the
//!   shared ready ring or discipline queue, and per-executor deques when
//!   **work stealing** is on, with a background rebalancer.
//! - An **adaptive scaler** grows and shrinks the executor set under
//!   load, and a **heartbeat monitor** fails over unresponsive executors.
//! - Frames between pool and executors use the `poolwire` binary
//!   protocol.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use workpool::{MethodRegistry, Pool, PoolConfig, TaskOptions};
//!
//! #[tokio::main]
//! async fn main() {
//!     let registry = Arc::new(MethodRegistry::new());
//!     registry.register("double", |params| {
//!         Ok(params.iter().map(|b| b * 2).collect())
//!     });
//!
//!     let pool = Pool::with_local(PoolConfig::default(), registry).await.unwrap();
//!     let result = pool.exec("double", vec![1, 2, 3]).await.unwrap();
//!     assert_eq!(result, vec![2, 4, 6]);
//!     pool.terminate(false, None).await.unwrap();
//! }
//! ```

mod affinity;
mod batch;
mod config;
mod dispatch;
mod error;
mod events;
mod executor;
mod heartbeat;
mod local;
mod policy;
mod pool;
mod scaler;
mod stats;
mod stealing;
mod task;

pub use affinity::{fnv1a64, AffinityRouter, RouteDecision, RouterSummary};
pub use batch::{BatchHandle, BatchOptions, BatchOutcome, BatchProgress};
pub use config::{
    AffinityConfig, BackpressurePolicy, HeartbeatConfig, PoolConfig, RetryConfig, ScalerConfig,
    StealConfig,
};
pub use error::{PoolError, SubmitError, TaskError, TransportError};
pub use events::{EventBus, PoolEvent};
pub use executor::{
    ExecutorFactory, ExecutorFactoryBoxed, ExecutorId, ExecutorRecord, ExecutorState,
    ExecutorTransport, ExecutorTransportBoxed,
};
pub use local::{LocalExecutor, LocalExecutorFactory, MethodError, MethodRegistry, RegisteredMethod};
pub use policy::{
    ExecutorStatus, FairShare, InterleavedWeightedRoundRobin, LeastBusy, LeastUsed, PolicyKind,
    RoundRobin, Selection, SelectionHint, SelectionPolicy, WeightedRoundRobin,
};
pub use pool::{MapHandle, Pool};
pub use stats::{
    ExecutorStats, PolicyStats, PoolStats, ScalingStats, StealStats, TaskCounters, WorkerCounts,
};
pub use stealing::VictimStrategy;
pub use task::{TaskCanceller, TaskHandle, TaskId, TaskOptions, TaskResult, TaskSpec};

// The queue disciplines and wire types are part of the public contract.
pub use poolwire;
pub use taskring::QueueKind;
