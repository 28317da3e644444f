//! The pool: public API handle over the dispatch loop.
//!
//! `Pool` is a plain value owned by the host with an explicit
//! init/terminate lifecycle. Callers talk to the single-writer dispatch
//! loop through an unbounded command channel; results come back through
//! per-task oneshot resolvers.

use crate::batch::{spawn_batch, BatchHandle, BatchOptions, BatchUnit};
use crate::config::PoolConfig;
use crate::dispatch::Dispatcher;
use crate::error::{PoolError, SubmitError, TaskError, TransportError};
use crate::events::{EventBus, PoolEvent};
use crate::executor::{ExecutorFactoryBoxed, ExecutorId, ExecutorTransportBoxed};
use crate::heartbeat::spawn_heartbeat;
use crate::local::{LocalExecutorFactory, MethodRegistry};
use crate::scaler::{spawn_scaler, LoadSnapshot};
use crate::stats::PoolStats;
use crate::task::{
    validate_spec, Resolution, Resolver, TaskHandle, TaskId, TaskOptions, TaskSignal, TaskSpec,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use taskring::SeqLock;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

/// One admitted submission travelling into the dispatch loop.
pub(crate) struct SubmittedTask {
    pub task_id: TaskId,
    pub method: String,
    pub params: Vec<u8>,
    pub options: TaskOptions,
    pub resolver: Resolver,
}

impl std::fmt::Debug for SubmittedTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubmittedTask")
            .field("task_id", &self.task_id)
            .field("method", &self.method)
            .field("params_len", &self.params.len())
            .finish()
    }
}

/// Commands consumed by the dispatch loop.
pub(crate) enum PoolCommand {
    Submit {
        task: SubmittedTask,
        ack: oneshot::Sender<Result<(), SubmitError>>,
    },
    /// A chunk of tasks that should travel in one wire message to one
    /// executor.
    SubmitChunk {
        tasks: Vec<SubmittedTask>,
        ack: oneshot::Sender<Result<(), SubmitError>>,
    },
    Stats {
        reply: oneshot::Sender<PoolStats>,
    },
    HeartbeatTick,
    RebalanceTick,
    ScaleUp {
        count: u32,
        reason: String,
    },
    ScaleDown {
        count: u32,
        reason: String,
    },
    ExecutorAttached {
        id: ExecutorId,
        transport: Box<dyn ExecutorTransportBoxed>,
    },
    ExecutorSpawnFailed {
        id: ExecutorId,
        error: TransportError,
    },
    Terminate {
        force: bool,
        timeout: Option<Duration>,
        reply: oneshot::Sender<Result<(), PoolError>>,
    },
}

/// Cloneable submission endpoint shared by `Pool` and batch aggregators.
#[derive(Clone)]
pub(crate) struct SubmitGate {
    commands: mpsc::UnboundedSender<PoolCommand>,
    signals: mpsc::UnboundedSender<TaskSignal>,
    next_task_id: Arc<AtomicU64>,
    inline_registry: Option<Arc<MethodRegistry>>,
    max_message_bytes: usize,
}

impl SubmitGate {
    fn next_id(&self) -> TaskId {
        self.next_task_id.fetch_add(1, Ordering::Relaxed)
    }

    fn build(&self, spec: TaskSpec) -> (SubmittedTask, TaskHandle) {
        let task_id = self.next_id();
        let (resolver, receiver) = oneshot::channel::<Resolution>();
        let handle = TaskHandle::new(
            task_id,
            receiver,
            self.signals.clone(),
            self.inline_registry.clone(),
        );
        let task = SubmittedTask {
            task_id,
            method: spec.method,
            params: spec.params,
            options: spec.options,
            resolver,
        };
        (task, handle)
    }

    /// Submits one task; the error cases of §"submission" surface here,
    /// before the handle is returned.
    pub async fn submit(&self, spec: TaskSpec) -> Result<TaskHandle, SubmitError> {
        validate_spec(&spec, self.max_message_bytes)?;
        let (task, handle) = self.build(spec);
        let (ack, admitted) = oneshot::channel();
        self.commands
            .send(PoolCommand::Submit { task, ack })
            .map_err(|_| SubmitError::Terminated)?;
        match admitted.await {
            Ok(Ok(())) => Ok(handle),
            Ok(Err(error)) => Err(error),
            Err(_) => Err(SubmitError::Terminated),
        }
    }

    /// Submits a unit: one task, or a chunk dispatched as a single wire
    /// message to a single executor.
    pub async fn submit_unit(
        &self,
        mut specs: Vec<TaskSpec>,
    ) -> Result<Vec<TaskHandle>, SubmitError> {
        if specs.len() == 1 {
            let spec = specs.remove(0);
            return Ok(vec![self.submit(spec).await?]);
        }

        for spec in &specs {
            validate_spec(spec, self.max_message_bytes)?;
        }
        let mut handles = Vec::with_capacity(specs.len());
        let mut tasks = Vec::with_capacity(specs.len());
        for spec in specs {
            let (task, handle) = self.build(spec);
            tasks.push(task);
            handles.push(handle);
        }
        let (ack, admitted) = oneshot::channel();
        self.commands
            .send(PoolCommand::SubmitChunk { tasks, ack })
            .map_err(|_| SubmitError::Terminated)?;
        match admitted.await {
            Ok(Ok(())) => Ok(handles),
            Ok(Err(error)) => Err(error),
            Err(_) => Err(SubmitError::Terminated),
        }
    }
}

/// A worker pool over isolated executors.
pub struct Pool {
    gate: SubmitGate,
    commands: mpsc::UnboundedSender<PoolCommand>,
    events: EventBus,
    default_concurrency: usize,
    background: Vec<JoinHandle<()>>,
}

impl Pool {
    /// Builds a pool over the given executor factory, spawning
    /// `min_workers` executors up front.
    pub async fn new(
        config: PoolConfig,
        factory: Arc<dyn ExecutorFactoryBoxed>,
    ) -> Result<Self, PoolError> {
        Self::build(config, factory, None).await
    }

    /// Builds a pool over in-process executors sharing `registry`. The
    /// registry also backs the `caller-runs` back-pressure policy.
    pub async fn with_local(
        config: PoolConfig,
        registry: Arc<MethodRegistry>,
    ) -> Result<Self, PoolError> {
        let factory = Arc::new(LocalExecutorFactory::new(Arc::clone(&registry)));
        Self::build(config, factory, Some(registry)).await
    }

    async fn build(
        config: PoolConfig,
        factory: Arc<dyn ExecutorFactoryBoxed>,
        inline_registry: Option<Arc<MethodRegistry>>,
    ) -> Result<Self, PoolError> {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (signals_tx, signals_rx) = mpsc::unbounded_channel();
        let events = EventBus::new(config.event_capacity);
        let load = Arc::new(SeqLock::new(LoadSnapshot::default()));

        // Spawn the initial executor set before the loop starts; a pool
        // that cannot reach its minimum is a construction failure.
        let mut initial: Vec<(ExecutorId, Box<dyn ExecutorTransportBoxed>)> = Vec::new();
        for index in 0..config.min_workers {
            let id = ExecutorId(index as u32);
            let transport = factory
                .create_boxed(id)
                .await
                .map_err(|error| PoolError::Spawn(error.to_string()))?;
            initial.push((id, transport));
        }

        let default_concurrency = config.min_workers.max(1);
        let gate = SubmitGate {
            commands: commands_tx.clone(),
            signals: signals_tx,
            next_task_id: Arc::new(AtomicU64::new(1)),
            inline_registry,
            max_message_bytes: config.max_message_bytes,
        };

        let mut background = Vec::new();
        if config.scaler.enabled && config.max_workers > config.min_workers {
            background.push(spawn_scaler(
                config.scaler,
                config.min_workers as u32,
                config.max_workers as u32,
                Arc::clone(&load),
                commands_tx.clone(),
            ));
        }
        if config.heartbeat.enabled {
            background.push(spawn_heartbeat(config.heartbeat, commands_tx.clone()));
        }
        if config.stealing.enabled {
            let interval = config.stealing.rebalance_interval;
            let ticker = commands_tx.clone();
            background.push(tokio::spawn(async move {
                let mut tick = tokio::time::interval(interval);
                tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tick.tick().await;
                    if ticker.send(PoolCommand::RebalanceTick).is_err() {
                        break;
                    }
                }
            }));
        }

        let dispatcher = Dispatcher::new(
            config,
            factory,
            commands_tx.clone(),
            commands_rx,
            signals_rx,
            events.clone(),
            load,
            initial,
        );
        background.push(tokio::spawn(dispatcher.run()));

        Ok(Self {
            gate,
            commands: commands_tx,
            events,
            default_concurrency,
            background,
        })
    }

    /// Submits one task. Submission-time failures surface here; execution
    /// results come through the returned handle.
    pub async fn submit(
        &self,
        method: impl Into<String>,
        params: Vec<u8>,
        options: TaskOptions,
    ) -> Result<TaskHandle, SubmitError> {
        self.gate
            .submit(TaskSpec {
                method: method.into(),
                params,
                options,
            })
            .await
    }

    /// Submit-and-wait shorthand with default options.
    pub async fn exec(
        &self,
        method: impl Into<String>,
        params: Vec<u8>,
    ) -> Result<Vec<u8>, PoolError> {
        let handle = self.submit(method, params, TaskOptions::default()).await?;
        handle.wait().await.map_err(PoolError::Task)
    }

    /// Runs a batch of tasks with bounded concurrency. The batch record
    /// preserves original submission order.
    pub async fn submit_batch(
        &self,
        specs: Vec<TaskSpec>,
        options: BatchOptions,
    ) -> Result<BatchHandle, SubmitError> {
        for spec in &specs {
            validate_spec(spec, self.gate.max_message_bytes)?;
        }
        let units = specs
            .into_iter()
            .enumerate()
            .map(|(start, spec)| BatchUnit {
                start,
                specs: vec![spec],
            })
            .collect();
        Ok(spawn_batch(
            self.gate.clone(),
            units,
            options,
            self.default_concurrency,
        ))
    }

    /// Applies `method` to every item. `options.chunk_size` groups items
    /// per dispatch; each chunk travels as one wire message.
    pub async fn map(
        &self,
        method: impl Into<String>,
        items: Vec<Vec<u8>>,
        options: BatchOptions,
    ) -> Result<MapHandle, SubmitError> {
        let method = method.into();
        let chunk_size = options.chunk_size.max(1);

        let mut units = Vec::new();
        let mut start = 0;
        for chunk in items.chunks(chunk_size) {
            let specs: Vec<TaskSpec> = chunk
                .iter()
                .map(|item| TaskSpec::new(method.clone(), item.clone()))
                .collect();
            for spec in &specs {
                validate_spec(spec, self.gate.max_message_bytes)?;
            }
            units.push(BatchUnit {
                start,
                specs,
            });
            start += chunk.len();
        }

        Ok(MapHandle {
            inner: spawn_batch(self.gate.clone(), units, options, self.default_concurrency),
        })
    }

    /// Point-in-time pool statistics.
    pub async fn stats(&self) -> Result<PoolStats, PoolError> {
        let (reply, stats) = oneshot::channel();
        self.commands
            .send(PoolCommand::Stats { reply })
            .map_err(|_| PoolError::Submit(SubmitError::Terminated))?;
        stats
            .await
            .map_err(|_| PoolError::Submit(SubmitError::Terminated))
    }

    /// Subscribes to the structured event stream.
    pub fn subscribe_events(&self) -> broadcast::Receiver<PoolEvent> {
        self.events.subscribe()
    }

    /// Shuts the pool down. Without `force`, executors drain in-flight
    /// tasks first (bounded by the per-executor cleanup timeout and the
    /// optional overall `timeout`); with `force`, outstanding tasks fail
    /// immediately. Idempotent: repeated calls resolve with the first
    /// call's outcome.
    pub async fn terminate(&self, force: bool, timeout: Option<Duration>) -> Result<(), PoolError> {
        let (reply, done) = oneshot::channel();
        if self
            .commands
            .send(PoolCommand::Terminate {
                force,
                timeout,
                reply,
            })
            .is_err()
        {
            // Dispatch loop already gone: terminated.
            return Ok(());
        }
        done.await.unwrap_or(Ok(()))
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        for task in &self.background {
            task.abort();
        }
    }
}

/// Future for [`Pool::map`]: resolves with per-item results in item order.
#[derive(Debug)]
pub struct MapHandle {
    inner: BatchHandle,
}

impl MapHandle {
    pub fn cancel(&self) {
        self.inner.cancel();
    }

    /// Waits for all items; fails with the first error if any item failed.
    pub async fn wait(self) -> Result<Vec<Vec<u8>>, TaskError> {
        let outcome = self.inner.wait().await;
        let mut results = Vec::with_capacity(outcome.results.len());
        for result in outcome.results {
            results.push(result?);
        }
        Ok(results)
    }

    /// Waits for the raw batch record instead of the fail-on-first view.
    pub async fn wait_all(self) -> crate::batch::BatchOutcome {
        self.inner.wait().await
    }
}
