//! The dispatch loop: single writer for all task and executor bookkeeping.
//!
//! Callers submit through the command channel; executor pump tasks push
//! decoded frames onto a shared MPMC completion queue and wake the loop
//! through a `Notify`. Timers (task deadlines, retry backoff, blocked
//! submissions, drain deadlines) live in one binary heap. Nothing in here
//! blocks: factory spawns run as detached tasks that report back as
//! commands, and every channel send is unbounded.

use crate::config::{BackpressurePolicy, PoolConfig};
use crate::error::{PoolError, SubmitError, TaskError};
use crate::events::{EventBus, PoolEvent};
use crate::executor::{
    spawn_io_pump, ExecutorFactoryBoxed, ExecutorId, ExecutorRecord, ExecutorState,
    ExecutorTransportBoxed, IoCommand, IoEvent,
};
use crate::heartbeat::{ProbeAction, ProbeState};
use crate::policy::{select_with_hint, ExecutorStatus, SelectionHint, SelectionPolicy};
use crate::pool::{PoolCommand, SubmittedTask};
use crate::scaler::LoadSnapshot;
use crate::stats::{
    ExecutorStats, PolicyStats, PoolStats, ScalingStats, TaskCounters, WorkerCounts,
};
use crate::stealing::StealScheduler;
use crate::affinity::AffinityRouter;
use crate::task::{Resolution, TaskId, TaskResult, TaskSignal};
use poolwire::{
    BatchChunk, Body, Envelope, Priority, TaskSubmission, WireError,
};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use taskring::{DispatchQueue, Entry, MpmcQueue, QueueKind, SeqLock, SlotArena, SpmcRing};
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;

/// Wire-level cap on tasks per batch message.
const SERIALIZE_CHUNK: usize = 1000;

/// Where a live task currently sits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskLocation {
    /// In the shared ready ring.
    Ring,
    /// In the shared discipline queue.
    Shared,
    /// In one executor's deque.
    Deque(ExecutorId),
    /// Waiting out a retry backoff.
    Waiting,
    /// On an executor.
    Dispatched {
        executor: ExecutorId,
        msg_id: u32,
        started: Instant,
    },
}

struct TaskState {
    method: String,
    params: Vec<u8>,
    options: crate::task::TaskOptions,
    resolver: Option<crate::task::Resolver>,
    /// Arena slot while the task sits in a queue structure.
    slot: Option<u32>,
    location: TaskLocation,
    attempts: u32,
    last_error: Option<TaskError>,
    /// Executor whose affinity load this task currently counts toward.
    affinity_counted: Option<ExecutorId>,
}

struct ExecutorEntry {
    id: ExecutorId,
    record: ExecutorRecord,
    outbound: mpsc::UnboundedSender<IoCommand>,
    pump: JoinHandle<()>,
    /// In-flight wire ids → task ids.
    pending: HashMap<u32, TaskId>,
    probe: ProbeState,
    sequence: u32,
    /// Set when the pool initiated the shutdown of this executor, so the
    /// eventual transport closure is not reported as a crash.
    expected_close: bool,
}

impl ExecutorEntry {
    fn next_sequence(&mut self) -> u32 {
        let sequence = self.sequence;
        self.sequence = self.sequence.wrapping_add(1);
        sequence
    }

    fn sync_busy_state(&mut self) {
        match (self.record.state, self.record.active_tasks) {
            (ExecutorState::Ready, n) if n > 0 => self.record.transition(ExecutorState::Busy),
            (ExecutorState::Busy, 0) => self.record.transition(ExecutorState::Ready),
            _ => {}
        }
    }
}

/// Shared queue representation, chosen by the configured discipline.
enum SharedQueue {
    Ring(SpmcRing),
    Discipline(DispatchQueue<u32>),
}

impl SharedQueue {
    fn len(&self) -> usize {
        match self {
            Self::Ring(ring) => ring.len(),
            Self::Discipline(queue) => queue.len(),
        }
    }

    /// Admits a slot; hands it back when the structure is full.
    fn push(&mut self, priority: i16, slot: u32) -> Result<(), u32> {
        match self {
            Self::Ring(ring) => ring.push(Entry::new(priority, slot)).map_err(|_| slot),
            Self::Discipline(queue) => {
                queue.push(priority, slot);
                Ok(())
            }
        }
    }

    fn pop(&mut self) -> Option<u32> {
        match self {
            Self::Ring(ring) => ring.pop().map(Entry::slot_index),
            Self::Discipline(queue) => queue.pop(),
        }
    }

    /// Oldest-first eviction for `drop-oldest`.
    fn pop_oldest(&mut self) -> Option<u32> {
        match self {
            Self::Ring(ring) => ring.pop().map(Entry::slot_index),
            Self::Discipline(queue) => queue.pop_oldest(),
        }
    }

    /// Targeted removal; only the discipline queue supports it, the ring
    /// relies on lazy invalidation at pop time.
    fn remove_slot(&mut self, slot: u32) -> bool {
        match self {
            Self::Ring(_) => false,
            Self::Discipline(queue) => queue.remove_where(|&s| s == slot).is_some(),
        }
    }
}

/// Timer heap entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum TimerKind {
    TaskTimeout(TaskId),
    TaskRetry(TaskId),
    BlockedSweep,
    DrainDeadline,
}

struct BlockedSubmit {
    task: SubmittedTask,
    ack: oneshot::Sender<Result<(), SubmitError>>,
    deadline: Instant,
}

enum Lifecycle {
    Running,
    Draining {
        replies: Vec<oneshot::Sender<Result<(), PoolError>>>,
        deadline: Instant,
    },
    Terminated,
    Poisoned(String),
}

pub(crate) struct Dispatcher {
    config: PoolConfig,
    factory: Arc<dyn ExecutorFactoryBoxed>,
    commands_tx: mpsc::UnboundedSender<PoolCommand>,
    commands_rx: mpsc::UnboundedReceiver<PoolCommand>,
    signals_rx: mpsc::UnboundedReceiver<TaskSignal>,
    events: EventBus,
    load: Arc<SeqLock<LoadSnapshot>>,

    io_events: Arc<MpmcQueue<IoEvent>>,
    io_wake: Arc<Notify>,

    entries: Vec<ExecutorEntry>,
    next_executor_id: u32,
    spawning: u32,

    tasks: HashMap<TaskId, TaskState>,
    arena: SlotArena,
    shared: SharedQueue,
    blocked: VecDeque<BlockedSubmit>,

    policy: Box<dyn SelectionPolicy>,
    policy_selections: u64,
    policy_per_executor: HashMap<u32, u64>,
    router: Option<AffinityRouter>,
    stealer: Option<StealScheduler>,

    timers: BinaryHeap<Reverse<(Instant, TimerKind)>>,
    counters: TaskCounters,
    scaling: ScalingStats,
    last_scale: Option<Instant>,
    next_msg_id: u32,
    next_batch_id: u64,
    lifecycle: Lifecycle,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        mut config: PoolConfig,
        factory: Arc<dyn ExecutorFactoryBoxed>,
        commands_tx: mpsc::UnboundedSender<PoolCommand>,
        commands_rx: mpsc::UnboundedReceiver<PoolCommand>,
        signals_rx: mpsc::UnboundedReceiver<TaskSignal>,
        events: EventBus,
        load: Arc<SeqLock<LoadSnapshot>>,
        initial: Vec<(ExecutorId, Box<dyn ExecutorTransportBoxed>)>,
    ) -> Self {
        let shared = match config.queue_kind {
            QueueKind::Fifo => SharedQueue::Ring(SpmcRing::with_capacity(config.queue_capacity)),
            kind => SharedQueue::Discipline(DispatchQueue::new(kind)),
        };
        let router = config
            .affinity
            .enabled
            .then(|| AffinityRouter::new(&config.affinity));
        let stealer = config
            .stealing
            .enabled
            .then(|| StealScheduler::new(config.stealing));
        let policy = std::mem::replace(&mut config.policy, crate::policy::PolicyKind::RoundRobin)
            .build();

        let mut dispatcher = Self {
            arena: SlotArena::with_capacity(config.queue_capacity),
            config,
            factory,
            commands_tx,
            commands_rx,
            signals_rx,
            events,
            load,
            io_events: Arc::new(MpmcQueue::with_capacity(4096)),
            io_wake: Arc::new(Notify::new()),
            entries: Vec::new(),
            next_executor_id: 0,
            spawning: 0,
            tasks: HashMap::new(),
            shared,
            blocked: VecDeque::new(),
            policy,
            policy_selections: 0,
            policy_per_executor: HashMap::new(),
            router,
            stealer,
            timers: BinaryHeap::new(),
            counters: TaskCounters::default(),
            scaling: ScalingStats::default(),
            last_scale: None,
            next_msg_id: 1,
            next_batch_id: 0,
            lifecycle: Lifecycle::Running,
        };
        for (id, transport) in initial {
            dispatcher.next_executor_id = dispatcher.next_executor_id.max(id.0 + 1);
            dispatcher.attach_executor(id, transport);
        }
        dispatcher
    }

    pub(crate) async fn run(mut self) {
        loop {
            self.publish_load();
            let deadline = self.timers.peek().map(|Reverse((at, _))| *at);
            let sleep_target = tokio::time::Instant::from_std(
                deadline.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600)),
            );

            tokio::select! {
                biased;
                command = self.commands_rx.recv() => {
                    match command {
                        Some(command) => self.handle_command(command),
                        None => break,
                    }
                }
                signal = self.signals_rx.recv() => {
                    if let Some(TaskSignal::Cancel(task_id)) = signal {
                        self.handle_cancel(task_id);
                    }
                }
                _ = self.io_wake.notified() => {}
                _ = tokio::time::sleep_until(sleep_target), if deadline.is_some() => {
                    self.fire_timers();
                }
            }

            self.drain_io();
            self.drain_blocked();
            self.pump_feed();
            if matches!(self.lifecycle, Lifecycle::Draining { .. }) {
                self.check_drained();
            }
        }
        self.kill_all_executors();
    }

    // -------------------------------------------------------------------
    // Command handling
    // -------------------------------------------------------------------

    fn handle_command(&mut self, command: PoolCommand) {
        match command {
            PoolCommand::Submit { task, ack } => self.handle_submit(task, ack),
            PoolCommand::SubmitChunk { tasks, ack } => self.handle_submit_chunk(tasks, ack),
            PoolCommand::Stats { reply } => {
                let _ = reply.send(self.build_stats());
            }
            PoolCommand::HeartbeatTick => self.handle_heartbeat_tick(),
            PoolCommand::RebalanceTick => self.handle_rebalance_tick(),
            PoolCommand::ScaleUp { count, reason } => self.handle_scale_up(count, reason),
            PoolCommand::ScaleDown { count, reason } => self.handle_scale_down(count, reason),
            PoolCommand::ExecutorAttached { id, transport } => {
                self.spawning = self.spawning.saturating_sub(1);
                if matches!(self.lifecycle, Lifecycle::Running) {
                    self.attach_executor(id, transport);
                } else {
                    // Arrived after shutdown began; tear it straight down.
                    let (outbound, commands) = mpsc::unbounded_channel();
                    let pump = spawn_io_pump(
                        id,
                        transport,
                        commands,
                        Arc::clone(&self.io_events),
                        Arc::clone(&self.io_wake),
                    );
                    let _ = outbound.send(IoCommand::Kill);
                    drop(pump);
                }
            }
            PoolCommand::ExecutorSpawnFailed { id, error } => {
                self.spawning = self.spawning.saturating_sub(1);
                tracing::warn!(executor = id.0, %error, "executor spawn failed");
                self.events.emit(PoolEvent::ExecutorCrashed {
                    executor: id.0,
                    reason: format!("spawn failed: {error}"),
                });
            }
            PoolCommand::Terminate {
                force,
                timeout,
                reply,
            } => self.handle_terminate(force, timeout, reply),
        }
    }

    fn reject_reason(&self) -> Option<SubmitError> {
        match &self.lifecycle {
            Lifecycle::Running => None,
            Lifecycle::Poisoned(reason) => Some(SubmitError::Poisoned(reason.clone())),
            _ => Some(SubmitError::Terminated),
        }
    }

    fn handle_submit(
        &mut self,
        task: SubmittedTask,
        ack: oneshot::Sender<Result<(), SubmitError>>,
    ) {
        if let Some(reason) = self.reject_reason() {
            let _ = ack.send(Err(reason));
            return;
        }

        // Zero registered executors: only the reject policy refuses; the
        // others queue and wait for scale-up.
        let live = self.entries.iter().filter(|e| e.record.state.accepts_tasks()).count();
        if live == 0 && self.spawning == 0 {
            if matches!(self.config.backpressure, BackpressurePolicy::Reject) {
                let _ = ack.send(Err(SubmitError::NoWorkersAvailable));
                return;
            }
        }

        let selection = self.choose_executor(&task);

        // Direct dispatch: the chosen executor has spare concurrency and no
        // older work would be overtaken.
        if let Some(index) = selection {
            let can_direct = {
                let entry = &self.entries[index];
                entry.record.state.accepts_tasks()
                    && entry.record.active_tasks < self.config.max_concurrency_per_worker
                    && self.shared.len() == 0
                    && self.blocked.is_empty()
                    && self
                        .stealer
                        .as_ref()
                        .map_or(true, |s| s.queued_for(entry.id) == 0)
            };
            if can_direct {
                let task_id = task.task_id;
                self.register_task(task, TaskLocation::Waiting, None);
                self.counters.submitted += 1;
                self.dispatch_task(index, task_id);
                let _ = ack.send(Ok(()));
                return;
            }
        }

        match self.admit(task, selection) {
            Ok(()) => {
                self.counters.submitted += 1;
                let _ = ack.send(Ok(()));
            }
            Err(task) => self.apply_backpressure(task, ack),
        }
    }

    /// Records a task in the table. `slot` is its queue reference, if any.
    fn register_task(&mut self, task: SubmittedTask, location: TaskLocation, slot: Option<u32>) {
        if let Some(timeout) = task.options.timeout {
            self.timers.push(Reverse((
                Instant::now() + timeout,
                TimerKind::TaskTimeout(task.task_id),
            )));
        }
        self.tasks.insert(
            task.task_id,
            TaskState {
                method: task.method,
                params: task.params,
                options: task.options,
                resolver: Some(task.resolver),
                slot,
                location,
                attempts: 0,
                last_error: None,
                affinity_counted: None,
            },
        );
    }

    /// Queues an admitted task, preferring the selected executor's deque
    /// under work stealing. Hands the task back when every structure is
    /// out of capacity.
    fn admit(&mut self, task: SubmittedTask, preferred: Option<usize>) -> Result<(), SubmittedTask> {
        let priority = task.options.priority;
        let Some(slot) = self.arena.allocate(task.task_id, priority, 0) else {
            return Err(task);
        };

        // Work-stealing path: the task lands in the chosen executor's deque.
        if let (Some(stealer), Some(index)) = (self.stealer.as_ref(), preferred) {
            let id = self.entries[index].id;
            if let Some(deque) = stealer.deque(id) {
                if deque.push_bottom(slot).is_ok() {
                    self.register_task(task, TaskLocation::Deque(id), Some(slot));
                    return Ok(());
                }
            }
        }

        let location = match &self.shared {
            SharedQueue::Ring(_) => TaskLocation::Ring,
            SharedQueue::Discipline(_) => TaskLocation::Shared,
        };
        match self.shared.push(priority, slot) {
            Ok(()) => {
                self.register_task(task, location, Some(slot));
                Ok(())
            }
            Err(slot) => {
                self.arena.release(slot);
                Err(task)
            }
        }
    }

    fn apply_backpressure(
        &mut self,
        task: SubmittedTask,
        ack: oneshot::Sender<Result<(), SubmitError>>,
    ) {
        let policy = self.config.backpressure;
        self.events.emit(PoolEvent::QueuePressure {
            queued: self.queued_total() as u64,
            applied: format!("{policy:?}"),
        });

        match policy {
            BackpressurePolicy::Reject => {
                let _ = ack.send(Err(SubmitError::QueueFull));
            }
            BackpressurePolicy::DropOldest => {
                if let Some(slot) = self.shared.pop_oldest() {
                    if let Some(victim) = self.take_queued_task(slot) {
                        self.resolve_task(victim, Err(TaskError::Cancelled));
                    }
                }
                match self.admit(task, None) {
                    Ok(()) => {
                        self.counters.submitted += 1;
                        let _ = ack.send(Ok(()));
                    }
                    Err(_) => {
                        let _ = ack.send(Err(SubmitError::QueueFull));
                    }
                }
            }
            BackpressurePolicy::DropNewest => {
                // Admitted, then immediately dropped: the handle resolves
                // `Cancelled`, the queue is untouched.
                self.counters.submitted += 1;
                self.counters.cancelled += 1;
                let _ = task.resolver.send(Resolution::Done(Err(TaskError::Cancelled)));
                let _ = ack.send(Ok(()));
            }
            BackpressurePolicy::Block { timeout } => {
                let deadline = Instant::now() + timeout;
                self.timers.push(Reverse((deadline, TimerKind::BlockedSweep)));
                self.blocked.push_back(BlockedSubmit {
                    task,
                    ack,
                    deadline,
                });
            }
            BackpressurePolicy::CallerRuns => {
                self.counters.submitted += 1;
                let _ = task.resolver.send(Resolution::CallerRuns {
                    method: task.method,
                    params: task.params,
                });
                let _ = ack.send(Ok(()));
            }
        }
    }

    /// Retries parked submissions whenever capacity may have freed.
    fn drain_blocked(&mut self) {
        while let Some(front) = self.blocked.pop_front() {
            let BlockedSubmit {
                task,
                ack,
                deadline,
            } = front;
            let selection = self.choose_executor(&task);
            match self.admit(task, selection) {
                Ok(()) => {
                    self.counters.submitted += 1;
                    let _ = ack.send(Ok(()));
                }
                Err(task) => {
                    self.blocked.push_front(BlockedSubmit {
                        task,
                        ack,
                        deadline,
                    });
                    break;
                }
            }
        }
    }

    fn handle_submit_chunk(
        &mut self,
        tasks: Vec<SubmittedTask>,
        ack: oneshot::Sender<Result<(), SubmitError>>,
    ) {
        if let Some(reason) = self.reject_reason() {
            let _ = ack.send(Err(reason));
            return;
        }
        if tasks.is_empty() {
            let _ = ack.send(Ok(()));
            return;
        }

        let total_estimate: Duration = tasks
            .iter()
            .filter_map(|t| t.options.estimated_duration)
            .sum();
        let hint = SelectionHint {
            affinity_index: None,
            task_type: tasks[0].options.task_type.clone(),
            estimated_duration: (total_estimate > Duration::ZERO).then_some(total_estimate),
        };
        let statuses = self.statuses();
        let Some(selection) = select_with_hint(self.policy.as_mut(), &statuses, Some(&hint))
        else {
            let _ = ack.send(Err(SubmitError::NoWorkersAvailable));
            return;
        };
        self.note_selection(selection.index);

        let executor_index = selection.index;
        let batch_id = format!("batch-{}", self.next_batch_id);
        self.next_batch_id += 1;

        let total_chunks = tasks.len().div_ceil(SERIALIZE_CHUNK) as u16;
        let mut chunk_index = 0u16;
        let mut iter = tasks.into_iter().peekable();
        while iter.peek().is_some() {
            let chunk: Vec<SubmittedTask> = iter.by_ref().take(SERIALIZE_CHUNK).collect();
            let mut inner = Vec::new();
            let mut count = 0u32;
            for task in chunk {
                let msg_id = self.alloc_msg_id();
                let wire_priority = task.options.wire_priority();
                let submission = TaskSubmission {
                    method: task.method.clone(),
                    params: task.params.clone(),
                };
                let sequence = self.entries[executor_index].next_sequence();
                let envelope = Envelope::new(
                    msg_id,
                    sequence,
                    wire_priority,
                    Body::TaskRequest(submission),
                );
                let Ok(bytes) = envelope.encode() else {
                    let _ = task
                        .resolver
                        .send(Resolution::Done(Err(TaskError::InvalidParams(
                            "task too large for the wire".into(),
                        ))));
                    continue;
                };
                inner.extend_from_slice(&bytes);
                count += 1;

                let task_id = task.task_id;
                self.register_task(task, TaskLocation::Waiting, None);
                self.counters.submitted += 1;
                self.mark_dispatched(executor_index, task_id, msg_id);
            }

            let sequence = self.entries[executor_index].next_sequence();
            let envelope = Envelope::new(
                self.alloc_msg_id(),
                sequence,
                Priority::Normal,
                Body::Batch(BatchChunk {
                    batch_id: batch_id.clone(),
                    task_count: count,
                    chunk_index,
                    total_chunks,
                    tasks: inner,
                }),
            );
            chunk_index += 1;
            if let Ok(bytes) = envelope.encode() {
                let _ = self.entries[executor_index]
                    .outbound
                    .send(IoCommand::Frame(bytes));
            }
        }

        let _ = ack.send(Ok(()));
    }

    // -------------------------------------------------------------------
    // Routing and dispatch
    // -------------------------------------------------------------------

    fn statuses(&self) -> Vec<ExecutorStatus> {
        self.entries
            .iter()
            .map(|entry| ExecutorStatus {
                id: entry.id,
                accepts: entry.record.state.accepts_tasks(),
                idle: entry.record.active_tasks < self.config.max_concurrency_per_worker,
                active_tasks: entry.record.active_tasks,
                queued_tasks: self
                    .stealer
                    .as_ref()
                    .map_or(0, |s| s.queued_for(entry.id) as u32),
                total_completed: entry.record.total_completed,
                weight: entry.record.weight,
            })
            .collect()
    }

    fn index_of(&self, id: ExecutorId) -> Option<usize> {
        self.entries.iter().position(|entry| entry.id == id)
    }

    fn note_selection(&mut self, index: usize) {
        self.policy_selections += 1;
        if let Some(entry) = self.entries.get(index) {
            *self.policy_per_executor.entry(entry.id.0).or_default() += 1;
        }
    }

    fn choose_executor(&mut self, task: &SubmittedTask) -> Option<usize> {
        let statuses = self.statuses();
        let mut hint = SelectionHint {
            affinity_index: None,
            task_type: task.options.task_type.clone(),
            estimated_duration: task.options.estimated_duration,
        };

        if let (Some(router), Some(key)) =
            (self.router.as_mut(), task.options.affinity_key.as_deref())
        {
            let entries = &self.entries;
            let floor = self.config.affinity.confidence_floor;
            if let Some(decision) = router.route(key, Instant::now(), |id| {
                entries
                    .iter()
                    .find(|e| e.id == id && e.record.state.accepts_tasks())
                    .map(|e| e.record.affinity_load)
            }) {
                if decision.confidence >= floor {
                    hint.affinity_index = entries.iter().position(|e| e.id == decision.executor);
                }
            }
        }

        let selection = select_with_hint(self.policy.as_mut(), &statuses, Some(&hint))?;
        self.note_selection(selection.index);
        Some(selection.index)
    }

    fn alloc_msg_id(&mut self) -> u32 {
        let id = self.next_msg_id;
        self.next_msg_id = self.next_msg_id.wrapping_add(1).max(1);
        id
    }

    /// Marks a registered task as in flight on an executor.
    fn mark_dispatched(&mut self, index: usize, task_id: TaskId, msg_id: u32) {
        let id = self.entries[index].id;
        let has_affinity = self
            .tasks
            .get(&task_id)
            .is_some_and(|t| t.options.affinity_key.is_some());

        let entry = &mut self.entries[index];
        entry.pending.insert(msg_id, task_id);
        entry.record.active_tasks += 1;
        if has_affinity {
            entry.record.affinity_load += 1.0;
        }
        entry.sync_busy_state();

        if let Some(state) = self.tasks.get_mut(&task_id) {
            state.location = TaskLocation::Dispatched {
                executor: id,
                msg_id,
                started: Instant::now(),
            };
            if has_affinity {
                state.affinity_counted = Some(id);
            }
        }
    }

    /// Sends one task to one executor. The task must already be in the
    /// table with no queue reference.
    fn dispatch_task(&mut self, index: usize, task_id: TaskId) {
        let msg_id = self.alloc_msg_id();
        let frame = {
            let Some(state) = self.tasks.get(&task_id) else {
                return;
            };
            let flags = if state.options.transfer.is_empty() {
                poolwire::FrameFlags::default()
            } else {
                poolwire::FrameFlags::HAS_TRANSFER
            };
            let sequence = self.entries[index].next_sequence();
            let envelope = Envelope {
                id: msg_id,
                sequence,
                priority: state.options.wire_priority(),
                flags,
                body: Body::TaskRequest(TaskSubmission {
                    method: state.method.clone(),
                    params: state.params.clone(),
                }),
            };
            match envelope.encode() {
                Ok(bytes) => bytes,
                Err(error) => {
                    self.resolve_task(
                        task_id,
                        Err(TaskError::InvalidParams(error.to_string())),
                    );
                    return;
                }
            }
        };

        if self.entries[index]
            .outbound
            .send(IoCommand::Frame(frame))
            .is_err()
        {
            // Pump already gone; the Closed event will tear the executor
            // down. Put the task back in the shared queue.
            self.requeue_or_fail(task_id);
            return;
        }
        self.mark_dispatched(index, task_id, msg_id);
    }

    /// Pulls work for every executor with spare concurrency: own deque
    /// first, then a steal, then the shared queue.
    fn pump_feed(&mut self) {
        if !matches!(self.lifecycle, Lifecycle::Running) {
            return;
        }
        for index in 0..self.entries.len() {
            loop {
                let (accepts, spare) = {
                    let entry = &self.entries[index];
                    (
                        entry.record.state.accepts_tasks(),
                        entry.record.active_tasks < self.config.max_concurrency_per_worker,
                    )
                };
                if !accepts || !spare {
                    break;
                }
                let Some(task_id) = self.next_work_for(index) else {
                    break;
                };
                self.dispatch_task(index, task_id);
            }
        }
    }

    fn next_work_for(&mut self, index: usize) -> Option<TaskId> {
        let id = self.entries[index].id;

        if self.stealer.is_some() {
            // Own deque, newest first; stale (cancelled) slots die in place.
            loop {
                let slot = self
                    .stealer
                    .as_ref()
                    .and_then(|s| s.deque(id))
                    .and_then(|deque| deque.pop_bottom());
                match slot {
                    Some(slot) => {
                        if let Some(task_id) = self.take_queued_task(slot) {
                            return Some(task_id);
                        }
                    }
                    None => break,
                }
            }

            // Steal from a victim.
            let haul = self
                .stealer
                .as_mut()
                .map(|s| s.steal_for(id, Instant::now()))
                .unwrap_or_default();
            if !haul.is_empty() {
                if let Some(task_id) = self.absorb_haul(index, haul) {
                    return Some(task_id);
                }
            }
        }

        // Shared queue.
        while let Some(slot) = self.shared.pop() {
            if let Some(task_id) = self.take_queued_task(slot) {
                return Some(task_id);
            }
        }
        None
    }

    /// First valid stolen task dispatches; the rest land in the thief's
    /// own deque.
    fn absorb_haul(&mut self, index: usize, haul: Vec<u32>) -> Option<TaskId> {
        let id = self.entries[index].id;
        let mut first = None;
        for slot in haul {
            if first.is_none() {
                if let Some(task_id) = self.take_queued_task(slot) {
                    first = Some(task_id);
                }
                continue;
            }

            // Keep the slot queued, now under the thief.
            let view = self.arena.view(slot);
            let live = self
                .tasks
                .get(&view.task_id)
                .is_some_and(|t| t.slot == Some(slot));
            if !live {
                self.arena.release(slot);
                continue;
            }
            let pushed = self
                .stealer
                .as_ref()
                .and_then(|s| s.deque(id))
                .is_some_and(|deque| deque.push_bottom(slot).is_ok());
            if pushed {
                if let Some(state) = self.tasks.get_mut(&view.task_id) {
                    state.location = TaskLocation::Deque(id);
                }
            } else if self.shared.push(view.priority, slot).is_ok() {
                if let Some(state) = self.tasks.get_mut(&view.task_id) {
                    state.location = match self.shared {
                        SharedQueue::Ring(_) => TaskLocation::Ring,
                        SharedQueue::Discipline(_) => TaskLocation::Shared,
                    };
                }
            } else {
                let task_id = view.task_id;
                self.arena.release(slot);
                self.resolve_task(task_id, Err(TaskError::Cancelled));
            }
        }
        first
    }

    /// Claims a popped slot: releases it and returns the task it carried,
    /// if that task is still queued. Cancelled or stale slots just die.
    fn take_queued_task(&mut self, slot: u32) -> Option<TaskId> {
        let view = self.arena.view(slot);
        let task_id = view.task_id;
        let live = self
            .tasks
            .get(&task_id)
            .is_some_and(|state| state.slot == Some(slot));
        self.arena.release(slot);
        if !live {
            return None;
        }
        if let Some(state) = self.tasks.get_mut(&task_id) {
            state.slot = None;
            state.location = TaskLocation::Waiting;
        }
        Some(task_id)
    }

    /// Puts a task (already slot-free) back into the shared queue, failing
    /// it if even that is full.
    fn requeue_or_fail(&mut self, task_id: TaskId) {
        let Some(state) = self.tasks.get(&task_id) else {
            return;
        };
        let priority = state.options.priority;
        let last_error = state.last_error.clone();
        match self.arena.allocate(task_id, priority, 0) {
            Some(slot) => match self.shared.push(priority, slot) {
                Ok(()) => {
                    if let Some(state) = self.tasks.get_mut(&task_id) {
                        state.slot = Some(slot);
                        state.location = match self.shared {
                            SharedQueue::Ring(_) => TaskLocation::Ring,
                            SharedQueue::Discipline(_) => TaskLocation::Shared,
                        };
                    }
                }
                Err(slot) => {
                    self.arena.release(slot);
                    self.resolve_task(
                        task_id,
                        Err(last_error.unwrap_or(TaskError::Cancelled)),
                    );
                }
            },
            None => {
                self.resolve_task(task_id, Err(last_error.unwrap_or(TaskError::Cancelled)));
            }
        }
    }

    // -------------------------------------------------------------------
    // Completion path
    // -------------------------------------------------------------------

    fn drain_io(&mut self) {
        while let Some(event) = self.io_events.pop() {
            match event {
                IoEvent::Message { executor, envelope } => self.handle_message(executor, envelope),
                IoEvent::Corrupt { executor, error } => self.handle_corrupt(executor, error),
                IoEvent::Closed { executor, reason } => self.handle_closed(executor, reason),
            }
        }
    }

    fn handle_message(&mut self, executor: ExecutorId, envelope: Envelope) {
        let Some(index) = self.index_of(executor) else {
            return;
        };
        match envelope.body {
            Body::TaskResponse(reply) => {
                self.complete(index, envelope.id, Ok(reply.result));
            }
            Body::TaskError(failure) => {
                self.complete(index, envelope.id, Err(TaskError::from_wire(&failure.error)));
            }
            Body::HeartbeatRes(_) => {
                let was_unresponsive = {
                    let entry = &mut self.entries[index];
                    entry.probe.on_response();
                    entry.record.last_heartbeat = Some(Instant::now());
                    entry.record.missed_heartbeats = 0;
                    entry.record.state == ExecutorState::Unresponsive
                };
                if was_unresponsive {
                    let entry = &mut self.entries[index];
                    entry.record.transition(ExecutorState::Ready);
                    entry.sync_busy_state();
                    self.events
                        .emit(PoolEvent::ExecutorRecovered { executor: executor.0 });
                }
            }
            // Cleanup acknowledgements and worker-side events need no
            // routing; drain tracking watches the pending tables.
            _ => {}
        }
    }

    fn complete(&mut self, index: usize, msg_id: u32, result: TaskResult) {
        let Some(task_id) = self.entries[index].pending.remove(&msg_id) else {
            // Cancelled or timed out earlier; a late result must not
            // resolve the caller.
            return;
        };

        let executor = self.entries[index].id;
        let started = match self.tasks.get(&task_id) {
            Some(TaskState {
                location: TaskLocation::Dispatched { started, .. },
                ..
            }) => *started,
            _ => Instant::now(),
        };
        let duration = started.elapsed();

        {
            let entry = &mut self.entries[index];
            entry.record.active_tasks = entry.record.active_tasks.saturating_sub(1);
            entry.record.total_completed += 1;
            entry.record.total_execution_time += duration;
            entry.record.last_task_end = Some(Instant::now());
            entry.sync_busy_state();
        }
        self.policy
            .on_task_complete(executor, duration, result.is_ok());

        match result {
            Err(error) if error.is_retryable() => {
                let can_retry = self
                    .tasks
                    .get(&task_id)
                    .is_some_and(|state| state.attempts < state.options.max_retries);
                if can_retry {
                    self.schedule_retry(task_id, error);
                } else {
                    self.resolve_task(task_id, Err(error));
                }
            }
            other => self.resolve_task(task_id, other),
        }
    }

    fn schedule_retry(&mut self, task_id: TaskId, error: TaskError) {
        let (attempts, affinity) = {
            let Some(state) = self.tasks.get_mut(&task_id) else {
                return;
            };
            state.attempts += 1;
            state.last_error = Some(error);
            state.location = TaskLocation::Waiting;
            (state.attempts, state.affinity_counted.take())
        };
        if let Some(exec) = affinity {
            if let Some(index) = self.index_of(exec) {
                self.entries[index].record.affinity_load -= 1.0;
            }
        }
        let delay = self.config.retry.delay_for_attempt(attempts);
        self.counters.retried += 1;
        self.events.emit(PoolEvent::TaskRetried {
            task_id,
            attempt: attempts,
        });
        self.timers
            .push(Reverse((Instant::now() + delay, TimerKind::TaskRetry(task_id))));
    }

    /// Resolves a task future exactly once and drops its table entry.
    fn resolve_task(&mut self, task_id: TaskId, result: TaskResult) {
        let Some(mut state) = self.tasks.remove(&task_id) else {
            return;
        };
        if let Some(exec) = state.affinity_counted.take() {
            if let Some(index) = self.index_of(exec) {
                self.entries[index].record.affinity_load -= 1.0;
            }
        }
        match &result {
            Ok(_) => self.counters.completed += 1,
            Err(TaskError::Cancelled) => self.counters.cancelled += 1,
            Err(TaskError::Timeout) => self.counters.timed_out += 1,
            Err(error) => {
                self.counters.failed += 1;
                self.events.emit(PoolEvent::TaskFailed {
                    task_id,
                    code: error.code().0,
                });
            }
        }
        if let Some(resolver) = state.resolver.take() {
            let _ = resolver.send(Resolution::Done(result));
        }
    }

    // -------------------------------------------------------------------
    // Cancellation and timers
    // -------------------------------------------------------------------

    /// Idempotent cancel: queued tasks leave their queue, dispatched tasks
    /// get a cleanup signal; either way the future resolves `Cancelled`
    /// exactly once and a late result is refused.
    fn handle_cancel(&mut self, task_id: TaskId) {
        self.cancel_with(task_id, TaskError::Cancelled);
    }

    fn cancel_with(&mut self, task_id: TaskId, error: TaskError) {
        let (location, slot) = match self.tasks.get(&task_id) {
            Some(state) => (state.location, state.slot),
            None => return,
        };

        match location {
            TaskLocation::Dispatched { executor, msg_id, .. } => {
                if let Some(index) = self.index_of(executor) {
                    // Refuse any late result for this wire id.
                    self.entries[index].pending.remove(&msg_id);
                    {
                        let entry = &mut self.entries[index];
                        entry.record.active_tasks = entry.record.active_tasks.saturating_sub(1);
                        entry.sync_busy_state();
                    }
                    let sequence = self.entries[index].next_sequence();
                    let envelope =
                        Envelope::new(msg_id, sequence, Priority::High, Body::CleanupReq);
                    if let Ok(bytes) = envelope.encode() {
                        let _ = self.entries[index].outbound.send(IoCommand::Frame(bytes));
                    }
                }
            }
            TaskLocation::Shared => {
                if let Some(slot) = slot {
                    if self.shared.remove_slot(slot) {
                        self.arena.release(slot);
                    }
                }
            }
            // Ring and deque references are invalidated lazily: the slot
            // stays allocated until popped, then dies in take_queued_task.
            TaskLocation::Ring | TaskLocation::Deque(_) | TaskLocation::Waiting => {}
        }

        self.resolve_task(task_id, Err(error));
    }

    fn fire_timers(&mut self) {
        let now = Instant::now();
        while let Some(Reverse((at, kind))) = self.timers.peek().copied() {
            if at > now {
                break;
            }
            self.timers.pop();
            match kind {
                TimerKind::TaskTimeout(task_id) => {
                    if self.tasks.contains_key(&task_id) {
                        self.cancel_with(task_id, TaskError::Timeout);
                    }
                }
                TimerKind::TaskRetry(task_id) => self.fire_retry(task_id),
                TimerKind::BlockedSweep => self.expire_blocked(now),
                TimerKind::DrainDeadline => {
                    if matches!(self.lifecycle, Lifecycle::Draining { .. }) {
                        self.finish_terminate(true);
                    }
                }
            }
        }
    }

    fn fire_retry(&mut self, task_id: TaskId) {
        let waiting = self
            .tasks
            .get(&task_id)
            .is_some_and(|state| state.location == TaskLocation::Waiting);
        if !waiting {
            return;
        }

        // Re-route like a fresh submission.
        let statuses = self.statuses();
        let hint = self.tasks.get(&task_id).map(|state| SelectionHint {
            affinity_index: None,
            task_type: state.options.task_type.clone(),
            estimated_duration: state.options.estimated_duration,
        });
        let selection = select_with_hint(self.policy.as_mut(), &statuses, hint.as_ref());
        match selection {
            Some(selection) => {
                let index = selection.index;
                self.note_selection(index);
                let spare = self.entries[index].record.active_tasks
                    < self.config.max_concurrency_per_worker;
                if spare {
                    self.dispatch_task(index, task_id);
                } else {
                    self.requeue_or_fail(task_id);
                }
            }
            None => self.requeue_or_fail(task_id),
        }
    }

    fn expire_blocked(&mut self, now: Instant) {
        let mut keep = VecDeque::new();
        while let Some(entry) = self.blocked.pop_front() {
            if entry.deadline <= now {
                let _ = entry.ack.send(Err(SubmitError::QueueFull));
            } else {
                keep.push_back(entry);
            }
        }
        self.blocked = keep;
    }

    // -------------------------------------------------------------------
    // Executor membership
    // -------------------------------------------------------------------

    fn attach_executor(&mut self, id: ExecutorId, transport: Box<dyn ExecutorTransportBoxed>) {
        let (outbound, pump_commands) = mpsc::unbounded_channel();
        let pump = spawn_io_pump(
            id,
            transport,
            pump_commands,
            Arc::clone(&self.io_events),
            Arc::clone(&self.io_wake),
        );

        let mut record = ExecutorRecord::new(self.config.weight_for(id.0));
        record.transition(ExecutorState::Warming);
        record.transition(ExecutorState::Ready);

        self.entries.push(ExecutorEntry {
            id,
            record,
            outbound,
            pump,
            pending: HashMap::new(),
            probe: ProbeState::default(),
            sequence: 0,
            expected_close: false,
        });

        self.policy.on_executor_added(id);
        if let Some(router) = self.router.as_mut() {
            router.add_executor(id);
        }
        if let Some(stealer) = self.stealer.as_mut() {
            stealer.add_executor(id);
        }
        self.events.emit(PoolEvent::ExecutorSpawned { executor: id.0 });
        tracing::debug!(executor = id.0, "executor attached");
    }

    fn spawn_executor(&mut self) {
        let id = ExecutorId(self.next_executor_id);
        self.next_executor_id += 1;
        self.spawning += 1;
        let factory = Arc::clone(&self.factory);
        let commands = self.commands_tx.clone();
        tokio::spawn(async move {
            let message = match factory.create_boxed(id).await {
                Ok(transport) => PoolCommand::ExecutorAttached { id, transport },
                Err(error) => PoolCommand::ExecutorSpawnFailed { id, error },
            };
            let _ = commands.send(message);
        });
    }

    /// Tears one executor out of every structure. In-flight tasks fail
    /// with `failure` (retry-eligible ones are rescheduled); deque
    /// leftovers go back to the shared queue.
    fn remove_executor(&mut self, index: usize, failure: Option<TaskError>) {
        let id = self.entries[index].id;

        // Fail or retry in-flight tasks.
        let pending: Vec<(u32, TaskId)> = self.entries[index].pending.drain().collect();
        for (_, task_id) in pending {
            let Some(error) = failure.clone() else {
                self.resolve_task(task_id, Err(TaskError::Terminated));
                continue;
            };
            let can_retry = error.is_retryable()
                && self
                    .tasks
                    .get(&task_id)
                    .is_some_and(|state| state.attempts < state.options.max_retries);
            if can_retry {
                self.schedule_retry(task_id, error);
            } else {
                self.resolve_task(task_id, Err(error));
            }
        }

        // Re-home queued deque work.
        let orphaned = self
            .stealer
            .as_mut()
            .map(|s| s.remove_executor(id))
            .unwrap_or_default();
        for slot in orphaned {
            let view = self.arena.view(slot);
            let live = self
                .tasks
                .get(&view.task_id)
                .is_some_and(|t| t.slot == Some(slot));
            if !live {
                self.arena.release(slot);
                continue;
            }
            match self.shared.push(view.priority, slot) {
                Ok(()) => {
                    if let Some(state) = self.tasks.get_mut(&view.task_id) {
                        state.location = match self.shared {
                            SharedQueue::Ring(_) => TaskLocation::Ring,
                            SharedQueue::Discipline(_) => TaskLocation::Shared,
                        };
                    }
                }
                Err(slot) => {
                    let task_id = view.task_id;
                    self.arena.release(slot);
                    self.resolve_task(task_id, Err(TaskError::Cancelled));
                }
            }
        }

        self.policy.on_executor_removed(id);
        if let Some(router) = self.router.as_mut() {
            router.remove_executor(id);
        }
        self.policy_per_executor.remove(&id.0);

        let entry = self.entries.remove(index);
        let _ = entry.outbound.send(IoCommand::Kill);
        drop(entry.pump);
    }

    fn handle_closed(&mut self, executor: ExecutorId, reason: String) {
        let Some(index) = self.index_of(executor) else {
            return;
        };
        if self.entries[index].expected_close {
            self.events
                .emit(PoolEvent::ExecutorTerminated { executor: executor.0 });
            self.remove_executor(index, None);
            return;
        }

        tracing::warn!(executor = executor.0, %reason, "executor lost");
        self.events.emit(PoolEvent::ExecutorCrashed {
            executor: executor.0,
            reason: reason.clone(),
        });
        self.remove_executor(
            index,
            Some(TaskError::WorkerCrashed {
                executor: executor.0,
                reason,
            }),
        );

        // Keep the floor: replace crashed executors while running.
        if matches!(self.lifecycle, Lifecycle::Running) {
            let live = self
                .entries
                .iter()
                .filter(|e| e.record.state.accepts_tasks())
                .count();
            if live + self.spawning as usize + 1 <= self.config.min_workers {
                self.spawn_executor();
            }
        }
    }

    fn handle_corrupt(&mut self, executor: ExecutorId, error: WireError) {
        if error.is_fatal() {
            self.poison(format!("corrupt frame from {executor}: {error}"));
        }
    }

    /// Fatal protocol failure: every future fails, the pool must be
    /// recreated.
    fn poison(&mut self, reason: String) {
        tracing::error!(%reason, "pool poisoned");
        self.events.emit(PoolEvent::Poisoned {
            reason: reason.clone(),
        });
        let task_ids: Vec<TaskId> = self.tasks.keys().copied().collect();
        for task_id in task_ids {
            self.resolve_task(task_id, Err(TaskError::Terminated));
        }
        while let Some(blocked) = self.blocked.pop_front() {
            let _ = blocked.ack.send(Err(SubmitError::Poisoned(reason.clone())));
        }
        self.kill_all_executors();
        if let Lifecycle::Draining { replies, .. } = std::mem::replace(
            &mut self.lifecycle,
            Lifecycle::Poisoned(reason.clone()),
        ) {
            for reply in replies {
                let _ = reply.send(Err(PoolError::Poisoned(reason.clone())));
            }
        }
    }

    // -------------------------------------------------------------------
    // Heartbeats
    // -------------------------------------------------------------------

    fn handle_heartbeat_tick(&mut self) {
        if !self.config.heartbeat.enabled {
            return;
        }
        let now = Instant::now();
        let config = self.config.heartbeat;

        for index in 0..self.entries.len() {
            let state = self.entries[index].record.state;
            if !(state.accepts_tasks() || state == ExecutorState::Unresponsive) {
                continue;
            }

            let action = self.entries[index].probe.on_tick(now, &config);
            self.entries[index].record.missed_heartbeats = self.entries[index].probe.missed();

            if action == ProbeAction::MarkUnresponsive && state.accepts_tasks() {
                self.mark_unresponsive(index);
            }

            let msg_id = self.alloc_msg_id();
            let sequence = self.entries[index].next_sequence();
            let envelope = Envelope::new(msg_id, sequence, Priority::High, Body::HeartbeatReq);
            if let Ok(bytes) = envelope.encode() {
                let _ = self.entries[index].outbound.send(IoCommand::Frame(bytes));
            }
        }
    }

    fn mark_unresponsive(&mut self, index: usize) {
        let id = self.entries[index].id;
        let missed = self.entries[index].probe.missed();
        self.entries[index].record.transition(ExecutorState::Unresponsive);
        self.events.emit(PoolEvent::ExecutorUnresponsive {
            executor: id.0,
            missed,
        });

        // Fail its in-flight tasks; retry-eligible ones reschedule.
        let pending: Vec<(u32, TaskId)> = self.entries[index].pending.drain().collect();
        self.entries[index].record.active_tasks = 0;
        for (_, task_id) in pending {
            let error = TaskError::WorkerUnresponsive { executor: id.0 };
            let can_retry = self
                .tasks
                .get(&task_id)
                .is_some_and(|state| state.attempts < state.options.max_retries);
            if can_retry {
                self.schedule_retry(task_id, error);
            } else {
                self.resolve_task(task_id, Err(error));
            }
        }

        // Ask for a replacement so capacity recovers.
        if matches!(self.lifecycle, Lifecycle::Running) {
            let live = self
                .entries
                .iter()
                .filter(|e| e.record.state.accepts_tasks())
                .count();
            if live + (self.spawning as usize) < self.config.min_workers {
                self.spawn_executor();
            }
        }
    }

    // -------------------------------------------------------------------
    // Scaling and rebalancing
    // -------------------------------------------------------------------

    fn scale_cooldown_over(&self, now: Instant) -> bool {
        self.last_scale
            .is_none_or(|at| now.duration_since(at) >= self.config.scaler.cooldown)
    }

    fn handle_scale_up(&mut self, count: u32, reason: String) {
        if !matches!(self.lifecycle, Lifecycle::Running) {
            return;
        }
        let now = Instant::now();
        if !self.scale_cooldown_over(now) {
            return;
        }
        let current = self.entries.len() + self.spawning as usize;
        let headroom = self.config.max_workers.saturating_sub(current);
        let effective = (count as usize).min(headroom) as u32;
        if effective == 0 {
            return;
        }

        for _ in 0..effective {
            self.spawn_executor();
        }
        self.last_scale = Some(now);
        self.scaling.scale_ups += 1;
        self.events.emit(PoolEvent::ScaledUp {
            count: effective,
            reason,
        });
    }

    fn handle_scale_down(&mut self, count: u32, reason: String) {
        if !matches!(self.lifecycle, Lifecycle::Running) {
            return;
        }
        let now = Instant::now();
        if !self.scale_cooldown_over(now) {
            return;
        }

        let live = self
            .entries
            .iter()
            .filter(|e| e.record.state.accepts_tasks())
            .count();
        let removable = live.saturating_sub(self.config.min_workers);
        let target = (count as usize).min(removable);
        if target == 0 {
            return;
        }

        // Candidates: idle long enough, nothing queued locally.
        let idle_timeout = self.config.scaler.scale_down_idle_timeout;
        let mut victims: Vec<usize> = Vec::new();
        for (index, entry) in self.entries.iter().enumerate() {
            if victims.len() >= target {
                break;
            }
            let idle_since = entry
                .record
                .last_task_end
                .unwrap_or(entry.record.started_at);
            let deque_empty = self
                .stealer
                .as_ref()
                .map_or(true, |s| s.queued_for(entry.id) == 0);
            if entry.record.state.accepts_tasks()
                && entry.record.active_tasks == 0
                && deque_empty
                && now.duration_since(idle_since) >= idle_timeout
            {
                victims.push(index);
            }
        }
        if victims.is_empty() {
            return;
        }

        let removed = victims.len() as u32;
        // Remove from the highest index down so positions stay valid.
        victims.sort_unstable_by(|a, b| b.cmp(a));
        for index in victims {
            self.shut_executor(index);
        }
        self.last_scale = Some(now);
        self.scaling.scale_downs += 1;
        self.events.emit(PoolEvent::ScaledDown {
            count: removed,
            reason,
        });
    }

    /// Graceful single-executor shutdown: terminate frame, kill, removal.
    fn shut_executor(&mut self, index: usize) {
        let id = self.entries[index].id;
        {
            let entry = &mut self.entries[index];
            entry.expected_close = true;
            if entry.record.state.can_transition_to(ExecutorState::Terminating) {
                entry.record.transition(ExecutorState::Terminating);
            }
            let sequence = entry.next_sequence();
            let envelope = Envelope::new(0, sequence, Priority::Critical, Body::Terminate);
            if let Ok(bytes) = envelope.encode() {
                let _ = entry.outbound.send(IoCommand::Frame(bytes));
            }
            let _ = entry.outbound.send(IoCommand::Kill);
        }
        self.events.emit(PoolEvent::ExecutorTerminated { executor: id.0 });
        self.remove_executor(index, None);
    }

    fn handle_rebalance_tick(&mut self) {
        let Some(stealer) = self.stealer.as_mut() else {
            return;
        };
        let Some((recipient, slots)) = stealer.rebalance(Instant::now()) else {
            return;
        };
        let moved = slots.len() as u64;
        for slot in &slots {
            let view = self.arena.view(*slot);
            let live = self
                .tasks
                .get(&view.task_id)
                .is_some_and(|t| t.slot == Some(*slot));
            if !live {
                self.arena.release(*slot);
                continue;
            }
            let pushed = self
                .stealer
                .as_ref()
                .and_then(|s| s.deque(recipient))
                .is_some_and(|deque| deque.push_bottom(*slot).is_ok());
            if pushed {
                if let Some(state) = self.tasks.get_mut(&view.task_id) {
                    state.location = TaskLocation::Deque(recipient);
                }
            } else if self.shared.push(view.priority, *slot).is_err() {
                let task_id = view.task_id;
                self.arena.release(*slot);
                self.resolve_task(task_id, Err(TaskError::Cancelled));
            }
        }
        self.events.emit(PoolEvent::Rebalanced { moved });
    }

    // -------------------------------------------------------------------
    // Termination
    // -------------------------------------------------------------------

    fn handle_terminate(
        &mut self,
        force: bool,
        timeout: Option<Duration>,
        reply: oneshot::Sender<Result<(), PoolError>>,
    ) {
        match &mut self.lifecycle {
            Lifecycle::Terminated => {
                let _ = reply.send(Ok(()));
            }
            Lifecycle::Poisoned(reason) => {
                let _ = reply.send(Err(PoolError::Poisoned(reason.clone())));
            }
            Lifecycle::Draining { replies, .. } => {
                replies.push(reply);
                if force {
                    self.finish_terminate(true);
                }
            }
            Lifecycle::Running => {
                // Queued-but-undispatched tasks resolve immediately.
                let queued: Vec<TaskId> = self
                    .tasks
                    .iter()
                    .filter(|(_, state)| {
                        !matches!(state.location, TaskLocation::Dispatched { .. })
                    })
                    .map(|(id, _)| *id)
                    .collect();
                for task_id in queued {
                    self.resolve_task(task_id, Err(TaskError::Terminated));
                }
                while let Some(blocked) = self.blocked.pop_front() {
                    let _ = blocked.ack.send(Err(SubmitError::Terminated));
                }
                self.drain_queues();

                if force {
                    self.lifecycle = Lifecycle::Draining {
                        replies: vec![reply],
                        deadline: Instant::now(),
                    };
                    self.finish_terminate(true);
                    return;
                }

                // Ask executors to drain; bounded by the cleanup timeout.
                let deadline =
                    Instant::now() + timeout.unwrap_or(self.config.cleanup_timeout);
                for index in 0..self.entries.len() {
                    let sequence = self.entries[index].next_sequence();
                    let envelope =
                        Envelope::new(0, sequence, Priority::Critical, Body::CleanupReq);
                    if let Ok(bytes) = envelope.encode() {
                        let _ = self.entries[index].outbound.send(IoCommand::Frame(bytes));
                    }
                    if self.entries[index]
                        .record
                        .state
                        .can_transition_to(ExecutorState::Cleaning)
                    {
                        self.entries[index].record.transition(ExecutorState::Cleaning);
                    }
                }
                self.timers.push(Reverse((deadline, TimerKind::DrainDeadline)));
                self.lifecycle = Lifecycle::Draining {
                    replies: vec![reply],
                    deadline,
                };
                self.check_drained();
            }
        }
    }

    /// Releases every queued slot reference.
    fn drain_queues(&mut self) {
        while let Some(slot) = self.shared.pop() {
            self.arena.release(slot);
        }
        if let Some(stealer) = self.stealer.as_mut() {
            let ids: Vec<ExecutorId> = self.entries.iter().map(|e| e.id).collect();
            for id in ids {
                if let Some(deque) = stealer.deque(id) {
                    let deque = Arc::clone(deque);
                    while let Some(slot) = deque.pop_bottom() {
                        self.arena.release(slot);
                    }
                }
            }
        }
    }

    fn check_drained(&mut self) {
        let drained = self.entries.iter().all(|entry| entry.pending.is_empty());
        if drained {
            self.finish_terminate(false);
        }
    }

    fn finish_terminate(&mut self, forced: bool) {
        // Any straggling tasks fail now.
        let task_ids: Vec<TaskId> = self.tasks.keys().copied().collect();
        for task_id in task_ids {
            self.resolve_task(task_id, Err(TaskError::Terminated));
        }
        self.kill_all_executors();

        let previous = std::mem::replace(&mut self.lifecycle, Lifecycle::Terminated);
        if let Lifecycle::Draining { replies, .. } = previous {
            for reply in replies {
                let _ = reply.send(Ok(()));
            }
        }
        self.events.emit(PoolEvent::Terminated { forced });
        self.publish_load();
    }

    fn kill_all_executors(&mut self) {
        while !self.entries.is_empty() {
            let index = self.entries.len() - 1;
            {
                let entry = &mut self.entries[index];
                entry.expected_close = true;
                if entry
                    .record
                    .state
                    .can_transition_to(ExecutorState::Terminating)
                {
                    entry.record.transition(ExecutorState::Terminating);
                }
                let sequence = entry.next_sequence();
                let envelope = Envelope::new(0, sequence, Priority::Critical, Body::Terminate);
                if let Ok(bytes) = envelope.encode() {
                    let _ = entry.outbound.send(IoCommand::Frame(bytes));
                }
                let _ = entry.outbound.send(IoCommand::Kill);
            }
            self.remove_executor(index, None);
        }
    }

    // -------------------------------------------------------------------
    // Introspection
    // -------------------------------------------------------------------

    fn queued_total(&self) -> usize {
        self.shared.len()
            + self.stealer.as_ref().map_or(0, StealScheduler::total_queued)
            + self.blocked.len()
    }

    fn publish_load(&mut self) {
        let active: u32 = self.entries.iter().map(|e| e.record.active_tasks).sum();
        let workers = self
            .entries
            .iter()
            .filter(|e| e.record.state.accepts_tasks())
            .count() as u32
            + self.spawning;
        let idle_workers = self
            .entries
            .iter()
            .filter(|e| e.record.state.accepts_tasks() && e.record.active_tasks == 0)
            .count() as u32;
        self.load.write(LoadSnapshot {
            queued: self.queued_total() as u32,
            active,
            workers,
            idle_workers,
            closed: !matches!(self.lifecycle, Lifecycle::Running),
        });
    }

    fn build_stats(&self) -> PoolStats {
        let mut workers = WorkerCounts {
            // Executors whose factory call has not come back yet.
            warming: self.spawning,
            ..Default::default()
        };
        let mut executors = Vec::with_capacity(self.entries.len());
        for entry in &self.entries {
            match entry.record.state {
                ExecutorState::Cold => workers.cold += 1,
                ExecutorState::Warming => workers.warming += 1,
                ExecutorState::Ready => workers.ready += 1,
                ExecutorState::Busy => workers.busy += 1,
                ExecutorState::Cleaning => workers.cleaning += 1,
                ExecutorState::Terminating => workers.terminating += 1,
                ExecutorState::Terminated => workers.terminated += 1,
                ExecutorState::Unresponsive => workers.unresponsive += 1,
            }
            executors.push(ExecutorStats {
                id: entry.id.0,
                state: entry.record.state.name().to_string(),
                active_tasks: entry.record.active_tasks,
                total_completed: entry.record.total_completed,
                total_busy_ms: entry.record.total_execution_time.as_millis() as u64,
                weight: entry.record.weight,
                affinity_load: entry.record.affinity_load,
                missed_heartbeats: entry.record.missed_heartbeats,
            });
        }

        let mut per_executor: Vec<(u32, u64)> = self
            .policy_per_executor
            .iter()
            .map(|(&id, &n)| (id, n))
            .collect();
        per_executor.sort_unstable();

        PoolStats {
            workers,
            queued_tasks: self.queued_total() as u64,
            active_tasks: self.entries.iter().map(|e| u64::from(e.record.active_tasks)).sum(),
            tasks: self.counters,
            policy: PolicyStats {
                name: self.policy.name().to_string(),
                selections: self.policy_selections,
                per_executor,
            },
            steal: self
                .stealer
                .as_ref()
                .map(StealScheduler::stats)
                .unwrap_or_default(),
            scaling: self.scaling,
            executors,
        }
    }
}
