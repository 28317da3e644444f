//! Executor handles: the transport contract, the per-worker state machine,
//! and the I/O pump that bridges a transport to the dispatch loop.

use crate::error::TransportError;
use poolwire::{Envelope, WireError};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use taskring::MpmcQueue;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

/// Stable executor identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExecutorId(pub u32);

impl std::fmt::Display for ExecutorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// Per-executor lifecycle state.
///
/// `Cold → Warming → Ready ↔ Busy → Terminating → Terminated`, with
/// `Cleaning` entered while draining at shutdown and `Unresponsive` set by
/// the heartbeat monitor. Transitions are private to the dispatch loop
/// except the terminal one, which is published through the event stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorState {
    Cold,
    Warming,
    Ready,
    Busy,
    Cleaning,
    Terminating,
    Terminated,
    Unresponsive,
}

impl ExecutorState {
    /// Whether the executor may be handed new tasks.
    pub fn accepts_tasks(self) -> bool {
        matches!(self, Self::Ready | Self::Busy)
    }

    /// Whether the transition is a legal edge of the lifecycle.
    pub fn can_transition_to(self, next: Self) -> bool {
        use ExecutorState::*;
        matches!(
            (self, next),
            (Cold, Warming)
                | (Warming, Ready)
                | (Ready, Busy)
                | (Busy, Ready)
                | (Ready | Busy, Cleaning)
                | (Cleaning, Ready)
                | (Ready | Busy | Cleaning | Unresponsive, Terminating)
                | (Warming, Terminating)
                | (Terminating, Terminated)
                | (Ready | Busy, Unresponsive)
                | (Unresponsive, Ready)
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Cold => "cold",
            Self::Warming => "warming",
            Self::Ready => "ready",
            Self::Busy => "busy",
            Self::Cleaning => "cleaning",
            Self::Terminating => "terminating",
            Self::Terminated => "terminated",
            Self::Unresponsive => "unresponsive",
        }
    }
}

/// Bookkeeping record for one executor, owned by the dispatch loop.
#[derive(Debug)]
pub struct ExecutorRecord {
    pub state: ExecutorState,
    pub active_tasks: u32,
    pub total_completed: u64,
    pub total_execution_time: Duration,
    pub last_task_end: Option<Instant>,
    pub weight: u32,
    pub affinity_load: f64,
    pub last_heartbeat: Option<Instant>,
    pub missed_heartbeats: u32,
    pub started_at: Instant,
}

impl ExecutorRecord {
    pub fn new(weight: u32) -> Self {
        Self {
            state: ExecutorState::Cold,
            active_tasks: 0,
            total_completed: 0,
            total_execution_time: Duration::ZERO,
            last_task_end: None,
            weight,
            affinity_load: 0.0,
            last_heartbeat: None,
            missed_heartbeats: 0,
            started_at: Instant::now(),
        }
    }

    /// Applies a state transition, asserting legality in debug builds.
    pub fn transition(&mut self, next: ExecutorState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal executor transition {:?} -> {:?}",
            self.state,
            next
        );
        self.state = next;
    }
}

// -----------------------------------------------------------------------------
// Transport contract
// -----------------------------------------------------------------------------

/// The four operations the core needs from a worker in another protection
/// domain. Spawn mechanics (threads, processes, web workers) live behind
/// [`ExecutorFactory`]; the core only drives frames through this trait.
///
/// `recv` must be cancel-safe: the I/O pump drops and re-creates the recv
/// future around outbound sends.
pub trait ExecutorTransport: Send + 'static {
    /// Brings the worker up. Called once before any send/recv.
    fn start(&mut self) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Delivers one encoded frame to the worker.
    fn send(&mut self, frame: Vec<u8>) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Waits for the next frame from the worker; `Ok(None)` means the
    /// worker closed its end.
    fn recv(&mut self) -> impl Future<Output = Result<Option<Vec<u8>>, TransportError>> + Send;

    /// Tears the worker down immediately.
    fn kill(&mut self) -> impl Future<Output = ()> + Send;
}

/// Object-safe twin of [`ExecutorTransport`] for dynamic dispatch.
pub trait ExecutorTransportBoxed: Send {
    fn start_boxed(
        &mut self,
    ) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + '_>>;

    fn send_boxed(
        &mut self,
        frame: Vec<u8>,
    ) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + '_>>;

    fn recv_boxed(
        &mut self,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Vec<u8>>, TransportError>> + Send + '_>>;

    fn kill_boxed(&mut self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
}

impl<T: ExecutorTransport> ExecutorTransportBoxed for T {
    fn start_boxed(
        &mut self,
    ) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + '_>> {
        Box::pin(self.start())
    }

    fn send_boxed(
        &mut self,
        frame: Vec<u8>,
    ) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + '_>> {
        Box::pin(self.send(frame))
    }

    fn recv_boxed(
        &mut self,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Vec<u8>>, TransportError>> + Send + '_>> {
        Box::pin(self.recv())
    }

    fn kill_boxed(&mut self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(self.kill())
    }
}

/// Creates transports for new executors; the host decides what a worker is.
pub trait ExecutorFactory: Send + Sync + 'static {
    fn create(
        &self,
        id: ExecutorId,
    ) -> impl Future<Output = Result<Box<dyn ExecutorTransportBoxed>, TransportError>> + Send;
}

/// Object-safe twin of [`ExecutorFactory`].
pub trait ExecutorFactoryBoxed: Send + Sync {
    fn create_boxed(
        &self,
        id: ExecutorId,
    ) -> Pin<Box<dyn Future<Output = Result<Box<dyn ExecutorTransportBoxed>, TransportError>> + Send + '_>>;
}

impl<T: ExecutorFactory> ExecutorFactoryBoxed for T {
    fn create_boxed(
        &self,
        id: ExecutorId,
    ) -> Pin<Box<dyn Future<Output = Result<Box<dyn ExecutorTransportBoxed>, TransportError>> + Send + '_>>
    {
        Box::pin(self.create(id))
    }
}

// -----------------------------------------------------------------------------
// I/O pump
// -----------------------------------------------------------------------------

/// Outbound instructions to an executor's pump task.
#[derive(Debug)]
pub(crate) enum IoCommand {
    Frame(Vec<u8>),
    Kill,
}

/// Inbound notifications from pump tasks to the dispatch loop, carried on
/// the shared MPMC completion queue.
#[derive(Debug)]
pub(crate) enum IoEvent {
    Message {
        executor: ExecutorId,
        envelope: Envelope,
    },
    /// The transport delivered bytes the codec rejects.
    Corrupt {
        executor: ExecutorId,
        error: WireError,
    },
    /// The transport is gone; every in-flight task on it is failed.
    Closed {
        executor: ExecutorId,
        reason: String,
    },
}

enum PumpStep {
    Outbound(Option<IoCommand>),
    Inbound(Result<Option<Vec<u8>>, TransportError>),
}

/// Pushes an event onto the completion queue, yielding while it is full,
/// then wakes the dispatch loop.
pub(crate) async fn push_io_event(
    events: &MpmcQueue<IoEvent>,
    wake: &Notify,
    mut event: IoEvent,
) {
    loop {
        match events.push(event) {
            Ok(()) => break,
            Err(back) => {
                event = back;
                tokio::task::yield_now().await;
            }
        }
    }
    wake.notify_one();
}

/// Runs one executor's transport: forwards outbound frames, decodes inbound
/// ones, and reports closure. One pump task per executor.
pub(crate) fn spawn_io_pump(
    id: ExecutorId,
    mut transport: Box<dyn ExecutorTransportBoxed>,
    mut commands: mpsc::UnboundedReceiver<IoCommand>,
    events: Arc<MpmcQueue<IoEvent>>,
    wake: Arc<Notify>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(error) = transport.start_boxed().await {
            push_io_event(
                &events,
                &wake,
                IoEvent::Closed {
                    executor: id,
                    reason: format!("start failed: {error}"),
                },
            )
            .await;
            return;
        }

        loop {
            // The select only wraps values; the recv future (and its borrow
            // of the transport) is dropped before the step is handled.
            let step = tokio::select! {
                command = commands.recv() => PumpStep::Outbound(command),
                inbound = transport.recv_boxed() => PumpStep::Inbound(inbound),
            };

            match step {
                PumpStep::Outbound(Some(IoCommand::Frame(frame))) => {
                    if let Err(error) = transport.send_boxed(frame).await {
                        push_io_event(
                            &events,
                            &wake,
                            IoEvent::Closed {
                                executor: id,
                                reason: format!("send failed: {error}"),
                            },
                        )
                        .await;
                        break;
                    }
                }
                PumpStep::Outbound(Some(IoCommand::Kill)) | PumpStep::Outbound(None) => {
                    transport.kill_boxed().await;
                    break;
                }
                PumpStep::Inbound(Ok(Some(bytes))) => match Envelope::decode(&bytes) {
                    Ok(envelope) => {
                        push_io_event(
                            &events,
                            &wake,
                            IoEvent::Message {
                                executor: id,
                                envelope,
                            },
                        )
                        .await;
                    }
                    Err(error) => {
                        tracing::warn!(executor = id.0, %error, "undecodable frame");
                        let fatal = error.is_fatal();
                        push_io_event(&events, &wake, IoEvent::Corrupt { executor: id, error })
                            .await;
                        if fatal {
                            break;
                        }
                    }
                },
                PumpStep::Inbound(Ok(None)) => {
                    push_io_event(
                        &events,
                        &wake,
                        IoEvent::Closed {
                            executor: id,
                            reason: "transport closed".into(),
                        },
                    )
                    .await;
                    break;
                }
                PumpStep::Inbound(Err(error)) => {
                    push_io_event(
                        &events,
                        &wake,
                        IoEvent::Closed {
                            executor: id,
                            reason: error.to_string(),
                        },
                    )
                    .await;
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_edges() {
        use ExecutorState::*;
        assert!(Cold.can_transition_to(Warming));
        assert!(Warming.can_transition_to(Ready));
        assert!(Ready.can_transition_to(Busy));
        assert!(Busy.can_transition_to(Ready));
        assert!(Busy.can_transition_to(Unresponsive));
        assert!(Unresponsive.can_transition_to(Ready));
        assert!(Terminating.can_transition_to(Terminated));
        assert!(!Terminated.can_transition_to(Ready));
        assert!(!Cold.can_transition_to(Busy));
    }

    #[test]
    fn accepting_states() {
        assert!(ExecutorState::Ready.accepts_tasks());
        assert!(ExecutorState::Busy.accepts_tasks());
        assert!(!ExecutorState::Unresponsive.accepts_tasks());
        assert!(!ExecutorState::Terminating.accepts_tasks());
    }
}
