//! In-process executor: the reference [`ExecutorTransport`] implementation.
//!
//! Runs registered methods on the blocking thread pool inside the same
//! process. The test suite drives the pool with it, and the `caller-runs`
//! back-pressure policy shares its [`MethodRegistry`]. Opaque serialized
//! function bodies arriving on the wire are rejected with `MethodNotFound`
//! unless a method of that name was registered.

use crate::error::{TaskError, TransportError};
use crate::executor::{ExecutorFactory, ExecutorId, ExecutorTransport, ExecutorTransportBoxed};
use crate::task::TaskResult;
use poolwire::{
    Body, Envelope, ErrorBody, FrameHeader, HeartbeatStatus, HeartbeatSummary, Priority,
    TaskFailure, TaskReply, TaskSubmission, HEADER_LEN,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Errors a registered method may raise.
#[derive(Debug, Clone)]
pub enum MethodError {
    /// The parameter bytes did not decode to what the method expects.
    InvalidParams(String),
    /// The method body failed.
    Failed { message: String },
}

type MethodFn = dyn Fn(&[u8]) -> Result<Vec<u8>, MethodError> + Send + Sync + 'static;

/// A named handler resolved from the registry.
#[derive(Clone)]
pub struct RegisteredMethod {
    handler: Arc<MethodFn>,
}

impl RegisteredMethod {
    /// Runs the handler, mapping method errors into task errors.
    pub fn invoke(&self, params: &[u8]) -> TaskResult {
        (self.handler)(params).map_err(|error| match error {
            MethodError::InvalidParams(message) => TaskError::InvalidParams(message),
            MethodError::Failed { message } => TaskError::ExecutionFailed {
                message,
                stack: String::new(),
            },
        })
    }
}

/// Name → handler table shared by local executors.
#[derive(Default)]
pub struct MethodRegistry {
    methods: RwLock<HashMap<String, Arc<MethodFn>>>,
}

impl MethodRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or replaces) a handler under `name`.
    pub fn register<F>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(&[u8]) -> Result<Vec<u8>, MethodError> + Send + Sync + 'static,
    {
        self.methods
            .write()
            .expect("method registry poisoned")
            .insert(name.into(), Arc::new(handler));
    }

    /// Resolves a handler by name.
    pub fn lookup(&self, name: &str) -> Option<RegisteredMethod> {
        self.methods
            .read()
            .expect("method registry poisoned")
            .get(name)
            .map(|handler| RegisteredMethod {
                handler: Arc::clone(handler),
            })
    }
}

impl std::fmt::Debug for MethodRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<String> = self
            .methods
            .read()
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default();
        f.debug_struct("MethodRegistry").field("methods", &names).finish()
    }
}

// -----------------------------------------------------------------------------
// Worker loop
// -----------------------------------------------------------------------------

struct WorkerDomain {
    registry: Arc<MethodRegistry>,
    inbound: mpsc::UnboundedReceiver<Vec<u8>>,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    sequence: Arc<AtomicU32>,
    started_at: Instant,
    running: HashMap<u32, JoinHandle<()>>,
}

impl WorkerDomain {
    async fn run(mut self) {
        while let Some(bytes) = self.inbound.recv().await {
            let envelope = match Envelope::decode(&bytes) {
                Ok(envelope) => envelope,
                // A malformed frame from the pool side; drop it. The pool's
                // own codec already validated outbound frames.
                Err(_) => continue,
            };

            match envelope.body {
                Body::TaskRequest(task) => self.spawn_task(envelope.id, task),
                Body::Batch(chunk) => {
                    for inner in split_chunk(&chunk.tasks) {
                        if let Body::TaskRequest(task) = inner.body {
                            self.spawn_task(inner.id, task);
                        }
                    }
                }
                Body::HeartbeatReq => {
                    self.reap_finished();
                    let summary = HeartbeatSummary {
                        status: HeartbeatStatus::Healthy,
                        task_count: self.running.len() as u32,
                        memory_bytes: 0,
                        uptime_ms: self.started_at.elapsed().as_millis() as u64,
                    };
                    self.reply(envelope.id, Body::HeartbeatRes(summary));
                }
                Body::CleanupReq => {
                    // Abort the addressed task if it is still running.
                    let drained = match self.running.remove(&envelope.id) {
                        Some(handle) => {
                            handle.abort();
                            true
                        }
                        None => true,
                    };
                    self.reply(envelope.id, Body::CleanupRes { drained });
                }
                Body::Terminate => {
                    for (_, handle) in self.running.drain() {
                        handle.abort();
                    }
                    return;
                }
                // Replies and events never flow pool → worker.
                Body::TaskResponse(_)
                | Body::TaskError(_)
                | Body::Event(_)
                | Body::HeartbeatRes(_)
                | Body::CleanupRes { .. }
                | Body::StreamChunk(_) => {}
            }
        }
    }

    fn spawn_task(&mut self, id: u32, task: TaskSubmission) {
        self.reap_finished();

        let registry = Arc::clone(&self.registry);
        let outbound = self.outbound.clone();
        let sequence = Arc::clone(&self.sequence);

        let handle = tokio::spawn(async move {
            let result = match registry.lookup(&task.method) {
                Some(handler) => {
                    let params = task.params;
                    tokio::task::spawn_blocking(move || handler.invoke(&params))
                        .await
                        .unwrap_or_else(|join| {
                            Err(TaskError::ExecutionFailed {
                                message: format!("task panicked: {join}"),
                                stack: String::new(),
                            })
                        })
                }
                None => Err(TaskError::MethodNotFound(task.method.clone())),
            };

            let body = match result {
                Ok(result) => Body::TaskResponse(TaskReply { result }),
                Err(error) => Body::TaskError(TaskFailure {
                    error: ErrorBody {
                        code: error.code(),
                        message: error.to_string(),
                        stack: String::new(),
                    },
                }),
            };

            let envelope = Envelope::new(
                id,
                sequence.fetch_add(1, Ordering::Relaxed),
                Priority::Normal,
                body,
            );
            if let Ok(frame) = envelope.encode() {
                let _ = outbound.send(frame);
            }
        });

        self.running.insert(id, handle);
    }

    fn reply(&self, id: u32, body: Body) {
        let envelope = Envelope::new(
            id,
            self.sequence.fetch_add(1, Ordering::Relaxed),
            Priority::Normal,
            body,
        );
        if let Ok(frame) = envelope.encode() {
            let _ = self.outbound.send(frame);
        }
    }

    fn reap_finished(&mut self) {
        self.running.retain(|_, handle| !handle.is_finished());
    }
}

/// Walks the concatenated envelopes inside a batch chunk.
fn split_chunk(tasks: &[u8]) -> Vec<Envelope> {
    let mut envelopes = Vec::new();
    let mut offset = 0;
    while offset + HEADER_LEN <= tasks.len() {
        let Ok(header) = FrameHeader::decode(&tasks[offset..]) else {
            break;
        };
        let total = HEADER_LEN + header.payload_length as usize;
        let Some(slice) = tasks.get(offset..offset + total) else {
            break;
        };
        match Envelope::decode(slice) {
            Ok(envelope) => envelopes.push(envelope),
            Err(_) => break,
        }
        offset += total;
    }
    envelopes
}

// -----------------------------------------------------------------------------
// Transport
// -----------------------------------------------------------------------------

/// In-process executor transport backed by a pair of frame channels.
pub struct LocalExecutor {
    registry: Arc<MethodRegistry>,
    to_worker: mpsc::UnboundedSender<Vec<u8>>,
    worker_inbound: Option<mpsc::UnboundedReceiver<Vec<u8>>>,
    from_worker: mpsc::UnboundedReceiver<Vec<u8>>,
    worker_outbound: Option<mpsc::UnboundedSender<Vec<u8>>>,
    worker: Option<JoinHandle<()>>,
}

impl LocalExecutor {
    pub fn new(registry: Arc<MethodRegistry>) -> Self {
        let (to_worker, worker_inbound) = mpsc::unbounded_channel();
        let (worker_outbound, from_worker) = mpsc::unbounded_channel();
        Self {
            registry,
            to_worker,
            worker_inbound: Some(worker_inbound),
            from_worker,
            worker_outbound: Some(worker_outbound),
            worker: None,
        }
    }
}

impl ExecutorTransport for LocalExecutor {
    async fn start(&mut self) -> Result<(), TransportError> {
        let inbound = self
            .worker_inbound
            .take()
            .ok_or_else(|| TransportError::Spawn("executor already started".into()))?;
        let outbound = self
            .worker_outbound
            .take()
            .ok_or_else(|| TransportError::Spawn("executor already started".into()))?;

        let domain = WorkerDomain {
            registry: Arc::clone(&self.registry),
            inbound,
            outbound,
            sequence: Arc::new(AtomicU32::new(0)),
            started_at: Instant::now(),
            running: HashMap::new(),
        };
        self.worker = Some(tokio::spawn(domain.run()));
        Ok(())
    }

    async fn send(&mut self, frame: Vec<u8>) -> Result<(), TransportError> {
        self.to_worker
            .send(frame)
            .map_err(|_| TransportError::Closed)
    }

    async fn recv(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        Ok(self.from_worker.recv().await)
    }

    async fn kill(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.abort();
        }
    }
}

/// Spawns [`LocalExecutor`]s sharing one method registry.
pub struct LocalExecutorFactory {
    registry: Arc<MethodRegistry>,
}

impl LocalExecutorFactory {
    pub fn new(registry: Arc<MethodRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<MethodRegistry> {
        &self.registry
    }
}

impl ExecutorFactory for LocalExecutorFactory {
    async fn create(
        &self,
        _id: ExecutorId,
    ) -> Result<Box<dyn ExecutorTransportBoxed>, TransportError> {
        Ok(Box::new(LocalExecutor::new(Arc::clone(&self.registry))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use poolwire::MessageType;

    fn echo_registry() -> Arc<MethodRegistry> {
        let registry = Arc::new(MethodRegistry::new());
        registry.register("echo", |params| Ok(params.to_vec()));
        registry.register("fail", |_| {
            Err(MethodError::Failed {
                message: "expected failure".into(),
            })
        });
        registry
    }

    async fn round_trip(transport: &mut LocalExecutor, envelope: Envelope) -> Envelope {
        transport.send(envelope.encode().unwrap()).await.unwrap();
        let bytes = transport.recv().await.unwrap().unwrap();
        Envelope::decode(&bytes).unwrap()
    }

    #[tokio::test]
    async fn executes_registered_method() {
        let mut transport = LocalExecutor::new(echo_registry());
        transport.start().await.unwrap();

        let request = Envelope::new(
            7,
            0,
            Priority::Normal,
            Body::TaskRequest(TaskSubmission {
                method: "echo".into(),
                params: vec![1, 2, 3],
            }),
        );
        let reply = round_trip(&mut transport, request).await;
        assert_eq!(reply.id, 7);
        match reply.body {
            Body::TaskResponse(reply) => assert_eq!(reply.result, vec![1, 2, 3]),
            other => panic!("unexpected reply {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_method_is_rejected() {
        let mut transport = LocalExecutor::new(echo_registry());
        transport.start().await.unwrap();

        let request = Envelope::new(
            9,
            0,
            Priority::Normal,
            Body::TaskRequest(TaskSubmission {
                method: "missing".into(),
                params: Vec::new(),
            }),
        );
        let reply = round_trip(&mut transport, request).await;
        match reply.body {
            Body::TaskError(failure) => {
                assert_eq!(failure.error.code, poolwire::ErrorCode::METHOD_NOT_FOUND);
            }
            other => panic!("unexpected reply {other:?}"),
        }
    }

    #[tokio::test]
    async fn heartbeat_reports_running_count() {
        let mut transport = LocalExecutor::new(echo_registry());
        transport.start().await.unwrap();

        let request = Envelope::new(1, 0, Priority::Normal, Body::HeartbeatReq);
        let reply = round_trip(&mut transport, request).await;
        assert_eq!(reply.body.message_type(), MessageType::HeartbeatRes);
    }

    #[tokio::test]
    async fn batch_chunk_fans_out_replies() {
        let mut transport = LocalExecutor::new(echo_registry());
        transport.start().await.unwrap();

        let mut tasks = Vec::new();
        for id in [11u32, 12, 13] {
            let inner = Envelope::new(
                id,
                0,
                Priority::Normal,
                Body::TaskRequest(TaskSubmission {
                    method: "echo".into(),
                    params: vec![id as u8],
                }),
            );
            tasks.extend_from_slice(&inner.encode().unwrap());
        }
        let chunk = Envelope::new(
            100,
            0,
            Priority::Normal,
            Body::Batch(poolwire::BatchChunk {
                batch_id: "b".into(),
                task_count: 3,
                chunk_index: 0,
                total_chunks: 1,
                tasks,
            }),
        );
        transport.send(chunk.encode().unwrap()).await.unwrap();

        let mut ids = Vec::new();
        for _ in 0..3 {
            let bytes = transport.recv().await.unwrap().unwrap();
            let reply = Envelope::decode(&bytes).unwrap();
            match reply.body {
                Body::TaskResponse(r) => {
                    assert_eq!(r.result, vec![reply.id as u8]);
                    ids.push(reply.id);
                }
                other => panic!("unexpected reply {other:?}"),
            }
        }
        ids.sort_unstable();
        assert_eq!(ids, vec![11, 12, 13]);
    }
}
