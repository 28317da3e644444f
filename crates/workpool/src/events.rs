//! Structured pool event stream.
//!
//! Every lifecycle transition, scaling decision, and error category emits
//! one event on a broadcast channel. The host subscribes for observability;
//! nothing in the pool depends on anyone listening.

use serde::Serialize;
use tokio::sync::broadcast;

/// A structured pool event.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PoolEvent {
    ExecutorSpawned { executor: u32 },
    ExecutorTerminated { executor: u32 },
    ExecutorCrashed { executor: u32, reason: String },
    ExecutorUnresponsive { executor: u32, missed: u32 },
    ExecutorRecovered { executor: u32 },
    ScaledUp { count: u32, reason: String },
    ScaledDown { count: u32, reason: String },
    QueuePressure { queued: u64, applied: String },
    TaskRetried { task_id: u64, attempt: u32 },
    TaskFailed { task_id: u64, code: u16 },
    Rebalanced { moved: u64 },
    Poisoned { reason: String },
    Terminated { forced: bool },
}

/// Cloneable emitter over a broadcast channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<PoolEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Emits an event; silently dropped when no subscriber listens.
    pub fn emit(&self, event: PoolEvent) {
        let _ = self.sender.send(event);
    }

    /// Opens a new subscription starting at the current position.
    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn events_reach_subscribers() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        bus.emit(PoolEvent::ExecutorSpawned { executor: 3 });
        match rx.recv().await.unwrap() {
            PoolEvent::ExecutorSpawned { executor } => assert_eq!(executor, 3),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn events_serialize_tagged() {
        let json = serde_json::to_string(&PoolEvent::ScaledUp {
            count: 2,
            reason: "load 4.0".into(),
        })
        .unwrap();
        assert!(json.contains("\"kind\":\"scaled_up\""));
        assert!(json.contains("\"count\":2"));
    }

    #[test]
    fn emit_without_subscribers_is_fine() {
        let bus = EventBus::new(4);
        bus.emit(PoolEvent::Terminated { forced: false });
    }
}
