//! Adaptive scaling: a background evaluator that proposes grow/shrink
//! actions from a published load snapshot.
//!
//! The evaluator only proposes. The dispatch loop, which owns executor
//! records, enforces worker bounds, per-executor idle timeouts, and the
//! scaling cooldown before acting, and emits the scaling events.

use crate::config::ScalerConfig;
use crate::pool::PoolCommand;
use std::sync::Arc;
use taskring::SeqLock;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Copy snapshot of pool load, published by the dispatch loop after every
/// material change.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct LoadSnapshot {
    pub queued: u32,
    pub active: u32,
    pub workers: u32,
    pub idle_workers: u32,
    /// Set once the pool begins terminating; stops the evaluator.
    pub closed: bool,
}

/// What the evaluator wants done.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ScaleDecision {
    Up { count: u32, reason: String },
    Down { count: u32, reason: String },
    Hold,
}

/// Pure evaluation of one snapshot against the thresholds.
pub(crate) fn evaluate(
    config: &ScalerConfig,
    snapshot: LoadSnapshot,
    min_workers: u32,
    max_workers: u32,
) -> ScaleDecision {
    let backlog = snapshot.queued + snapshot.active;

    // A pool with zero workers and pending work always wants one.
    if snapshot.workers == 0 {
        if backlog > 0 && max_workers > 0 {
            return ScaleDecision::Up {
                count: config.scale_up_step.min(max_workers),
                reason: "no workers for pending tasks".into(),
            };
        }
        return ScaleDecision::Hold;
    }

    let load_ratio = f64::from(backlog) / f64::from(snapshot.workers);
    if load_ratio >= config.scale_up_threshold && snapshot.workers < max_workers {
        let headroom = max_workers - snapshot.workers;
        return ScaleDecision::Up {
            count: config.scale_up_step.min(headroom),
            reason: format!("load ratio {load_ratio:.2}"),
        };
    }

    if snapshot.queued == 0 && snapshot.idle_workers > 0 && snapshot.workers > min_workers {
        let excess = snapshot.workers - min_workers;
        return ScaleDecision::Down {
            count: config.scale_down_step.min(excess).min(snapshot.idle_workers),
            reason: "idle workers above minimum".into(),
        };
    }

    ScaleDecision::Hold
}

/// Spawns the evaluation loop. Exits when the pool closes or the command
/// channel is gone.
pub(crate) fn spawn_scaler(
    config: ScalerConfig,
    min_workers: u32,
    max_workers: u32,
    load: Arc<SeqLock<LoadSnapshot>>,
    commands: mpsc::UnboundedSender<PoolCommand>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(config.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            let snapshot = load.read();
            if snapshot.closed {
                break;
            }
            let command = match evaluate(&config, snapshot, min_workers, max_workers) {
                ScaleDecision::Up { count, reason } => PoolCommand::ScaleUp { count, reason },
                ScaleDecision::Down { count, reason } => PoolCommand::ScaleDown { count, reason },
                ScaleDecision::Hold => continue,
            };
            if commands.send(command).is_err() {
                break;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ScalerConfig {
        ScalerConfig::default()
    }

    #[test]
    fn grows_past_threshold() {
        let snapshot = LoadSnapshot {
            queued: 6,
            active: 2,
            workers: 2,
            idle_workers: 0,
            closed: false,
        };
        // (6 + 2) / 2 = 4.0 >= 2.0
        match evaluate(&config(), snapshot, 2, 8) {
            ScaleDecision::Up { count, .. } => assert_eq!(count, 1),
            other => panic!("expected scale-up, got {other:?}"),
        }
    }

    #[test]
    fn respects_max_workers() {
        let snapshot = LoadSnapshot {
            queued: 100,
            active: 8,
            workers: 8,
            idle_workers: 0,
            closed: false,
        };
        assert_eq!(evaluate(&config(), snapshot, 2, 8), ScaleDecision::Hold);
    }

    #[test]
    fn shrinks_when_idle_above_min() {
        let snapshot = LoadSnapshot {
            queued: 0,
            active: 1,
            workers: 4,
            idle_workers: 3,
            closed: false,
        };
        match evaluate(&config(), snapshot, 2, 8) {
            ScaleDecision::Down { count, .. } => assert_eq!(count, 1),
            other => panic!("expected scale-down, got {other:?}"),
        }
    }

    #[test]
    fn holds_at_min_workers() {
        let snapshot = LoadSnapshot {
            queued: 0,
            active: 0,
            workers: 2,
            idle_workers: 2,
            closed: false,
        };
        assert_eq!(evaluate(&config(), snapshot, 2, 8), ScaleDecision::Hold);
    }

    #[test]
    fn zero_workers_with_backlog_grows() {
        let snapshot = LoadSnapshot {
            queued: 1,
            active: 0,
            workers: 0,
            idle_workers: 0,
            closed: false,
        };
        assert!(matches!(
            evaluate(&config(), snapshot, 0, 4),
            ScaleDecision::Up { .. }
        ));
    }
}
