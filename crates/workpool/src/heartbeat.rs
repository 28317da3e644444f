//! Heartbeat monitoring: periodic liveness probes with a missed-counter
//! state machine per executor.
//!
//! The ticker task only emits `HeartbeatTick` commands; the dispatch loop
//! owns the per-executor [`ProbeState`]s, sends the actual probe frames,
//! and applies the unresponsive/recovered transitions.

use crate::config::HeartbeatConfig;
use crate::pool::PoolCommand;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// What the monitor should do for one executor on a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ProbeAction {
    /// Send a fresh heartbeat request.
    Probe,
    /// Send a probe and declare the executor unresponsive: the missed
    /// counter just reached the limit.
    MarkUnresponsive,
}

/// Per-executor probe bookkeeping.
#[derive(Debug, Default)]
pub(crate) struct ProbeState {
    /// When the outstanding (unanswered) probe was sent.
    outstanding: Option<Instant>,
    missed: u32,
}

impl ProbeState {
    /// Advances the state machine on a monitor tick.
    pub fn on_tick(&mut self, now: Instant, config: &HeartbeatConfig) -> ProbeAction {
        let mut newly_missed = false;
        if let Some(sent_at) = self.outstanding {
            if now.duration_since(sent_at) >= config.timeout {
                self.missed += 1;
                self.outstanding = None;
                newly_missed = true;
            }
        }

        // Keep probing even past the limit so a recovery can be observed.
        if self.outstanding.is_none() {
            self.outstanding = Some(now);
        }

        if newly_missed && self.missed >= config.max_missed {
            ProbeAction::MarkUnresponsive
        } else {
            ProbeAction::Probe
        }
    }

    /// Records a heartbeat response. One successful response clears the
    /// missed counter entirely.
    pub fn on_response(&mut self) {
        self.outstanding = None;
        self.missed = 0;
    }

    pub fn missed(&self) -> u32 {
        self.missed
    }
}

/// Spawns the tick task.
pub(crate) fn spawn_heartbeat(
    config: HeartbeatConfig,
    commands: mpsc::UnboundedSender<PoolCommand>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(config.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            if commands.send(PoolCommand::HeartbeatTick).is_err() {
                break;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn config() -> HeartbeatConfig {
        HeartbeatConfig {
            enabled: true,
            interval: Duration::from_secs(5),
            timeout: Duration::from_secs(3),
            max_missed: 3,
        }
    }

    #[test]
    fn declares_unresponsive_after_exact_miss_count() {
        let config = config();
        let mut state = ProbeState::default();
        let mut now = Instant::now();

        // First tick sends the initial probe.
        assert_eq!(state.on_tick(now, &config), ProbeAction::Probe);

        // Two unanswered intervals accumulate misses below the limit.
        for _ in 0..2 {
            now += config.interval;
            assert_eq!(state.on_tick(now, &config), ProbeAction::Probe);
        }
        assert_eq!(state.missed(), 2);

        // The third consecutive miss crosses the threshold.
        now += config.interval;
        assert_eq!(state.on_tick(now, &config), ProbeAction::MarkUnresponsive);
        assert_eq!(state.missed(), 3);
    }

    #[test]
    fn single_response_resets_the_counter() {
        let config = config();
        let mut state = ProbeState::default();
        let mut now = Instant::now();

        state.on_tick(now, &config);
        now += config.interval;
        state.on_tick(now, &config);
        assert_eq!(state.missed(), 1);

        state.on_response();
        assert_eq!(state.missed(), 0);

        // A fresh probe after recovery starts from zero misses.
        now += config.interval;
        assert_eq!(state.on_tick(now, &config), ProbeAction::Probe);
        assert_eq!(state.missed(), 0);
    }

    #[test]
    fn answered_probe_within_timeout_never_counts() {
        let config = config();
        let mut state = ProbeState::default();
        let now = Instant::now();

        state.on_tick(now, &config);
        state.on_response();
        // Next tick arrives with nothing outstanding.
        assert_eq!(
            state.on_tick(now + config.interval, &config),
            ProbeAction::Probe
        );
        assert_eq!(state.missed(), 0);
    }
}
