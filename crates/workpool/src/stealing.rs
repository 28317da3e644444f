//! Work-stealing scheduler: per-executor deques, victim selection, and the
//! rebalancer that shaves load off the deepest deque.
//!
//! Deques carry arena slot indices. The dispatch loop is the owner of
//! every deque (bottom operations); steal transactions go through the
//! thief-safe top, so the periodic rebalancer could run anywhere without
//! breaking the ownership rule.

use crate::config::StealConfig;
use crate::executor::ExecutorId;
use crate::stats::StealStats;
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use taskring::WorkDeque;

/// How a thief picks its victim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VictimStrategy {
    /// Deepest deque first; ties go to the least recently victimized.
    #[default]
    BusiestFirst,
    /// Uniform among non-empty deques.
    Random,
    /// Walk victims in order from a per-thief cursor.
    RoundRobin,
}

/// One attempt's bookkeeping.
const STEAL_RETRIES: usize = 3;

pub(crate) struct StealScheduler {
    config: StealConfig,
    deques: Vec<(ExecutorId, Arc<WorkDeque<u32>>)>,
    thief_cursor: HashMap<ExecutorId, usize>,
    last_attempt: HashMap<ExecutorId, Instant>,
    last_victimized: HashMap<ExecutorId, Instant>,
    attempts: u64,
    successes: u64,
    transferred: u64,
    by_thief: HashMap<ExecutorId, u64>,
    by_victim: HashMap<ExecutorId, u64>,
}

impl StealScheduler {
    pub fn new(config: StealConfig) -> Self {
        Self {
            config,
            deques: Vec::new(),
            thief_cursor: HashMap::new(),
            last_attempt: HashMap::new(),
            last_victimized: HashMap::new(),
            attempts: 0,
            successes: 0,
            transferred: 0,
            by_thief: HashMap::new(),
            by_victim: HashMap::new(),
        }
    }

    /// Registers an executor, creating its deque.
    pub fn add_executor(&mut self, id: ExecutorId) -> Arc<WorkDeque<u32>> {
        let deque = Arc::new(WorkDeque::with_capacity(self.config.deque_capacity));
        self.deques.push((id, Arc::clone(&deque)));
        deque
    }

    /// Unregisters an executor, draining whatever its deque still holds.
    pub fn remove_executor(&mut self, id: ExecutorId) -> Vec<u32> {
        let mut orphaned = Vec::new();
        if let Some(position) = self.deques.iter().position(|(e, _)| *e == id) {
            let (_, deque) = self.deques.remove(position);
            while let Some(slot) = deque.pop_bottom() {
                orphaned.push(slot);
            }
        }
        self.thief_cursor.remove(&id);
        self.last_attempt.remove(&id);
        self.last_victimized.remove(&id);
        orphaned
    }

    pub fn deque(&self, id: ExecutorId) -> Option<&Arc<WorkDeque<u32>>> {
        self.deques
            .iter()
            .find(|(e, _)| *e == id)
            .map(|(_, deque)| deque)
    }

    pub fn queued_for(&self, id: ExecutorId) -> usize {
        self.deque(id).map_or(0, |deque| deque.len())
    }

    pub fn total_queued(&self) -> usize {
        self.deques.iter().map(|(_, deque)| deque.len()).sum()
    }

    fn pick_victim(&mut self, thief: ExecutorId) -> Option<usize> {
        let candidates: Vec<usize> = self
            .deques
            .iter()
            .enumerate()
            .filter(|(_, (id, deque))| *id != thief && !deque.is_empty())
            .map(|(position, _)| position)
            .collect();
        if candidates.is_empty() {
            return None;
        }

        match self.config.victim_strategy {
            VictimStrategy::BusiestFirst => candidates.into_iter().max_by(|&a, &b| {
                let len_a = self.deques[a].1.len();
                let len_b = self.deques[b].1.len();
                len_a.cmp(&len_b).then_with(|| {
                    // Prefer the less recently victimized target on ties.
                    let when = |i: usize| {
                        self.last_victimized
                            .get(&self.deques[i].0)
                            .copied()
                    };
                    match (when(a), when(b)) {
                        (None, None) => std::cmp::Ordering::Equal,
                        (None, Some(_)) => std::cmp::Ordering::Greater,
                        (Some(_), None) => std::cmp::Ordering::Less,
                        (Some(ta), Some(tb)) => tb.cmp(&ta),
                    }
                })
            }),
            VictimStrategy::Random => {
                let pick = rand::thread_rng().gen_range(0..candidates.len());
                Some(candidates[pick])
            }
            VictimStrategy::RoundRobin => {
                let cursor = self.thief_cursor.entry(thief).or_insert(0);
                *cursor = (*cursor + 1) % self.deques.len();
                // Walk from the cursor to the first eligible victim.
                let n = self.deques.len();
                let start = *cursor;
                (0..n)
                    .map(|offset| (start + offset) % n)
                    .find(|position| candidates.contains(position))
            }
        }
    }

    /// One steal attempt on behalf of an idle executor. Transfers up to
    /// `min(half_of_victim, steal_cap)` slot indices; respects the
    /// per-thief cooldown; retries a torn transaction a few times before
    /// abandoning.
    pub fn steal_for(&mut self, thief: ExecutorId, now: Instant) -> Vec<u32> {
        if let Some(&last) = self.last_attempt.get(&thief) {
            if now.duration_since(last) < self.config.cooldown {
                return Vec::new();
            }
        }
        self.last_attempt.insert(thief, now);
        self.attempts += 1;

        let mut haul = Vec::new();
        for _ in 0..STEAL_RETRIES {
            let Some(position) = self.pick_victim(thief) else {
                break;
            };
            let (victim, deque) = &self.deques[position];
            let victim = *victim;
            let moved = deque.steal_batch_into(&mut haul, self.config.steal_cap);
            if moved > 0 {
                self.successes += 1;
                self.transferred += moved as u64;
                *self.by_thief.entry(thief).or_default() += moved as u64;
                *self.by_victim.entry(victim).or_default() += moved as u64;
                self.last_victimized.insert(victim, now);
                break;
            }
        }
        haul
    }

    /// Whether deque sizes have drifted past the configured ratio.
    pub fn should_rebalance(&self) -> bool {
        if self.deques.len() < 2 {
            return false;
        }
        let lengths: Vec<usize> = self.deques.iter().map(|(_, d)| d.len()).collect();
        let max = lengths.iter().copied().max().unwrap_or(0);
        let min = lengths.iter().copied().min().unwrap_or(0);
        max > min + 1 && (max as f64) / (min.max(1) as f64) > self.config.imbalance_ratio
    }

    /// Moves half of the deepest deque toward the shallowest. Returns
    /// `(recipient, slots)`; the caller (deque owner) pushes them.
    pub fn rebalance(&mut self, now: Instant) -> Option<(ExecutorId, Vec<u32>)> {
        if !self.should_rebalance() {
            return None;
        }
        let (deepest, _) = self
            .deques
            .iter()
            .enumerate()
            .max_by_key(|(_, (_, d))| d.len())?;
        let (shallowest, _) = self
            .deques
            .iter()
            .enumerate()
            .min_by_key(|(_, (_, d))| d.len())?;
        if deepest == shallowest {
            return None;
        }

        let victim = self.deques[deepest].0;
        let recipient = self.deques[shallowest].0;
        let mut moved = Vec::new();
        self.deques[deepest]
            .1
            .steal_batch_into(&mut moved, self.config.steal_cap);
        if moved.is_empty() {
            return None;
        }

        self.transferred += moved.len() as u64;
        *self.by_thief.entry(recipient).or_default() += moved.len() as u64;
        *self.by_victim.entry(victim).or_default() += moved.len() as u64;
        self.last_victimized.insert(victim, now);
        Some((recipient, moved))
    }

    pub fn stats(&self) -> StealStats {
        let mut by_thief: Vec<(u32, u64)> =
            self.by_thief.iter().map(|(id, &n)| (id.0, n)).collect();
        let mut by_victim: Vec<(u32, u64)> =
            self.by_victim.iter().map(|(id, &n)| (id.0, n)).collect();
        by_thief.sort_unstable();
        by_victim.sort_unstable();
        StealStats {
            attempts: self.attempts,
            successes: self.successes,
            tasks_transferred: self.transferred,
            by_thief,
            by_victim,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn scheduler(strategy: VictimStrategy) -> StealScheduler {
        StealScheduler::new(StealConfig {
            enabled: true,
            victim_strategy: strategy,
            cooldown: Duration::ZERO,
            ..Default::default()
        })
    }

    #[test]
    fn steals_half_from_busiest() {
        let mut scheduler = scheduler(VictimStrategy::BusiestFirst);
        let a = scheduler.add_executor(ExecutorId(0));
        let b = scheduler.add_executor(ExecutorId(1));
        scheduler.add_executor(ExecutorId(2));

        for slot in 0..10 {
            a.push_bottom(slot).unwrap();
        }
        for slot in 100..102 {
            b.push_bottom(slot).unwrap();
        }

        let haul = scheduler.steal_for(ExecutorId(2), Instant::now());
        assert_eq!(haul.len(), 5, "half of the deepest deque");
        assert_eq!(haul, vec![0, 1, 2, 3, 4], "stolen from the victim's top");
        assert_eq!(scheduler.queued_for(ExecutorId(0)), 5);
        assert_eq!(scheduler.queued_for(ExecutorId(1)), 2);

        let stats = scheduler.stats();
        assert_eq!(stats.successes, 1);
        assert_eq!(stats.tasks_transferred, 5);
        assert_eq!(stats.by_thief, vec![(2, 5)]);
        assert_eq!(stats.by_victim, vec![(0, 5)]);
    }

    #[test]
    fn steal_cap_bounds_the_haul() {
        let mut scheduler = StealScheduler::new(StealConfig {
            enabled: true,
            steal_cap: 3,
            cooldown: Duration::ZERO,
            ..Default::default()
        });
        let a = scheduler.add_executor(ExecutorId(0));
        scheduler.add_executor(ExecutorId(1));
        for slot in 0..20 {
            a.push_bottom(slot).unwrap();
        }
        let haul = scheduler.steal_for(ExecutorId(1), Instant::now());
        assert_eq!(haul.len(), 3);
    }

    #[test]
    fn cooldown_suppresses_attempts() {
        let mut scheduler = StealScheduler::new(StealConfig {
            enabled: true,
            cooldown: Duration::from_secs(60),
            ..Default::default()
        });
        let a = scheduler.add_executor(ExecutorId(0));
        scheduler.add_executor(ExecutorId(1));
        for slot in 0..8 {
            a.push_bottom(slot).unwrap();
        }

        let now = Instant::now();
        assert!(!scheduler.steal_for(ExecutorId(1), now).is_empty());
        assert!(
            scheduler.steal_for(ExecutorId(1), now).is_empty(),
            "second attempt inside the cooldown must do nothing"
        );
        assert!(!scheduler
            .steal_for(ExecutorId(1), now + Duration::from_secs(61))
            .is_empty());
    }

    #[test]
    fn never_steals_from_self() {
        let mut scheduler = scheduler(VictimStrategy::Random);
        let a = scheduler.add_executor(ExecutorId(0));
        for slot in 0..4 {
            a.push_bottom(slot).unwrap();
        }
        assert!(scheduler.steal_for(ExecutorId(0), Instant::now()).is_empty());
    }

    #[test]
    fn rebalance_triggers_on_ratio() {
        let mut scheduler = StealScheduler::new(StealConfig {
            enabled: true,
            imbalance_ratio: 3.0,
            ..Default::default()
        });
        let a = scheduler.add_executor(ExecutorId(0));
        let b = scheduler.add_executor(ExecutorId(1));

        for slot in 0..2 {
            a.push_bottom(slot).unwrap();
        }
        b.push_bottom(100).unwrap();
        assert!(!scheduler.should_rebalance(), "2:1 is within ratio");

        for slot in 2..9 {
            a.push_bottom(slot).unwrap();
        }
        assert!(scheduler.should_rebalance(), "9:1 exceeds ratio");

        let (recipient, moved) = scheduler.rebalance(Instant::now()).unwrap();
        assert_eq!(recipient, ExecutorId(1));
        assert!(!moved.is_empty());
    }

    #[test]
    fn removal_orphans_queued_slots() {
        let mut scheduler = scheduler(VictimStrategy::BusiestFirst);
        let a = scheduler.add_executor(ExecutorId(0));
        for slot in 0..5 {
            a.push_bottom(slot).unwrap();
        }
        let mut orphaned = scheduler.remove_executor(ExecutorId(0));
        orphaned.sort_unstable();
        assert_eq!(orphaned, vec![0, 1, 2, 3, 4]);
        assert!(scheduler.deque(ExecutorId(0)).is_none());
    }
}
