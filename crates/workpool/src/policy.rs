//! Selection policies: which executor gets the next task.
//!
//! A policy sees a read-only status snapshot of the executor set plus an
//! optional hint (affinity nomination, task type, duration estimate) and
//! answers with an index and a textual reason. The dispatch loop is the
//! only caller, so policies keep plain mutable state.

use crate::executor::ExecutorId;
use std::collections::HashMap;
use std::time::Duration;

/// Read-only per-executor status handed to policies.
#[derive(Debug, Clone)]
pub struct ExecutorStatus {
    pub id: ExecutorId,
    /// Whether the executor may be handed new tasks at all.
    pub accepts: bool,
    /// Whether the executor has spare concurrency right now.
    pub idle: bool,
    pub active_tasks: u32,
    /// Tasks parked in the executor's own deque.
    pub queued_tasks: u32,
    pub total_completed: u64,
    pub weight: u32,
}

/// Routing hint accompanying a selection request.
#[derive(Debug, Clone, Default)]
pub struct SelectionHint {
    /// Index the affinity router nominated.
    pub affinity_index: Option<usize>,
    pub task_type: Option<String>,
    pub estimated_duration: Option<Duration>,
}

/// A policy's answer.
#[derive(Debug, Clone)]
pub struct Selection {
    pub index: usize,
    pub reason: String,
}

/// The selection contract. Hooks keep per-executor statistics current; all
/// calls come from the dispatch loop.
pub trait SelectionPolicy: Send {
    fn name(&self) -> &'static str;

    /// Picks an executor index, or `None` when nothing is selectable.
    fn select(&mut self, executors: &[ExecutorStatus], hint: Option<&SelectionHint>)
        -> Option<Selection>;

    fn on_task_complete(&mut self, _executor: ExecutorId, _duration: Duration, _success: bool) {}

    fn on_executor_added(&mut self, _executor: ExecutorId) {}

    fn on_executor_removed(&mut self, _executor: ExecutorId) {}

    fn reset(&mut self) {}

    /// Whether an affinity nomination passes this policy's own fairness
    /// test. Policies without a fairness notion accept any live nominee.
    fn hint_eligible(&self, executors: &[ExecutorStatus], index: usize) -> bool {
        executors.get(index).is_some_and(|status| status.accepts)
    }
}

/// Honors an affinity nomination before falling back to the policy proper.
pub(crate) fn select_with_hint(
    policy: &mut dyn SelectionPolicy,
    executors: &[ExecutorStatus],
    hint: Option<&SelectionHint>,
) -> Option<Selection> {
    if let Some(index) = hint.and_then(|hint| hint.affinity_index) {
        if policy.hint_eligible(executors, index) {
            return Some(Selection {
                index,
                reason: "affinity hint".into(),
            });
        }
    }
    policy.select(executors, hint)
}

// -----------------------------------------------------------------------------
// Round-robin
// -----------------------------------------------------------------------------

/// Rotates a cursor across executors, skipping those that cannot take
/// tasks. When nobody is idle the next live cursor target is returned
/// anyway; the task queues locally at that executor.
#[derive(Debug, Default)]
pub struct RoundRobin {
    cursor: usize,
}

impl SelectionPolicy for RoundRobin {
    fn name(&self) -> &'static str {
        "round-robin"
    }

    fn select(
        &mut self,
        executors: &[ExecutorStatus],
        _hint: Option<&SelectionHint>,
    ) -> Option<Selection> {
        if executors.is_empty() {
            return None;
        }
        let n = executors.len();
        // First pass: next idle executor from the cursor.
        for step in 1..=n {
            let index = (self.cursor + step) % n;
            if executors[index].accepts && executors[index].idle {
                self.cursor = index;
                return Some(Selection {
                    index,
                    reason: "round-robin idle".into(),
                });
            }
        }
        // Nobody idle: take the next live target regardless.
        for step in 1..=n {
            let index = (self.cursor + step) % n;
            if executors[index].accepts {
                self.cursor = index;
                return Some(Selection {
                    index,
                    reason: "round-robin busy".into(),
                });
            }
        }
        None
    }

    fn reset(&mut self) {
        self.cursor = 0;
    }
}

// -----------------------------------------------------------------------------
// Least-busy / least-used
// -----------------------------------------------------------------------------

/// Minimizes `active + queued`, early-exiting on a fully idle executor.
#[derive(Debug, Default)]
pub struct LeastBusy;

impl SelectionPolicy for LeastBusy {
    fn name(&self) -> &'static str {
        "least-busy"
    }

    fn select(
        &mut self,
        executors: &[ExecutorStatus],
        _hint: Option<&SelectionHint>,
    ) -> Option<Selection> {
        let mut best: Option<(usize, u64)> = None;
        for (index, status) in executors.iter().enumerate() {
            if !status.accepts {
                continue;
            }
            let load = u64::from(status.active_tasks) + u64::from(status.queued_tasks);
            if load == 0 {
                return Some(Selection {
                    index,
                    reason: "least-busy load=0".into(),
                });
            }
            if best.is_none_or(|(_, b)| load < b) {
                best = Some((index, load));
            }
        }
        best.map(|(index, load)| Selection {
            index,
            reason: format!("least-busy load={load}"),
        })
    }
}

/// Minimizes lifetime completions, spreading work onto fresh executors.
#[derive(Debug, Default)]
pub struct LeastUsed;

impl SelectionPolicy for LeastUsed {
    fn name(&self) -> &'static str {
        "least-used"
    }

    fn select(
        &mut self,
        executors: &[ExecutorStatus],
        _hint: Option<&SelectionHint>,
    ) -> Option<Selection> {
        executors
            .iter()
            .enumerate()
            .filter(|(_, status)| status.accepts)
            .min_by_key(|(_, status)| status.total_completed)
            .map(|(index, status)| Selection {
                index,
                reason: format!("least-used completed={}", status.total_completed),
            })
    }
}

// -----------------------------------------------------------------------------
// Fair-share
// -----------------------------------------------------------------------------

/// Minimizes `score + active · avg_duration`, where `score` is an
/// exponentially smoothed execution-time total (sample weight `alpha`,
/// default 0.7) so the quantity stays bounded. Cold start, before any
/// completion, degenerates to round-robin.
#[derive(Debug)]
pub struct FairShare {
    alpha: f64,
    scores: HashMap<ExecutorId, f64>,
    avg_duration_ms: f64,
    completions: u64,
    fallback: RoundRobin,
}

impl FairShare {
    pub fn new(alpha: f64) -> Self {
        debug_assert!(alpha > 0.0 && alpha < 1.0, "alpha outside (0, 1)");
        Self {
            alpha,
            scores: HashMap::new(),
            avg_duration_ms: 0.0,
            completions: 0,
            fallback: RoundRobin::default(),
        }
    }

    fn score(&self, id: ExecutorId) -> f64 {
        self.scores.get(&id).copied().unwrap_or(0.0)
    }

    fn mean_score(&self, executors: &[ExecutorStatus]) -> f64 {
        let live: Vec<f64> = executors
            .iter()
            .filter(|s| s.accepts)
            .map(|s| self.score(s.id))
            .collect();
        if live.is_empty() {
            0.0
        } else {
            live.iter().sum::<f64>() / live.len() as f64
        }
    }
}

impl Default for FairShare {
    fn default() -> Self {
        Self::new(0.7)
    }
}

impl SelectionPolicy for FairShare {
    fn name(&self) -> &'static str {
        "fair-share"
    }

    fn select(
        &mut self,
        executors: &[ExecutorStatus],
        hint: Option<&SelectionHint>,
    ) -> Option<Selection> {
        if self.completions == 0 {
            return self.fallback.select(executors, hint).map(|mut s| {
                s.reason = "fair-share cold start".into();
                s
            });
        }

        executors
            .iter()
            .enumerate()
            .filter(|(_, status)| status.accepts)
            .map(|(index, status)| {
                let virtual_time =
                    self.score(status.id) + f64::from(status.active_tasks) * self.avg_duration_ms;
                (index, virtual_time)
            })
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(index, virtual_time)| Selection {
                index,
                reason: format!("fair-share virtual_time={virtual_time:.1}ms"),
            })
    }

    fn on_task_complete(&mut self, executor: ExecutorId, duration: Duration, _success: bool) {
        let millis = duration.as_secs_f64() * 1e3;
        let score = self.scores.entry(executor).or_insert(0.0);
        *score = (1.0 - self.alpha) * *score + self.alpha * millis;
        self.avg_duration_ms = if self.completions == 0 {
            millis
        } else {
            (1.0 - self.alpha) * self.avg_duration_ms + self.alpha * millis
        };
        self.completions += 1;
    }

    fn on_executor_removed(&mut self, executor: ExecutorId) {
        self.scores.remove(&executor);
    }

    fn reset(&mut self) {
        self.scores.clear();
        self.avg_duration_ms = 0.0;
        self.completions = 0;
        self.fallback.reset();
    }

    /// An affinity nominee is fair only while its smoothed time is within
    /// 20% of the mean.
    fn hint_eligible(&self, executors: &[ExecutorStatus], index: usize) -> bool {
        let Some(status) = executors.get(index) else {
            return false;
        };
        if !status.accepts {
            return false;
        }
        let mean = self.mean_score(executors);
        mean == 0.0 || self.score(status.id) <= mean * 1.2
    }
}

// -----------------------------------------------------------------------------
// Weighted round-robin
// -----------------------------------------------------------------------------

fn gcd(a: u32, b: u32) -> u32 {
    if b == 0 {
        a
    } else {
        gcd(b, a % b)
    }
}

/// Classical weighted round-robin with gcd stepping: over any long run the
/// selection counts converge to the weight ratios.
#[derive(Debug, Default)]
pub struct WeightedRoundRobin {
    cursor: usize,
    current_weight: u32,
}

impl SelectionPolicy for WeightedRoundRobin {
    fn name(&self) -> &'static str {
        "weighted-round-robin"
    }

    fn select(
        &mut self,
        executors: &[ExecutorStatus],
        _hint: Option<&SelectionHint>,
    ) -> Option<Selection> {
        let n = executors.len();
        let max_weight = executors
            .iter()
            .filter(|s| s.accepts)
            .map(|s| s.weight)
            .max()
            .unwrap_or(0);
        if n == 0 || max_weight == 0 {
            return None;
        }
        let step = executors
            .iter()
            .filter(|s| s.accepts && s.weight > 0)
            .map(|s| s.weight)
            .fold(0, gcd)
            .max(1);

        if self.current_weight == 0 {
            // Fresh cycle: start at the top weight level from index 0.
            self.current_weight = max_weight;
            self.cursor = n - 1;
        }

        // One full sweep per weight level bounds the scan.
        for _ in 0..n * max_weight as usize {
            self.cursor = (self.cursor + 1) % n;
            if self.cursor == 0 {
                self.current_weight = self.current_weight.saturating_sub(step);
                if self.current_weight == 0 {
                    self.current_weight = max_weight;
                }
            }
            let status = &executors[self.cursor];
            if status.accepts && status.weight >= self.current_weight {
                return Some(Selection {
                    index: self.cursor,
                    reason: format!("weighted-rr level={}", self.current_weight),
                });
            }
        }
        None
    }

    fn reset(&mut self) {
        self.cursor = 0;
        self.current_weight = 0;
    }
}

/// Interleaved weighted round-robin: same long-run ratios as
/// [`WeightedRoundRobin`] but smoother short-run distribution, iterating
/// round numbers `1..=max(weight)` and admitting executors whose weight
/// covers the current round.
#[derive(Debug)]
pub struct InterleavedWeightedRoundRobin {
    round: u32,
    position: usize,
}

impl Default for InterleavedWeightedRoundRobin {
    fn default() -> Self {
        Self { round: 1, position: usize::MAX }
    }
}

impl SelectionPolicy for InterleavedWeightedRoundRobin {
    fn name(&self) -> &'static str {
        "interleaved-weighted-round-robin"
    }

    fn select(
        &mut self,
        executors: &[ExecutorStatus],
        _hint: Option<&SelectionHint>,
    ) -> Option<Selection> {
        let n = executors.len();
        let max_weight = executors
            .iter()
            .filter(|s| s.accepts)
            .map(|s| s.weight)
            .max()
            .unwrap_or(0);
        if n == 0 || max_weight == 0 {
            return None;
        }
        if self.round > max_weight {
            self.round = 1;
        }

        for _ in 0..n * max_weight as usize {
            self.position = self.position.wrapping_add(1);
            if self.position >= n {
                self.position = 0;
                self.round = if self.round >= max_weight { 1 } else { self.round + 1 };
            }
            let status = &executors[self.position];
            if status.accepts && status.weight >= self.round {
                return Some(Selection {
                    index: self.position,
                    reason: format!("interleaved-wrr round={}", self.round),
                });
            }
        }
        None
    }

    fn reset(&mut self) {
        self.round = 1;
        self.position = usize::MAX;
    }
}

// -----------------------------------------------------------------------------
// Tagged policy selection
// -----------------------------------------------------------------------------

/// The configured policy: six built-ins plus a custom implementation of
/// the same contract.
pub enum PolicyKind {
    RoundRobin,
    LeastBusy,
    LeastUsed,
    FairShare,
    WeightedRoundRobin,
    InterleavedWeightedRoundRobin,
    Custom(Box<dyn SelectionPolicy>),
}

impl std::fmt::Debug for PolicyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::RoundRobin => "RoundRobin",
            Self::LeastBusy => "LeastBusy",
            Self::LeastUsed => "LeastUsed",
            Self::FairShare => "FairShare",
            Self::WeightedRoundRobin => "WeightedRoundRobin",
            Self::InterleavedWeightedRoundRobin => "InterleavedWeightedRoundRobin",
            Self::Custom(policy) => return write!(f, "Custom({})", policy.name()),
        };
        f.write_str(name)
    }
}

impl PolicyKind {
    pub(crate) fn build(self) -> Box<dyn SelectionPolicy> {
        match self {
            Self::RoundRobin => Box::new(RoundRobin::default()),
            Self::LeastBusy => Box::new(LeastBusy),
            Self::LeastUsed => Box::new(LeastUsed),
            Self::FairShare => Box::new(FairShare::default()),
            Self::WeightedRoundRobin => Box::new(WeightedRoundRobin::default()),
            Self::InterleavedWeightedRoundRobin => {
                Box::new(InterleavedWeightedRoundRobin::default())
            }
            Self::Custom(policy) => policy,
        }
    }
}
