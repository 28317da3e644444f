//! Consistent-hash affinity routing.
//!
//! Executors are projected onto a 64-bit hash ring with a configurable
//! number of virtual nodes each; an affinity key maps to the first ring
//! entry at or after its hash. A sticky map short-circuits the ring while
//! its entries are fresh, pinning a key to one executor until the TTL
//! runs out, the executor leaves, or the key is cleared.
//!
//! The router is owned and mutated by the dispatch loop alone; a seqlock
//! cell publishes a small summary for observers.

use crate::config::AffinityConfig;
use crate::executor::ExecutorId;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use taskring::SeqLock;

/// 64-bit FNV-1a over raw bytes; the ring's pinned hash function.
pub fn fnv1a64(bytes: &[u8]) -> u64 {
    const OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    let mut hash = OFFSET_BASIS;
    for &byte in bytes {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

/// A routing decision with the router's confidence in it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RouteDecision {
    pub executor: ExecutorId,
    /// 1.0 for a sticky hit, lower for a plain ring lookup, low when the
    /// candidate is overloaded. Below the configured floor the coordinator
    /// ignores the nomination and lets the selection policy decide.
    pub confidence: f64,
}

/// Copy summary published through the seqlock for observers.
#[derive(Debug, Clone, Copy, Default)]
pub struct RouterSummary {
    pub version: u64,
    pub ring_entries: u32,
    pub sticky_entries: u32,
}

#[derive(Debug, Clone, Copy)]
struct StickyEntry {
    executor: ExecutorId,
    expires_at: Instant,
}

/// Consistent-hash ring plus sticky map.
pub struct AffinityRouter {
    /// Sorted `(hash, executor)` pairs.
    ring: Vec<(u64, ExecutorId)>,
    sticky: HashMap<Vec<u8>, StickyEntry>,
    virtual_nodes: u32,
    ttl: Duration,
    load_ceiling: f64,
    summary: Arc<SeqLock<RouterSummary>>,
    version: u64,
}

const RING_CONFIDENCE: f64 = 0.8;
const OVERLOAD_CONFIDENCE: f64 = 0.2;

impl AffinityRouter {
    pub fn new(config: &AffinityConfig) -> Self {
        Self {
            ring: Vec::new(),
            sticky: HashMap::new(),
            virtual_nodes: config.virtual_nodes.max(1),
            ttl: config.sticky_ttl,
            load_ceiling: config.load_ceiling,
            summary: Arc::new(SeqLock::new(RouterSummary::default())),
            version: 0,
        }
    }

    /// Shared handle to the observer summary.
    pub fn summary_handle(&self) -> Arc<SeqLock<RouterSummary>> {
        Arc::clone(&self.summary)
    }

    fn publish(&mut self) {
        self.version += 1;
        self.summary.write(RouterSummary {
            version: self.version,
            ring_entries: self.ring.len() as u32,
            sticky_entries: self.sticky.len() as u32,
        });
    }

    /// Projects an executor's virtual nodes onto the ring.
    pub fn add_executor(&mut self, id: ExecutorId) {
        for replica in 0..self.virtual_nodes {
            let hash = fnv1a64(format!("worker:{}:{}", id.0, replica).as_bytes());
            let position = self.ring.partition_point(|&(h, _)| h < hash);
            self.ring.insert(position, (hash, id));
        }
        self.publish();
    }

    /// Removes an executor's ring entries and invalidates every sticky
    /// entry pinned to it; affected keys remap to their ring successor on
    /// the next lookup.
    pub fn remove_executor(&mut self, id: ExecutorId) {
        self.ring.retain(|&(_, e)| e != id);
        self.sticky.retain(|_, entry| entry.executor != id);
        self.publish();
    }

    /// Drops a sticky pin on demand.
    pub fn clear_key(&mut self, key: &[u8]) {
        if self.sticky.remove(key).is_some() {
            self.publish();
        }
    }

    /// Plain ring lookup: first entry at or after the key's hash, wrapping.
    pub fn ring_lookup(&self, key: &[u8]) -> Option<ExecutorId> {
        if self.ring.is_empty() {
            return None;
        }
        let hash = fnv1a64(key);
        let position = self.ring.partition_point(|&(h, _)| h < hash);
        let (_, executor) = self.ring[position % self.ring.len()];
        Some(executor)
    }

    /// The next `n` distinct executors on the ring after the key's
    /// position, for failover.
    pub fn preference_list(&self, key: &[u8], n: usize) -> Vec<ExecutorId> {
        let mut result = Vec::new();
        if self.ring.is_empty() || n == 0 {
            return result;
        }
        let hash = fnv1a64(key);
        let start = self.ring.partition_point(|&(h, _)| h < hash);
        for offset in 0..self.ring.len() {
            let (_, executor) = self.ring[(start + offset) % self.ring.len()];
            if !result.contains(&executor) {
                result.push(executor);
                if result.len() == n {
                    break;
                }
            }
        }
        result
    }

    /// Routes a key: sticky map first, ring second; refreshes the sticky
    /// pin; grades confidence by sticky-ness and the target's current
    /// affinity load.
    pub fn route(
        &mut self,
        key: &[u8],
        now: Instant,
        load_of: impl Fn(ExecutorId) -> Option<f64>,
    ) -> Option<RouteDecision> {
        // Sticky fast path.
        if let Some(entry) = self.sticky.get(key) {
            if entry.expires_at > now {
                let executor = entry.executor;
                // The pinned executor may have vanished between removal
                // bookkeeping and this lookup; treat a missing load as gone.
                if let Some(load) = load_of(executor) {
                    let confidence = if load >= self.load_ceiling {
                        OVERLOAD_CONFIDENCE
                    } else {
                        1.0
                    };
                    return Some(RouteDecision { executor, confidence });
                }
            }
            self.sticky.remove(key);
            self.publish();
        }

        let executor = self.ring_lookup(key)?;
        let load = load_of(executor)?;
        let confidence = if load >= self.load_ceiling {
            OVERLOAD_CONFIDENCE
        } else {
            // Degrade linearly toward the ceiling.
            let pressure = (load / self.load_ceiling).clamp(0.0, 1.0);
            RING_CONFIDENCE - (RING_CONFIDENCE - OVERLOAD_CONFIDENCE - 0.1) * pressure
        };

        self.sticky.insert(
            key.to_vec(),
            StickyEntry {
                executor,
                expires_at: now + self.ttl,
            },
        );
        self.publish();
        Some(RouteDecision { executor, confidence })
    }

    /// Expires stale sticky entries; called from housekeeping ticks.
    pub fn sweep(&mut self, now: Instant) {
        let before = self.sticky.len();
        self.sticky.retain(|_, entry| entry.expires_at > now);
        if self.sticky.len() != before {
            self.publish();
        }
    }

    pub fn ring_len(&self) -> usize {
        self.ring.len()
    }

    pub fn sticky_len(&self) -> usize {
        self.sticky.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config() -> AffinityConfig {
        AffinityConfig {
            enabled: true,
            ..Default::default()
        }
    }

    fn router_with(n: u32) -> AffinityRouter {
        let mut router = AffinityRouter::new(&config());
        for id in 0..n {
            router.add_executor(ExecutorId(id));
        }
        router
    }

    #[test]
    fn fnv_vectors() {
        // Published FNV-1a 64-bit test vectors.
        assert_eq!(fnv1a64(b""), 0xcbf29ce484222325);
        assert_eq!(fnv1a64(b"a"), 0xaf63dc4c8601ec8c);
        assert_eq!(fnv1a64(b"foobar"), 0x85944171f73967e8);
    }

    #[test]
    fn lookup_is_stable() {
        let mut router = router_with(5);
        let now = Instant::now();
        for key in [b"user:1".as_slice(), b"user:2", b"user:3"] {
            let first = router.route(key, now, |_| Some(0.0)).unwrap();
            for _ in 0..3 {
                let again = router.route(key, now, |_| Some(0.0)).unwrap();
                assert_eq!(again.executor, first.executor);
                assert_eq!(again.confidence, 1.0, "second lookup must be sticky");
            }
        }
    }

    #[test]
    fn removal_remaps_bounded_fraction() {
        let mut router = router_with(5);
        let keys: Vec<Vec<u8>> = (0..1000).map(|i| format!("key:{i}").into_bytes()).collect();
        let before: HashMap<Vec<u8>, ExecutorId> = keys
            .iter()
            .map(|k| (k.clone(), router.ring_lookup(k).unwrap()))
            .collect();

        let victim = before[&keys[0]];
        router.remove_executor(victim);

        let mut moved = 0;
        for key in &keys {
            let after = router.ring_lookup(key).unwrap();
            assert_ne!(after, victim, "key still maps to removed executor");
            if before[key] != victim {
                assert_eq!(after, before[key], "unaffected key remapped");
            } else {
                moved += 1;
            }
        }
        // Roughly 1/5 of keys lived on the victim.
        assert!(moved > 100 && moved < 350, "moved {moved} of 1000");
    }

    #[test]
    fn removal_invalidates_sticky_entries() {
        let mut router = router_with(3);
        let now = Instant::now();
        let decision = router.route(b"user:9", now, |_| Some(0.0)).unwrap();
        router.remove_executor(decision.executor);

        let rerouted = router.route(b"user:9", now, |_| Some(0.0)).unwrap();
        assert_ne!(rerouted.executor, decision.executor);
        // All subsequent routes agree on the single successor.
        for _ in 0..3 {
            assert_eq!(
                router.route(b"user:9", now, |_| Some(0.0)).unwrap().executor,
                rerouted.executor
            );
        }
    }

    #[test]
    fn ttl_expires_sticky_pins() {
        let mut router = AffinityRouter::new(&AffinityConfig {
            sticky_ttl: Duration::from_millis(50),
            ..config()
        });
        router.add_executor(ExecutorId(0));
        router.add_executor(ExecutorId(1));

        let now = Instant::now();
        let first = router.route(b"k", now, |_| Some(0.0)).unwrap();
        assert_eq!(first.confidence, RING_CONFIDENCE);

        let sticky = router.route(b"k", now, |_| Some(0.0)).unwrap();
        assert_eq!(sticky.confidence, 1.0);

        let later = now + Duration::from_millis(100);
        router.sweep(later);
        let renewed = router.route(b"k", later, |_| Some(0.0)).unwrap();
        // Same ring target, but no longer a sticky hit.
        assert_eq!(renewed.executor, first.executor);
        assert_eq!(renewed.confidence, RING_CONFIDENCE);
    }

    #[test]
    fn overload_degrades_confidence() {
        let mut router = router_with(2);
        let now = Instant::now();
        let decision = router.route(b"hot", now, |_| Some(100.0)).unwrap();
        assert!(decision.confidence <= OVERLOAD_CONFIDENCE + f64::EPSILON);
    }

    #[test]
    fn preference_list_is_distinct_and_ordered() {
        let router = router_with(5);
        let list = router.preference_list(b"user:1", 3);
        assert_eq!(list.len(), 3);
        let mut dedup = list.clone();
        dedup.dedup();
        assert_eq!(dedup.len(), 3);
        // First preference matches the plain lookup.
        assert_eq!(list[0], router.ring_lookup(b"user:1").unwrap());
    }

    #[test]
    fn virtual_nodes_spread_keys() {
        let router = router_with(5);
        let mut counts: HashMap<ExecutorId, u32> = HashMap::new();
        for i in 0..5000 {
            let key = format!("spread:{i}");
            *counts.entry(router.ring_lookup(key.as_bytes()).unwrap()).or_default() += 1;
        }
        for (&executor, &count) in &counts {
            assert!(
                count > 500 && count < 2000,
                "executor {executor} got {count} of 5000 keys"
            );
        }
    }
}
