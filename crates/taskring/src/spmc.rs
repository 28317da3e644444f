use crate::invariants::{
    debug_assert_bounded_count, debug_assert_head_not_past_tail, debug_assert_monotonic,
};
use crate::{Backoff, Entry};
use crossbeam_utils::CachePadded;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

// =============================================================================
// MEMORY ORDERING & SYNCHRONIZATION STRATEGY
// =============================================================================
//
// The shared ready queue is a bounded ring of packed entries with one
// producer (the dispatch loop) and any number of consumers.
//
// ## Sequence numbers
//
// `head` and `tail` are unbounded u64 counters; cell index is `seq & mask`.
// A reused cell is always distinguished by its 64-bit generation, so there
// is no ABA window on either cursor.
//
// ## Cell protocol
//
// A cell holds either the empty sentinel (0) or a packed non-zero entry.
//
// Producer:  CAS cell 0 → entry (AcqRel), then store `tail+1` (Release).
//            The CAS can fail only when a consumer that already claimed the
//            previous generation of this cell has not cleared it yet; the
//            producer retries under a bounded backoff budget and reports
//            `Busy` if the budget runs out.
// Consumer:  load cell (Acquire); zero means the producer has not finished
//            publishing. CAS head → head+1 (AcqRel) claims the entry; the
//            winner clears the cell back to 0 (Release). Losers retry.
//
// No consumer ever reads the cell after losing the head CAS, so the
// cleared-late window only delays the producer, never corrupts an entry.
// =============================================================================

/// Errors surfaced by the ready-queue ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RingError {
    /// The ring holds `capacity` entries; caller applies back-pressure.
    #[error("ring is full")]
    Full,
    /// The CAS retry budget ran out under contention.
    #[error("ring contended beyond retry budget")]
    Busy,
}

// Producer-side retry budget. The only wait on this path is a consumer
// that claimed a cell but has not yet cleared it, a window of a few
// stores; the producer yields longer than the default before reporting
// `Busy`.
const PUSH_SPIN_LIMIT: u32 = 6;
const PUSH_YIELD_LIMIT: u32 = 16;

/// Single-producer multi-consumer ring of packed ready-queue entries.
pub struct SpmcRing {
    /// Monotonic consume cursor (CAS-advanced by consumers).
    head: CachePadded<AtomicU64>,
    /// Monotonic publish cursor (stored by the single producer).
    tail: CachePadded<AtomicU64>,
    cells: Box<[AtomicU64]>,
    mask: u64,
}

impl SpmcRing {
    /// Creates a ring with `capacity` rounded up to a power of two.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity > 0, "ring capacity must be non-zero");
        let capacity = capacity.next_power_of_two();
        let cells: Box<[AtomicU64]> = (0..capacity).map(|_| AtomicU64::new(0)).collect();
        Self {
            head: CachePadded::new(AtomicU64::new(0)),
            tail: CachePadded::new(AtomicU64::new(0)),
            cells,
            mask: (capacity - 1) as u64,
        }
    }

    /// Ring capacity.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.cells.len()
    }

    /// Approximate entry count (single unordered observation).
    #[inline]
    pub fn len(&self) -> usize {
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Relaxed);
        tail.saturating_sub(head) as usize
    }

    /// Approximate emptiness check.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Approximate fullness check.
    #[inline]
    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity()
    }

    /// Publishes an entry. Only the owning producer may call this.
    pub fn push(&self, entry: Entry) -> Result<(), RingError> {
        let mut backoff = Backoff::with_limits(PUSH_SPIN_LIMIT, PUSH_YIELD_LIMIT);
        loop {
            let tail = self.tail.load(Ordering::Relaxed);
            let head = self.head.load(Ordering::Acquire);
            debug_assert_head_not_past_tail!(head, tail);
            if tail.wrapping_sub(head) >= self.capacity() as u64 {
                return Err(RingError::Full);
            }

            let cell = &self.cells[(tail & self.mask) as usize];
            match cell.compare_exchange(0, entry.raw(), Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => {
                    debug_assert_bounded_count!(
                        tail.wrapping_add(1).wrapping_sub(head) as usize,
                        self.capacity()
                    );
                    debug_assert_monotonic!("tail", tail, tail.wrapping_add(1));
                    self.tail.store(tail.wrapping_add(1), Ordering::Release);
                    return Ok(());
                }
                Err(_) => {
                    // A consumer claimed the prior generation of this cell
                    // but has not cleared it yet.
                    if backoff.is_completed() {
                        return Err(RingError::Busy);
                    }
                    backoff.snooze();
                }
            }
        }
    }

    /// Claims the oldest entry, or `None` when the ring is empty, the
    /// producer is mid-publish, or the retry budget is spent.
    pub fn pop(&self) -> Option<Entry> {
        let mut backoff = Backoff::new();
        loop {
            let head = self.head.load(Ordering::Acquire);
            let tail = self.tail.load(Ordering::Acquire);
            if head >= tail {
                return None;
            }

            let cell = &self.cells[(head & self.mask) as usize];
            let raw = cell.load(Ordering::Acquire);
            if raw == 0 {
                // Producer reserved the generation but has not published.
                return None;
            }

            if self
                .head
                .compare_exchange(head, head.wrapping_add(1), Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                cell.store(0, Ordering::Release);
                return Entry::from_raw(raw);
            }

            if backoff.is_completed() {
                return None;
            }
            backoff.spin();
        }
    }

    /// O(n) scan for a slot index still sitting in the ring. Rarely used;
    /// a single unordered observation per cell.
    pub fn contains(&self, slot_index: u32) -> bool {
        self.cells.iter().any(|cell| {
            Entry::from_raw(cell.load(Ordering::Relaxed))
                .is_some_and(|e| e.slot_index() == slot_index)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn fifo_order_single_consumer() {
        let ring = SpmcRing::with_capacity(8);
        for i in 0..5 {
            ring.push(Entry::new(0, i)).unwrap();
        }
        for i in 0..5 {
            assert_eq!(ring.pop().unwrap().slot_index(), i);
        }
        assert!(ring.pop().is_none());
    }

    #[test]
    fn full_at_exact_capacity() {
        let ring = SpmcRing::with_capacity(4);
        for i in 0..4 {
            ring.push(Entry::new(0, i)).unwrap();
        }
        assert_eq!(ring.push(Entry::new(0, 99)), Err(RingError::Full));
        // Pop succeeds at exact capacity.
        assert_eq!(ring.pop().unwrap().slot_index(), 0);
        ring.push(Entry::new(0, 4)).unwrap();
    }

    #[test]
    fn contains_scans_pending_entries() {
        let ring = SpmcRing::with_capacity(4);
        ring.push(Entry::new(0, 11)).unwrap();
        ring.push(Entry::new(0, 12)).unwrap();
        assert!(ring.contains(11));
        assert!(!ring.contains(13));
        ring.pop().unwrap();
        assert!(!ring.contains(11));
    }

    #[test]
    fn concurrent_consumers_no_loss_no_duplication() {
        const ITEMS: u32 = 20_000;
        const CONSUMERS: usize = 4;

        let ring = Arc::new(SpmcRing::with_capacity(1024));
        let mut handles = Vec::new();

        for _ in 0..CONSUMERS {
            let ring = Arc::clone(&ring);
            handles.push(thread::spawn(move || {
                let mut seen = Vec::new();
                loop {
                    match ring.pop() {
                        Some(e) => {
                            if e.slot_index() == u32::MAX - 1 {
                                break;
                            }
                            seen.push(e.slot_index());
                        }
                        None => thread::yield_now(),
                    }
                }
                seen
            }));
        }

        for i in 0..ITEMS {
            loop {
                match ring.push(Entry::new(0, i)) {
                    Ok(()) => break,
                    Err(_) => thread::yield_now(),
                }
            }
        }
        // One poison pill per consumer.
        for _ in 0..CONSUMERS {
            loop {
                if ring.push(Entry::new(0, u32::MAX - 1)).is_ok() {
                    break;
                }
                thread::yield_now();
            }
        }

        let mut all = HashSet::new();
        for h in handles {
            for idx in h.join().unwrap() {
                assert!(all.insert(idx), "slot {idx} popped twice");
            }
        }
        assert_eq!(all.len(), ITEMS as usize, "entries lost");
    }
}
