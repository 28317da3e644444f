use crossbeam_utils::CachePadded;
use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicU64, Ordering};

// =============================================================================
// Bounded MPMC queue (Vyukov sequence protocol)
// =============================================================================
//
// Each cell carries its own sequence number:
//
//   sequence == pos            cell is empty for the producer at `pos`
//   sequence == pos + 1        cell is ready for the consumer at `pos`
//   sequence == pos + capacity cell has been consumed and recycled
//
// Producers CAS `tail` forward only after observing the expected sequence,
// consumers do the analogous check against `head`. The cursor CAS is the
// linearization point; the sequence store afterwards publishes the payload
// (Release) to exactly one peer. Both cursors are unbounded u64 counters,
// so sequences never repeat and cell reuse cannot be confused with the
// previous generation.
// =============================================================================

struct Cell<T> {
    sequence: AtomicU64,
    value: UnsafeCell<MaybeUninit<T>>,
}

/// Bounded multi-producer multi-consumer queue.
///
/// Carries completion records from executor reader tasks (many producers)
/// back to the dispatch loop, but is generic over any `T: Send`.
pub struct MpmcQueue<T> {
    head: CachePadded<AtomicU64>,
    tail: CachePadded<AtomicU64>,
    cells: Box<[Cell<T>]>,
    mask: u64,
}

unsafe impl<T: Send> Send for MpmcQueue<T> {}
unsafe impl<T: Send> Sync for MpmcQueue<T> {}

impl<T> MpmcQueue<T> {
    /// Creates a queue with `capacity` rounded up to a power of two.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity > 0, "queue capacity must be non-zero");
        let capacity = capacity.next_power_of_two();
        let cells: Box<[Cell<T>]> = (0..capacity)
            .map(|i| Cell {
                sequence: AtomicU64::new(i as u64),
                value: UnsafeCell::new(MaybeUninit::uninit()),
            })
            .collect();
        Self {
            head: CachePadded::new(AtomicU64::new(0)),
            tail: CachePadded::new(AtomicU64::new(0)),
            cells,
            mask: (capacity - 1) as u64,
        }
    }

    /// Queue capacity.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.cells.len()
    }

    /// Approximate element count.
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

    /// Enqueues `value`, handing it back if the queue is full.
    pub fn push(&self, value: T) -> Result<(), T> {
        let mut pos = self.tail.load(Ordering::Relaxed);
        loop {
            let cell = &self.cells[(pos & self.mask) as usize];
            let seq = cell.sequence.load(Ordering::Acquire);

            if seq == pos {
                if self
                    .tail
                    .compare_exchange_weak(pos, pos + 1, Ordering::Relaxed, Ordering::Relaxed)
                    .is_ok()
                {
                    // SAFETY: winning the tail CAS grants exclusive write
                    // access to this cell for generation `pos`; no reader
                    // touches it until the Release store below.
                    unsafe { (*cell.value.get()).write(value) };
                    cell.sequence.store(pos + 1, Ordering::Release);
                    return Ok(());
                }
                pos = self.tail.load(Ordering::Relaxed);
            } else if seq < pos {
                // Cell still holds the previous generation: queue is full.
                return Err(value);
            } else {
                pos = self.tail.load(Ordering::Relaxed);
            }
        }
    }

    /// Dequeues the oldest element, or `None` when empty.
    pub fn pop(&self) -> Option<T> {
        let mut pos = self.head.load(Ordering::Relaxed);
        loop {
            let cell = &self.cells[(pos & self.mask) as usize];
            let seq = cell.sequence.load(Ordering::Acquire);

            if seq == pos + 1 {
                if self
                    .head
                    .compare_exchange_weak(pos, pos + 1, Ordering::Relaxed, Ordering::Relaxed)
                    .is_ok()
                {
                    // SAFETY: winning the head CAS grants exclusive read
                    // access; the Acquire load of `sequence` synchronized
                    // with the producer's Release store of the payload.
                    let value = unsafe { (*cell.value.get()).assume_init_read() };
                    cell.sequence
                        .store(pos + self.mask + 1, Ordering::Release);
                    return Some(value);
                }
                pos = self.head.load(Ordering::Relaxed);
            } else if seq <= pos {
                return None;
            } else {
                pos = self.head.load(Ordering::Relaxed);
            }
        }
    }
}

impl<T> Drop for MpmcQueue<T> {
    fn drop(&mut self) {
        // Drain anything still sitting between the cursors.
        while self.pop().is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn push_pop_round_trip() {
        let q = MpmcQueue::with_capacity(4);
        q.push(1u64).unwrap();
        q.push(2).unwrap();
        assert_eq!(q.pop(), Some(1));
        assert_eq!(q.pop(), Some(2));
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn full_queue_hands_value_back() {
        let q = MpmcQueue::with_capacity(2);
        q.push(10u64).unwrap();
        q.push(11).unwrap();
        assert_eq!(q.push(12), Err(12));
        assert_eq!(q.pop(), Some(10));
        q.push(12).unwrap();
    }

    #[test]
    fn drops_undelivered_items() {
        static DROPS: std::sync::atomic::AtomicUsize = std::sync::atomic::AtomicUsize::new(0);
        struct Tracker;
        impl Drop for Tracker {
            fn drop(&mut self) {
                DROPS.fetch_add(1, Ordering::SeqCst);
            }
        }

        {
            let q = MpmcQueue::with_capacity(8);
            for _ in 0..5 {
                q.push(Tracker).unwrap();
            }
            drop(q.pop());
        }
        assert_eq!(DROPS.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn concurrent_producers_and_consumers() {
        const PRODUCERS: u64 = 4;
        const CONSUMERS: usize = 4;
        const PER_PRODUCER: u64 = 10_000;

        let q = Arc::new(MpmcQueue::with_capacity(256));
        let produced_total = PRODUCERS * PER_PRODUCER;

        let mut handles = Vec::new();
        for p in 0..PRODUCERS {
            let q = Arc::clone(&q);
            handles.push(thread::spawn(move || {
                for i in 0..PER_PRODUCER {
                    let mut value = (p << 32) | i;
                    loop {
                        match q.push(value) {
                            Ok(()) => break,
                            Err(v) => {
                                value = v;
                                thread::yield_now();
                            }
                        }
                    }
                }
            }));
        }

        let consumed = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut consumers = Vec::new();
        for _ in 0..CONSUMERS {
            let q = Arc::clone(&q);
            let consumed = Arc::clone(&consumed);
            consumers.push(thread::spawn(move || {
                let mut local = Vec::new();
                loop {
                    match q.pop() {
                        Some(v) if v == u64::MAX => break,
                        Some(v) => local.push(v),
                        None => thread::yield_now(),
                    }
                }
                consumed.lock().unwrap().extend(local);
            }));
        }

        for h in handles {
            h.join().unwrap();
        }
        for _ in 0..CONSUMERS {
            loop {
                if q.push(u64::MAX).is_ok() {
                    break;
                }
                thread::yield_now();
            }
        }
        for c in consumers {
            c.join().unwrap();
        }

        let mut all = consumed.lock().unwrap().clone();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len() as u64, produced_total, "lost or duplicated items");
    }
}
