use crate::invariants::debug_assert_bounded_count;
use crossbeam_utils::CachePadded;
use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicU64, Ordering};

// =============================================================================
// Chase-Lev work-stealing deque (fixed capacity)
// =============================================================================
//
// The owner pushes and pops at the bottom (LIFO); thieves steal from the top
// (FIFO). Derived from the Chase-Lev circular deque with the memory-order
// treatment of Le et al., simplified to a fixed power-of-two buffer: task
// counts in this pool are bounded by the arena, so the growable array buys
// nothing.
//
// `top` and `bottom` are unbounded u64 counters. The steal CAS advances
// `top` from the exact value observed; because counters never repeat, a
// recycled buffer slot can never satisfy a stale CAS (no ABA tag needed —
// the counter IS the generation).
//
// Ownership rule: exactly one logical owner calls `push_bottom`/`pop_bottom`
// (the dispatch loop); `steal`/`steal_batch_into` are safe from any thread.
// =============================================================================

/// Outcome of a steal attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Steal<T> {
    /// One task transferred from the victim's top.
    Success(T),
    /// Victim deque was empty.
    Empty,
    /// Lost a race with the owner or another thief; retrying may succeed.
    Retry,
}

/// Fixed-capacity double-ended work queue, owner-LIFO / thief-FIFO.
pub struct WorkDeque<T> {
    /// Owner cursor; only the owner stores it.
    bottom: CachePadded<AtomicU64>,
    /// Thief cursor; CAS-advanced by stealers (and by the owner for the
    /// final element).
    top: CachePadded<AtomicU64>,
    buffer: Box<[UnsafeCell<MaybeUninit<T>>]>,
    mask: u64,
}

unsafe impl<T: Send> Send for WorkDeque<T> {}
unsafe impl<T: Send> Sync for WorkDeque<T> {}

impl<T> WorkDeque<T> {
    /// Creates a deque with `capacity` rounded up to a power of two.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity > 0, "deque capacity must be non-zero");
        let capacity = capacity.next_power_of_two();
        let buffer: Box<[UnsafeCell<MaybeUninit<T>>]> = (0..capacity)
            .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
            .collect();
        Self {
            bottom: CachePadded::new(AtomicU64::new(0)),
            top: CachePadded::new(AtomicU64::new(0)),
            buffer,
            mask: (capacity - 1) as u64,
        }
    }

    /// Deque capacity.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    /// Approximate task count (single observation; exact only for the owner).
    #[inline]
    pub fn len(&self) -> usize {
        let bottom = self.bottom.load(Ordering::Relaxed);
        let top = self.top.load(Ordering::Relaxed);
        bottom.saturating_sub(top) as usize
    }

    /// Approximate emptiness check.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    fn slot(&self, index: u64) -> *mut MaybeUninit<T> {
        self.buffer[(index & self.mask) as usize].get()
    }

    /// Owner: appends a task at the bottom. Hands the value back when the
    /// deque is at capacity.
    pub fn push_bottom(&self, value: T) -> Result<(), T> {
        let bottom = self.bottom.load(Ordering::Relaxed);
        let top = self.top.load(Ordering::Acquire);
        if bottom.wrapping_sub(top) >= self.capacity() as u64 {
            return Err(value);
        }
        debug_assert_bounded_count!(bottom.wrapping_sub(top) as usize, self.capacity());

        // SAFETY: the owner is the only writer past `bottom`, and thieves
        // only read below `bottom`; the Release store publishes the write.
        unsafe { (*self.slot(bottom)).write(value) };
        self.bottom.store(bottom.wrapping_add(1), Ordering::Release);
        Ok(())
    }

    /// Owner: takes the most recently pushed task.
    pub fn pop_bottom(&self) -> Option<T> {
        let bottom = self.bottom.load(Ordering::Relaxed);
        let top = self.top.load(Ordering::Relaxed);
        if bottom == top {
            return None;
        }

        let new_bottom = bottom.wrapping_sub(1);
        // Publish the claim before re-reading top: a thief that observes
        // the lowered bottom backs off the final element.
        self.bottom.store(new_bottom, Ordering::SeqCst);
        let top = self.top.load(Ordering::SeqCst);

        if top < new_bottom {
            // At least two tasks were present; the bottom one is ours.
            // SAFETY: thieves can only take slots below `new_bottom`.
            return Some(unsafe { (*self.slot(new_bottom)).assume_init_read() });
        }

        if top == new_bottom {
            // Exactly one task left: race the thieves for it. Either way the
            // deque ends empty with bottom == top == top+1.
            let won = self
                .top
                .compare_exchange(top, top.wrapping_add(1), Ordering::SeqCst, Ordering::Relaxed)
                .is_ok();
            self.bottom.store(top.wrapping_add(1), Ordering::SeqCst);
            // SAFETY: winning the CAS transfers the slot to the owner;
            // losing means a thief already read it.
            return won.then(|| unsafe { (*self.slot(new_bottom)).assume_init_read() });
        }

        // Thieves consumed the last task between our loads; top is back at
        // the original bottom. Restore the empty shape bottom == top.
        self.bottom.store(top, Ordering::SeqCst);
        None
    }

    /// Thief: takes the oldest task from the top.
    pub fn steal(&self) -> Steal<T> {
        let top = self.top.load(Ordering::SeqCst);
        let bottom = self.bottom.load(Ordering::SeqCst);
        if top >= bottom {
            return Steal::Empty;
        }

        // SAFETY: speculative bitwise copy of the slot; it is only kept if
        // the CAS below confirms this generation of `top` was ours.
        let value = unsafe { std::ptr::read(self.slot(top)) };
        if self
            .top
            .compare_exchange(top, top.wrapping_add(1), Ordering::SeqCst, Ordering::Relaxed)
            .is_ok()
        {
            // SAFETY: CAS success means no other party consumed this slot.
            Steal::Success(unsafe { value.assume_init() })
        } else {
            // The copy is abandoned without dropping: the slot's real
            // occupant is owned by whoever won.
            std::mem::forget(value);
            Steal::Retry
        }
    }

    /// Thief: transfers up to `min(ceil(len/2), max)` tasks into `dest` in
    /// one pass. Stops at the first lost race; returns the count moved.
    pub fn steal_batch_into(&self, dest: &mut Vec<T>, max: usize) -> usize {
        let top = self.top.load(Ordering::SeqCst);
        let bottom = self.bottom.load(Ordering::SeqCst);
        let available = bottom.saturating_sub(top) as usize;
        if available == 0 || max == 0 {
            return 0;
        }

        let target = available.div_ceil(2).min(max);
        let mut moved = 0;
        while moved < target {
            match self.steal() {
                Steal::Success(value) => {
                    dest.push(value);
                    moved += 1;
                }
                Steal::Empty | Steal::Retry => break,
            }
        }
        moved
    }
}

impl<T> Drop for WorkDeque<T> {
    fn drop(&mut self) {
        let bottom = self.bottom.load(Ordering::Relaxed);
        let mut index = self.top.load(Ordering::Relaxed);
        while index != bottom {
            // SAFETY: exclusive access during drop; [top, bottom) holds
            // initialized values.
            unsafe { (*self.slot(index)).assume_init_drop() };
            index = index.wrapping_add(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn owner_lifo_order() {
        let deque = WorkDeque::with_capacity(8);
        deque.push_bottom(1u64).unwrap();
        deque.push_bottom(2).unwrap();
        deque.push_bottom(3).unwrap();
        assert_eq!(deque.pop_bottom(), Some(3));
        assert_eq!(deque.pop_bottom(), Some(2));
        assert_eq!(deque.pop_bottom(), Some(1));
        assert_eq!(deque.pop_bottom(), None);
    }

    #[test]
    fn thief_fifo_order() {
        let deque = WorkDeque::with_capacity(8);
        for i in 0..4u64 {
            deque.push_bottom(i).unwrap();
        }
        assert_eq!(deque.steal(), Steal::Success(0));
        assert_eq!(deque.steal(), Steal::Success(1));
        assert_eq!(deque.pop_bottom(), Some(3));
        assert_eq!(deque.pop_bottom(), Some(2));
        assert_eq!(deque.steal(), Steal::Empty);
    }

    #[test]
    fn capacity_bound_hands_value_back() {
        let deque = WorkDeque::with_capacity(2);
        deque.push_bottom(1u64).unwrap();
        deque.push_bottom(2).unwrap();
        assert_eq!(deque.push_bottom(3), Err(3));
    }

    #[test]
    fn half_steal_rounds_up_and_caps() {
        let deque = WorkDeque::with_capacity(16);
        for i in 0..9u64 {
            deque.push_bottom(i).unwrap();
        }

        let mut dest = Vec::new();
        // ceil(9/2) = 5, below the cap.
        assert_eq!(deque.steal_batch_into(&mut dest, 8), 5);
        assert_eq!(dest, vec![0, 1, 2, 3, 4]);

        // Remaining 4, cap of 1 wins over ceil(4/2) = 2.
        dest.clear();
        assert_eq!(deque.steal_batch_into(&mut dest, 1), 1);
        assert_eq!(dest, vec![5]);
    }

    #[test]
    fn single_item_steals_whole() {
        let deque = WorkDeque::with_capacity(4);
        deque.push_bottom(7u64).unwrap();
        let mut dest = Vec::new();
        assert_eq!(deque.steal_batch_into(&mut dest, 4), 1);
        assert_eq!(dest, vec![7]);
    }

    #[test]
    fn owner_and_thieves_partition_all_tasks() {
        const TASKS: u64 = 30_000;
        const THIEVES: usize = 3;

        let deque = Arc::new(WorkDeque::with_capacity(1024));
        let mut thieves = Vec::new();
        let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));

        for _ in 0..THIEVES {
            let deque = Arc::clone(&deque);
            let stop = Arc::clone(&stop);
            thieves.push(thread::spawn(move || {
                let mut taken = Vec::new();
                while !stop.load(Ordering::Relaxed) || !deque.is_empty() {
                    match deque.steal() {
                        Steal::Success(v) => taken.push(v),
                        Steal::Empty | Steal::Retry => thread::yield_now(),
                    }
                }
                taken
            }));
        }

        // Owner interleaves pushes and pops.
        let mut owner_taken = Vec::new();
        let mut next = 0u64;
        while next < TASKS {
            for _ in 0..16 {
                if next >= TASKS {
                    break;
                }
                if deque.push_bottom(next).is_ok() {
                    next += 1;
                } else if let Some(v) = deque.pop_bottom() {
                    owner_taken.push(v);
                }
            }
            if let Some(v) = deque.pop_bottom() {
                owner_taken.push(v);
            }
        }
        stop.store(true, Ordering::Relaxed);

        let mut all: HashSet<u64> = owner_taken.into_iter().collect();
        for t in thieves {
            for v in t.join().unwrap() {
                assert!(all.insert(v), "task {v} observed twice");
            }
        }
        assert_eq!(all.len() as u64, TASKS, "tasks lost");
    }
}
