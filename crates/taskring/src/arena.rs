use crate::invariants::{debug_assert_refcount_live, debug_assert_slot_in_range};
use crate::Backoff;
use crossbeam_utils::CachePadded;
use std::sync::atomic::{AtomicI32, AtomicU32, AtomicU64, Ordering};
use std::time::Instant;

/// Sentinel index meaning "free list exhausted".
pub const NIL_INDEX: u32 = u32::MAX;

const STATE_FREE: u32 = 0;
const STATE_ALLOCATED: u32 = 1;

/// One 64-byte task-metadata record.
///
/// When the slot is on the free list, `next_or_task` holds the next free
/// index (widened to u64). When allocated, the same word holds the task id.
/// The overlay is safe because the two uses never coexist: the word is
/// rewritten inside `allocate` after the slot has been unlinked, and again
/// inside the final `release` before it is pushed back.
#[repr(C, align(64))]
struct Slot {
    state: AtomicU32,
    refcount: AtomicU32,
    next_or_task: AtomicU64,
    priority: AtomicI32,
    method_id: AtomicU32,
    timestamp_micros: AtomicU64,
}

impl Slot {
    fn new(next_free: u32) -> Self {
        Self {
            state: AtomicU32::new(STATE_FREE),
            refcount: AtomicU32::new(0),
            next_or_task: AtomicU64::new(u64::from(next_free)),
            priority: AtomicI32::new(0),
            method_id: AtomicU32::new(0),
            timestamp_micros: AtomicU64::new(0),
        }
    }
}

/// Read-only view of an allocated slot's metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotView {
    pub task_id: u64,
    pub priority: i16,
    pub method_id: u32,
    pub timestamp_micros: u64,
    pub refcount: u32,
}

/// Fixed arena of task slots fed by a lock-free Treiber free list.
///
/// The free-list head packs a 32-bit generation tag beside the 32-bit head
/// index into one `AtomicU64`. Every successful pop or push bumps the tag,
/// so a CAS that observed generation `g` cannot succeed after the head was
/// recycled through the same index — the classic Treiber ABA hazard is
/// structurally excluded.
pub struct SlotArena {
    slots: Box<[Slot]>,
    /// Packed `[32-bit generation | 32-bit head index]`.
    free_head: CachePadded<AtomicU64>,
    allocated: CachePadded<AtomicU32>,
    epoch: Instant,
}

#[inline]
fn pack_head(tag: u32, index: u32) -> u64 {
    (u64::from(tag) << 32) | u64::from(index)
}

#[inline]
fn unpack_head(packed: u64) -> (u32, u32) {
    ((packed >> 32) as u32, packed as u32)
}

impl SlotArena {
    /// Creates an arena of `capacity` slots, all free, linked `0 → 1 → …`.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero or does not fit a 32-bit index with the
    /// sentinel reserved.
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity > 0, "arena capacity must be non-zero");
        assert!(
            capacity < NIL_INDEX as usize,
            "arena capacity must leave the sentinel index free"
        );

        let slots: Box<[Slot]> = (0..capacity)
            .map(|i| {
                let next = if i + 1 == capacity { NIL_INDEX } else { (i + 1) as u32 };
                Slot::new(next)
            })
            .collect();

        Self {
            slots,
            free_head: CachePadded::new(AtomicU64::new(pack_head(0, 0))),
            allocated: CachePadded::new(AtomicU32::new(0)),
            epoch: Instant::now(),
        }
    }

    /// Number of slots in the arena.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Currently allocated slot count (approximate under concurrency).
    #[inline]
    pub fn allocated(&self) -> usize {
        self.allocated.load(Ordering::Relaxed) as usize
    }

    /// Pops a slot off the free list and stamps it with task metadata.
    ///
    /// Returns `None` when the arena is exhausted, which the coordinator
    /// surfaces as a queue-full condition.
    pub fn allocate(&self, task_id: u64, priority: i16, method_id: u32) -> Option<u32> {
        let mut backoff = Backoff::new();
        loop {
            let observed = self.free_head.load(Ordering::Acquire);
            let (tag, index) = unpack_head(observed);
            if index == NIL_INDEX {
                return None;
            }

            let slot = &self.slots[index as usize];
            let next = slot.next_or_task.load(Ordering::Acquire) as u32;

            if self
                .free_head
                .compare_exchange_weak(
                    observed,
                    pack_head(tag.wrapping_add(1), next),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                slot.next_or_task.store(task_id, Ordering::Relaxed);
                slot.priority.store(i32::from(priority), Ordering::Relaxed);
                slot.method_id.store(method_id, Ordering::Relaxed);
                slot.timestamp_micros
                    .store(self.epoch.elapsed().as_micros() as u64, Ordering::Relaxed);
                slot.refcount.store(1, Ordering::Relaxed);
                slot.state.store(STATE_ALLOCATED, Ordering::Release);
                self.allocated.fetch_add(1, Ordering::Relaxed);
                return Some(index);
            }

            backoff.spin();
        }
    }

    /// Snapshots the metadata of an allocated slot.
    pub fn view(&self, index: u32) -> SlotView {
        debug_assert_slot_in_range!(index, self.capacity());
        let slot = &self.slots[index as usize];
        SlotView {
            task_id: slot.next_or_task.load(Ordering::Acquire),
            priority: slot.priority.load(Ordering::Relaxed) as i16,
            method_id: slot.method_id.load(Ordering::Relaxed),
            timestamp_micros: slot.timestamp_micros.load(Ordering::Relaxed),
            refcount: slot.refcount.load(Ordering::Relaxed),
        }
    }

    /// True if the slot is currently allocated.
    pub fn is_allocated(&self, index: u32) -> bool {
        debug_assert_slot_in_range!(index, self.capacity());
        self.slots[index as usize].state.load(Ordering::Acquire) == STATE_ALLOCATED
    }

    /// Adds a reference to an allocated slot.
    pub fn retain(&self, index: u32) {
        debug_assert_slot_in_range!(index, self.capacity());
        self.slots[index as usize]
            .refcount
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Drops one reference; the last reference returns the slot to the
    /// free list.
    pub fn release(&self, index: u32) {
        debug_assert_slot_in_range!(index, self.capacity());
        let slot = &self.slots[index as usize];
        let previous = slot.refcount.fetch_sub(1, Ordering::AcqRel);
        debug_assert_refcount_live!(previous, index);
        if previous != 1 {
            return;
        }

        slot.state.store(STATE_FREE, Ordering::Release);

        let mut backoff = Backoff::new();
        loop {
            let observed = self.free_head.load(Ordering::Acquire);
            let (tag, head_index) = unpack_head(observed);
            slot.next_or_task
                .store(u64::from(head_index), Ordering::Relaxed);

            if self
                .free_head
                .compare_exchange_weak(
                    observed,
                    pack_head(tag.wrapping_add(1), index),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                self.allocated.fetch_sub(1, Ordering::Relaxed);
                return;
            }

            backoff.spin();
        }
    }
}
