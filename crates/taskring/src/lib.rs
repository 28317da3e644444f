//! Lock-free queueing structures for the workpool scheduler.
//!
//! This crate holds the data-plane primitives the pool coordinator is built
//! on. Nothing in here knows about executors, policies, or the wire format;
//! it is all index arithmetic and atomics:
//!
//! - [`SlotArena`]: a fixed arena of 64-byte task-metadata slots with a
//!   Treiber free list (generation-tagged head, so index reuse cannot ABA).
//! - [`SpmcRing`]: the shared ready queue. A single producer publishes packed
//!   `(priority, slot_index)` entries; any number of consumers pop them.
//! - [`MpmcQueue`]: a bounded Vyukov-style queue, generic over `T`. Carries
//!   completion records from executor reader tasks back to the dispatch loop.
//! - [`WorkDeque`]: a Chase-Lev deque. The owning dispatch path pushes and
//!   pops at the bottom (LIFO); thieves steal from the top (FIFO).
//! - [`DispatchQueue`]: the pluggable ordering disciplines (FIFO, LIFO,
//!   priority) behind one contract. Plain single-threaded structures, used
//!   only from the dispatch loop.
//! - [`Backoff`]: adaptive spin→yield budget used by every CAS retry loop,
//!   so contention degrades into a visible failure instead of a livelock.
//! - [`SeqLock`]: sequence-validated snapshot cell for small `Copy` state
//!   published from the single-writer dispatch loop to observers.
//!
//! # Sequence numbers everywhere
//!
//! Indices that cross threads (`head`, `tail`, deque `top`/`bottom`, the
//! free-list generation) are monotonic 64-bit counters. A 64-bit counter
//! never repeats a value within any realistic lifetime, which rules out the
//! ABA problem without hazard pointers or epochs: a CAS can only succeed
//! against the exact generation it observed.

mod arena;
mod backoff;
mod deque;
mod entry;
mod invariants;
mod mpmc;
mod queue;
mod seqlock;
mod spmc;

pub use arena::{SlotArena, SlotView, NIL_INDEX};
pub use backoff::Backoff;
pub use deque::{Steal, WorkDeque};
pub use entry::Entry;
pub use mpmc::MpmcQueue;
pub use queue::{DispatchQueue, FifoQueue, LifoQueue, PriorityQueue, QueueKind};
pub use seqlock::SeqLock;
pub use spmc::{RingError, SpmcRing};
