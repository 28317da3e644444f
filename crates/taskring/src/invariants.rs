//! Debug assertion macros for the lock-free structures.
//!
//! Active only under `debug_assertions`; release builds pay nothing. Each
//! macro states one protocol rule the surrounding algorithm relies on.

/// Item count in a bounded ring never exceeds its capacity.
macro_rules! debug_assert_bounded_count {
    ($count:expr, $capacity:expr) => {
        debug_assert!(
            $count <= $capacity,
            "ring count {} exceeds capacity {}",
            $count,
            $capacity
        )
    };
}

/// A shared sequence counter only moves forward.
macro_rules! debug_assert_monotonic {
    ($name:literal, $old:expr, $new:expr) => {
        debug_assert!(
            $new >= $old,
            "{} moved backwards: {} -> {}",
            $name,
            $old,
            $new
        )
    };
}

/// The consumer cursor never passes the producer cursor.
macro_rules! debug_assert_head_not_past_tail {
    ($head:expr, $tail:expr) => {
        debug_assert!(
            $head <= $tail,
            "head {} advanced past tail {}",
            $head,
            $tail
        )
    };
}

/// A slot index handed across the arena boundary is in range.
macro_rules! debug_assert_slot_in_range {
    ($index:expr, $capacity:expr) => {
        debug_assert!(
            ($index as usize) < $capacity,
            "slot index {} outside arena of {} slots",
            $index,
            $capacity
        )
    };
}

/// A freed slot still had a live reference count.
macro_rules! debug_assert_refcount_live {
    ($count:expr, $index:expr) => {
        debug_assert!(
            $count > 0,
            "release of slot {} with refcount already zero",
            $index
        )
    };
}

pub(crate) use debug_assert_bounded_count;
pub(crate) use debug_assert_head_not_past_tail;
pub(crate) use debug_assert_monotonic;
pub(crate) use debug_assert_refcount_live;
pub(crate) use debug_assert_slot_in_range;
