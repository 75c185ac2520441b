//! Debug assertion macros for the table and queue state-machine invariants.
//!
//! Only active in debug builds (`#[cfg(debug_assertions)]`); zero overhead in
//! release builds.

// =============================================================================
// No-zero hash
// =============================================================================

/// Assert a zero-hash record holds no live value.
///
/// **Invariant**: if `hash == 0`, `slot` is absent or `Dead`.
macro_rules! debug_assert_no_zero_hash_live {
    ($hash:expr, $is_absent_or_dead:expr) => {
        debug_assert!(
            $hash != 0 || $is_absent_or_dead,
            "record with hash 0 holds a non-Dead, non-absent slot"
        )
    };
}

// =============================================================================
// Monotone hash
// =============================================================================

/// Assert a record's recorded hash never changes once nonzero.
macro_rules! debug_assert_monotone_hash {
    ($previous:expr, $observed:expr) => {
        debug_assert!(
            $previous == 0 || $previous == $observed,
            "record hash changed from {} to {}",
            $previous,
            $observed
        )
    };
}

// =============================================================================
// No duplicate live keys
// =============================================================================

/// Assert a newly-installed `Live` key does not duplicate another record
/// already holding the same filtered hash and key within the same table scan.
macro_rules! debug_assert_no_duplicate_live_key {
    ($already_seen:expr) => {
        debug_assert!(
            !$already_seen,
            "duplicate Live record for the same key observed in one table"
        )
    };
}

// =============================================================================
// Migration completion
// =============================================================================

/// Assert a table's cooperative copy never reports more units done than it
/// has capacity for.
macro_rules! debug_assert_copy_done_bounded {
    ($copy_done:expr, $capacity:expr) => {
        debug_assert!(
            $copy_done <= $capacity,
            "copy_done {} exceeds capacity {}",
            $copy_done,
            $capacity
        )
    };
}

pub(crate) use debug_assert_copy_done_bounded;
pub(crate) use debug_assert_monotone_hash;
pub(crate) use debug_assert_no_duplicate_live_key;
pub(crate) use debug_assert_no_zero_hash_live;
