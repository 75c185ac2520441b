//! Hash filter (C2): maps a user hash of zero to a fixed sentinel so a
//! record's `hash == 0` unambiguously means "never written".

/// Default sentinel substituted for a user hash of zero.
///
/// Whether a friendlier distribution constant should be used instead is left
/// to the distribution-correction filter callers may compose in front of
/// their [`std::hash::BuildHasher`]; a caller that cares can override it via
/// [`crate::Config::zero_hash_sentinel`].
pub const DEFAULT_ZERO_HASH_SENTINEL: i32 = 0x5555_5555u32 as i32;

/// Filters `h`, replacing zero with `sentinel`. Any nonzero hash passes
/// through unchanged.
#[inline]
pub(crate) fn filter_hash(h: i32, sentinel: i32) -> i32 {
    if h == 0 {
        sentinel
    } else {
        h
    }
}
