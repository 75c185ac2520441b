use crate::error::Error;
use crate::filter::DEFAULT_ZERO_HASH_SENTINEL;

/// Tuning knobs for [`Dictionary`](crate::Dictionary), [`Set`](crate::Set),
/// and the [`Queue`](crate::Queue)'s resize back-pressure.
///
/// A `const fn new` that panics on out-of-range construction, a [`Default`]
/// impl, and named presets for the common profiles.
#[derive(Debug, Clone, Copy)]
pub struct Config {
    /// Initial table capacity. Rounded up to the next power of two; `0`
    /// normalizes to `16` rather than erroring.
    pub initial_capacity: usize,
    /// Number of records claimed per cooperative-copy chunk during a resize.
    pub copy_chunk_size: usize,
    /// Successor capacity above which back-pressure sleeps kick in for the
    /// third and later concurrent resizer.
    pub resize_backpressure_threshold: usize,
    /// Value substituted for a user hash of zero.
    pub zero_hash_sentinel: i32,
    /// Enable metrics collection (slight overhead; see [`crate::Metrics`]).
    pub enable_metrics: bool,
}

/// Hard ceiling on requested capacity (`2^30`); exceeding it is an
/// [`Error::CapacityTooLarge`](crate::Error::CapacityTooLarge).
pub const MAX_CAPACITY: usize = 1 << 30;

impl Config {
    /// Creates a configuration with custom settings.
    ///
    /// # Panics
    ///
    /// Panics if `initial_capacity` exceeds [`MAX_CAPACITY`], or if
    /// `copy_chunk_size` is `0`.
    pub const fn new(initial_capacity: usize, copy_chunk_size: usize, enable_metrics: bool) -> Self {
        assert!(initial_capacity <= MAX_CAPACITY, "initial_capacity exceeds 2^30");
        assert!(copy_chunk_size > 0, "copy_chunk_size must be nonzero");
        Self {
            initial_capacity,
            copy_chunk_size,
            resize_backpressure_threshold: 256 * 1024,
            zero_hash_sentinel: DEFAULT_ZERO_HASH_SENTINEL,
            enable_metrics,
        }
    }

    /// Like [`new`](Self::new), but reports an out-of-range capacity as
    /// [`Error::CapacityTooLarge`] instead of panicking. The right choice
    /// when `initial_capacity` comes from an untrusted or user-supplied
    /// value rather than a compile-time constant.
    pub fn try_new(initial_capacity: usize, copy_chunk_size: usize, enable_metrics: bool) -> Result<Self, Error> {
        if initial_capacity > MAX_CAPACITY {
            return Err(Error::CapacityTooLarge(initial_capacity));
        }
        assert!(copy_chunk_size > 0, "copy_chunk_size must be nonzero");
        Ok(Self {
            initial_capacity,
            copy_chunk_size,
            resize_backpressure_threshold: 256 * 1024,
            zero_hash_sentinel: DEFAULT_ZERO_HASH_SENTINEL,
            enable_metrics,
        })
    }

    /// Normalizes `initial_capacity` (treating `0` as "use the default") and
    /// rounds up to the next power of two.
    pub(crate) fn normalized_initial_capacity(&self) -> usize {
        let cap = if self.initial_capacity == 0 {
            Self::default().initial_capacity
        } else {
            self.initial_capacity
        };
        cap.next_power_of_two()
    }

    /// Favors low resize frequency over memory footprint: start big.
    pub fn high_throughput() -> Config {
        Config::new(1 << 16, 1024, false)
    }

    /// Favors small steady-state footprint; resizes more often under growth.
    pub fn low_latency() -> Config {
        Config::new(16, 256, false)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new(16, 1024, false)
    }
}
