//! Engine configuration.
//!
//! Mirrors the constants named throughout the design doc (segment size,
//! session limit, compaction threshold) as a small builder, the way the
//! teacher crate exposes an `Options` type rather than scattering tunables
//! across call sites.

/// Maximum number of concurrent sessions (readers + writers + compactor).
pub const MAX_SESSION_COUNT: usize = 64;

/// Default segment size: 32 MiB.
pub const DEFAULT_SEGMENT_SIZE: u64 = 32 * 1024 * 1024;

/// Alignment, in bytes, that every object is padded up to.
pub const OBJECT_ALIGN: u64 = 16;

/// Maximum key length accepted by the trie.
pub const MAX_KEY_LEN: usize = 1024;

/// Values at or below this size are inlined into their parent binary node.
pub const MAX_INLINE_VALUE_LEN: usize = 62;

/// Sync modes accepted by [`crate::Database::sync`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// Do nothing.
    None,
    /// `msync(MS_ASYNC)`: schedule the write-back, do not wait for it.
    MsyncAsync,
    /// `msync(MS_SYNC)`: block until the write-back completes.
    MsyncSync,
}

/// Engine-wide tunables, set at [`crate::Database::open`] time.
#[derive(Debug, Clone)]
pub struct Options {
    /// Size of each segment, in bytes. Must be a power of two.
    pub segment_size: u64,
    /// Maximum number of segments the free-queue ring can track at once.
    /// Also bounds the maximum database size (`max_segment_count *
    /// segment_size`) unless the ring is resized, which this engine does
    /// not support post-open.
    pub max_segment_count: usize,
    /// A segment is eligible for compaction once its free space exceeds
    /// `segment_size / compaction_threshold_divisor`.
    pub compaction_threshold_divisor: u64,
    /// Whether segments popped for (re)use are `mlock`ed.
    pub mlock_segments: bool,
    /// How long the compactor sleeps when nothing is eligible for
    /// compaction.
    pub compactor_idle_interval: std::time::Duration,
    /// Initial capacity of the id table, in number of ids. Grows on demand.
    pub initial_id_capacity: usize,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            segment_size: DEFAULT_SEGMENT_SIZE,
            max_segment_count: 1 << 16,
            compaction_threshold_divisor: 16,
            mlock_segments: false,
            compactor_idle_interval: std::time::Duration::from_millis(100),
            initial_id_capacity: 1 << 16,
        }
    }
}

impl Options {
    /// Start from defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the segment size. Must be called before [`crate::Database::open`].
    pub fn with_segment_size(mut self, size: u64) -> Self {
        assert!(size.is_power_of_two(), "segment_size must be a power of two");
        self.segment_size = size;
        self
    }

    /// Override the maximum tracked segment count.
    pub fn with_max_segment_count(mut self, n: usize) -> Self {
        assert!(n.is_power_of_two(), "max_segment_count must be a power of two");
        self.max_segment_count = n;
        self
    }

    /// Enable or disable `mlock` on reused segments.
    pub fn with_mlock(mut self, enabled: bool) -> Self {
        self.mlock_segments = enabled;
        self
    }

    /// The minimum amount of free space a finalized segment needs before the
    /// compactor will consider it.
    pub fn compaction_threshold(&self) -> u64 {
        self.segment_size / self.compaction_threshold_divisor
    }
}
