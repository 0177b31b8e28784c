//! Pure accumulation state machine shared by the batching writer and the
//! aggregator's per-key groups.
//!
//! Concurrency is an orthogonal concern and deliberately absent here: no
//! locks, no atomics, no I/O. The [`BatchWriter`](crate::BatchWriter) wraps
//! an [`Accumulator`] in a mutex and a flush worker; the aggregator keeps one
//! per key. This keeps threshold arithmetic testable in isolation.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Default max time a record may sit unflushed.
pub const DEFAULT_DELAY_THRESHOLD: Duration = Duration::from_secs(1);
/// Default record count that triggers a flush.
pub const DEFAULT_COUNT_THRESHOLD: usize = 1000;
/// Default accumulated byte size that triggers a flush (1 MiB).
pub const DEFAULT_BYTE_THRESHOLD: usize = 1 << 20;
/// Default hard cap on bytes per flushed batch (0 = unlimited).
pub const DEFAULT_BYTE_LIMIT: usize = 0;
/// Default cap on bytes held in memory before adds overflow (8 MiB).
pub const DEFAULT_BUFFERED_BYTE_LIMIT: usize = 8 << 20;

/// Flush thresholds for an [`Accumulator`].
#[derive(Debug, Clone)]
pub struct BatchLimits {
    /// Max time the oldest pending item may wait before a flush fires.
    pub delay_threshold: Duration,
    /// Pending item count that fires a flush.
    pub count_threshold: usize,
    /// Pending byte size that fires a flush.
    pub byte_threshold: usize,
    /// Hard cap on bytes per single flushed batch; 0 means unlimited.
    pub byte_limit: usize,
    /// Total bytes that may be held in memory before adds overflow.
    pub buffered_byte_limit: usize,
}

impl Default for BatchLimits {
    fn default() -> Self {
        Self {
            delay_threshold: DEFAULT_DELAY_THRESHOLD,
            count_threshold: DEFAULT_COUNT_THRESHOLD,
            byte_threshold: DEFAULT_BYTE_THRESHOLD,
            byte_limit: DEFAULT_BYTE_LIMIT,
            buffered_byte_limit: DEFAULT_BUFFERED_BYTE_LIMIT,
        }
    }
}

/// One flushable batch: items in arrival order plus their total byte size.
#[derive(Debug)]
pub struct Batch<T> {
    pub items: Vec<T>,
    pub bytes: usize,
}

struct Entry<T> {
    item: T,
    size: usize,
    at: Instant,
}

/// Groups items and decides when to flush based on count, byte and delay
/// thresholds.
///
/// `T` is whatever the caller batches — raw records for the batching writer,
/// tagged records for aggregator groups. Sizes are supplied by the caller so
/// the accounting policy (true bytes here) stays explicit.
pub struct Accumulator<T> {
    pending: VecDeque<Entry<T>>,
    bytes: usize,
    limits: BatchLimits,
}

impl<T> Accumulator<T> {
    /// Creates an empty accumulator with the given thresholds.
    pub fn new(limits: BatchLimits) -> Self {
        Self {
            pending: VecDeque::new(),
            bytes: 0,
            limits,
        }
    }

    /// The configured thresholds.
    pub fn limits(&self) -> &BatchLimits {
        &self.limits
    }

    /// Number of pending items.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Returns `true` when nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Total pending byte size.
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    /// Returns `true` if adding `size` more bytes would breach the
    /// buffered-byte limit, given bytes the caller still holds in flight.
    pub fn would_overflow(&self, size: usize, in_flight: usize) -> bool {
        self.bytes + in_flight + size > self.limits.buffered_byte_limit
    }

    /// Appends an item of the given byte size.
    pub fn push(&mut self, item: T, size: usize) {
        self.bytes += size;
        self.pending.push_back(Entry {
            item,
            size,
            at: Instant::now(),
        });
    }

    /// Returns `true` when any flush threshold has fired.
    pub fn ready(&self) -> bool {
        match self.pending.front() {
            None => false,
            Some(oldest) => {
                self.pending.len() >= self.limits.count_threshold
                    || self.bytes >= self.limits.byte_threshold
                    || oldest.at.elapsed() >= self.limits.delay_threshold
            }
        }
    }

    /// Time until the delay threshold fires, or `None` when empty.
    pub fn due_in(&self) -> Option<Duration> {
        self.pending
            .front()
            .map(|oldest| self.limits.delay_threshold.saturating_sub(oldest.at.elapsed()))
    }

    /// Takes the next batch in arrival order, honouring `byte_limit`.
    ///
    /// A nonzero `byte_limit` splits the pending queue into multiple batches;
    /// a single item larger than the limit still flushes alone. Returns
    /// `None` when nothing is pending.
    pub fn take_batch(&mut self) -> Option<Batch<T>> {
        let first = self.pending.pop_front()?;
        let mut bytes = first.size;
        let mut items = vec![first.item];

        while let Some(front) = self.pending.front() {
            if self.limits.byte_limit > 0 && bytes + front.size > self.limits.byte_limit {
                break;
            }
            if let Some(entry) = self.pending.pop_front() {
                bytes += entry.size;
                items.push(entry.item);
            }
        }

        self.bytes -= bytes;
        Some(Batch { items, bytes })
    }

    /// Clears all pending state, readying the accumulator for reuse.
    pub fn reset(&mut self) {
        self.pending.clear();
        self.bytes = 0;
    }
}
