//! Spillway — non-blocking writer adapters for byte records.
//!
//! Sits between a high-frequency producer of byte records (typically a
//! structured logger emitting one serialized record per call) and a slower
//! downstream sink. Producers never block on I/O; when the sink cannot keep
//! up, each adapter applies a well-defined backpressure policy instead of
//! stalling the caller:
//!
//! - [`RingWriter`] — lock-free overwrite ring; the producer path is
//!   wait-free and the oldest unconsumed records are dropped (and counted)
//!   under overload.
//! - [`BatchWriter`] — accumulates records until a delay, count or byte
//!   threshold fires, then flushes a batch; soft overflows are reported,
//!   never raised to the producer.
//!
//! Both implement the [`Sink`] contract themselves, so adapters stack:
//! `records → RingWriter → BatchWriter → file`. The streaming pipeline
//! writer (map/filter stages, keyed aggregation) lives in the companion
//! `spillway-stream` crate.
//!
//! # Example
//!
//! ```ignore
//! use spillway::{BatchOptions, BatchWriter};
//!
//! let mut writer = BatchWriter::new(
//!     std::io::stdout(),
//!     BatchOptions::new().with_on_error(|fault| eprintln!("dropped writes: {fault}")),
//! );
//! writer.write(b"Hello, World!")?;
//! writer.close()?;
//! # std::io::Result::Ok(())
//! ```

mod batch;
mod batch_writer;
mod error;
mod pool;
mod ring;
mod ring_writer;
mod sink;

pub use batch::{
    Accumulator, Batch, BatchLimits, DEFAULT_BUFFERED_BYTE_LIMIT, DEFAULT_BYTE_LIMIT,
    DEFAULT_BYTE_THRESHOLD, DEFAULT_COUNT_THRESHOLD, DEFAULT_DELAY_THRESHOLD,
};
pub use batch_writer::{BatchOptions, BatchWriter, DEFAULT_ERROR_CHANNEL_CAPACITY};
pub use error::{is_closed, CloseOutcome, Fault, FaultHandler, WriterClosed};
pub use pool::BufferPool;
pub use ring::{OverwriteRing, Polled};
pub use ring_writer::{RingWriter, DEFAULT_POLL_INTERVAL};
pub use sink::Sink;

/// Locks a mutex, recovering the guard if a holder panicked.
pub(crate) fn lock<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
