//! Drop-on-overflow ring writer.

use crate::error::{closed_error, CloseOutcome, Fault};
use crate::lock;
use crate::pool::BufferPool;
use crate::ring::{OverwriteRing, Polled};
use crate::sink::Sink;
use crossbeam_utils::Backoff;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Poll interval used when the caller passes `Duration::ZERO`.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);

struct Shared {
    ring: OverwriteRing,
    closed: AtomicBool,
}

struct Inner {
    shared: Arc<Shared>,
    consumer: Mutex<Option<JoinHandle<io::Result<()>>>>,
    outcome: Mutex<CloseOutcome>,
}

/// Non-blocking writer backed by an [`OverwriteRing`].
///
/// `write` copies the record into a pool-backed buffer and publishes it with
/// a wait-free ring operation: it never takes a lock, never waits on the
/// consumer, and returns the input length even if the payload is later
/// overwritten. A dedicated consumer thread drains the ring in ring order,
/// performing one sink write per record; when the sink cannot keep up, the
/// oldest unconsumed records are overwritten and reported through the fault
/// handler as [`Fault::Lost`].
///
/// Handles are cheap to clone; each producer thread should hold its own.
/// Per-producer FIFO is preserved, interleaving across producers is
/// best-effort.
///
/// # Example
///
/// ```ignore
/// let writer = RingWriter::new(file, 4096, Duration::ZERO, |fault| {
///     eprintln!("dropped writes: {fault}");
/// });
/// ```
#[derive(Clone)]
pub struct RingWriter {
    inner: Arc<Inner>,
}

impl RingWriter {
    /// Creates a ring writer over `sink`.
    ///
    /// `capacity` is rounded up to a power of two. `poll_interval` bounds
    /// how long the consumer sleeps when the ring is empty; pass
    /// `Duration::ZERO` for the default. `on_fault` receives loss counts and
    /// sink errors, serially, from the consumer thread only.
    pub fn new<S, F>(sink: S, capacity: usize, poll_interval: Duration, on_fault: F) -> Self
    where
        S: Sink + 'static,
        F: FnMut(Fault) + Send + 'static,
    {
        let shared = Arc::new(Shared {
            ring: OverwriteRing::with_capacity(capacity),
            closed: AtomicBool::new(false),
        });
        let poll = if poll_interval.is_zero() {
            DEFAULT_POLL_INTERVAL
        } else {
            poll_interval
        };

        let consumer = {
            let shared = Arc::clone(&shared);
            thread::spawn(move || consume(&shared, sink, poll, on_fault))
        };

        Self {
            inner: Arc::new(Inner {
                shared,
                consumer: Mutex::new(Some(consumer)),
                outcome: Mutex::new(CloseOutcome::default()),
            }),
        }
    }

    /// Publishes one record. Wait-free; returns the input length even when
    /// the record is later dropped on overflow.
    pub fn write(&mut self, record: &[u8]) -> io::Result<usize> {
        if self.inner.shared.closed.load(Ordering::Acquire) {
            return Err(closed_error());
        }

        let pool = BufferPool::global();
        let copy = pool.copy_from(record);
        if let Some(overwritten) = self.inner.shared.ring.publish(copy) {
            pool.release(overwritten);
        }

        Ok(record.len())
    }

    /// Drains the ring, closes the sink and joins the consumer.
    ///
    /// Idempotent: repeat calls replay the first outcome.
    pub fn close(&mut self) -> io::Result<()> {
        let mut outcome = lock(&self.inner.outcome);
        if let Some(result) = outcome.replay() {
            return result;
        }

        self.inner.shared.closed.store(true, Ordering::Release);
        let result = match lock(&self.inner.consumer).take() {
            Some(handle) => {
                handle.thread().unpark();
                handle
                    .join()
                    .unwrap_or_else(|_| Err(io::Error::other("ring consumer panicked")))
            }
            None => Ok(()),
        };

        outcome.record(&result);
        result
    }
}

impl Sink for RingWriter {
    fn write(&mut self, record: &[u8]) -> io::Result<usize> {
        RingWriter::write(self, record)
    }

    fn close(&mut self) -> io::Result<()> {
        RingWriter::close(self)
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if lock(&self.outcome).is_closed() {
            return;
        }
        // Best-effort close so the consumer thread never outlives the last
        // handle.
        self.shared.closed.store(true, Ordering::Release);
        if let Some(handle) = lock(&self.consumer).take() {
            handle.thread().unpark();
            if let Ok(Err(err)) = handle.join() {
                tracing::warn!(error = %err, "sink close failed during ring writer drop");
            }
        }
    }
}

fn consume<S, F>(shared: &Shared, mut sink: S, poll: Duration, mut on_fault: F) -> io::Result<()>
where
    S: Sink,
    F: FnMut(Fault),
{
    let pool = BufferPool::global();

    let mut emit = |sink: &mut S, record: Vec<u8>, lost: u64, on_fault: &mut F| {
        if lost > 0 {
            on_fault(Fault::Lost(lost));
        }
        if let Err(err) = sink.write(&record) {
            on_fault(Fault::Sink(err));
        }
        pool.release(record);
    };

    // Open phase: poll, park when idle. Producers never signal the consumer;
    // that keeps their path wait-free at the cost of up to `poll` latency.
    while !shared.closed.load(Ordering::Acquire) {
        match shared.ring.poll() {
            Polled::Item { record, lost } => emit(&mut sink, record, lost, &mut on_fault),
            Polled::Stale(record) => pool.release(record),
            Polled::Empty => thread::park_timeout(poll),
        }
    }

    // Drain phase: consume every claimed sequence. A claimed-but-unpublished
    // slot is moments away from its swap, so spin briefly instead of parking.
    let backoff = Backoff::new();
    while !shared.ring.is_drained() {
        match shared.ring.poll() {
            Polled::Item { record, lost } => emit(&mut sink, record, lost, &mut on_fault),
            Polled::Stale(record) => pool.release(record),
            Polled::Empty => {
                if backoff.is_completed() {
                    thread::yield_now();
                } else {
                    backoff.snooze();
                }
            }
        }
    }

    sink.close()
}
