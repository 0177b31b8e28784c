//! Threshold-batching writer.

use crate::batch::{Accumulator, BatchLimits};
use crate::error::{closed_error, CloseOutcome, Fault, FaultHandler};
use crate::lock;
use crate::pool::BufferPool;
use crate::sink::Sink;
use std::io;
use std::sync::mpsc::{self, SyncSender, TrySendError};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::batch::{
    DEFAULT_BUFFERED_BYTE_LIMIT, DEFAULT_BYTE_LIMIT, DEFAULT_BYTE_THRESHOLD,
    DEFAULT_COUNT_THRESHOLD, DEFAULT_DELAY_THRESHOLD,
};

/// Default capacity of the internal fault channel.
pub const DEFAULT_ERROR_CHANNEL_CAPACITY: usize = 10;

/// Wait used by the flush worker when nothing is pending.
const IDLE_WAIT: Duration = Duration::from_millis(500);

/// Configuration for [`BatchWriter`].
///
/// All thresholds default to the values documented on the `DEFAULT_*`
/// constants. The `with_*` methods chain:
///
/// ```ignore
/// let options = BatchOptions::new()
///     .with_delay_threshold(Duration::from_millis(100))
///     .with_on_error(|fault| eprintln!("dropped writes: {fault}"));
/// ```
pub struct BatchOptions {
    /// Max time a record may sit unflushed.
    pub delay_threshold: Duration,
    /// Record count that triggers a flush.
    pub count_threshold: usize,
    /// Accumulated byte size that triggers a flush.
    pub byte_threshold: usize,
    /// Hard cap on bytes per single flushed batch; 0 means unlimited.
    pub byte_limit: usize,
    /// Total bytes held in memory before further writes overflow.
    pub buffered_byte_limit: usize,
    /// Capacity of the internal fault channel.
    pub error_channel_capacity: usize,
    on_error: Option<FaultHandler>,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            delay_threshold: DEFAULT_DELAY_THRESHOLD,
            count_threshold: DEFAULT_COUNT_THRESHOLD,
            byte_threshold: DEFAULT_BYTE_THRESHOLD,
            byte_limit: DEFAULT_BYTE_LIMIT,
            buffered_byte_limit: DEFAULT_BUFFERED_BYTE_LIMIT,
            error_channel_capacity: DEFAULT_ERROR_CHANNEL_CAPACITY,
            on_error: None,
        }
    }
}

impl BatchOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the interval at which pending records are flushed.
    pub fn with_delay_threshold(mut self, delay: Duration) -> Self {
        self.delay_threshold = delay;
        self
    }

    /// Sets the record count after which a flush fires.
    pub fn with_count_threshold(mut self, count: usize) -> Self {
        self.count_threshold = count;
        self
    }

    /// Sets the accumulated byte size after which a flush fires.
    pub fn with_byte_threshold(mut self, bytes: usize) -> Self {
        self.byte_threshold = bytes;
        self
    }

    /// Sets the maximum size of a single flushed batch; zero means unlimited.
    pub fn with_byte_limit(mut self, bytes: usize) -> Self {
        self.byte_limit = bytes;
        self
    }

    /// Sets the total bytes kept in memory before writes report
    /// [`Fault::Overflow`].
    pub fn with_buffered_byte_limit(mut self, bytes: usize) -> Self {
        self.buffered_byte_limit = bytes;
        self
    }

    /// Sets the capacity of the fault channel.
    pub fn with_error_channel_capacity(mut self, capacity: usize) -> Self {
        self.error_channel_capacity = capacity;
        self
    }

    /// Sets the fault handler. The default logs through `tracing`.
    pub fn with_on_error<F>(mut self, handler: F) -> Self
    where
        F: FnMut(Fault) + Send + 'static,
    {
        self.on_error = Some(Box::new(handler));
        self
    }

    fn limits(&self) -> BatchLimits {
        BatchLimits {
            delay_threshold: self.delay_threshold,
            count_threshold: self.count_threshold,
            byte_threshold: self.byte_threshold,
            byte_limit: self.byte_limit,
            buffered_byte_limit: self.buffered_byte_limit,
        }
    }
}

struct State {
    acc: Accumulator<Vec<u8>>,
    /// Bytes taken by the flush worker but not yet written to the sink.
    /// They still count against `buffered_byte_limit`.
    in_flight: usize,
    closed: bool,
    faults: Option<SyncSender<Fault>>,
}

struct Core {
    state: Mutex<State>,
    wake: Condvar,
}

struct Inner {
    core: Arc<Core>,
    worker: Mutex<Option<JoinHandle<io::Result<()>>>>,
    forwarder: Mutex<Option<JoinHandle<()>>>,
    outcome: Mutex<CloseOutcome>,
}

/// Writer that accumulates records and flushes them in batches.
///
/// A batch flushes when the record count, the accumulated byte size, or the
/// age of the oldest unflushed record crosses its threshold — whichever
/// fires first. `write` copies the record into a pool-backed buffer and
/// enqueues it without ever waiting on the sink; when the buffered-byte
/// limit would be exceeded the record is dropped, [`Fault::Overflow`] is
/// reported, and `write` still returns success. Only a closed writer fails
/// the caller.
///
/// Flushes are serialised on a single worker thread: records are written
/// individually, in enqueue order, and batches never overlap on the sink.
/// Fault events travel through a bounded channel to a forwarder thread so
/// the handler runs on exactly one thread.
#[derive(Clone)]
pub struct BatchWriter {
    inner: Arc<Inner>,
}

impl BatchWriter {
    /// Creates a batching writer over `sink`.
    pub fn new<S: Sink + 'static>(sink: S, mut options: BatchOptions) -> Self {
        let mut on_error = options.on_error.take().unwrap_or_else(|| {
            Box::new(|fault: Fault| tracing::warn!(%fault, "dropped writes"))
        });
        let (fault_tx, fault_rx) = mpsc::sync_channel(options.error_channel_capacity.max(1));

        let forwarder = thread::spawn(move || {
            for fault in fault_rx {
                on_error(fault);
            }
        });

        let core = Arc::new(Core {
            state: Mutex::new(State {
                acc: Accumulator::new(options.limits()),
                in_flight: 0,
                closed: false,
                faults: Some(fault_tx.clone()),
            }),
            wake: Condvar::new(),
        });

        let worker = {
            let core = Arc::clone(&core);
            thread::spawn(move || flush_loop(&core, sink, fault_tx))
        };

        Self {
            inner: Arc::new(Inner {
                core,
                worker: Mutex::new(Some(worker)),
                forwarder: Mutex::new(Some(forwarder)),
                outcome: Mutex::new(CloseOutcome::default()),
            }),
        }
    }

    /// Enqueues one record for a later flush.
    ///
    /// Never blocks on the sink. Returns the input length on success — also
    /// when the record overflows the buffered-byte limit, in which case the
    /// loss is reported through the fault handler instead.
    pub fn write(&mut self, record: &[u8]) -> io::Result<usize> {
        let mut state = lock(&self.inner.core.state);
        if state.closed {
            return Err(closed_error());
        }

        if state.acc.would_overflow(record.len(), state.in_flight) {
            let fault = Fault::Overflow {
                buffered: state.acc.bytes() + state.in_flight + record.len(),
                limit: state.acc.limits().buffered_byte_limit,
            };
            report(&state.faults, fault);
            return Ok(record.len());
        }

        let copy = BufferPool::global().copy_from(record);
        let was_empty = state.acc.is_empty();
        state.acc.push(copy, record.len());
        // Wake the worker when a threshold fires, or on the first record so
        // it can arm the delay deadline.
        if was_empty || state.acc.ready() {
            self.inner.core.wake.notify_one();
        }

        Ok(record.len())
    }

    /// Flushes everything pending, closes the sink and joins the workers.
    ///
    /// Idempotent: repeat calls replay the first outcome.
    pub fn close(&mut self) -> io::Result<()> {
        let mut outcome = lock(&self.inner.outcome);
        if let Some(result) = outcome.replay() {
            return result;
        }

        {
            let mut state = lock(&self.inner.core.state);
            state.closed = true;
            state.faults = None;
            self.inner.core.wake.notify_all();
        }

        let result = match lock(&self.inner.worker).take() {
            Some(handle) => handle
                .join()
                .unwrap_or_else(|_| Err(io::Error::other("flush worker panicked"))),
            None => Ok(()),
        };

        // The worker dropped its fault sender on exit; the forwarder drains
        // what is left and finishes.
        if let Some(handle) = lock(&self.inner.forwarder).take() {
            let _ = handle.join();
        }

        outcome.record(&result);
        result
    }
}

impl Sink for BatchWriter {
    fn write(&mut self, record: &[u8]) -> io::Result<usize> {
        BatchWriter::write(self, record)
    }

    fn close(&mut self) -> io::Result<()> {
        BatchWriter::close(self)
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if lock(&self.outcome).is_closed() {
            return;
        }
        {
            let mut state = lock(&self.core.state);
            state.closed = true;
            state.faults = None;
            self.core.wake.notify_all();
        }
        if let Some(handle) = lock(&self.worker).take() {
            if let Ok(Err(err)) = handle.join() {
                tracing::warn!(error = %err, "sink close failed during batch writer drop");
            }
        }
        if let Some(handle) = lock(&self.forwarder).take() {
            let _ = handle.join();
        }
    }
}

fn report(faults: &Option<SyncSender<Fault>>, fault: Fault) {
    let Some(tx) = faults else { return };
    if let Err(err) = tx.try_send(fault) {
        let fault = match err {
            TrySendError::Full(fault) | TrySendError::Disconnected(fault) => fault,
        };
        tracing::warn!(%fault, "fault channel unavailable, dropping diagnostic");
    }
}

fn flush_loop<S: Sink>(core: &Core, mut sink: S, faults: SyncSender<Fault>) -> io::Result<()> {
    let pool = BufferPool::global();
    let faults = Some(faults);

    loop {
        let batch = {
            let mut state = lock(&core.state);
            loop {
                if state.acc.ready() || (state.closed && !state.acc.is_empty()) {
                    let batch = state.acc.take_batch();
                    if let Some(batch) = &batch {
                        state.in_flight += batch.bytes;
                    }
                    break batch;
                }
                if state.closed {
                    break None;
                }
                let wait = state.acc.due_in().unwrap_or(IDLE_WAIT);
                state = core
                    .wake
                    .wait_timeout(state, wait)
                    .unwrap_or_else(PoisonError::into_inner)
                    .0;
            }
        };

        let Some(batch) = batch else { break };

        let bytes = batch.bytes;
        for record in batch.items {
            if let Err(err) = sink.write(&record) {
                report(&faults, Fault::Sink(err));
            }
            pool.release(record);
        }
        lock(&core.state).in_flight -= bytes;
    }

    sink.close()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::is_closed;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl SharedBuf {
        fn contents(&self) -> Vec<u8> {
            lock(&self.0).clone()
        }
    }

    impl io::Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            lock(&self.0).extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_close_flushes_pending_records() {
        let buf = SharedBuf::default();
        let mut writer = BatchWriter::new(buf.clone(), BatchOptions::default());

        writer.write(b"Hello, World!").unwrap();
        writer.close().unwrap();

        assert_eq!(buf.contents(), b"Hello, World!");
    }

    #[test]
    fn test_count_threshold_flushes_without_close() {
        let buf = SharedBuf::default();
        let options = BatchOptions::new()
            .with_count_threshold(3)
            .with_delay_threshold(Duration::from_secs(60));
        let mut writer = BatchWriter::new(buf.clone(), options);

        for _ in 0..3 {
            writer.write(b"x").unwrap();
        }

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while buf.contents().len() < 3 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(buf.contents(), b"xxx");

        writer.close().unwrap();
    }

    #[test]
    fn test_delay_threshold_flushes_without_close() {
        let buf = SharedBuf::default();
        let options = BatchOptions::new().with_delay_threshold(Duration::from_millis(20));
        let mut writer = BatchWriter::new(buf.clone(), options);

        writer.write(b"slow").unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while buf.contents().is_empty() && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(buf.contents(), b"slow");

        writer.close().unwrap();
    }

    #[test]
    fn test_overflow_reports_but_write_succeeds() {
        struct GatedSink {
            gate: std::sync::mpsc::Receiver<()>,
        }

        impl Sink for GatedSink {
            fn write(&mut self, _record: &[u8]) -> io::Result<usize> {
                let _ = self.gate.recv_timeout(Duration::from_secs(5));
                Ok(0)
            }

            fn close(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let (gate_tx, gate_rx) = std::sync::mpsc::channel();
        let overflows = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&overflows);

        let options = BatchOptions::new()
            .with_buffered_byte_limit(1024)
            .with_on_error(move |fault| {
                if matches!(fault, Fault::Overflow { .. }) {
                    seen.fetch_add(1, Ordering::SeqCst);
                }
            });
        let mut writer = BatchWriter::new(GatedSink { gate: gate_rx }, options);

        // 10 KiB against a 1 KiB limit with a blocked sink.
        let record = [b'a'; 256];
        for _ in 0..40 {
            assert_eq!(writer.write(&record).unwrap(), record.len());
        }

        for _ in 0..40 {
            let _ = gate_tx.send(());
        }
        writer.close().unwrap();

        assert!(overflows.load(Ordering::SeqCst) > 0);
    }

    #[test]
    fn test_write_after_close_fails() {
        let mut writer = BatchWriter::new(Vec::new(), BatchOptions::default());
        writer.close().unwrap();

        let err = writer.write(b"late").unwrap_err();
        assert!(is_closed(&err));
    }

    #[test]
    fn test_close_is_idempotent() {
        let mut writer = BatchWriter::new(Vec::new(), BatchOptions::default());
        writer.write(b"x").unwrap();
        writer.close().unwrap();
        writer.close().unwrap();
    }

    #[test]
    fn test_byte_limit_splits_batches() {
        #[derive(Clone, Default)]
        struct CountingSink {
            writes: Arc<AtomicUsize>,
        }

        impl Sink for CountingSink {
            fn write(&mut self, record: &[u8]) -> io::Result<usize> {
                self.writes.fetch_add(1, Ordering::SeqCst);
                Ok(record.len())
            }

            fn close(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let sink = CountingSink::default();
        let writes = Arc::clone(&sink.writes);
        let options = BatchOptions::new().with_byte_limit(8);
        let mut writer = BatchWriter::new(sink, options);

        for _ in 0..6 {
            writer.write(b"aaaaaa").unwrap();
        }
        writer.close().unwrap();

        // One sink write per record regardless of how batches were split.
        assert_eq!(writes.load(Ordering::SeqCst), 6);
    }
}
