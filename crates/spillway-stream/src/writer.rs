//! The streaming pipeline writer.

use crate::item::Item;
use crate::lock;
use crate::pipeline;
use crate::stage::Stage;
use crossbeam_channel::{Receiver, Sender};
use spillway::{BufferPool, CloseOutcome, Sink, WriterClosed};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

/// Configuration for [`StreamWriter`].
#[derive(Debug, Clone)]
pub struct StreamOptions {
    /// Capacity of every inter-stage channel.
    ///
    /// The default of 0 makes each hop a rendezvous: `write` blocks until
    /// the head stage accepts the record. This writer trades the
    /// wait-freedom of the ring and batching writers for transformation
    /// correctness; a nonzero capacity buys back slack.
    pub channel_capacity: usize,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            channel_capacity: 0,
        }
    }
}

impl StreamOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the inter-stage channel capacity.
    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity;
        self
    }
}

struct Inner {
    head: Mutex<Option<Sender<Item>>>,
    errored: Arc<AtomicBool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    consumer: Mutex<Option<JoinHandle<io::Result<()>>>>,
    outcome: Mutex<CloseOutcome>,
}

/// Writer that runs every record through a stage pipeline before the sink.
///
/// Records enter at [`write`](StreamWriter::write), flow through the
/// configured [`Stage`] chain, and a tail consumer writes whatever survives
/// to the sink — group items member-by-member, in order. Stage workers run
/// concurrently; see [`Stage`] for the ordering contract.
///
/// `close` shuts the head inlet, lets every stage drain, waits for the
/// consumer to finish and then closes the sink. Handles are cheap to clone
/// for concurrent producers; closing any handle closes the pipeline for all
/// of them.
#[derive(Clone)]
pub struct StreamWriter {
    inner: Arc<Inner>,
}

impl StreamWriter {
    /// Creates a pipeline writer over `sink` with default options.
    pub fn new<S: Sink + 'static>(sink: S, stages: Vec<Stage>) -> Self {
        Self::with_options(sink, stages, StreamOptions::default())
    }

    /// Creates a pipeline writer with explicit options.
    pub fn with_options<S: Sink + 'static>(
        sink: S,
        stages: Vec<Stage>,
        options: StreamOptions,
    ) -> Self {
        let errored = Arc::new(AtomicBool::new(false));
        let (head, tail, workers) = pipeline::link(stages, options.channel_capacity, &errored);
        let consumer = thread::spawn(move || consume(&tail, sink));

        Self {
            inner: Arc::new(Inner {
                head: Mutex::new(Some(head)),
                errored,
                workers: Mutex::new(workers),
                consumer: Mutex::new(Some(consumer)),
                outcome: Mutex::new(CloseOutcome::default()),
            }),
        }
    }

    /// Pushes one record into the head of the pipeline.
    ///
    /// Copies the caller's bytes into a pool-backed buffer first; the
    /// caller's slice may be reused immediately. Blocks as far as channel
    /// capacity permits (see [`StreamOptions::channel_capacity`]).
    pub fn write(&mut self, record: &[u8]) -> io::Result<usize> {
        let head = {
            match &*lock(&self.inner.head) {
                Some(head) => head.clone(),
                None => return Err(WriterClosed.into()),
            }
        };

        let copy = BufferPool::global().copy_from(record);
        if head.send(Item::Record(copy)).is_err() {
            // The pipeline tore itself down; treat it like a closed writer.
            return Err(WriterClosed.into());
        }

        Ok(record.len())
    }

    /// Closes the head inlet, waits for a full drain and closes the sink.
    ///
    /// Idempotent: repeat calls replay the first outcome.
    pub fn close(&mut self) -> io::Result<()> {
        let mut outcome = lock(&self.inner.outcome);
        if let Some(result) = outcome.replay() {
            return result;
        }

        // Dropping the shared head sender closes every stage in turn as its
        // inlet disconnects.
        drop(lock(&self.inner.head).take());
        for handle in lock(&self.inner.workers).drain(..) {
            let _ = handle.join();
        }
        let result = match lock(&self.inner.consumer).take() {
            Some(handle) => handle
                .join()
                .unwrap_or_else(|_| Err(io::Error::other("pipeline consumer panicked"))),
            None => Ok(()),
        };

        outcome.record(&result);
        result
    }

    /// Returns `true` if any stage callback has panicked since construction.
    pub fn errored(&self) -> bool {
        self.inner.errored.load(Ordering::Acquire)
    }
}

impl Sink for StreamWriter {
    fn write(&mut self, record: &[u8]) -> io::Result<usize> {
        StreamWriter::write(self, record)
    }

    fn close(&mut self) -> io::Result<()> {
        StreamWriter::close(self)
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if lock(&self.outcome).is_closed() {
            return;
        }
        drop(lock(&self.head).take());
        for handle in lock(&self.workers).drain(..) {
            let _ = handle.join();
        }
        if let Some(handle) = lock(&self.consumer).take() {
            if let Ok(Err(err)) = handle.join() {
                tracing::warn!(error = %err, "sink close failed during stream writer drop");
            }
        }
    }
}

fn consume<S: Sink>(tail: &Receiver<Item>, mut sink: S) -> io::Result<()> {
    let pool = BufferPool::global();

    for item in tail.iter() {
        match item {
            Item::Record(record) => {
                write_record(&mut sink, &record);
                pool.release(record);
            }
            Item::Tagged(tagged) => {
                write_record(&mut sink, &tagged.record);
                pool.release(tagged.record);
            }
            Item::Group(group) => {
                for tagged in group {
                    write_record(&mut sink, &tagged.record);
                    pool.release(tagged.record);
                }
            }
        }
    }

    sink.close()
}

fn write_record<S: Sink>(sink: &mut S, record: &[u8]) {
    if let Err(err) = sink.write(record) {
        tracing::error!(error = %err, "sink write failed; record dropped");
    }
}
