//! Error types for writer operations.

use std::io;
use thiserror::Error;

/// Marker payload carried inside the `io::Error` returned by a closed writer.
///
/// Writes after `close` fail deterministically with this error and never
/// panic. Use [`is_closed`] to test for it without string matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("writer already closed")]
pub struct WriterClosed;

impl From<WriterClosed> for io::Error {
    fn from(marker: WriterClosed) -> Self {
        io::Error::new(io::ErrorKind::BrokenPipe, marker)
    }
}

/// Builds the error every adapter returns for writes after close.
pub(crate) fn closed_error() -> io::Error {
    WriterClosed.into()
}

/// Returns `true` if `err` is the writer-closed error.
pub fn is_closed(err: &io::Error) -> bool {
    err.get_ref().is_some_and(|inner| inner.is::<WriterClosed>())
}

/// Diagnostic events surfaced through a writer's fault handler.
///
/// The hot producer path never returns these; `write` only ever fails with
/// [`WriterClosed`]. Everything else — lost records, soft overflows, sink
/// I/O errors, panicking stage callbacks — flows through the notifier, which
/// is invoked from exactly one internal thread per writer.
#[derive(Debug, Error)]
pub enum Fault {
    /// Records overwritten in the ring since the previous notification.
    #[error("{0} records overwritten before reaching the sink")]
    Lost(u64),
    /// A soft buffered-byte-limit breach; the triggering record was dropped.
    #[error("buffered bytes {buffered} exceed limit {limit}")]
    Overflow { buffered: usize, limit: usize },
    /// The downstream sink failed a write or close.
    #[error("sink error: {0}")]
    Sink(#[from] io::Error),
    /// A caller-supplied stage callback panicked; the item was dropped.
    #[error("stage callback panicked: {0}")]
    Stage(String),
}

/// Callback receiving [`Fault`] events from a writer's internal workers.
pub type FaultHandler = Box<dyn FnMut(Fault) + Send>;

/// Records the first `close` outcome so repeat calls replay it.
///
/// `close` is idempotent for every adapter: the second call returns the same
/// result as the first without re-draining or touching the sink again.
#[derive(Debug, Default)]
pub struct CloseOutcome {
    first: Option<Result<(), (io::ErrorKind, String)>>,
}

impl CloseOutcome {
    /// Returns `true` once an outcome has been recorded.
    pub fn is_closed(&self) -> bool {
        self.first.is_some()
    }

    /// Stores the outcome of the first close.
    pub fn record(&mut self, result: &io::Result<()>) {
        self.first = Some(match result {
            Ok(()) => Ok(()),
            Err(err) => Err((err.kind(), err.to_string())),
        });
    }

    /// Replays the recorded outcome, or `None` if close has not run yet.
    pub fn replay(&self) -> Option<io::Result<()>> {
        self.first.as_ref().map(|outcome| match outcome {
            Ok(()) => Ok(()),
            Err((kind, msg)) => Err(io::Error::new(*kind, msg.clone())),
        })
    }
}
