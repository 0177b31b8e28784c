//! The byte-stream contract shared by leaf sinks and every adapter.

use std::io;

/// Destination for opaque byte records.
///
/// The unit of transport is one record per [`write`](Sink::write) call; a
/// sink must not assume records can be reassembled or split. All three
/// spillway writers implement `Sink` themselves, so adapters stack freely:
/// `records → RingWriter → BatchWriter → file`. Closing the outer adapter
/// drains it and then closes the inner one.
pub trait Sink: Send {
    /// Writes one record, returning the input length on success.
    fn write(&mut self, record: &[u8]) -> io::Result<usize>;

    /// Flushes buffered state and releases the sink.
    ///
    /// Idempotent for spillway writers; leaf sinks are only closed once.
    fn close(&mut self) -> io::Result<()>;
}

/// Any `io::Write` is a sink; `close` degrades to `flush`.
///
/// This covers files, sockets, stdout locks and in-memory buffers without
/// wrapper types. Types that need real close semantics implement [`Sink`]
/// directly.
impl<W: io::Write + Send> Sink for W {
    fn write(&mut self, record: &[u8]) -> io::Result<usize> {
        self.write_all(record)?;
        Ok(record.len())
    }

    fn close(&mut self) -> io::Result<()> {
        self.flush()
    }
}
