//! Streaming pipeline writer for spillway.
//!
//! Runs byte records through a chain of map/filter/group/flat-map stages
//! before they reach the sink. The algorithmic heart is the keyed
//! aggregator: records are grouped by a caller-supplied key function and
//! emitted as per-key batches triggered by count, byte size, age or
//! upstream close — which is what makes "keep a request's logs only if the
//! request failed" possible at write time.
//!
//! # Example
//!
//! ```ignore
//! use spillway_stream::{flow, AggregateOptions, StreamWriter};
//!
//! let stages = flow::grouped(
//!     |record| (extract_metadata(&record), record),
//!     |meta| meta.get("level").map(String::as_str) != Some("debug"),
//!     |meta| meta.get("request_id").cloned().unwrap_or_default(),
//!     |metas| metas.iter().any(|m| m.get("level").map(String::as_str) == Some("error")),
//!     AggregateOptions::default(),
//! );
//! let mut writer = StreamWriter::new(std::io::stdout(), stages);
//! writer.write(b"{\"request_id\":\"r1\",\"level\":\"info\"}\n")?;
//! writer.close()?;
//! # std::io::Result::Ok(())
//! ```

mod aggregator;
pub mod flow;
mod item;
mod pipeline;
mod stage;
mod writer;

pub use aggregator::{
    AggregateOptions, DEFAULT_EVICT_CAPACITY, DEFAULT_GROUP_BUFFERED_BYTE_LIMIT,
    DEFAULT_GROUP_BYTE_THRESHOLD, DEFAULT_GROUP_COUNT_THRESHOLD, DEFAULT_GROUP_DELAY_THRESHOLD,
};
pub use item::{Item, Metadata, Tagged};
pub use stage::Stage;
pub use writer::{StreamOptions, StreamWriter};

// Re-export the shared writer contract.
pub use spillway::{is_closed, Fault, Sink};

use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Locks a mutex, recovering the guard if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn rlock<T>(rwlock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    rwlock.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn wlock<T>(rwlock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    rwlock.write().unwrap_or_else(PoisonError::into_inner)
}
