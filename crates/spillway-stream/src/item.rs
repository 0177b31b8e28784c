//! Values traveling between pipeline stages.

use spillway::BufferPool;
use std::collections::HashMap;

/// String key/value fields extracted once per record.
///
/// Purely informational: downstream filter and group stages read it, nothing
/// mutates it after extraction.
pub type Metadata = HashMap<String, String>;

/// A record plus the metadata extracted from it.
#[derive(Debug)]
pub struct Tagged {
    pub record: Vec<u8>,
    pub meta: Metadata,
}

/// One value at a stage boundary.
///
/// The pipeline carries an explicit sum type rather than opaque boxed
/// values, so every stage knows exactly which shapes can reach it.
#[derive(Debug)]
pub enum Item {
    /// A raw record fresh from `write`, not yet tagged.
    Record(Vec<u8>),
    /// A record with extracted metadata.
    Tagged(Tagged),
    /// An ordered per-key batch emitted by the aggregator.
    Group(Vec<Tagged>),
}

impl Item {
    /// Destroys the item, returning its record buffers to the pool.
    pub(crate) fn recycle(self) {
        let pool = BufferPool::global();
        match self {
            Item::Record(record) => pool.release(record),
            Item::Tagged(tagged) => pool.release(tagged.record),
            Item::Group(group) => {
                for tagged in group {
                    pool.release(tagged.record);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recycle_returns_buffers() {
        let pool = BufferPool::global();
        let before = pool.shelved();

        Item::Group(vec![
            Tagged {
                record: pool.acquire(),
                meta: Metadata::new(),
            },
            Tagged {
                record: pool.acquire(),
                meta: Metadata::new(),
            },
        ])
        .recycle();

        assert!(pool.shelved() >= before);
    }
}
