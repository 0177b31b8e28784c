//! Many-producer single-consumer ring buffer with overwrite-on-full
//! semantics.

use crossbeam_utils::CachePadded;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};

// =============================================================================
// SYNCHRONIZATION STRATEGY
// =============================================================================
//
// Producers and the consumer coordinate through unbounded u64 sequence
// numbers; a slot index is only derived as `sequence & mask`. With 2^64
// sequences, wrap-around is not a practical concern.
//
// **Producer (publish path):**
// 1. Claim a sequence with `fetch_add` on `write_seq` (Relaxed — claims only
//    need to be unique, the swap below publishes the data)
// 2. Heap-allocate a bucket tagging the record with its sequence
// 3. Swap the bucket pointer into `slots[seq & mask]` (AcqRel — Release
//    publishes the bucket to the consumer, Acquire takes ownership of any
//    previous occupant)
// 4. Free the previous occupant, if any: it was published but never
//    consumed, and the consumer will account for it as a sequence gap
//
// **Consumer (poll path, single thread):**
// 1. Swap `slots[read_seq & mask]` to null (AcqRel), taking sole ownership
//    of whatever bucket is there
// 2. A bucket with `seq < read_seq` is a stale leftover from a lapped
//    producer; its loss was already counted, so it is simply freed
// 3. A bucket with `seq > read_seq` means producers lapped the consumer:
//    `seq - read_seq` records were overwritten, reported as `lost`
// 4. Advance `read_seq` past the consumed sequence (Release)
//
// Slot ownership is transferred exclusively by the atomic pointer swaps, so
// neither side ever reads a bucket the other may still mutate.
//
// =============================================================================

struct Bucket {
    seq: u64,
    record: Vec<u8>,
}

/// Result of one consumer poll.
pub enum Polled {
    /// Nothing consumable right now.
    Empty,
    /// A leftover record from a lapped producer, already accounted as lost.
    /// The caller owns the buffer (typically returning it to the pool).
    Stale(Vec<u8>),
    /// The next record in ring order, plus how many earlier records were
    /// overwritten before the consumer reached them.
    Item { record: Vec<u8>, lost: u64 },
}

/// Lock-free ring that drops the oldest unconsumed record when full.
///
/// Producers are wait-free: publishing is one `fetch_add` and one pointer
/// swap, regardless of consumer progress. When producers lap the consumer
/// the oldest records are overwritten and surface as the `lost` count on a
/// later [`poll`](OverwriteRing::poll). This is the building block behind
/// [`RingWriter`](crate::RingWriter); it is exposed for reuse and testing.
///
/// The consumer side must only ever be driven by one thread at a time.
pub struct OverwriteRing {
    /// Next sequence to claim. Written by producers.
    write_seq: CachePadded<AtomicU64>,
    /// Next sequence to consume. Written by the consumer only.
    read_seq: CachePadded<AtomicU64>,
    slots: Box<[AtomicPtr<Bucket>]>,
    mask: u64,
}

// Safety: buckets are owned by exactly one side at a time; ownership moves
// only through atomic swaps on the slots.
unsafe impl Send for OverwriteRing {}
unsafe impl Sync for OverwriteRing {}

impl OverwriteRing {
    /// Creates a ring with at least `capacity` slots, rounded up to a power
    /// of two for mask-based indexing.
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(2).next_power_of_two();
        let slots: Vec<AtomicPtr<Bucket>> =
            (0..capacity).map(|_| AtomicPtr::new(ptr::null_mut())).collect();

        Self {
            write_seq: CachePadded::new(AtomicU64::new(0)),
            read_seq: CachePadded::new(AtomicU64::new(0)),
            slots: slots.into_boxed_slice(),
            mask: capacity as u64 - 1,
        }
    }

    /// Number of slots.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Publishes a record, overwriting the oldest unconsumed slot when full.
    ///
    /// Wait-free. Returns the buffer of an overwritten record so the caller
    /// can recycle it; the loss itself is counted by the consumer as a
    /// sequence gap.
    pub fn publish(&self, record: Vec<u8>) -> Option<Vec<u8>> {
        let seq = self.write_seq.fetch_add(1, Ordering::Relaxed);
        let bucket = Box::into_raw(Box::new(Bucket { seq, record }));
        let old = self.slots[(seq & self.mask) as usize].swap(bucket, Ordering::AcqRel);

        if old.is_null() {
            None
        } else {
            // SAFETY: every non-null slot pointer originates from
            // Box::into_raw and the swap above transferred exclusive
            // ownership of `old` to this thread.
            let old = unsafe { Box::from_raw(old) };
            Some(old.record)
        }
    }

    /// Consumes the next record, if any.
    pub fn poll(&self) -> Polled {
        let read = self.read_seq.load(Ordering::Relaxed);
        let slot = &self.slots[(read & self.mask) as usize];

        let taken = slot.swap(ptr::null_mut(), Ordering::AcqRel);
        if taken.is_null() {
            return Polled::Empty;
        }

        // SAFETY: the swap transferred exclusive ownership of `taken` to the
        // consumer; producers only ever swap in fresh buckets.
        let bucket = unsafe { Box::from_raw(taken) };

        if bucket.seq < read {
            return Polled::Stale(bucket.record);
        }

        let lost = bucket.seq - read;
        self.read_seq.store(bucket.seq + 1, Ordering::Release);
        Polled::Item {
            record: bucket.record,
            lost,
        }
    }

    /// Returns `true` when every claimed sequence has been consumed or
    /// accounted for. Meaningful once producers have stopped publishing.
    pub fn is_drained(&self) -> bool {
        self.read_seq.load(Ordering::Acquire) >= self.write_seq.load(Ordering::Acquire)
    }

    /// Number of sequences claimed so far.
    pub fn claimed(&self) -> u64 {
        self.write_seq.load(Ordering::Acquire)
    }
}

impl Drop for OverwriteRing {
    fn drop(&mut self) {
        for slot in self.slots.iter() {
            let taken = slot.swap(ptr::null_mut(), Ordering::Relaxed);
            if !taken.is_null() {
                // SAFETY: exclusive access in Drop; the pointer came from
                // Box::into_raw.
                drop(unsafe { Box::from_raw(taken) });
            }
        }
    }
}
