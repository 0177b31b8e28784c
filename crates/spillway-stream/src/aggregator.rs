//! Keyed aggregation: groups tagged records and emits per-key batches.

use crate::item::{Item, Metadata, Tagged};
use crate::stage::KeyFn;
use crate::{lock, rlock, wlock};
use crossbeam_channel::{bounded, select, tick, Receiver, Sender};
use spillway::{Accumulator, BatchLimits, BufferPool, Fault};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Default per-key record count that fires a group.
pub const DEFAULT_GROUP_COUNT_THRESHOLD: usize = 1000;
/// Default max age of a group before it fires.
pub const DEFAULT_GROUP_DELAY_THRESHOLD: Duration = Duration::from_secs(2);
/// Default per-key byte size that fires a group (1 MiB).
pub const DEFAULT_GROUP_BYTE_THRESHOLD: usize = 1 << 20;
/// Default per-key byte cap before records are dropped (10 MiB).
pub const DEFAULT_GROUP_BUFFERED_BYTE_LIMIT: usize = 10 << 20;
/// Default capacity of the eviction channel.
pub const DEFAULT_EVICT_CAPACITY: usize = 64;

/// Key used when the key function returns an empty string.
const BLANK_KEY: &str = "default";

/// Grace budget per live key while draining on close.
const GRACE_PER_KEY: Duration = Duration::from_millis(100);
/// Hard cap on the close grace period.
const GRACE_CAP: Duration = Duration::from_secs(15);

/// Thresholds for [`Stage::aggregate_with`](crate::Stage::aggregate_with).
///
/// A group fires — is emitted downstream as one ordered batch — when its
/// record count, its byte size (true payload bytes) or its age crosses a
/// threshold, and when the pipeline closes.
#[derive(Debug, Clone)]
pub struct AggregateOptions {
    /// Per-key record count that fires the group.
    pub count_threshold: usize,
    /// Max age of a group before it fires.
    pub delay_threshold: Duration,
    /// Per-key byte size that fires the group.
    pub byte_threshold: usize,
    /// Per-key cap on buffered bytes; records beyond it are dropped and
    /// reported.
    pub buffered_byte_limit: usize,
    /// Capacity of the eviction channel shared by all keys.
    pub evict_capacity: usize,
}

impl Default for AggregateOptions {
    fn default() -> Self {
        Self {
            count_threshold: DEFAULT_GROUP_COUNT_THRESHOLD,
            delay_threshold: DEFAULT_GROUP_DELAY_THRESHOLD,
            byte_threshold: DEFAULT_GROUP_BYTE_THRESHOLD,
            buffered_byte_limit: DEFAULT_GROUP_BUFFERED_BYTE_LIMIT,
            evict_capacity: DEFAULT_EVICT_CAPACITY,
        }
    }
}

impl AggregateOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the per-key record count that fires a group.
    pub fn with_count_threshold(mut self, count: usize) -> Self {
        self.count_threshold = count;
        self
    }

    /// Sets the max age of a group before it fires.
    pub fn with_delay_threshold(mut self, delay: Duration) -> Self {
        self.delay_threshold = delay;
        self
    }

    /// Sets the per-key byte size that fires a group.
    pub fn with_byte_threshold(mut self, bytes: usize) -> Self {
        self.byte_threshold = bytes;
        self
    }

    /// Sets the per-key buffered byte cap.
    pub fn with_buffered_byte_limit(mut self, bytes: usize) -> Self {
        self.buffered_byte_limit = bytes;
        self
    }

    /// Sets the eviction channel capacity.
    pub fn with_evict_capacity(mut self, capacity: usize) -> Self {
        self.evict_capacity = capacity;
        self
    }

    fn limits(&self) -> BatchLimits {
        BatchLimits {
            delay_threshold: self.delay_threshold,
            count_threshold: self.count_threshold,
            byte_threshold: self.byte_threshold,
            byte_limit: 0,
            buffered_byte_limit: self.buffered_byte_limit,
        }
    }
}

struct Group {
    acc: Accumulator<Tagged>,
    evicted: bool,
}

type GroupMap = RwLock<HashMap<String, Arc<Mutex<Group>>>>;

/// Pool of reusable, preconfigured group containers.
struct ContainerPool {
    shelf: Mutex<Vec<Accumulator<Tagged>>>,
    limits: BatchLimits,
}

impl ContainerPool {
    fn new(limits: BatchLimits) -> Self {
        Self {
            shelf: Mutex::new(Vec::new()),
            limits,
        }
    }

    fn get(&self) -> Accumulator<Tagged> {
        lock(&self.shelf)
            .pop()
            .unwrap_or_else(|| Accumulator::new(self.limits.clone()))
    }

    fn put(&self, mut acc: Accumulator<Tagged>) {
        acc.reset();
        lock(&self.shelf).push(acc);
    }
}

/// Spawns the aggregation worker and its eviction worker.
///
/// The worker appends incoming records to per-key groups and fires full or
/// aged groups downstream; the eviction worker unregisters fired keys,
/// flushes residual content and recycles the containers. Firing and
/// eviction are decoupled through a bounded channel so neither ever flushes
/// the same group concurrently.
pub(crate) fn spawn(
    options: AggregateOptions,
    key_fn: KeyFn,
    inlet: Receiver<Item>,
    outlet: Sender<Item>,
    errored: Arc<AtomicBool>,
) -> Vec<JoinHandle<()>> {
    let groups: Arc<GroupMap> = Arc::new(RwLock::new(HashMap::new()));
    let containers = Arc::new(ContainerPool::new(options.limits()));
    let (evict_tx, evict_rx) = bounded::<String>(options.evict_capacity.max(1));
    let (done_tx, done_rx) = bounded::<()>(1);

    let evictor = {
        let groups = Arc::clone(&groups);
        let containers = Arc::clone(&containers);
        let outlet = outlet.clone();
        thread::spawn(move || evict_loop(&evict_rx, &groups, &containers, &outlet, &done_tx))
    };

    let worker = thread::spawn(move || {
        receive_loop(
            &options, &key_fn, &inlet, &outlet, &groups, &containers, evict_tx, &done_rx,
            &errored,
        );
    });

    vec![worker, evictor]
}

#[allow(clippy::too_many_arguments)]
fn receive_loop(
    options: &AggregateOptions,
    key_fn: &KeyFn,
    inlet: &Receiver<Item>,
    outlet: &Sender<Item>,
    groups: &GroupMap,
    containers: &ContainerPool,
    evict_tx: Sender<String>,
    done_rx: &Receiver<()>,
    errored: &AtomicBool,
) {
    let ticker = tick(tick_interval(options.delay_threshold));

    loop {
        select! {
            recv(inlet) -> msg => match msg {
                Ok(item) => absorb(item, key_fn, groups, containers, outlet, &evict_tx, errored),
                Err(_) => break,
            },
            recv(ticker) -> _ => fire_expired(groups, outlet, &evict_tx),
        }
    }

    // Upstream closed: snapshot the live keys and push them all through the
    // eviction channel, then close it and wait a bounded grace period for
    // in-flight flushes before letting the outlet close.
    let keys: Vec<String> = rlock(groups).keys().cloned().collect();
    let key_count = keys.len() as u32;
    for key in keys {
        let _ = evict_tx.send(key);
    }
    drop(evict_tx);

    let grace = (GRACE_PER_KEY * key_count.max(1)).min(GRACE_CAP);
    let _ = done_rx.recv_timeout(grace);
}

fn tick_interval(delay: Duration) -> Duration {
    (delay / 4).clamp(Duration::from_millis(10), Duration::from_millis(500))
}

fn absorb(
    item: Item,
    key_fn: &KeyFn,
    groups: &GroupMap,
    containers: &ContainerPool,
    outlet: &Sender<Item>,
    evict_tx: &Sender<String>,
    errored: &AtomicBool,
) {
    let tagged = match item {
        Item::Record(record) => Tagged {
            record,
            meta: Metadata::new(),
        },
        Item::Tagged(tagged) => tagged,
        // Already-aggregated input passes straight through.
        group @ Item::Group(_) => {
            let _ = outlet.send(group);
            return;
        }
    };

    let key = match catch_unwind(AssertUnwindSafe(|| key_fn(&tagged.meta))) {
        Ok(key) if key.is_empty() => BLANK_KEY.to_owned(),
        Ok(key) => key,
        Err(_) => {
            errored.store(true, Ordering::Release);
            let fault = Fault::Stage("group key callback panicked".to_owned());
            tracing::error!(%fault, "record dropped");
            BufferPool::global().release(tagged.record);
            return;
        }
    };

    let size = tagged.record.len();
    let mut tagged = Some(tagged);
    loop {
        let group = lookup_or_create(groups, containers, &key);
        let mut guard = lock(&group);
        if guard.evicted {
            // The eviction worker beat us to this container; a fresh group
            // takes over the key.
            continue;
        }

        if guard.acc.would_overflow(size, 0) {
            let fault = Fault::Overflow {
                buffered: guard.acc.bytes() + size,
                limit: guard.acc.limits().buffered_byte_limit,
            };
            tracing::warn!(key = %key, %fault, "record dropped");
            if let Some(tagged) = tagged.take() {
                BufferPool::global().release(tagged.record);
            }
            return;
        }

        if let Some(tagged) = tagged.take() {
            guard.acc.push(tagged, size);
        }

        let fired = if guard.acc.ready() {
            guard.acc.take_batch()
        } else {
            None
        };
        drop(guard);

        // Emit and schedule eviction outside the group lock so the eviction
        // worker can always make progress.
        if let Some(batch) = fired {
            let _ = outlet.send(Item::Group(batch.items));
            let _ = evict_tx.send(key);
        }
        return;
    }
}

fn lookup_or_create(
    groups: &GroupMap,
    containers: &ContainerPool,
    key: &str,
) -> Arc<Mutex<Group>> {
    if let Some(group) = rlock(groups).get(key) {
        return Arc::clone(group);
    }

    let mut map = wlock(groups);
    Arc::clone(map.entry(key.to_owned()).or_insert_with(|| {
        Arc::new(Mutex::new(Group {
            acc: containers.get(),
            evicted: false,
        }))
    }))
}

/// Fires every group whose age crossed the delay threshold.
fn fire_expired(groups: &GroupMap, outlet: &Sender<Item>, evict_tx: &Sender<String>) {
    let snapshot: Vec<(String, Arc<Mutex<Group>>)> = rlock(groups)
        .iter()
        .map(|(key, group)| (key.clone(), Arc::clone(group)))
        .collect();

    for (key, group) in snapshot {
        let batch = {
            let mut guard = lock(&group);
            if guard.evicted || !guard.acc.ready() {
                None
            } else {
                guard.acc.take_batch()
            }
        };
        if let Some(batch) = batch {
            let _ = outlet.send(Item::Group(batch.items));
            let _ = evict_tx.send(key);
        }
    }
}

fn evict_loop(
    evict_rx: &Receiver<String>,
    groups: &GroupMap,
    containers: &ContainerPool,
    outlet: &Sender<Item>,
    done_tx: &Sender<()>,
) {
    for key in evict_rx.iter() {
        let Some(group) = wlock(groups).remove(&key) else {
            // Fired twice before the first eviction landed.
            continue;
        };

        let residual = {
            let mut guard = lock(&group);
            guard.evicted = true;
            guard.acc.take_batch()
        };
        if let Some(batch) = residual {
            let _ = outlet.send(Item::Group(batch.items));
        }

        // Recycle the container when no appender still holds the group.
        if let Ok(mutex) = Arc::try_unwrap(group) {
            let group = mutex.into_inner().unwrap_or_else(PoisonError::into_inner);
            containers.put(group.acc);
        }
    }
    let _ = done_tx.send(());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;

    fn tagged(key: &str, payload: &[u8]) -> Item {
        let mut meta = Metadata::new();
        meta.insert("key".into(), key.into());
        Item::Tagged(Tagged {
            record: payload.to_vec(),
            meta,
        })
    }

    fn collect_groups(out: Receiver<Item>) -> Vec<Vec<Vec<u8>>> {
        out.iter()
            .map(|item| match item {
                Item::Group(group) => group.into_iter().map(|t| t.record).collect(),
                other => panic!("expected group, got {other:?}"),
            })
            .collect()
    }

    fn run(options: AggregateOptions, items: Vec<Item>) -> Vec<Vec<Vec<u8>>> {
        let (in_tx, in_rx) = unbounded();
        let (out_tx, out_rx) = unbounded();
        let key_fn: KeyFn = Arc::new(|meta: &Metadata| meta.get("key").cloned().unwrap_or_default());
        let handles = spawn(
            options,
            key_fn,
            in_rx,
            out_tx,
            Arc::new(AtomicBool::new(false)),
        );

        for item in items {
            in_tx.send(item).unwrap();
        }
        drop(in_tx);
        for handle in handles {
            handle.join().unwrap();
        }

        collect_groups(out_rx)
    }

    #[test]
    fn test_close_flushes_all_groups_partitioned_by_key() {
        let items = (1u8..=9)
            .map(|n| {
                let key = if n % 2 == 0 { "even" } else { "odd" };
                tagged(key, &[n])
            })
            .collect();

        let mut groups = run(AggregateOptions::default(), items);
        groups.sort_by_key(Vec::len);

        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0], vec![vec![2], vec![4], vec![6], vec![8]]);
        assert_eq!(groups[1], vec![vec![1], vec![3], vec![5], vec![7], vec![9]]);
    }

    #[test]
    fn test_count_threshold_fires_group() {
        let options = AggregateOptions::new().with_count_threshold(3);
        let items = (0u8..7).map(|n| tagged("k", &[n])).collect();

        let groups = run(options, items);

        // The first batch fires synchronously at the third record. Later
        // batch boundaries depend on how the eviction worker interleaves,
        // but per-key order always holds and nothing is lost.
        assert_eq!(groups[0], vec![vec![0], vec![1], vec![2]]);
        assert!(groups.len() >= 2);
        let flattened: Vec<Vec<u8>> = groups.into_iter().flatten().collect();
        assert_eq!(
            flattened,
            (0u8..7).map(|n| vec![n]).collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_blank_key_normalises_to_default() {
        let (in_tx, in_rx) = unbounded();
        let (out_tx, out_rx) = unbounded();
        let key_fn: KeyFn = Arc::new(|_meta: &Metadata| String::new());

        let handles = spawn(
            AggregateOptions::default(),
            key_fn,
            in_rx,
            out_tx,
            Arc::new(AtomicBool::new(false)),
        );

        in_tx.send(Item::Record(b"untagged".to_vec())).unwrap();
        drop(in_tx);
        for handle in handles {
            handle.join().unwrap();
        }

        let groups = collect_groups(out_rx);
        assert_eq!(groups, vec![vec![b"untagged".to_vec()]]);
    }

    #[test]
    fn test_delay_threshold_fires_without_close() {
        let (in_tx, in_rx) = unbounded();
        let (out_tx, out_rx) = unbounded();
        let key_fn: KeyFn = Arc::new(|_: &Metadata| "k".to_owned());
        let options = AggregateOptions::new().with_delay_threshold(Duration::from_millis(30));
        let handles = spawn(
            options,
            key_fn,
            in_rx,
            out_tx,
            Arc::new(AtomicBool::new(false)),
        );

        in_tx.send(Item::Record(b"aged".to_vec())).unwrap();

        // The group must fire on age alone, with the inlet still open.
        let fired = out_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        match fired {
            Item::Group(group) => assert_eq!(group[0].record, b"aged"),
            other => panic!("expected group, got {other:?}"),
        }

        drop(in_tx);
        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn test_same_key_starts_fresh_group_after_fire() {
        let options = AggregateOptions::new().with_count_threshold(2);
        let items = vec![
            tagged("k", b"1"),
            tagged("k", b"2"),
            tagged("k", b"3"),
        ];

        let groups = run(options, items);
        assert_eq!(
            groups,
            vec![
                vec![b"1".to_vec(), b"2".to_vec()],
                vec![b"3".to_vec()],
            ]
        );
    }
}
