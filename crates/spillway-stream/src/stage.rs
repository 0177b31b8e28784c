//! The closed set of pipeline stage kinds.

use crate::aggregator::{self, AggregateOptions};
use crate::item::{Item, Metadata, Tagged};
use crossbeam_channel::{Receiver, Sender};
use spillway::Fault;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

pub(crate) type ItemFn = Arc<dyn Fn(Item) -> Item + Send + Sync>;
pub(crate) type PredicateFn = Arc<dyn Fn(&Item) -> bool + Send + Sync>;
pub(crate) type ExpandFn = Arc<dyn Fn(Item) -> Vec<Item> + Send + Sync>;
pub(crate) type KeyFn = Arc<dyn Fn(&Metadata) -> String + Send + Sync>;

enum Kind {
    Map(ItemFn),
    Filter(PredicateFn),
    FlatMap(ExpandFn),
    PassThrough,
    Aggregate(AggregateOptions, KeyFn),
}

/// One node of the streaming pipeline.
///
/// Stages chain head-to-tail inside a
/// [`StreamWriter`](crate::StreamWriter); the inlet of stage *i*+1 is fed
/// from the outlet of stage *i*. The concrete kinds form a closed set —
/// map, filter, flat-map, pass-through and the keyed aggregator — each
/// driven by its own worker.
///
/// # Ordering
///
/// A stateless stage runs one worker by default and preserves FIFO order.
/// [`workers`](Stage::workers) opts into a pool; with more than one worker,
/// ordering across items is not preserved. The aggregator is always a
/// single worker and preserves per-key order.
pub struct Stage {
    kind: Kind,
    workers: usize,
}

impl Stage {
    fn from_kind(kind: Kind) -> Self {
        Self { kind, workers: 1 }
    }

    /// Metadata extraction: `bytes → (metadata, bytes)`.
    ///
    /// Applies to raw records, turning them into tagged records; items that
    /// are already tagged or grouped pass through untouched. The callback
    /// must be pure and must not retain its input.
    pub fn map<F>(f: F) -> Self
    where
        F: Fn(Vec<u8>) -> (Metadata, Vec<u8>) + Send + Sync + 'static,
    {
        Self::from_kind(Kind::Map(Arc::new(move |item| match item {
            Item::Record(record) => {
                let (meta, record) = f(record);
                Item::Tagged(Tagged { record, meta })
            }
            other => other,
        })))
    }

    /// Record-level filter: `metadata → bool`. Discarded records never reach
    /// the sink. Untagged and grouped items pass through.
    pub fn filter<F>(f: F) -> Self
    where
        F: Fn(&Metadata) -> bool + Send + Sync + 'static,
    {
        Self::from_kind(Kind::Filter(Arc::new(move |item| match item {
            Item::Tagged(tagged) => f(&tagged.meta),
            Item::Record(_) | Item::Group(_) => true,
        })))
    }

    /// Group-level filter: `[metadata] → bool`, evaluated over a whole
    /// aggregated batch. Rejecting a group suppresses every record in it.
    pub fn group_filter<F>(f: F) -> Self
    where
        F: Fn(&[Metadata]) -> bool + Send + Sync + 'static,
    {
        Self::from_kind(Kind::Filter(Arc::new(move |item| match item {
            Item::Group(group) => {
                let metas: Vec<Metadata> = group.iter().map(|t| t.meta.clone()).collect();
                f(&metas)
            }
            Item::Record(_) | Item::Tagged(_) => true,
        })))
    }

    /// Expands aggregated groups back into their individual records, in
    /// order. Non-group items pass through.
    pub fn flatten() -> Self {
        Self::from_kind(Kind::FlatMap(Arc::new(|item| match item {
            Item::Group(group) => group.into_iter().map(Item::Tagged).collect(),
            other => vec![other],
        })))
    }

    /// Forwards items unchanged.
    pub fn pass_through() -> Self {
        Self::from_kind(Kind::PassThrough)
    }

    /// Keyed aggregation with default thresholds. See
    /// [`AggregateOptions`].
    ///
    /// An empty key is normalised to `"default"`.
    pub fn aggregate<F>(key: F) -> Self
    where
        F: Fn(&Metadata) -> String + Send + Sync + 'static,
    {
        Self::aggregate_with(key, AggregateOptions::default())
    }

    /// Keyed aggregation with explicit thresholds.
    pub fn aggregate_with<F>(key: F, options: AggregateOptions) -> Self
    where
        F: Fn(&Metadata) -> String + Send + Sync + 'static,
    {
        Self::from_kind(Kind::Aggregate(options, Arc::new(key)))
    }

    /// Sets the worker-pool size for a stateless stage.
    ///
    /// Ignored by the aggregator, which is inherently single-worker.
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub(crate) fn spawn(
        self,
        inlet: Receiver<Item>,
        outlet: Sender<Item>,
        errored: Arc<AtomicBool>,
    ) -> Vec<JoinHandle<()>> {
        match self.kind {
            Kind::Map(f) => spawn_pool(self.workers, inlet, outlet, move |item, out| {
                match catch_unwind(AssertUnwindSafe(|| f(item))) {
                    Ok(mapped) => {
                        let _ = out.send(mapped);
                    }
                    Err(payload) => stage_panicked(&errored, "map", &payload),
                }
            }),
            Kind::Filter(f) => spawn_pool(self.workers, inlet, outlet, move |item, out| {
                match catch_unwind(AssertUnwindSafe(|| f(&item))) {
                    Ok(true) => {
                        let _ = out.send(item);
                    }
                    Ok(false) => item.recycle(),
                    Err(payload) => {
                        stage_panicked(&errored, "filter", &payload);
                        item.recycle();
                    }
                }
            }),
            Kind::FlatMap(f) => spawn_pool(self.workers, inlet, outlet, move |item, out| {
                match catch_unwind(AssertUnwindSafe(|| f(item))) {
                    Ok(expanded) => {
                        for item in expanded {
                            let _ = out.send(item);
                        }
                    }
                    Err(payload) => stage_panicked(&errored, "flat-map", &payload),
                }
            }),
            Kind::PassThrough => spawn_pool(1, inlet, outlet, |item, out| {
                let _ = out.send(item);
            }),
            Kind::Aggregate(options, key) => {
                aggregator::spawn(options, key, inlet, outlet, errored)
            }
        }
    }
}

/// Spawns `workers` threads all pulling from the same inlet. Workers exit
/// when the inlet disconnects; the outlet disconnects downstream once the
/// last worker drops its sender.
fn spawn_pool<F>(
    workers: usize,
    inlet: Receiver<Item>,
    outlet: Sender<Item>,
    work: F,
) -> Vec<JoinHandle<()>>
where
    F: Fn(Item, &Sender<Item>) + Send + Sync + 'static,
{
    let work = Arc::new(work);
    (0..workers.max(1))
        .map(|_| {
            let inlet = inlet.clone();
            let outlet = outlet.clone();
            let work = Arc::clone(&work);
            thread::spawn(move || {
                for item in inlet.iter() {
                    work(item, &outlet);
                }
            })
        })
        .collect()
}

fn stage_panicked(errored: &AtomicBool, stage: &str, payload: &(dyn std::any::Any + Send)) {
    errored.store(true, Ordering::Release);
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_owned())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_owned());
    let fault = Fault::Stage(message);
    tracing::error!(stage, %fault, "item dropped");
}
