//! Prebuilt stage chains for common pipelines.

use crate::aggregator::AggregateOptions;
use crate::item::Metadata;
use crate::stage::Stage;
use std::num::NonZeroUsize;
use std::thread;

/// Builds the standard grouped-filtering pipeline:
/// metadata extraction → record filter → keyed aggregation → group filter →
/// flatten.
///
/// This is the "drop the whole request trace unless it contains an error"
/// shape: `map` extracts fields from each record, `filter` drops individual
/// records, `key` assigns records to groups, and `group_filter` passes or
/// suppresses whole groups after aggregation.
///
/// The stateless stages run with one worker per available CPU, so ordering
/// across records is not preserved; ordering within a group is.
pub fn grouped<M, F, K, G>(
    map: M,
    filter: F,
    key: K,
    group_filter: G,
    options: AggregateOptions,
) -> Vec<Stage>
where
    M: Fn(Vec<u8>) -> (Metadata, Vec<u8>) + Send + Sync + 'static,
    F: Fn(&Metadata) -> bool + Send + Sync + 'static,
    K: Fn(&Metadata) -> String + Send + Sync + 'static,
    G: Fn(&[Metadata]) -> bool + Send + Sync + 'static,
{
    let workers = thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(1);

    vec![
        Stage::map(map).workers(workers),
        Stage::filter(filter).workers(workers),
        Stage::aggregate_with(key, options),
        Stage::group_filter(group_filter).workers(workers),
        Stage::flatten().workers(workers),
    ]
}
