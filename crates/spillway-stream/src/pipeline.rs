//! Links stages into one sequential pipeline.

use crate::item::Item;
use crate::stage::Stage;
use crossbeam_channel::{bounded, Receiver, Sender};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread::JoinHandle;

/// Chains `stages` head-to-tail over bounded channels.
///
/// Returns the head inlet, the tail outlet and the stage worker handles.
/// With zero stages the head and tail are the same channel. A `capacity`
/// of 0 makes every hop a rendezvous.
pub(crate) fn link(
    stages: Vec<Stage>,
    capacity: usize,
    errored: &Arc<AtomicBool>,
) -> (Sender<Item>, Receiver<Item>, Vec<JoinHandle<()>>) {
    let (head, mut tail) = bounded(capacity);
    let mut workers = Vec::new();

    for stage in stages {
        let (outlet, next_tail) = bounded(capacity);
        workers.extend(stage.spawn(tail, outlet, Arc::clone(errored)));
        tail = next_tail;
    }

    (head, tail, workers)
}
