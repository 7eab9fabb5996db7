//! Fused farms: a producing worker ring that accumulates reduce state
//! in place, plus a reducer ring it shuffles into.
//!
//! A fused farm replaces two standalone farms (map/flat-map/join followed by
//! a keyed reduce) with one. Each producing worker folds its own output
//! straight into a per-tag [`ReduceState`] instead of batching it downstream.
//! When a tag's collection ends, every producer splits its partial state into
//! `hash(key) % reducers` partitions and sends each partition to its reducer,
//! so a key's partials all land on one reducer regardless of which producer
//! saw the items. Reducers fold partials with the same kernel and emit once
//! all producers have reported the tag's end.

use std::collections::HashMap;
use std::sync::Arc;

use crate::batch::BatchAny;
use crate::channel::{Receiver, Sender};
use crate::compiler::NetworkBuilder;
use crate::farm::join::{JoinCoreAny, JoinCoreFactory, SideRegistry};
use crate::farm::reduce::{ReduceState, ReduceStateFactory};
use crate::message::{Control, Message};
use crate::stage::{
    Collected, CollectorCore, FanOut, Output, RoundRobin, StageHandle, spawn_collector,
    spawn_emitter,
};
use crate::tag::Tag;

/// A pure per-batch kernel, erased so fused farms can run map and flat-map
/// through one code path. Output batches keep the input batch's tag.
pub trait ErasedTransform: Send + Sync {
    fn apply(&self, batch: Box<dyn BatchAny>, capacity: usize) -> Vec<Box<dyn BatchAny>>;
}

/* ===================== Producer-side accumulation ===================== */

/// Per-tag reduce states held inside a producing worker.
struct Accumulator {
    factory: Arc<dyn ReduceStateFactory>,
    states: HashMap<Tag, Box<dyn ReduceState>>,
    capacity: usize,
}

impl Accumulator {
    fn new(factory: Arc<dyn ReduceStateFactory>, capacity: usize) -> Self {
        Self { factory, states: HashMap::new(), capacity }
    }

    fn absorb(&mut self, tag: Tag, batch: Box<dyn BatchAny>) {
        let factory = &self.factory;
        self.states
            .entry(tag)
            .or_insert_with(|| factory.new_state())
            .absorb(batch);
    }

    /// Partition `tag`'s state across the reducer ring and send it.
    fn shuffle(&mut self, tag: Tag, fan: &FanOut) {
        if let Some(mut state) = self.states.remove(&tag) {
            let parts = state.drain_partitions(tag, fan.len(), self.capacity);
            for (dest, batches) in parts.into_iter().enumerate() {
                for b in batches {
                    fan.send_to(dest, Message::Data(b));
                }
            }
        }
    }

    fn shuffle_all(&mut self, fan: &FanOut) {
        let tags: Vec<Tag> = self.states.keys().copied().collect();
        for tag in tags {
            self.shuffle(tag, fan);
        }
    }
}

/// Mapper of a fused unary+reduce farm: applies the transform, folds the
/// result into per-tag state, shuffles on `CollectionEnd`.
fn spawn_unary_mapper(
    name: impl Into<String>,
    rx: Receiver,
    outs: Vec<Sender>,
    transform: Arc<dyn ErasedTransform>,
    factory: Arc<dyn ReduceStateFactory>,
    capacity: usize,
) -> StageHandle {
    StageHandle::spawn(name, move || {
        let fan = FanOut::new(outs);
        let mut acc = Accumulator::new(factory, capacity);
        for msg in rx {
            match msg {
                Message::Data(b) => {
                    let tag = b.tag();
                    for out in transform.apply(b, capacity) {
                        acc.absorb(tag, out);
                    }
                }
                Message::Control(Control::CollectionEnd(t)) => {
                    acc.shuffle(t, &fan);
                    fan.broadcast_control(Control::CollectionEnd(t));
                }
                Message::Control(Control::Sync) => {
                    acc.shuffle_all(&fan);
                    fan.broadcast_control(Control::Sync);
                }
                Message::Control(Control::GlobalEnd) => {
                    fan.broadcast_control(Control::GlobalEnd);
                    break;
                }
                Message::Control(c) => fan.broadcast_control(c),
            }
        }
    })
}

/// Mapper of a fused join+reduce farm: the join core feeds the accumulator
/// instead of a downstream channel. Side `CollectionEnd`s are consumed here;
/// only the round's output tag is bracketed to the reducers.
pub(crate) fn spawn_join_mapper(
    name: impl Into<String>,
    rx: Receiver,
    outs: Vec<Sender>,
    cores: Arc<dyn JoinCoreFactory>,
    registry: Arc<SideRegistry>,
    factory: Arc<dyn ReduceStateFactory>,
    capacity: usize,
) -> StageHandle {
    StageHandle::spawn(name, move || {
        let fan = FanOut::new(outs);
        let mut acc = Accumulator::new(factory, capacity);
        let mut core: Box<dyn JoinCoreAny> = cores.new_core();
        let mut out_tag = Tag::NIL;
        for msg in rx {
            match msg {
                Message::Data(b) => {
                    let side = registry.side_of(b.tag());
                    for out in core.on_batch(side, b, out_tag, capacity) {
                        acc.absorb(out_tag, out);
                    }
                }
                Message::Control(Control::CollectionBegin(t)) => {
                    out_tag = t;
                    core = cores.new_core();
                    fan.broadcast_control(Control::CollectionBegin(t));
                }
                Message::Control(Control::CollectionEnd(t)) => {
                    if t == out_tag {
                        acc.shuffle(t, &fan);
                        fan.broadcast_control(Control::CollectionEnd(t));
                    } else {
                        let side = registry.side_of(t);
                        for out in core.on_side_end(side, out_tag, capacity) {
                            acc.absorb(out_tag, out);
                        }
                    }
                }
                Message::Control(Control::Sync) => {
                    acc.shuffle_all(&fan);
                    fan.broadcast_control(Control::Sync);
                }
                Message::Control(Control::GlobalBegin) => {
                    fan.broadcast_control(Control::GlobalBegin);
                }
                Message::Control(Control::GlobalEnd) => {
                    fan.broadcast_control(Control::GlobalEnd);
                    break;
                }
            }
        }
    })
}

/* ===================== Reducer ring ===================== */

/// One reducer of the ring. Fan-in counting is a [`CollectorCore`] over the
/// `mappers` producers; data never passes through, it folds into per-tag
/// state drained when the last producer reports the tag's end.
fn spawn_fused_reducer(
    name: impl Into<String>,
    rx: Receiver,
    tx: Sender,
    mappers: usize,
    factory: Arc<dyn ReduceStateFactory>,
    capacity: usize,
) -> StageHandle {
    StageHandle::spawn(name, move || {
        let out = Output::new(tx);
        let mut core = CollectorCore::new(mappers, mappers);
        let mut states: HashMap<Tag, Box<dyn ReduceState>> = HashMap::new();
        let mut syncs = 0usize;
        for msg in rx {
            match msg {
                Message::Data(b) => {
                    let tag = b.tag();
                    states
                        .entry(tag)
                        .or_insert_with(|| factory.new_state())
                        .absorb(b);
                }
                // Every producer forwards one Sync per wave, and each
                // producer's shuffled partials precede its Sync in FIFO
                // order; the last Sync therefore sees all of them.
                Message::Control(Control::Sync) => {
                    syncs += 1;
                    if syncs == mappers {
                        syncs = 0;
                        let tags: Vec<Tag> = states.keys().copied().collect();
                        for tag in tags {
                            let state = states.get_mut(&tag).expect("tag listed above");
                            for b in state.drain(tag, capacity) {
                                out.forward(b);
                            }
                        }
                    }
                }
                control => match core.handle(control) {
                    Collected::Forward(Message::Control(Control::CollectionEnd(t))) => {
                        if let Some(mut state) = states.remove(&t) {
                            for b in state.drain(t, capacity) {
                                out.forward(b);
                            }
                        }
                        out.control(Control::CollectionEnd(t));
                    }
                    Collected::Forward(Message::Control(c)) => out.control(c),
                    Collected::Forward(Message::Data(_)) => {
                        unreachable!("data handled before the collector core")
                    }
                    Collected::Swallow => {}
                    Collected::Finished => {
                        out.control(Control::GlobalEnd);
                        break;
                    }
                },
            }
        }
    })
}

/// Build the reducer ring and its trailing collector.
///
/// Returns the senders the producing ring shuffles into (one per reducer,
/// each producer clones all of them) and the farm's output receiver.
pub(crate) fn reducer_ring(
    b: &mut NetworkBuilder,
    mappers: usize,
    reducers: usize,
    factory: &Arc<dyn ReduceStateFactory>,
) -> (Vec<Sender>, Receiver) {
    let capacity = b.config().batch_capacity;
    let (c_tx, c_rx) = b.link();
    let mut txs = Vec::with_capacity(reducers);
    for j in 0..reducers {
        let (tx, rx) = b.link();
        txs.push(tx);
        let name = b.stage_name(&format!("fused-reduce-{j}"));
        b.add(spawn_fused_reducer(
            name,
            rx,
            c_tx.clone(),
            mappers,
            Arc::clone(factory),
            capacity,
        ));
    }
    drop(c_tx);
    let (out_tx, out_rx) = b.link();
    let name = b.stage_name("fused-collector");
    b.add(spawn_collector(name, c_rx, out_tx, reducers, reducers));
    (txs, out_rx)
}

/// Build a complete fused unary+reduce farm: round-robin emitter, producing
/// ring, reducer ring, collector.
pub(crate) fn build_unary_reduce(
    b: &mut NetworkBuilder,
    input: Receiver,
    transform: Arc<dyn ErasedTransform>,
    factory: Arc<dyn ReduceStateFactory>,
    mappers: usize,
    reducers: usize,
) -> Receiver {
    let capacity = b.config().batch_capacity;
    let mut mapper_txs = Vec::with_capacity(mappers);
    let mut mapper_rxs = Vec::with_capacity(mappers);
    for _ in 0..mappers {
        let (tx, rx) = b.link();
        mapper_txs.push(tx);
        mapper_rxs.push(rx);
    }
    let name = b.stage_name("fused-emitter");
    b.add(spawn_emitter(name, input, mapper_txs, Box::new(RoundRobin::default())));
    let (reducer_txs, out) = reducer_ring(b, mappers, reducers, &factory);
    for (i, rx) in mapper_rxs.into_iter().enumerate() {
        let name = b.stage_name(&format!("fused-map-{i}"));
        b.add(spawn_unary_mapper(
            name,
            rx,
            reducer_txs.clone(),
            Arc::clone(&transform),
            Arc::clone(&factory),
            capacity,
        ));
    }
    out
}
