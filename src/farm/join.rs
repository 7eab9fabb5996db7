//! Key-join-flat-map over two tagged input sides.
//!
//! The join farm has its own emitter: it reads both inputs, learns which tag
//! belongs to which side from the `CollectionBegin` order on each channel,
//! records that in a shared [`SideRegistry`], and key-routes data from both
//! sides so matching keys always meet in the same worker. The emitter also
//! mints a fresh output tag per round; side tags never leak past the farm.
//!
//! Caching is asymmetric. The left side is cached per key in full; right
//! items arriving before the left side has ended are buffered, everything
//! after joins eagerly against the finished left cache. The pure pairing
//! logic lives in [`JoinCore`] so it can be driven item-by-item in tests.

use std::any::Any;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex};

use anyhow::{Result, bail};
use crossbeam_channel::select;

use crate::batch::{Batch, BatchAny, Item, downcast_batch, into_batches};
use crate::channel::{Receiver, Sender};
use crate::compiler::NetworkBuilder;
use crate::farm::fused;
use crate::farm::reduce::ReduceStateFactory;
use crate::message::{Control, Message};
use crate::operator::{Descriptor, Operator, OperatorKind, StructureType};
use crate::stage::{Dispatch, FanOut, KeyedDispatch, Output, StageHandle, WorkerLogic};
use crate::tag::{SharedTagGenerator, Tag};

/* ===================== Sides and the tag registry ===================== */

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum Side {
    Left,
    Right,
}

/// Maps side-collection tags to the side they arrived on.
///
/// Written by the join emitter when a side's `CollectionBegin` shows up,
/// read by the workers when data with that tag reaches them. The channel
/// between emitter and worker orders the write before every read, so the
/// mutex is never contended on the data path.
pub(crate) struct SideRegistry {
    sides: Mutex<HashMap<Tag, Side>>,
}

impl SideRegistry {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self { sides: Mutex::new(HashMap::new()) })
    }

    fn register(&self, tag: Tag, side: Side) {
        let prev = self.sides.lock().unwrap().insert(tag, side);
        assert!(prev.is_none(), "join: {tag:?} opened twice");
    }

    pub(crate) fn side_of(&self, tag: Tag) -> Side {
        *self
            .sides
            .lock()
            .unwrap()
            .get(&tag)
            .unwrap_or_else(|| panic!("join: data with unregistered {tag:?}"))
    }
}

/* ===================== Pure pairing core ===================== */

/// One item entering a join, annotated with its side. Mostly a test-side
/// convenience for driving [`JoinCore`] without channels.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JoinItem<K, L, R> {
    Left(K, L),
    Right(K, R),
}

/// The join pairing state machine for one round, free of any transport.
pub struct JoinCore<K, L, R, O> {
    kernel: Arc<dyn Fn(&K, &L, &R) -> Vec<O> + Send + Sync>,
    left: HashMap<K, Vec<L>>,
    right_pending: Vec<(K, R)>,
    left_done: bool,
}

impl<K, L, R, O> JoinCore<K, L, R, O>
where
    K: Item + Eq + Hash,
    L: Item,
    R: Item,
    O: Item,
{
    pub fn new(kernel: Arc<dyn Fn(&K, &L, &R) -> Vec<O> + Send + Sync>) -> Self {
        Self {
            kernel,
            left: HashMap::new(),
            right_pending: Vec::new(),
            left_done: false,
        }
    }

    fn join_one(&self, k: &K, r: &R, out: &mut Vec<O>) {
        if let Some(ls) = self.left.get(k) {
            for l in ls {
                out.extend((self.kernel)(k, l, r));
            }
        }
    }

    /// Feed one item; returns whatever output it produces immediately.
    pub fn push(&mut self, item: JoinItem<K, L, R>) -> Vec<O> {
        match item {
            JoinItem::Left(k, l) => {
                assert!(!self.left_done, "join: left item after the left side ended");
                self.left.entry(k).or_default().push(l);
                Vec::new()
            }
            JoinItem::Right(k, r) => {
                if self.left_done {
                    let mut out = Vec::new();
                    self.join_one(&k, &r, &mut out);
                    out
                } else {
                    self.right_pending.push((k, r));
                    Vec::new()
                }
            }
        }
    }

    /// Mark one side finished; ending the left side drains the buffered
    /// right items against the now-complete cache.
    pub fn end(&mut self, side: Side) -> Vec<O> {
        match side {
            Side::Left => {
                self.left_done = true;
                let pending = std::mem::take(&mut self.right_pending);
                let mut out = Vec::new();
                for (k, r) in &pending {
                    self.join_one(k, r, &mut out);
                }
                out
            }
            Side::Right => Vec::new(),
        }
    }
}

/// Type-erased view of a join core, as the farm machinery drives it.
pub(crate) trait JoinCoreAny: Send {
    fn on_batch(
        &mut self,
        side: Side,
        batch: Box<dyn BatchAny>,
        out_tag: Tag,
        capacity: usize,
    ) -> Vec<Box<dyn BatchAny>>;

    fn on_side_end(&mut self, side: Side, out_tag: Tag, capacity: usize)
    -> Vec<Box<dyn BatchAny>>;
}

pub(crate) trait JoinCoreFactory: Send + Sync {
    fn new_core(&self) -> Box<dyn JoinCoreAny>;
}

impl<K, L, R, O> JoinCoreAny for JoinCore<K, L, R, O>
where
    K: Item + Eq + Hash,
    L: Item,
    R: Item,
    O: Item,
{
    fn on_batch(
        &mut self,
        side: Side,
        batch: Box<dyn BatchAny>,
        out_tag: Tag,
        capacity: usize,
    ) -> Vec<Box<dyn BatchAny>> {
        let mut out: Vec<O> = Vec::new();
        match side {
            Side::Left => {
                let batch: Batch<(K, L)> = downcast_batch(batch);
                for (k, l) in batch.into_committed() {
                    out.extend(self.push(JoinItem::Left(k, l)));
                }
            }
            Side::Right => {
                let batch: Batch<(K, R)> = downcast_batch(batch);
                for (k, r) in batch.into_committed() {
                    out.extend(self.push(JoinItem::Right(k, r)));
                }
            }
        }
        into_batches(out_tag, capacity, out)
    }

    fn on_side_end(
        &mut self,
        side: Side,
        out_tag: Tag,
        capacity: usize,
    ) -> Vec<Box<dyn BatchAny>> {
        into_batches(out_tag, capacity, self.end(side))
    }
}

struct CoreFactory<K, L, R, O> {
    kernel: Arc<dyn Fn(&K, &L, &R) -> Vec<O> + Send + Sync>,
}

impl<K, L, R, O> JoinCoreFactory for CoreFactory<K, L, R, O>
where
    K: Item + Eq + Hash,
    L: Item,
    R: Item,
    O: Item,
{
    fn new_core(&self) -> Box<dyn JoinCoreAny> {
        Box::new(JoinCore::new(Arc::clone(&self.kernel)))
    }
}

/* ===================== Emitter ===================== */

struct Round {
    out_tag: Tag,
    begins: usize,
    ends: usize,
}

/// The two-input join emitter.
///
/// Registers side tags, key-routes data per side, and brackets each round
/// with a freshly minted output tag. Side `CollectionEnd`s are fanned to the
/// workers as flush triggers; the round's own `CollectionEnd(out_tag)` goes
/// out only after both sides ended.
pub(crate) fn spawn_join_emitter(
    name: impl Into<String>,
    left: Receiver,
    right: Receiver,
    outs: Vec<Sender>,
    registry: Arc<SideRegistry>,
    tags: SharedTagGenerator,
    mut left_dispatch: Box<dyn Dispatch>,
    mut right_dispatch: Box<dyn Dispatch>,
) -> StageHandle {
    StageHandle::spawn(name, move || {
        let fan = FanOut::new(outs);
        let mut round: Option<Round> = None;
        let mut global_begins = 0usize;
        let mut open = [true, true];
        while open[0] || open[1] {
            let (side, msg) = if open[0] && open[1] {
                select! {
                    recv(left) -> m => match m {
                        Ok(m) => (Side::Left, m),
                        Err(_) => { open[0] = false; continue; }
                    },
                    recv(right) -> m => match m {
                        Ok(m) => (Side::Right, m),
                        Err(_) => { open[1] = false; continue; }
                    },
                }
            } else {
                let (idx, rx, side) =
                    if open[0] { (0, &left, Side::Left) } else { (1, &right, Side::Right) };
                match rx.recv() {
                    Ok(m) => (side, m),
                    Err(_) => {
                        open[idx] = false;
                        continue;
                    }
                }
            };
            match msg {
                Message::Data(b) => match side {
                    Side::Left => left_dispatch.dispatch(b, &fan),
                    Side::Right => right_dispatch.dispatch(b, &fan),
                },
                Message::Control(Control::CollectionBegin(t)) => {
                    registry.register(t, side);
                    match &mut round {
                        None => {
                            let out_tag = tags.fresh();
                            fan.broadcast_control(Control::CollectionBegin(out_tag));
                            round = Some(Round { out_tag, begins: 1, ends: 0 });
                        }
                        Some(r) => {
                            r.begins += 1;
                            assert!(
                                r.begins <= 2,
                                "join: third CollectionBegin before the round closed"
                            );
                        }
                    }
                }
                Message::Control(Control::CollectionEnd(t)) => {
                    match side {
                        Side::Left => left_dispatch.flush(t, &fan),
                        Side::Right => right_dispatch.flush(t, &fan),
                    }
                    fan.broadcast_control(Control::CollectionEnd(t));
                    let r = round.as_mut().expect("join: CollectionEnd outside a round");
                    r.ends += 1;
                    if r.ends == 2 {
                        let out_tag = r.out_tag;
                        round = None;
                        fan.broadcast_control(Control::CollectionEnd(out_tag));
                    }
                }
                Message::Control(Control::GlobalBegin) => {
                    global_begins += 1;
                    if global_begins == 1 {
                        fan.broadcast_control(Control::GlobalBegin);
                    }
                }
                Message::Control(Control::GlobalEnd) => {
                    open[match side {
                        Side::Left => 0,
                        Side::Right => 1,
                    }] = false;
                }
                Message::Control(Control::Sync) => {
                    fan.broadcast_control(Control::Sync);
                }
            }
        }
        fan.broadcast_control(Control::GlobalEnd);
    })
}

/* ===================== Worker ===================== */

struct JoinWorker {
    factory: Arc<dyn JoinCoreFactory>,
    registry: Arc<SideRegistry>,
    core: Box<dyn JoinCoreAny>,
    out_tag: Tag,
    capacity: usize,
}

impl JoinWorker {
    fn new(factory: Arc<dyn JoinCoreFactory>, registry: Arc<SideRegistry>, capacity: usize) -> Self {
        let core = factory.new_core();
        Self { factory, registry, core, out_tag: Tag::NIL, capacity }
    }
}

impl WorkerLogic for JoinWorker {
    fn on_batch(&mut self, batch: Box<dyn BatchAny>, out: &Output) {
        let side = self.registry.side_of(batch.tag());
        for b in self.core.on_batch(side, batch, self.out_tag, self.capacity) {
            out.forward(b);
        }
    }

    fn on_collection_begin(&mut self, tag: Tag, out: &Output) {
        // Only the round's output tag is bracketed past the emitter.
        self.out_tag = tag;
        self.core = self.factory.new_core();
        out.control(Control::CollectionBegin(tag));
    }

    fn on_collection_end(&mut self, tag: Tag, out: &Output) {
        if tag == self.out_tag {
            out.control(Control::CollectionEnd(tag));
        } else {
            let side = self.registry.side_of(tag);
            for b in self.core.on_side_end(side, self.out_tag, self.capacity) {
                out.forward(b);
            }
        }
    }
}

/* ===================== Operator ===================== */

/// Equi-join on key, flat-mapping each `(key, left, right)` pairing through
/// a user kernel.
pub struct KeyJoinFlatMap<K, L, R, O> {
    kernel: Arc<dyn Fn(&K, &L, &R) -> Vec<O> + Send + Sync>,
    parallelism: usize,
}

impl<K, L, R, O> KeyJoinFlatMap<K, L, R, O>
where
    K: Item + Eq + Hash,
    L: Item,
    R: Item,
    O: Item,
{
    pub fn new<F>(parallelism: usize, kernel: F) -> Self
    where
        F: Fn(&K, &L, &R) -> Vec<O> + Send + Sync + 'static,
    {
        Self { kernel: Arc::new(kernel), parallelism }
    }

    fn core_factory(&self) -> Arc<dyn JoinCoreFactory> {
        Arc::new(CoreFactory { kernel: Arc::clone(&self.kernel) })
    }

    fn dispatches(&self, capacity: usize) -> (Box<dyn Dispatch>, Box<dyn Dispatch>) {
        let left = KeyedDispatch::<(K, L), K, _>::new(capacity, |kv: &(K, L)| kv.0.clone());
        let right = KeyedDispatch::<(K, R), K, _>::new(capacity, |kv: &(K, R)| kv.0.clone());
        (Box::new(left), Box::new(right))
    }
}

impl<K, L, R, O> Operator for KeyJoinFlatMap<K, L, R, O>
where
    K: Item + Eq + Hash,
    L: Item,
    R: Item,
    O: Item,
{
    fn descriptor(&self) -> Descriptor {
        Descriptor {
            kind: OperatorKind::Join,
            in_arity: 2,
            out_arity: 1,
            parallelism: self.parallelism,
            partitioning: true,
            windowing: false,
            // The left cache only completes when the left side ends.
            supported: vec![StructureType::BoundedOrdered, StructureType::BoundedUnordered],
        }
    }

    fn instantiate(
        &self,
        b: &mut NetworkBuilder,
        mut inputs: Vec<Receiver>,
        structure: StructureType,
    ) -> Result<Receiver> {
        if !self.descriptor().supports(structure) {
            bail!("key-join-flat-map cannot run over {structure:?}");
        }
        let right = inputs.pop().expect("join needs two inputs");
        let left = inputs.pop().expect("join needs two inputs");
        let n = b.config().resolve_parallelism(self.parallelism);
        let capacity = b.config().batch_capacity;
        let registry = SideRegistry::new();
        let factory = self.core_factory();

        let mut worker_txs = Vec::with_capacity(n);
        let mut worker_rxs = Vec::with_capacity(n);
        for _ in 0..n {
            let (tx, rx) = b.link();
            worker_txs.push(tx);
            worker_rxs.push(rx);
        }
        let (left_dispatch, right_dispatch) = self.dispatches(capacity);
        let emitter = spawn_join_emitter(
            b.stage_name("join-emitter"),
            left,
            right,
            worker_txs,
            Arc::clone(&registry),
            b.tags(),
            left_dispatch,
            right_dispatch,
        );
        b.add(emitter);

        let (c_tx, c_rx) = b.link();
        for (i, rx) in worker_rxs.into_iter().enumerate() {
            let worker = JoinWorker::new(Arc::clone(&factory), Arc::clone(&registry), capacity);
            let name = b.stage_name(&format!("join-worker-{i}"));
            b.add(crate::stage::spawn_worker(name, rx, c_tx.clone(), Box::new(worker)));
        }
        drop(c_tx);

        let (out_tx, out_rx) = b.link();
        let name = b.stage_name("join-collector");
        b.add(crate::stage::spawn_collector(name, c_rx, out_tx, n, n));
        Ok(out_rx)
    }

    fn instantiate_fused(
        &self,
        next: &dyn Operator,
        b: &mut NetworkBuilder,
        mut inputs: Vec<Receiver>,
        _structure: StructureType,
    ) -> Option<Result<Receiver>> {
        let state: Arc<dyn ReduceStateFactory> = next.fusion_state()?;
        let right = inputs.pop().expect("join needs two inputs");
        let left = inputs.pop().expect("join needs two inputs");
        let mappers = b.config().resolve_parallelism(self.parallelism);
        let reducers = b.config().resolve_parallelism(next.parallelism());
        let capacity = b.config().batch_capacity;
        let registry = SideRegistry::new();

        let mut mapper_txs = Vec::with_capacity(mappers);
        let mut mapper_rxs = Vec::with_capacity(mappers);
        for _ in 0..mappers {
            let (tx, rx) = b.link();
            mapper_txs.push(tx);
            mapper_rxs.push(rx);
        }
        let (left_dispatch, right_dispatch) = self.dispatches(capacity);
        let emitter = spawn_join_emitter(
            b.stage_name("fused-join-emitter"),
            left,
            right,
            mapper_txs,
            Arc::clone(&registry),
            b.tags(),
            left_dispatch,
            right_dispatch,
        );
        b.add(emitter);

        let (reducer_txs, out) = fused::reducer_ring(b, mappers, reducers, &state);
        for (i, rx) in mapper_rxs.into_iter().enumerate() {
            let name = b.stage_name(&format!("fused-join-{i}"));
            b.add(fused::spawn_join_mapper(
                name,
                rx,
                reducer_txs.clone(),
                self.core_factory(),
                Arc::clone(&registry),
                Arc::clone(&state),
                capacity,
            ));
        }
        Some(Ok(out))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
