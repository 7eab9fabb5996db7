//! Stage primitives: emitter (fan-out), worker, collector (fan-in).
//!
//! A farm is one emitter, N workers and one collector, each running on its
//! own OS thread and connected by bounded channels. The loops here are thin
//! drivers; routing decisions live in [`Dispatch`] implementations and
//! per-operator behavior lives in [`WorkerLogic`] implementations, so the
//! interesting parts stay testable without threads.

use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::thread::{self, JoinHandle};

use log::trace;

use crate::batch::{Batch, BatchAny, Item, downcast_batch};
use crate::channel::{self, Receiver, Sender};
use crate::message::{Control, Message};
use crate::tag::Tag;

/// Handle to one spawned stage thread.
pub struct StageHandle {
    name: String,
    handle: JoinHandle<()>,
}

impl StageHandle {
    pub fn spawn<F>(name: impl Into<String>, f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let name = name.into();
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(f)
            .expect("failed to spawn stage thread");
        Self { name, handle }
    }

    /// Block until the stage exits; a panicked stage panics the joiner too.
    pub fn join(self) {
        if self.handle.join().is_err() {
            panic!("stage '{}' panicked", self.name);
        }
    }
}

/// Deterministic worker index for a key: `hash(key) % n`.
pub fn key_index<K: Hash>(key: &K, n: usize) -> usize {
    let mut h = DefaultHasher::new();
    key.hash(&mut h);
    (h.finish() % n as u64) as usize
}

/* ===================== Emitter ===================== */

/// The emitter's view of its worker channels.
pub struct FanOut {
    outs: Vec<Sender>,
}

impl FanOut {
    pub fn new(outs: Vec<Sender>) -> Self {
        Self { outs }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.outs.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.outs.is_empty()
    }

    pub fn send_to(&self, dest: usize, msg: Message) {
        channel::send(&self.outs[dest], msg);
    }

    pub fn broadcast_control(&self, c: Control) {
        for tx in &self.outs {
            channel::send(tx, Message::Control(c));
        }
    }
}

/// Data routing rule applied by an emitter.
pub trait Dispatch: Send {
    /// Route one data batch to the worker queues, possibly splitting it
    /// across per-destination batches.
    fn dispatch(&mut self, batch: Box<dyn BatchAny>, outs: &FanOut);

    /// Flush partial per-destination batches buffered for `tag`. Called just
    /// before the emitter fans out `CollectionEnd(tag)`.
    fn flush(&mut self, _tag: Tag, _outs: &FanOut) {}
}

/// Deep-clones every batch to every worker.
pub struct Broadcast;

impl Dispatch for Broadcast {
    fn dispatch(&mut self, batch: Box<dyn BatchAny>, outs: &FanOut) {
        for dest in 0..outs.len() - 1 {
            outs.send_to(dest, Message::Data(batch.clone_batch()));
        }
        outs.send_to(outs.len() - 1, Message::Data(batch));
    }
}

/// Whole batches dealt to workers in turn.
#[derive(Default)]
pub struct RoundRobin {
    next: usize,
}

impl Dispatch for RoundRobin {
    fn dispatch(&mut self, batch: Box<dyn BatchAny>, outs: &FanOut) {
        let dest = self.next;
        self.next = (self.next + 1) % outs.len();
        outs.send_to(dest, Message::Data(batch));
    }
}

/// Splits batches item-by-item so each key always reaches the same worker.
///
/// Partial per-destination batches are held per tag and flushed either when
/// full or when the tag's collection ends. This routing is what lets
/// stateful workers keep per-tag, per-key state without locks.
pub struct KeyedDispatch<T, K, F> {
    key_of: F,
    batch_capacity: usize,
    partial: HashMap<Tag, Vec<Option<Batch<T>>>>,
    _k: std::marker::PhantomData<fn() -> K>,
}

impl<T, K, F> KeyedDispatch<T, K, F>
where
    T: Item,
    K: Hash,
    F: Fn(&T) -> K + Send,
{
    pub fn new(batch_capacity: usize, key_of: F) -> Self {
        Self {
            key_of,
            batch_capacity,
            partial: HashMap::new(),
            _k: std::marker::PhantomData,
        }
    }
}

impl<T, K, F> Dispatch for KeyedDispatch<T, K, F>
where
    T: Item,
    K: Hash,
    F: Fn(&T) -> K + Send,
{
    fn dispatch(&mut self, batch: Box<dyn BatchAny>, outs: &FanOut) {
        let n = outs.len();
        let batch: Batch<T> = downcast_batch(batch);
        let tag = batch.tag();
        let cap = self.batch_capacity;
        let slots = self
            .partial
            .entry(tag)
            .or_insert_with(|| (0..n).map(|_| None).collect());
        for item in batch.into_committed() {
            let dest = key_index(&(self.key_of)(&item), n);
            let slot = slots[dest].get_or_insert_with(|| Batch::with_capacity(tag, cap));
            if slot.push(item).is_err() {
                unreachable!("keyed dispatch wrote past a flushed batch");
            }
            if slot.is_full() {
                let full = slots[dest].take().expect("slot just filled");
                outs.send_to(dest, Message::data(full));
            }
        }
    }

    fn flush(&mut self, tag: Tag, outs: &FanOut) {
        if let Some(slots) = self.partial.remove(&tag) {
            for (dest, slot) in slots.into_iter().enumerate() {
                if let Some(b) = slot
                    && !b.is_empty()
                {
                    outs.send_to(dest, Message::data(b));
                }
            }
        }
    }
}

/// Spawn an emitter: fans control out to all workers and routes data through
/// the dispatch rule.
pub fn spawn_emitter(
    name: impl Into<String>,
    rx: Receiver,
    outs: Vec<Sender>,
    mut dispatch: Box<dyn Dispatch>,
) -> StageHandle {
    let name = name.into();
    StageHandle::spawn(name.clone(), move || {
        let fan = FanOut::new(outs);
        for msg in rx {
            match msg {
                Message::Data(b) => dispatch.dispatch(b, &fan),
                Message::Control(Control::CollectionEnd(t)) => {
                    dispatch.flush(t, &fan);
                    fan.broadcast_control(Control::CollectionEnd(t));
                }
                Message::Control(Control::GlobalEnd) => {
                    fan.broadcast_control(Control::GlobalEnd);
                    break;
                }
                Message::Control(c) => fan.broadcast_control(c),
            }
        }
        trace!("emitter '{name}' done");
    })
}

/* ===================== Worker ===================== */

/// A worker's single downstream channel.
pub struct Output {
    tx: Sender,
}

impl Output {
    pub fn new(tx: Sender) -> Self {
        Self { tx }
    }

    pub fn data<T: Item>(&self, batch: Batch<T>) {
        channel::send(&self.tx, Message::data(batch));
    }

    pub fn forward(&self, batch: Box<dyn BatchAny>) {
        channel::send(&self.tx, Message::Data(batch));
    }

    pub fn control(&self, c: Control) {
        channel::send(&self.tx, Message::Control(c));
    }
}

/// Per-operator worker behavior: one batch at a time, per-tag private state.
///
/// The default control handlers forward collection brackets untouched, which
/// is right for stateless operators; stateful ones override `on_collection_end`
/// to synthesize final output for the tag before the bracket goes out.
pub trait WorkerLogic: Send {
    fn on_batch(&mut self, batch: Box<dyn BatchAny>, out: &Output);

    fn on_collection_begin(&mut self, tag: Tag, out: &Output) {
        out.control(Control::CollectionBegin(tag));
    }

    fn on_collection_end(&mut self, tag: Tag, out: &Output) {
        out.control(Control::CollectionEnd(tag));
    }

    /// Emit accumulated state now. Consumed, never forwarded.
    fn on_sync(&mut self, _out: &Output) {}
}

pub fn spawn_worker(
    name: impl Into<String>,
    rx: Receiver,
    tx: Sender,
    mut logic: Box<dyn WorkerLogic>,
) -> StageHandle {
    let name = name.into();
    StageHandle::spawn(name.clone(), move || {
        let out = Output::new(tx);
        for msg in rx {
            match msg {
                Message::Data(b) => logic.on_batch(b, &out),
                Message::Control(Control::CollectionBegin(t)) => {
                    logic.on_collection_begin(t, &out);
                }
                Message::Control(Control::CollectionEnd(t)) => {
                    logic.on_collection_end(t, &out);
                }
                Message::Control(Control::Sync) => logic.on_sync(&out),
                Message::Control(Control::GlobalBegin) => out.control(Control::GlobalBegin),
                Message::Control(Control::GlobalEnd) => {
                    out.control(Control::GlobalEnd);
                    break;
                }
            }
        }
        trace!("worker '{name}' done");
    })
}

/* ===================== Collector ===================== */

/// Fan-in bookkeeping, kept apart from the thread loop so interleavings can
/// be tested directly.
///
/// Counting is per tag, not global: several collections may be in flight
/// through the same farm at once. `inputs` is how many upstream threads feed
/// this collector; `ends_per_tag` is how many `CollectionEnd` reports close
/// one tag (every worker reports every tag in a farm, exactly one branch
/// reports a tag in a merge).
pub struct CollectorCore {
    inputs: usize,
    ends_per_tag: usize,
    per_tag: HashMap<Tag, TagCount>,
    global_begins: usize,
    global_ends: usize,
}

#[derive(Default)]
struct TagCount {
    begins: usize,
    ends: usize,
}

/// What the collector loop should do with one incoming message.
pub enum Collected {
    Forward(Message),
    Swallow,
    /// Forward `GlobalEnd` and shut the stage down.
    Finished,
}

impl CollectorCore {
    pub fn new(inputs: usize, ends_per_tag: usize) -> Self {
        assert!(inputs > 0 && ends_per_tag > 0);
        Self {
            inputs,
            ends_per_tag,
            per_tag: HashMap::new(),
            global_begins: 0,
            global_ends: 0,
        }
    }

    pub fn handle(&mut self, msg: Message) -> Collected {
        match msg {
            Message::Data(b) => Collected::Forward(Message::Data(b)),
            Message::Control(Control::CollectionBegin(t)) => {
                let c = self.per_tag.entry(t).or_default();
                c.begins += 1;
                assert!(
                    c.begins <= self.ends_per_tag,
                    "collector: {t:?} began {} times, expected at most {}",
                    c.begins,
                    self.ends_per_tag
                );
                if c.begins == 1 {
                    Collected::Forward(Control::CollectionBegin(t).into())
                } else {
                    Collected::Swallow
                }
            }
            Message::Control(Control::CollectionEnd(t)) => {
                let c = self
                    .per_tag
                    .get_mut(&t)
                    .unwrap_or_else(|| panic!("collector: CollectionEnd for unopened {t:?}"));
                c.ends += 1;
                if c.ends == self.ends_per_tag {
                    self.per_tag.remove(&t);
                    Collected::Forward(Control::CollectionEnd(t).into())
                } else {
                    Collected::Swallow
                }
            }
            Message::Control(Control::GlobalBegin) => {
                self.global_begins += 1;
                assert!(self.global_begins <= self.inputs, "collector: too many GlobalBegin");
                if self.global_begins == 1 {
                    Collected::Forward(Control::GlobalBegin.into())
                } else {
                    Collected::Swallow
                }
            }
            Message::Control(Control::GlobalEnd) => {
                self.global_ends += 1;
                assert!(self.global_ends <= self.inputs, "collector: too many GlobalEnd");
                if self.global_ends == self.inputs {
                    Collected::Finished
                } else {
                    Collected::Swallow
                }
            }
            Message::Control(Control::Sync) => Collected::Forward(Control::Sync.into()),
        }
    }
}

pub fn spawn_collector(
    name: impl Into<String>,
    rx: Receiver,
    tx: Sender,
    inputs: usize,
    ends_per_tag: usize,
) -> StageHandle {
    let name = name.into();
    StageHandle::spawn(name.clone(), move || {
        let mut core = CollectorCore::new(inputs, ends_per_tag);
        for msg in rx {
            match core.handle(msg) {
                Collected::Forward(m) => channel::send(&tx, m),
                Collected::Swallow => {}
                Collected::Finished => {
                    channel::send(&tx, Control::GlobalEnd.into());
                    break;
                }
            }
        }
        trace!("collector '{name}' done");
    })
}
