//! Keyed reduction, standalone and as the erased accumulator behind fusion.
//!
//! The standalone farm routes by key, so each worker owns a disjoint slice
//! of the key space per tag: `{tag -> {key -> accumulator}}`, drained when
//! the tag's collection ends. The windowed variant additionally counts items
//! per key and emits early every time a key reaches the window size —
//! tumbling, per-key count windows only. Sliding windows are a deliberate
//! gap.
//!
//! [`ReduceState`] is the type-erased seam the fused farms accumulate
//! through; it also knows how to split its state into hash partitions for
//! the reducer shuffle ring.

use std::any::Any;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use anyhow::{Result, bail};

use crate::batch::{Batch, BatchAny, Item, downcast_batch, into_batches};
use crate::channel::Receiver;
use crate::compiler::NetworkBuilder;
use crate::message::Control;
use crate::operator::{Descriptor, Operator, OperatorKind, StructureType, all_structures};
use crate::stage::{KeyedDispatch, Output, WorkerLogic, key_index};
use crate::tag::Tag;

/* ===================== Erased accumulator seam ===================== */

/// Factory for per-tag reduce accumulators, shared between the standalone
/// farm and the fused farms.
pub trait ReduceStateFactory: Send + Sync {
    fn new_state(&self) -> Box<dyn ReduceState>;
}

/// One tag's worth of keyed accumulation, type-erased.
pub trait ReduceState: Send {
    /// Fold a batch of `(key, value)` pairs into the state. Partial state
    /// batches from another worker fold in the same way.
    fn absorb(&mut self, batch: Box<dyn BatchAny>);

    /// Split the state into `parts` hash partitions (`hash(key) % parts`)
    /// and drain each into batches of at most `capacity` items.
    fn drain_partitions(
        &mut self,
        tag: Tag,
        parts: usize,
        capacity: usize,
    ) -> Vec<Vec<Box<dyn BatchAny>>>;

    /// Drain the whole state into output batches.
    fn drain(&mut self, tag: Tag, capacity: usize) -> Vec<Box<dyn BatchAny>>;
}

struct KeyedStateFactory<K, V> {
    kernel: Arc<dyn Fn(V, V) -> V + Send + Sync>,
    _k: std::marker::PhantomData<fn() -> K>,
}

struct KeyedState<K, V> {
    kernel: Arc<dyn Fn(V, V) -> V + Send + Sync>,
    acc: HashMap<K, V>,
}

impl<K, V> ReduceStateFactory for KeyedStateFactory<K, V>
where
    K: Item + Eq + Hash,
    V: Item,
{
    fn new_state(&self) -> Box<dyn ReduceState> {
        Box::new(KeyedState::<K, V> { kernel: Arc::clone(&self.kernel), acc: HashMap::new() })
    }
}

impl<K, V> ReduceState for KeyedState<K, V>
where
    K: Item + Eq + Hash,
    V: Item,
{
    fn absorb(&mut self, batch: Box<dyn BatchAny>) {
        let batch: Batch<(K, V)> = downcast_batch(batch);
        for (k, v) in batch.into_committed() {
            match self.acc.remove(&k) {
                Some(prev) => {
                    self.acc.insert(k, (self.kernel)(prev, v));
                }
                None => {
                    self.acc.insert(k, v);
                }
            }
        }
    }

    fn drain_partitions(
        &mut self,
        tag: Tag,
        parts: usize,
        capacity: usize,
    ) -> Vec<Vec<Box<dyn BatchAny>>> {
        let mut split: Vec<Vec<(K, V)>> = (0..parts).map(|_| Vec::new()).collect();
        for (k, v) in self.acc.drain() {
            let dest = key_index(&k, parts);
            split[dest].push((k, v));
        }
        split
            .into_iter()
            .map(|items| into_batches(tag, capacity, items))
            .collect()
    }

    fn drain(&mut self, tag: Tag, capacity: usize) -> Vec<Box<dyn BatchAny>> {
        let items: Vec<(K, V)> = self.acc.drain().collect();
        into_batches(tag, capacity, items)
    }
}

/* ===================== Standalone farm ===================== */

struct WindowAcc<V> {
    acc: Option<V>,
    count: usize,
}

impl<V> Default for WindowAcc<V> {
    fn default() -> Self {
        Self { acc: None, count: 0 }
    }
}

/// Worker for the standalone reduce farm. Per-tag, per-key state; windowed
/// when `window` is set.
struct ReduceWorker<K, V> {
    kernel: Arc<dyn Fn(V, V) -> V + Send + Sync>,
    window: Option<usize>,
    capacity: usize,
    state: HashMap<Tag, HashMap<K, WindowAcc<V>>>,
}

impl<K, V> ReduceWorker<K, V>
where
    K: Item + Eq + Hash,
    V: Item,
{
    fn emit_batch(&self, tag: Tag, items: Vec<(K, V)>, out: &Output) {
        for b in into_batches(tag, self.capacity, items) {
            out.forward(b);
        }
    }
}

impl<K, V> WorkerLogic for ReduceWorker<K, V>
where
    K: Item + Eq + Hash,
    V: Item,
{
    fn on_batch(&mut self, batch: Box<dyn BatchAny>, out: &Output) {
        let batch: Batch<(K, V)> = downcast_batch(batch);
        let tag = batch.tag();
        let per_key = self.state.entry(tag).or_default();
        let mut early: Vec<(K, V)> = Vec::new();
        for (k, v) in batch.into_committed() {
            let slot = per_key.entry(k.clone()).or_default();
            slot.acc = Some(match slot.acc.take() {
                Some(prev) => (self.kernel)(prev, v),
                None => v,
            });
            slot.count += 1;
            if let Some(w) = self.window
                && slot.count >= w
            {
                let done = slot.acc.take().expect("window slot just written");
                per_key.remove(&k);
                early.push((k, done));
            }
        }
        if !early.is_empty() {
            self.emit_batch(tag, early, out);
        }
    }

    fn on_collection_end(&mut self, tag: Tag, out: &Output) {
        if let Some(per_key) = self.state.remove(&tag) {
            let items: Vec<(K, V)> = per_key
                .into_iter()
                .filter_map(|(k, slot)| slot.acc.map(|v| (k, v)))
                .collect();
            if !items.is_empty() {
                self.emit_batch(tag, items, out);
            }
        }
        out.control(Control::CollectionEnd(tag));
    }

    fn on_sync(&mut self, out: &Output) {
        // Emit everything accumulated so far; counters reset with the state.
        let tags: Vec<Tag> = self.state.keys().copied().collect();
        for tag in tags {
            let per_key = self.state.get_mut(&tag).expect("tag listed above");
            let items: Vec<(K, V)> = per_key
                .drain()
                .filter_map(|(k, slot)| slot.acc.map(|v| (k, v)))
                .collect();
            if !items.is_empty() {
                self.emit_batch(tag, items, out);
            }
        }
    }
}

/// Per-key reduction with a user-supplied associative, commutative kernel.
pub struct ReduceByKey<K, V> {
    kernel: Arc<dyn Fn(V, V) -> V + Send + Sync>,
    parallelism: usize,
    window: Option<usize>,
    _k: std::marker::PhantomData<fn() -> K>,
}

impl<K, V> ReduceByKey<K, V>
where
    K: Item + Eq + Hash,
    V: Item,
{
    pub fn new<F>(parallelism: usize, kernel: F) -> Self
    where
        F: Fn(V, V) -> V + Send + Sync + 'static,
    {
        Self {
            kernel: Arc::new(kernel),
            parallelism,
            window: None,
            _k: std::marker::PhantomData,
        }
    }

    /// Tumbling per-key count windows: every `window` items under one key
    /// produce one early result and reset that key's counter.
    pub fn windowed<F>(parallelism: usize, window: usize, kernel: F) -> Self
    where
        F: Fn(V, V) -> V + Send + Sync + 'static,
    {
        assert!(window > 0, "window size must be positive");
        Self {
            kernel: Arc::new(kernel),
            parallelism,
            window: Some(window),
            _k: std::marker::PhantomData,
        }
    }
}

impl<K, V> Operator for ReduceByKey<K, V>
where
    K: Item + Eq + Hash,
    V: Item,
{
    fn descriptor(&self) -> Descriptor {
        Descriptor {
            kind: OperatorKind::Reduce,
            in_arity: 1,
            out_arity: 1,
            parallelism: self.parallelism,
            partitioning: true,
            windowing: self.window.is_some(),
            // A reduce over an unbounded collection only ever emits when it
            // windows.
            supported: if self.window.is_some() {
                all_structures()
            } else {
                vec![StructureType::BoundedOrdered, StructureType::BoundedUnordered]
            },
        }
    }

    fn instantiate(
        &self,
        b: &mut NetworkBuilder,
        mut inputs: Vec<Receiver>,
        structure: StructureType,
    ) -> Result<Receiver> {
        if !self.descriptor().supports(structure) {
            bail!("non-windowed reduce-by-key cannot run over {structure:?}");
        }
        let input = inputs.pop().expect("reduce needs one input");
        let n = b.config().resolve_parallelism(self.parallelism);
        let capacity = b.config().batch_capacity;
        let dispatch = KeyedDispatch::<(K, V), K, _>::new(capacity, |kv: &(K, V)| kv.0.clone());
        let workers = (0..n)
            .map(|_| {
                Box::new(ReduceWorker::<K, V> {
                    kernel: Arc::clone(&self.kernel),
                    window: self.window,
                    capacity,
                    state: HashMap::new(),
                }) as Box<dyn WorkerLogic>
            })
            .collect();
        Ok(b.farm("reduce-by-key", input, Box::new(dispatch), workers))
    }

    fn fusion_state(&self) -> Option<Arc<dyn ReduceStateFactory>> {
        if self.window.is_some() {
            // The fusion rule excludes windowed reduces; declining here keeps
            // that invariant even if a caller bypasses the rule.
            return None;
        }
        Some(Arc::new(KeyedStateFactory::<K, V> {
            kernel: Arc::clone(&self.kernel),
            _k: std::marker::PhantomData,
        }))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel;
    use crate::message::Message;
    use crate::tag::Tag;

    fn worker(window: Option<usize>) -> ReduceWorker<String, u64> {
        ReduceWorker {
            kernel: Arc::new(|a: u64, b: u64| a + b),
            window,
            capacity: 8,
            state: HashMap::new(),
        }
    }

    fn drain_pairs(rx: &channel::Receiver) -> Vec<(String, u64)> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            if let Message::Data(b) = msg {
                let b: Batch<(String, u64)> = downcast_batch(b);
                out.extend(b.into_committed());
            }
        }
        out
    }

    #[test]
    fn sync_flushes_accumulated_state() {
        let (tx, rx) = channel::link(64);
        let out = Output::new(tx);
        let mut w = worker(None);
        let tag = Tag::from_raw(7);

        let batch = Batch::from_vec(tag, vec![("a".to_string(), 1u64), ("a".to_string(), 2)]);
        w.on_batch(Box::new(batch), &out);
        assert!(drain_pairs(&rx).is_empty(), "no output before sync");

        w.on_sync(&out);
        assert_eq!(drain_pairs(&rx), vec![("a".to_string(), 3)]);

        // State was flushed; the collection end has nothing left to emit.
        w.on_collection_end(tag, &out);
        assert!(drain_pairs(&rx).is_empty());
    }

    #[test]
    fn window_emits_every_w_items_per_key() {
        let (tx, rx) = channel::link(64);
        let out = Output::new(tx);
        let mut w = worker(Some(2));
        let tag = Tag::from_raw(9);

        let items: Vec<(String, u64)> =
            (1..=5).map(|i| ("k".to_string(), i as u64)).collect();
        w.on_batch(Box::new(Batch::from_vec(tag, items)), &out);
        let early = drain_pairs(&rx);
        assert_eq!(early, vec![("k".to_string(), 3), ("k".to_string(), 7)]);

        w.on_collection_end(tag, &out);
        // The remainder window covers the leftover single item.
        assert_eq!(drain_pairs(&rx), vec![("k".to_string(), 5)]);
    }
}
