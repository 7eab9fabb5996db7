//! Stateless per-item operators: map and flat-map.
//!
//! Both run the same farm shape: a round-robin emitter, N workers applying
//! the user kernel per item into freshly allocated output batches of the
//! same tag, and an ordinary collector. The kernel is held type-erased as an
//! [`ErasedTransform`] so the fused farms can run the identical code path in
//! front of a reduce accumulator.

use std::any::Any;
use std::sync::Arc;

use anyhow::Result;

use crate::batch::{Batch, BatchAny, Item, downcast_batch};
use crate::channel::Receiver;
use crate::compiler::NetworkBuilder;
use crate::farm::fused::{self, ErasedTransform};
use crate::operator::{Descriptor, Operator, OperatorKind, StructureType, all_structures};
use crate::stage::{Output, RoundRobin, WorkerLogic};

/// Applies an erased transform batch-by-batch; the whole worker for a
/// standalone map/flat-map farm.
pub(crate) struct TransformWorker {
    transform: Arc<dyn ErasedTransform>,
    capacity: usize,
}

impl TransformWorker {
    pub(crate) fn new(transform: Arc<dyn ErasedTransform>, capacity: usize) -> Self {
        Self { transform, capacity }
    }
}

impl WorkerLogic for TransformWorker {
    fn on_batch(&mut self, batch: Box<dyn BatchAny>, out: &Output) {
        for produced in self.transform.apply(batch, self.capacity) {
            out.forward(produced);
        }
    }
}

struct MapTransform<I, O> {
    kernel: Arc<dyn Fn(&I) -> O + Send + Sync>,
}

impl<I: Item, O: Item> ErasedTransform for MapTransform<I, O> {
    fn apply(&self, batch: Box<dyn BatchAny>, _capacity: usize) -> Vec<Box<dyn BatchAny>> {
        let input: Batch<I> = downcast_batch(batch);
        let tag = input.tag();
        let mut output = Batch::with_capacity(tag, input.committed());
        for item in input.iter() {
            if output.push((self.kernel)(item)).is_err() {
                unreachable!("map output sized to its input");
            }
        }
        vec![Box::new(output)]
    }
}

struct FlatMapTransform<I, O> {
    kernel: Arc<dyn Fn(&I) -> Vec<O> + Send + Sync>,
}

impl<I: Item, O: Item> ErasedTransform for FlatMapTransform<I, O> {
    fn apply(&self, batch: Box<dyn BatchAny>, capacity: usize) -> Vec<Box<dyn BatchAny>> {
        let input: Batch<I> = downcast_batch(batch);
        let tag = input.tag();
        let mut produced: Vec<Box<dyn BatchAny>> = Vec::new();
        let mut current = Batch::with_capacity(tag, capacity);
        for item in input.iter() {
            for o in (self.kernel)(item) {
                if current.is_full() {
                    produced.push(Box::new(std::mem::replace(
                        &mut current,
                        Batch::with_capacity(tag, capacity),
                    )));
                }
                if current.push(o).is_err() {
                    unreachable!("flat-map batch just rotated");
                }
            }
        }
        if !current.is_empty() {
            produced.push(Box::new(current));
        }
        produced
    }
}

/* ===================== Map ===================== */

/// One output item per input item.
pub struct Map<I, O> {
    transform: Arc<dyn ErasedTransform>,
    parallelism: usize,
    _t: std::marker::PhantomData<fn(I) -> O>,
}

impl<I: Item, O: Item> Map<I, O> {
    /// `parallelism` 0 defers to the engine default.
    pub fn new<F>(parallelism: usize, kernel: F) -> Self
    where
        F: Fn(&I) -> O + Send + Sync + 'static,
    {
        Self {
            transform: Arc::new(MapTransform { kernel: Arc::new(kernel) }),
            parallelism,
            _t: std::marker::PhantomData,
        }
    }
}

/* ===================== FlatMap ===================== */

/// Zero or more output items per input item.
pub struct FlatMap<I, O> {
    transform: Arc<dyn ErasedTransform>,
    parallelism: usize,
    _t: std::marker::PhantomData<fn(I) -> O>,
}

impl<I: Item, O: Item> FlatMap<I, O> {
    pub fn new<F>(parallelism: usize, kernel: F) -> Self
    where
        F: Fn(&I) -> Vec<O> + Send + Sync + 'static,
    {
        Self {
            transform: Arc::new(FlatMapTransform { kernel: Arc::new(kernel) }),
            parallelism,
            _t: std::marker::PhantomData,
        }
    }
}

fn unary_descriptor(kind: OperatorKind, parallelism: usize) -> Descriptor {
    Descriptor {
        kind,
        in_arity: 1,
        out_arity: 1,
        parallelism,
        partitioning: false,
        windowing: false,
        supported: all_structures(),
    }
}

fn instantiate_transform_farm(
    name: &'static str,
    transform: &Arc<dyn ErasedTransform>,
    parallelism: usize,
    b: &mut NetworkBuilder,
    mut inputs: Vec<Receiver>,
) -> Result<Receiver> {
    let input = inputs.pop().expect("unary operator needs one input");
    let n = b.config().resolve_parallelism(parallelism);
    let capacity = b.config().batch_capacity;
    let workers = (0..n)
        .map(|_| {
            Box::new(TransformWorker::new(Arc::clone(transform), capacity)) as Box<dyn WorkerLogic>
        })
        .collect();
    Ok(b.farm(name, input, Box::new(RoundRobin::default()), workers))
}

macro_rules! impl_unary_operator {
    ($ty:ident, $kind:expr, $name:literal) => {
        impl<I: Item, O: Item> Operator for $ty<I, O> {
            fn descriptor(&self) -> Descriptor {
                unary_descriptor($kind, self.parallelism)
            }

            fn instantiate(
                &self,
                b: &mut NetworkBuilder,
                inputs: Vec<Receiver>,
                _structure: StructureType,
            ) -> Result<Receiver> {
                instantiate_transform_farm($name, &self.transform, self.parallelism, b, inputs)
            }

            fn instantiate_fused(
                &self,
                next: &dyn Operator,
                b: &mut NetworkBuilder,
                mut inputs: Vec<Receiver>,
                _structure: StructureType,
            ) -> Option<Result<Receiver>> {
                let factory = next.fusion_state()?;
                let input = inputs.pop().expect("unary operator needs one input");
                let mappers = b.config().resolve_parallelism(self.parallelism);
                let reducers = b.config().resolve_parallelism(next.parallelism());
                Some(Ok(fused::build_unary_reduce(
                    b,
                    input,
                    Arc::clone(&self.transform),
                    factory,
                    mappers,
                    reducers,
                )))
            }

            fn as_any(&self) -> &dyn Any {
                self
            }
        }
    };
}

impl_unary_operator!(Map, OperatorKind::Map, "map");
impl_unary_operator!(FlatMap, OperatorKind::FlatMap, "flat-map");
