//! In-memory source and sink operators.
//!
//! File and socket adapters live outside the engine; these two cover what
//! the engine itself needs: a source that activates on `GlobalBegin`,
//! minting a fresh tag and emitting one bounded collection, and a sink that
//! materializes whatever reaches the end of the network.

use std::any::Any;
use std::sync::{Arc, Mutex};

use anyhow::{Result, bail};

use crate::batch::{Batch, Item, downcast_batch};
use crate::channel::{self, Receiver};
use crate::compiler::NetworkBuilder;
use crate::message::{Control, Message};
use crate::operator::{Descriptor, Operator, OperatorKind, StructureType, all_structures};
use crate::stage::{Output, RoundRobin, StageHandle, WorkerLogic};

/* ===================== SourceVec ===================== */

/// Emits a fixed vector as one collection per run.
pub struct SourceVec<T> {
    data: Vec<T>,
}

impl<T: Item> SourceVec<T> {
    pub fn new(data: Vec<T>) -> Self {
        Self { data }
    }
}

impl<T: Item> Operator for SourceVec<T> {
    fn descriptor(&self) -> Descriptor {
        Descriptor {
            kind: OperatorKind::Input,
            in_arity: 0,
            out_arity: 1,
            parallelism: 1,
            partitioning: false,
            windowing: false,
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
            bail!("source-vec does not support {structure:?}");
        }
        // The sole "input" is the executor's control channel.
        let rx = inputs.pop().expect("source needs the control input");
        let (tx, out) = b.link();
        let data = self.data.clone();
        let tags = b.tags();
        let capacity = b.config().batch_capacity;
        let name = b.stage_name("source-vec");
        b.add(StageHandle::spawn(name, move || {
            for msg in rx {
                match msg {
                    Message::Control(Control::GlobalBegin) => {
                        channel::send(&tx, Control::GlobalBegin.into());
                        let tag = tags.fresh();
                        channel::send(&tx, Control::CollectionBegin(tag).into());
                        for chunk in data.chunks(capacity) {
                            let batch = Batch::from_vec(tag, chunk.to_vec());
                            channel::send(&tx, Message::data(batch));
                        }
                        channel::send(&tx, Control::CollectionEnd(tag).into());
                    }
                    Message::Control(Control::GlobalEnd) => {
                        channel::send(&tx, Control::GlobalEnd.into());
                        break;
                    }
                    Message::Control(c) => channel::send(&tx, c.into()),
                    Message::Data(_) => panic!("source-vec received upstream data"),
                }
            }
        }));
        Ok(out)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/* ===================== SinkVec ===================== */

/// Shared handle to a sink's materialized output.
pub struct SinkHandle<T> {
    inner: Arc<Mutex<Vec<T>>>,
}

impl<T> Clone for SinkHandle<T> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<T> SinkHandle<T> {
    /// Take everything collected so far.
    pub fn take(&self) -> Vec<T> {
        std::mem::take(&mut *self.inner.lock().unwrap())
    }
}

/// Gathers every item reaching it, across all tags, into one vector.
pub struct SinkVec<T> {
    inner: Arc<Mutex<Vec<T>>>,
}

impl<T: Item> SinkVec<T> {
    pub fn new() -> Self {
        Self { inner: Arc::new(Mutex::new(Vec::new())) }
    }

    pub fn handle(&self) -> SinkHandle<T> {
        SinkHandle { inner: Arc::clone(&self.inner) }
    }
}

impl<T: Item> Default for SinkVec<T> {
    fn default() -> Self {
        Self::new()
    }
}

struct SinkWorker<T> {
    inner: Arc<Mutex<Vec<T>>>,
}

impl<T: Item> WorkerLogic for SinkWorker<T> {
    fn on_batch(&mut self, batch: Box<dyn crate::batch::BatchAny>, _out: &Output) {
        let batch: Batch<T> = downcast_batch(batch);
        self.inner.lock().unwrap().extend(batch.into_committed());
    }
}

impl<T: Item> Operator for SinkVec<T> {
    fn descriptor(&self) -> Descriptor {
        Descriptor {
            kind: OperatorKind::Output,
            in_arity: 1,
            out_arity: 1,
            parallelism: 1,
            partitioning: false,
            windowing: false,
            supported: all_structures(),
        }
    }

    fn instantiate(
        &self,
        b: &mut NetworkBuilder,
        mut inputs: Vec<Receiver>,
        _structure: StructureType,
    ) -> Result<Receiver> {
        let input = inputs.pop().expect("sink needs one input");
        let worker: Box<dyn WorkerLogic> = Box::new(SinkWorker { inner: Arc::clone(&self.inner) });
        Ok(b.farm("sink-vec", input, Box::new(RoundRobin::default()), vec![worker]))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
