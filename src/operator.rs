//! The operator interface consumed from the composition layer.
//!
//! The engine never builds operators itself; it reads their descriptors to
//! drive fusion and compilation, and asks each one to instantiate its farm
//! into a [`NetworkBuilder`](crate::compiler::NetworkBuilder). Static type
//! and shape checking between adjacent operators is the composition layer's
//! job and out of scope here.

use std::any::Any;
use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::channel::Receiver;
use crate::compiler::NetworkBuilder;
use crate::farm::reduce::ReduceStateFactory;

/// Closed set of operator classes. Fusion rules match on these, never on
/// data or on concrete types.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub enum OperatorKind {
    Input,
    Output,
    Map,
    FlatMap,
    Reduce,
    Join,
    Merge,
}

/// Shape of the collection an operator can run over.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum StructureType {
    BoundedOrdered,
    BoundedUnordered,
    UnboundedOrdered,
    UnboundedUnordered,
}

impl StructureType {
    #[inline]
    pub fn is_bounded(self) -> bool {
        matches!(self, Self::BoundedOrdered | Self::BoundedUnordered)
    }

    #[inline]
    pub fn is_ordered(self) -> bool {
        matches!(self, Self::BoundedOrdered | Self::UnboundedOrdered)
    }
}

/// Static description of one operator: what the fusion optimizer and the
/// graph compiler are allowed to know about it.
#[derive(Clone, Debug)]
pub struct Descriptor {
    pub kind: OperatorKind,
    pub in_arity: usize,
    pub out_arity: usize,
    /// Declared worker count; 0 defers to `EngineConfig::default_parallelism`.
    pub parallelism: usize,
    /// Routes by key (per-tag state is partitioned across workers).
    pub partitioning: bool,
    /// Batches by count/key before emitting.
    pub windowing: bool,
    pub supported: Vec<StructureType>,
}

impl Descriptor {
    pub fn supports(&self, s: StructureType) -> bool {
        self.supported.contains(&s)
    }
}

/// All four structure types; the common case for data-parallel operators.
pub fn all_structures() -> Vec<StructureType> {
    vec![
        StructureType::BoundedOrdered,
        StructureType::BoundedUnordered,
        StructureType::UnboundedOrdered,
        StructureType::UnboundedUnordered,
    ]
}

/// One logical operator, as seen by the engine.
pub trait Operator: Send + Sync {
    fn descriptor(&self) -> Descriptor;

    fn kind(&self) -> OperatorKind {
        self.descriptor().kind
    }

    fn partitioning(&self) -> bool {
        self.descriptor().partitioning
    }

    fn windowing(&self) -> bool {
        self.descriptor().windowing
    }

    fn parallelism(&self) -> usize {
        self.descriptor().parallelism
    }

    /// Build this operator's farm into the network. `inputs` has exactly
    /// `in_arity` receivers; the returned receiver is the farm's output end.
    fn instantiate(
        &self,
        b: &mut NetworkBuilder,
        inputs: Vec<Receiver>,
        structure: StructureType,
    ) -> Result<Receiver>;

    /// Fusion-aware constructor: build one combined farm for `self`
    /// immediately followed by `next`. `None` declines the fusion and the
    /// compiler falls back to standalone farms. Only called after the fusion
    /// rule matched on kinds and flags.
    fn instantiate_fused(
        &self,
        _next: &dyn Operator,
        _b: &mut NetworkBuilder,
        _inputs: Vec<Receiver>,
        _structure: StructureType,
    ) -> Option<Result<Receiver>> {
        None
    }

    /// Erased per-tag accumulator factory, if this operator is a reduce.
    /// This is the seam fused farms accumulate through.
    fn fusion_state(&self) -> Option<Arc<dyn ReduceStateFactory>> {
        None
    }

    fn as_any(&self) -> &dyn Any;
}
