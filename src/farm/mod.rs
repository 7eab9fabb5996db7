//! Operator farms: one (emitter, workers, collector) instantiation per
//! logical operator kind.
//!
//! - [`source`] - vector source and collecting sink, so runs are expressible
//!   without external I/O adapters.
//! - [`map`] - stateless per-item operators (map, flat-map).
//! - [`reduce`] - keyed reduction with optional tumbling per-key windows.
//! - [`join`] - key-join-flat-map over two tagged sides with asymmetric
//!   caching.
//! - [`fused`] - combined farms produced by the fusion optimizer.

pub mod fused;
pub mod join;
pub mod map;
pub mod reduce;
pub mod source;

pub use join::{JoinCore, JoinItem, KeyJoinFlatMap, Side};
pub use map::{FlatMap, Map};
pub use reduce::ReduceByKey;
pub use source::{SinkHandle, SinkVec, SourceVec};
