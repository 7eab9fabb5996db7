//! # Tagflow
//!
//! A **data-parallel dataflow execution engine**: logical operators (map,
//! flat-map, reduce-by-key, key-join-flat-map, iteration) composed into a
//! term tree are compiled into a network of concurrent stages connected by
//! bounded channels and executed over bounded or unbounded collections.
//!
//! ## Key ideas
//!
//! - **Tagged batches** - all data moves in fixed-capacity [`Batch`]es, each
//!   carrying the [`Tag`] of the logical collection it belongs to
//! - **Explicit control envelope** - `GlobalBegin`/`GlobalEnd`,
//!   `CollectionBegin(tag)`/`CollectionEnd(tag)` and `Sync` travel the same
//!   channels as data, as ordinary [`Message`] variants
//! - **Operator farms** - every operator compiles to an emitter, a ring of
//!   workers, and a collector; per-tag state is partitioned by key routing,
//!   never shared
//! - **Fusion** - a map/flat-map/join feeding a keyed, non-windowed reduce
//!   collapses into one farm that accumulates in the producing ring and
//!   shuffles partial state to a reducer ring
//! - **Iteration** - feedback loops run each pass as its own tagged
//!   collection, with a bounded number of passes in flight
//!
//! ## Quick start
//!
//! ```no_run
//! use tagflow::{EngineConfig, Executor, FlatMap, ReduceByKey, SinkVec, SourceVec, Term};
//!
//! # fn main() -> anyhow::Result<()> {
//! let sink = SinkVec::<(String, u64)>::new();
//! let results = sink.handle();
//!
//! let term = Term::seq(vec![
//!     Term::op(SourceVec::new(vec!["a b a".to_string(), "a a b".to_string()])),
//!     Term::op(FlatMap::new(0, |line: &String| {
//!         line.split_whitespace()
//!             .map(|w| (w.to_string(), 1u64))
//!             .collect::<Vec<_>>()
//!     })),
//!     Term::op(ReduceByKey::<String, u64>::new(0, |a, b| a + b)),
//!     Term::op(sink),
//! ]);
//!
//! Executor::new(EngineConfig::default()).run(&term)?;
//! let counts = results.take(); // {a: 4, b: 2} in some order
//! # let _ = counts;
//! # Ok(())
//! # }
//! ```

pub mod batch;
pub mod channel;
pub mod compiler;
pub mod config;
pub mod executor;
pub mod farm;
pub mod fusion;
pub mod iteration;
pub mod message;
pub mod operator;
pub mod stage;
pub mod tag;
pub mod term;
pub mod testing;

pub use batch::{Batch, BatchAny, Item, downcast_batch};
pub use compiler::{Network, NetworkBuilder, compile};
pub use config::EngineConfig;
pub use executor::Executor;
pub use farm::{FlatMap, JoinItem, KeyJoinFlatMap, Map, ReduceByKey, SinkHandle, SinkVec, SourceVec};
pub use iteration::{FixedIterations, IterationCtl, TerminationPolicy};
pub use message::{Control, Message};
pub use operator::{Descriptor, Operator, OperatorKind, StructureType};
pub use tag::{AtomicTagGenerator, SharedTagGenerator, Tag, TagGenerator};
pub use term::Term;
