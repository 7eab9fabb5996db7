//! Running a term tree.
//!
//! The executor compiles the term into a network, brackets the run with
//! `GlobalBegin`/`GlobalEnd` on the network's input end, drains the output
//! end until `GlobalEnd` comes back, then joins every stage thread. A stage
//! panic surfaces here, at the join.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use log::info;

use crate::channel;
use crate::compiler;
use crate::config::EngineConfig;
use crate::message::Control;
use crate::operator::StructureType;
use crate::tag::{AtomicTagGenerator, SharedTagGenerator};
use crate::term::Term;

pub struct Executor {
    config: EngineConfig,
    tags: SharedTagGenerator,
    elapsed: Option<Duration>,
}

impl Executor {
    pub fn new(config: EngineConfig) -> Self {
        Self::with_tag_generator(config, Arc::new(AtomicTagGenerator::new()))
    }

    /// An executor minting tags from the given generator. Tests inject a
    /// generator here to pin down the tag sequence of a run.
    pub fn with_tag_generator(config: EngineConfig, tags: SharedTagGenerator) -> Self {
        Self { config, tags, elapsed: None }
    }

    /// Run the term over bounded, unordered collections. Blocks until the
    /// network has drained and every stage thread has exited.
    pub fn run(&mut self, term: &Term) -> Result<()> {
        self.run_over(term, StructureType::BoundedUnordered)
    }

    /// Run the term over an explicit structure type.
    pub fn run_over(&mut self, term: &Term, structure: StructureType) -> Result<()> {
        let network = compiler::compile(term, &self.config, Arc::clone(&self.tags), structure)?;
        info!("run starting ({structure:?})");
        let start = Instant::now();
        channel::send(network.input(), Control::GlobalBegin.into());
        channel::send(network.input(), Control::GlobalEnd.into());
        for msg in network.output().iter() {
            if msg.is_global_end() {
                break;
            }
        }
        network.join();
        let elapsed = start.elapsed();
        self.elapsed = Some(elapsed);
        info!("run finished in {elapsed:?}");
        Ok(())
    }

    /// Wall-clock duration of the most recent completed run.
    pub fn elapsed_time(&self) -> Option<Duration> {
        self.elapsed
    }
}

impl Default for Executor {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}
