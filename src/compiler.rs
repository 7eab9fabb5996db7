//! Term tree to stage network translation.
//!
//! The compiler walks the [`Term`] recursively, handing each operator a
//! [`NetworkBuilder`] to instantiate its farm into. Adjacent children of a
//! `Sequence` (and a `Pair` followed by a reduce) are checked against the
//! fusion rule first; when the rule matches and the left operator accepts,
//! one combined farm is built instead of two.
//!
//! The network's input end is the executor's control channel; sources treat
//! it as their activation input, everything else sees it as its upstream.

use std::sync::Arc;

use anyhow::{Result, ensure};
use log::debug;

use crate::channel::{self, Receiver, Sender};
use crate::config::EngineConfig;
use crate::fusion;
use crate::iteration;
use crate::message::{Control, Message};
use crate::operator::{Operator, StructureType};
use crate::stage::{Dispatch, StageHandle, WorkerLogic, spawn_collector, spawn_emitter, spawn_worker};
use crate::tag::SharedTagGenerator;
use crate::term::Term;

/* ===================== Builder ===================== */

/// Accumulates the stages and channels of one network under construction.
pub struct NetworkBuilder {
    config: EngineConfig,
    tags: SharedTagGenerator,
    stages: Vec<StageHandle>,
    names: usize,
}

impl NetworkBuilder {
    pub(crate) fn new(config: EngineConfig, tags: SharedTagGenerator) -> Self {
        Self { config, tags, stages: Vec::new(), names: 0 }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Clone of the run's shared tag generator.
    pub fn tags(&self) -> SharedTagGenerator {
        Arc::clone(&self.tags)
    }

    /// A bounded link at the configured channel capacity.
    pub fn link(&self) -> (Sender, Receiver) {
        channel::link(self.config.channel_capacity)
    }

    pub fn add(&mut self, stage: StageHandle) {
        self.stages.push(stage);
    }

    /// A network-unique thread name for one stage.
    pub fn stage_name(&mut self, base: &str) -> String {
        self.names += 1;
        format!("{base}#{}", self.names)
    }

    /// Build a standard farm: emitter with the given dispatch, one worker
    /// per logic, collector counting every worker per tag.
    pub fn farm(
        &mut self,
        name: &str,
        input: Receiver,
        dispatch: Box<dyn Dispatch>,
        workers: Vec<Box<dyn WorkerLogic>>,
    ) -> Receiver {
        let n = workers.len();
        assert!(n > 0, "a farm needs at least one worker");
        let mut txs = Vec::with_capacity(n);
        let mut rxs = Vec::with_capacity(n);
        for _ in 0..n {
            let (tx, rx) = self.link();
            txs.push(tx);
            rxs.push(rx);
        }
        let emitter_name = self.stage_name(&format!("{name}-emitter"));
        self.add(spawn_emitter(emitter_name, input, txs, dispatch));
        let (c_tx, c_rx) = self.link();
        for (i, (rx, logic)) in rxs.into_iter().zip(workers).enumerate() {
            let worker_name = self.stage_name(&format!("{name}-worker-{i}"));
            self.add(spawn_worker(worker_name, rx, c_tx.clone(), logic));
        }
        drop(c_tx);
        let (out_tx, out_rx) = self.link();
        let collector_name = self.stage_name(&format!("{name}-collector"));
        self.add(spawn_collector(collector_name, c_rx, out_tx, n, n));
        out_rx
    }
}

/// A fully wired network, ready to be driven by the executor.
pub struct Network {
    input: Sender,
    output: Receiver,
    stages: Vec<StageHandle>,
}

impl Network {
    pub fn input(&self) -> &Sender {
        &self.input
    }

    pub fn output(&self) -> &Receiver {
        &self.output
    }

    /// Join every stage thread; panics if any stage panicked.
    pub fn join(self) {
        drop(self.input);
        drop(self.output);
        for stage in self.stages {
            stage.join();
        }
    }
}

/* ===================== Compilation ===================== */

pub fn compile(
    term: &Term,
    config: &EngineConfig,
    tags: SharedTagGenerator,
    structure: StructureType,
) -> Result<Network> {
    let mut b = NetworkBuilder::new(config.clone(), tags);
    let (input, rx) = b.link();
    let output = compile_term(&mut b, term, rx, structure)?;
    debug!("compiled network: {} stages", b.stages.len());
    Ok(Network { input, output, stages: b.stages })
}

fn term_operator(term: &Term) -> Option<&Arc<dyn Operator>> {
    match term {
        Term::Operator(op) => Some(op),
        _ => None,
    }
}

fn compile_term(
    b: &mut NetworkBuilder,
    term: &Term,
    input: Receiver,
    structure: StructureType,
) -> Result<Receiver> {
    match term {
        Term::Empty => Ok(input),
        Term::Operator(op) => op.instantiate(b, vec![input], structure),
        Term::Sequence(children) => compile_sequence(b, children, input, structure),
        Term::Merge(children) => compile_merge(b, children, input, structure),
        Term::Pair(left, right, op) => {
            let (lo, ro) = compile_pair_branches(b, left, right, input, structure)?;
            op.instantiate(b, vec![lo, ro], structure)
        }
        Term::Iterate(child, policy) => {
            let (gate_tx, gate_rx) = b.link();
            let (fb_tx, fb_rx) = channel::feedback_link();
            let gate_name = b.stage_name("loop-gate");
            b.add(iteration::spawn_loop_gate(gate_name, input, fb_rx, gate_tx));
            let body = compile_term(b, child, gate_rx, structure)?;
            let (out_tx, out_rx) = b.link();
            let dispatcher_name = b.stage_name("loop-dispatcher");
            let dispatcher = iteration::spawn_loop_dispatcher(
                dispatcher_name,
                body,
                out_tx,
                fb_tx,
                Arc::clone(policy),
                b.tags(),
                b.config().max_inflight_iterations,
            );
            b.add(dispatcher);
            Ok(out_rx)
        }
    }
}

fn compile_sequence(
    b: &mut NetworkBuilder,
    children: &[Term],
    input: Receiver,
    structure: StructureType,
) -> Result<Receiver> {
    let mut cur = input;
    let mut i = 0;
    while i < children.len() {
        if let Some(next) = children.get(i + 1).and_then(term_operator)
            && let Some(out) = try_fuse(b, &children[i], next.as_ref(), cur.clone(), structure)?
        {
            cur = out;
            i += 2;
            continue;
        }
        cur = compile_term(b, &children[i], cur, structure)?;
        i += 1;
    }
    Ok(cur)
}

/// Attempt to compile `left` and `next` as one fused farm. `Ok(None)` means
/// no fusion applies and the caller compiles them separately.
fn try_fuse(
    b: &mut NetworkBuilder,
    left: &Term,
    next: &dyn Operator,
    input: Receiver,
    structure: StructureType,
) -> Result<Option<Receiver>> {
    match left {
        Term::Operator(op) if fusion::fuses(&op.descriptor(), &next.descriptor()) => {
            match op.instantiate_fused(next, b, vec![input], structure) {
                Some(out) => {
                    debug!("fused {:?} into {:?}", op.kind(), next.kind());
                    out.map(Some)
                }
                None => Ok(None),
            }
        }
        Term::Pair(l, r, binop) if fusion::fuses(&binop.descriptor(), &next.descriptor()) => {
            // The branches exist either way; only the tail differs between
            // the fused farm and the standalone join + reduce pair.
            let (lo, ro) = compile_pair_branches(b, l, r, input, structure)?;
            match binop.instantiate_fused(next, b, vec![lo.clone(), ro.clone()], structure) {
                Some(out) => {
                    debug!("fused {:?} into {:?} across a pair", binop.kind(), next.kind());
                    out.map(Some)
                }
                None => {
                    let joined = binop.instantiate(b, vec![lo, ro], structure)?;
                    Ok(Some(next.instantiate(b, vec![joined], structure)?))
                }
            }
        }
        _ => Ok(None),
    }
}

fn compile_merge(
    b: &mut NetworkBuilder,
    children: &[Term],
    input: Receiver,
    structure: StructureType,
) -> Result<Receiver> {
    ensure!(!children.is_empty(), "merge needs at least one branch");
    let n = children.len();
    let mut txs = Vec::with_capacity(n);
    let mut rxs = Vec::with_capacity(n);
    for _ in 0..n {
        let (tx, rx) = b.link();
        txs.push(tx);
        rxs.push(rx);
    }
    let pass_through = children.iter().position(|c| matches!(c, Term::Empty));
    let splitter_name = b.stage_name("merge-splitter");
    b.add(spawn_splitter(splitter_name, input, txs, pass_through));

    let (c_tx, c_rx) = b.link();
    for (i, (child, rx)) in children.iter().zip(rxs).enumerate() {
        let out = compile_term(b, child, rx, structure)?;
        let relay_name = b.stage_name(&format!("merge-relay-{i}"));
        b.add(spawn_relay(relay_name, out, c_tx.clone()));
    }
    drop(c_tx);

    // Tags are minted per branch, so exactly one branch closes each tag.
    let (out_tx, out_rx) = b.link();
    let collector_name = b.stage_name("merge-collector");
    b.add(spawn_collector(collector_name, c_rx, out_tx, n, 1));
    Ok(out_rx)
}

fn compile_pair_branches(
    b: &mut NetworkBuilder,
    left: &Term,
    right: &Term,
    input: Receiver,
    structure: StructureType,
) -> Result<(Receiver, Receiver)> {
    let (l_tx, l_rx) = b.link();
    let (r_tx, r_rx) = b.link();
    let pass_through = if matches!(left, Term::Empty) {
        Some(0)
    } else if matches!(right, Term::Empty) {
        Some(1)
    } else {
        None
    };
    let splitter_name = b.stage_name("pair-splitter");
    b.add(spawn_splitter(splitter_name, input, vec![l_tx, r_tx], pass_through));
    let lo = compile_term(b, left, l_rx, structure)?;
    let ro = compile_term(b, right, r_rx, structure)?;
    Ok((lo, ro))
}

/// Head of a `Merge`/`Pair`: global brackets go to every branch, everything
/// collection-scoped passes through to the one `Empty` branch.
fn spawn_splitter(
    name: impl Into<String>,
    rx: Receiver,
    outs: Vec<Sender>,
    pass_through: Option<usize>,
) -> StageHandle {
    StageHandle::spawn(name, move || {
        for msg in rx {
            match msg {
                Message::Control(c @ (Control::GlobalBegin | Control::Sync)) => {
                    for tx in &outs {
                        channel::send(tx, Message::Control(c));
                    }
                }
                Message::Control(Control::GlobalEnd) => {
                    for tx in &outs {
                        channel::send(tx, Control::GlobalEnd.into());
                    }
                    break;
                }
                scoped => match pass_through {
                    Some(i) => channel::send(&outs[i], scoped),
                    None => panic!("splitter: upstream traffic with no pass-through branch"),
                },
            }
        }
    })
}

/// Funnels one branch's output into a shared collector channel.
fn spawn_relay(name: impl Into<String>, rx: Receiver, tx: Sender) -> StageHandle {
    StageHandle::spawn(name, move || {
        for msg in rx {
            let last = msg.is_global_end();
            channel::send(&tx, msg);
            if last {
                break;
            }
        }
    })
}
