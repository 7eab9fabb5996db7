//! Feedback loops: the gate in front of the body and the dispatcher behind
//! it.
//!
//! An `Iterate` term compiles to `gate -> body -> dispatcher`, with an
//! unbounded feedback edge from the dispatcher back to the gate (bounded
//! would deadlock the cycle). Each pass of a round is its own tagged
//! collection: the dispatcher asks the [`TerminationPolicy`] for a chain of
//! fresh tags, re-tags the body's output from one pass into the next, and
//! sends it backward bracketed by that tag's `CollectionBegin`/`End`. Output
//! of the final pass is re-tagged to the round's root tag and forwarded, so
//! downstream sees one ordinary collection per round.
//!
//! At most [`EngineConfig::max_inflight_iterations`] passes are open in the
//! body at once; the root pass counts. A `Sync` token sent backward when a
//! round finishes tells the gate the cycle is drained, which is what lets
//! the gate hold `GlobalEnd` until no round is in flight.
//!
//! [`EngineConfig::max_inflight_iterations`]: crate::config::EngineConfig::max_inflight_iterations
//!
//! All decisions live in [`LoopDispatcher`], a pure event-to-actions machine
//! with no channels, so pass interleavings are testable single-threaded.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crossbeam_channel::select;
use log::debug;

use crate::batch::BatchAny;
use crate::channel::{self, Receiver, Sender};
use crate::message::{Control, Message};
use crate::stage::StageHandle;
use crate::tag::{SharedTagGenerator, Tag};

/* ===================== Termination policies ===================== */

/// The dispatcher's pen for minting a round's pass chain.
pub struct IterationCtl<'a> {
    tags: &'a SharedTagGenerator,
    chain: &'a mut Vec<Tag>,
    closed: &'a mut bool,
}

impl IterationCtl<'_> {
    /// Append one more feedback pass to the round.
    pub fn mint(&mut self) -> Tag {
        assert!(!*self.closed, "iteration: mint after close");
        let t = self.tags.fresh();
        self.chain.push(t);
        t
    }

    /// No further passes: output of the last minted pass (or of the root
    /// pass, if nothing was minted) leaves the loop.
    pub fn close(&mut self) {
        *self.closed = true;
    }

    /// Feedback passes minted so far this round.
    pub fn minted(&self) -> usize {
        self.chain.len()
    }
}

/// Decides how many passes a round runs.
///
/// A policy that knows the count up front mints everything in
/// `on_round_start` and closes; a data-driven policy leaves the chain open
/// and extends or closes it from `on_pass_complete`.
pub trait TerminationPolicy: Send + Sync {
    fn on_round_start(&self, ctl: &mut IterationCtl<'_>);

    /// Called after each pass's collection ends; `pass` counts from 1 (the
    /// root pass). The policy must have minted a successor or closed the
    /// chain by the time this returns.
    fn on_pass_complete(&self, _ctl: &mut IterationCtl<'_>, _pass: usize) {}
}

/// Run a fixed number of feedback iterations.
pub struct FixedIterations {
    times: usize,
}

impl FixedIterations {
    /// Each round mints `times` fresh iteration tags, and the last one's
    /// output leaves the loop under the round's root tag. The body also
    /// applies once as data first enters the loop, so `times` of zero is a
    /// single pass with no feedback.
    pub fn new(times: usize) -> Self {
        Self { times }
    }
}

impl TerminationPolicy for FixedIterations {
    fn on_round_start(&self, ctl: &mut IterationCtl<'_>) {
        for _ in 0..self.times {
            ctl.mint();
        }
        ctl.close();
    }
}

/* ===================== Dispatcher machine ===================== */

/// What the dispatcher thread should do with one emitted action.
pub(crate) enum Action {
    /// Downstream, out of the loop.
    Forward(Message),
    /// Backward along the feedback edge, into the gate.
    Backward(Message),
}

enum Succ {
    To(Tag),
    Out,
    Unknown,
}

struct Round {
    root: Tag,
    chain: Vec<Tag>,
    closed: bool,
    scheduled: HashSet<Tag>,
    /// Next chain index to schedule.
    ready_idx: usize,
    /// Passes open in the body right now (root pass included).
    inflight: usize,
    /// Passes whose collection has ended.
    ended: usize,
    /// Body output buffered because its destination pass is not scheduled
    /// yet, keyed by the tag it was produced under.
    buffered: HashMap<Tag, Vec<Box<dyn BatchAny>>>,
    /// Passes whose full input has arrived and still owe a backward `End`.
    end_pending: HashSet<Tag>,
}

/// Event-to-actions core of the loop dispatcher. One instance per loop; a
/// round opens when a source collection's `CollectionBegin` arrives and
/// closes when its last pass ends. Rounds from interleaved source
/// collections run independently, each with its own in-flight cap.
pub(crate) struct LoopDispatcher {
    policy: Arc<dyn TerminationPolicy>,
    tags: SharedTagGenerator,
    max_inflight: usize,
    /// Open rounds, by root tag.
    rounds: HashMap<Tag, Round>,
    /// Every tag belonging to an open round, mapped to its root.
    index: HashMap<Tag, Tag>,
}

impl LoopDispatcher {
    pub(crate) fn new(
        policy: Arc<dyn TerminationPolicy>,
        tags: SharedTagGenerator,
        max_inflight: usize,
    ) -> Self {
        assert!(max_inflight >= 1);
        Self { policy, tags, max_inflight, rounds: HashMap::new(), index: HashMap::new() }
    }

    pub(crate) fn handle(&mut self, msg: Message) -> Vec<Action> {
        match msg {
            Message::Control(Control::CollectionBegin(t)) => self.on_begin(t),
            Message::Data(b) => self.on_data(b),
            Message::Control(Control::CollectionEnd(t)) => self.on_end(t),
            Message::Control(Control::GlobalBegin) => {
                vec![Action::Forward(Control::GlobalBegin.into())]
            }
            Message::Control(Control::GlobalEnd) => {
                assert!(self.rounds.is_empty(), "iteration: GlobalEnd with a round in flight");
                vec![Action::Forward(Control::GlobalEnd.into())]
            }
            Message::Control(Control::Sync) => {
                panic!("iteration: Sync arrived through the loop body")
            }
        }
    }

    fn root_of(&self, t: Tag) -> Tag {
        *self
            .index
            .get(&t)
            .unwrap_or_else(|| panic!("iteration: {t:?} does not belong to an open round"))
    }

    fn succ(round: &Round, t: Tag) -> Succ {
        let idx = if t == round.root {
            0
        } else {
            match round.chain.iter().position(|c| *c == t) {
                Some(i) => i + 1,
                None => panic!("iteration: {t:?} is not part of the current round"),
            }
        };
        match round.chain.get(idx) {
            Some(next) => Succ::To(*next),
            None if round.closed => Succ::Out,
            None => Succ::Unknown,
        }
    }

    /// Predecessor pass of a chain tag (where its input comes from).
    fn pred(round: &Round, s: Tag) -> Tag {
        match round.chain.iter().position(|c| *c == s) {
            Some(0) => round.root,
            Some(i) => round.chain[i - 1],
            None => panic!("iteration: {s:?} is not a chain tag"),
        }
    }

    fn on_begin(&mut self, t: Tag) -> Vec<Action> {
        if let Some(root) = self.index.get(&t) {
            // The gate feeds scheduled passes back through the body, so
            // their begins echo here once each.
            let r = &self.rounds[root];
            assert!(r.scheduled.contains(&t), "iteration: {t:?} began twice");
            return Vec::new();
        }
        let mut chain = Vec::new();
        let mut closed = false;
        self.policy.on_round_start(&mut IterationCtl {
            tags: &self.tags,
            chain: &mut chain,
            closed: &mut closed,
        });
        debug!("iteration round {t:?}: {} feedback passes minted", chain.len());
        self.index.insert(t, t);
        for c in &chain {
            self.index.insert(*c, t);
        }
        self.rounds.insert(
            t,
            Round {
                root: t,
                chain,
                closed,
                scheduled: HashSet::new(),
                ready_idx: 0,
                inflight: 1,
                ended: 0,
                buffered: HashMap::new(),
                end_pending: HashSet::new(),
            },
        );
        let mut actions = vec![Action::Forward(Control::CollectionBegin(t).into())];
        self.schedule(t, &mut actions);
        actions
    }

    fn on_data(&mut self, mut b: Box<dyn BatchAny>) -> Vec<Action> {
        let t = b.tag();
        let root = self.root_of(t);
        let r = self.rounds.get_mut(&root).expect("round indexed but missing");
        match Self::succ(r, t) {
            Succ::Out => {
                b.retag(r.root);
                vec![Action::Forward(Message::Data(b))]
            }
            Succ::To(s) if r.scheduled.contains(&s) => {
                b.retag(s);
                vec![Action::Backward(Message::Data(b))]
            }
            Succ::To(_) | Succ::Unknown => {
                r.buffered.entry(t).or_default().push(b);
                Vec::new()
            }
        }
    }

    fn on_end(&mut self, t: Tag) -> Vec<Action> {
        let root = self.root_of(t);
        let r = self.rounds.get_mut(&root).expect("round indexed but missing");
        assert!(
            t == r.root || r.scheduled.contains(&t),
            "iteration: CollectionEnd for unscheduled {t:?}"
        );
        r.inflight -= 1;
        r.ended += 1;
        let pass = r.ended;
        let before = r.chain.len();
        self.policy.on_pass_complete(
            &mut IterationCtl {
                tags: &self.tags,
                chain: &mut r.chain,
                closed: &mut r.closed,
            },
            pass,
        );
        let minted: Vec<Tag> = r.chain[before..].to_vec();
        for c in minted {
            self.index.insert(c, root);
        }
        let r = self.rounds.get_mut(&root).expect("round indexed but missing");
        let mut actions = Vec::new();
        match Self::succ(r, t) {
            Succ::Unknown => {
                panic!("iteration: policy neither minted a pass nor closed after pass {pass}")
            }
            Succ::Out => {
                assert!(r.inflight == 0 && r.buffered.is_empty(), "iteration: round ended early");
                let r = self.rounds.remove(&root).expect("round indexed but missing");
                self.index.remove(&root);
                for c in &r.chain {
                    self.index.remove(c);
                }
                debug!("iteration round {root:?} finished after {pass} passes");
                actions.push(Action::Forward(Control::CollectionEnd(root).into()));
                actions.push(Action::Backward(Control::Sync.into()));
            }
            Succ::To(s) => {
                if r.scheduled.contains(&s) {
                    actions.push(Action::Backward(Control::CollectionEnd(s).into()));
                } else {
                    r.end_pending.insert(s);
                }
                self.schedule(root, &mut actions);
            }
        }
        actions
    }

    /// Open more of a round's passes until its in-flight cap or its chain
    /// runs out.
    fn schedule(&mut self, root: Tag, actions: &mut Vec<Action>) {
        let r = self.rounds.get_mut(&root).expect("scheduling an unopened round");
        while r.inflight < self.max_inflight && r.ready_idx < r.chain.len() {
            let s = r.chain[r.ready_idx];
            r.ready_idx += 1;
            r.inflight += 1;
            r.scheduled.insert(s);
            actions.push(Action::Backward(Control::CollectionBegin(s).into()));
            let p = Self::pred(r, s);
            if let Some(buffered) = r.buffered.remove(&p) {
                for mut b in buffered {
                    b.retag(s);
                    actions.push(Action::Backward(Message::Data(b)));
                }
            }
            if r.end_pending.remove(&s) {
                actions.push(Action::Backward(Control::CollectionEnd(s).into()));
            }
        }
    }
}

/* ===================== Stage loops ===================== */

/// The gate in front of a loop body: merges upstream traffic with the
/// feedback edge and holds `GlobalEnd` until every open round has drained.
pub(crate) fn spawn_loop_gate(
    name: impl Into<String>,
    upstream: Receiver,
    feedback: Receiver,
    tx: Sender,
) -> StageHandle {
    StageHandle::spawn(name, move || {
        let mut rounds_open = 0usize;
        let mut end_pending = false;
        let mut upstream_open = true;
        loop {
            let (from_feedback, msg) = if upstream_open {
                select! {
                    recv(upstream) -> m => match m {
                        Ok(m) => (false, m),
                        Err(_) => { upstream_open = false; continue; }
                    },
                    recv(feedback) -> m => (true, m.expect("feedback edge hung up")),
                }
            } else {
                (true, feedback.recv().expect("feedback edge hung up"))
            };
            match msg {
                Message::Control(Control::Sync) => {
                    assert!(from_feedback, "loop gate: Sync from upstream");
                    rounds_open -= 1;
                    if end_pending && rounds_open == 0 {
                        channel::send(&tx, Control::GlobalEnd.into());
                        break;
                    }
                }
                Message::Control(Control::GlobalEnd) => {
                    if rounds_open == 0 {
                        channel::send(&tx, Control::GlobalEnd.into());
                        break;
                    }
                    end_pending = true;
                    upstream_open = false;
                }
                Message::Control(Control::CollectionBegin(t)) => {
                    if !from_feedback {
                        rounds_open += 1;
                    }
                    channel::send(&tx, Control::CollectionBegin(t).into());
                }
                other => channel::send(&tx, other),
            }
        }
    })
}

/// The dispatcher behind a loop body: drives a [`LoopDispatcher`] and fans
/// its actions out to the downstream and feedback channels.
pub(crate) fn spawn_loop_dispatcher(
    name: impl Into<String>,
    rx: Receiver,
    downstream: Sender,
    feedback: Sender,
    policy: Arc<dyn TerminationPolicy>,
    tags: SharedTagGenerator,
    max_inflight: usize,
) -> StageHandle {
    StageHandle::spawn(name, move || {
        let mut machine = LoopDispatcher::new(policy, tags, max_inflight);
        for msg in rx {
            let finished = msg.is_global_end();
            for action in machine.handle(msg) {
                match action {
                    Action::Forward(m) => channel::send(&downstream, m),
                    Action::Backward(m) => channel::send(&feedback, m),
                }
            }
            if finished {
                break;
            }
        }
    })
}
