//! Bounded point-to-point links between stages.
//!
//! Stages communicate exclusively by transferring ownership of [`Message`]
//! values through these channels; a full queue blocking the producer is the
//! engine's only flow-control mechanism. Feedback edges are the one
//! exception: they are unbounded, because a bounded cycle can deadlock.

use crossbeam_channel as cb;

use crate::message::Message;

pub type Sender = cb::Sender<Message>;
pub type Receiver = cb::Receiver<Message>;

/// A bounded link with the given capacity (forced to at least 1).
pub fn link(capacity: usize) -> (Sender, Receiver) {
    cb::bounded(capacity.max(1))
}

/// An unbounded link, used only for feedback edges.
pub fn feedback_link() -> (Sender, Receiver) {
    cb::unbounded()
}

/// Send, treating a hung-up peer as fatal.
///
/// A receiver only disappears when its stage thread died; per the error
/// model that takes the whole run down.
#[track_caller]
pub fn send(tx: &Sender, msg: Message) {
    if tx.send(msg).is_err() {
        panic!("stage channel hung up: downstream stage is gone");
    }
}
