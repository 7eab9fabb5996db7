//! The inter-stage message envelope.
//!
//! Every channel in a compiled network carries [`Message`] values: either a
//! data batch or a structural [`Control`]. Control tokens are ordinary enum
//! variants distinguishable by value, never sentinel pointers and never by
//! inspecting batch contents.

use std::fmt;

use crate::batch::{Batch, BatchAny, Item};
use crate::tag::Tag;

/// Structural control tokens propagated alongside data.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Control {
    /// Brackets one full execution (sent once by the executor).
    GlobalBegin,
    GlobalEnd,
    /// Brackets one logical collection's data.
    CollectionBegin(Tag),
    CollectionEnd(Tag),
    /// Tells a stateful stage to emit its accumulated state now. Used
    /// between the stages of a farm, never across farm boundaries.
    Sync,
}

pub enum Message {
    Data(Box<dyn BatchAny>),
    Control(Control),
}

impl Message {
    /// Wrap a concrete batch for transport.
    pub fn data<T: Item>(batch: Batch<T>) -> Self {
        Message::Data(Box::new(batch))
    }

    #[inline]
    pub fn is_global_end(&self) -> bool {
        matches!(self, Message::Control(Control::GlobalEnd))
    }
}

impl From<Control> for Message {
    fn from(c: Control) -> Self {
        Message::Control(c)
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Message::Data(b) => write!(f, "Data({:?}, {} items)", b.tag(), b.committed()),
            Message::Control(c) => write!(f, "{c:?}"),
        }
    }
}
