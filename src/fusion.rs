//! The fusion rule: when two adjacent operators collapse into one farm.
//!
//! Matching is purely structural, a table over (left kind, right kind) plus
//! two flag checks on the right operator. The actual combined farm is built
//! by the left operator's fusion-aware constructor; this module only decides
//! whether the compiler should ask for one.

use crate::operator::{Descriptor, OperatorKind};

struct FusionRule {
    left: OperatorKind,
    right: OperatorKind,
}

/// A map-like or join stage followed by a keyed, non-windowed reduce can
/// accumulate in the producing worker ring, skipping one batch hop.
const RULES: &[FusionRule] = &[
    FusionRule { left: OperatorKind::Map, right: OperatorKind::Reduce },
    FusionRule { left: OperatorKind::FlatMap, right: OperatorKind::Reduce },
    FusionRule { left: OperatorKind::Join, right: OperatorKind::Reduce },
];

/// Does the pair (left, right) fuse?
///
/// The right side must partition by key (otherwise its state is not routable
/// to the reducer ring) and must not window (early emission cannot be folded
/// into the producer).
pub fn fuses(left: &Descriptor, right: &Descriptor) -> bool {
    RULES
        .iter()
        .any(|r| r.left == left.kind && r.right == right.kind)
        && right.partitioning
        && !right.windowing
}
