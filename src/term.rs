//! The operator term tree.
//!
//! Built by the composition layer, read by the engine. The compiler walks
//! this shape recursively; the fusion optimizer rewrites adjacent children
//! of a `Sequence` (and the `Pair`/`Reduce` boundary) while compiling.

use std::sync::Arc;

use crate::iteration::TerminationPolicy;
use crate::operator::Operator;

pub enum Term {
    /// A hole: upstream connects straight through. Used as a `Merge`/`Pair`
    /// child to splice the enclosing pipeline in as one of the branches.
    Empty,
    Operator(Arc<dyn Operator>),
    /// Left-to-right composition.
    Sequence(Vec<Term>),
    /// Independent branches whose outputs interleave into one stream.
    Merge(Vec<Term>),
    /// Two branches feeding one binary operator.
    Pair(Box<Term>, Box<Term>, Arc<dyn Operator>),
    /// A feedback loop around `child`, driven by a termination policy.
    Iterate(Box<Term>, Arc<dyn TerminationPolicy>),
}

impl Term {
    pub fn op(operator: impl Operator + 'static) -> Term {
        Term::Operator(Arc::new(operator))
    }

    pub fn seq(children: Vec<Term>) -> Term {
        Term::Sequence(children)
    }

    pub fn pair(left: Term, right: Term, binop: impl Operator + 'static) -> Term {
        Term::Pair(Box::new(left), Box::new(right), Arc::new(binop))
    }

    pub fn iterate(child: Term, policy: impl TerminationPolicy + 'static) -> Term {
        Term::Iterate(Box::new(child), Arc::new(policy))
    }
}
