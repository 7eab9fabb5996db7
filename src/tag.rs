//! Collection tags and the fresh-tag generator.
//!
//! A [`Tag`] names one occurrence of a logical collection: one run of a
//! source, one iteration instance, one branch of a merge. Every batch and
//! every `CollectionBegin`/`CollectionEnd` control carries one. Tag
//! uniqueness is the anchor the whole control protocol leans on, so tags are
//! only ever minted through a [`TagGenerator`].
//!
//! The generator is injectable (see [`crate::config`]) so tests can pin down
//! the exact tag sequence a run will produce.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Opaque identifier of one occurrence of a logical collection.
///
/// `Tag::NIL` is reserved for the top-level, non-iterated run and is never
/// returned by a generator.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tag(u64);

impl Tag {
    /// The reserved top-level tag.
    pub const NIL: Tag = Tag(0);

    /// Whether this is the reserved top-level tag.
    #[inline]
    pub fn is_nil(self) -> bool {
        self.0 == 0
    }

    /// The underlying numeric value, mainly for debugging.
    #[inline]
    pub fn raw(self) -> u64 {
        self.0
    }

    pub(crate) fn from_raw(v: u64) -> Self {
        Tag(v)
    }
}

impl fmt::Debug for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_nil() {
            write!(f, "t#nil")
        } else {
            write!(f, "t#{}", self.0)
        }
    }
}

/// Source of fresh, strictly increasing tags.
///
/// Exactly one generator instance is shared across a compiled network; the
/// executor owns it and hands clones of the `Arc` to every stage that mints
/// collections (sources, join emitters, the iteration dispatcher).
pub trait TagGenerator: Send + Sync {
    /// Mint a tag never returned before by this generator, never `NIL`.
    fn fresh(&self) -> Tag;
}

/// Shared handle to the run's tag generator.
pub type SharedTagGenerator = Arc<dyn TagGenerator>;

/// Default generator: a process-local atomic counter starting above `NIL`.
#[derive(Debug)]
pub struct AtomicTagGenerator {
    next: AtomicU64,
}

impl Default for AtomicTagGenerator {
    fn default() -> Self {
        // 0 is Tag::NIL.
        Self { next: AtomicU64::new(1) }
    }
}

impl AtomicTagGenerator {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TagGenerator for AtomicTagGenerator {
    fn fresh(&self) -> Tag {
        Tag::from_raw(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn fresh_tags_are_distinct_and_never_nil() {
        let g = AtomicTagGenerator::new();
        let mut seen = HashSet::new();
        for _ in 0..10_000 {
            let t = g.fresh();
            assert!(!t.is_nil());
            assert!(seen.insert(t), "generator repeated {t:?}");
        }
    }

    #[test]
    fn fresh_tags_are_distinct_across_threads() {
        let g = Arc::new(AtomicTagGenerator::new());
        let mut handles = Vec::new();
        for _ in 0..4 {
            let g = Arc::clone(&g);
            handles.push(std::thread::spawn(move || {
                (0..1000).map(|_| g.fresh()).collect::<Vec<_>>()
            }));
        }
        let mut seen = HashSet::new();
        for h in handles {
            for t in h.join().unwrap() {
                assert!(seen.insert(t));
            }
        }
        assert_eq!(seen.len(), 4000);
    }
}
