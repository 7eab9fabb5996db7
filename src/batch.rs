//! Fixed-capacity, tagged batches: the sole unit of inter-stage transport.
//!
//! A [`Batch<T>`] owns storage for up to `capacity` items and tracks two
//! counts: `allocated` (items written into the batch) and `committed`
//! (items valid for iteration), with `committed <= allocated <= capacity`.
//! Iteration visits exactly the first `committed` items in insertion order;
//! dropping a batch destroys every allocated item, committed or not.
//!
//! Across stage boundaries batches travel type-erased as
//! [`Box<dyn BatchAny>`], the same trick the engine uses everywhere a
//! channel cannot be generic over the item type. Only the tag, the counts
//! and cloning are reachable through the erased view; a stage that needs the
//! items downcasts with [`downcast_batch`], and a mismatch there is an
//! engine bug, not bad input.

use std::any::Any;

use crate::tag::Tag;

/// Marker bound for items the engine can move through a network. `Sync` is
/// required because operators holding items (sources, sinks) are shared
/// across stage threads behind `Arc<dyn Operator>`.
pub trait Item: 'static + Send + Sync + Clone {}
impl<T> Item for T where T: 'static + Send + Sync + Clone {}

/// A fixed-capacity container of items belonging to one tagged collection.
pub struct Batch<T> {
    tag: Tag,
    capacity: usize,
    items: Vec<T>,
    committed: usize,
}

impl<T> Batch<T> {
    /// An empty batch able to hold `capacity` items.
    pub fn with_capacity(tag: Tag, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self { tag, capacity, items: Vec::with_capacity(capacity), committed: 0 }
    }

    /// A full, fully committed batch built from existing items.
    pub fn from_vec(tag: Tag, items: Vec<T>) -> Self {
        let committed = items.len();
        Self { tag, capacity: committed.max(1), items, committed }
    }

    #[inline]
    pub fn tag(&self) -> Tag {
        self.tag
    }

    /// Re-tag the batch. Used on the feedback edge of a loop when data moves
    /// from one iteration's collection to its successor.
    #[inline]
    pub fn retag(&mut self, tag: Tag) {
        self.tag = tag;
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of slots written so far.
    #[inline]
    pub fn allocated(&self) -> usize {
        self.items.len()
    }

    /// Number of slots visible to iteration.
    #[inline]
    pub fn committed(&self) -> usize {
        self.committed
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.items.len() == self.capacity
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.committed == 0
    }

    /// Write an item into the next free slot without committing it.
    ///
    /// Returns `false` (dropping nothing, the item is given back via the
    /// `Err`) when the batch is full: the producer must flush before
    /// allocating more.
    pub fn allocate(&mut self, item: T) -> Result<(), T> {
        if self.is_full() {
            return Err(item);
        }
        self.items.push(item);
        Ok(())
    }

    /// Make the most recently allocated slot visible to iteration.
    ///
    /// Panics if there is nothing uncommitted; committing before allocating
    /// is a producer bug.
    pub fn commit(&mut self) {
        assert!(
            self.committed < self.items.len(),
            "batch commit without a prior allocate (tag {:?})",
            self.tag
        );
        self.committed += 1;
    }

    /// Allocate and immediately commit. The common path for kernels that
    /// never abandon a slot.
    pub fn push(&mut self, item: T) -> Result<(), T> {
        self.allocate(item)?;
        self.commit();
        Ok(())
    }

    /// Iterate the committed items in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items[..self.committed].iter()
    }

    /// Destroy all allocated items, keeping the storage for reuse.
    pub fn clear(&mut self) {
        self.items.clear();
        self.committed = 0;
    }

    /// Consume the batch, yielding only the committed items; uncommitted
    /// items are destroyed here.
    pub fn into_committed(mut self) -> Vec<T> {
        self.items.truncate(self.committed);
        self.items
    }
}

/// Object-safe, type-erased view of a batch used on channels.
pub trait BatchAny: Send {
    fn tag(&self) -> Tag;
    fn retag(&mut self, tag: Tag);
    fn committed(&self) -> usize;
    /// Deep clone, used by broadcast dispatch.
    fn clone_batch(&self) -> Box<dyn BatchAny>;
    fn as_any(&self) -> &dyn Any;
    fn into_any(self: Box<Self>) -> Box<dyn Any + Send>;
}

impl<T: Item> BatchAny for Batch<T> {
    fn tag(&self) -> Tag {
        self.tag
    }

    fn retag(&mut self, tag: Tag) {
        self.tag = tag;
    }

    fn committed(&self) -> usize {
        self.committed
    }

    fn clone_batch(&self) -> Box<dyn BatchAny> {
        Box::new(Batch {
            tag: self.tag,
            capacity: self.capacity,
            items: self.items[..self.committed].to_vec(),
            committed: self.committed,
        })
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send> {
        self
    }
}

/// Recover the concrete batch behind an erased transport handle.
///
/// A failure here means two stages disagree about the item type flowing
/// between them, which the composition layer is supposed to rule out; it is
/// fatal by design.
pub fn downcast_batch<T: Item>(batch: Box<dyn BatchAny>) -> Batch<T> {
    match batch.into_any().downcast::<Batch<T>>() {
        Ok(b) => *b,
        Err(_) => panic!(
            "batch transport type mismatch: expected Batch<{}>",
            std::any::type_name::<T>()
        ),
    }
}

/// Pack loose items into fully committed, erased batches of at most
/// `capacity` items each.
pub(crate) fn into_batches<T: Item>(
    tag: Tag,
    capacity: usize,
    items: Vec<T>,
) -> Vec<Box<dyn BatchAny>> {
    let mut out: Vec<Box<dyn BatchAny>> = Vec::new();
    let mut iter = items.into_iter();
    loop {
        let chunk: Vec<T> = iter.by_ref().take(capacity.max(1)).collect();
        if chunk.is_empty() {
            break;
        }
        out.push(Box::new(Batch::from_vec(tag, chunk)));
    }
    out
}
