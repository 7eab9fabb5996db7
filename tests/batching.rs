use tagflow::batch::{Batch, BatchAny};
use tagflow::{AtomicTagGenerator, TagGenerator, downcast_batch};

#[test]
fn allocate_then_commit_controls_visibility() -> anyhow::Result<()> {
    let tags = AtomicTagGenerator::new();
    let tag = tags.fresh();
    let mut b = Batch::with_capacity(tag, 4);

    b.allocate(10).ok().expect("room for one");
    assert_eq!(b.allocated(), 1);
    assert_eq!(b.committed(), 0);
    assert_eq!(b.iter().count(), 0, "uncommitted items are invisible");

    b.commit();
    assert_eq!(b.committed(), 1);
    assert_eq!(b.iter().copied().collect::<Vec<_>>(), vec![10]);

    b.push(20).ok().expect("room for another");
    b.allocate(30).ok().expect("room for a third");
    // 30 is allocated but never committed.
    assert_eq!(b.iter().copied().collect::<Vec<_>>(), vec![10, 20]);
    assert_eq!(b.into_committed(), vec![10, 20]);
    Ok(())
}

#[test]
fn full_batch_rejects_allocation_and_returns_the_item() -> anyhow::Result<()> {
    let tags = AtomicTagGenerator::new();
    let mut b = Batch::with_capacity(tags.fresh(), 2);
    b.push("x").ok().expect("one");
    b.push("y").ok().expect("two");
    assert!(b.is_full());
    assert_eq!(b.push("z"), Err("z"), "producer must flush before allocating more");
    Ok(())
}

#[test]
#[should_panic(expected = "commit without a prior allocate")]
fn commit_without_allocate_is_a_producer_bug() {
    let tags = AtomicTagGenerator::new();
    let mut b = Batch::<u8>::with_capacity(tags.fresh(), 2);
    b.commit();
}

#[test]
fn erased_clone_carries_only_committed_items() -> anyhow::Result<()> {
    let tags = AtomicTagGenerator::new();
    let tag = tags.fresh();
    let mut b = Batch::with_capacity(tag, 4);
    b.push(1u32).ok().expect("one");
    b.push(2u32).ok().expect("two");
    b.allocate(3u32).ok().expect("three, uncommitted");

    let erased: Box<dyn BatchAny> = Box::new(b);
    assert_eq!(erased.tag(), tag);
    assert_eq!(erased.committed(), 2);

    let copy = erased.clone_batch();
    let copy: Batch<u32> = downcast_batch(copy);
    assert_eq!(copy.tag(), tag);
    assert_eq!(copy.into_committed(), vec![1, 2]);
    Ok(())
}

#[test]
#[should_panic(expected = "batch transport type mismatch")]
fn downcast_to_the_wrong_item_type_is_fatal() {
    let tags = AtomicTagGenerator::new();
    let erased: Box<dyn BatchAny> = Box::new(Batch::from_vec(tags.fresh(), vec![1u32, 2, 3]));
    let _ = downcast_batch::<String>(erased);
}

#[test]
fn retag_moves_a_batch_between_collections() -> anyhow::Result<()> {
    let tags = AtomicTagGenerator::new();
    let (a, b) = (tags.fresh(), tags.fresh());
    let mut batch: Box<dyn BatchAny> = Box::new(Batch::from_vec(a, vec![1u8]));
    assert_eq!(batch.tag(), a);
    batch.retag(b);
    assert_eq!(batch.tag(), b);
    Ok(())
}
