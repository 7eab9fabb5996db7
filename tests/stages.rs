use tagflow::batch::Batch;
use tagflow::channel::{self, Receiver};
use tagflow::stage::{Broadcast, Collected, CollectorCore, Dispatch, FanOut, KeyedDispatch, key_index};
use tagflow::{AtomicTagGenerator, Control, Message, TagGenerator, downcast_batch};

fn forwards(c: Collected) -> Option<Message> {
    match c {
        Collected::Forward(m) => Some(m),
        _ => None,
    }
}

#[test]
fn collector_counts_ends_per_tag_not_globally() -> anyhow::Result<()> {
    let tags = AtomicTagGenerator::new();
    let (a, b) = (tags.fresh(), tags.fresh());
    let mut core = CollectorCore::new(3, 3);

    // Two collections interleave through the same farm.
    assert!(forwards(core.handle(Control::CollectionBegin(a).into())).is_some());
    assert!(forwards(core.handle(Control::CollectionBegin(b).into())).is_some());
    assert!(forwards(core.handle(Control::CollectionBegin(a).into())).is_none());

    assert!(forwards(core.handle(Control::CollectionEnd(a).into())).is_none());
    assert!(forwards(core.handle(Control::CollectionEnd(b).into())).is_none());
    assert!(forwards(core.handle(Control::CollectionEnd(b).into())).is_none());
    assert!(forwards(core.handle(Control::CollectionEnd(a).into())).is_none());

    // The third report of each closes it, in arrival order.
    match forwards(core.handle(Control::CollectionEnd(b).into())) {
        Some(Message::Control(Control::CollectionEnd(t))) => assert_eq!(t, b),
        other => panic!("expected CollectionEnd({b:?}), got {other:?}"),
    }
    match forwards(core.handle(Control::CollectionEnd(a).into())) {
        Some(Message::Control(Control::CollectionEnd(t))) => assert_eq!(t, a),
        other => panic!("expected CollectionEnd({a:?}), got {other:?}"),
    }
    Ok(())
}

#[test]
fn collector_forwards_data_immediately() -> anyhow::Result<()> {
    let tags = AtomicTagGenerator::new();
    let t = tags.fresh();
    let mut core = CollectorCore::new(2, 2);
    core.handle(Control::CollectionBegin(t).into());
    let out = forwards(core.handle(Message::data(Batch::from_vec(t, vec![1u8]))));
    assert!(matches!(out, Some(Message::Data(_))));
    Ok(())
}

#[test]
#[should_panic(expected = "CollectionEnd for unopened")]
fn collector_overcount_is_fatal() {
    let tags = AtomicTagGenerator::new();
    let t = tags.fresh();
    let mut core = CollectorCore::new(2, 2);
    core.handle(Control::CollectionBegin(t).into());
    core.handle(Control::CollectionEnd(t).into());
    core.handle(Control::CollectionEnd(t).into());
    // The tag is closed and gone; a third report cannot be counted.
    core.handle(Control::CollectionEnd(t).into());
}

#[test]
fn global_end_needs_every_input() -> anyhow::Result<()> {
    let mut core = CollectorCore::new(3, 3);
    assert!(matches!(core.handle(Control::GlobalEnd.into()), Collected::Swallow));
    assert!(matches!(core.handle(Control::GlobalEnd.into()), Collected::Swallow));
    assert!(matches!(core.handle(Control::GlobalEnd.into()), Collected::Finished));
    Ok(())
}

fn drain_keys(rx: &Receiver) -> Vec<String> {
    let mut keys = Vec::new();
    while let Ok(Message::Data(b)) = rx.try_recv() {
        let b: Batch<(String, u32)> = downcast_batch(b);
        keys.extend(b.into_committed().into_iter().map(|kv| kv.0));
    }
    keys
}

#[test]
fn keyed_dispatch_routes_each_key_to_one_worker() -> anyhow::Result<()> {
    let tags = AtomicTagGenerator::new();
    let t = tags.fresh();
    let n = 4;
    let mut links = Vec::new();
    let mut rxs = Vec::new();
    for _ in 0..n {
        let (tx, rx) = channel::link(64);
        links.push(tx);
        rxs.push(rx);
    }
    let fan = FanOut::new(links);
    let mut dispatch = KeyedDispatch::<(String, u32), String, _>::new(2, |kv| kv.0.clone());

    let items: Vec<(String, u32)> = ["a", "b", "c", "a", "b", "a"]
        .iter()
        .map(|k| (k.to_string(), 1))
        .collect();
    dispatch.dispatch(Box::new(Batch::from_vec(t, items)), &fan);
    dispatch.flush(t, &fan);

    for (dest, rx) in rxs.iter().enumerate() {
        for key in drain_keys(rx) {
            assert_eq!(
                key_index(&key, n),
                dest,
                "key {key:?} leaked to worker {dest}"
            );
        }
    }
    Ok(())
}

#[test]
fn broadcast_clones_every_batch_to_every_worker() -> anyhow::Result<()> {
    let tags = AtomicTagGenerator::new();
    let t = tags.fresh();
    let n = 3;
    let mut links = Vec::new();
    let mut rxs = Vec::new();
    for _ in 0..n {
        let (tx, rx) = channel::link(64);
        links.push(tx);
        rxs.push(rx);
    }
    let fan = FanOut::new(links);
    let mut dispatch = Broadcast;

    let items = vec![("a".to_string(), 1u32), ("b".to_string(), 2)];
    dispatch.dispatch(Box::new(Batch::from_vec(t, items)), &fan);

    for rx in &rxs {
        let keys = drain_keys(rx);
        assert_eq!(keys, vec!["a".to_string(), "b".to_string()]);
    }
    Ok(())
}

#[test]
fn keyed_dispatch_flush_delivers_partial_batches() -> anyhow::Result<()> {
    let tags = AtomicTagGenerator::new();
    let t = tags.fresh();
    let (tx, rx) = channel::link(64);
    let fan = FanOut::new(vec![tx]);
    // Capacity 8 with 3 items: nothing fills, everything rides the flush.
    let mut dispatch = KeyedDispatch::<(String, u32), String, _>::new(8, |kv| kv.0.clone());

    let items = vec![("x".to_string(), 1u32), ("y".to_string(), 2), ("x".to_string(), 3)];
    dispatch.dispatch(Box::new(Batch::from_vec(t, items)), &fan);
    assert!(rx.try_recv().is_err(), "partial batches held until flush");

    dispatch.flush(t, &fan);
    assert_eq!(drain_keys(&rx).len(), 3);
    Ok(())
}
