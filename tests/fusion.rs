use anyhow::Result;
use tagflow::testing::{assert_kv_equal, test_config};
use tagflow::{Executor, FlatMap, Map, ReduceByKey, SinkVec, SourceVec, Term};

fn pairs() -> Vec<(String, u64)> {
    vec![
        ("a".to_string(), 1),
        ("b".to_string(), 2),
        ("a".to_string(), 3),
        ("c".to_string(), 4),
        ("b".to_string(), 5),
    ]
}

fn summed() -> Vec<(String, u64)> {
    vec![("a".to_string(), 4), ("b".to_string(), 7), ("c".to_string(), 4)]
}

#[test]
fn standalone_reduce_sums_per_key() -> Result<()> {
    // A source feeding a reduce directly never fuses.
    let sink = SinkVec::<(String, u64)>::new();
    let results = sink.handle();
    let term = Term::seq(vec![
        Term::op(SourceVec::new(pairs())),
        Term::op(ReduceByKey::<String, u64>::new(3, |a, b| a + b)),
        Term::op(sink),
    ]);
    Executor::new(test_config()).run(&term)?;
    assert_kv_equal(results.take(), summed());
    Ok(())
}

#[test]
fn fused_map_reduce_matches_the_standalone_farms() -> Result<()> {
    // An identity map in front makes the pair eligible for fusion.
    let sink = SinkVec::<(String, u64)>::new();
    let results = sink.handle();
    let term = Term::seq(vec![
        Term::op(SourceVec::new(pairs())),
        Term::op(Map::new(3, |kv: &(String, u64)| kv.clone())),
        Term::op(ReduceByKey::<String, u64>::new(2, |a, b| a + b)),
        Term::op(sink),
    ]);
    Executor::new(test_config()).run(&term)?;
    assert_kv_equal(results.take(), summed());
    Ok(())
}

#[test]
fn fused_flat_map_reduce_counts_words() -> Result<()> {
    let sink = SinkVec::<(String, u64)>::new();
    let results = sink.handle();
    let term = Term::seq(vec![
        Term::op(SourceVec::new(vec![
            "x y".to_string(),
            "y".to_string(),
            "x y x".to_string(),
        ])),
        Term::op(FlatMap::new(4, |line: &String| {
            line.split_whitespace()
                .map(|w| (w.to_string(), 1u64))
                .collect::<Vec<_>>()
        })),
        Term::op(ReduceByKey::<String, u64>::new(3, |a, b| a + b)),
        Term::op(sink),
    ]);
    Executor::new(test_config()).run(&term)?;
    assert_kv_equal(
        results.take(),
        vec![("x".to_string(), 3), ("y".to_string(), 3)],
    );
    Ok(())
}

#[test]
fn windowed_reduce_declines_fusion_but_still_runs() -> Result<()> {
    // The fusion rule skips windowed reduces; the map and the reduce run as
    // separate farms and the windowed semantics hold.
    let sink = SinkVec::<(String, u64)>::new();
    let results = sink.handle();
    let term = Term::seq(vec![
        Term::op(SourceVec::new(vec![1u64, 2, 3, 4])),
        Term::op(Map::new(2, |x: &u64| ("n".to_string(), *x))),
        Term::op(ReduceByKey::<String, u64>::windowed(2, 2, |a, b| a + b)),
        Term::op(sink),
    ]);
    Executor::new(test_config()).run(&term)?;
    // 1..=4 under one key in windows of 2: two results.
    let out = results.take();
    assert_eq!(out.len(), 2);
    assert_eq!(out.iter().map(|kv| kv.1).sum::<u64>(), 10);
    Ok(())
}
