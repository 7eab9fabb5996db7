use anyhow::Result;
use tagflow::testing::{assert_kv_equal, assert_unordered_equal, test_config};
use tagflow::{EngineConfig, Executor, FlatMap, Map, ReduceByKey, SinkVec, SourceVec, Term};

fn word_sum(parallelism: usize, config: EngineConfig) -> Result<Vec<(String, u64)>> {
    let _ = env_logger::builder().is_test(true).try_init();
    let sink = SinkVec::<(String, u64)>::new();
    let results = sink.handle();
    let term = Term::seq(vec![
        Term::op(SourceVec::new(vec![
            "a b a".to_string(),
            "a".to_string(),
            "b a".to_string(),
        ])),
        Term::op(FlatMap::new(parallelism, |line: &String| {
            line.split_whitespace()
                .map(|w| (w.to_string(), 1u64))
                .collect::<Vec<_>>()
        })),
        Term::op(ReduceByKey::<String, u64>::new(parallelism, |a, b| a + b)),
        Term::op(sink),
    ]);
    Executor::new(config).run(&term)?;
    Ok(results.take())
}

#[test]
fn word_sum_sequential() -> Result<()> {
    let out = word_sum(1, test_config())?;
    assert_kv_equal(out, vec![("a".to_string(), 4), ("b".to_string(), 2)]);
    Ok(())
}

#[test]
fn word_sum_parallel_matches_sequential() -> Result<()> {
    let out = word_sum(4, test_config())?;
    assert_kv_equal(out, vec![("a".to_string(), 4), ("b".to_string(), 2)]);
    Ok(())
}

#[test]
fn word_sum_with_default_config() -> Result<()> {
    // Large batches: a whole collection fits in one batch per stage.
    let out = word_sum(2, EngineConfig::default())?;
    assert_kv_equal(out, vec![("a".to_string(), 4), ("b".to_string(), 2)]);
    Ok(())
}

#[test]
fn flat_map_duplication_keeps_multiplicities() -> Result<()> {
    let sink = SinkVec::<i64>::new();
    let results = sink.handle();
    let term = Term::seq(vec![
        Term::op(SourceVec::new(vec![1i64, 2, 3])),
        Term::op(FlatMap::new(4, |x: &i64| vec![x * 2, x * 2])),
        Term::op(sink),
    ]);
    Executor::new(test_config()).run(&term)?;
    assert_unordered_equal(&results.take(), &[2, 2, 4, 4, 6, 6]);
    Ok(())
}

#[test]
fn map_preserves_order_at_parallelism_one() -> Result<()> {
    let sink = SinkVec::<String>::new();
    let results = sink.handle();
    let term = Term::seq(vec![
        Term::op(SourceVec::new(vec![1u32, 2, 3, 4, 5])),
        Term::op(Map::new(1, |x: &u32| format!("#{x}"))),
        Term::op(sink),
    ]);
    Executor::new(test_config()).run(&term)?;
    assert_eq!(results.take(), vec!["#1", "#2", "#3", "#4", "#5"]);
    Ok(())
}

#[test]
fn merge_interleaves_independent_branches() -> Result<()> {
    let sink = SinkVec::<u32>::new();
    let results = sink.handle();
    let term = Term::seq(vec![
        Term::Merge(vec![
            Term::op(SourceVec::new(vec![1u32, 2, 3])),
            Term::op(SourceVec::new(vec![10u32, 20])),
        ]),
        Term::op(Map::new(2, |x: &u32| x + 1)),
        Term::op(sink),
    ]);
    Executor::new(test_config()).run(&term)?;
    assert_unordered_equal(&results.take(), &[2, 3, 4, 11, 21]);
    Ok(())
}

#[test]
fn executor_reports_elapsed_time() -> Result<()> {
    let sink = SinkVec::<u8>::new();
    let term = Term::seq(vec![
        Term::op(SourceVec::new(vec![1u8, 2, 3])),
        Term::op(sink),
    ]);
    let mut exec = Executor::new(test_config());
    assert!(exec.elapsed_time().is_none(), "no run yet");
    exec.run(&term)?;
    assert!(exec.elapsed_time().is_some());
    Ok(())
}

#[test]
fn one_executor_runs_the_same_term_twice() -> Result<()> {
    let sink = SinkVec::<u32>::new();
    let results = sink.handle();
    let term = Term::seq(vec![
        Term::op(SourceVec::new(vec![5u32, 6])),
        Term::op(Map::new(2, |x: &u32| x * 10)),
        Term::op(sink),
    ]);
    let mut exec = Executor::new(test_config());
    exec.run(&term)?;
    assert_unordered_equal(&results.take(), &[50, 60]);
    exec.run(&term)?;
    assert_unordered_equal(&results.take(), &[50, 60]);
    Ok(())
}

#[test]
fn unsupported_structure_is_a_compile_error() -> Result<()> {
    use tagflow::StructureType;
    let term = Term::seq(vec![
        Term::op(SourceVec::new(vec![1u32, 2])),
        Term::op(SinkVec::<u32>::new()),
    ]);
    let err = Executor::new(test_config())
        .run_over(&term, StructureType::UnboundedUnordered)
        .unwrap_err();
    assert!(err.to_string().contains("does not support"), "got: {err}");
    Ok(())
}

#[test]
fn empty_source_still_completes() -> Result<()> {
    let sink = SinkVec::<u64>::new();
    let results = sink.handle();
    let term = Term::seq(vec![
        Term::op(SourceVec::new(Vec::<u64>::new())),
        Term::op(Map::new(3, |x: &u64| x + 1)),
        Term::op(sink),
    ]);
    Executor::new(test_config()).run(&term)?;
    assert!(results.take().is_empty());
    Ok(())
}
