use anyhow::Result;
use tagflow::testing::{assert_unordered_equal, test_config};
use tagflow::{Executor, ReduceByKey, SinkVec, SourceVec, Term};

fn run_windowed(parallelism: usize, window: usize) -> Result<Vec<(String, u64)>> {
    let sink = SinkVec::<(String, u64)>::new();
    let results = sink.handle();
    let input: Vec<(String, u64)> = (1..=5)
        .map(|i| ("k".to_string(), i))
        .chain((1..=3).map(|i| ("j".to_string(), i * 10)))
        .collect();
    let term = Term::seq(vec![
        Term::op(SourceVec::new(input)),
        Term::op(ReduceByKey::<String, u64>::windowed(parallelism, window, |a, b| a + b)),
        Term::op(sink),
    ]);
    Executor::new(test_config()).run(&term)?;
    Ok(results.take())
}

#[test]
fn tumbling_windows_emit_ceil_n_over_w_results_per_key() -> Result<()> {
    // k: 1..=5 in windows of 2 -> [1+2, 3+4, 5]; j: 10,20,30 -> [30, 30].
    let out = run_windowed(1, 2)?;
    assert_eq!(out.iter().filter(|kv| kv.0 == "k").count(), 3);
    assert_eq!(out.iter().filter(|kv| kv.0 == "j").count(), 2);
    assert_unordered_equal(
        &out,
        &[
            ("k".to_string(), 3),
            ("k".to_string(), 7),
            ("k".to_string(), 5),
            ("j".to_string(), 30),
            ("j".to_string(), 30),
        ],
    );
    Ok(())
}

#[test]
fn windowed_results_are_parallelism_independent() -> Result<()> {
    let sequential = run_windowed(1, 2)?;
    let parallel = run_windowed(4, 2)?;
    assert_unordered_equal(&parallel, &sequential);
    Ok(())
}

#[test]
fn window_larger_than_the_key_stream_emits_once_at_the_end() -> Result<()> {
    let out = run_windowed(2, 100)?;
    assert_unordered_equal(&out, &[("k".to_string(), 15), ("j".to_string(), 60)]);
    Ok(())
}
