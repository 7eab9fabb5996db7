use anyhow::Result;
use tagflow::testing::{assert_kv_equal, assert_unordered_equal, test_config};
use tagflow::{Executor, KeyJoinFlatMap, ReduceByKey, SinkVec, SourceVec, Term};

fn left_side() -> Term {
    Term::op(SourceVec::new(vec![
        ("a".to_string(), 1u32),
        ("b".to_string(), 2),
        ("a".to_string(), 3),
    ]))
}

fn right_side() -> Term {
    Term::op(SourceVec::new(vec![
        ("a".to_string(), 10u32),
        ("c".to_string(), 30),
        ("a".to_string(), 40),
        ("b".to_string(), 20),
    ]))
}

fn expected_pairs() -> Vec<(String, (u32, u32))> {
    vec![
        ("a".to_string(), (1, 10)),
        ("a".to_string(), (1, 40)),
        ("a".to_string(), (3, 10)),
        ("a".to_string(), (3, 40)),
        ("b".to_string(), (2, 20)),
    ]
}

fn run_join(parallelism: usize) -> Result<Vec<(String, (u32, u32))>> {
    let sink = SinkVec::<(String, (u32, u32))>::new();
    let results = sink.handle();
    let join = KeyJoinFlatMap::new(parallelism, |k: &String, l: &u32, r: &u32| {
        vec![(k.clone(), (*l, *r))]
    });
    let term = Term::seq(vec![
        Term::pair(left_side(), right_side(), join),
        Term::op(sink),
    ]);
    Executor::new(test_config()).run(&term)?;
    Ok(results.take())
}

#[test]
fn inner_join_produces_every_pairing() -> Result<()> {
    assert_unordered_equal(&run_join(1)?, &expected_pairs());
    Ok(())
}

#[test]
fn join_is_parallelism_independent() -> Result<()> {
    assert_unordered_equal(&run_join(4)?, &expected_pairs());
    Ok(())
}

#[test]
fn unmatched_keys_produce_nothing() -> Result<()> {
    let sink = SinkVec::<(String, (u32, u32))>::new();
    let results = sink.handle();
    let left = Term::op(SourceVec::new(vec![("only-left".to_string(), 1u32)]));
    let right = Term::op(SourceVec::new(vec![("only-right".to_string(), 2u32)]));
    let join = KeyJoinFlatMap::new(2, |k: &String, l: &u32, r: &u32| {
        vec![(k.clone(), (*l, *r))]
    });
    let term = Term::seq(vec![Term::pair(left, right, join), Term::op(sink)]);
    Executor::new(test_config()).run(&term)?;
    assert!(results.take().is_empty());
    Ok(())
}

#[test]
fn join_feeding_a_reduce_fuses_and_sums() -> Result<()> {
    // Same pairings as above, products summed per key:
    //   a: 1*10 + 1*40 + 3*10 + 3*40 = 200, b: 2*20 = 40.
    let sink = SinkVec::<(String, u32)>::new();
    let results = sink.handle();
    let join = KeyJoinFlatMap::new(3, |k: &String, l: &u32, r: &u32| {
        vec![(k.clone(), l * r)]
    });
    let term = Term::seq(vec![
        Term::pair(left_side(), right_side(), join),
        Term::op(ReduceByKey::<String, u32>::new(2, |a, b| a + b)),
        Term::op(sink),
    ]);
    Executor::new(test_config()).run(&term)?;
    assert_kv_equal(
        results.take(),
        vec![("a".to_string(), 200), ("b".to_string(), 40)],
    );
    Ok(())
}
