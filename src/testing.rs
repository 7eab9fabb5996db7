//! Assertion helpers and small fixtures for engine tests.

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;

use crate::config::EngineConfig;

/// A configuration sized for tests: small batches and channels so batch
/// rotation and backpressure paths actually run.
pub fn test_config() -> EngineConfig {
    EngineConfig {
        batch_capacity: 4,
        channel_capacity: 2,
        default_parallelism: 2,
        max_inflight_iterations: 2,
    }
}

/// Assert that two collections hold the same elements with the same
/// multiplicities, ignoring order.
pub fn assert_unordered_equal<T: Debug + Eq + Hash>(actual: &[T], expected: &[T]) {
    let mut counts: HashMap<&T, isize> = HashMap::new();
    for a in actual {
        *counts.entry(a).or_default() += 1;
    }
    for e in expected {
        *counts.entry(e).or_default() -= 1;
    }
    counts.retain(|_, c| *c != 0);
    assert!(
        counts.is_empty(),
        "collections differ (element -> actual minus expected): {counts:?}\n  \
         actual: {actual:?}\n  expected: {expected:?}"
    );
}

/// Assert that two key-value collections are equal after sorting by key.
/// For grouped output where key order varies between runs.
pub fn assert_kv_equal<K, V>(mut actual: Vec<(K, V)>, mut expected: Vec<(K, V)>)
where
    K: Debug + Ord,
    V: Debug + PartialEq,
{
    actual.sort_by(|a, b| a.0.cmp(&b.0));
    expected.sort_by(|a, b| a.0.cmp(&b.0));
    assert_eq!(
        actual.len(),
        expected.len(),
        "length mismatch:\n  actual: {actual:?}\n  expected: {expected:?}"
    );
    for (i, ((ak, av), (ek, ev))) in actual.iter().zip(expected.iter()).enumerate() {
        assert!(
            ak == ek && av == ev,
            "mismatch at index {i} (sorted by key):\n  actual: ({ak:?}, {av:?})\n  \
             expected: ({ek:?}, {ev:?})"
        );
    }
}
