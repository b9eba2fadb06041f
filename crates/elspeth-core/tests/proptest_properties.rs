// crates/elspeth-core/tests/proptest_properties.rs
// ============================================================================
// Module: Property-Based Tests
// Description: Property tests for canonical-hash stability and total
//              coercion of externally supplied retry policy input.
// Purpose: Detect panics and invariant violations across wide input ranges,
//          not just the handful of fixed cases the unit tests cover.
// ============================================================================

//! Property-based tests for hashing and retry-policy invariants.

#![allow(
    clippy::panic,
    clippy::print_stdout,
    clippy::print_stderr,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::use_debug,
    clippy::dbg_macro,
    clippy::panic_in_result_fn,
    clippy::unwrap_in_result,
    reason = "Test-only assertions and helpers are permitted."
)]

use elspeth_core::core::hashing::canonical_json_bytes;
use elspeth_core::core::hashing::stable_hash;
use elspeth_core::runtime::RetryPolicyInput;
use elspeth_core::runtime::RuntimeRetryConfig;
use proptest::prelude::*;
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde_json::Value;

/// Mirrors `RuntimeRetryConfig`'s private hard ceiling so this test can
/// assert on it without depending on a non-public constant.
const HARD_MAX_DELAY_MS: u128 = 300_000;

fn json_value_strategy(max_depth: u32) -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i32>().prop_map(|v| Value::Number(v.into())),
        ".*".prop_map(Value::String),
    ];

    leaf.prop_recursive(max_depth, 64, 8, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
            prop::collection::btree_map("[a-z]{1,4}", inner, 0..4).prop_map(|map| {
                let mut object = serde_json::Map::new();
                for (key, value) in map {
                    object.insert(key, value);
                }
                Value::Object(object)
            }),
        ]
    })
}

fn shuffled_object(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().map(|(k, v)| (k.clone(), shuffled_object(v))).collect();
            entries.reverse();
            let mut rebuilt = serde_json::Map::new();
            for (k, v) in entries {
                rebuilt.insert(k, v);
            }
            Value::Object(rebuilt)
        }
        Value::Array(items) => Value::Array(items.iter().map(shuffled_object).collect()),
        other => other.clone(),
    }
}

proptest! {
    #[test]
    fn canonical_hash_is_stable_across_repeated_calls(value in json_value_strategy(4)) {
        let first = stable_hash(&value);
        let second = stable_hash(&value);
        prop_assert_eq!(first.is_ok(), second.is_ok());
        if let (Ok(a), Ok(b)) = (first, second) {
            prop_assert_eq!(a, b);
        }
    }

    #[test]
    fn canonical_hash_is_independent_of_object_key_order(value in json_value_strategy(4)) {
        let reordered = shuffled_object(&value);
        let original_hash = stable_hash(&value);
        let reordered_hash = stable_hash(&reordered);
        prop_assert_eq!(original_hash.is_ok(), reordered_hash.is_ok());
        if let (Ok(a), Ok(b)) = (original_hash, reordered_hash) {
            prop_assert_eq!(a, b);
        }
    }

    #[test]
    fn canonical_bytes_never_panic_on_arbitrary_values(value in json_value_strategy(3)) {
        let _ = canonical_json_bytes(&value);
    }

    #[test]
    fn retry_config_from_policy_never_panics_and_stays_in_bounds(
        max_retries in proptest::option::of(any::<i64>()),
        base_delay_ms in proptest::option::of(any::<i64>()),
        max_delay_ms in proptest::option::of(any::<i64>()),
        jitter in proptest::option::of(any::<bool>()),
    ) {
        let config = RuntimeRetryConfig::from_policy(RetryPolicyInput {
            max_retries,
            base_delay_ms,
            max_delay_ms,
            jitter,
        });
        prop_assert!(config.max_retries() <= 100);

        let mut rng = StdRng::seed_from_u64(42);
        for attempt in 1..=5 {
            prop_assert!(config.delay_for(attempt, &mut rng).as_millis() <= HARD_MAX_DELAY_MS);
        }
    }
}
