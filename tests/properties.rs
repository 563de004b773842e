use chrono::{TimeZone, Utc};
use proptest::collection::{btree_map, vec};
use proptest::prelude::*;

use shadow_compare::shadow::{find_differences, normalize, NormalizeOptions, ShadowValue, TimestampMode};

fn present_leaf() -> impl Strategy<Value = ShadowValue> {
    prop_oneof![
        any::<bool>().prop_map(ShadowValue::Bool),
        (-1_000_000.0f64..1_000_000.0).prop_map(ShadowValue::Number),
        (-1_000_000_000i64..1_000_000_000).prop_map(ShadowValue::BigInt),
        "[a-z]{0,6}".prop_map(ShadowValue::String),
        Just(ShadowValue::String("2024-01-01T00:00:00.050Z".to_string())),
        (0i64..4_000_000_000_000_000_000).prop_map(|nanos| ShadowValue::Date(Utc.timestamp_nanos(nanos))),
    ]
}

fn leaf() -> impl Strategy<Value = ShadowValue> {
    prop_oneof![
        1 => Just(ShadowValue::Undefined),
        1 => Just(ShadowValue::Null),
        8 => present_leaf(),
    ]
}

fn key() -> impl Strategy<Value = String> {
    prop_oneof![
        Just("id".to_string()),
        Just("name".to_string()),
        Just("user".to_string()),
        Just("version".to_string()),
        Just("created_at".to_string()),
        Just("start_time".to_string()),
    ]
}

fn value_tree() -> impl Strategy<Value = ShadowValue> {
    leaf().prop_recursive(3, 48, 4, |inner| {
        prop_oneof![
            vec(inner.clone(), 0..5).prop_map(ShadowValue::Array),
            btree_map(key(), inner, 0..5).prop_map(ShadowValue::Object),
        ]
    })
}

fn options() -> impl Strategy<Value = NormalizeOptions> {
    (
        proptest::sample::subsequence(vec!["id", "user.id", "name"], 0..=2),
        any::<bool>(),
        prop_oneof![Just(None), Just(Some(500u64)), Just(Some(1000u64))],
        any::<bool>(),
        any::<bool>(),
        prop_oneof![Just(None), (0u32..4).prop_map(Some)],
    )
        .prop_map(|(sort_keys, remove_version, tolerance, delta, null_as_undefined, round)| {
            let mut options = NormalizeOptions::default();
            for key in sort_keys {
                options = options.sort_by(key);
            }
            if remove_version {
                options = options.remove_field("version");
            }
            options.timestamp_tolerance_ms = tolerance;
            options.timestamp_mode = if delta { TimestampMode::Delta } else { TimestampMode::Truncate };
            options.treat_null_as_undefined = null_as_undefined;
            options.round_decimals = round;
            options
        })
}

proptest! {
    #[test]
    fn prop_normalize_is_idempotent(value in value_tree(), options in options()) {
        let once = normalize(&value, &options);
        let twice = normalize(&once, &options);
        prop_assert_eq!(once, twice);
    }

    #[test]
    fn prop_tree_never_differs_from_itself(value in value_tree()) {
        prop_assert!(find_differences(&value, &value).is_empty());
    }

    #[test]
    fn prop_normalized_tree_never_differs_from_itself(value in value_tree(), options in options()) {
        let normalized = normalize(&value, &options);
        prop_assert!(find_differences(&normalized, &normalized).is_empty());
    }

    #[test]
    fn prop_leaf_divergence_is_reported(
        base in btree_map(key(), value_tree(), 0..4),
        field in key(),
        a in present_leaf(),
        b in present_leaf(),
        wrap_in_array in any::<bool>(),
    ) {
        prop_assume!(a != b);

        let mut left = base.clone();
        left.insert(field.clone(), a);
        let mut right = base;
        right.insert(field.clone(), b);

        let (left, right) = if wrap_in_array {
            (
                ShadowValue::Array(vec![ShadowValue::Object(left)]),
                ShadowValue::Array(vec![ShadowValue::Object(right)]),
            )
        } else {
            (ShadowValue::Object(left), ShadowValue::Object(right))
        };

        let diffs = find_differences(&left, &right);
        prop_assert!(!diffs.is_empty());
        let needle = format!(".{}", field);
        prop_assert!(diffs.iter().any(|d| d.contains(&needle)));
    }
}
