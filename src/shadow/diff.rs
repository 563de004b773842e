//! Structural diff of two normalized value trees.
//!
//! Walks both trees in lock-step and collects every discrepancy as a
//! human-readable `path: detail` string. Array order is significant here;
//! order-independent comparison is the normalizer's job (`sort_arrays_by`).

use std::collections::BTreeSet;
use std::time::Duration;

use super::normalize::{is_timestamp_field, parse_timestamp};
use super::value::ShadowValue;

/// Root path used when the caller does not supply one
pub const ROOT_PATH: &str = "root";

/// Differ settings derived from `NormalizeOptions::diff_options`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiffOptions {
    /// Accept timestamp-named leaves whose instants are at most this far apart
    pub timestamp_delta: Option<Duration>,
}

/// Collect all discrepancies between `actual` and `expected`, starting at `root`.
pub fn find_differences(actual: &ShadowValue, expected: &ShadowValue) -> Vec<String> {
    find_differences_at(actual, expected, ROOT_PATH)
}

pub fn find_differences_at(actual: &ShadowValue, expected: &ShadowValue, path: &str) -> Vec<String> {
    let mut diffs = Vec::new();
    find_differences_with(actual, expected, path, &DiffOptions::default(), &mut diffs);
    diffs
}

/// Accumulate discrepancies into `diffs`. Never stops at the first one.
pub fn find_differences_with(
    actual: &ShadowValue,
    expected: &ShadowValue,
    path: &str,
    options: &DiffOptions,
    diffs: &mut Vec<String>,
) {
    walk(actual, expected, path, None, options, diffs);
}

fn walk(
    actual: &ShadowValue,
    expected: &ShadowValue,
    path: &str,
    key: Option<&str>,
    options: &DiffOptions,
    diffs: &mut Vec<String>,
) {
    match (actual.is_absent(), expected.is_absent()) {
        (true, true) => return,
        (true, false) | (false, true) => {
            diffs.push(format!("{}: expected {}, got {}", path, expected, actual));
            return;
        }
        (false, false) => {}
    }

    if actual.type_name() != expected.type_name() {
        diffs.push(format!(
            "{}: type mismatch (expected {}, got {})",
            path,
            expected.type_name(),
            actual.type_name()
        ));
        return;
    }

    match (actual, expected) {
        (ShadowValue::Array(a), ShadowValue::Array(e)) => {
            if a.len() != e.len() {
                diffs.push(format!(
                    "{}: array length mismatch (expected {}, got {})",
                    path,
                    e.len(),
                    a.len()
                ));
            }
            for i in 0..a.len().max(e.len()) {
                let a_item = a.get(i).unwrap_or(&ShadowValue::Undefined);
                let e_item = e.get(i).unwrap_or(&ShadowValue::Undefined);
                walk(a_item, e_item, &format!("{}[{}]", path, i), None, options, diffs);
            }
        }
        (ShadowValue::Object(a), ShadowValue::Object(e)) => {
            let keys: BTreeSet<&String> = a.keys().chain(e.keys()).collect();
            for k in keys {
                let child = format!("{}.{}", path, k);
                match (a.get(k), e.get(k)) {
                    (Some(av), Some(ev)) => walk(av, ev, &child, Some(k), options, diffs),
                    // A key missing on one side reads as absent
                    (None, Some(ev)) if !ev.is_absent() => diffs.push(format!("{}: missing in actual", child)),
                    (Some(av), None) if !av.is_absent() => diffs.push(format!("{}: missing in expected", child)),
                    _ => {}
                }
            }
        }
        _ => {
            if !leaf_equal(actual, expected, key, options) {
                diffs.push(format!("{}: expected {}, got {}", path, expected, actual));
            }
        }
    }
}

fn leaf_equal(actual: &ShadowValue, expected: &ShadowValue, key: Option<&str>, options: &DiffOptions) -> bool {
    let equal = match (actual, expected) {
        // NaN compares equal to itself so a tree never differs from itself
        (ShadowValue::Number(a), ShadowValue::Number(e)) => a == e || (a.is_nan() && e.is_nan()),
        _ => actual == expected,
    };
    if equal {
        return true;
    }
    match (options.timestamp_delta, key) {
        (Some(tolerance), Some(key)) if is_timestamp_field(key) => within_delta(actual, expected, tolerance),
        _ => false,
    }
}

fn within_delta(actual: &ShadowValue, expected: &ShadowValue, tolerance: Duration) -> bool {
    let instant = |value: &ShadowValue| match value {
        ShadowValue::Date(d) => Some(*d),
        ShadowValue::String(s) => parse_timestamp(s),
        _ => None,
    };
    match (instant(actual), instant(expected)) {
        (Some(a), Some(e)) => (a - e).num_milliseconds().unsigned_abs() <= tolerance.as_millis() as u64,
        _ => false,
    }
}
