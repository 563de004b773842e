//! Value canonicalisation ahead of a structural diff.
//!
//! Two data access paths frequently disagree on representation only: a native
//! datetime versus its serialized string, a BIGINT versus a plain number, a
//! `NULL` column versus an absent property, rows returned in engine-specific
//! order. `normalize` folds those differences away so the differ only sees
//! semantic divergence.
//!
//! Timestamp tolerance is a quantization step, not a distance check: with
//! `timestamp_tolerance_ms >= 1000` both sides are truncated to whole seconds,
//! so `00:00:00.999` and `00:00:01.001` still differ even though they are 2ms
//! apart. `TimestampMode::Delta` exists for call sites that need a real
//! tolerance; it moves the check into the differ.

use chrono::{DateTime, NaiveDateTime, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use super::diff::DiffOptions;
use super::value::{iso_string, ShadowValue};

/// How `timestamp_tolerance_ms` is applied to timestamp-named fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimestampMode {
    /// Drop sub-second precision when the tolerance is at least one second
    #[default]
    Truncate,
    /// Keep full precision; the differ accepts leaves within the tolerance
    Delta,
}

/// Options controlling canonicalisation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NormalizeOptions {
    /// Key paths used to order every array, compared left to right
    pub sort_arrays_by: Vec<String>,
    /// Keys dropped from every object (auto-increment counters, versions)
    pub remove_fields: BTreeSet<String>,
    /// Tolerance for timestamp-named fields, in milliseconds
    pub timestamp_tolerance_ms: Option<u64>,
    pub timestamp_mode: TimestampMode,
    pub treat_null_as_undefined: bool,
    /// Fixed number of decimal digits for numeric leaves
    pub round_decimals: Option<u32>,
}

impl NormalizeOptions {
    pub fn sort_by(mut self, key: impl Into<String>) -> Self {
        self.sort_arrays_by.push(key.into());
        self
    }

    pub fn remove_field(mut self, key: impl Into<String>) -> Self {
        self.remove_fields.insert(key.into());
        self
    }

    pub fn timestamp_tolerance(mut self, tolerance_ms: u64) -> Self {
        self.timestamp_tolerance_ms = Some(tolerance_ms);
        self
    }

    /// Differ settings implied by these options.
    pub fn diff_options(&self) -> DiffOptions {
        DiffOptions {
            timestamp_delta: match (self.timestamp_mode, self.timestamp_tolerance_ms) {
                (TimestampMode::Delta, Some(ms)) => Some(Duration::from_millis(ms)),
                _ => None,
            },
        }
    }

    fn truncates_subseconds(&self) -> bool {
        self.timestamp_mode == TimestampMode::Truncate
            && self.timestamp_tolerance_ms.map_or(false, |ms| ms >= 1000)
    }
}

/// True for keys whose values are treated as timestamps.
pub fn is_timestamp_field(key: &str) -> bool {
    let key = key.to_ascii_lowercase();
    matches!(key.as_str(), "created_at" | "updated_at" | "deleted_at")
        || key.ends_with("_date")
        || key.ends_with("_time")
        || key.ends_with("timestamp")
}

/// Parse the timestamp encodings produced by the two data paths.
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Some(ts.with_timezone(&Utc));
    }
    ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .map(|naive| Utc.from_utc_datetime(&naive))
}

/// Canonicalise a value tree. Pure and total.
pub fn normalize(value: &ShadowValue, options: &NormalizeOptions) -> ShadowValue {
    match value {
        ShadowValue::Null if options.treat_null_as_undefined => ShadowValue::Undefined,
        ShadowValue::Null => ShadowValue::Null,
        ShadowValue::Undefined => ShadowValue::Undefined,
        ShadowValue::BigInt(i) => round_number(*i as f64, options),
        ShadowValue::Number(n) => round_number(*n, options),
        ShadowValue::Date(d) => ShadowValue::String(iso_string(d)),
        // Serialized datetimes arrive as strings in whatever precision the encoder chose
        ShadowValue::String(s) => match DateTime::parse_from_rfc3339(s) {
            Ok(ts) => ShadowValue::String(iso_string(&ts.with_timezone(&Utc))),
            Err(_) => ShadowValue::String(s.clone()),
        },
        ShadowValue::Array(items) => {
            let mut items: Vec<ShadowValue> = items.iter().map(|item| normalize(item, options)).collect();
            if !options.sort_arrays_by.is_empty() {
                // Sort keys are compared after element normalization
                items.sort_by(|a, b| compare_by_keys(a, b, &options.sort_arrays_by));
            }
            ShadowValue::Array(items)
        }
        ShadowValue::Object(map) => {
            let normalized: BTreeMap<String, ShadowValue> = map
                .iter()
                .filter(|(key, _)| !options.remove_fields.contains(key.as_str()))
                .map(|(key, value)| {
                    let mut value = normalize(value, options);
                    if is_timestamp_field(key) {
                        value = normalize_timestamp(value, options);
                    }
                    (key.clone(), value)
                })
                .collect();
            ShadowValue::Object(normalized)
        }
        other => other.clone(),
    }
}

fn round_number(n: f64, options: &NormalizeOptions) -> ShadowValue {
    let Some(digits) = options.round_decimals else {
        return ShadowValue::Number(n);
    };
    let factor = 10f64.powi(digits as i32);
    let rounded = (n * factor).round() / factor;
    ShadowValue::Number(if rounded.is_finite() { rounded } else { n })
}

fn normalize_timestamp(value: ShadowValue, options: &NormalizeOptions) -> ShadowValue {
    let parsed = match &value {
        ShadowValue::Date(d) => Some(*d),
        ShadowValue::String(s) => parse_timestamp(s),
        _ => None,
    };
    let Some(mut ts) = parsed else {
        return value;
    };
    if options.truncates_subseconds() {
        ts = ts.with_nanosecond(0).unwrap_or(ts);
    }
    ShadowValue::String(iso_string(&ts))
}

fn kind_rank(value: Option<&ShadowValue>) -> u8 {
    match value {
        None | Some(ShadowValue::Undefined) | Some(ShadowValue::Null) => 0,
        Some(ShadowValue::Bool(_)) => 1,
        Some(ShadowValue::Number(_)) | Some(ShadowValue::BigInt(_)) => 2,
        Some(ShadowValue::String(_)) | Some(ShadowValue::Date(_)) => 3,
        Some(ShadowValue::Array(_)) | Some(ShadowValue::Object(_)) => 4,
    }
}

fn as_f64(value: &ShadowValue) -> f64 {
    match value {
        ShadowValue::Number(n) => *n,
        ShadowValue::BigInt(i) => *i as f64,
        _ => f64::NAN,
    }
}

fn compare_sort_values(a: Option<&ShadowValue>, b: Option<&ShadowValue>) -> Ordering {
    let rank = kind_rank(a).cmp(&kind_rank(b));
    if rank != Ordering::Equal {
        return rank;
    }
    match (a, b) {
        (Some(ShadowValue::Bool(x)), Some(ShadowValue::Bool(y))) => x.cmp(y),
        (Some(x), Some(y)) if kind_rank(a) == 2 => {
            as_f64(x).partial_cmp(&as_f64(y)).unwrap_or(Ordering::Equal)
        }
        (Some(x), Some(y)) if kind_rank(a) >= 3 => sort_text(x).cmp(&sort_text(y)),
        _ => Ordering::Equal,
    }
}

fn sort_text(value: &ShadowValue) -> String {
    match value {
        ShadowValue::String(s) => s.clone(),
        ShadowValue::Date(d) => iso_string(d),
        other => other.to_string(),
    }
}

fn compare_by_keys(a: &ShadowValue, b: &ShadowValue, keys: &[String]) -> Ordering {
    keys.iter()
        .map(|key| compare_sort_values(a.get_path(key), b.get_path(key)))
        .find(|ord| *ord != Ordering::Equal)
        .unwrap_or(Ordering::Equal)
}
