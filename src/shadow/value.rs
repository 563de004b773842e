//! JSON-like value tree compared by the shadow harness.
//!
//! Business payloads arrive from two different data access paths (raw SQL rows
//! and ORM models), so the tree keeps the few representational variants that
//! matter for canonicalisation: explicit `Undefined`, 64-bit integers and
//! native timestamps.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;

/// A JSON-like value produced by either side of a comparison.
#[derive(Debug, Clone, PartialEq)]
pub enum ShadowValue {
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    /// Wide integer as returned by drivers for BIGINT columns
    BigInt(i64),
    String(String),
    Date(DateTime<Utc>),
    Array(Vec<ShadowValue>),
    Object(BTreeMap<String, ShadowValue>),
}

impl ShadowValue {
    /// Convert any serializable payload into a value tree.
    pub fn from_serialize<T: Serialize + ?Sized>(value: &T) -> Result<Self, serde_json::Error> {
        serde_json::to_value(value).map(Self::from)
    }

    /// `null` and `undefined` are both "absent".
    pub fn is_absent(&self) -> bool {
        matches!(self, Self::Undefined | Self::Null)
    }

    /// Runtime type name used in discrepancy messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Undefined => "undefined",
            Self::Null => "null",
            Self::Bool(_) => "boolean",
            Self::Number(_) => "number",
            Self::BigInt(_) => "bigint",
            Self::String(_) => "string",
            Self::Date(_) => "date",
            Self::Array(_) => "array",
            Self::Object(_) => "object",
        }
    }

    pub fn as_object(&self) -> Option<&BTreeMap<String, ShadowValue>> {
        match self {
            Self::Object(map) => Some(map),
            _ => None,
        }
    }

    /// Look up a dotted key path (`user.id`) through nested objects.
    pub fn get_path(&self, path: &str) -> Option<&ShadowValue> {
        path.split('.').try_fold(self, |current, key| current.as_object()?.get(key))
    }

    /// Build an object from `(key, value)` pairs.
    pub fn object<K, I>(entries: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, ShadowValue)>,
    {
        Self::Object(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

/// Render a date the way the JS-facing APIs do (`2024-01-01T00:00:00.000Z`).
pub fn iso_string(date: &DateTime<Utc>) -> String {
    date.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn fmt_number(n: f64, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    if n.is_nan() {
        write!(f, "NaN")
    } else if n.is_infinite() {
        write!(f, "{}", if n > 0.0 { "Infinity" } else { "-Infinity" })
    } else if n.fract() == 0.0 && n.abs() < 1e15 {
        write!(f, "{}", n as i64)
    } else {
        write!(f, "{}", n)
    }
}

fn fmt_quoted(s: &str, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match serde_json::to_string(s) {
        Ok(quoted) => f.write_str(&quoted),
        Err(_) => write!(f, "\"{}\"", s),
    }
}

/// JSON-like rendering: strings quoted, `undefined` spelled out.
impl fmt::Display for ShadowValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Undefined => f.write_str("undefined"),
            Self::Null => f.write_str("null"),
            Self::Bool(b) => write!(f, "{}", b),
            Self::Number(n) => fmt_number(*n, f),
            Self::BigInt(i) => write!(f, "{}n", i),
            Self::String(s) => fmt_quoted(s, f),
            Self::Date(d) => fmt_quoted(&iso_string(d), f),
            Self::Array(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{}", item)?;
                }
                f.write_str("]")
            }
            Self::Object(map) => {
                f.write_str("{")?;
                for (i, (key, value)) in map.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    fmt_quoted(key, f)?;
                    write!(f, ":{}", value)?;
                }
                f.write_str("}")
            }
        }
    }
}

impl Serialize for ShadowValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Undefined | Self::Null => serializer.serialize_none(),
            Self::Bool(b) => serializer.serialize_bool(*b),
            Self::Number(n) => {
                if n.fract() == 0.0 && n.abs() < 9_007_199_254_740_992.0 {
                    serializer.serialize_i64(*n as i64)
                } else {
                    serializer.serialize_f64(*n)
                }
            }
            Self::BigInt(i) => serializer.serialize_i64(*i),
            Self::String(s) => serializer.serialize_str(s),
            Self::Date(d) => serializer.serialize_str(&iso_string(d)),
            Self::Array(items) => items.serialize(serializer),
            Self::Object(map) => map.serialize(serializer),
        }
    }
}

impl From<serde_json::Value> for ShadowValue {
    fn from(value: serde_json::Value) -> Self {
        use serde_json::Value;
        match value {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Bool(b),
            Value::Number(n) => match n.as_i64() {
                // Integers beyond 2^53 keep their exact value until normalization narrows them
                Some(i) if i.unsigned_abs() > (1u64 << 53) => Self::BigInt(i),
                _ => Self::Number(n.as_f64().unwrap_or(f64::NAN)),
            },
            Value::String(s) => Self::String(s),
            Value::Array(items) => Self::Array(items.into_iter().map(Self::from).collect()),
            Value::Object(map) => Self::Object(map.into_iter().map(|(k, v)| (k, Self::from(v))).collect()),
        }
    }
}

impl From<&ShadowValue> for serde_json::Value {
    fn from(value: &ShadowValue) -> Self {
        serde_json::to_value(value).unwrap_or(serde_json::Value::Null)
    }
}

impl From<bool> for ShadowValue {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<f64> for ShadowValue {
    fn from(n: f64) -> Self {
        Self::Number(n)
    }
}

impl From<i32> for ShadowValue {
    fn from(n: i32) -> Self {
        Self::Number(n as f64)
    }
}

impl From<i64> for ShadowValue {
    fn from(n: i64) -> Self {
        Self::BigInt(n)
    }
}

impl From<&str> for ShadowValue {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for ShadowValue {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<DateTime<Utc>> for ShadowValue {
    fn from(d: DateTime<Utc>) -> Self {
        Self::Date(d)
    }
}

impl<T: Into<ShadowValue>> From<Vec<T>> for ShadowValue {
    fn from(items: Vec<T>) -> Self {
        Self::Array(items.into_iter().map(Into::into).collect())
    }
}
