//! Mismatch telemetry.
//!
//! Mismatch payloads are business records, so every record is redacted before
//! it leaves the process. Repeated mismatches on the same signature
//! (`module:operation[:field]`) are rate limited with a per-signature window
//! so a systematic divergence cannot flood the log pipeline.

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::config::TelemetryConfig;
use super::value::ShadowValue;

/// Replacement for redacted values
pub const REDACTED: &str = "[REDACTED]";

/// Key substrings that mark a field as personally identifying (case-insensitive)
pub const DEFAULT_PII_FIELDS: &[&str] = &[
    "email",
    "password",
    "phone",
    "mobile",
    "ssn",
    "social_security",
    "card",
    "cvv",
    "token",
    "secret",
    "api_key",
    "apikey",
    "address",
    "zip",
    "postal",
    "ip_address",
    "ipaddress",
    "client_ip",
    "remote_ip",
    "session_id",
    "sessionid",
    "date_of_birth",
    "dob",
];

/// Redaction denylist: the built-in substrings plus caller extensions.
#[derive(Debug, Clone)]
pub struct PiiRedactor {
    fields: Vec<String>,
}

impl Default for PiiRedactor {
    fn default() -> Self {
        Self {
            fields: DEFAULT_PII_FIELDS.iter().map(|f| f.to_string()).collect(),
        }
    }
}

impl PiiRedactor {
    pub fn with_extra<S: AsRef<str>>(extra: &[S]) -> Self {
        let mut redactor = Self::default();
        redactor.extend(extra);
        redactor
    }

    pub fn extend<S: AsRef<str>>(&mut self, extra: &[S]) {
        for field in extra {
            let field = field.as_ref().to_ascii_lowercase();
            if !field.is_empty() && !self.fields.contains(&field) {
                self.fields.push(field);
            }
        }
    }

    pub fn is_pii(&self, key: &str) -> bool {
        let key = key.to_ascii_lowercase();
        self.fields.iter().any(|field| key.contains(field.as_str()))
    }

    /// Replace PII-named fields, recursing into objects and arrays.
    pub fn redact(&self, value: &ShadowValue) -> ShadowValue {
        match value {
            ShadowValue::Object(map) => ShadowValue::Object(
                map.iter()
                    .map(|(key, value)| {
                        let value = if self.is_pii(key) {
                            ShadowValue::String(REDACTED.to_string())
                        } else {
                            self.redact(value)
                        };
                        (key.clone(), value)
                    })
                    .collect(),
            ),
            ShadowValue::Array(items) => ShadowValue::Array(items.iter().map(|item| self.redact(item)).collect()),
            other => other.clone(),
        }
    }

    /// Hide the rendered values of a discrepancy whose path touches a PII field
    /// or whose rendered subtree carries a PII-named key.
    pub fn redact_diff(&self, diff: &str) -> String {
        let (path, detail) = diff.split_once(": ").unwrap_or((diff, ""));
        let touches_pii = path
            .split(|c| c == '.' || c == '[')
            .any(|segment| !segment.is_empty() && self.is_pii(segment.trim_end_matches(']')));
        if touches_pii || rendered_keys(detail).any(|key| self.is_pii(&key)) {
            format!("{}: {}", path, REDACTED)
        } else {
            diff.to_string()
        }
    }
}

/// Object keys in a JSON-like rendering: every quoted token followed by `:`.
fn rendered_keys(rendered: &str) -> impl Iterator<Item = String> + '_ {
    let mut chars = rendered.chars().peekable();
    std::iter::from_fn(move || {
        while let Some(c) = chars.next() {
            if c != '"' {
                continue;
            }
            let mut token = String::new();
            while let Some(c) = chars.next() {
                match c {
                    '\\' => {
                        if let Some(escaped) = chars.next() {
                            token.push(escaped);
                        }
                    }
                    '"' => break,
                    other => token.push(other),
                }
            }
            if chars.peek() == Some(&':') {
                return Some(token);
            }
        }
        None
    })
}

/// One emitted mismatch record
#[derive(Debug, Clone, Serialize)]
pub struct MismatchRecord {
    pub comparison_id: Uuid,
    pub timestamp: String,
    pub signature: String,
    pub module: String,
    pub operation: String,
    pub field: Option<String>,
    pub primary: ShadowValue,
    pub shadow: ShadowValue,
    pub diff: Vec<String>,
    pub context: Option<ShadowValue>,
    /// Occurrences of this signature in the current window, including this one
    pub window_count: u32,
}

/// Destination for mismatch records.
pub trait MismatchSink: Send + Sync {
    fn emit(&self, record: &MismatchRecord) -> anyhow::Result<()>;
}

/// Default sink: structured WARN event under `shadow_compare::mismatch`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl MismatchSink for TracingSink {
    fn emit(&self, record: &MismatchRecord) -> anyhow::Result<()> {
        let primary = serde_json::to_string(&record.primary)?;
        let shadow = serde_json::to_string(&record.shadow)?;
        let context = match &record.context {
            Some(context) => serde_json::to_string(context)?,
            None => String::new(),
        };
        warn!(
            target: "shadow_compare::mismatch",
            comparison_id = %record.comparison_id,
            signature = %record.signature,
            module = %record.module,
            operation = %record.operation,
            field = record.field.as_deref().unwrap_or(""),
            diff_count = record.diff.len(),
            window_count = record.window_count,
            diff = ?record.diff,
            primary = %primary,
            shadow = %shadow,
            context = %context,
            "Shadow comparison mismatch"
        );
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
struct RateLimitEntry {
    count: u32,
    first_seen: Instant,
    last_seen: Instant,
}

/// Rate limiter decision for one mismatch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Log { window_count: u32 },
    Suppressed { window_count: u32 },
}

/// Operational view of the rate limiter
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RateLimitStats {
    pub active_signatures: usize,
    /// Mismatches currently suppressed across live windows
    pub suppressed_estimate: u64,
    /// Mismatches suppressed since start
    pub total_suppressed: u64,
    pub total_logged: u64,
}

/// Redacting, rate-limited mismatch logger
pub struct MismatchTelemetry {
    config: TelemetryConfig,
    redactor: PiiRedactor,
    entries: Mutex<HashMap<String, RateLimitEntry>>,
    sink: Box<dyn MismatchSink>,
    total_logged: AtomicU64,
    total_suppressed: AtomicU64,
}

impl std::fmt::Debug for MismatchTelemetry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MismatchTelemetry")
            .field("config", &self.config)
            .field("active_signatures", &self.entries.lock().len())
            .finish()
    }
}

impl Default for MismatchTelemetry {
    fn default() -> Self {
        Self::new(TelemetryConfig::default())
    }
}

impl MismatchTelemetry {
    pub fn new(config: TelemetryConfig) -> Self {
        Self::with_sink(config, Box::new(TracingSink))
    }

    pub fn with_sink(config: TelemetryConfig, sink: Box<dyn MismatchSink>) -> Self {
        let redactor = PiiRedactor::with_extra(&config.pii_fields);
        Self {
            config,
            redactor,
            entries: Mutex::new(HashMap::new()),
            sink,
            total_logged: AtomicU64::new(0),
            total_suppressed: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &TelemetryConfig {
        &self.config
    }

    /// Count a mismatch on `signature` and decide whether it may be logged.
    pub fn check(&self, signature: &str) -> RateDecision {
        self.check_at(signature, Instant::now())
    }

    pub fn check_at(&self, signature: &str, now: Instant) -> RateDecision {
        let window = self.config.window();
        let mut entries = self.entries.lock();

        let entry = entries.entry(signature.to_string()).or_insert(RateLimitEntry {
            count: 0,
            first_seen: now,
            last_seen: now,
        });

        // Roll the window over once it has fully elapsed
        if now.saturating_duration_since(entry.first_seen) > window {
            entry.count = 0;
            entry.first_seen = now;
        }

        entry.count += 1;
        entry.last_seen = now;

        if entry.count <= self.config.max_logs_per_window {
            RateDecision::Log { window_count: entry.count }
        } else {
            RateDecision::Suppressed { window_count: entry.count }
        }
    }

    /// Drop signatures not seen for twice the window.
    pub fn cleanup(&self) -> usize {
        self.cleanup_at(Instant::now())
    }

    pub fn cleanup_at(&self, now: Instant) -> usize {
        let stale_after = self.config.window() * 2;
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| now.saturating_duration_since(entry.last_seen) <= stale_after);
        before - entries.len()
    }

    pub fn get_rate_limit_stats(&self) -> RateLimitStats {
        let max = self.config.max_logs_per_window;
        let entries = self.entries.lock();
        RateLimitStats {
            active_signatures: entries.len(),
            suppressed_estimate: entries
                .values()
                .map(|entry| entry.count.saturating_sub(max) as u64)
                .sum(),
            total_suppressed: self.total_suppressed.load(Ordering::Relaxed),
            total_logged: self.total_logged.load(Ordering::Relaxed),
        }
    }

    /// Log a whole-result mismatch for `module:operation`.
    pub fn log_mismatch(
        &self,
        module: &str,
        operation: &str,
        primary: &ShadowValue,
        shadow: &ShadowValue,
        diff: Option<&[String]>,
        context: Option<&ShadowValue>,
    ) -> bool {
        self.log_with(module, operation, None, primary, shadow, diff, context, &[] as &[String])
    }

    /// Log a single-field mismatch for `module:operation:field`.
    pub fn log_field_mismatch(
        &self,
        module: &str,
        operation: &str,
        field: &str,
        primary: &ShadowValue,
        shadow: &ShadowValue,
        context: Option<&ShadowValue>,
    ) -> bool {
        self.log_with(module, operation, Some(field), primary, shadow, None, context, &[] as &[String])
    }

    /// Full entry point: optional field, diff, context and call-site PII keys.
    /// Returns whether a record was emitted.
    #[allow(clippy::too_many_arguments)]
    pub fn log_with<S: AsRef<str>>(
        &self,
        module: &str,
        operation: &str,
        field: Option<&str>,
        primary: &ShadowValue,
        shadow: &ShadowValue,
        diff: Option<&[String]>,
        context: Option<&ShadowValue>,
        extra_pii: &[S],
    ) -> bool {
        let signature = match field {
            Some(field) => format!("{}:{}:{}", module, operation, field),
            None => format!("{}:{}", module, operation),
        };

        let window_count = match self.check(&signature) {
            RateDecision::Log { window_count } => window_count,
            RateDecision::Suppressed { window_count } => {
                self.total_suppressed.fetch_add(1, Ordering::Relaxed);
                debug!(signature = %signature, window_count, "Mismatch log suppressed");
                return false;
            }
        };

        let redactor = if extra_pii.is_empty() {
            std::borrow::Cow::Borrowed(&self.redactor)
        } else {
            let mut redactor = self.redactor.clone();
            redactor.extend(extra_pii);
            std::borrow::Cow::Owned(redactor)
        };

        let record = MismatchRecord {
            comparison_id: Uuid::new_v4(),
            timestamp: Utc::now().to_rfc3339(),
            signature,
            module: module.to_string(),
            operation: operation.to_string(),
            field: field.map(str::to_string),
            primary: redactor.redact(primary),
            shadow: redactor.redact(shadow),
            diff: diff
                .unwrap_or_default()
                .iter()
                .map(|d| redactor.redact_diff(d))
                .collect(),
            context: context.map(|c| redactor.redact(c)),
            window_count,
        };

        match self.sink.emit(&record) {
            Ok(()) => {
                self.total_logged.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(e) => {
                // Telemetry is best-effort
                debug!(signature = %record.signature, "Mismatch sink failed: {}", e);
                false
            }
        }
    }

    /// Start the periodic sweep on the current tokio runtime.
    pub fn spawn_sweeper(self: &Arc<Self>) -> SweeperHandle {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let telemetry = Arc::clone(self);
        let period = self.config.cleanup_interval();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // First tick fires immediately
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let evicted = telemetry.cleanup();
                        if evicted > 0 {
                            debug!(evicted, "Evicted stale mismatch signatures");
                        }
                    }
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        });

        info!(interval_secs = period.as_secs(), "Mismatch signature sweeper started");
        SweeperHandle { stop_tx, task }
    }
}

/// Owner of the background sweep task.
#[derive(Debug)]
pub struct SweeperHandle {
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SweeperHandle {
    /// Stop the sweeper and wait for it to exit.
    pub async fn shutdown(self) {
        let _ = self.stop_tx.send(true);
        if let Err(e) = self.task.await {
            warn!("Sweeper task ended abnormally: {}", e);
        }
    }
}

/// In-memory sink that keeps every record, for embedders that surface
/// mismatches themselves instead of through the log pipeline.
#[derive(Debug, Default, Clone)]
pub struct CollectingSink {
    records: Arc<Mutex<Vec<MismatchRecord>>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<MismatchRecord> {
        self.records.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

impl MismatchSink for CollectingSink {
    fn emit(&self, record: &MismatchRecord) -> anyhow::Result<()> {
        self.records.lock().push(record.clone());
        Ok(())
    }
}
