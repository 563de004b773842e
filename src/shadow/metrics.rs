//! Shadow comparison metrics registry
//!
//! One record per named operation, created on first touch and kept until an
//! explicit `reset`. Each record sits behind its own mutex so concurrent
//! invocations of different operations never contend, and every update holds
//! the lock for a single counter/list mutation.

use anyhow::Context;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

/// Accumulated counters and samples for one operation
#[derive(Debug, Default, Clone)]
struct MetricRecord {
    total_calls: u64,
    sampled_calls: u64,
    matches: u64,
    mismatches: u64,
    errors: u64,
    primary_latencies_ms: Vec<f64>,
    shadow_latencies_ms: Vec<f64>,
    /// diff count -> occurrences
    diff_histogram: BTreeMap<usize, u64>,
}

/// Percentile statistics over a latency sample list (milliseconds)
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LatencyStats {
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
    pub avg: f64,
    pub min: f64,
    pub max: f64,
}

impl LatencyStats {
    /// Sort the samples and index at `floor(n * p)`.
    pub fn from_samples(samples: &[f64]) -> Self {
        if samples.is_empty() {
            return Self::default();
        }
        let mut sorted = samples.to_vec();
        sorted.sort_by(|a, b| a.total_cmp(b));

        let at = |p: f64| {
            let idx = ((sorted.len() as f64) * p).floor() as usize;
            sorted[idx.min(sorted.len() - 1)]
        };

        Self {
            p50: at(0.50),
            p95: at(0.95),
            p99: at(0.99),
            avg: sorted.iter().sum::<f64>() / sorted.len() as f64,
            min: sorted[0],
            max: sorted[sorted.len() - 1],
        }
    }
}

/// Derived view of one operation. Field names are part of the export contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricSummary {
    pub name: String,
    pub total_calls: u64,
    pub sampled_calls: u64,
    pub matches: u64,
    pub mismatches: u64,
    pub errors: u64,
    pub sample_rate: f64,
    pub match_rate: f64,
    pub primary_latency: LatencyStats,
    pub shadow_latency: LatencyStats,
    /// avg(shadow) - avg(primary), 0 when either side has no samples
    pub latency_overhead: f64,
    pub diff_histogram: BTreeMap<usize, u64>,
}

impl MetricSummary {
    fn from_record(name: &str, record: &MetricRecord) -> Self {
        let primary_latency = LatencyStats::from_samples(&record.primary_latencies_ms);
        let shadow_latency = LatencyStats::from_samples(&record.shadow_latencies_ms);
        let latency_overhead =
            if record.primary_latencies_ms.is_empty() || record.shadow_latencies_ms.is_empty() {
                0.0
            } else {
                shadow_latency.avg - primary_latency.avg
            };

        Self {
            name: name.to_string(),
            total_calls: record.total_calls,
            sampled_calls: record.sampled_calls,
            matches: record.matches,
            mismatches: record.mismatches,
            errors: record.errors,
            sample_rate: ratio(record.sampled_calls, record.total_calls),
            match_rate: ratio(record.matches, record.sampled_calls),
            primary_latency,
            shadow_latency,
            latency_overhead,
            diff_histogram: record.diff_histogram.clone(),
        }
    }
}

fn ratio(numerator: u64, denominator: u64) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

/// JSON document consumed by dashboards
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsExport {
    pub timestamp: String,
    pub summaries: Vec<MetricSummary>,
    pub total_comparisons: u64,
    pub total_mismatches: u64,
    pub overall_match_rate: f64,
}

/// Named-operation metrics registry
#[derive(Debug, Default)]
pub struct ShadowMetrics {
    records: RwLock<HashMap<String, Arc<Mutex<MetricRecord>>>>,
}

impl ShadowMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, name: &str) -> Arc<Mutex<MetricRecord>> {
        if let Some(record) = self.records.read().get(name) {
            return record.clone();
        }
        self.records.write().entry(name.to_string()).or_default().clone()
    }

    /// Record a completed comparison (both paths succeeded).
    pub fn record_comparison(
        &self,
        name: &str,
        matched: bool,
        primary_ms: f64,
        shadow_ms: f64,
        diff_count: usize,
    ) {
        let record = self.record(name);
        let mut record = record.lock();
        record.total_calls += 1;
        record.sampled_calls += 1;
        if matched {
            record.matches += 1;
        } else {
            record.mismatches += 1;
        }
        record.primary_latencies_ms.push(primary_ms);
        record.shadow_latencies_ms.push(shadow_ms);
        *record.diff_histogram.entry(diff_count).or_insert(0) += 1;
    }

    /// Record a failed invocation.
    ///
    /// Primary errors count as a call but never reached the shadow path, so
    /// they bump `total_calls`. Shadow errors only happen after a successful
    /// sampled primary call, so they bump `sampled_calls` instead.
    pub fn record_error(&self, name: &str, is_shadow_error: bool) {
        let record = self.record(name);
        let mut record = record.lock();
        record.errors += 1;
        if is_shadow_error {
            record.sampled_calls += 1;
        } else {
            record.total_calls += 1;
        }
    }

    /// Record a call that was not selected for comparison.
    pub fn record_skipped(&self, name: &str) {
        self.record(name).lock().total_calls += 1;
    }

    pub fn get_summary(&self, name: &str) -> Option<MetricSummary> {
        let record = self.records.read().get(name).cloned()?;
        let snapshot = record.lock().clone();
        Some(MetricSummary::from_record(name, &snapshot))
    }

    /// Summaries for every operation, ordered by name.
    pub fn get_all_summaries(&self) -> Vec<MetricSummary> {
        let records: Vec<(String, Arc<Mutex<MetricRecord>>)> = self
            .records
            .read()
            .iter()
            .map(|(name, record)| (name.clone(), record.clone()))
            .collect();

        let mut summaries: Vec<MetricSummary> = records
            .into_iter()
            .map(|(name, record)| {
                let snapshot = record.lock().clone();
                MetricSummary::from_record(&name, &snapshot)
            })
            .collect();
        summaries.sort_by(|a, b| a.name.cmp(&b.name));
        summaries
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.records.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Clear one operation's record, or all of them.
    ///
    /// The record is detached, not zeroed: an update already holding the old
    /// record when the reset lands is dropped with it. Later updates start a
    /// fresh record.
    pub fn reset(&self, name: Option<&str>) {
        let mut records = self.records.write();
        match name {
            Some(name) => {
                records.remove(name);
            }
            None => records.clear(),
        }
    }

    pub fn snapshot(&self) -> MetricsExport {
        let summaries = self.get_all_summaries();
        let total_matches: u64 = summaries.iter().map(|s| s.matches).sum();
        let total_mismatches: u64 = summaries.iter().map(|s| s.mismatches).sum();
        let total_comparisons = total_matches + total_mismatches;

        MetricsExport {
            timestamp: Utc::now().to_rfc3339(),
            summaries,
            total_comparisons,
            total_mismatches,
            overall_match_rate: ratio(total_matches, total_comparisons),
        }
    }

    /// Serialize all summaries to JSON, optionally writing them to `path`.
    pub fn export_metrics(&self, path: Option<&Path>) -> anyhow::Result<String> {
        let json = serde_json::to_string_pretty(&self.snapshot())?;
        if let Some(path) = path {
            std::fs::write(path, &json)
                .with_context(|| format!("Failed to write metrics export to {}", path.display()))?;
            tracing::info!(path = %path.display(), "Shadow metrics exported");
        }
        Ok(json)
    }

    /// Export in Prometheus text format
    pub fn to_prometheus(&self) -> String {
        let mut output = String::new();
        let summaries = self.get_all_summaries();

        let counters: [(&str, &str, fn(&MetricSummary) -> u64); 5] = [
            ("shadow_compare_calls_total", "Calls through the comparator", |s| s.total_calls),
            ("shadow_compare_sampled_total", "Calls selected for comparison", |s| s.sampled_calls),
            ("shadow_compare_matches_total", "Comparisons with equivalent output", |s| s.matches),
            ("shadow_compare_mismatches_total", "Comparisons with divergent output", |s| s.mismatches),
            ("shadow_compare_errors_total", "Primary or shadow failures", |s| s.errors),
        ];

        for (metric, help, value) in counters {
            output.push_str(&format!("# HELP {} {}\n# TYPE {} counter\n", metric, help, metric));
            for summary in &summaries {
                output.push_str(&format!("{}{{operation=\"{}\"}} {}\n", metric, summary.name, value(summary)));
            }
        }

        output.push_str("# HELP shadow_compare_latency_ms Execution latency per path\n");
        output.push_str("# TYPE shadow_compare_latency_ms summary\n");
        for summary in &summaries {
            for (path, stats) in [("primary", &summary.primary_latency), ("shadow", &summary.shadow_latency)] {
                for (quantile, value) in [("0.5", stats.p50), ("0.95", stats.p95), ("0.99", stats.p99)] {
                    output.push_str(&format!(
                        "shadow_compare_latency_ms{{operation=\"{}\",path=\"{}\",quantile=\"{}\"}} {}\n",
                        summary.name, path, quantile, value
                    ));
                }
            }
        }

        output
    }
}
