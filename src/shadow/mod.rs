//! Shadow comparison harness
//!
//! Runs a primary and a candidate ("shadow") implementation of the same
//! operation, normalizes both results, reports structural differences and
//! keeps per-operation match metrics.
//!
//! Components:
//! - `value`: comparable value tree
//! - `normalize`: canonical form before diffing
//! - `diff`: path-addressed structural differ
//! - `comparator`: parity and production execution modes
//! - `metrics`: per-operation counters and latency percentiles
//! - `telemetry`: redacted, rate-limited mismatch records

pub mod comparator;
pub mod config;
pub mod diff;
pub mod error;
pub mod metrics;
pub mod normalize;
pub mod telemetry;
pub mod value;

pub use comparator::{
    compare_parity, compare_values, split_operation, ComparisonOutcome, Deadline, InvocationState,
    ParityOptions, ShadowComparator, ShadowExecution,
};
pub use config::{ShadowConfig, ShadowSettings, TelemetryConfig};
pub use diff::{find_differences, find_differences_at, DiffOptions, ROOT_PATH};
pub use error::{MismatchReport, ParityError, ShadowError};
pub use metrics::{LatencyStats, MetricSummary, MetricsExport, ShadowMetrics};
pub use normalize::{normalize, NormalizeOptions, TimestampMode};
pub use telemetry::{
    MismatchRecord, MismatchSink, MismatchTelemetry, PiiRedactor, RateLimitStats, SweeperHandle,
    TracingSink,
};
pub use value::ShadowValue;

use parking_lot::Mutex;
use serde::Serialize;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use tracing::{info, warn};

/// Process-wide harness: settings, registries, comparator and the sweeper task.
#[derive(Debug)]
pub struct ShadowRuntime {
    settings: ShadowSettings,
    metrics: Arc<ShadowMetrics>,
    telemetry: Arc<MismatchTelemetry>,
    comparator: ShadowComparator,
    sweeper: Mutex<Option<SweeperHandle>>,
}

impl ShadowRuntime {
    /// Build the harness and start the telemetry sweeper. Needs a tokio runtime.
    pub fn start(settings: ShadowSettings) -> Self {
        let telemetry = Arc::new(MismatchTelemetry::new(settings.telemetry.clone()));
        Self::start_with_telemetry(settings, telemetry)
    }

    /// Same as `start` with a caller-supplied telemetry (custom sink).
    pub fn start_with_telemetry(settings: ShadowSettings, telemetry: Arc<MismatchTelemetry>) -> Self {
        let metrics = Arc::new(ShadowMetrics::new());
        let comparator = ShadowComparator::new(metrics.clone(), telemetry.clone());
        let sweeper = telemetry.spawn_sweeper();

        info!(
            default_enabled = settings.defaults.enabled,
            default_sample_rate = settings.defaults.sample_rate,
            operations = settings.operations.len(),
            "Shadow runtime started"
        );

        Self {
            settings,
            metrics,
            telemetry,
            comparator,
            sweeper: Mutex::new(Some(sweeper)),
        }
    }

    pub fn settings(&self) -> &ShadowSettings {
        &self.settings
    }

    pub fn metrics(&self) -> &Arc<ShadowMetrics> {
        &self.metrics
    }

    pub fn telemetry(&self) -> &Arc<MismatchTelemetry> {
        &self.telemetry
    }

    pub fn comparator(&self) -> &ShadowComparator {
        &self.comparator
    }

    /// Production-mode execution using the configured settings for `name`.
    pub async fn execute<T, U, E, SE, P, PF, S, SF>(&self, name: &str, primary: P, shadow: S) -> Result<T, E>
    where
        T: Serialize,
        U: Serialize,
        E: From<ShadowError>,
        SE: Display,
        P: FnOnce() -> PF,
        PF: Future<Output = Result<T, E>>,
        S: FnOnce() -> SF,
        SF: Future<Output = Result<U, SE>>,
    {
        let config = self.settings.config_for(name);
        self.comparator.execute(name, &config, primary, shadow).await
    }

    /// Stop the sweeper and write the final export when a path is configured.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        let sweeper = self.sweeper.lock().take();
        if let Some(sweeper) = sweeper {
            sweeper.shutdown().await;
        }

        if let Some(path) = &self.settings.export_path {
            match self.metrics.export_metrics(Some(path)) {
                Ok(_) => info!(path = %path.display(), "Wrote final shadow metrics export"),
                Err(e) => {
                    warn!(path = %path.display(), "Final shadow metrics export failed: {}", e);
                    return Err(e);
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_runtime_uses_operation_config() {
        let mut settings = ShadowSettings::default();
        settings.defaults.enabled = false;
        settings.set_operation("tasks.get", ShadowConfig::always());
        let runtime = ShadowRuntime::start(settings);

        let value: anyhow::Result<_> = runtime
            .execute("tasks.get", || async { Ok(json!({"id": 1})) }, || async {
                Ok::<_, anyhow::Error>(json!({"id": 1}))
            })
            .await;
        assert_eq!(value.unwrap(), json!({"id": 1}));

        let other: anyhow::Result<_> = runtime
            .execute("tasks.list", || async { Ok(json!([])) }, || async {
                Ok::<_, anyhow::Error>(json!([]))
            })
            .await;
        assert!(other.is_ok());

        assert_eq!(runtime.metrics().get_summary("tasks.get").unwrap().matches, 1);
        assert!(runtime.metrics().get_summary("tasks.list").is_none());

        runtime.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_writes_export() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("export.json");
        let settings = ShadowSettings {
            export_path: Some(path.clone()),
            ..Default::default()
        };
        let runtime = ShadowRuntime::start(settings);
        runtime.metrics().record_comparison("auth.login", true, 1.0, 2.0, 0);

        runtime.shutdown().await.unwrap();
        // Second shutdown is a no-op for the sweeper
        runtime.shutdown().await.unwrap();

        let export: MetricsExport = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(export.total_comparisons, 1);
        assert_eq!(export.summaries[0].name, "auth.login");
    }
}
