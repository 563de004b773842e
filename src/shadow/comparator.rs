//! Dual-path execution comparator.
//!
//! Two modes share the same normalize + diff core:
//!
//! - **Parity mode** (`compare_parity`): both implementations run concurrently
//!   and any failure surfaces immediately. Only for side-effect-free fixtures.
//! - **Production shadow mode** (`ShadowComparator::execute`): the primary
//!   path always runs to completion first; the shadow path runs afterwards
//!   under a hard deadline and can never change what the caller observes.
//!
//! Per-invocation flow in production mode:
//!
//! ```text
//! NOT_SAMPLED -> DONE
//! SAMPLED -> PRIMARY_OK -> SHADOW_OK -> {MATCHED, MISMATCHED} -> DONE
//! SAMPLED -> PRIMARY_OK -> SHADOW_ERROR -> DONE
//! SAMPLED -> PRIMARY_ERROR -> DONE (propagates)
//! ```

use rand::Rng;
use serde::Serialize;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::config::ShadowConfig;
use super::diff::{find_differences_with, ROOT_PATH};
use super::error::{MismatchReport, ParityError, ShadowError};
use super::metrics::ShadowMetrics;
use super::normalize::{normalize, NormalizeOptions};
use super::telemetry::MismatchTelemetry;
use super::value::ShadowValue;

/// Result of comparing one primary/shadow pair
#[derive(Debug, Clone, PartialEq)]
pub struct ComparisonOutcome {
    /// Normalized primary output
    pub primary: ShadowValue,
    /// Normalized shadow output
    pub shadow: ShadowValue,
    pub diffs: Vec<String>,
    pub matched: bool,
    pub primary_duration: Duration,
    pub shadow_duration: Duration,
    pub sampled: bool,
    pub error: Option<String>,
}

/// Terminal state of a production invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationState {
    /// Shadow comparison switched off for the operation
    Disabled,
    NotSampled,
    Matched,
    Mismatched,
    ShadowFailed,
    PrimaryFailed,
}

/// Everything a production invocation produced. `result` is what the caller sees.
#[derive(Debug)]
pub struct ShadowExecution<T, E> {
    pub result: Result<T, E>,
    pub state: InvocationState,
    pub outcome: Option<ComparisonOutcome>,
}

/// Normalize both outputs and diff them (`actual` = primary, `expected` = shadow).
pub fn compare_values(
    primary: &ShadowValue,
    shadow: &ShadowValue,
    options: &NormalizeOptions,
) -> (ShadowValue, ShadowValue, Vec<String>) {
    let primary = normalize(primary, options);
    let shadow = normalize(shadow, options);
    let mut diffs = Vec::new();
    find_differences_with(&primary, &shadow, ROOT_PATH, &options.diff_options(), &mut diffs);
    (primary, shadow, diffs)
}

/// Split `module.operation`; names without a dot belong to the `default` module.
pub fn split_operation(name: &str) -> (&str, &str) {
    name.split_once('.').unwrap_or(("default", name))
}

/// Hard deadline for the shadow path.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    at: Instant,
    budget: Duration,
}

impl Deadline {
    pub fn after(budget: Duration) -> Self {
        Self {
            at: Instant::now() + budget,
            budget,
        }
    }

    pub fn budget(&self) -> Duration {
        self.budget
    }

    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }

    /// Race `fut` against the deadline. `None` means the deadline won.
    pub async fn run<F: Future>(&self, fut: F) -> Option<F::Output> {
        tokio::time::timeout_at(self.at, fut).await.ok()
    }
}

/// Parity-mode settings
#[derive(Debug, Clone, Default)]
pub struct ParityOptions {
    /// Fail with a `MismatchReport` instead of returning an unmatched outcome
    pub throw_on_mismatch: bool,
    pub normalize: NormalizeOptions,
}

impl ParityOptions {
    pub fn strict(normalize: NormalizeOptions) -> Self {
        Self {
            throw_on_mismatch: true,
            normalize,
        }
    }
}

/// Run both implementations concurrently and compare their outputs.
///
/// Either side failing is a programmer error in this mode and is returned
/// immediately without comparison. Never use this for production writes.
pub async fn compare_parity<T, U, E, P, PF, S, SF>(
    operation: &str,
    primary: P,
    shadow: S,
    options: &ParityOptions,
) -> Result<ComparisonOutcome, ParityError<E>>
where
    T: Serialize,
    U: Serialize,
    P: FnOnce() -> PF,
    PF: Future<Output = Result<T, E>>,
    S: FnOnce() -> SF,
    SF: Future<Output = Result<U, E>>,
{
    let primary_fut = async {
        let start = Instant::now();
        let value = primary().await.map_err(ParityError::Primary)?;
        Ok::<_, ParityError<E>>((value, start.elapsed()))
    };
    let shadow_fut = async {
        let start = Instant::now();
        let value = shadow().await.map_err(ParityError::Shadow)?;
        Ok::<_, ParityError<E>>((value, start.elapsed()))
    };

    let ((primary_value, primary_duration), (shadow_value, shadow_duration)) =
        tokio::try_join!(primary_fut, shadow_fut)?;

    let primary_tree =
        ShadowValue::from_serialize(&primary_value).map_err(|e| ParityError::Conversion(e.to_string()))?;
    let shadow_tree =
        ShadowValue::from_serialize(&shadow_value).map_err(|e| ParityError::Conversion(e.to_string()))?;

    let (primary, shadow, diffs) = compare_values(&primary_tree, &shadow_tree, &options.normalize);
    let matched = diffs.is_empty();

    if !matched {
        let report = MismatchReport::new(operation, &diffs);
        if options.throw_on_mismatch {
            return Err(ParityError::Mismatch(report));
        }
        debug!(operation, diff_count = diffs.len(), "Parity mismatch:\n{}", report);
    }

    Ok(ComparisonOutcome {
        primary,
        shadow,
        diffs,
        matched,
        primary_duration,
        shadow_duration,
        sampled: true,
        error: None,
    })
}

/// Production shadow comparator. Cheap to clone; shares the registries.
#[derive(Debug, Clone)]
pub struct ShadowComparator {
    metrics: Arc<ShadowMetrics>,
    telemetry: Arc<MismatchTelemetry>,
}

impl ShadowComparator {
    pub fn new(metrics: Arc<ShadowMetrics>, telemetry: Arc<MismatchTelemetry>) -> Self {
        Self { metrics, telemetry }
    }

    pub fn metrics(&self) -> &Arc<ShadowMetrics> {
        &self.metrics
    }

    pub fn telemetry(&self) -> &Arc<MismatchTelemetry> {
        &self.telemetry
    }

    /// Bernoulli trial at the configured rate; 0 never samples, 1 always does.
    pub fn should_sample(config: &ShadowConfig) -> bool {
        let rate = config.effective_sample_rate();
        if rate <= 0.0 {
            false
        } else if rate >= 1.0 {
            true
        } else {
            rand::thread_rng().gen::<f64>() < rate
        }
    }

    /// Run `primary`, optionally shadowed by `shadow`, and return the primary's result.
    ///
    /// Shadow failures only reach the caller when `throw_on_error` is set.
    pub async fn execute<T, U, E, SE, P, PF, S, SF>(
        &self,
        name: &str,
        config: &ShadowConfig,
        primary: P,
        shadow: S,
    ) -> Result<T, E>
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
        self.execute_detailed(name, config, primary, shadow).await.result
    }

    /// Like `execute`, but also reports the terminal state and comparison outcome.
    pub async fn execute_detailed<T, U, E, SE, P, PF, S, SF>(
        &self,
        name: &str,
        config: &ShadowConfig,
        primary: P,
        shadow: S,
    ) -> ShadowExecution<T, E>
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
        if !config.enabled {
            return ShadowExecution {
                result: primary().await,
                state: InvocationState::Disabled,
                outcome: None,
            };
        }

        if !Self::should_sample(config) {
            self.metrics.record_skipped(name);
            return ShadowExecution {
                result: primary().await,
                state: InvocationState::NotSampled,
                outcome: None,
            };
        }

        // Primary runs to completion before the shadow path starts
        let primary_start = Instant::now();
        let primary_value = match primary().await {
            Ok(value) => value,
            Err(e) => {
                self.metrics.record_error(name, false);
                debug!(operation = name, "Primary path failed; shadow skipped");
                return ShadowExecution {
                    result: Err(e),
                    state: InvocationState::PrimaryFailed,
                    outcome: None,
                };
            }
        };
        let primary_duration = primary_start.elapsed();

        let shadow_start = Instant::now();
        let shadow_result = self.run_shadow(name, config, &primary_value, shadow).await;
        let shadow_duration = shadow_start.elapsed();

        let (primary_tree, shadow_tree) = match shadow_result {
            Ok(trees) => trees,
            Err(err) => {
                self.metrics.record_error(name, true);
                warn!(
                    operation = name,
                    timed_out = err.is_timeout(),
                    error = %err,
                    "Shadow path failed"
                );
                let outcome = ComparisonOutcome {
                    primary: ShadowValue::Undefined,
                    shadow: ShadowValue::Undefined,
                    diffs: Vec::new(),
                    matched: false,
                    primary_duration,
                    shadow_duration,
                    sampled: true,
                    error: Some(err.to_string()),
                };
                let result = if config.throw_on_error {
                    Err(E::from(err))
                } else {
                    Ok(primary_value)
                };
                return ShadowExecution {
                    result,
                    state: InvocationState::ShadowFailed,
                    outcome: Some(outcome),
                };
            }
        };

        let (primary_norm, shadow_norm, diffs) = compare_values(&primary_tree, &shadow_tree, &config.normalize);
        let matched = diffs.is_empty();

        self.metrics.record_comparison(
            name,
            matched,
            millis(primary_duration),
            millis(shadow_duration),
            diffs.len(),
        );

        if matched {
            if config.log_successes {
                debug!(
                    operation = name,
                    primary_ms = millis(primary_duration),
                    shadow_ms = millis(shadow_duration),
                    "Shadow comparison matched"
                );
            }
        } else if config.log_mismatches {
            let (module, operation) = split_operation(name);
            self.telemetry.log_with(
                module,
                operation,
                None,
                &primary_norm,
                &shadow_norm,
                Some(&diffs),
                None,
                &config.pii_fields,
            );
        }

        ShadowExecution {
            result: Ok(primary_value),
            state: if matched {
                InvocationState::Matched
            } else {
                InvocationState::Mismatched
            },
            outcome: Some(ComparisonOutcome {
                primary: primary_norm,
                shadow: shadow_norm,
                diffs,
                matched,
                primary_duration,
                shadow_duration,
                sampled: true,
                error: None,
            }),
        }
    }

    async fn run_shadow<T, U, SE, S, SF>(
        &self,
        name: &str,
        config: &ShadowConfig,
        primary_value: &T,
        shadow: S,
    ) -> Result<(ShadowValue, ShadowValue), ShadowError>
    where
        T: Serialize,
        U: Serialize,
        SE: Display,
        S: FnOnce() -> SF,
        SF: Future<Output = Result<U, SE>>,
    {
        let conversion = |e: serde_json::Error| ShadowError::Conversion {
            operation: name.to_string(),
            message: e.to_string(),
        };
        let primary_tree = ShadowValue::from_serialize(primary_value).map_err(conversion)?;

        let deadline = Deadline::after(config.timeout());
        let shadow_value = match deadline.run(shadow()).await {
            Some(Ok(value)) => value,
            Some(Err(e)) => {
                return Err(ShadowError::Failed {
                    operation: name.to_string(),
                    message: e.to_string(),
                })
            }
            None => {
                return Err(ShadowError::TimedOut {
                    operation: name.to_string(),
                    timeout: deadline.budget(),
                })
            }
        };
        let shadow_tree = ShadowValue::from_serialize(&shadow_value).map_err(conversion)?;

        Ok((primary_tree, shadow_tree))
    }
}

fn millis(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shadow::config::TelemetryConfig;
    use crate::shadow::telemetry::CollectingSink;
    use serde_json::{json, Value};

    fn comparator_with(sink: &CollectingSink) -> ShadowComparator {
        ShadowComparator::new(
            Arc::new(ShadowMetrics::new()),
            Arc::new(MismatchTelemetry::with_sink(TelemetryConfig::default(), Box::new(sink.clone()))),
        )
    }

    async fn ok(value: Value) -> anyhow::Result<Value> {
        Ok(value)
    }

    #[test]
    fn test_split_operation() {
        assert_eq!(split_operation("auth.getUserByEmail"), ("auth", "getUserByEmail"));
        assert_eq!(split_operation("projects.members.list"), ("projects", "members.list"));
        assert_eq!(split_operation("ping"), ("default", "ping"));
    }

    #[test]
    fn test_sampling_boundaries() {
        let never = ShadowConfig::always().with_sample_rate(0.0);
        let always = ShadowConfig::always();
        assert!((0..1000).all(|_| !ShadowComparator::should_sample(&never)));
        assert!((0..1000).all(|_| ShadowComparator::should_sample(&always)));
    }

    #[test]
    fn test_sampling_is_roughly_bernoulli() {
        let half = ShadowConfig::always().with_sample_rate(0.5);
        let hits = (0..2000).filter(|_| ShadowComparator::should_sample(&half)).count();
        assert!(hits > 800 && hits < 1200, "hits = {}", hits);
    }

    #[tokio::test]
    async fn test_parity_match() {
        let outcome = compare_parity(
            "tasks.list",
            || ok(json!([{"id": 2}, {"id": 1}])),
            || ok(json!([{"id": 1}, {"id": 2}])),
            &ParityOptions {
                normalize: NormalizeOptions::default().sort_by("id"),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert!(outcome.matched);
        assert!(outcome.sampled);
    }

    #[tokio::test]
    async fn test_parity_mismatch_reported_or_thrown() {
        let lenient = compare_parity("x", || ok(json!({"a": 1})), || ok(json!({"a": 2})), &ParityOptions::default())
            .await
            .unwrap();
        assert!(!lenient.matched);
        assert_eq!(lenient.diffs, vec!["root.a: expected 2, got 1".to_string()]);

        let strict = compare_parity(
            "x",
            || ok(json!({"a": 1})),
            || ok(json!({"a": 2})),
            &ParityOptions::strict(NormalizeOptions::default()),
        )
        .await;
        match strict {
            Err(ParityError::Mismatch(report)) => assert_eq!(report.total(), 1),
            other => panic!("expected mismatch, got {:?}", other.map(|o| o.matched)),
        }
    }

    #[tokio::test]
    async fn test_parity_surfaces_failures() {
        let result = compare_parity(
            "x",
            || async { Err::<Value, _>(anyhow::anyhow!("primary broke")) },
            || ok(json!(1)),
            &ParityOptions::default(),
        )
        .await;
        assert!(matches!(result, Err(ParityError::Primary(_))));

        let result = compare_parity(
            "x",
            || ok(json!(1)),
            || async { Err::<Value, _>(anyhow::anyhow!("shadow broke")) },
            &ParityOptions::default(),
        )
        .await;
        assert!(matches!(result, Err(ParityError::Shadow(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_parity_runs_concurrently() {
        let start = Instant::now();
        let slow = |v: i32| async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok::<_, anyhow::Error>(v)
        };
        compare_parity("x", || slow(1), || slow(1), &ParityOptions::default())
            .await
            .unwrap();
        assert!(start.elapsed() < Duration::from_millis(150));
    }

    #[tokio::test]
    async fn test_disabled_runs_primary_only() {
        let sink = CollectingSink::new();
        let comparator = comparator_with(&sink);
        let config = ShadowConfig { enabled: false, ..ShadowConfig::always() };

        let shadow_ran = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = shadow_ran.clone();

        let exec = comparator
            .execute_detailed("op", &config, || ok(json!(1)), || async move {
                flag.store(true, std::sync::atomic::Ordering::SeqCst);
                Ok::<Value, anyhow::Error>(json!(1))
            })
            .await;
        assert_eq!(exec.state, InvocationState::Disabled);
        assert!(!shadow_ran.load(std::sync::atomic::Ordering::SeqCst));
        assert_eq!(exec.result.unwrap(), json!(1));
        assert!(comparator.metrics().get_summary("op").is_none());
    }

    #[tokio::test]
    async fn test_not_sampled_counts_skip() {
        let sink = CollectingSink::new();
        let comparator = comparator_with(&sink);
        let config = ShadowConfig::always().with_sample_rate(0.0);

        let exec = comparator
            .execute_detailed("op", &config, || ok(json!(1)), || ok(json!(2)))
            .await;
        assert_eq!(exec.state, InvocationState::NotSampled);
        let summary = comparator.metrics().get_summary("op").unwrap();
        assert_eq!(summary.total_calls, 1);
        assert_eq!(summary.sampled_calls, 0);
    }

    #[tokio::test]
    async fn test_primary_error_skips_shadow() {
        let sink = CollectingSink::new();
        let comparator = comparator_with(&sink);
        let shadow_ran = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = shadow_ran.clone();

        let exec = comparator
            .execute_detailed(
                "op",
                &ShadowConfig::always(),
                || async { Err::<Value, anyhow::Error>(anyhow::anyhow!("db down")) },
                || async move {
                    flag.store(true, std::sync::atomic::Ordering::SeqCst);
                    Ok::<Value, anyhow::Error>(json!(1))
                },
            )
            .await;

        assert_eq!(exec.state, InvocationState::PrimaryFailed);
        assert_eq!(exec.result.unwrap_err().to_string(), "db down");
        assert!(!shadow_ran.load(std::sync::atomic::Ordering::SeqCst));
        let summary = comparator.metrics().get_summary("op").unwrap();
        assert_eq!(summary.errors, 1);
        assert_eq!(summary.total_calls, 1);
        assert_eq!(summary.sampled_calls, 0);
    }

    #[tokio::test]
    async fn test_shadow_error_swallowed() {
        let sink = CollectingSink::new();
        let comparator = comparator_with(&sink);

        let exec = comparator
            .execute_detailed("op", &ShadowConfig::always(), || ok(json!({"id": 1})), || async {
                Err::<Value, _>("orm exploded")
            })
            .await;

        assert_eq!(exec.state, InvocationState::ShadowFailed);
        assert_eq!(exec.result.unwrap(), json!({"id": 1}));
        let outcome = exec.outcome.unwrap();
        assert!(outcome.error.unwrap().contains("orm exploded"));
        let summary = comparator.metrics().get_summary("op").unwrap();
        assert_eq!(summary.errors, 1);
        assert_eq!(summary.sampled_calls, 1);
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn test_shadow_error_rethrown_when_configured() {
        let sink = CollectingSink::new();
        let comparator = comparator_with(&sink);
        let config = ShadowConfig { throw_on_error: true, ..ShadowConfig::always() };

        let result = comparator
            .execute("op", &config, || ok(json!(1)), || async { Err::<Value, _>("boom") })
            .await;
        let err = result.unwrap_err();
        assert!(matches!(err.downcast_ref::<ShadowError>(), Some(ShadowError::Failed { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shadow_timeout_swallowed() {
        let sink = CollectingSink::new();
        let comparator = comparator_with(&sink);
        let config = ShadowConfig::always().with_timeout(Duration::from_millis(50));

        let exec = comparator
            .execute_detailed("op", &config, || ok(json!(7)), || async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok::<Value, anyhow::Error>(json!(7))
            })
            .await;

        assert_eq!(exec.state, InvocationState::ShadowFailed);
        assert_eq!(exec.result.unwrap(), json!(7));
        assert!(exec.outcome.unwrap().error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_mismatch_recorded_and_logged() {
        let sink = CollectingSink::new();
        let comparator = comparator_with(&sink);

        let exec = comparator
            .execute_detailed(
                "reports.totals",
                &ShadowConfig::always(),
                || ok(json!({"total": 5, "name": "X"})),
                || ok(json!({"total": 5, "name": "Y"})),
            )
            .await;

        assert_eq!(exec.state, InvocationState::Mismatched);
        assert_eq!(exec.result.unwrap(), json!({"total": 5, "name": "X"}));
        let summary = comparator.metrics().get_summary("reports.totals").unwrap();
        assert_eq!(summary.mismatches, 1);
        assert_eq!(summary.diff_histogram.get(&1), Some(&1));

        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].signature, "reports:totals");
    }

    #[tokio::test]
    async fn test_mismatch_logging_can_be_disabled() {
        let sink = CollectingSink::new();
        let comparator = comparator_with(&sink);
        let config = ShadowConfig { log_mismatches: false, ..ShadowConfig::always() };

        comparator
            .execute("op", &config, || ok(json!(1)), || ok(json!(2)))
            .await
            .unwrap();
        assert!(sink.is_empty());
        assert_eq!(comparator.metrics().get_summary("op").unwrap().mismatches, 1);
    }

    #[tokio::test]
    async fn test_shadow_may_return_a_different_type() {
        #[derive(Serialize)]
        struct OrmUser {
            id: String,
            name: String,
        }

        let sink = CollectingSink::new();
        let comparator = comparator_with(&sink);
        let exec = comparator
            .execute_detailed(
                "users.get",
                &ShadowConfig::always(),
                || ok(json!({"id": "1", "name": "Ada"})),
                || async {
                    Ok::<_, anyhow::Error>(OrmUser {
                        id: "1".into(),
                        name: "Ada".into(),
                    })
                },
            )
            .await;
        assert_eq!(exec.state, InvocationState::Matched);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline() {
        let deadline = Deadline::after(Duration::from_millis(100));
        assert_eq!(deadline.run(async { 5 }).await, Some(5));
        let slow = deadline.run(tokio::time::sleep(Duration::from_secs(1))).await;
        assert!(slow.is_none());
        assert_eq!(deadline.remaining(), Duration::ZERO);
    }
}
