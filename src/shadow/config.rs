//! Shadow comparison configuration
//!
//! Per-operation switches, sampling, timeouts and normalization options,
//! loadable from TOML with environment overrides.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::normalize::NormalizeOptions;

/// Environment toggle that enables shadow comparison by default
pub const ENABLED_ENV: &str = "SHADOW_COMPARE_ENABLED";

/// Environment variable pointing at the TOML settings file
pub const CONFIG_PATH_ENV: &str = "SHADOW_CONFIG_PATH";

fn env_enabled() -> bool {
    std::env::var(ENABLED_ENV)
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "on" | "ON"))
        .unwrap_or(false)
}

/// Configuration for one named operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShadowConfig {
    /// Master switch; when off only the primary path runs
    pub enabled: bool,
    /// Fraction of calls compared, in [0, 1]
    pub sample_rate: f64,
    pub log_mismatches: bool,
    pub log_successes: bool,
    /// Propagate shadow failures instead of absorbing them
    pub throw_on_error: bool,
    /// Hard bound on shadow execution (ms)
    pub timeout_ms: u64,
    /// Extra redaction keys on top of the built-in denylist
    pub pii_fields: Vec<String>,
    pub normalize: NormalizeOptions,
}

impl Default for ShadowConfig {
    fn default() -> Self {
        Self {
            enabled: env_enabled(),
            sample_rate: 0.01,
            log_mismatches: true,
            log_successes: false,
            throw_on_error: false,
            timeout_ms: 5000,
            pii_fields: Vec::new(),
            normalize: NormalizeOptions::default(),
        }
    }
}

impl ShadowConfig {
    /// Enabled config that compares every call.
    pub fn always() -> Self {
        Self {
            enabled: true,
            sample_rate: 1.0,
            ..Self::default()
        }
    }

    pub fn with_sample_rate(mut self, rate: f64) -> Self {
        self.sample_rate = rate;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_normalize(mut self, options: NormalizeOptions) -> Self {
        self.normalize = options;
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Sample rate clamped to [0, 1]; NaN never samples.
    pub fn effective_sample_rate(&self) -> f64 {
        if self.sample_rate.is_nan() {
            0.0
        } else {
            self.sample_rate.clamp(0.0, 1.0)
        }
    }
}

/// Mismatch telemetry settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Rate-limit window per mismatch signature (seconds)
    pub window_secs: u64,
    /// Log records emitted per signature per window
    pub max_logs_per_window: u32,
    /// Sweep interval for stale signatures (seconds)
    pub cleanup_interval_secs: u64,
    /// Global additions to the redaction denylist
    pub pii_fields: Vec<String>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            window_secs: 60,
            max_logs_per_window: 10,
            cleanup_interval_secs: 300,
            pii_fields: Vec::new(),
        }
    }
}

impl TelemetryConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs.max(1))
    }
}

/// Process-level settings: defaults, per-operation overrides and telemetry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ShadowSettings {
    pub defaults: ShadowConfig,
    /// Overrides keyed by operation name (e.g. `auth.getUserByEmail`)
    pub operations: HashMap<String, ShadowConfig>,
    pub telemetry: TelemetryConfig,
    /// Where the final metrics export is written on shutdown
    pub export_path: Option<PathBuf>,
}

impl ShadowSettings {
    /// Load from TOML file
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let settings: Self = toml::from_str(&contents)?;
        Ok(settings)
    }

    /// Load from `SHADOW_CONFIG_PATH` or the default path, falling back to defaults
    pub fn from_env() -> Self {
        let path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| "shadow_compare.toml".to_string());

        Self::load(&path).unwrap_or_else(|e| {
            if Path::new(&path).exists() {
                tracing::warn!("Ignoring unreadable shadow settings {}: {}", path, e);
            } else {
                tracing::debug!("Using default shadow settings ({}): {}", path, e);
            }
            Self::default()
        })
    }

    /// Save to TOML file
    pub fn save(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Config for an operation, falling back to `defaults`.
    pub fn config_for(&self, operation: &str) -> ShadowConfig {
        self.operations
            .get(operation)
            .cloned()
            .unwrap_or_else(|| self.defaults.clone())
    }

    pub fn set_operation(&mut self, operation: &str, config: ShadowConfig) {
        self.operations.insert(operation.to_string(), config);
    }
}
