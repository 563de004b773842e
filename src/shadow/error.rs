//! Error taxonomy for the shadow harness.
//!
//! Primary errors are never wrapped: production mode hands the caller's own
//! error value back unchanged. `ShadowError` only surfaces when a call site
//! explicitly asks for shadow failures to be re-thrown.

use std::fmt;
use std::time::Duration;

/// Failure on the shadow side of a production comparison.
#[derive(Debug, Clone, PartialEq)]
pub enum ShadowError {
    /// Shadow implementation returned an error
    Failed { operation: String, message: String },
    /// Shadow implementation exceeded its time budget
    TimedOut { operation: String, timeout: Duration },
    /// A result could not be converted into a comparable value tree
    Conversion { operation: String, message: String },
}

impl ShadowError {
    pub fn operation(&self) -> &str {
        match self {
            Self::Failed { operation, .. }
            | Self::TimedOut { operation, .. }
            | Self::Conversion { operation, .. } => operation,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::TimedOut { .. })
    }
}

impl fmt::Display for ShadowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Failed { operation, message } => write!(f, "shadow path for {} failed: {}", operation, message),
            Self::TimedOut { operation, timeout } => {
                write!(f, "shadow path for {} timed out after {}ms", operation, timeout.as_millis())
            }
            Self::Conversion { operation, message } => {
                write!(f, "could not convert {} result for comparison: {}", operation, message)
            }
        }
    }
}

impl std::error::Error for ShadowError {}

/// Number of discrepancies spelled out in a mismatch report
pub const REPORTED_DIFFS: usize = 5;

/// Parity-test mismatch summary: the first few discrepancies plus a remainder count.
#[derive(Debug, Clone, PartialEq)]
pub struct MismatchReport {
    pub operation: String,
    pub diffs: Vec<String>,
    pub remaining: usize,
}

impl MismatchReport {
    pub fn new(operation: &str, diffs: &[String]) -> Self {
        Self {
            operation: operation.to_string(),
            diffs: diffs.iter().take(REPORTED_DIFFS).cloned().collect(),
            remaining: diffs.len().saturating_sub(REPORTED_DIFFS),
        }
    }

    pub fn total(&self) -> usize {
        self.diffs.len() + self.remaining
    }
}

impl fmt::Display for MismatchReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: primary and shadow results differ ({} differences)", self.operation, self.total())?;
        for diff in &self.diffs {
            write!(f, "\n  - {}", diff)?;
        }
        if self.remaining > 0 {
            write!(f, "\n  ... and {} more", self.remaining)?;
        }
        Ok(())
    }
}

/// Parity-test failure. Primary and shadow errors keep the caller's type.
#[derive(Debug)]
pub enum ParityError<E> {
    Primary(E),
    Shadow(E),
    Conversion(String),
    Mismatch(MismatchReport),
}

impl<E: fmt::Display> fmt::Display for ParityError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Primary(e) => write!(f, "primary implementation failed: {}", e),
            Self::Shadow(e) => write!(f, "shadow implementation failed: {}", e),
            Self::Conversion(msg) => write!(f, "result conversion failed: {}", msg),
            Self::Mismatch(report) => write!(f, "{}", report),
        }
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for ParityError<E> {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_truncates_to_five() {
        let diffs: Vec<String> = (0..8).map(|i| format!("root[{}]: expected 1, got 2", i)).collect();
        let report = MismatchReport::new("projects.list", &diffs);
        assert_eq!(report.diffs.len(), 5);
        assert_eq!(report.remaining, 3);
        assert_eq!(report.total(), 8);

        let text = report.to_string();
        assert!(text.contains("root[4]"));
        assert!(!text.contains("root[5]"));
        assert!(text.ends_with("... and 3 more"));
    }

    #[test]
    fn test_shadow_error_display() {
        let err = ShadowError::TimedOut {
            operation: "auth.getUserByEmail".into(),
            timeout: Duration::from_millis(250),
        };
        assert_eq!(err.to_string(), "shadow path for auth.getUserByEmail timed out after 250ms");
        assert!(err.is_timeout());
        assert_eq!(err.operation(), "auth.getUserByEmail");
    }

    #[test]
    fn test_converts_into_anyhow() {
        let err = ShadowError::Failed { operation: "x".into(), message: "boom".into() };
        let any: anyhow::Error = err.clone().into();
        assert_eq!(any.downcast_ref::<ShadowError>(), Some(&err));
    }
}
