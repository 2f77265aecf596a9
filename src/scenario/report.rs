//! Run-all-and-report bookkeeping for features

use std::any::Any;
use std::fmt;
use std::time::Duration;

use tracing::info;

/// Longest error shown per line in the summary
const MAX_SUMMARY_ERROR: usize = 200;

/// Which part of a feature a step belongs to
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepPhase {
    /// Runs before any assessment; failure skips the rest
    Setup,
    /// Independent check
    Assess,
}

/// Result of one step
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StepStatus {
    /// Step succeeded
    Passed,
    /// Step failed with a reason
    Failed(String),
    /// Step never ran because setup failed
    Skipped,
}

impl StepStatus {
    /// Whether this status fails the feature
    pub fn is_failed(&self) -> bool {
        matches!(self, StepStatus::Failed(_))
    }
}

/// One executed (or skipped) step
#[derive(Clone, Debug)]
pub struct StepResult {
    /// Step name
    pub name: String,
    /// Phase the step ran in
    pub phase: StepPhase,
    /// What happened
    pub status: StepStatus,
    /// Wall time spent
    pub duration: Duration,
}

/// Everything that happened while testing one feature
#[derive(Clone, Debug)]
pub struct FeatureReport {
    /// Feature name
    pub feature: String,
    /// Namespace the feature ran in, once created
    pub namespace: Option<String>,
    /// Steps in execution order
    pub steps: Vec<StepResult>,
    /// Failure outside any step (namespace creation, authoring errors)
    pub error: Option<String>,
    /// Wall time spent
    pub duration: Duration,
}

impl FeatureReport {
    /// Empty report for `feature`
    pub fn new(feature: impl Into<String>) -> Self {
        Self {
            feature: feature.into(),
            namespace: None,
            steps: Vec::new(),
            error: None,
            duration: Duration::ZERO,
        }
    }

    /// Report for a feature that could not start
    pub fn aborted(feature: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::new(feature)
        }
    }

    /// Whether nothing failed
    pub fn passed(&self) -> bool {
        self.error.is_none() && !self.steps.iter().any(|s| s.status.is_failed())
    }

    /// `(step, reason)` of every failure, feature-level first
    pub fn failures(&self) -> Vec<(String, String)> {
        let mut failures: Vec<_> = self
            .error
            .iter()
            .map(|e| (self.feature.clone(), e.clone()))
            .collect();
        failures.extend(self.steps.iter().filter_map(|s| match &s.status {
            StepStatus::Failed(reason) => Some((s.name.clone(), reason.clone())),
            _ => None,
        }));
        failures
    }

    /// Look up a step by name
    pub fn step(&self, name: &str) -> Option<&StepResult> {
        self.steps.iter().find(|s| s.name == name)
    }

    pub(crate) fn push(&mut self, name: &str, phase: StepPhase, status: StepStatus, duration: Duration) {
        self.steps.push(StepResult {
            name: name.to_string(),
            phase,
            status,
            duration,
        });
    }
}

impl fmt::Display for FeatureReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let failed = self.steps.iter().filter(|s| s.status.is_failed()).count();
        let skipped = self
            .steps
            .iter()
            .filter(|s| s.status == StepStatus::Skipped)
            .count();
        write!(
            f,
            "{}: {} steps, {} failed, {} skipped",
            self.feature,
            self.steps.len(),
            failed,
            skipped
        )
    }
}

/// Collects feature reports and prints the suite summary
pub struct TestHarness {
    suite: String,
    reports: Vec<FeatureReport>,
}

impl TestHarness {
    /// Harness for the suite named `suite`
    pub fn new(suite: &str) -> Self {
        Self {
            suite: suite.to_string(),
            reports: Vec::new(),
        }
    }

    /// Add a finished feature
    pub fn record(&mut self, report: FeatureReport) {
        info!(feature = %report.feature, passed = report.passed(), "{}", report);
        self.reports.push(report);
    }

    /// Reports recorded so far
    pub fn reports(&self) -> &[FeatureReport] {
        &self.reports
    }

    /// Log the summary; `Err` names the failed features
    pub fn finish(&self) -> Result<(), String> {
        let total: Duration = self.reports.iter().map(|r| r.duration).sum();
        let passed = self.reports.iter().filter(|r| r.passed()).count();
        let failed = self.reports.len() - passed;

        info!("========================================");
        info!("  {}", self.suite.to_uppercase());
        info!("========================================");
        for report in &self.reports {
            let tag = if report.passed() { "PASS" } else { "FAIL" };
            info!("  {tag}  {:40} {:.1}s", report.feature, report.duration.as_secs_f64());
            for (step, reason) in report.failures() {
                info!("        {step} -> {}", truncate(&reason, MAX_SUMMARY_ERROR));
            }
        }
        info!("----------------------------------------");
        info!(
            "  {} passed, {} failed ({:.1}s total)",
            passed,
            failed,
            total.as_secs_f64()
        );
        info!("========================================");

        if failed > 0 {
            let names: Vec<_> = self
                .reports
                .iter()
                .filter(|r| !r.passed())
                .map(|r| r.feature.as_str())
                .collect();
            Err(format!(
                "{} feature(s) failed in {}: {}",
                failed,
                self.suite,
                names.join(", ")
            ))
        } else {
            Ok(())
        }
    }
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Readable message from a caught panic payload
pub(crate) fn panic_message(panic: Box<dyn Any + Send>) -> String {
    let msg = if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    };
    format!("PANIC: {msg}")
}
