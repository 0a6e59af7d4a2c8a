//! Session health monitoring with rolling failure statistics.
//!
//! The checker itself is synchronous bookkeeping: the controller performs
//! the async probes (existence, capture, echo round-trip) and feeds the
//! observations in. That keeps interval/threshold semantics unit-testable
//! without a live session.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Benign text used for echo probes; harmless in every assistant UI.
pub const DEFAULT_ECHO_PROBE: &str = "# health check";

/// The three supported probe strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthCheckKind {
    /// Session still exists (basic liveness).
    SessionAlive,
    /// Session is producing a minimum amount of output.
    OutputResponsive,
    /// Session processes a benign test command end to end.
    CommandEcho,
}

impl std::fmt::Display for HealthCheckKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthCheckKind::SessionAlive => write!(f, "session-alive"),
            HealthCheckKind::OutputResponsive => write!(f, "output-responsive"),
            HealthCheckKind::CommandEcho => write!(f, "command-echo"),
        }
    }
}

/// Outcome of a single health probe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckResult {
    pub timestamp: DateTime<Utc>,
    pub kind: HealthCheckKind,
    pub healthy: bool,
    pub details: serde_json::Value,
    pub error: Option<String>,
}

/// Tuning for the health checker.
#[derive(Debug, Clone)]
pub struct HealthConfig {
    /// Minimum interval between checks.
    pub check_interval: Duration,
    /// Bound for the echo probe's ready wait.
    pub response_timeout: Duration,
    /// Consecutive failures tolerated before the session counts unhealthy.
    pub max_failed_checks: u32,
    /// Minimum captured length for the output-responsive probe.
    pub min_output_length: usize,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(30),
            response_timeout: Duration::from_secs(5),
            max_failed_checks: 3,
            min_output_length: 10,
        }
    }
}

/// Serializable health statistics snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStats {
    pub total_checks: u64,
    pub total_failures: u64,
    pub consecutive_failures: u32,
    pub success_rate: f64,
    pub is_healthy: bool,
    pub last_check: Option<DateTime<Utc>>,
}

/// Tracks probe outcomes and derives an overall health verdict.
#[derive(Debug)]
pub struct HealthChecker {
    config: HealthConfig,
    last_check: Option<DateTime<Utc>>,
    last_result: Option<HealthCheckResult>,
    consecutive_failures: u32,
    total_checks: u64,
    total_failures: u64,
}

impl HealthChecker {
    pub fn new(config: HealthConfig) -> Self {
        Self {
            config,
            last_check: None,
            last_result: None,
            consecutive_failures: 0,
            total_checks: 0,
            total_failures: 0,
        }
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    /// Whether enough time has passed since the last check. Always true
    /// before the first check.
    pub fn should_check(&self) -> bool {
        match self.last_check {
            None => true,
            Some(last) => {
                let elapsed = Utc::now().signed_duration_since(last);
                elapsed.num_milliseconds().max(0) as u128
                    >= self.config.check_interval.as_millis()
            }
        }
    }

    /// Evaluate a liveness observation.
    pub fn evaluate_session_alive(&self, exists: bool) -> HealthCheckResult {
        HealthCheckResult {
            timestamp: Utc::now(),
            kind: HealthCheckKind::SessionAlive,
            healthy: exists,
            details: json!({ "exists": exists }),
            error: (!exists).then(|| "session does not exist".to_string()),
        }
    }

    /// Evaluate a captured-output observation against the configured
    /// minimum length.
    pub fn evaluate_output_responsive(&self, output: &str) -> HealthCheckResult {
        let healthy = output.len() >= self.config.min_output_length;
        HealthCheckResult {
            timestamp: Utc::now(),
            kind: HealthCheckKind::OutputResponsive,
            healthy,
            details: json!({
                "output_length": output.len(),
                "min_required": self.config.min_output_length,
            }),
            error: (!healthy).then(|| {
                format!(
                    "insufficient output: {} < {}",
                    output.len(),
                    self.config.min_output_length
                )
            }),
        }
    }

    /// Evaluate an echo round-trip: the probe text must appear in the
    /// captured output, and the session must have reached ready first.
    pub fn evaluate_command_echo(
        &self,
        probe: &str,
        became_ready: bool,
        output: &str,
    ) -> HealthCheckResult {
        if !became_ready {
            return HealthCheckResult {
                timestamp: Utc::now(),
                kind: HealthCheckKind::CommandEcho,
                healthy: false,
                details: json!({
                    "stage": "timeout",
                    "timeout_secs": self.config.response_timeout.as_secs_f64(),
                }),
                error: Some(format!(
                    "timeout waiting for response ({:.1}s)",
                    self.config.response_timeout.as_secs_f64()
                )),
            };
        }

        let found = output.contains(probe);
        HealthCheckResult {
            timestamp: Utc::now(),
            kind: HealthCheckKind::CommandEcho,
            healthy: found,
            details: json!({
                "probe": probe,
                "probe_found": found,
                "output_length": output.len(),
            }),
            error: (!found).then(|| "test command not found in output".to_string()),
        }
    }

    /// Build a failed result for a probe that errored before evaluation.
    pub fn evaluate_probe_error(&self, kind: HealthCheckKind, message: &str) -> HealthCheckResult {
        HealthCheckResult {
            timestamp: Utc::now(),
            kind,
            healthy: false,
            details: json!({ "error": message }),
            error: Some(message.to_string()),
        }
    }

    /// Record a probe outcome and update rolling statistics.
    pub fn record(&mut self, result: &HealthCheckResult) {
        self.last_check = Some(result.timestamp);
        self.last_result = Some(result.clone());
        self.total_checks += 1;

        if result.healthy {
            if self.consecutive_failures > 0 {
                info!(
                    "health check recovered after {} failures",
                    self.consecutive_failures
                );
            }
            self.consecutive_failures = 0;
            debug!("health check passed ({})", result.kind);
        } else {
            self.consecutive_failures += 1;
            self.total_failures += 1;
            warn!(
                "health check failed ({}): {}. consecutive failures: {}/{}",
                result.kind,
                result.error.as_deref().unwrap_or("unknown"),
                self.consecutive_failures,
                self.config.max_failed_checks
            );
        }
    }

    /// Healthy iff consecutive failures are below the configured threshold.
    pub fn is_healthy(&self) -> bool {
        self.consecutive_failures < self.config.max_failed_checks
    }

    pub fn last_result(&self) -> Option<&HealthCheckResult> {
        self.last_result.as_ref()
    }

    /// Clear the consecutive-failure counter, preserving totals.
    pub fn reset(&mut self) {
        info!("resetting health check state");
        self.consecutive_failures = 0;
    }

    pub fn stats(&self) -> HealthStats {
        let success_rate = if self.total_checks > 0 {
            (self.total_checks - self.total_failures) as f64 / self.total_checks as f64
        } else {
            0.0
        };
        HealthStats {
            total_checks: self.total_checks,
            total_failures: self.total_failures,
            consecutive_failures: self.consecutive_failures,
            success_rate,
            is_healthy: self.is_healthy(),
            last_check: self.last_check,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checker() -> HealthChecker {
        HealthChecker::new(HealthConfig::default())
    }

    #[test]
    fn test_should_check_before_first_check() {
        assert!(checker().should_check());
    }

    #[test]
    fn test_should_check_respects_interval() {
        let mut c = HealthChecker::new(HealthConfig {
            check_interval: Duration::from_secs(3600),
            ..HealthConfig::default()
        });
        let result = c.evaluate_session_alive(true);
        c.record(&result);
        assert!(!c.should_check());
    }

    #[test]
    fn test_healthy_until_threshold() {
        let mut c = checker();
        assert!(c.is_healthy());

        for _ in 0..2 {
            let result = c.evaluate_session_alive(false);
            c.record(&result);
        }
        assert!(c.is_healthy());

        let result = c.evaluate_session_alive(false);
        c.record(&result);
        assert!(!c.is_healthy());
    }

    #[test]
    fn test_success_clears_consecutive_failures() {
        let mut c = checker();
        for _ in 0..2 {
            let result = c.evaluate_session_alive(false);
            c.record(&result);
        }
        let result = c.evaluate_session_alive(true);
        c.record(&result);

        let stats = c.stats();
        assert_eq!(stats.consecutive_failures, 0);
        assert_eq!(stats.total_failures, 2);
        assert_eq!(stats.total_checks, 3);
    }

    #[test]
    fn test_reset_preserves_totals() {
        let mut c = checker();
        for _ in 0..3 {
            let result = c.evaluate_session_alive(false);
            c.record(&result);
        }
        assert!(!c.is_healthy());

        c.reset();
        assert!(c.is_healthy());
        assert_eq!(c.stats().total_failures, 3);
        assert_eq!(c.stats().total_checks, 3);
    }

    #[test]
    fn test_output_responsive_threshold() {
        let c = checker();
        assert!(!c.evaluate_output_responsive("tiny").healthy);
        assert!(c.evaluate_output_responsive("plenty of output here").healthy);
    }

    #[test]
    fn test_command_echo_requires_probe_in_output() {
        let c = checker();

        let result = c.evaluate_command_echo(DEFAULT_ECHO_PROBE, true, "# health check\n> ");
        assert!(result.healthy);

        let result = c.evaluate_command_echo(DEFAULT_ECHO_PROBE, true, "unrelated text");
        assert!(!result.healthy);

        let result = c.evaluate_command_echo(DEFAULT_ECHO_PROBE, false, "# health check");
        assert!(!result.healthy);
        assert!(result.error.unwrap().contains("timeout"));
    }
}
