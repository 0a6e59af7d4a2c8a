//! Policy-driven session restart with window-bounded rate limiting.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

use crate::error::CoreError;

/// Upper bound on retained attempt records; totals survive truncation.
const HISTORY_LIMIT: usize = 100;

/// When the restarter is allowed to act.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RestartPolicy {
    /// Never restart automatically.
    Never,
    /// Restart only after unexpected failures.
    #[default]
    OnFailure,
    /// Restart regardless of the reason.
    Always,
}

impl std::fmt::Display for RestartPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RestartPolicy::Never => write!(f, "never"),
            RestartPolicy::OnFailure => write!(f, "on_failure"),
            RestartPolicy::Always => write!(f, "always"),
        }
    }
}

/// Record of one restart attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestartAttempt {
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    pub reason: String,
    pub error_message: Option<String>,
    pub elapsed_secs: f64,
}

/// Tuning for the auto-restarter.
#[derive(Debug, Clone)]
pub struct RestartConfig {
    pub policy: RestartPolicy,
    /// Max restarts permitted inside the window.
    pub max_attempts: u32,
    /// Window for counting recent attempts.
    pub window: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_factor: f64,
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            policy: RestartPolicy::OnFailure,
            max_attempts: 3,
            window: Duration::from_secs(300),
            initial_backoff: Duration::from_secs(5),
            max_backoff: Duration::from_secs(60),
            backoff_factor: 2.0,
        }
    }
}

/// Serializable restart statistics snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestartStats {
    pub policy: String,
    pub total_restarts: u64,
    pub successful_restarts: u64,
    pub failed_restarts: u64,
    pub recent_attempts: usize,
    pub attempts_remaining: u32,
}

/// Manages automatic restarts with backoff and a rolling attempt window.
#[derive(Debug)]
pub struct AutoRestarter {
    config: RestartConfig,
    history: Vec<RestartAttempt>,
    total_restarts: u64,
    successful_restarts: u64,
    failed_restarts: u64,
}

impl AutoRestarter {
    pub fn new(config: RestartConfig) -> Self {
        Self {
            config,
            history: Vec::new(),
            total_restarts: 0,
            successful_restarts: 0,
            failed_restarts: 0,
        }
    }

    pub fn config(&self) -> &RestartConfig {
        &self.config
    }

    /// Whether a restart is permitted right now.
    ///
    /// False when the policy is `Never` or when the attempts within the
    /// configured window have reached the limit.
    pub fn should_restart(&self, reason: &str) -> bool {
        if self.config.policy == RestartPolicy::Never {
            info!("restart policy is 'never', skipping restart ({})", reason);
            return false;
        }

        let recent = self.recent_attempts();
        if recent >= self.config.max_attempts as usize {
            warn!(
                "max restart attempts ({}) reached within {:.0}s window, not restarting",
                self.config.max_attempts,
                self.config.window.as_secs_f64()
            );
            return false;
        }

        info!(
            "restart permitted: {}/{} attempts used ({})",
            recent, self.config.max_attempts, reason
        );
        true
    }

    /// Alias for callers that only want the verdict without log noise
    /// about the reason.
    pub fn can_restart(&self) -> bool {
        self.config.policy != RestartPolicy::Never
            && self.recent_attempts() < self.config.max_attempts as usize
    }

    /// Backoff before the next attempt, derived from the number of recent
    /// attempts `n`: the initial delay when `n = 0`, otherwise
    /// `min(initial * factor^(n-1), max)`.
    pub fn calculate_backoff(&self) -> Duration {
        let n = self.recent_attempts();
        if n == 0 {
            return self.config.initial_backoff;
        }
        let scaled = self.config.initial_backoff.as_secs_f64()
            * self.config.backoff_factor.powi((n - 1) as i32);
        Duration::from_secs_f64(scaled.min(self.config.max_backoff.as_secs_f64()))
    }

    /// Attempt a restart through `restart_fn`, recording the outcome.
    ///
    /// Returns false without recording anything when the policy or the
    /// window forbids a restart. With `wait_before_restart`, sleeps the
    /// calculated backoff first.
    pub async fn attempt_restart<F, Fut>(
        &mut self,
        restart_fn: F,
        reason: &str,
        wait_before_restart: bool,
    ) -> bool
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), CoreError>>,
    {
        if !self.should_restart(reason) {
            return false;
        }

        if wait_before_restart {
            let delay = self.calculate_backoff();
            info!(
                "waiting {:.2}s before restart attempt ({})",
                delay.as_secs_f64(),
                reason
            );
            tokio::time::sleep(delay).await;
        }

        info!("attempting restart ({})", reason);
        let started = Instant::now();
        let outcome = restart_fn().await;
        let elapsed = started.elapsed().as_secs_f64();

        let (success, error_message) = match &outcome {
            Ok(()) => (true, None),
            Err(err) => (false, Some(err.to_string())),
        };

        self.record_attempt(RestartAttempt {
            timestamp: Utc::now(),
            success,
            reason: reason.to_string(),
            error_message,
            elapsed_secs: elapsed,
        });

        if success {
            info!("restart succeeded in {:.2}s", elapsed);
        } else {
            error!("restart failed after {:.2}s", elapsed);
        }
        success
    }

    /// Record an attempt and update totals; history is truncated to the
    /// most recent [`HISTORY_LIMIT`] entries.
    pub fn record_attempt(&mut self, attempt: RestartAttempt) {
        self.total_restarts += 1;
        if attempt.success {
            self.successful_restarts += 1;
        } else {
            self.failed_restarts += 1;
        }
        self.history.push(attempt);
        if self.history.len() > HISTORY_LIMIT {
            let excess = self.history.len() - HISTORY_LIMIT;
            self.history.drain(..excess);
        }
    }

    /// Count of attempts within the configured window.
    pub fn recent_attempts(&self) -> usize {
        let window = ChronoDuration::from_std(self.config.window)
            .unwrap_or_else(|_| ChronoDuration::seconds(i64::MAX / 2));
        let cutoff = Utc::now() - window;
        self.history
            .iter()
            .filter(|attempt| attempt.timestamp >= cutoff)
            .count()
    }

    pub fn last_attempt(&self) -> Option<&RestartAttempt> {
        self.history.last()
    }

    /// Discard recent attempts, keeping totals.
    pub fn reset_history(&mut self) {
        info!("resetting restart history");
        self.history.clear();
    }

    pub fn stats(&self) -> RestartStats {
        let recent = self.recent_attempts();
        RestartStats {
            policy: self.config.policy.to_string(),
            total_restarts: self.total_restarts,
            successful_restarts: self.successful_restarts,
            failed_restarts: self.failed_restarts,
            recent_attempts: recent,
            attempts_remaining: self
                .config
                .max_attempts
                .saturating_sub(recent as u32),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attempt_at(timestamp: DateTime<Utc>, success: bool) -> RestartAttempt {
        RestartAttempt {
            timestamp,
            success,
            reason: "test".to_string(),
            error_message: None,
            elapsed_secs: 0.1,
        }
    }

    fn restarter(policy: RestartPolicy, max_attempts: u32) -> AutoRestarter {
        AutoRestarter::new(RestartConfig {
            policy,
            max_attempts,
            window: Duration::from_secs(300),
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(10),
            backoff_factor: 2.0,
        })
    }

    #[test]
    fn test_never_policy_blocks_restart() {
        let r = restarter(RestartPolicy::Never, 3);
        assert!(!r.should_restart("session died"));
        assert!(!r.can_restart());
    }

    #[test]
    fn test_window_limit_blocks_restart() {
        let mut r = restarter(RestartPolicy::OnFailure, 3);
        for _ in 0..3 {
            r.record_attempt(attempt_at(Utc::now(), true));
        }
        assert!(!r.should_restart("again"));

        // Attempts outside the window stop counting.
        let mut r = restarter(RestartPolicy::OnFailure, 3);
        for _ in 0..3 {
            r.record_attempt(attempt_at(Utc::now() - ChronoDuration::seconds(600), true));
        }
        assert!(r.should_restart("window expired"));
    }

    #[test]
    fn test_backoff_progression() {
        let mut r = restarter(RestartPolicy::Always, 10);
        assert_eq!(r.calculate_backoff(), Duration::from_secs(1));

        let expected = [1.0, 2.0, 4.0, 8.0, 10.0];
        for expected_secs in expected {
            r.record_attempt(attempt_at(Utc::now(), false));
            assert_eq!(
                r.calculate_backoff(),
                Duration::from_secs_f64(expected_secs)
            );
        }
    }

    #[tokio::test]
    async fn test_attempt_restart_records_outcome() {
        let mut r = restarter(RestartPolicy::OnFailure, 3);

        let ok = r
            .attempt_restart(|| async { Ok(()) }, "probe failed", false)
            .await;
        assert!(ok);

        let failed = r
            .attempt_restart(
                || async { Err(CoreError::Backend("spawn failed".to_string())) },
                "probe failed",
                false,
            )
            .await;
        assert!(!failed);

        let stats = r.stats();
        assert_eq!(stats.total_restarts, 2);
        assert_eq!(stats.successful_restarts, 1);
        assert_eq!(stats.failed_restarts, 1);
        assert_eq!(
            r.last_attempt().unwrap().error_message.as_deref(),
            Some("backend error: spawn failed")
        );
    }

    #[tokio::test]
    async fn test_blocked_attempt_is_not_recorded() {
        let mut r = restarter(RestartPolicy::Never, 3);
        let ok = r
            .attempt_restart(|| async { Ok(()) }, "anything", false)
            .await;
        assert!(!ok);
        assert_eq!(r.stats().total_restarts, 0);
    }

    #[test]
    fn test_history_truncation_preserves_totals() {
        let mut r = restarter(RestartPolicy::Always, 1000);
        for _ in 0..150 {
            r.record_attempt(attempt_at(Utc::now(), true));
        }
        assert_eq!(r.stats().total_restarts, 150);
        assert!(r.recent_attempts() <= HISTORY_LIMIT);
    }

    #[test]
    fn test_reset_history_keeps_totals() {
        let mut r = restarter(RestartPolicy::OnFailure, 3);
        for _ in 0..3 {
            r.record_attempt(attempt_at(Utc::now(), false));
        }
        r.reset_history();
        assert!(r.can_restart());
        assert_eq!(r.stats().total_restarts, 3);
        assert_eq!(r.stats().failed_restarts, 3);
    }
}
