//! Per-agent automation state machine.
//!
//! An [`AgentController`] owns exactly one session backend and synthesizes a
//! structured protocol out of a black-box terminal UI: byte-level pane
//! captures, timing heuristics, and marker pattern-matching. It handles
//! startup, command dispatch with submit-key fallbacks, readiness detection,
//! the manual-takeover lease, output deltas, health probes, and restarts.
//!
//! Controllers are single-owner: all methods take `&mut self`, so the probe
//! and dispatch in [`AgentController::send_command`] happen under one
//! exclusive borrow and a manual client appearing mid-send can never drop a
//! command. Cross-task sharing goes through the orchestrator's
//! per-controller mutex.

pub mod profiles;

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use mux_session::{SessionBackend, SessionError, SessionSpec};

use crate::error::CoreError;
use crate::health::{HealthCheckKind, HealthCheckResult, HealthChecker, DEFAULT_ECHO_PROBE};
use crate::restart::{AutoRestarter, RestartAttempt};
use crate::utils::retry::RetryPolicy;
use crate::utils::text::{non_whitespace_len, normalize_command, strip_ansi};

use self::profiles::AgentTunables;

/// Pause reason recorded when an external client attaches.
pub const MANUAL_ATTACH_REASON: &str = "manual-attach";

/// Lines from the pane bottom scanned for loading indicators.
const LOADING_SCAN_LINES: usize = 20;

/// Lines from the pane bottom scanned for completion markers.
const READY_SCAN_LINES: usize = 5;

/// Poll cadence for `wait_for_startup`.
const STARTUP_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Pause between kill and respawn during a restart.
const RESTART_KILL_WAIT: Duration = Duration::from_secs(1);

/// Lifecycle of one controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControllerState {
    Uninitialized,
    Starting,
    Ready,
    Busy,
    Paused,
    Dead,
}

impl std::fmt::Display for ControllerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ControllerState::Uninitialized => write!(f, "uninitialized"),
            ControllerState::Starting => write!(f, "starting"),
            ControllerState::Ready => write!(f, "ready"),
            ControllerState::Busy => write!(f, "busy"),
            ControllerState::Paused => write!(f, "paused"),
            ControllerState::Dead => write!(f, "dead"),
        }
    }
}

/// Command held in the controller's local queue while automation is paused.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedCommand {
    pub text: String,
    pub submit: bool,
}

/// Automation slice of the controller status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutomationStatus {
    pub paused: bool,
    pub reason: Option<String>,
    pub manual_clients: Vec<String>,
    pub pending_commands: usize,
}

/// Serializable controller status consumed by the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerStatus {
    pub session: String,
    pub exists: bool,
    pub state: ControllerState,
    pub automation: AutomationStatus,
    pub health: crate::health::HealthStats,
    pub restart: crate::restart::RestartStats,
}

/// Drives one assistant CLI inside a detachable session.
pub struct AgentController {
    name: String,
    backend: Box<dyn SessionBackend>,
    tunables: AgentTunables,
    state: ControllerState,
    paused: bool,
    pause_reason: Option<String>,
    manual_clients: Vec<String>,
    pending: VecDeque<QueuedCommand>,
    last_snapshot: Option<Vec<String>>,
    health: HealthChecker,
    restarter: AutoRestarter,
    send_retry: RetryPolicy,
}

/// Build the spawn spec for an agent session from its resolved tunables.
pub fn session_spec(session: &str, tunables: &AgentTunables) -> SessionSpec {
    let mut spec = SessionSpec::new(
        session,
        &tunables.executable,
        crate::utils::paths::working_dir(tunables.working_dir.as_ref()),
    )
    .with_args(tunables.executable_args.iter().cloned());
    spec.pane_width = tunables.pane_width;
    spec.pane_height = tunables.pane_height;
    spec
}

impl AgentController {
    pub fn new(
        name: impl Into<String>,
        backend: Box<dyn SessionBackend>,
        tunables: AgentTunables,
    ) -> Self {
        let health = HealthChecker::new(tunables.health.clone());
        let restarter = AutoRestarter::new(tunables.restart.clone());
        Self {
            name: name.into(),
            backend,
            tunables,
            state: ControllerState::Uninitialized,
            paused: false,
            pause_reason: None,
            manual_clients: Vec::new(),
            pending: VecDeque::new(),
            last_snapshot: None,
            health,
            restarter,
            send_retry: RetryPolicy::standard(),
        }
    }

    /// Replace the transport retry policy (tests use an instant one).
    pub fn with_send_retry(mut self, policy: RetryPolicy) -> Self {
        self.send_retry = policy;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn session_name(&self) -> &str {
        &self.backend.spec().name
    }

    pub fn tunables(&self) -> &AgentTunables {
        &self.tunables
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    // --- Lifecycle ----------------------------------------------------- //

    /// Start the assistant session and wait until it accepts input.
    pub async fn start_session(&mut self, auto_confirm_trust: bool) -> Result<(), CoreError> {
        if self.backend.session_exists().await {
            return Err(CoreError::SessionAlreadyExists(
                self.session_name().to_string(),
            ));
        }

        info!(session = %self.session_name(), "starting session");
        self.state = ControllerState::Starting;

        if let Err(err) = self.backend.start().await {
            self.state = ControllerState::Dead;
            return Err(err.into());
        }

        sleep(self.tunables.init_wait).await;

        if auto_confirm_trust {
            // Accept the default choice on any initial trust prompt.
            if let Err(err) = self.send_enter_retried().await {
                self.state = ControllerState::Dead;
                return Err(err);
            }
            sleep(Duration::from_secs(1)).await;
        }

        if !self.wait_for_startup(self.tunables.startup_timeout).await {
            self.state = ControllerState::Dead;
            return Err(CoreError::StartupTimeout {
                session: self.session_name().to_string(),
                timeout_secs: self.tunables.startup_timeout.as_secs(),
            });
        }

        // Let the input buffer settle before trusting keystrokes.
        sleep(self.tunables.ready_stabilization_delay).await;

        if !self.backend.session_exists().await {
            self.state = ControllerState::Dead;
            return Err(CoreError::SessionDead(self.session_name().to_string()));
        }

        self.state = ControllerState::Ready;
        info!(session = %self.session_name(), "session ready");
        Ok(())
    }

    /// Poll the pane until the assistant looks started.
    ///
    /// With indicators configured, startup requires at least one ready
    /// indicator visible and no loading indicator. Without indicators, a
    /// pane with more than 50 non-whitespace characters counts as started.
    pub async fn wait_for_startup(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let raw = self
                .backend
                .capture_output(None, None)
                .await
                .unwrap_or_default();
            let text = self.indicator_text(&raw);

            let started = if self.tunables.ready_indicators.is_empty() {
                non_whitespace_len(&text) > 50
            } else {
                let ready = self
                    .tunables
                    .ready_indicators
                    .iter()
                    .any(|ind| text.contains(ind));
                let loading = self
                    .tunables
                    .loading_indicators
                    .iter()
                    .any(|ind| text.contains(ind));
                ready && !loading
            };

            if started {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            sleep(STARTUP_POLL_INTERVAL.min(timeout)).await;
        }
    }

    /// Kill the session if present and return whether a kill happened.
    pub async fn kill_session(&mut self) -> Result<bool, CoreError> {
        if !self.backend.session_exists().await {
            return Ok(false);
        }
        self.backend.kill().await?;
        self.state = ControllerState::Dead;
        Ok(true)
    }

    pub async fn session_exists(&self) -> bool {
        self.backend.session_exists().await
    }

    // --- Command dispatch ---------------------------------------------- //

    /// Send a command, submitting it when `submit` is set.
    ///
    /// Returns `Ok(false)` when automation is paused and the command was
    /// queued locally instead. The manual-control probe and the enqueue or
    /// send happen under this method's exclusive borrow, so the outcome is
    /// always "active then sent" or "paused then queued".
    pub async fn send_command(&mut self, command: &str, submit: bool) -> Result<bool, CoreError> {
        if self.probe_manual_clients().await {
            // Resumed just now: queued work goes out before the new command.
            self.drain_pending().await?;
        }

        if self.paused {
            self.pending.push_back(QueuedCommand {
                text: command.to_string(),
                submit,
            });
            info!(
                session = %self.session_name(),
                pending = self.pending.len(),
                reason = self.pause_reason.as_deref().unwrap_or("unknown"),
                "automation paused; queued command"
            );
            return Ok(false);
        }

        if !self.pending.is_empty() {
            self.drain_pending().await?;
            if self.paused {
                self.pending.push_back(QueuedCommand {
                    text: command.to_string(),
                    submit,
                });
                return Ok(false);
            }
        }

        if !self.backend.session_exists().await {
            self.state = ControllerState::Dead;
            return Err(CoreError::SessionDead(self.session_name().to_string()));
        }

        // Snapshot for later delta computation.
        self.last_snapshot = match self.backend.capture_output(None, None).await {
            Ok(text) => Some(text.lines().map(str::to_string).collect()),
            Err(_) => None,
        };

        self.dispatch_now(command, submit).await?;
        Ok(true)
    }

    /// Deliver a command to the backend without probing automation state.
    async fn dispatch_now(&mut self, command: &str, submit: bool) -> Result<(), CoreError> {
        // A literal newline would submit a partial prompt; collapse the
        // command to a single line before injection.
        let normalized = normalize_command(command);
        if !normalized.is_empty() {
            self.send_text_retried(&normalized).await?;
        }

        sleep(self.tunables.post_text_delay).await;

        if submit {
            sleep(self.tunables.text_enter_delay).await;
            let submit_key = self.tunables.submit_key.clone();
            self.send_key_retried(&submit_key).await?;
            if submit_key != "Enter" {
                // Some UIs take one, some the other.
                self.send_enter_retried().await?;
            }
            if !self.tunables.submit_fallback_keys.is_empty() {
                self.confirm_submission().await;
            }
            self.state = ControllerState::Busy;
        }
        Ok(())
    }

    /// After the primary submit, verify the command started executing and
    /// walk the fallback key chain if it did not.
    async fn confirm_submission(&mut self) {
        sleep(self.tunables.submit_retry_delay).await;
        if self.loading_indicator_visible().await {
            return;
        }

        let pause = self
            .tunables
            .submit_retry_delay
            .max(Duration::from_millis(100));
        let fallbacks = self.tunables.submit_fallback_keys.clone();
        for key in fallbacks {
            debug!(session = %self.session_name(), key = %key, "trying fallback submit key");
            if let Err(err) = self.backend.send_key(&key).await {
                warn!(
                    session = %self.session_name(),
                    "fallback submit key '{}' failed: {}",
                    key,
                    err
                );
                continue;
            }
            sleep(pause).await;
            if self.loading_indicator_visible().await {
                break;
            }
        }
    }

    /// Interrupt the in-progress response.
    pub async fn interrupt(&self) -> Result<(), CoreError> {
        self.backend.send_ctrl_c().await.map_err(Into::into)
    }

    // --- Manual takeover lease ----------------------------------------- //

    /// Observe attached clients and update the lease.
    ///
    /// New clients pause automation with reason `manual-attach`; once the
    /// clients detach again, automation resumes and the local queue drains.
    pub async fn update_manual_control_state(&mut self) -> Result<(), CoreError> {
        if self.probe_manual_clients().await {
            self.drain_pending().await?;
        }
        Ok(())
    }

    /// Probe `list_clients` and apply pause/resume transitions. Returns
    /// true when the probe just resumed automation (caller drains).
    async fn probe_manual_clients(&mut self) -> bool {
        let clients = match self.backend.list_clients().await {
            Ok(clients) => clients,
            Err(SessionError::NotFound(_)) => {
                self.manual_clients.clear();
                return false;
            }
            Err(err) => {
                debug!(session = %self.session_name(), "client probe failed: {}", err);
                return false;
            }
        };

        if !self.tunables.pause_on_manual_clients {
            self.manual_clients = clients;
            return false;
        }

        if !clients.is_empty() {
            if !self.paused {
                info!(
                    session = %self.session_name(),
                    clients = ?clients,
                    "manual client attached; pausing automation"
                );
                self.paused = true;
                self.pause_reason = Some(MANUAL_ATTACH_REASON.to_string());
                self.state = ControllerState::Paused;
            }
            self.manual_clients = clients;
            return false;
        }

        self.manual_clients.clear();
        if self.paused && self.pause_reason.as_deref() == Some(MANUAL_ATTACH_REASON) {
            info!(
                session = %self.session_name(),
                "manual clients detached; resuming automation"
            );
            self.paused = false;
            self.pause_reason = None;
            if self.state == ControllerState::Paused {
                self.state = ControllerState::Ready;
            }
            return true;
        }
        false
    }

    /// Pause automation explicitly. Does not flush anything.
    pub fn pause_automation(&mut self, reason: &str) {
        info!(session = %self.session_name(), reason = %reason, "automation paused");
        self.paused = true;
        self.pause_reason = Some(reason.to_string());
        self.state = ControllerState::Paused;
    }

    /// Resume automation. Drains the local queue unless `flush_pending`
    /// is disabled; returns the number of flushed commands.
    pub async fn resume_automation(&mut self, flush_pending: bool) -> Result<usize, CoreError> {
        info!(session = %self.session_name(), flush = flush_pending, "automation resumed");
        self.paused = false;
        self.pause_reason = None;
        if self.state == ControllerState::Paused {
            self.state = ControllerState::Ready;
        }
        if flush_pending {
            self.drain_pending().await
        } else {
            Ok(0)
        }
    }

    /// Flush the local queue in FIFO order until it is empty or automation
    /// pauses again. A failed send leaves the command at the queue head.
    pub async fn drain_pending(&mut self) -> Result<usize, CoreError> {
        let mut flushed = 0;
        loop {
            if self.paused || self.pending.is_empty() {
                break;
            }
            self.probe_manual_clients().await;
            if self.paused {
                break;
            }

            let cmd = match self.pending.pop_front() {
                Some(cmd) => cmd,
                None => break,
            };

            if !self.backend.session_exists().await {
                self.pending.push_front(cmd);
                self.state = ControllerState::Dead;
                return Err(CoreError::SessionDead(self.session_name().to_string()));
            }

            if let Err(err) = self.dispatch_now(&cmd.text, cmd.submit).await {
                self.pending.push_front(cmd);
                return Err(err);
            }
            flushed += 1;
        }

        if flushed > 0 {
            info!(
                session = %self.session_name(),
                flushed,
                remaining = self.pending.len(),
                "drained queued commands"
            );
        }
        Ok(flushed)
    }

    // --- Ready detection ------------------------------------------------ //

    /// Wait for the assistant to finish the in-progress response, using
    /// the configured response timeout and poll interval.
    pub async fn wait_for_ready(&mut self) -> Result<bool, CoreError> {
        let timeout = self.tunables.response_timeout;
        let interval = self.tunables.ready_check_interval;
        self.wait_for_ready_with(timeout, interval).await
    }

    /// Two-phase readiness test.
    ///
    /// Phase A gates on loading indicators: while one is visible near the
    /// pane bottom the response is in progress, and after it clears the
    /// pane must stay quiet for the settle time. Phase B requires the raw
    /// capture to be stable across consecutive ticks and the configured
    /// completion markers and ready indicators to be visible in the pane
    /// tail. The half-timeout emits a warning; the full timeout returns
    /// false without error.
    pub async fn wait_for_ready_with(
        &mut self,
        timeout: Duration,
        interval: Duration,
    ) -> Result<bool, CoreError> {
        let start = Instant::now();
        let mut half_warned = false;
        let mut previous: Option<String> = None;
        let mut stable_count: u32 = 0;
        let mut submission_in_progress = false;
        let mut cleared_at: Option<Instant> = None;

        loop {
            if start.elapsed() >= timeout {
                warn!(
                    session = %self.session_name(),
                    "wait_for_ready timed out after {:.1}s",
                    timeout.as_secs_f64()
                );
                return Ok(false);
            }
            if !half_warned && start.elapsed() >= timeout / 2 {
                warn!(
                    session = %self.session_name(),
                    "still waiting for ready at half timeout ({:.1}s)",
                    timeout.as_secs_f64() / 2.0
                );
                half_warned = true;
            }

            let raw = match self.backend.capture_output(None, None).await {
                Ok(text) => text,
                Err(SessionError::NotFound(_)) => return Ok(false),
                Err(err) => {
                    debug!(session = %self.session_name(), "capture failed: {}", err);
                    sleep(interval).await;
                    continue;
                }
            };

            let matchable = self.indicator_text(&raw);
            let lines: Vec<&str> = matchable.lines().collect();
            let loading_tail = tail_join(&lines, LOADING_SCAN_LINES);
            let ready_tail = tail_join(&lines, READY_SCAN_LINES);

            let loading_visible = self
                .tunables
                .loading_indicators
                .iter()
                .any(|ind| loading_tail.contains(ind));

            if loading_visible {
                submission_in_progress = true;
                cleared_at = None;
                stable_count = 0;
                previous = Some(raw);
                sleep(interval).await;
                continue;
            }

            if submission_in_progress && cleared_at.is_none() {
                cleared_at = Some(Instant::now());
            }
            let settle_ok = if submission_in_progress {
                cleared_at
                    .map(|at| at.elapsed() >= self.tunables.loading_indicator_settle_time)
                    .unwrap_or(false)
            } else {
                true
            };

            if previous.as_deref() == Some(raw.as_str()) {
                stable_count += 1;
            } else {
                stable_count = 0;
            }
            previous = Some(raw);

            let markers_ok = self
                .tunables
                .response_complete_markers
                .iter()
                .all(|marker| ready_tail.contains(marker));
            let ready_ok = self.tunables.ready_indicators.is_empty()
                || self
                    .tunables
                    .ready_indicators
                    .iter()
                    .any(|ind| ready_tail.contains(ind));

            if stable_count >= self.tunables.ready_stable_checks
                && settle_ok
                && markers_ok
                && ready_ok
            {
                if self.state == ControllerState::Busy {
                    self.state = ControllerState::Ready;
                }
                return Ok(true);
            }

            sleep(interval).await;
        }
    }

    // --- Output -------------------------------------------------------- //

    /// Lines added to the visible pane since the last snapshot.
    ///
    /// Computes the longest common line-prefix between the cached snapshot
    /// and the current capture and returns the suffix, bounded by
    /// `tail_lines`. On a first call or when the captures cannot be
    /// aligned, returns the last `tail_lines` lines.
    pub async fn get_last_output(&mut self, tail_lines: usize) -> Result<String, CoreError> {
        let raw = self.backend.capture_output(None, None).await?;
        let current: Vec<String> = raw.lines().map(str::to_string).collect();

        let delta: Vec<String> = match &self.last_snapshot {
            Some(previous) if !previous.is_empty() && current.len() >= previous.len() => {
                let mut prefix = 0;
                while prefix < previous.len() && previous[prefix] == current[prefix] {
                    prefix += 1;
                }
                current[prefix..].to_vec()
            }
            _ => current.clone(),
        };

        let bounded = if delta.len() > tail_lines {
            delta[delta.len() - tail_lines..].to_vec()
        } else {
            delta
        };

        self.last_snapshot = Some(current);
        Ok(bounded.join("\n"))
    }

    /// Drop the cached snapshot so the next delta uses the full tail.
    pub fn reset_output_cache(&mut self) {
        self.last_snapshot = None;
    }

    pub async fn capture_output(&self) -> Result<String, CoreError> {
        self.backend
            .capture_output(None, None)
            .await
            .map_err(Into::into)
    }

    pub async fn capture_scrollback(&self) -> Result<String, CoreError> {
        self.backend.capture_scrollback().await.map_err(Into::into)
    }

    /// Attach the calling terminal for manual observation.
    pub async fn attach(&self, read_only: bool) -> Result<(), CoreError> {
        self.backend.attach(read_only).await.map_err(Into::into)
    }

    // --- Health & restart ----------------------------------------------- //

    /// Run one health probe of the given kind and record the outcome.
    pub async fn perform_health_check(&mut self, kind: HealthCheckKind) -> HealthCheckResult {
        let result = match kind {
            HealthCheckKind::SessionAlive => {
                let exists = self.backend.session_exists().await;
                self.health.evaluate_session_alive(exists)
            }
            HealthCheckKind::OutputResponsive => {
                match self.backend.capture_output(None, None).await {
                    Ok(output) => self.health.evaluate_output_responsive(&output),
                    Err(err) => self.health.evaluate_probe_error(kind, &err.to_string()),
                }
            }
            HealthCheckKind::CommandEcho => {
                let probe = DEFAULT_ECHO_PROBE;
                match self.send_command(probe, true).await {
                    Ok(true) => {
                        let timeout = self.health.config().response_timeout;
                        let interval = self.tunables.ready_check_interval;
                        let ready = self
                            .wait_for_ready_with(timeout, interval)
                            .await
                            .unwrap_or(false);
                        let output = self
                            .backend
                            .capture_output(None, None)
                            .await
                            .unwrap_or_default();
                        self.health.evaluate_command_echo(probe, ready, &output)
                    }
                    Ok(false) => self
                        .health
                        .evaluate_probe_error(kind, "automation paused during echo probe"),
                    Err(err) => self.health.evaluate_probe_error(kind, &err.to_string()),
                }
            }
        };

        self.health.record(&result);
        result
    }

    pub fn health(&self) -> &HealthChecker {
        &self.health
    }

    pub fn restarter(&self) -> &AutoRestarter {
        &self.restarter
    }

    /// Kill (when present) and start the session again. A successful
    /// restart clears the health checker's consecutive-failure counter.
    pub async fn restart_session(&mut self, reason: &str) -> Result<(), CoreError> {
        info!(session = %self.session_name(), reason = %reason, "restarting session");

        if self.backend.session_exists().await {
            if let Err(err) = self.backend.kill().await {
                warn!(session = %self.session_name(), "kill before restart failed: {}", err);
            }
        }
        sleep(RESTART_KILL_WAIT).await;

        self.start_session(true).await?;
        self.health.reset();
        Ok(())
    }

    /// Restart through the auto-restarter's policy, window, and backoff.
    /// Returns whether a restart was attempted and succeeded.
    pub async fn auto_restart_if_needed(&mut self, reason: &str) -> bool {
        if !self.restarter.should_restart(reason) {
            return false;
        }

        let delay = self.restarter.calculate_backoff();
        if !delay.is_zero() {
            info!(
                session = %self.session_name(),
                "waiting {:.2}s before restart attempt ({})",
                delay.as_secs_f64(),
                reason
            );
            sleep(delay).await;
        }

        let started = std::time::Instant::now();
        let outcome = self.restart_session(reason).await;
        let elapsed = started.elapsed().as_secs_f64();

        let (success, error_message) = match &outcome {
            Ok(()) => (true, None),
            Err(err) => (false, Some(err.to_string())),
        };
        self.restarter.record_attempt(RestartAttempt {
            timestamp: chrono::Utc::now(),
            success,
            reason: reason.to_string(),
            error_message,
            elapsed_secs: elapsed,
        });
        success
    }

    // --- Status --------------------------------------------------------- //

    pub async fn status(&self) -> ControllerStatus {
        ControllerStatus {
            session: self.session_name().to_string(),
            exists: self.backend.session_exists().await,
            state: self.state,
            automation: AutomationStatus {
                paused: self.paused,
                reason: self.pause_reason.clone(),
                manual_clients: self.manual_clients.clone(),
                pending_commands: self.pending.len(),
            },
            health: self.health.stats(),
            restart: self.restarter.stats(),
        }
    }

    // --- Internal helpers ----------------------------------------------- //

    fn indicator_text(&self, raw: &str) -> String {
        if self.tunables.strip_ansi_for_indicators {
            strip_ansi(raw)
        } else {
            raw.to_string()
        }
    }

    async fn loading_indicator_visible(&self) -> bool {
        if self.tunables.loading_indicators.is_empty() {
            return false;
        }
        let raw = match self.backend.capture_output(None, None).await {
            Ok(text) => text,
            Err(_) => return false,
        };
        let text = self.indicator_text(&raw);
        let lines: Vec<&str> = text.lines().collect();
        let tail = tail_join(&lines, LOADING_SCAN_LINES);
        self.tunables
            .loading_indicators
            .iter()
            .any(|ind| tail.contains(ind))
    }

    async fn send_text_retried(&self, text: &str) -> Result<(), CoreError> {
        let backend = self.backend.as_ref();
        self.send_retry
            .run("send_text", || async move {
                backend.send_text(text).await.map_err(map_send_error)
            })
            .await
    }

    async fn send_key_retried(&self, key: &str) -> Result<(), CoreError> {
        let backend = self.backend.as_ref();
        self.send_retry
            .run("send_key", || async move {
                backend.send_key(key).await.map_err(map_send_error)
            })
            .await
    }

    async fn send_enter_retried(&self) -> Result<(), CoreError> {
        let backend = self.backend.as_ref();
        self.send_retry
            .run("send_enter", || async move {
                backend.send_enter().await.map_err(map_send_error)
            })
            .await
    }
}

/// A session that disappears mid-send is dead, not retryable.
fn map_send_error(err: SessionError) -> CoreError {
    match err {
        SessionError::NotFound(name) => CoreError::SessionDead(name),
        other => other.into(),
    }
}

fn tail_join(lines: &[&str], count: usize) -> String {
    let start = lines.len().saturating_sub(count);
    lines[start..].join("\n")
}
