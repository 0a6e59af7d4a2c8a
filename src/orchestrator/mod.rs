//! Cross-agent dispatch with pause-aware queueing.
//!
//! The orchestrator holds the controllers and a per-agent queue of commands
//! deferred while a human drives the session. Dispatch consults the
//! controller's automation state: paused controllers get their command
//! queued at the orchestrator level, and a controller that pauses mid-send
//! keeps the command in its own local queue. `tick()` flushes whatever
//! became runnable again.

pub mod context;
pub mod conversation;
pub mod router;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex as QueueMutex, MutexGuard};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::controller::{AgentController, ControllerStatus};
use crate::error::CoreError;
use crate::utils::text::truncate_with_ellipsis;

use self::context::ContextManager;
use self::conversation::{ConversationManager, Turn};
use self::router::MessageRouter;

/// Which queue absorbed a deferred command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueSource {
    /// Queued by the orchestrator before the controller was touched.
    Orchestrator,
    /// The controller paused during the send and queued it locally.
    Controller,
}

/// Outcome of one dispatch request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchSummary {
    /// The controller executed the command.
    pub dispatched: bool,
    /// The command was queued instead of sent.
    pub queued: bool,
    pub queue_source: Option<QueueSource>,
    /// Pause reason reported by the controller, if any.
    pub reason: Option<String>,
    pub manual_clients: Vec<String>,
    /// Commands waiting in the orchestrator queue for this agent.
    pub pending: usize,
    /// Pending count reported by the controller itself.
    pub controller_pending: Option<usize>,
    /// Error note for non-fatal dispatch failures (dead session).
    pub error: Option<String>,
}

/// Outcome of flushing one agent's orchestrator queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlushSummary {
    pub flushed: usize,
    pub remaining: usize,
    pub paused: bool,
    pub reason: Option<String>,
}

/// Options for [`Orchestrator::start_discussion`].
#[derive(Debug, Clone)]
pub struct DiscussionOptions {
    /// Ordered participant names; all registered controllers when empty.
    pub participants: Vec<String>,
    pub max_turns: usize,
    pub include_history: bool,
    pub max_history: usize,
    /// Bound on scrollback-delta lines captured per turn.
    pub capture_tail_limit: usize,
}

impl Default for DiscussionOptions {
    fn default() -> Self {
        Self {
            participants: Vec::new(),
            max_turns: 10,
            include_history: true,
            max_history: 200,
            capture_tail_limit: 500,
        }
    }
}

/// Everything produced by a facilitated discussion.
pub struct DiscussionOutcome {
    pub conversation: Vec<Turn>,
    pub manager: ConversationManager,
}

/// Coordinates collaborative workflows across agent controllers.
pub struct Orchestrator {
    controllers: DashMap<String, Arc<Mutex<AgentController>>>,
    /// Per-agent deferred commands. Guarded by a synchronous mutex: the
    /// critical sections are short and never held across an await.
    pending: DashMap<String, QueueMutex<VecDeque<(String, bool)>>>,
    debug_prompts: std::sync::atomic::AtomicBool,
    debug_prompt_chars: std::sync::atomic::AtomicUsize,
}

fn lock_queue<'a>(
    queue: &'a QueueMutex<VecDeque<(String, bool)>>,
) -> MutexGuard<'a, VecDeque<(String, bool)>> {
    queue.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Default for Orchestrator {
    fn default() -> Self {
        Self::new()
    }
}

impl Orchestrator {
    pub fn new() -> Self {
        Self {
            controllers: DashMap::new(),
            pending: DashMap::new(),
            debug_prompts: std::sync::atomic::AtomicBool::new(false),
            debug_prompt_chars: std::sync::atomic::AtomicUsize::new(200),
        }
    }

    // --- Controller registration --------------------------------------- //

    /// Register (or replace) a controller under `name`.
    pub fn register_controller(&self, name: impl Into<String>, controller: AgentController) {
        let name = name.into();
        debug!(agent = %name, "registered controller");
        self.controllers
            .insert(name.clone(), Arc::new(Mutex::new(controller)));
        self.pending.entry(name).or_default();
    }

    /// Remove a controller; no-op when unknown.
    pub fn unregister_controller(&self, name: &str) {
        debug!(agent = %name, "unregistered controller");
        self.controllers.remove(name);
        self.pending.remove(name);
    }

    pub fn controller_names(&self) -> Vec<String> {
        self.controllers
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    pub fn has_controller(&self, name: &str) -> bool {
        self.controllers.contains_key(name)
    }

    /// Shared handle to a registered controller.
    pub fn controller(&self, name: &str) -> Option<Arc<Mutex<AgentController>>> {
        self.controllers.get(name).map(|entry| entry.value().clone())
    }

    /// Latest status reported by the controller.
    pub async fn controller_status(&self, name: &str) -> Result<ControllerStatus, CoreError> {
        let controller = self
            .controller(name)
            .ok_or_else(|| CoreError::UnknownController(name.to_string()))?;
        let guard = controller.lock().await;
        Ok(guard.status().await)
    }

    /// Commands waiting in the orchestrator queue for one agent, or for
    /// all agents when `name` is `None`.
    pub fn pending_command_count(&self, name: Option<&str>) -> usize {
        match name {
            Some(name) => self
                .pending
                .get(name)
                .map(|queue| lock_queue(queue.value()).len())
                .unwrap_or(0),
            None => self
                .pending
                .iter()
                .map(|entry| lock_queue(entry.value()).len())
                .sum(),
        }
    }

    // --- Prompt debugging ----------------------------------------------- //

    /// Log a preview of every dispatched prompt.
    pub fn set_prompt_debug(&self, enabled: bool, preview_chars: usize) {
        self.debug_prompts
            .store(enabled, std::sync::atomic::Ordering::Relaxed);
        self.debug_prompt_chars
            .store(preview_chars, std::sync::atomic::Ordering::Relaxed);
    }

    // --- Dispatch ------------------------------------------------------- //

    /// Dispatch a command to `name`, respecting automation pauses.
    pub async fn dispatch_command(
        &self,
        name: &str,
        command: &str,
        submit: bool,
    ) -> Result<DispatchSummary, CoreError> {
        if self.debug_prompts.load(std::sync::atomic::Ordering::Relaxed) {
            let preview_chars = self
                .debug_prompt_chars
                .load(std::sync::atomic::Ordering::Relaxed);
            info!(
                "[prompt-debug] {} len={} preview={:?}",
                name,
                command.len(),
                truncate_with_ellipsis(command, preview_chars)
            );
        }

        let controller = self
            .controller(name)
            .ok_or_else(|| CoreError::UnknownController(name.to_string()))?;
        let mut guard = controller.lock().await;

        let status = guard.status().await;
        if status.automation.paused {
            drop(guard);
            return Ok(self.queue_command(name, command, submit, &status));
        }

        match guard.send_command(command, submit).await {
            Ok(true) => Ok(DispatchSummary {
                dispatched: true,
                queued: false,
                queue_source: None,
                reason: status.automation.reason,
                manual_clients: status.automation.manual_clients,
                pending: self.pending_command_count(Some(name)),
                controller_pending: Some(guard.pending_count()),
                error: None,
            }),
            Ok(false) => {
                // The controller paused between our status read and the
                // send; re-read to attribute the outcome.
                let status_after = guard.status().await;
                if status_after.automation.paused {
                    info!(
                        agent = %name,
                        "controller paused during dispatch; relying on controller queue"
                    );
                    Ok(DispatchSummary {
                        dispatched: false,
                        queued: true,
                        queue_source: Some(QueueSource::Controller),
                        reason: status_after.automation.reason,
                        manual_clients: status_after.automation.manual_clients,
                        pending: self.pending_command_count(Some(name)),
                        controller_pending: Some(status_after.automation.pending_commands),
                        error: None,
                    })
                } else {
                    Ok(DispatchSummary {
                        dispatched: false,
                        queued: false,
                        queue_source: None,
                        reason: status_after.automation.reason,
                        manual_clients: status_after.automation.manual_clients,
                        pending: self.pending_command_count(Some(name)),
                        controller_pending: Some(status_after.automation.pending_commands),
                        error: None,
                    })
                }
            }
            Err(CoreError::SessionDead(session)) => {
                // Dead sessions are never retried and never queued.
                warn!(agent = %name, session = %session, "dispatch failed: session dead");
                Ok(DispatchSummary {
                    dispatched: false,
                    queued: false,
                    queue_source: None,
                    reason: None,
                    manual_clients: Vec::new(),
                    pending: self.pending_command_count(Some(name)),
                    controller_pending: Some(guard.pending_count()),
                    error: Some(format!("session '{}' is dead", session)),
                })
            }
            Err(err) => Err(err),
        }
    }

    fn queue_command(
        &self,
        name: &str,
        command: &str,
        submit: bool,
        status: &ControllerStatus,
    ) -> DispatchSummary {
        let entry = self.pending.entry(name.to_string()).or_default();
        let mut queue = lock_queue(entry.value());
        queue.push_back((command.to_string(), submit));
        let pending = queue.len();
        drop(queue);
        drop(entry);

        info!(
            agent = %name,
            reason = status.automation.reason.as_deref().unwrap_or("unknown"),
            pending,
            controller_pending = status.automation.pending_commands,
            "controller paused; queued command"
        );

        DispatchSummary {
            dispatched: false,
            queued: true,
            queue_source: Some(QueueSource::Orchestrator),
            reason: status.automation.reason.clone(),
            manual_clients: status.automation.manual_clients.clone(),
            pending,
            controller_pending: Some(status.automation.pending_commands),
            error: None,
        }
    }

    // --- Pending queue management --------------------------------------- //

    /// Flush queued commands for `name` while the controller stays
    /// unpaused and sends keep succeeding. Unsent items stay at the head.
    pub async fn process_pending(&self, name: &str) -> Result<FlushSummary, CoreError> {
        let controller = self
            .controller(name)
            .ok_or_else(|| CoreError::UnknownController(name.to_string()))?;

        let mut guard = controller.lock().await;

        // Re-probe the manual-takeover lease so a detach observed since the
        // last dispatch resumes automation and drains the controller's own
        // queue before we touch ours.
        if let Err(err) = guard.update_manual_control_state().await {
            debug!(agent = %name, "manual-state refresh failed: {}", err);
        }

        if self.pending_command_count(Some(name)) == 0 {
            return Ok(FlushSummary {
                flushed: 0,
                remaining: 0,
                paused: guard.is_paused(),
                reason: None,
            });
        }

        let status = guard.status().await;
        if status.automation.paused {
            debug!(
                agent = %name,
                reason = status.automation.reason.as_deref().unwrap_or("unknown"),
                "still paused; skipping flush"
            );
            return Ok(FlushSummary {
                flushed: 0,
                remaining: self.pending_command_count(Some(name)),
                paused: true,
                reason: status.automation.reason,
            });
        }

        let mut flushed = 0;
        loop {
            // Peek without removing so a failed send leaves the command
            // at the queue head.
            let next = {
                let entry = match self.pending.get(name) {
                    Some(entry) => entry,
                    None => break,
                };
                let queue = lock_queue(entry.value());
                queue.front().cloned()
            };
            let Some((command, submit)) = next else { break };

            match guard.send_command(&command, submit).await {
                Ok(true) => {
                    if let Some(entry) = self.pending.get(name) {
                        lock_queue(entry.value()).pop_front();
                    }
                    flushed += 1;
                }
                Ok(false) => break,
                Err(err) => {
                    warn!(agent = %name, "flush stopped on error: {}", err);
                    break;
                }
            }
        }

        Ok(FlushSummary {
            flushed,
            remaining: self.pending_command_count(Some(name)),
            paused: false,
            reason: None,
        })
    }

    /// Flush every agent's queue once.
    pub async fn process_all_pending(&self) -> Vec<(String, FlushSummary)> {
        let mut results = Vec::new();
        for name in self.controller_names() {
            match self.process_pending(&name).await {
                Ok(summary) => results.push((name, summary)),
                Err(err) => warn!(agent = %name, "pending flush failed: {}", err),
            }
        }
        results
    }

    /// Convenience hook for external loops and turn boundaries.
    pub async fn tick(&self) -> Vec<(String, FlushSummary)> {
        self.process_all_pending().await
    }

    // --- Higher-level helpers -------------------------------------------- //

    /// Run a facilitated discussion between registered controllers,
    /// constructing a context manager and message router when the caller
    /// does not supply them.
    pub async fn start_discussion(
        self: &Arc<Self>,
        topic: &str,
        options: DiscussionOptions,
        context_manager: Option<ContextManager>,
        message_router: Option<MessageRouter>,
    ) -> Result<DiscussionOutcome, CoreError> {
        let participants = if options.participants.is_empty() {
            self.controller_names()
        } else {
            options.participants.clone()
        };
        if participants.is_empty() {
            return Err(CoreError::Config(
                "start_discussion requires at least one participant".to_string(),
            ));
        }

        let ctx = context_manager.unwrap_or_default();
        let router =
            message_router.unwrap_or_else(|| MessageRouter::new(participants.clone(), 8));

        let mut manager = ConversationManager::new(
            Arc::clone(self),
            participants,
            Some(ctx),
            Some(router),
            options.max_history,
            options.include_history,
        )?
        .with_capture_tail_limit(options.capture_tail_limit);
        let conversation = manager.facilitate_discussion(topic, options.max_turns).await;

        Ok(DiscussionOutcome {
            conversation,
            manager,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::profiles::AgentTunables;
    use crate::utils::retry::RetryPolicy;
    use mux_session::{ScriptedBackend, SessionSpec};
    use std::time::Duration;

    fn orchestrator_with_stub(name: &str) -> (Arc<Orchestrator>, Arc<ScriptedBackend>) {
        let backend = Arc::new(ScriptedBackend::running(SessionSpec::new(
            name, "stub", "/tmp",
        )));
        let controller = AgentController::new(
            name,
            Box::new(backend.clone()),
            AgentTunables::stub(),
        )
        .with_send_retry(RetryPolicy::new(2, Duration::ZERO, Duration::ZERO, 2.0));

        let orchestrator = Arc::new(Orchestrator::new());
        orchestrator.register_controller(name, controller);
        (orchestrator, backend)
    }

    #[tokio::test]
    async fn test_dispatch_to_unknown_controller() {
        let orchestrator = Orchestrator::new();
        let result = orchestrator.dispatch_command("ghost", "hello", true).await;
        assert!(matches!(result, Err(CoreError::UnknownController(_))));
    }

    #[tokio::test]
    async fn test_dispatch_sends_when_active() {
        let (orchestrator, backend) = orchestrator_with_stub("claude");

        let summary = orchestrator
            .dispatch_command("claude", "hello there", true)
            .await
            .unwrap();
        assert!(summary.dispatched);
        assert!(!summary.queued);
        assert_eq!(summary.queue_source, None);
        assert_eq!(backend.sent_text(), "hello there");
    }

    #[tokio::test]
    async fn test_dispatch_queues_when_manual_client_attached() {
        let (orchestrator, backend) = orchestrator_with_stub("gemini");
        backend.push_clients(vec!["/dev/pts/1".to_string()]);

        // First dispatch discovers the client mid-send: the controller
        // pauses and keeps the command in its own queue.
        let summary = orchestrator
            .dispatch_command("gemini", "go", true)
            .await
            .unwrap();
        assert!(!summary.dispatched);
        assert!(summary.queued);
        assert_eq!(summary.queue_source, Some(QueueSource::Controller));
        assert_eq!(summary.reason.as_deref(), Some("manual-attach"));
        assert_eq!(summary.controller_pending, Some(1));

        // The next dispatch sees the paused status up front and queues at
        // the orchestrator level.
        let summary = orchestrator
            .dispatch_command("gemini", "again", true)
            .await
            .unwrap();
        assert!(summary.queued);
        assert_eq!(summary.queue_source, Some(QueueSource::Orchestrator));
        assert_eq!(summary.pending, 1);
        assert!(backend.sent().is_empty());
    }

    #[tokio::test]
    async fn test_tick_flushes_after_detach() {
        let (orchestrator, backend) = orchestrator_with_stub("gemini");
        backend.push_clients(vec!["/dev/pts/1".to_string()]);

        orchestrator
            .dispatch_command("gemini", "go", true)
            .await
            .unwrap();
        orchestrator
            .dispatch_command("gemini", "second", true)
            .await
            .unwrap();
        assert_eq!(orchestrator.pending_command_count(Some("gemini")), 1);

        backend.push_clients(vec![]);
        let results = orchestrator.tick().await;
        let (_, summary) = results
            .iter()
            .find(|(name, _)| name == "gemini")
            .expect("gemini summary");
        // The controller drained its own queue when the client detached,
        // then the orchestrator queue flushed through send_command.
        assert_eq!(summary.flushed, 1);
        assert_eq!(summary.remaining, 0);
        assert_eq!(orchestrator.pending_command_count(Some("gemini")), 0);
        assert_eq!(backend.sent_text(), "gosecond");
    }

    #[tokio::test]
    async fn test_process_pending_stays_queued_while_paused() {
        let (orchestrator, backend) = orchestrator_with_stub("claude");
        {
            let controller = orchestrator.controller("claude").unwrap();
            controller.lock().await.pause_automation("manual");
        }

        let summary = orchestrator
            .dispatch_command("claude", "later", true)
            .await
            .unwrap();
        assert_eq!(summary.queue_source, Some(QueueSource::Orchestrator));

        let flush = orchestrator.process_pending("claude").await.unwrap();
        assert!(flush.paused);
        assert_eq!(flush.flushed, 0);
        assert_eq!(flush.remaining, 1);
        assert!(backend.sent().is_empty());
    }

    #[tokio::test]
    async fn test_dead_session_reports_without_queueing() {
        let backend = Arc::new(ScriptedBackend::stopped(SessionSpec::new(
            "claude", "stub", "/tmp",
        )));
        let controller = AgentController::new(
            "claude",
            Box::new(backend),
            AgentTunables::stub(),
        );
        let orchestrator = Arc::new(Orchestrator::new());
        orchestrator.register_controller("claude", controller);

        let summary = orchestrator
            .dispatch_command("claude", "hello", true)
            .await
            .unwrap();
        assert!(!summary.dispatched);
        assert!(!summary.queued);
        assert!(summary.error.unwrap().contains("dead"));
        assert_eq!(orchestrator.pending_command_count(Some("claude")), 0);
    }

    #[tokio::test]
    async fn test_unregister_controller() {
        let (orchestrator, _backend) = orchestrator_with_stub("claude");
        assert!(orchestrator.has_controller("claude"));
        orchestrator.unregister_controller("claude");
        assert!(!orchestrator.has_controller("claude"));
        assert_eq!(orchestrator.pending_command_count(None), 0);
    }
}
