//! Turn-taking between controllers, with consensus/conflict detection.
//!
//! The conversation manager selects the next speaker (round-robin with a
//! queued-retry rule), builds the prompt through the context manager and
//! router, dispatches it through the orchestrator, captures the response as
//! a scrollback delta, records and routes the turn, and stops on queued
//! dispatches, consensus, or conflict.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::sync::OnceLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::CoreError;
use crate::parser::{MarkerOutputParser, OutputParser, ParsedOutput};

use super::context::ContextManager;
use super::router::MessageRouter;
use super::{DispatchSummary, Orchestrator};

/// Substrings that signal consensus in a response.
const CONSENSUS_KEYWORDS: [&str; 4] = ["consensus", "agreement reached", "we agree", "aligned"];

/// Single words that signal conflict.
const CONFLICT_KEYWORDS: [&str; 4] = ["disagree", "blocker", "conflict", "reject"];

/// Phrases that signal conflict.
const CONFLICT_PHRASES: [&str; 5] = [
    "cannot agree",
    "cannot accept",
    "cannot support",
    "cannot proceed",
    "cannot endorse",
];

fn code_fence_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(?s)```.*?```").expect("valid fence pattern"))
}

fn inline_code_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"`[^`]*`").expect("valid inline-code pattern"))
}

fn quoted_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r#""[^"]*"|'[^']*'"#).expect("valid quote pattern"))
}

/// Flags attached to a recorded turn.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TurnMetadata {
    #[serde(default)]
    pub queued: bool,
    #[serde(default)]
    pub consensus: bool,
    #[serde(default)]
    pub conflict: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conflict_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stance: Option<String>,
}

/// One speaker's contribution to a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    /// Monotonic index across the conversation manager's lifetime.
    pub turn: u64,
    pub speaker: String,
    pub topic: String,
    /// The prompt actually dispatched.
    pub prompt: String,
    pub dispatch: DispatchSummary,
    /// Captured response text; absent for queued turns.
    pub response: Option<String>,
    /// Prompt echo extracted from the capture, when found.
    pub response_prompt: Option<String>,
    /// Cleaned transcript of the capture delta.
    pub response_transcript: Option<String>,
    pub metadata: TurnMetadata,
}

/// Coordinates turn-taking between registered controllers.
pub struct ConversationManager {
    orchestrator: Arc<Orchestrator>,
    participants: Vec<String>,
    context: Option<ContextManager>,
    router: Option<MessageRouter>,
    include_history: bool,
    max_history: usize,
    turn_counter: u64,
    history: VecDeque<Turn>,
    parser: Box<dyn OutputParser>,
    capture_tail_limit: usize,
    fallback_notices: HashSet<String>,
    conversation_id: Uuid,
}

impl ConversationManager {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        participants: Vec<String>,
        context: Option<ContextManager>,
        router: Option<MessageRouter>,
        max_history: usize,
        include_history: bool,
    ) -> Result<Self, CoreError> {
        if participants.is_empty() {
            return Err(CoreError::Config(
                "conversation requires at least one participant".to_string(),
            ));
        }

        let mut manager = Self {
            orchestrator,
            participants,
            context,
            router,
            include_history,
            max_history: max_history.max(1),
            turn_counter: 0,
            history: VecDeque::new(),
            parser: Box::new(MarkerOutputParser::new()),
            capture_tail_limit: 500,
            fallback_notices: HashSet::new(),
            conversation_id: Uuid::new_v4(),
        };

        if let Some(router) = manager.router.as_mut() {
            for name in &manager.participants {
                router.register_participant(name.clone());
            }
        }
        if let Some(context) = manager.context.as_mut() {
            for name in &manager.participants {
                if context.participant(name).is_none() {
                    context.register_participant(name.clone(), Default::default());
                }
            }
        }

        Ok(manager)
    }

    /// Replace the output parser (the default understands the common
    /// marker conventions).
    pub fn with_parser(mut self, parser: Box<dyn OutputParser>) -> Self {
        self.parser = parser;
        self
    }

    /// Bound on scrollback-delta lines captured per turn.
    pub fn with_capture_tail_limit(mut self, limit: usize) -> Self {
        self.capture_tail_limit = limit.max(1);
        self
    }

    pub fn context_manager(&self) -> Option<&ContextManager> {
        self.context.as_ref()
    }

    pub fn message_router(&self) -> Option<&MessageRouter> {
        self.router.as_ref()
    }

    pub fn history(&self) -> Vec<Turn> {
        self.history.iter().cloned().collect()
    }

    pub fn conversation_id(&self) -> Uuid {
        self.conversation_id
    }

    // --- Public API ------------------------------------------------------ //

    /// Run a turn-based discussion around `topic` for up to `max_turns`
    /// turns, stopping early on a queued dispatch, consensus, or conflict.
    pub async fn facilitate_discussion(&mut self, topic: &str, max_turns: usize) -> Vec<Turn> {
        let mut conversation: Vec<Turn> = Vec::new();

        for _ in 0..max_turns {
            let Some(speaker) = self.determine_next_speaker(&conversation) else {
                debug!(topic = %topic, "no eligible speaker; stopping discussion");
                break;
            };

            let prompt = self.build_prompt(&speaker, topic, &conversation);
            let pre_snapshot = self.capture_snapshot(&speaker).await;

            let dispatch = match self.orchestrator.dispatch_command(&speaker, &prompt, true).await
            {
                Ok(summary) => summary,
                Err(err) => {
                    warn!(speaker = %speaker, "dispatch failed: {}", err);
                    break;
                }
            };
            let queued = dispatch.queued;

            let parsed = if queued {
                None
            } else {
                self.read_last_output(&speaker, pre_snapshot.as_deref())
                    .await
            };

            let turn = Turn {
                turn: self.turn_counter,
                speaker: speaker.clone(),
                topic: topic.to_string(),
                prompt,
                dispatch,
                response: parsed.as_ref().and_then(|p| p.response.clone()),
                response_prompt: parsed.as_ref().and_then(|p| p.prompt.clone()),
                response_transcript: parsed
                    .as_ref()
                    .map(|p| p.cleaned.clone())
                    .filter(|cleaned| !cleaned.is_empty()),
                metadata: TurnMetadata::default(),
            };
            self.turn_counter += 1;
            conversation.push(turn);

            let consensus = self.detect_consensus(&conversation);
            let (conflict, conflict_reason) = self.detect_conflict(&conversation);

            let last = conversation.last_mut().expect("just pushed");
            last.metadata.queued = queued;
            last.metadata.consensus = consensus;
            last.metadata.conflict = conflict;
            if conflict && !conflict_reason.is_empty() {
                last.metadata.conflict_reason = Some(conflict_reason.clone());
            }
            let recorded = last.clone();

            self.history.push_back(recorded.clone());
            while self.history.len() > self.max_history {
                self.history.pop_front();
            }
            if let Some(context) = self.context.as_mut() {
                context.record_turn(&recorded);
            }

            if !queued {
                let payload = self.router.as_mut().and_then(|router| {
                    router.deliver(
                        &recorded.speaker,
                        recorded.response.as_deref().unwrap_or(""),
                        topic,
                        recorded.turn,
                        Some(recorded.metadata.clone()),
                    )
                });
                if let (Some(payload), Some(context)) = (payload, self.context.as_mut()) {
                    context.record_delivery(&payload);
                }
            }

            // Let background queue drains happen between turns.
            let _ = self.orchestrator.tick().await;

            if queued {
                info!(
                    conversation = %self.conversation_id,
                    turn = recorded.turn,
                    speaker = %recorded.speaker,
                    "turn queued because controller is paused; awaiting resume"
                );
                break;
            }
            if consensus {
                info!(
                    conversation = %self.conversation_id,
                    turn = recorded.turn,
                    topic = %topic,
                    "consensus detected"
                );
                if let Some(context) = self.context.as_mut() {
                    context.record_consensus(&recorded);
                }
                break;
            }
            if conflict {
                warn!(
                    conversation = %self.conversation_id,
                    turn = recorded.turn,
                    topic = %topic,
                    reason = %conflict_reason,
                    "conflict detected"
                );
                if let Some(context) = self.context.as_mut() {
                    context.record_conflict(&recorded, &conflict_reason);
                }
                break;
            }
        }

        conversation
    }

    /// Pick the next speaker.
    ///
    /// Only participants still registered with the orchestrator are
    /// eligible. A queued last turn is retried by the same speaker;
    /// otherwise selection is round-robin after the previous speaker. A
    /// fresh conversation resumes from the global history so a restarted
    /// discussion does not skip anyone.
    pub fn determine_next_speaker(&self, conversation: &[Turn]) -> Option<String> {
        let active: Vec<&String> = self
            .participants
            .iter()
            .filter(|name| self.orchestrator.has_controller(name))
            .collect();
        if active.is_empty() {
            return None;
        }

        let position = |name: &String| active.iter().position(|candidate| *candidate == name);

        if conversation.is_empty() {
            if let Some(last) = self.history.back() {
                if let Some(index) = position(&last.speaker) {
                    if last.metadata.queued {
                        return Some(last.speaker.clone());
                    }
                    return Some(active[(index + 1) % active.len()].clone());
                }
            }
            return Some(active[0].clone());
        }

        let last = conversation.last().expect("non-empty");
        if last.metadata.queued {
            return Some(if position(&last.speaker).is_some() {
                last.speaker.clone()
            } else {
                active[0].clone()
            });
        }

        match position(&last.speaker) {
            Some(index) => Some(active[(index + 1) % active.len()].clone()),
            None => Some(active[0].clone()),
        }
    }

    /// True when the latest turn signals consensus, either via an explicit
    /// metadata flag or a keyword in the response.
    pub fn detect_consensus(&self, conversation: &[Turn]) -> bool {
        let Some(latest) = conversation.last() else {
            return false;
        };
        if latest.metadata.consensus {
            return true;
        }

        let response = latest
            .response
            .as_deref()
            .unwrap_or_default()
            .to_lowercase();
        CONSENSUS_KEYWORDS
            .iter()
            .any(|keyword| response.contains(keyword))
    }

    /// Returns `(conflict_detected, reason)`.
    ///
    /// Code fences, inline code, and quoted strings are scrubbed before
    /// keyword matching so quoted disagreement does not trip the detector.
    /// Diverging stance labels between the last two turns also count.
    pub fn detect_conflict(&self, conversation: &[Turn]) -> (bool, String) {
        if conversation.len() < 2 {
            return (false, String::new());
        }

        let latest = &conversation[conversation.len() - 1];
        let previous = &conversation[conversation.len() - 2];

        let normalized = normalize_for_conflict(latest.response.as_deref().unwrap_or_default());

        for keyword in CONFLICT_KEYWORDS {
            if normalized.contains(keyword) {
                return (
                    true,
                    format!("Keyword '{}' indicates disagreement", keyword),
                );
            }
        }
        for phrase in CONFLICT_PHRASES {
            if normalized.contains(phrase) {
                return (true, format!("Phrase '{}' indicates disagreement", phrase));
            }
        }

        let stance_latest = latest.metadata.stance.as_deref().map(str::to_lowercase);
        let stance_previous = previous.metadata.stance.as_deref().map(str::to_lowercase);
        if let (Some(latest_stance), Some(previous_stance)) = (stance_latest, stance_previous) {
            if latest_stance != previous_stance {
                return (
                    true,
                    format!(
                        "Stance mismatch: '{}' vs '{}'",
                        previous_stance, latest_stance
                    ),
                );
            }
        }

        (false, String::new())
    }

    // --- Internal helpers ------------------------------------------------ //

    fn build_prompt(&mut self, speaker: &str, topic: &str, conversation: &[Turn]) -> String {
        let prompt = match self.context.as_ref() {
            Some(context) => context.build_prompt(speaker, topic, self.include_history),
            None => {
                let turn_number = conversation.len();
                if self.include_history {
                    format!(
                        "[Turn {}] {}, share your perspective on '{}'. \
                         Highlight progress, concerns, or next actions.",
                        turn_number, speaker, topic
                    )
                } else {
                    format!(
                        "[Turn {}] {}, acknowledge the request '{}' and briefly \
                         confirm you can see it.",
                        turn_number, speaker, topic
                    )
                }
            }
        };

        let context = self.context.as_ref();
        match self.router.as_mut() {
            Some(router) => {
                router.register_participant(speaker.to_string());
                router.prepare_prompt(speaker, topic, &prompt, self.include_history, context)
            }
            None => prompt,
        }
    }

    async fn capture_snapshot(&self, speaker: &str) -> Option<Vec<String>> {
        let controller = self.orchestrator.controller(speaker)?;
        let guard = controller.lock().await;
        match guard.capture_scrollback().await {
            Ok(text) => Some(text.lines().map(str::to_string).collect()),
            Err(err) => {
                debug!(speaker = %speaker, "pre-dispatch capture failed: {}", err);
                None
            }
        }
    }

    /// Wait for the controller, capture the scrollback delta, and parse
    /// it. Readiness failures are swallowed: a turn with an empty response
    /// beats an aborted conversation.
    async fn read_last_output(
        &mut self,
        speaker: &str,
        pre_snapshot: Option<&[String]>,
    ) -> Option<ParsedOutput> {
        let controller = self.orchestrator.controller(speaker)?;
        let mut guard = controller.lock().await;

        if let Err(err) = guard.wait_for_ready().await {
            debug!(speaker = %speaker, "wait_for_ready failed: {}", err);
        }

        match guard.capture_scrollback().await {
            Ok(text) => {
                let current: Vec<String> = text.lines().map(str::to_string).collect();
                let delta = compute_delta(pre_snapshot, &current, self.capture_tail_limit);
                if delta.is_empty() {
                    return None;
                }
                let parsed = self.parser.split(&delta.join("\n"));
                parsed.has_content().then_some(parsed)
            }
            Err(err) => {
                if self.fallback_notices.insert(speaker.to_string()) {
                    warn!(
                        speaker = %speaker,
                        "scrollback capture unavailable ({}); falling back to last-output delta",
                        err
                    );
                }
                let raw = guard.get_last_output(self.capture_tail_limit).await.ok()?;
                if raw.is_empty() {
                    return None;
                }
                let parsed = self.parser.split(&raw);
                parsed.has_content().then_some(parsed)
            }
        }
    }
}

/// Suffix of `current` after the longest common line-prefix with
/// `previous`, bounded to the trailing `tail_limit` lines.
fn compute_delta(
    previous: Option<&[String]>,
    current: &[String],
    tail_limit: usize,
) -> Vec<String> {
    let delta: Vec<String> = match previous {
        Some(previous) if !previous.is_empty() && current.len() >= previous.len() => {
            let mut prefix = 0;
            while prefix < previous.len() && previous[prefix] == current[prefix] {
                prefix += 1;
            }
            current[prefix..].to_vec()
        }
        _ => current.to_vec(),
    };

    if delta.len() > tail_limit {
        delta[delta.len() - tail_limit..].to_vec()
    } else {
        delta
    }
}

fn normalize_for_conflict(text: &str) -> String {
    if text.is_empty() {
        return String::new();
    }
    let scrubbed = code_fence_pattern().replace_all(text, " ");
    let scrubbed = inline_code_pattern().replace_all(&scrubbed, " ");
    let scrubbed = quoted_pattern().replace_all(&scrubbed, " ");
    scrubbed.to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::profiles::AgentTunables;
    use crate::controller::AgentController;
    use crate::utils::retry::RetryPolicy;
    use mux_session::{ScriptedBackend, SessionSpec};
    use std::time::Duration;

    fn make_turn(index: u64, speaker: &str, response: Option<&str>, queued: bool) -> Turn {
        Turn {
            turn: index,
            speaker: speaker.to_string(),
            topic: "design".to_string(),
            prompt: "p".to_string(),
            dispatch: DispatchSummary {
                dispatched: !queued,
                queued,
                queue_source: None,
                reason: None,
                manual_clients: Vec::new(),
                pending: 0,
                controller_pending: None,
                error: None,
            },
            response: response.map(str::to_string),
            response_prompt: None,
            response_transcript: None,
            metadata: TurnMetadata {
                queued,
                ..TurnMetadata::default()
            },
        }
    }

    fn register_stub(
        orchestrator: &Arc<Orchestrator>,
        name: &str,
    ) -> Arc<ScriptedBackend> {
        let backend = Arc::new(ScriptedBackend::running(SessionSpec::new(
            name, "stub", "/tmp",
        )));
        let controller =
            AgentController::new(name, Box::new(backend.clone()), AgentTunables::stub())
                .with_send_retry(RetryPolicy::new(2, Duration::ZERO, Duration::ZERO, 2.0));
        orchestrator.register_controller(name, controller);
        backend
    }

    fn manager(
        orchestrator: Arc<Orchestrator>,
        participants: &[&str],
    ) -> ConversationManager {
        ConversationManager::new(
            orchestrator,
            participants.iter().map(|s| s.to_string()).collect(),
            Some(ContextManager::default()),
            Some(MessageRouter::new(participants.iter().copied(), 8)),
            200,
            true,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_round_robin_with_consensus_stop() {
        let orchestrator = Arc::new(Orchestrator::new());
        let claude = register_stub(&orchestrator, "claude");
        let gemini = register_stub(&orchestrator, "gemini");

        // Scrollback frames per capture: pre-turn snapshot, then the
        // post-response capture read after wait_for_ready.
        claude.push_scrollback("");
        claude.push_scrollback("> design prompt\n● plan A");
        claude.push_scrollback("> design prompt\n● plan A");
        claude.push_scrollback("> design prompt\n● plan A\n> next\n● we reached consensus here");
        gemini.push_scrollback("");
        gemini.push_scrollback("> design prompt\n✦ I like plan A");

        let mut manager = manager(orchestrator, &["claude", "gemini"]);
        let conversation = manager.facilitate_discussion("Design", 4).await;

        assert_eq!(conversation.len(), 3);
        let speakers: Vec<&str> = conversation
            .iter()
            .map(|turn| turn.speaker.as_str())
            .collect();
        assert_eq!(speakers, vec!["claude", "gemini", "claude"]);

        assert_eq!(conversation[0].response.as_deref(), Some("plan A"));
        assert_eq!(conversation[1].response.as_deref(), Some("I like plan A"));
        assert!(conversation[2].metadata.consensus);
        assert_eq!(
            manager.context_manager().unwrap().consensus_events().len(),
            1
        );

        // Turn indices are monotonic.
        let indices: Vec<u64> = conversation.iter().map(|turn| turn.turn).collect();
        assert_eq!(indices, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_conflict_stops_discussion_with_reason() {
        let orchestrator = Arc::new(Orchestrator::new());
        let claude = register_stub(&orchestrator, "claude");
        let gemini = register_stub(&orchestrator, "gemini");

        claude.push_scrollback("");
        claude.push_scrollback("> t\n● plan A is the way");
        gemini.push_scrollback("");
        gemini.push_scrollback("> t\n✦ I disagree with the plan");

        let mut manager = manager(orchestrator, &["claude", "gemini"]);
        let conversation = manager.facilitate_discussion("Design", 6).await;

        assert_eq!(conversation.len(), 2);
        assert!(conversation[1].metadata.conflict);
        assert_eq!(
            conversation[1].metadata.conflict_reason.as_deref(),
            Some("Keyword 'disagree' indicates disagreement")
        );
        assert_eq!(manager.context_manager().unwrap().conflicts().len(), 1);
    }

    #[tokio::test]
    async fn test_queued_turn_stops_and_retries_same_speaker() {
        let orchestrator = Arc::new(Orchestrator::new());
        let claude = register_stub(&orchestrator, "claude");
        let gemini = register_stub(&orchestrator, "gemini");

        claude.push_scrollback("");
        claude.push_scrollback("> t\n● opening thoughts");
        gemini.push_clients(vec!["/dev/pts/7".to_string()]);

        let mut manager = manager(orchestrator, &["claude", "gemini"]);
        let conversation = manager.facilitate_discussion("Design", 6).await;

        // The gemini turn queued, so the discussion stopped there.
        assert_eq!(conversation.len(), 2);
        assert!(conversation[1].metadata.queued);
        assert!(conversation[1].response.is_none());

        // A fresh conversation resumes with the queued speaker.
        assert_eq!(
            manager.determine_next_speaker(&[]),
            Some("gemini".to_string())
        );
    }

    #[tokio::test]
    async fn test_response_routed_to_peers() {
        let orchestrator = Arc::new(Orchestrator::new());
        let claude = register_stub(&orchestrator, "claude");
        let gemini = register_stub(&orchestrator, "gemini");

        claude.push_scrollback("");
        claude.push_scrollback("> t\n● plan A");
        gemini.push_scrollback("");
        gemini.push_scrollback("> t\n✦ sounds good, consensus");

        let mut manager = manager(orchestrator, &["claude", "gemini"]);
        let conversation = manager.facilitate_discussion("Design", 2).await;
        assert_eq!(conversation.len(), 2);

        // Claude's turn was delivered to gemini and drained into gemini's
        // prompt; gemini's own mailbox entry for claude is still pending.
        assert!(conversation[1].prompt.contains("claude wrote: plan A"));
        assert_eq!(manager.message_router().unwrap().pending_count("claude"), 1);
        assert_eq!(
            manager.context_manager().unwrap().deliveries_observed(),
            2
        );
    }

    #[test]
    fn test_detect_conflict_scrubs_code_fences() {
        let orchestrator = Arc::new(Orchestrator::new());
        let manager = ConversationManager::new(
            orchestrator,
            vec!["claude".to_string()],
            None,
            None,
            10,
            true,
        )
        .unwrap();

        let fenced = vec![
            make_turn(0, "claude", Some("looks fine"), false),
            make_turn(1, "gemini", Some("Here is code: ```disagree()```"), false),
        ];
        assert_eq!(manager.detect_conflict(&fenced), (false, String::new()));

        let plain = vec![
            make_turn(0, "claude", Some("looks fine"), false),
            make_turn(1, "gemini", Some("I disagree with the plan"), false),
        ];
        assert_eq!(
            manager.detect_conflict(&plain),
            (
                true,
                "Keyword 'disagree' indicates disagreement".to_string()
            )
        );
    }

    #[test]
    fn test_detect_conflict_stance_mismatch() {
        let orchestrator = Arc::new(Orchestrator::new());
        let manager = ConversationManager::new(
            orchestrator,
            vec!["claude".to_string()],
            None,
            None,
            10,
            true,
        )
        .unwrap();

        let mut first = make_turn(0, "claude", Some("plan A"), false);
        first.metadata.stance = Some("Approve".to_string());
        let mut second = make_turn(1, "gemini", Some("plan B instead"), false);
        second.metadata.stance = Some("oppose".to_string());

        let (conflict, reason) = manager.detect_conflict(&[first, second]);
        assert!(conflict);
        assert_eq!(reason, "Stance mismatch: 'approve' vs 'oppose'");
    }

    #[test]
    fn test_detect_consensus_needs_keyword_or_flag() {
        let orchestrator = Arc::new(Orchestrator::new());
        let manager = ConversationManager::new(
            orchestrator,
            vec!["claude".to_string()],
            None,
            None,
            10,
            true,
        )
        .unwrap();

        // "agreed" alone does not match any of the literal keywords.
        let agreed = vec![make_turn(0, "claude", Some("agreed"), false)];
        assert!(!manager.detect_consensus(&agreed));

        let aligned = vec![make_turn(0, "claude", Some("we are aligned on this"), false)];
        assert!(manager.detect_consensus(&aligned));

        let mut flagged = make_turn(0, "claude", Some("whatever"), false);
        flagged.metadata.consensus = true;
        assert!(manager.detect_consensus(&[flagged]));
    }

    #[test]
    fn test_determine_next_speaker_round_robin() {
        let orchestrator = Arc::new(Orchestrator::new());
        let backend = Arc::new(ScriptedBackend::running(SessionSpec::new(
            "claude", "stub", "/tmp",
        )));
        orchestrator.register_controller(
            "claude",
            AgentController::new("claude", Box::new(backend.clone()), AgentTunables::stub()),
        );
        let backend = Arc::new(ScriptedBackend::running(SessionSpec::new(
            "gemini", "stub", "/tmp",
        )));
        orchestrator.register_controller(
            "gemini",
            AgentController::new("gemini", Box::new(backend), AgentTunables::stub()),
        );

        let manager = ConversationManager::new(
            orchestrator.clone(),
            vec!["claude".to_string(), "gemini".to_string()],
            None,
            None,
            10,
            true,
        )
        .unwrap();

        // Empty everything: first participant.
        assert_eq!(manager.determine_next_speaker(&[]), Some("claude".to_string()));

        // Round-robin after the last speaker.
        let turns = vec![make_turn(0, "claude", Some("hi"), false)];
        assert_eq!(
            manager.determine_next_speaker(&turns),
            Some("gemini".to_string())
        );
        let turns = vec![make_turn(1, "gemini", Some("hi"), false)];
        assert_eq!(
            manager.determine_next_speaker(&turns),
            Some("claude".to_string())
        );

        // Queued turns retry the same speaker.
        let turns = vec![make_turn(2, "gemini", None, true)];
        assert_eq!(
            manager.determine_next_speaker(&turns),
            Some("gemini".to_string())
        );

        // Unregistered speakers fall back to the first active participant.
        orchestrator.unregister_controller("gemini");
        let turns = vec![make_turn(3, "gemini", Some("hi"), false)];
        assert_eq!(
            manager.determine_next_speaker(&turns),
            Some("claude".to_string())
        );
    }

    #[test]
    fn test_compute_delta() {
        let previous: Vec<String> = ["a", "b", "c"].iter().map(|s| s.to_string()).collect();
        let current: Vec<String> = ["a", "b", "c", "d", "e"]
            .iter()
            .map(|s| s.to_string())
            .collect();

        assert_eq!(
            compute_delta(Some(&previous), &current, 10),
            vec!["d".to_string(), "e".to_string()]
        );
        // Tail bound applies.
        assert_eq!(
            compute_delta(Some(&previous), &current, 1),
            vec!["e".to_string()]
        );
        // Shrunk capture cannot be aligned: full tail returned.
        let shrunk: Vec<String> = ["x"].iter().map(|s| s.to_string()).collect();
        assert_eq!(compute_delta(Some(&previous), &shrunk, 10), vec!["x"]);
        // No snapshot: everything (bounded).
        assert_eq!(compute_delta(None, &current, 2), vec!["d", "e"]);
    }

    #[test]
    fn test_history_bounded_by_max_history() {
        let orchestrator = Arc::new(Orchestrator::new());
        let mut manager = ConversationManager::new(
            orchestrator,
            vec!["claude".to_string()],
            None,
            None,
            1,
            true,
        )
        .unwrap();
        for index in 0..5 {
            manager
                .history
                .push_back(make_turn(index, "claude", Some("x"), false));
            while manager.history.len() > manager.max_history {
                manager.history.pop_front();
            }
        }
        assert_eq!(manager.history().len(), 1);
        assert_eq!(manager.history()[0].turn, 4);
    }
}
