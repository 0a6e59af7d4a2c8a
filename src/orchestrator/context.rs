//! Conversation context: bounded history, decisions, and participants.
//!
//! The context manager keeps a rolling window of turns plus the decisions,
//! conflicts, and consensus events recorded along the way, so prompt
//! construction never re-reads transcripts. A per-speaker "last seen"
//! index makes sure a participant is never quoted their own prior turns.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use tracing::{debug, warn};

use super::conversation::Turn;
use super::router::RoutedMessage;
use crate::utils::text::truncate_with_ellipsis;

/// How a participant is driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantKind {
    /// An interactive CLI session under our control.
    #[default]
    Cli,
    /// A remote agent reached through some host service.
    Agent,
}

/// Metadata registered for one participant.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParticipantInfo {
    pub kind: ParticipantKind,
    pub role: Option<String>,
    pub host: Option<String>,
    /// Standing instructions appended to every prompt.
    pub guidance: Option<String>,
}

/// A recorded conflict event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictEvent {
    pub turn: Turn,
    pub reason: String,
}

/// Consolidated snapshot of everything the context manager tracks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectContext {
    pub history: Vec<Turn>,
    pub decisions: Vec<serde_json::Value>,
    pub conflicts: Vec<ConflictEvent>,
    pub consensus: Vec<Turn>,
    pub state: HashMap<String, serde_json::Value>,
    pub participants: HashMap<String, ParticipantInfo>,
}

/// Tracks conversation context, decisions, and conflict signals.
pub struct ContextManager {
    history: VecDeque<Turn>,
    history_size: usize,
    decisions: Vec<serde_json::Value>,
    conflicts: Vec<ConflictEvent>,
    consensus_events: Vec<Turn>,
    participants: HashMap<String, ParticipantInfo>,
    project_state: HashMap<String, serde_json::Value>,
    last_seen: HashMap<String, u64>,
    deliveries_observed: u64,
}

impl Default for ContextManager {
    fn default() -> Self {
        Self::new(200)
    }
}

impl ContextManager {
    /// Create a context manager keeping at most `history_size` turns.
    pub fn new(history_size: usize) -> Self {
        Self {
            history: VecDeque::new(),
            history_size: history_size.max(1),
            decisions: Vec::new(),
            conflicts: Vec::new(),
            consensus_events: Vec::new(),
            participants: HashMap::new(),
            project_state: HashMap::new(),
            last_seen: HashMap::new(),
            deliveries_observed: 0,
        }
    }

    // --- Turn and decision management ----------------------------------- //

    /// Store a sanitized copy of a turn and advance the speaker's
    /// last-seen index. The oldest turn is evicted once the window fills.
    pub fn record_turn(&mut self, turn: &Turn) {
        let mut stored = turn.clone();
        if let Some(response) = &stored.response {
            stored.response = Some(response.trim().to_string());
        }

        self.last_seen.insert(stored.speaker.clone(), stored.turn);
        self.history.push_back(stored);
        while self.history.len() > self.history_size {
            self.history.pop_front();
        }
    }

    /// Track a conflict for later review or escalation.
    pub fn record_conflict(&mut self, turn: &Turn, reason: &str) {
        self.conflicts.push(ConflictEvent {
            turn: turn.clone(),
            reason: reason.to_string(),
        });
    }

    /// Track a consensus outcome.
    pub fn record_consensus(&mut self, turn: &Turn) {
        self.consensus_events.push(turn.clone());
    }

    /// Persist a key decision. Non-object payloads are ignored.
    pub fn save_decision(&mut self, decision: serde_json::Value) {
        if !decision.is_object() {
            warn!("ignoring non-object decision payload: {}", decision);
            return;
        }
        self.decisions.push(decision);
    }

    /// Register (or update) participant metadata.
    pub fn register_participant(&mut self, name: impl Into<String>, info: ParticipantInfo) {
        self.participants.insert(name.into(), info);
    }

    /// Router hook: observe a delivery fan-out.
    pub fn record_delivery(&mut self, message: &RoutedMessage) {
        self.deliveries_observed += 1;
        debug!(
            sender = %message.sender,
            turn = message.turn,
            "observed routed delivery"
        );
    }

    // --- Inspection ------------------------------------------------------ //

    pub fn history(&self) -> Vec<Turn> {
        self.history.iter().cloned().collect()
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    pub fn decisions(&self) -> &[serde_json::Value] {
        &self.decisions
    }

    pub fn conflicts(&self) -> &[ConflictEvent] {
        &self.conflicts
    }

    pub fn consensus_events(&self) -> &[Turn] {
        &self.consensus_events
    }

    pub fn participant(&self, name: &str) -> Option<&ParticipantInfo> {
        self.participants.get(name)
    }

    pub fn deliveries_observed(&self) -> u64 {
        self.deliveries_observed
    }

    /// Consolidated view of history, decisions, and state.
    pub fn get_project_context(&self) -> ProjectContext {
        ProjectContext {
            history: self.history(),
            decisions: self.decisions.clone(),
            conflicts: self.conflicts.clone(),
            consensus: self.consensus_events.clone(),
            state: self.project_state.clone(),
            participants: self.participants.clone(),
        }
    }

    /// Merge entries into the project-state map.
    pub fn update_project_state(
        &mut self,
        entries: impl IntoIterator<Item = (String, serde_json::Value)>,
    ) {
        self.project_state.extend(entries);
    }

    // --- Prompt and summary helpers -------------------------------------- //

    /// Construct the next prompt for `ai_name`.
    ///
    /// Without history the prompt degenerates to a smoke-test
    /// acknowledgment request. Otherwise the participant's kind and role
    /// frame the task, guidance is appended, and a short "Recent context"
    /// section quotes up to three turns the speaker has not seen yet.
    pub fn build_prompt(&self, ai_name: &str, task: &str, include_history: bool) -> String {
        if !include_history {
            return format!(
                "{name}, this is a connectivity check. Reply with exactly \
                 \"Hello from {name} — message received.\" and do nothing else.",
                name = ai_name
            );
        }

        let info = self.participants.get(ai_name);
        let mut lines: Vec<String> = Vec::new();

        match info {
            Some(info) if info.kind == ParticipantKind::Agent => {
                let role = info.role.as_deref().unwrap_or("remote");
                let host = info.host.as_deref().unwrap_or("an external host");
                lines.push(format!(
                    "{}, you are operating as the {} agent hosted via {}. Address the task: {}.",
                    ai_name, role, host, task
                ));
            }
            _ => {
                let role_note = info
                    .and_then(|info| info.role.as_deref())
                    .map(|role| format!(" as the {} voice", role))
                    .unwrap_or_default();
                lines.push(format!(
                    "{}, we're collaborating on: {}.{}",
                    ai_name,
                    task,
                    if role_note.is_empty() {
                        String::new()
                    } else {
                        format!(" Contribute{}.", role_note)
                    }
                ));
            }
        }
        lines.push("Provide your next contribution focusing on actionable steps.".to_string());

        if let Some(guidance) = info.and_then(|info| info.guidance.as_deref()) {
            lines.push(guidance.to_string());
        }

        let blurb = self.recent_history_for(ai_name, 3);
        if !blurb.is_empty() {
            lines.push(format!("Recent context: {}", blurb));
        }

        lines.join("\n")
    }

    /// Compact description of the most recent turns the speaker has not
    /// seen: everything strictly after its own last turn, newest three.
    fn recent_history_for(&self, speaker: &str, max_turns: usize) -> String {
        let seen = self.last_seen.get(speaker).copied();
        let unseen: Vec<&Turn> = self
            .history
            .iter()
            .filter(|turn| match seen {
                Some(index) => turn.turn > index,
                None => true,
            })
            .collect();

        let start = unseen.len().saturating_sub(max_turns);
        let fragments: Vec<String> = unseen[start..]
            .iter()
            .map(|turn| match &turn.response {
                Some(response) if !response.is_empty() => {
                    format!("{}: {}", turn.speaker, response)
                }
                _ => format!("{} queued a prompt", turn.speaker),
            })
            .collect();
        fragments.join("; ")
    }

    /// Truncated "speaker: body" summary of the supplied turns, favouring
    /// responses and falling back to prompts.
    pub fn summarize_conversation(&self, messages: &[Turn], max_length: usize) -> String {
        let fragments: Vec<String> = messages
            .iter()
            .filter_map(|turn| {
                let body = turn
                    .response
                    .clone()
                    .filter(|response| !response.is_empty())
                    .unwrap_or_else(|| turn.prompt.clone());
                let snippet = format!("{}: {}", turn.speaker, body);
                let snippet = snippet.trim().to_string();
                (!snippet.is_empty()).then_some(snippet)
            })
            .collect();

        truncate_with_ellipsis(&fragments.join(" | "), max_length)
    }
}
