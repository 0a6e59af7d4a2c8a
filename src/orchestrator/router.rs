//! Peer-message routing between participants.
//!
//! Producers broadcast their response after each turn; consumers drain
//! their mailbox right before speaking, so every prompt carries the
//! partner updates that arrived since that participant last spoke.
//! Mailboxes are bounded with oldest-drop semantics.
//!
//! The router does not hold a context-manager reference (the conversation
//! manager owns both and forwards delivery notifications itself), which
//! keeps the ownership graph acyclic.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use tracing::debug;

use super::context::ContextManager;
use super::conversation::TurnMetadata;
use crate::utils::text::truncate_with_ellipsis;

/// Maximum characters of a routed message quoted into a prompt.
const MESSAGE_QUOTE_LIMIT: usize = 400;

/// Maximum characters of shared-context summary appended to a prompt.
const CONTEXT_SUMMARY_LIMIT: usize = 300;

/// One message queued for a recipient.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutedMessage {
    pub sender: String,
    pub message: String,
    pub topic: String,
    pub turn: u64,
    pub metadata: Option<TurnMetadata>,
}

/// Routes messages between orchestrated participants.
pub struct MessageRouter {
    participants: Vec<String>,
    max_pending: usize,
    mailboxes: HashMap<String, VecDeque<RoutedMessage>>,
}

impl MessageRouter {
    /// Create a router for `participants` with mailboxes bounded at
    /// `max_pending` messages each.
    pub fn new(participants: impl IntoIterator<Item = impl Into<String>>, max_pending: usize) -> Self {
        let mut router = Self {
            participants: Vec::new(),
            max_pending: max_pending.max(1),
            mailboxes: HashMap::new(),
        };
        for name in participants {
            router.register_participant(name);
        }
        router
    }

    /// Ensure a participant has a mailbox. Idempotent.
    pub fn register_participant(&mut self, name: impl Into<String>) {
        let name = name.into();
        if !self.participants.contains(&name) {
            self.participants.push(name.clone());
        }
        self.mailboxes.entry(name).or_default();
    }

    pub fn participants(&self) -> &[String] {
        &self.participants
    }

    /// Messages currently waiting for `name`.
    pub fn pending_count(&self, name: &str) -> usize {
        self.mailboxes.get(name).map(VecDeque::len).unwrap_or(0)
    }

    /// Broadcast `message` from `sender` to every other participant.
    ///
    /// Empty messages are dropped. Returns the delivered payload, or
    /// `None` when nothing was delivered; the caller forwards it to the
    /// context manager if one is attached.
    pub fn deliver(
        &mut self,
        sender: &str,
        message: &str,
        topic: &str,
        turn: u64,
        metadata: Option<TurnMetadata>,
    ) -> Option<RoutedMessage> {
        if message.is_empty() {
            debug!(sender = %sender, "skipping empty message delivery");
            return None;
        }

        let payload = RoutedMessage {
            sender: sender.to_string(),
            message: message.to_string(),
            topic: topic.to_string(),
            turn,
            metadata,
        };

        for name in &self.participants {
            if name == sender {
                continue;
            }
            let mailbox = self.mailboxes.entry(name.clone()).or_default();
            mailbox.push_back(payload.clone());
            while mailbox.len() > self.max_pending {
                mailbox.pop_front();
            }
            debug!(
                sender = %sender,
                recipient = %name,
                pending = mailbox.len(),
                "delivered message"
            );
        }

        Some(payload)
    }

    /// Drain the recipient's mailbox into an augmented prompt.
    ///
    /// With nothing pending, `base_prompt` is returned unchanged.
    /// Otherwise the topic, the drained partner updates, and (when history
    /// is enabled and a context manager is supplied) a short shared-context
    /// summary are appended.
    pub fn prepare_prompt(
        &mut self,
        recipient: &str,
        topic: &str,
        base_prompt: &str,
        include_history: bool,
        context: Option<&ContextManager>,
    ) -> String {
        let mailbox = match self.mailboxes.get_mut(recipient) {
            Some(mailbox) if !mailbox.is_empty() => mailbox,
            _ => return base_prompt.to_string(),
        };

        let mut updates: Vec<String> = Vec::new();
        while let Some(payload) = mailbox.pop_front() {
            let snippet = truncate_with_ellipsis(payload.message.trim(), MESSAGE_QUOTE_LIMIT);
            updates.push(format!("{} wrote: {}", payload.sender, snippet));
        }

        let mut lines = vec![
            base_prompt.to_string(),
            String::new(),
            format!("Topic: {}", topic),
            "Recent partner updates:".to_string(),
        ];
        lines.extend(updates.into_iter().map(|update| format!("- {}", update)));

        if include_history {
            if let Some(context) = context {
                let history = context.history();
                let start = history.len().saturating_sub(3);
                let summary =
                    context.summarize_conversation(&history[start..], CONTEXT_SUMMARY_LIMIT);
                if !summary.is_empty() {
                    lines.push(String::new());
                    lines.push(format!("Shared context: {}", summary));
                }
            }
        }

        lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn router() -> MessageRouter {
        MessageRouter::new(["claude", "gemini", "qwen"], 8)
    }

    #[test]
    fn test_deliver_skips_sender() {
        let mut r = router();
        r.deliver("claude", "plan A looks right", "design", 0, None);

        assert_eq!(r.pending_count("claude"), 0);
        assert_eq!(r.pending_count("gemini"), 1);
        assert_eq!(r.pending_count("qwen"), 1);
    }

    #[test]
    fn test_deliver_skips_empty_messages() {
        let mut r = router();
        assert!(r.deliver("claude", "", "design", 0, None).is_none());
        assert_eq!(r.pending_count("gemini"), 0);
    }

    #[test]
    fn test_mailbox_oldest_drop() {
        let mut r = MessageRouter::new(["a", "b"], 2);
        for index in 0..5 {
            r.deliver("a", &format!("update {}", index), "t", index, None);
        }
        assert_eq!(r.pending_count("b"), 2);

        let prompt = r.prepare_prompt("b", "t", "base", false, None);
        assert!(!prompt.contains("update 2"));
        assert!(prompt.contains("update 3"));
        assert!(prompt.contains("update 4"));
    }

    #[test]
    fn test_prepare_prompt_unchanged_when_empty() {
        let mut r = router();
        let prompt = r.prepare_prompt("claude", "design", "base prompt", true, None);
        assert_eq!(prompt, "base prompt");
    }

    #[test]
    fn test_prepare_prompt_drains_mailbox() {
        let mut r = router();
        r.deliver("gemini", "I prefer plan B", "design", 1, None);

        let prompt = r.prepare_prompt("claude", "design", "base", true, None);
        assert!(prompt.contains("Topic: design"));
        assert!(prompt.contains("Recent partner updates:"));
        assert!(prompt.contains("- gemini wrote: I prefer plan B"));

        // No re-delivery on the next call.
        let prompt = r.prepare_prompt("claude", "design", "base", true, None);
        assert_eq!(prompt, "base");
    }

    #[test]
    fn test_prepare_prompt_trims_long_messages() {
        let mut r = router();
        let long = "x".repeat(600);
        r.deliver("gemini", &long, "design", 1, None);

        let prompt = r.prepare_prompt("claude", "design", "base", false, None);
        assert!(prompt.contains("..."));
        assert!(prompt.len() < 600);
    }

    #[test]
    fn test_register_participant_idempotent() {
        let mut r = router();
        r.register_participant("claude");
        r.register_participant("claude");
        assert_eq!(
            r.participants().iter().filter(|p| *p == "claude").count(),
            1
        );
    }

    #[test]
    fn test_unregistered_sender_still_broadcasts() {
        let mut r = router();
        r.deliver("outsider", "hello from outside", "design", 0, None);
        assert_eq!(r.pending_count("claude"), 1);
        assert_eq!(r.pending_count("gemini"), 1);
    }
}
