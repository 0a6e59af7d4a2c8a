//! Plain-text conversation transcripts.
//!
//! Optional output for drivers: a header, one block per turn, and a shared
//! context summary trailer. Write failures are the caller's to log; the
//! conversation itself never depends on the transcript.

use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use crate::error::CoreError;
use crate::orchestrator::context::ContextManager;
use crate::orchestrator::conversation::Turn;

const HEADER: &str = "=== Conversation Transcript ===";
const TRAILER: &str = "=== Shared Context Summary ===";

/// Render a conversation to transcript text.
pub fn render(turns: &[Turn], context: Option<&ContextManager>) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{}", HEADER);

    for turn in turns {
        let _ = writeln!(out);
        let _ = writeln!(out, "[Turn {}] {} ({})", turn.turn, turn.speaker, turn.topic);
        let _ = writeln!(out, "prompt: {}", turn.prompt);
        match &turn.response {
            Some(response) if !response.is_empty() => {
                let _ = writeln!(out, "response: {}", response);
            }
            _ if turn.metadata.queued => {
                let _ = writeln!(out, "response: (queued)");
            }
            _ => {
                let _ = writeln!(out, "response: (none)");
            }
        }
        if turn.metadata.consensus {
            let _ = writeln!(out, "signal: consensus");
        }
        if turn.metadata.conflict {
            let _ = writeln!(
                out,
                "signal: conflict{}",
                turn.metadata
                    .conflict_reason
                    .as_deref()
                    .map(|reason| format!(" ({})", reason))
                    .unwrap_or_default()
            );
        }
    }

    let _ = writeln!(out);
    let _ = writeln!(out, "{}", TRAILER);
    if let Some(context) = context {
        let history = context.history();
        let summary = context.summarize_conversation(&history, 400);
        if !summary.is_empty() {
            let _ = writeln!(out, "{}", summary);
        }
    }
    out
}

/// Render and write a transcript to `path`.
pub fn write(path: &Path, turns: &[Turn], context: Option<&ContextManager>) -> Result<(), CoreError> {
    let text = render(turns, context);
    fs::write(path, text).map_err(|err| {
        CoreError::Config(format!(
            "cannot write transcript '{}': {}",
            path.display(),
            err
        ))
    })
}
