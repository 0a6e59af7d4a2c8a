//! Output-parser contract for captured pane text.
//!
//! The core consumes parsers through the narrow [`OutputParser`] contract:
//! given a raw capture delta, split it into the echoed prompt, the
//! assistant's response, and a cleaned transcript. The shipped
//! [`MarkerOutputParser`] understands the marker conventions of the common
//! assistant UIs; deeper cleanup heuristics live outside the core.

use regex::Regex;
use std::sync::OnceLock;

use crate::utils::text::strip_ansi;

/// Result of splitting a raw capture.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedOutput {
    /// Echo of the submitted prompt, when one was found.
    pub prompt: Option<String>,
    /// The assistant's response text, when one was found.
    pub response: Option<String>,
    /// Capture with UI furniture removed.
    pub cleaned: String,
}

impl ParsedOutput {
    /// Whether the parse produced any usable content.
    pub fn has_content(&self) -> bool {
        self.response.is_some() || !self.cleaned.trim().is_empty()
    }
}

/// Narrow contract between the core and output-cleaning implementations.
pub trait OutputParser: Send + Sync {
    fn split(&self, raw: &str) -> ParsedOutput;
}

/// Response markers used by the supported assistant UIs.
const RESPONSE_MARKERS: [char; 3] = ['●', '✦', '▸'];

fn separator_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[─═]+$").expect("valid separator pattern"))
}

fn status_line_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\? for shortcuts|context left|no sandbox|esc to interrupt")
            .expect("valid status pattern")
    })
}

/// Marker-based [`OutputParser`] for box-drawing assistant UIs.
#[derive(Debug, Default, Clone)]
pub struct MarkerOutputParser;

impl MarkerOutputParser {
    pub fn new() -> Self {
        Self
    }

    fn is_ui_line(line: &str) -> bool {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return true;
        }
        if trimmed.starts_with('╭') || trimmed.starts_with('╰') {
            return true;
        }
        if separator_pattern().is_match(trimmed) {
            return true;
        }
        if status_line_pattern().is_match(trimmed) {
            return true;
        }
        // Banner art from startup screens.
        if trimmed.contains("███") || trimmed.contains("▐▛") || trimmed.contains("▜▌") {
            return true;
        }
        // Bare prompt line with no content.
        if trimmed.starts_with('>') && trimmed.len() <= 2 {
            return true;
        }
        false
    }

    /// Extract prompt text from a plain (`> …`) or boxed (`│ > … │`) line.
    fn prompt_text(line: &str) -> Option<String> {
        let trimmed = line.trim();
        if trimmed.starts_with('│') && trimmed.contains('>') {
            let inner = trimmed.replace('│', "");
            let inner = inner.trim().trim_start_matches('>').trim();
            if inner.len() > 2 && !inner.contains("Type your message") {
                return Some(inner.to_string());
            }
            return None;
        }
        if let Some(rest) = trimmed.strip_prefix('>') {
            let rest = rest.trim();
            if !rest.is_empty() && trimmed.len() > 2 {
                return Some(rest.to_string());
            }
        }
        None
    }
}

impl OutputParser for MarkerOutputParser {
    fn split(&self, raw: &str) -> ParsedOutput {
        let text = strip_ansi(raw);
        let lines: Vec<&str> = text.lines().collect();

        let mut cleaned_lines: Vec<&str> = Vec::new();
        let mut prompt: Option<String> = None;
        let mut response_lines: Vec<String> = Vec::new();
        let mut in_response = false;

        for &line in &lines {
            let trimmed = line.trim();

            if let Some(found) = Self::prompt_text(line) {
                // A new prompt echo starts a fresh exchange.
                prompt = Some(found);
                response_lines.clear();
                in_response = false;
                cleaned_lines.push(line);
                continue;
            }

            if Self::is_ui_line(line) {
                if in_response {
                    in_response = false;
                }
                continue;
            }

            cleaned_lines.push(line);

            if let Some(marker) = trimmed.chars().next() {
                if RESPONSE_MARKERS.contains(&marker) {
                    in_response = true;
                    let body = trimmed[marker.len_utf8()..].trim();
                    if !body.is_empty() {
                        response_lines.push(body.to_string());
                    }
                    continue;
                }
            }

            if in_response {
                response_lines.push(trimmed.to_string());
            }
        }

        let response = if response_lines.is_empty() {
            None
        } else {
            Some(response_lines.join("\n"))
        };

        ParsedOutput {
            prompt,
            response,
            cleaned: cleaned_lines.join("\n").trim().to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_plain_exchange() {
        let raw = "\
> what is the plan
● We should start with the parser.
  Then wire up the controller.
────────────────
? for shortcuts";
        let parsed = MarkerOutputParser::new().split(raw);
        assert_eq!(parsed.prompt.as_deref(), Some("what is the plan"));
        assert_eq!(
            parsed.response.as_deref(),
            Some("We should start with the parser.\nThen wire up the controller.")
        );
        assert!(parsed.cleaned.contains("We should start"));
        assert!(!parsed.cleaned.contains("? for shortcuts"));
    }

    #[test]
    fn test_split_boxed_prompt() {
        let raw = "\
╭──────────────╮
│ > review the diff  │
╰──────────────╯
✦ Looks correct to me.";
        let parsed = MarkerOutputParser::new().split(raw);
        assert_eq!(parsed.prompt.as_deref(), Some("review the diff"));
        assert_eq!(parsed.response.as_deref(), Some("Looks correct to me."));
    }

    #[test]
    fn test_split_keeps_last_exchange() {
        let raw = "\
> first question
● first answer
> second question
▸ second answer";
        let parsed = MarkerOutputParser::new().split(raw);
        assert_eq!(parsed.prompt.as_deref(), Some("second question"));
        assert_eq!(parsed.response.as_deref(), Some("second answer"));
    }

    #[test]
    fn test_split_strips_ansi() {
        let raw = "\x1b[32m● colored answer\x1b[0m";
        let parsed = MarkerOutputParser::new().split(raw);
        assert_eq!(parsed.response.as_deref(), Some("colored answer"));
    }

    #[test]
    fn test_split_empty_capture() {
        let parsed = MarkerOutputParser::new().split("");
        assert!(parsed.prompt.is_none());
        assert!(parsed.response.is_none());
        assert!(!parsed.has_content());
    }
}
