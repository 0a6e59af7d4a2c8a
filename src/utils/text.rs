//! Text helpers shared by indicator matching and command normalization.

use regex::Regex;
use std::sync::OnceLock;

fn ansi_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\x1B(?:[@-Z\\-_]|\[[0-?]*[ -/]*[@-~])").expect("valid ANSI pattern")
    })
}

/// Remove ANSI escape sequences from `text`.
///
/// Idempotent: stripping an already-clean string returns it unchanged.
pub fn strip_ansi(text: &str) -> String {
    ansi_pattern().replace_all(text, "").into_owned()
}

/// Normalize a command for single-line submission.
///
/// CRLF pairs become LF, then all non-empty lines are joined with a single
/// space. A literal newline in the input buffer is interpreted as Enter by
/// most assistant UIs and would submit a partial prompt.
pub fn normalize_command(command: &str) -> String {
    command
        .replace("\r\n", "\n")
        .split('\n')
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Count of non-whitespace characters in `text`.
pub fn non_whitespace_len(text: &str) -> usize {
    text.chars().filter(|c| !c.is_whitespace()).count()
}

/// Truncate `text` to at most `max_length` characters, appending an
/// ellipsis when anything was cut.
pub fn truncate_with_ellipsis(text: &str, max_length: usize) -> String {
    let chars: Vec<char> = text.chars().collect();
    if chars.len() <= max_length {
        return text.to_string();
    }
    let keep = max_length.saturating_sub(3);
    let mut out: String = chars[..keep].iter().collect();
    out.push_str("...");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_ansi_removes_escapes() {
        let colored = "\x1b[31mred\x1b[0m plain \x1b[1;32mbold\x1b[m";
        assert_eq!(strip_ansi(colored), "red plain bold");
    }

    #[test]
    fn test_strip_ansi_idempotent() {
        let noisy = "\x1b[2K\rspinner ● done";
        let once = strip_ansi(noisy);
        assert_eq!(strip_ansi(&once), once);
    }

    #[test]
    fn test_normalize_command_joins_lines() {
        assert_eq!(
            normalize_command("first line\r\nsecond line\n\nthird"),
            "first line second line third"
        );
        assert_eq!(normalize_command("single"), "single");
        assert_eq!(normalize_command("\n\n"), "");
    }

    #[test]
    fn test_non_whitespace_len() {
        assert_eq!(non_whitespace_len("  a b\tc\n"), 3);
        assert_eq!(non_whitespace_len("   "), 0);
    }

    #[test]
    fn test_truncate_with_ellipsis() {
        assert_eq!(truncate_with_ellipsis("short", 10), "short");
        assert_eq!(truncate_with_ellipsis("0123456789", 8), "01234...");
    }
}
