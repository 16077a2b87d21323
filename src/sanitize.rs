//! Output sanitization and secret redaction
//!
//! Everything that leaves the sandbox as a structured result or an audit
//! record passes through here: control bytes are stripped (they can corrupt
//! the transport framing) and secret-looking substrings are masked.

use regex::Regex;
use std::sync::LazyLock;

/// Replacement text for redacted secrets
pub const REDACTED: &str = "[REDACTED_SECRET]";

/// Upper bound for error messages and audit subjects
pub const MAX_MESSAGE_CHARS: usize = 500;

static OPENAI_KEY_REGEX: LazyLock<Regex> = LazyLock::new(|| compile_regex(r"sk-[A-Za-z0-9_\-]{20,}"));

static AWS_ACCESS_KEY_ID_REGEX: LazyLock<Regex> =
    LazyLock::new(|| compile_regex(r"\bAKIA[0-9A-Z]{16}\b"));

static GITHUB_TOKEN_REGEX: LazyLock<Regex> =
    LazyLock::new(|| compile_regex(r"\bgh[pousr]_[A-Za-z0-9]{20,}\b"));

static BEARER_TOKEN_REGEX: LazyLock<Regex> =
    LazyLock::new(|| compile_regex(r"(?i)\bBearer\s+[A-Za-z0-9.\-_]{16,}"));

/// `key=value` / `key: value` for common secret names
static SECRET_ASSIGNMENT_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    compile_regex(
        r#"(?i)\b(api[\-_]?key|access[\-_]?key|token|secret|password|passwd|pwd)\b(\s*[:=]\s*)(["']?)[^\s"']{6,}"#,
    )
});

/// Mask secret-looking substrings.
pub fn redact_secrets(input: &str) -> String {
    let redacted = OPENAI_KEY_REGEX.replace_all(input, REDACTED);
    let redacted = AWS_ACCESS_KEY_ID_REGEX.replace_all(&redacted, REDACTED);
    let redacted = GITHUB_TOKEN_REGEX.replace_all(&redacted, REDACTED);
    let redacted = BEARER_TOKEN_REGEX.replace_all(&redacted, "Bearer [REDACTED_SECRET]");
    let redacted = SECRET_ASSIGNMENT_REGEX.replace_all(&redacted, "$1$2$3[REDACTED_SECRET]");

    redacted.into_owned()
}

/// Drop control characters except newline and tab.
pub fn strip_control_chars(input: &str) -> String {
    if !input.chars().any(is_stripped) {
        return input.to_string();
    }
    input.chars().filter(|c| !is_stripped(*c)).collect()
}

fn is_stripped(c: char) -> bool {
    c.is_control() && c != '\n' && c != '\t'
}

/// Cut `input` to at most `max_chars` characters, marking the cut.
pub fn truncate(input: &str, max_chars: usize) -> String {
    match input.char_indices().nth(max_chars) {
        Some((byte_index, _)) => format!("{}...", &input[..byte_index]),
        None => input.to_string(),
    }
}

/// Redact, strip and bound a message for inclusion in a result or audit record.
pub fn summarize(input: &str, max_chars: usize) -> String {
    truncate(&strip_control_chars(&redact_secrets(input)), max_chars)
}

fn compile_regex(pattern: &str) -> Regex {
    match Regex::new(pattern) {
        Ok(regex) => regex,
        // Patterns are constants; `test_patterns_compile` guards them
        Err(err) => panic!("invalid regex pattern `{pattern}`: {err}"),
    }
}
