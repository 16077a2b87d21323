//! Regex compilation with literal fallback

use regex::{Regex, RegexBuilder};
use tracing::warn;

/// Upper bound on compiled program size, keeps hostile patterns cheap
const REGEX_SIZE_LIMIT: usize = 1 << 20;

/// Compile `pattern`; on a syntax error log a warning and match it literally.
///
/// Invalid caller patterns never fail the operation that supplied them.
pub fn safe_compile(pattern: &str) -> Regex {
    match build(pattern) {
        Ok(regex) => regex,
        Err(e) => {
            warn!(
                "Invalid regex pattern '{}', falling back to literal match: {}",
                pattern, e
            );
            literal(pattern)
        }
    }
}

/// Compile a pattern that matches `text` exactly as written
pub fn literal(text: &str) -> Regex {
    // An escaped pattern has no syntax errors; without a size limit it cannot fail
    RegexBuilder::new(&regex::escape(text))
        .size_limit(usize::MAX)
        .build()
        .unwrap_or_else(|e| unreachable!("escaped literal failed to compile: {e}"))
}

fn build(pattern: &str) -> Result<Regex, regex::Error> {
    RegexBuilder::new(pattern)
        .size_limit(REGEX_SIZE_LIMIT)
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[test]
    fn test_valid_pattern_compiles() {
        let re = safe_compile(r"^fn \w+");
        assert!(re.is_match("fn main"));
        assert!(!re.is_match("let fn"));
    }

    #[traced_test]
    #[test]
    fn test_invalid_pattern_falls_back_to_literal() {
        let re = safe_compile("foo(bar");
        assert!(re.is_match("call foo(bar) now"));
        assert!(!re.is_match("foobar"));
        assert!(logs_contain("falling back to literal match"));
    }

    #[test]
    fn test_literal_escapes_metacharacters() {
        let re = literal("a.b*");
        assert!(re.is_match("xa.b*y"));
        assert!(!re.is_match("aXb"));
    }
}
