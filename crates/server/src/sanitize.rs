//! Message content sanitization (spec §4.4 step 4).
//!
//! Neutralizes script tags, inline event handlers, and `javascript:` URI
//! schemes in text-bearing fields, then strips NUL and non-whitespace
//! control characters. Sanitization is lossy-but-deterministic: the same
//! input always produces the same output, and no attempt is made to recover
//! the "intended" safe content.

use once_cell::sync::Lazy;
use regex::Regex;

use gatehouse_protocol::Message;

static SCRIPT_TAG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<script[^>]*>.*?</script>").expect("regex: script tag"));

static SCRIPT_TAG_UNCLOSED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)</?script[^>]*>").expect("regex: bare script tag"));

/// `on<word>=` inline event handler attributes, e.g. `onclick=`, `onerror=`.
static EVENT_HANDLER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)\bon[a-z]+\s*=\s*("[^"]*"|'[^']*'|[^\s>]+)"#).expect("regex: event handler"));

static JAVASCRIPT_SCHEME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)javascript:").expect("regex: javascript scheme"));

/// Neutralize known XSS vectors in one string. Deterministic and idempotent:
/// running it twice produces the same output as running it once.
pub fn sanitize_text(input: &str) -> String {
    let mut s = input.to_string();
    s = SCRIPT_TAG.replace_all(&s, "").to_string();
    s = SCRIPT_TAG_UNCLOSED.replace_all(&s, "").to_string();
    s = EVENT_HANDLER.replace_all(&s, "").to_string();
    s = JAVASCRIPT_SCHEME.replace_all(&s, "").to_string();
    strip_control_chars(&s)
}

/// Strip NUL and control characters, preserving whitespace (space, tab, CR,
/// LF) since those are meaningful in free-text chat content.
fn strip_control_chars(input: &str) -> String {
    input
        .chars()
        .filter(|c| !c.is_control() || c.is_whitespace())
        .collect()
}

/// Sanitize every text-bearing field of a [`Message`] in place: `content`,
/// and every value in `metadata`.
pub fn sanitize_message(message: &mut Message) {
    message.content = sanitize_text(&message.content);
    for value in message.metadata.values_mut() {
        *value = sanitize_text(value);
    }
}
