use regex::{Captures, Regex};
use std::sync::LazyLock;

const REDACTED: &str = "[REDACTED]";

static INLINE_SECRET_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(password|passwd|pwd|secret|token|api[_-]?key|access[_-]?key|kek)\b\s*([:=])\s*([^\s,;]+)",
    )
    .expect("inline secret pattern is valid")
});

static URI_CREDENTIAL_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)([a-z][a-z0-9+.-]*://[^:@/\s]+:)([^@/\s]+)(@)")
        .expect("uri credential pattern is valid")
});

static SMTP_AUTH_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(AUTH\s+(?:PLAIN|LOGIN))\s+(\S+)").expect("smtp auth pattern is valid")
});

/// Masks credentials in free text before it reaches a log line: inline
/// `key=value` secrets, passwords embedded in URIs, and SMTP AUTH payloads.
pub fn redact_sensitive_text(input: &str) -> String {
    let redacted_inline = INLINE_SECRET_REGEX.replace_all(input, |caps: &Captures| {
        format!("{}{}{}", &caps[1], &caps[2], REDACTED)
    });
    let redacted_uri = URI_CREDENTIAL_REGEX.replace_all(&redacted_inline, |caps: &Captures| {
        format!("{}{}{}", &caps[1], REDACTED, &caps[3])
    });
    SMTP_AUTH_REGEX
        .replace_all(&redacted_uri, |caps: &Captures| format!("{} {}", &caps[1], REDACTED))
        .to_string()
}

#[cfg(test)]
mod tests;
