use once_cell::sync::Lazy;
use regex::Regex;

// Migrated values are user data; they must never reach a log line.
static VALUE_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(value|payload|entries)[\s:=]+[^\s,;]+").expect("static regex")
});

static SENSITIVE_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(password|secret|token)[\s:=]+[^\s]+").expect("static regex")
});

pub fn sanitize_for_display(message: &str) -> String {
    let without_values = VALUE_PATTERN.replace_all(message, "$1=[REDACTED]");
    SENSITIVE_PATTERN
        .replace_all(&without_values, "$1=[REDACTED]")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_value() {
        let message = "write failed for settings/theme value=dark";
        assert_eq!(
            sanitize_for_display(message),
            "write failed for settings/theme value=[REDACTED]"
        );
    }

    #[test]
    fn test_sanitize_multiple_fragments() {
        let message = "payload: {\"a\":1}, token=abc";
        assert_eq!(
            sanitize_for_display(message),
            "payload=[REDACTED], token=[REDACTED]"
        );
    }

    #[test]
    fn test_sanitize_preserves_safe_content() {
        let message = "copied 12 of 12 key(s) (340 byte(s)), 0 unreadable";
        assert_eq!(sanitize_for_display(message), message);
    }

    #[test]
    fn test_sanitize_case_insensitive() {
        assert_eq!(
            sanitize_for_display("VALUE=x and Secret=y"),
            "VALUE=[REDACTED] and Secret=[REDACTED]"
        );
    }
}
