//! Pattern-based PII redaction for free-text fields headed to bronze files.

use regex::Regex;
use std::sync::OnceLock;

fn phone_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\+?\b\d[\d\-\s]{6,}\d\b").unwrap())
}

fn email_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[\w.\-]+@[\w.\-]+\.\w+").unwrap())
}

fn unsafe_filename_chars() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[^A-Za-z0-9._-]+").unwrap())
}

fn dash_runs() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"-{2,}").unwrap())
}

/// Redact phone-number-like and email-like substrings.
pub fn mask_pii(text: &str) -> String {
    let masked = phone_pattern().replace_all(text, "****");
    email_pattern().replace_all(&masked, "****").into_owned()
}

/// Reduce a group name to characters safe in a bronze file name.
///
/// Everything outside `[A-Za-z0-9._-]` becomes `-`, runs collapse to a
/// single `-`, and leading/trailing dashes are trimmed.
pub fn sanitize_group_name(name: &str) -> String {
    let safe = unsafe_filename_chars().replace_all(name.trim(), "-");
    dash_runs()
        .replace_all(&safe, "-")
        .trim_matches('-')
        .to_string()
}
