use std::borrow::Cow;

/// Returns true for bytes that are stripped from stored text.
///
/// Tab, newline and carriage return are kept; every other C0 control and DEL is
/// removed.
fn is_stripped(c: char) -> bool {
    (c.is_ascii_control() && !matches!(c, '\t' | '\n' | '\r')) || c == '\u{7f}'
}

/// Strip control characters (including bare ESC) from text that came from a
/// remote feed or a configuration file.
///
/// Returns `Cow::Borrowed` when nothing needs stripping, which is the common
/// case for well-behaved feeds.
pub fn strip_control_chars(s: &str) -> Cow<'_, str> {
    if !s.chars().any(is_stripped) {
        return Cow::Borrowed(s);
    }
    Cow::Owned(s.chars().filter(|c| !is_stripped(*c)).collect())
}

/// Collapse every run of whitespace into a single space and trim both ends.
pub fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Normalized form of a title used for identity derivation: control characters
/// removed, whitespace collapsed, lowercased.
pub fn normalize_title(title: &str) -> String {
    collapse_whitespace(&strip_control_chars(title)).to_lowercase()
}

/// Trim `s` and return it only if something is left.
pub fn non_empty(s: &str) -> Option<String> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_owned())
    }
}
