//! String escaping for SQL literals.
//!
//! The result does not include the surrounding quotes.

/// Escape `s` for use inside a single-quoted literal.
///
/// With `no_backslash_escapes` (the `NO_BACKSLASH_ESCAPES` SQL mode) the
/// server treats `\` literally, so only `'` is doubled.
pub fn escape(s: &str, no_backslash_escapes: bool) -> String {
    if no_backslash_escapes {
        return s.replace('\'', "''");
    }

    let mut result = String::with_capacity(s.len() + 8);
    for ch in s.chars() {
        match ch {
            '"' => result.push_str("\\\""),
            '\0' => result.push_str("\\0"),
            '\'' => result.push_str("\\'"),
            '\\' => result.push_str("\\\\"),
            '\n' => result.push_str("\\n"),
            '\r' => result.push_str("\\r"),
            '\x1a' => result.push_str("\\Z"), // Ctrl+Z
            _ => result.push(ch),
        }
    }
    result
}
