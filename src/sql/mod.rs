//! SQL text helpers.
//!
//! - Sanitizing raw SQL before dispatch
//! - Classifying statements for metric labels
//! - Deriving short, low-cardinality tags and previews for logs

pub mod classify;
pub mod sanitize;

pub use classify::{StatementKind, classify};
pub use sanitize::sanitize;

/// Maximum length of the SQL-prefix tag used as the `source` metric label.
pub const SOURCE_TAG_LEN: usize = 32;

/// Maximum length of SQL previews in log lines.
pub const PREVIEW_LEN: usize = 100;

/// Collapse whitespace and keep at most `max_chars` characters.
fn prefix(sql: &str, max_chars: usize) -> String {
    let mut out = String::with_capacity(max_chars.min(sql.len()));
    let mut count = 0;
    for word in sql.split_whitespace() {
        if count > 0 {
            if count == max_chars {
                break;
            }
            out.push(' ');
            count += 1;
        }
        for ch in word.chars() {
            if count == max_chars {
                return out;
            }
            out.push(ch);
            count += 1;
        }
    }
    out
}

/// SQL-prefix tag identifying where a query came from.
pub fn source_tag(sql: &str) -> String {
    prefix(sql, SOURCE_TAG_LEN)
}

/// Truncated, single-line preview of a statement for log output.
pub fn preview(sql: &str) -> String {
    let short = prefix(sql, PREVIEW_LEN);
    if short.chars().count() == PREVIEW_LEN {
        format!("{}...", short)
    } else {
        short
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_tag_collapses_whitespace() {
        assert_eq!(source_tag("SELECT *\n   FROM   words"), "SELECT * FROM words");
    }

    #[test]
    fn test_source_tag_truncates() {
        let sql = "SELECT id, word, definition, difficulty FROM words WHERE id = ?";
        let tag = source_tag(sql);
        assert_eq!(tag.chars().count(), SOURCE_TAG_LEN);
        assert!(sql.starts_with(&tag));
    }

    #[test]
    fn test_preview_marks_truncation() {
        let long = format!("SELECT {} FROM t", "col, ".repeat(50));
        assert!(preview(&long).ends_with("..."));
        assert_eq!(preview("SELECT 1"), "SELECT 1");
    }
}
