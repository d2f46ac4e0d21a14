//! Best-effort stripping of dangerous raw-SQL constructs.
//!
//! This is a text filter, not a parser. It removes comments and anything after
//! a semicolon on the same line, which blocks the simplest multi-statement
//! injections. It is lossy: a semicolon or `--` inside a string literal is
//! stripped too. Bind parameters remain the primary injection defense.

use regex::Regex;
use std::sync::LazyLock;

static BLOCK_COMMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)/\*.*?\*/").expect("valid block comment pattern"));

static LINE_COMMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"--[^\n]*").expect("valid line comment pattern"));

static TRAILING_STATEMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r";[^\n]*").expect("valid statement separator pattern"));

/// Strip comments and trailing statements, then trim.
///
/// ```
/// use warehouse_pool::sql::sanitize;
///
/// assert_eq!(sanitize("SELECT 1; DROP TABLE t; -- comment"), "SELECT 1");
/// ```
pub fn sanitize(sql: &str) -> String {
    let without_blocks = BLOCK_COMMENT.replace_all(sql, "");
    let without_lines = LINE_COMMENT.replace_all(&without_blocks, "");
    let single = TRAILING_STATEMENT.replace_all(&without_lines, "");
    single.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drops_everything_after_first_semicolon() {
        let out = sanitize("SELECT 1; DROP TABLE t; -- comment");
        assert_eq!(out, "SELECT 1");
        assert!(!out.contains("--"));
        assert!(!out.contains("DROP"));
    }

    #[test]
    fn test_strips_line_comments() {
        let sql = "SELECT word -- the word\nFROM words -- table\nWHERE id = ?";
        assert_eq!(sanitize(sql), "SELECT word \nFROM words \nWHERE id = ?");
    }

    #[test]
    fn test_strips_block_comments_across_lines() {
        let sql = "SELECT /* hint\n spanning lines */ id FROM words";
        assert_eq!(sanitize(sql), "SELECT  id FROM words");
    }

    #[test]
    fn test_semicolon_only_affects_its_line() {
        let sql = "SELECT id FROM a;\nSELECT id FROM b";
        assert_eq!(sanitize(sql), "SELECT id FROM a\nSELECT id FROM b");
    }

    #[test]
    fn test_plain_sql_unchanged() {
        assert_eq!(
            sanitize("  SELECT * FROM words WHERE id = ?  "),
            "SELECT * FROM words WHERE id = ?"
        );
    }

    #[test]
    fn test_lossy_on_literals() {
        // Known limitation: semicolons inside literals are stripped too.
        assert_eq!(sanitize("SELECT 'a;b'"), "SELECT 'a");
    }

    #[test]
    fn test_empty_input() {
        assert_eq!(sanitize(""), "");
        assert_eq!(sanitize("-- only a comment"), "");
    }
}
