//! Statement classification for metric labels.
//!
//! Uses [sqlparser](https://docs.rs/sqlparser/) with the Snowflake dialect to
//! tell reads from writes from schema changes. When the statement does not
//! parse (vendor extensions, bind placeholders the dialect rejects), the
//! leading keyword decides.

use sqlparser::ast::Statement;
use sqlparser::dialect::SnowflakeDialect;
use sqlparser::parser::Parser;

/// Kind of SQL statement, used as the `type` label on query metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatementKind {
    /// SELECT, WITH, VALUES
    Select,
    /// INSERT, UPDATE, DELETE, MERGE, COPY
    Dml,
    /// CREATE, ALTER, DROP, TRUNCATE
    Ddl,
    /// BEGIN, COMMIT, ROLLBACK, SAVEPOINT
    Transaction,
    /// SHOW, DESCRIBE, EXPLAIN
    Show,
    /// Anything else
    Other,
}

impl StatementKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Select => "select",
            Self::Dml => "dml",
            Self::Ddl => "ddl",
            Self::Transaction => "transaction",
            Self::Show => "show",
            Self::Other => "other",
        }
    }
}

impl std::fmt::Display for StatementKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classify a (sanitized) statement.
pub fn classify(sql: &str) -> StatementKind {
    match Parser::parse_sql(&SnowflakeDialect {}, sql) {
        Ok(statements) => match statements.first() {
            Some(stmt) => classify_statement(stmt),
            None => StatementKind::Other,
        },
        Err(_) => classify_keyword(sql),
    }
}

/// Classify a parsed statement into a statement kind.
fn classify_statement(stmt: &Statement) -> StatementKind {
    match stmt {
        Statement::Query(_) => StatementKind::Select,

        Statement::Insert(_)
        | Statement::Update { .. }
        | Statement::Delete(_)
        | Statement::Merge { .. }
        | Statement::Copy { .. }
        | Statement::CopyIntoSnowflake { .. } => StatementKind::Dml,

        Statement::CreateTable { .. }
        | Statement::CreateView { .. }
        | Statement::CreateIndex(_)
        | Statement::CreateSchema { .. }
        | Statement::CreateDatabase { .. }
        | Statement::CreateStage { .. }
        | Statement::AlterTable { .. }
        | Statement::AlterView { .. }
        | Statement::Drop { .. }
        | Statement::Truncate { .. } => StatementKind::Ddl,

        Statement::StartTransaction { .. }
        | Statement::Commit { .. }
        | Statement::Rollback { .. }
        | Statement::Savepoint { .. }
        | Statement::ReleaseSavepoint { .. } => StatementKind::Transaction,

        Statement::ShowTables { .. }
        | Statement::ShowColumns { .. }
        | Statement::ShowDatabases { .. }
        | Statement::ShowSchemas { .. }
        | Statement::ShowVariable { .. }
        | Statement::ExplainTable { .. }
        | Statement::Explain { .. } => StatementKind::Show,

        _ => StatementKind::Other,
    }
}

/// Fallback classification on the leading keyword.
fn classify_keyword(sql: &str) -> StatementKind {
    let keyword = sql
        .split_whitespace()
        .next()
        .map(|w| w.trim_start_matches('(').to_ascii_lowercase())
        .unwrap_or_default();

    match keyword.as_str() {
        "select" | "with" | "values" => StatementKind::Select,
        "insert" | "update" | "delete" | "merge" | "copy" | "upsert" => StatementKind::Dml,
        "create" | "alter" | "drop" | "truncate" => StatementKind::Ddl,
        "begin" | "start" | "commit" | "rollback" | "savepoint" => StatementKind::Transaction,
        "show" | "describe" | "desc" | "explain" => StatementKind::Show,
        _ => StatementKind::Other,
    }
}
