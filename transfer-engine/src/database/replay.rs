//! Raw SQL script replay for legacy dumps.
//!
//! Statements that would wipe data wholesale (`DROP`, `TRUNCATE`, `DELETE`
//! without `WHERE`) are never executed. The check is textual.

use crate::site::RelationalStore;
use crate::{Result, TransferError};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReplayReport {
    pub executed: usize,
    pub skipped: Vec<String>,
}

#[derive(Clone, Copy, PartialEq)]
enum State {
    Normal,
    Quoted(char),
    LineComment,
    BlockComment,
}

/// Split a script into statements on `;`, ignoring semicolons inside quotes
/// and dropping comments.
pub fn split_statements(script: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut state = State::Normal;
    let mut chars = script.chars().peekable();

    while let Some(c) = chars.next() {
        match state {
            State::Normal => match c {
                '\'' | '"' | '`' => {
                    state = State::Quoted(c);
                    current.push(c);
                }
                '-' if chars.peek() == Some(&'-') => {
                    chars.next();
                    state = State::LineComment;
                }
                '#' => state = State::LineComment,
                '/' if chars.peek() == Some(&'*') => {
                    chars.next();
                    state = State::BlockComment;
                }
                ';' => {
                    push_statement(&mut statements, &current);
                    current.clear();
                }
                _ => current.push(c),
            },
            State::Quoted(quote) => {
                current.push(c);
                if c == '\\' {
                    if let Some(escaped) = chars.next() {
                        current.push(escaped);
                    }
                } else if c == quote {
                    // A doubled quote reopens immediately on the next char
                    state = State::Normal;
                }
            }
            State::LineComment => {
                if c == '\n' {
                    state = State::Normal;
                    current.push('\n');
                }
            }
            State::BlockComment => {
                if c == '*' && chars.peek() == Some(&'/') {
                    chars.next();
                    state = State::Normal;
                    current.push(' ');
                }
            }
        }
    }
    push_statement(&mut statements, &current);
    statements
}

fn push_statement(statements: &mut Vec<String>, raw: &str) {
    let trimmed = raw.trim();
    if !trimmed.is_empty() {
        statements.push(trimmed.to_string());
    }
}

/// True for `DROP ...`, `TRUNCATE ...` and `DELETE` without a `WHERE` clause.
pub fn is_dangerous(statement: &str) -> bool {
    let normalized = statement
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_ascii_uppercase();

    normalized.starts_with("DROP ")
        || normalized.starts_with("TRUNCATE ")
        || (normalized.starts_with("DELETE ") && !normalized.contains(" WHERE "))
}

/// Execute a script statement by statement, skipping dangerous ones.
/// Stops at the first statement the store rejects.
pub fn replay_sql(store: &dyn RelationalStore, script: &str) -> Result<ReplayReport> {
    let mut report = ReplayReport::default();

    for statement in split_statements(script) {
        if is_dangerous(&statement) {
            tracing::warn!(statement = %statement, "DangerousStatementSkipped");
            report.skipped.push(statement);
            continue;
        }

        store.execute(&statement).map_err(|e| {
            let head: String = statement.chars().take(80).collect();
            TransferError::PartialWrite(format!("{}: {}", head, e))
        })?;
        report.executed += 1;
    }

    tracing::info!(
        executed = report.executed,
        skipped = report.skipped.len(),
        "SQL replay finished"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_respects_quotes_and_comments() {
        let script = "-- header\nINSERT INTO t VALUES ('a;b', \"c;d\");\n/* block; */ UPDATE t SET v = 'it''s';\n# mysql comment\nSELECT 1";
        let statements = split_statements(script);
        assert_eq!(
            statements,
            vec![
                "INSERT INTO t VALUES ('a;b', \"c;d\")",
                "UPDATE t SET v = 'it''s'",
                "SELECT 1",
            ]
        );
    }

    #[test]
    fn test_split_handles_backslash_escape() {
        let statements = split_statements(r"INSERT INTO t VALUES ('a\';b'); DELETE FROM t WHERE id = 1;");
        assert_eq!(statements.len(), 2);
        assert_eq!(statements[0], r"INSERT INTO t VALUES ('a\';b')");
    }

    #[test]
    fn test_dangerous_statements() {
        assert!(is_dangerous("DROP TABLE wp_posts"));
        assert!(is_dangerous("drop  table if exists x"));
        assert!(is_dangerous("TRUNCATE wp_options"));
        assert!(is_dangerous("DELETE FROM wp_posts"));
        assert!(is_dangerous("delete\nfrom wp_posts"));
        assert!(!is_dangerous("DELETE FROM wp_posts WHERE id = 3"));
        assert!(!is_dangerous("delete from wp_posts\nwhere id = 3"));
        assert!(!is_dangerous("INSERT INTO drops VALUES (1)"));
    }
}
