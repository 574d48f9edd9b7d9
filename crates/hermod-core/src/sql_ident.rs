//! Dialect-aware SQL identifier quoting (spec.md §4.6, §6).
//!
//! Every SQL sink routes table/column names through [`SqlDialect::quote`]
//! before interpolating them into generated DDL/DML. Quoting rejects
//! identifiers containing characters outside the dialect's identifier set
//! rather than attempting to escape them, since an identifier that needs
//! escaping to be "safe" is exactly the shape of an injection attempt.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SqlDialect {
    Postgres,
    MySql,
    Sqlite,
    ClickHouse,
    Snowflake,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid identifier for {dialect:?}: {identifier:?}")]
pub struct InvalidIdentifier {
    pub dialect: SqlDialect,
    pub identifier: String,
}

impl SqlDialect {
    /// Quote `identifier` for this dialect, rejecting characters outside the
    /// dialect's identifier set (spec.md §6).
    pub fn quote(&self, identifier: &str) -> Result<String, InvalidIdentifier> {
        if !is_valid_identifier(identifier) {
            return Err(InvalidIdentifier {
                dialect: *self,
                identifier: identifier.to_string(),
            });
        }
        Ok(match self {
            SqlDialect::Postgres | SqlDialect::Sqlite => {
                format!("\"{}\"", identifier.replace('"', "\"\""))
            }
            SqlDialect::MySql | SqlDialect::ClickHouse => {
                format!("`{}`", identifier.replace('`', "``"))
            }
            SqlDialect::Snowflake => format!("\"{}\"", identifier.replace('"', "\"\"")),
        })
    }

    /// Quote a qualified `schema.table` pair, quoting each part separately.
    pub fn quote_qualified(&self, schema: &str, name: &str) -> Result<String, InvalidIdentifier> {
        if schema.is_empty() {
            return self.quote(name);
        }
        Ok(format!("{}.{}", self.quote(schema)?, self.quote(name)?))
    }
}

/// An identifier must be non-empty, must not itself contain the quote
/// character unescaped by us (we escape it above, but we still bound length
/// and character class defensively: ASCII letters, digits, underscore, and
/// `$`/`.`are accepted; anything else — including NUL bytes, backslashes, or
/// whitespace used in SQL-injection probing — is rejected outright).
fn is_valid_identifier(identifier: &str) -> bool {
    if identifier.is_empty() || identifier.len() > 128 {
        return false;
    }
    identifier
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn postgres_quotes_with_double_quotes() {
        assert_eq!(SqlDialect::Postgres.quote("users").unwrap(), "\"users\"");
    }

    #[test]
    fn mysql_quotes_with_backticks() {
        assert_eq!(SqlDialect::MySql.quote("users").unwrap(), "`users`");
    }

    #[test]
    fn clickhouse_quotes_with_backticks() {
        assert_eq!(SqlDialect::ClickHouse.quote("events").unwrap(), "`events`");
    }

    #[test]
    fn rejects_injection_attempt() {
        let err = SqlDialect::Postgres.quote("users; DROP TABLE users; --");
        assert!(err.is_err());
    }

    #[test]
    fn rejects_embedded_quote_chars() {
        assert!(SqlDialect::Postgres.quote("a\"b").is_err());
        assert!(SqlDialect::MySql.quote("a`b").is_err());
    }

    #[test]
    fn quote_qualified_joins_both_parts() {
        assert_eq!(
            SqlDialect::ClickHouse.quote_qualified("db", "t").unwrap(),
            "`db`.`t`"
        );
    }
}
