//! Migrations generated at runtime, one per currency.
//!
//! Every currency shares the same block-count table layout, so instead of one
//! hand-written migration per currency a single [`GeneratedBlockCountMigration`]
//! is instantiated for each configured [`CurrencyCode`].

use std::fmt::{Display, Formatter};
use std::str::FromStr;

use anyhow::{Context, Result};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::db::{quote_identifier, table_exists};
use crate::migrations::Migration;

pub const TABLE_PREFIX: &str = "blockcount_";
pub const BASE_NAME: &str = "generated_block_count";

const MIN_CODE_LEN: usize = 2;
const MAX_CODE_LEN: usize = 10;

/// A currency code that is safe to embed in a table name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CurrencyCode(String);

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid currency code {0:?}: expected 2-10 lowercase letters or digits")]
pub struct CurrencyParseError(pub String);

impl CurrencyCode {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for CurrencyCode {
    type Err = CurrencyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        let valid_len = (MIN_CODE_LEN..=MAX_CODE_LEN).contains(&normalized.len());
        let valid_chars = normalized
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit());
        if valid_len && valid_chars {
            Ok(Self(normalized))
        } else {
            Err(CurrencyParseError(s.to_string()))
        }
    }
}

impl TryFrom<String> for CurrencyCode {
    type Error = CurrencyParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<CurrencyCode> for String {
    fn from(value: CurrencyCode) -> Self {
        value.0
    }
}

impl Display for CurrencyCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

pub fn parse_currency_list(raw: &str) -> Result<Vec<CurrencyCode>, CurrencyParseError> {
    let mut out = Vec::new();
    for piece in raw.split(',') {
        if piece.trim().is_empty() {
            continue;
        }
        out.push(piece.parse()?);
    }
    out.sort();
    out.dedup();
    Ok(out)
}

pub fn table_name(currency: &CurrencyCode) -> String {
    format!("{TABLE_PREFIX}{currency}")
}

#[derive(Debug, Clone)]
pub struct GeneratedBlockCountMigration {
    currency: CurrencyCode,
}

impl GeneratedBlockCountMigration {
    pub fn new(currency: CurrencyCode) -> Self {
        Self { currency }
    }

    pub fn table(&self) -> String {
        table_name(&self.currency)
    }

    fn ddl(&self) -> String {
        let table = self.table();
        format!(
            r#"
CREATE TABLE {quoted} (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,

    blockcount INTEGER NOT NULL,
    is_recent INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX {index} ON {quoted}(is_recent);
"#,
            quoted = quote_identifier(&table),
            index = quote_identifier(&format!("idx_{table}_is_recent")),
        )
    }
}

impl Migration for GeneratedBlockCountMigration {
    fn name(&self) -> String {
        format!("{BASE_NAME}_{}", self.currency)
    }

    /// Applied-state is the existence of the table itself, not a ledger row.
    fn is_applied(&self, conn: &Connection) -> Result<bool> {
        table_exists(conn, &self.table())
    }

    fn apply(&self, conn: &Connection) -> Result<()> {
        let tx = conn.unchecked_transaction()?;
        tx.execute_batch(&self.ddl())
            .with_context(|| format!("failed creating table {}", self.table()))?;
        tx.commit()?;
        Ok(())
    }
}
