use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use tracing::debug;

use crate::db::{quote_identifier, table_exists};
use crate::migrations::blockcount::{table_name, CurrencyCode};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockCount {
    pub id: i64,
    pub created_at: String,
    pub blockcount: i64,
    pub is_recent: bool,
}

/// Reads and writes the per-currency `blockcount_<currency>` tables.
pub struct BlockCountStore<'a> {
    conn: &'a Connection,
}

impl<'a> BlockCountStore<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn table(&self, currency: &CurrencyCode) -> Result<String> {
        let table = table_name(currency);
        if !table_exists(self.conn, &table)? {
            return Err(anyhow!(
                "no block count table for {currency}; run migrations first"
            ));
        }
        Ok(quote_identifier(&table))
    }

    /// Inserts a new block count as the only recent row for the currency.
    pub fn record(&self, currency: &CurrencyCode, blockcount: i64) -> Result<BlockCount> {
        let table = self.table(currency)?;
        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            &format!("UPDATE {table} SET is_recent = 0 WHERE is_recent = 1"),
            [],
        )?;
        tx.execute(
            &format!("INSERT INTO {table} (blockcount, is_recent) VALUES (?1, 1)"),
            params![blockcount],
        )
        .with_context(|| format!("failed recording block count for {currency}"))?;
        let id = tx.last_insert_rowid();
        tx.commit()?;
        debug!("recorded {currency} block count {blockcount}");

        self.by_id(&table, id)?
            .ok_or_else(|| anyhow!("block count row {id} vanished after insert"))
    }

    pub fn latest(&self, currency: &CurrencyCode) -> Result<Option<BlockCount>> {
        let table = self.table(currency)?;
        let row = self
            .conn
            .query_row(
                &format!(
                    "SELECT id, created_at, blockcount, is_recent FROM {table}
                     WHERE is_recent = 1 ORDER BY id DESC LIMIT 1"
                ),
                [],
                row_to_block_count,
            )
            .optional()?;
        Ok(row)
    }

    fn by_id(&self, table: &str, id: i64) -> Result<Option<BlockCount>> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT id, created_at, blockcount, is_recent FROM {table} WHERE id = ?1"),
                params![id],
                row_to_block_count,
            )
            .optional()?;
        Ok(row)
    }
}

fn row_to_block_count(row: &rusqlite::Row<'_>) -> rusqlite::Result<BlockCount> {
    Ok(BlockCount {
        id: row.get(0)?,
        created_at: row.get(1)?,
        blockcount: row.get(2)?,
        is_recent: row.get::<_, i64>(3)? != 0,
    })
}
