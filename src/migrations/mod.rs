pub mod base;
pub mod blockcount;

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::db::table_exists;
use crate::migrations::base::{base_migrations, LEDGER_TABLE};
use crate::migrations::blockcount::{CurrencyCode, GeneratedBlockCountMigration};

/// A unit of schema change.
///
/// By default a migration counts as applied once its name is in the
/// `migrations` ledger. Implementations may derive applied-state from the
/// schema instead.
pub trait Migration: Send + Sync {
    fn name(&self) -> String;

    fn is_applied(&self, conn: &Connection) -> Result<bool> {
        ledger_contains(conn, &self.name())
    }

    fn apply(&self, conn: &Connection) -> Result<()>;
}

pub fn ledger_contains(conn: &Connection, name: &str) -> Result<bool> {
    if !table_exists(conn, "migrations")? {
        return Ok(false);
    }
    let found = conn
        .query_row(
            "SELECT 1 FROM migrations WHERE name = ?1",
            params![name],
            |_| Ok(()),
        )
        .optional()?;
    Ok(found.is_some())
}

fn record_applied(conn: &Connection, name: &str) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO migrations(name) VALUES (?1)",
        params![name],
    )?;
    Ok(())
}

#[derive(Debug, Clone, Serialize)]
pub struct MigrationStatus {
    pub name: String,
    pub applied: bool,
}

pub struct MigrationRunner {
    migrations: Vec<Box<dyn Migration>>,
}

impl MigrationRunner {
    pub fn new() -> Self {
        let migrations = base_migrations()
            .into_iter()
            .map(|m| Box::new(m) as Box<dyn Migration>)
            .collect();
        Self { migrations }
    }

    /// Base schema plus one generated block-count migration per currency.
    pub fn with_currencies(currencies: &[CurrencyCode]) -> Self {
        let mut runner = Self::new();
        for currency in currencies {
            runner.push(Box::new(GeneratedBlockCountMigration::new(currency.clone())));
        }
        runner
    }

    pub fn push(&mut self, migration: Box<dyn Migration>) {
        self.migrations.push(migration);
    }

    pub fn status(&self, conn: &Connection) -> Result<Vec<MigrationStatus>> {
        let mut out = Vec::with_capacity(self.migrations.len());
        for migration in &self.migrations {
            out.push(MigrationStatus {
                name: migration.name(),
                applied: migration.is_applied(conn)?,
            });
        }
        Ok(out)
    }

    /// Applies every pending migration in order, halting on the first failure.
    /// Returns the names of the migrations applied by this run.
    pub fn run(&self, conn: &Connection) -> Result<Vec<String>> {
        conn.execute_batch(LEDGER_TABLE)
            .context("failed creating migrations ledger")?;

        let mut applied = Vec::new();
        for migration in &self.migrations {
            let name = migration.name();
            if migration.is_applied(conn)? {
                debug!("migration {name} already applied");
                continue;
            }
            info!("applying migration {name}");
            if let Err(err) = migration.apply(conn) {
                warn!("migration {name} failed: {err:#}");
                return Err(err.context(format!("migration {name} failed")));
            }
            record_applied(conn, &name)?;
            applied.push(name);
        }
        if applied.is_empty() {
            info!("schema is up to date");
        }
        Ok(applied)
    }
}

impl Default for MigrationRunner {
    fn default() -> Self {
        Self::new()
    }
}
