use anyhow::{Context, Result};
use rusqlite::Connection;

use crate::migrations::Migration;

pub const LEDGER_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS migrations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    applied_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
);
"#;

const USERS: &str = r#"
CREATE TABLE users (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    email TEXT NOT NULL DEFAULT '',
    name TEXT NOT NULL DEFAULT '',
    password_hash TEXT NOT NULL DEFAULT '',
    created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
    updated_at TEXT
);
CREATE INDEX idx_users_email ON users(email);
"#;

const SESSIONS: &str = r#"
CREATE TABLE sessions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    token_hash TEXT NOT NULL UNIQUE,
    user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
    flash_messages TEXT NOT NULL DEFAULT '[]',
    flash_errors TEXT NOT NULL DEFAULT '[]'
);
CREATE INDEX idx_sessions_user ON sessions(user_id);
"#;

const EMAILS: &str = r#"
CREATE TABLE emails (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER,
    to_email TEXT NOT NULL,
    to_name TEXT NOT NULL,
    template_id TEXT NOT NULL,
    arguments TEXT NOT NULL,
    subject TEXT NOT NULL,
    body TEXT NOT NULL,
    created_at TEXT NOT NULL,
    is_sent INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX idx_emails_unsent ON emails(is_sent);
"#;

/// A named block of fixed DDL, tracked by the `migrations` ledger.
pub struct SqlMigration {
    name: &'static str,
    sql: &'static str,
}

impl SqlMigration {
    pub const fn new(name: &'static str, sql: &'static str) -> Self {
        Self { name, sql }
    }
}

impl Migration for SqlMigration {
    fn name(&self) -> String {
        self.name.to_string()
    }

    fn apply(&self, conn: &Connection) -> Result<()> {
        let tx = conn.unchecked_transaction()?;
        tx.execute_batch(self.sql)
            .with_context(|| format!("failed applying migration {}", self.name))?;
        tx.commit()?;
        Ok(())
    }
}

pub fn base_migrations() -> Vec<SqlMigration> {
    vec![
        SqlMigration::new("0001_create_users", USERS),
        SqlMigration::new("0002_create_sessions", SESSIONS),
        SqlMigration::new("0003_create_emails", EMAILS),
    ]
}
