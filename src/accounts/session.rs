use anyhow::{anyhow, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::info;

const TOKEN_PREFIX: &str = "clk";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Session {
    pub id: i64,
    pub user_id: i64,
}

/// Messages held on a session until the next page view.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Flash {
    pub messages: Vec<String>,
    pub errors: Vec<String>,
}

pub fn generate_token() -> String {
    let bytes: [u8; 32] = rand::random();
    format!("{TOKEN_PREFIX}_{}", hex::encode(bytes))
}

pub fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

pub struct SessionStore<'a> {
    conn: &'a Connection,
}

impl<'a> SessionStore<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Starts a session for `user_id` and returns its bearer token.
    /// Only the token hash is stored.
    pub fn create(&self, user_id: i64) -> Result<String> {
        let token = generate_token();
        self.conn.execute(
            "INSERT INTO sessions(token_hash, user_id) VALUES (?1, ?2)",
            params![hash_token(&token), user_id],
        )?;
        info!("started session for user {user_id}");
        Ok(token)
    }

    pub fn resolve(&self, token: &str) -> Result<Option<Session>> {
        let session = self
            .conn
            .query_row(
                "SELECT id, user_id FROM sessions WHERE token_hash = ?1",
                params![hash_token(token.trim())],
                |row| {
                    Ok(Session {
                        id: row.get(0)?,
                        user_id: row.get(1)?,
                    })
                },
            )
            .optional()?;
        Ok(session)
    }

    pub fn set_flash(&self, session: &Session, flash: &Flash) -> Result<()> {
        let updated = self.conn.execute(
            "UPDATE sessions SET flash_messages = ?1, flash_errors = ?2 WHERE id = ?3",
            params![
                serde_json::to_string(&flash.messages)?,
                serde_json::to_string(&flash.errors)?,
                session.id
            ],
        )?;
        if updated == 0 {
            return Err(anyhow!("session {} not found", session.id));
        }
        Ok(())
    }

    /// Returns and clears the pending flash messages.
    pub fn take_flash(&self, session: &Session) -> Result<Flash> {
        let tx = self.conn.unchecked_transaction()?;
        let (messages, errors): (String, String) = tx.query_row(
            "SELECT flash_messages, flash_errors FROM sessions WHERE id = ?1",
            params![session.id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        tx.execute(
            "UPDATE sessions SET flash_messages = '[]', flash_errors = '[]' WHERE id = ?1",
            params![session.id],
        )?;
        tx.commit()?;
        Ok(Flash {
            messages: serde_json::from_str(&messages)?,
            errors: serde_json::from_str(&errors)?,
        })
    }
}
