pub mod password;
pub mod session;
pub mod set_password;

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct User {
    pub id: i64,
    pub email: String,
    pub name: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub created_at: String,
    pub updated_at: Option<String>,
}

impl User {
    pub fn has_password(&self) -> bool {
        !self.password_hash.is_empty()
    }

    /// Name used to address the user: their name, or their e-mail when unnamed.
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.email
        } else {
            &self.name
        }
    }
}

pub struct UserStore<'a> {
    conn: &'a Connection,
}

impl<'a> UserStore<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    pub fn create(&self, email: &str, name: &str) -> Result<User> {
        self.conn
            .execute(
                "INSERT INTO users(email, name) VALUES (?1, ?2)",
                params![email.trim(), name.trim()],
            )
            .context("failed creating user")?;
        let id = self.conn.last_insert_rowid();
        info!("created user {id}");
        self.get(id)?
            .ok_or_else(|| anyhow!("user {id} vanished after insert"))
    }

    pub fn get(&self, id: i64) -> Result<Option<User>> {
        let user = self
            .conn
            .query_row(
                r#"
SELECT id, email, name, password_hash, created_at, updated_at
FROM users
WHERE id = ?1
"#,
                params![id],
                row_to_user,
            )
            .optional()?;
        Ok(user)
    }

    /// The account that logs in with `email` and a password, if any.
    pub fn find_password_login(&self, email: &str) -> Result<Option<User>> {
        let user = self
            .conn
            .query_row(
                r#"
SELECT id, email, name, password_hash, created_at, updated_at
FROM users
WHERE email = ?1 AND email <> '' AND password_hash <> ''
ORDER BY id ASC
LIMIT 1
"#,
                params![email.trim()],
                row_to_user,
            )
            .optional()?;
        Ok(user)
    }

    /// Whether any account other than `user_id` uses `email`.
    pub fn email_used_by_other(&self, email: &str, user_id: i64) -> Result<bool> {
        let found = self
            .conn
            .query_row(
                "SELECT 1 FROM users WHERE email = ?1 AND id <> ?2 LIMIT 1",
                params![email, user_id],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn update_password_hash(&self, user_id: i64, password_hash: &str) -> Result<()> {
        let updated = self.conn.execute(
            "UPDATE users SET password_hash = ?1, updated_at = CURRENT_TIMESTAMP WHERE id = ?2",
            params![password_hash, user_id],
        )?;
        if updated == 0 {
            return Err(anyhow!("user {user_id} not found"));
        }
        Ok(())
    }
}

fn row_to_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        email: row.get(1)?,
        name: row.get(2)?,
        password_hash: row.get(3)?,
        created_at: row.get(4)?,
        updated_at: row.get(5)?,
    })
}
