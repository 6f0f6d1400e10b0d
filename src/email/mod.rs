pub mod sink;

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::accounts::User;

// values of `emails.is_sent`
const STATUS_QUEUED: i64 = 0;
const STATUS_SENT: i64 = 1;
const STATUS_CLAIMED: i64 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmailTemplate {
    PasswordChanged,
    PasswordAdded,
}

impl EmailTemplate {
    pub fn as_key(&self) -> &'static str {
        match self {
            Self::PasswordChanged => "password_changed",
            Self::PasswordAdded => "password_added",
        }
    }

    fn subject(&self) -> &'static str {
        match self {
            Self::PasswordChanged => ":site_name: your password has been changed",
            Self::PasswordAdded => ":site_name: password login enabled",
        }
    }

    fn body(&self) -> &'static str {
        match self {
            Self::PasswordChanged => {
                "Hi :name,\n\nThe password for your :site_name account (:email) was just changed.\n\
                 If you did not make this change, please contact support immediately.\n"
            }
            Self::PasswordAdded => {
                "Hi :name,\n\nYou can now log in to :site_name with the e-mail address :email and your new password.\n\
                 If you did not make this change, please contact support immediately.\n"
            }
        }
    }
}

impl Display for EmailTemplate {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_key())
    }
}

/// Replaces `:key` placeholders with argument values in one pass over the
/// template. The longest matching key wins, and substituted values are never
/// scanned again.
pub fn render(template: &str, arguments: &BTreeMap<String, String>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(pos) = rest.find(':') {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];
        let matched = arguments
            .iter()
            .filter(|(key, _)| !key.is_empty() && after.starts_with(key.as_str()))
            .max_by_key(|(key, _)| key.len());
        match matched {
            Some((key, value)) => {
                out.push_str(value);
                rest = &after[key.len()..];
            }
            None => {
                out.push(':');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

/// Sends a templated notification to a user.
pub trait Mailer {
    fn send_user_email(
        &self,
        user: &User,
        template: EmailTemplate,
        arguments: BTreeMap<String, String>,
    ) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueuedEmail {
    pub id: i64,
    pub user_id: Option<i64>,
    pub from_address: String,
    pub to_email: String,
    pub to_name: String,
    pub template_id: String,
    pub arguments: BTreeMap<String, String>,
    pub subject: String,
    pub body: String,
    pub created_at: String,
}

/// Queues rendered e-mails in the `emails` table for later delivery.
pub struct Outbox<'a> {
    conn: &'a Connection,
    site_name: String,
    from_address: String,
}

impl<'a> Outbox<'a> {
    pub fn new(
        conn: &'a Connection,
        site_name: impl Into<String>,
        from_address: impl Into<String>,
    ) -> Self {
        Self {
            conn,
            site_name: site_name.into(),
            from_address: from_address.into(),
        }
    }

    /// Queued e-mails not yet claimed for delivery, oldest first.
    pub fn pending(&self, limit: usize) -> Result<Vec<QueuedEmail>> {
        let mut stmt = self.conn.prepare(
            r#"
SELECT id, user_id, to_email, to_name, template_id, arguments, subject, body, created_at
FROM emails
WHERE is_sent = ?1
ORDER BY id ASC
LIMIT ?2
"#,
        )?;
        let rows = stmt
            .query_map(params![STATUS_QUEUED, limit as i64], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, Option<i64>>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, String>(7)?,
                    row.get::<_, String>(8)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut out = Vec::with_capacity(rows.len());
        for (id, user_id, to_email, to_name, template_id, arguments, subject, body, created_at) in
            rows
        {
            out.push(QueuedEmail {
                id,
                user_id,
                from_address: self.from_address.clone(),
                to_email,
                to_name,
                template_id,
                arguments: serde_json::from_str(&arguments)
                    .with_context(|| format!("invalid arguments on queued email {id}"))?,
                subject,
                body,
                created_at,
            });
        }
        Ok(out)
    }

    /// Takes up to `limit` queued e-mails for delivery. A row is only handed
    /// out once: concurrent callers racing for it get it at most one at a time.
    pub fn claim_pending(&self, limit: usize) -> Result<Vec<QueuedEmail>> {
        let mut claimed = Vec::new();
        for email in self.pending(limit)? {
            let won = self.conn.execute(
                "UPDATE emails SET is_sent = ?1 WHERE id = ?2 AND is_sent = ?3",
                params![STATUS_CLAIMED, email.id, STATUS_QUEUED],
            )?;
            if won == 1 {
                claimed.push(email);
            }
        }
        Ok(claimed)
    }

    pub fn mark_sent(&self, ids: &[i64]) -> Result<()> {
        self.set_status(ids, STATUS_SENT)
    }

    /// Puts claimed e-mails back in the queue after a failed delivery.
    pub fn release(&self, ids: &[i64]) -> Result<()> {
        self.set_status(ids, STATUS_QUEUED)
    }

    fn set_status(&self, ids: &[i64], status: i64) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        for id in ids {
            tx.execute(
                "UPDATE emails SET is_sent = ?1 WHERE id = ?2",
                params![status, id],
            )?;
        }
        tx.commit()?;
        Ok(())
    }
}

impl Mailer for Outbox<'_> {
    fn send_user_email(
        &self,
        user: &User,
        template: EmailTemplate,
        arguments: BTreeMap<String, String>,
    ) -> Result<()> {
        let mut rendering = arguments.clone();
        rendering
            .entry("site_name".to_string())
            .or_insert_with(|| self.site_name.clone());
        let subject = render(template.subject(), &rendering);
        let body = render(template.body(), &rendering);

        self.conn
            .execute(
                r#"
INSERT INTO emails(user_id, to_email, to_name, template_id, arguments, subject, body, created_at)
VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
"#,
                params![
                    user.id,
                    user.email,
                    user.display_name(),
                    template.as_key(),
                    serde_json::to_string(&arguments)?,
                    subject,
                    body,
                    Utc::now().to_rfc3339()
                ],
            )
            .context("failed queueing email")?;
        info!("queued {template} email for user {}", user.id);
        Ok(())
    }
}
