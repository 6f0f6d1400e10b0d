//! Setting or changing the password of the signed-in user.
//!
//! Every validation runs and all failures are reported together. The password
//! is only persisted, and the notification only sent, when none fail.

use std::collections::BTreeMap;

use anyhow::{anyhow, Result};
use rusqlite::Connection;
use serde::Deserialize;
use thiserror::Error;

use crate::accounts::password::change_password;
use crate::accounts::session::{Flash, Session};
use crate::accounts::UserStore;
use crate::config::AccountsConfig;
use crate::email::{EmailTemplate, Mailer};

pub const UPDATED_MESSAGE: &str = "Updated password.";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PasswordValidationError {
    #[error("Please select a password between {min}-{max} characters long.")]
    Length { min: usize, max: usize },
    #[error("Those passwords do not match.")]
    Mismatch,
    #[error("You need to have added an e-mail address to your account before you can enable password login.")]
    MissingEmail,
    #[error("This e-mail address is already being used by another account for password login.")]
    EmailInUse,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SetPasswordForm {
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub password2: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PasswordPolicy {
    pub min_length: usize,
    pub max_length: usize,
}

impl From<&AccountsConfig> for PasswordPolicy {
    fn from(config: &AccountsConfig) -> Self {
        Self {
            min_length: config.min_password_length,
            max_length: config.max_password_length,
        }
    }
}

impl Default for PasswordPolicy {
    fn default() -> Self {
        Self::from(&AccountsConfig::default())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SetPasswordOutcome {
    pub messages: Vec<String>,
    pub errors: Vec<PasswordValidationError>,
}

impl SetPasswordOutcome {
    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn into_flash(self) -> Flash {
        Flash {
            messages: self.messages,
            errors: self.errors.iter().map(ToString::to_string).collect(),
        }
    }
}

pub fn set_password(
    conn: &Connection,
    session: &Session,
    form: &SetPasswordForm,
    policy: &PasswordPolicy,
    mailer: &dyn Mailer,
) -> Result<SetPasswordOutcome> {
    let users = UserStore::new(conn);
    let user = users
        .get(session.user_id)?
        .ok_or_else(|| anyhow!("session user {} not found", session.user_id))?;

    let mut outcome = SetPasswordOutcome::default();

    let length = form.password.chars().count();
    if length < policy.min_length || length > policy.max_length {
        outcome.errors.push(PasswordValidationError::Length {
            min: policy.min_length,
            max: policy.max_length,
        });
    }
    if form.password != form.password2 {
        outcome.errors.push(PasswordValidationError::Mismatch);
    }
    if user.email.is_empty() {
        outcome.errors.push(PasswordValidationError::MissingEmail);
    } else if users.email_used_by_other(&user.email, user.id)? {
        outcome.errors.push(PasswordValidationError::EmailInUse);
    }

    if !outcome.errors.is_empty() {
        return Ok(outcome);
    }

    // the outbox shares `conn`, so its insert commits or rolls back with the hash
    let tx = conn.unchecked_transaction()?;
    change_password(conn, &user, &form.password)?;

    let template = if user.has_password() {
        EmailTemplate::PasswordChanged
    } else {
        EmailTemplate::PasswordAdded
    };
    let arguments = BTreeMap::from([
        ("email".to_string(), user.email.clone()),
        ("name".to_string(), user.display_name().to_string()),
    ]);
    mailer.send_user_email(&user, template, arguments)?;
    tx.commit()?;

    outcome.messages.push(UPDATED_MESSAGE.to_string());
    Ok(outcome)
}
