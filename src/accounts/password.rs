use anyhow::{anyhow, Result};
use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use rusqlite::Connection;
use tracing::info;

use crate::accounts::{User, UserStore};

/// Argon2id hash of a password with a fresh random salt, as a PHC string.
pub fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| anyhow!("failed hashing password: {e}"))?;
    Ok(hash.to_string())
}

/// Checks `password` against a stored PHC string. Empty or malformed hashes never match.
pub fn verify_password(password: &str, password_hash: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(password_hash) else {
        return false;
    };
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok()
}

pub fn change_password(conn: &Connection, user: &User, password: &str) -> Result<()> {
    let hash = hash_password(password)?;
    UserStore::new(conn).update_password_hash(user.id, &hash)?;
    info!("changed password for user {}", user.id);
    Ok(())
}
