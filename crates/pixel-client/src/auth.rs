//! The local login record.
//!
//! There are no passwords: logging in creates a user and remembers it on
//! disk for [`AUTH_TTL_DAYS`]. An expired record is treated as absent.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use pixel_types::models::validate_username;
use pixel_types::{User, UserId};

use crate::backend::WriteBackend;
use crate::error::ClientError;

pub const AUTH_TTL_DAYS: i64 = 7;

const FILE_NAME: &str = "auth.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthRecord {
    pub user_id: UserId,
    pub username: String,
    pub expiry: DateTime<Utc>,
}

impl AuthRecord {
    pub fn issue(user: &User, now: DateTime<Utc>) -> Self {
        Self {
            user_id: user.id.clone(),
            username: user.username.clone(),
            expiry: now + TimeDelta::days(AUTH_TTL_DAYS),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expiry
    }
}

#[derive(Debug, Clone)]
pub struct AuthStore {
    path: PathBuf,
}

impl AuthStore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            path: dir.as_ref().join(FILE_NAME),
        }
    }

    /// The stored record, unless missing, unreadable or expired at `now`.
    pub async fn load(&self, now: DateTime<Utc>) -> Result<Option<AuthRecord>, ClientError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let record: AuthRecord = match serde_json::from_slice(&bytes) {
            Ok(record) => record,
            Err(e) => {
                warn!("Ignoring unreadable auth record {}: {}", self.path.display(), e);
                return Ok(None);
            }
        };

        if record.is_expired(now) {
            debug!("Auth record for {} expired at {}", record.username, record.expiry);
            return Ok(None);
        }
        Ok(Some(record))
    }

    pub async fn save(&self, record: &AuthRecord) -> Result<(), ClientError> {
        if let Some(dir) = self.path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        tokio::fs::write(&self.path, serde_json::to_vec_pretty(record)?).await?;
        Ok(())
    }

    pub async fn clear(&self) -> Result<(), ClientError> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Reuse a live record for `username`, or create the user and record it.
pub async fn login<B>(
    backend: &B,
    store: &AuthStore,
    username: &str,
    now: DateTime<Utc>,
) -> Result<AuthRecord, ClientError>
where
    B: WriteBackend + ?Sized,
{
    if let Some(record) = store.load(now).await? {
        if record.username == username {
            debug!("Reusing auth record for {}", username);
            return Ok(record);
        }
    }

    validate_username(username)?;

    let user = User {
        id: UserId::generate(),
        username: username.to_string(),
        pixels_placed: 0,
        last_active: now,
        created_at: now,
    };
    let created = backend.create_user(&user).await?;

    let record = AuthRecord::issue(&created, now);
    store.save(&record).await?;
    info!("Logged in as {} ({})", record.username, record.user_id);
    Ok(record)
}
