use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::events::Table;
use crate::models::{User, UserId};

// -- Users --

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateUserRequest {
    pub id: UserId,
    pub username: String,
    #[serde(default)]
    pub pixels_placed: i64,
    pub last_active: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// `{success: true, user}` or `{success: false, error}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateUserResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<User>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CreateUserResponse {
    pub fn created(user: User) -> Self {
        Self {
            success: true,
            user: Some(user),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            user: None,
            error: Some(error.into()),
        }
    }
}

// -- Cells --

/// Body of `POST /api/pixels`. The color stays a raw string here so the handler
/// can answer a malformed one with a validation error instead of a decode error.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpsertCellRequest {
    pub x: i32,
    pub y: i32,
    pub color: String,
    pub user_id: UserId,
    pub last_updated: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

// -- Change log --

fn snapshot_offset() -> i64 {
    -1
}

/// Query string of `GET /v1/shape`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShapeQuery {
    pub table: Table,
    /// `-1` requests a snapshot; otherwise the last offset the caller has seen.
    #[serde(default = "snapshot_offset")]
    pub offset: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handle: Option<String>,
    #[serde(default)]
    pub live: bool,
    pub source_id: String,
}
