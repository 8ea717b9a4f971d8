//! Database row types. These map directly to SQLite rows.
//! Conversions into the pixel-types models live here so queries stay flat.

use chrono::{DateTime, Utc};

use pixel_types::{Cell, ChangeMessage, Color, LogOffset, Operation, ShapeRow, User, UserId};

use crate::StoreError;

pub struct UserRow {
    pub id: String,
    pub username: String,
    pub pixels_placed: i64,
    pub last_active: String,
    pub created_at: String,
}

impl UserRow {
    pub fn into_user(self) -> Result<User, StoreError> {
        Ok(User {
            id: UserId::new(self.id),
            username: self.username,
            pixels_placed: self.pixels_placed,
            last_active: parse_timestamp(&self.last_active)?,
            created_at: parse_timestamp(&self.created_at)?,
        })
    }
}

pub struct CellRow {
    pub x: i32,
    pub y: i32,
    pub color: String,
    pub user_id: String,
    pub last_updated: String,
}

impl CellRow {
    pub fn into_cell(self) -> Result<Cell, StoreError> {
        Ok(Cell {
            x: self.x,
            y: self.y,
            color: Color::parse(&self.color).map_err(|e| StoreError::Corrupt(e.to_string()))?,
            user_id: UserId::new(self.user_id),
            last_updated: parse_timestamp(&self.last_updated)?,
        })
    }
}

/// One row of `change_log`, still JSON-encoded.
#[derive(Debug, Clone)]
pub struct LogEntryRow {
    pub seq: i64,
    pub operation: String,
    pub row_key: String,
    pub value: Option<String>,
}

impl LogEntryRow {
    pub fn offset(&self) -> LogOffset {
        LogOffset(self.seq as u64)
    }

    /// Decode into a typed change message for the table's row type.
    pub fn decode<R: ShapeRow>(&self) -> Result<ChangeMessage<R>, StoreError> {
        let operation: Operation = self.operation.parse().map_err(StoreError::Corrupt)?;
        let key: R::Key = serde_json::from_str(&self.row_key)
            .map_err(|e| StoreError::Corrupt(format!("change_log key {:?}: {}", self.row_key, e)))?;
        let value = match (&self.value, operation) {
            (_, Operation::Delete) => None,
            (Some(json), _) => Some(serde_json::from_str::<R>(json).map_err(|e| {
                StoreError::Corrupt(format!("change_log value at seq {}: {}", self.seq, e))
            })?),
            (None, _) => {
                return Err(StoreError::Corrupt(format!(
                    "change_log seq {} is a {} without a value",
                    self.seq, self.operation
                )));
            }
        };

        Ok(ChangeMessage {
            offset: self.offset(),
            operation,
            key,
            value,
        })
    }
}

/// Latest live entry per key, plus the log position it is consistent with.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub entries: Vec<LogEntryRow>,
    pub head: LogOffset,
}

/// Result of a committed cell upsert.
#[derive(Debug, Clone)]
pub struct CellCommit {
    pub cell: Cell,
    pub cell_operation: Operation,
    pub cell_offset: LogOffset,
    pub user: User,
    pub user_offset: LogOffset,
}

pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339()
}

pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("timestamp {raw:?}: {e}")))
}
