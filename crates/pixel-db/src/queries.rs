use chrono::Utc;
use rusqlite::Connection;
use tracing::debug;

use pixel_types::{Cell, LogOffset, Operation, ShapeRow, Table, User, UserId};

use crate::models::{CellRow, LogEntryRow, Snapshot, UserRow, format_timestamp};
use crate::{CellCommit, Database, Result, StoreError};

impl Database {
    // -- Users --

    /// Insert a new user and log it. Username and id must both be unused.
    pub fn create_user(&self, user: &User) -> Result<(User, LogOffset)> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            if query_user_by_username(&tx, &user.username)?.is_some() {
                return Err(StoreError::DuplicateUsername(user.username.clone()));
            }
            if query_user_by_id(&tx, user.id.as_str())?.is_some() {
                return Err(StoreError::DuplicateUserId(user.id.clone()));
            }

            tx.execute(
                "INSERT INTO users (id, username, pixels_placed, last_active, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![
                    user.id.as_str(),
                    &user.username,
                    user.pixels_placed,
                    format_timestamp(&user.last_active),
                    format_timestamp(&user.created_at),
                ],
            )
            .map_err(|e| classify_user_conflict(e, user))?;

            let stored = query_user_by_id(&tx, user.id.as_str())?
                .ok_or_else(|| StoreError::Corrupt(format!("user {} vanished after insert", user.id)))?
                .into_user()?;
            let offset = append_log(&tx, Operation::Insert, &stored)?;

            tx.commit()?;
            debug!("Created user {} ({}) at offset {}", stored.username, stored.id, offset);
            Ok((stored, offset))
        })
    }

    pub fn get_user_by_id(&self, id: &UserId) -> Result<Option<User>> {
        self.with_conn(|conn| query_user_by_id(conn, id.as_str())?.map(UserRow::into_user).transpose())
    }

    pub fn get_user_by_username(&self, username: &str) -> Result<Option<User>> {
        self.with_conn(|conn| query_user_by_username(conn, username)?.map(UserRow::into_user).transpose())
    }

    // -- Cells --

    /// Upsert a cell on `(x, y)`, credit the writer, and log both row changes
    /// in one transaction.
    pub fn upsert_cell(&self, cell: &Cell) -> Result<CellCommit> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            if query_user_by_id(&tx, cell.user_id.as_str())?.is_none() {
                return Err(StoreError::UnknownUser(cell.user_id.clone()));
            }

            let existed = query_cell(&tx, cell.x, cell.y)?.is_some();

            tx.execute(
                "INSERT INTO cells (x, y, color, user_id, last_updated)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT (x, y) DO UPDATE SET
                    color = excluded.color,
                    user_id = excluded.user_id,
                    last_updated = excluded.last_updated",
                rusqlite::params![
                    cell.x,
                    cell.y,
                    cell.color.as_str(),
                    cell.user_id.as_str(),
                    format_timestamp(&cell.last_updated),
                ],
            )?;

            tx.execute(
                "UPDATE users SET pixels_placed = pixels_placed + 1, last_active = ?1 WHERE id = ?2",
                rusqlite::params![format_timestamp(&Utc::now()), cell.user_id.as_str()],
            )?;

            let stored = query_cell(&tx, cell.x, cell.y)?
                .ok_or_else(|| StoreError::Corrupt(format!("cell ({}, {}) vanished after upsert", cell.x, cell.y)))?
                .into_cell()?;
            let user = query_user_by_id(&tx, cell.user_id.as_str())?
                .ok_or_else(|| StoreError::UnknownUser(cell.user_id.clone()))?
                .into_user()?;

            let cell_operation = if existed { Operation::Update } else { Operation::Insert };
            let cell_offset = append_log(&tx, cell_operation, &stored)?;
            let user_offset = append_log(&tx, Operation::Update, &user)?;

            tx.commit()?;
            Ok(CellCommit {
                cell: stored,
                cell_operation,
                cell_offset,
                user,
                user_offset,
            })
        })
    }

    pub fn get_cell(&self, x: i32, y: i32) -> Result<Option<Cell>> {
        self.with_conn(|conn| query_cell(conn, x, y)?.map(CellRow::into_cell).transpose())
    }

    // -- Change log --

    /// Latest non-deleted entry per key, reported as inserts, together with
    /// the offset the snapshot is consistent with.
    pub fn snapshot(&self, table: Table) -> Result<Snapshot> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT c.seq, 'insert', c.row_key, c.value
                 FROM change_log c
                 JOIN (
                    SELECT MAX(seq) AS seq FROM change_log
                    WHERE table_name = ?1
                    GROUP BY row_key
                 ) latest ON latest.seq = c.seq
                 WHERE c.operation != 'delete'
                 ORDER BY c.seq",
            )?;
            let entries = stmt
                .query_map([table.as_str()], map_log_entry)?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            let head = query_head(conn, table)?;
            Ok(Snapshot { entries, head })
        })
    }

    /// Entries strictly after `after`, oldest first, at most `limit` of them.
    pub fn changes_since(&self, table: Table, after: LogOffset, limit: u32) -> Result<Vec<LogEntryRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT seq, operation, row_key, value
                 FROM change_log
                 WHERE table_name = ?1 AND seq > ?2
                 ORDER BY seq
                 LIMIT ?3",
            )?;
            let rows = stmt
                .query_map(rusqlite::params![table.as_str(), after.0 as i64, limit], map_log_entry)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Offset of the newest entry for `table` (0 when the table has none).
    pub fn head(&self, table: Table) -> Result<LogOffset> {
        self.with_conn(|conn| query_head(conn, table))
    }
}

fn append_log<R: ShapeRow>(conn: &Connection, operation: Operation, row: &R) -> Result<LogOffset> {
    let key = serde_json::to_string(&row.key()).map_err(|e| StoreError::Corrupt(e.to_string()))?;
    let value = match operation {
        Operation::Delete => None,
        _ => Some(serde_json::to_string(row).map_err(|e| StoreError::Corrupt(e.to_string()))?),
    };

    conn.execute(
        "INSERT INTO change_log (table_name, operation, row_key, value) VALUES (?1, ?2, ?3, ?4)",
        rusqlite::params![R::TABLE.as_str(), operation.as_str(), key, value],
    )?;

    Ok(LogOffset(conn.last_insert_rowid() as u64))
}

fn classify_user_conflict(err: rusqlite::Error, user: &User) -> StoreError {
    if let rusqlite::Error::SqliteFailure(code, Some(msg)) = &err {
        if code.code == rusqlite::ErrorCode::ConstraintViolation {
            if msg.contains("users.username") {
                return StoreError::DuplicateUsername(user.username.clone());
            }
            if msg.contains("users.id") {
                return StoreError::DuplicateUserId(user.id.clone());
            }
        }
    }
    err.into()
}

fn map_log_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<LogEntryRow> {
    Ok(LogEntryRow {
        seq: row.get(0)?,
        operation: row.get(1)?,
        row_key: row.get(2)?,
        value: row.get(3)?,
    })
}

fn query_head(conn: &Connection, table: Table) -> Result<LogOffset> {
    let seq: i64 = conn.query_row(
        "SELECT COALESCE(MAX(seq), 0) FROM change_log WHERE table_name = ?1",
        [table.as_str()],
        |r| r.get(0),
    )?;
    Ok(LogOffset(seq as u64))
}

fn query_user_by_username(conn: &Connection, username: &str) -> Result<Option<UserRow>> {
    let mut stmt = conn.prepare(
        "SELECT id, username, pixels_placed, last_active, created_at FROM users WHERE username = ?1",
    )?;

    let row = stmt.query_row([username], map_user).optional()?;
    Ok(row)
}

fn query_user_by_id(conn: &Connection, id: &str) -> Result<Option<UserRow>> {
    let mut stmt = conn
        .prepare("SELECT id, username, pixels_placed, last_active, created_at FROM users WHERE id = ?1")?;

    let row = stmt.query_row([id], map_user).optional()?;
    Ok(row)
}

fn map_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<UserRow> {
    Ok(UserRow {
        id: row.get(0)?,
        username: row.get(1)?,
        pixels_placed: row.get(2)?,
        last_active: row.get(3)?,
        created_at: row.get(4)?,
    })
}

fn query_cell(conn: &Connection, x: i32, y: i32) -> Result<Option<CellRow>> {
    let mut stmt =
        conn.prepare("SELECT x, y, color, user_id, last_updated FROM cells WHERE x = ?1 AND y = ?2")?;

    let row = stmt
        .query_row([x, y], |row| {
            Ok(CellRow {
                x: row.get(0)?,
                y: row.get(1)?,
                color: row.get(2)?,
                user_id: row.get(3)?,
                last_updated: row.get(4)?,
            })
        })
        .optional()?;

    Ok(row)
}

/// Extension trait for optional query results
trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
