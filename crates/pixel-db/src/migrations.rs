use anyhow::Result;
use rusqlite::Connection;
use tracing::info;
use uuid::Uuid;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL);")?;

    let version: i64 =
        conn.query_row("SELECT COALESCE(MAX(version), 0) FROM schema_version", [], |r| r.get(0))?;

    if version < 1 {
        info!("Running migration v1 (users, cells, change log)");
        conn.execute_batch(
            "
            CREATE TABLE users (
                id              TEXT PRIMARY KEY,
                username        TEXT NOT NULL UNIQUE,
                pixels_placed   INTEGER NOT NULL DEFAULT 0,
                last_active     TEXT NOT NULL,
                created_at      TEXT NOT NULL
            );

            CREATE TABLE cells (
                x               INTEGER NOT NULL,
                y               INTEGER NOT NULL,
                color           TEXT NOT NULL,
                user_id         TEXT NOT NULL REFERENCES users(id),
                last_updated    TEXT NOT NULL,
                PRIMARY KEY (x, y)
            );

            -- seq doubles as the subscriber-visible log offset
            CREATE TABLE change_log (
                seq             INTEGER PRIMARY KEY AUTOINCREMENT,
                table_name      TEXT NOT NULL,
                operation       TEXT NOT NULL,
                row_key         TEXT NOT NULL,
                value           TEXT,
                committed_at    TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE INDEX idx_change_log_table
                ON change_log(table_name, seq);

            CREATE INDEX idx_change_log_key
                ON change_log(table_name, row_key, seq);

            CREATE TABLE meta (
                key             TEXT PRIMARY KEY,
                value           TEXT NOT NULL
            );

            INSERT INTO schema_version (version) VALUES (1);
            ",
        )?;
        conn.execute(
            "INSERT INTO meta (key, value) VALUES ('log_handle', ?1)",
            [Uuid::new_v4().to_string()],
        )?;
    }

    info!("Database migrations complete");
    Ok(())
}

pub fn log_handle(conn: &Connection) -> Result<String> {
    let handle = conn.query_row("SELECT value FROM meta WHERE key = 'log_handle'", [], |r| r.get(0))?;
    Ok(handle)
}
