use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS users (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            name        TEXT NOT NULL UNIQUE,
            email       TEXT NOT NULL UNIQUE,
            password    TEXT NOT NULL,
            room        TEXT,
            avatar_url  TEXT NOT NULL,
            last_login  INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS messages (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            author_id   INTEGER NOT NULL REFERENCES users(id),
            content     TEXT NOT NULL,
            kind        TEXT NOT NULL,
            recipient   TEXT,
            created_at  INTEGER NOT NULL,
            room        TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_messages_order
            ON messages(created_at, id);

        -- One row per live connection; user_name repeats across tabs.
        CREATE TABLE IF NOT EXISTS sessions (
            connection_id  TEXT PRIMARY KEY,
            user_name      TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_sessions_user
            ON sessions(user_name);
        ",
    )?;

    info!("Database migrations complete");
    Ok(())
}
