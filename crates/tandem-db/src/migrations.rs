use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS users (
            id          TEXT PRIMARY KEY,
            name        TEXT NOT NULL,
            email       TEXT NOT NULL UNIQUE,
            password    TEXT NOT NULL,
            profile_pic TEXT,
            created_at  TEXT NOT NULL
        );

        -- user_low/user_high hold the participant ids sorted, so one row
        -- exists per unordered pair no matter who wrote first.
        CREATE TABLE IF NOT EXISTS conversations (
            id          TEXT PRIMARY KEY,
            sender_id   TEXT NOT NULL REFERENCES users(id),
            receiver_id TEXT NOT NULL REFERENCES users(id),
            user_low    TEXT NOT NULL,
            user_high   TEXT NOT NULL,
            created_at  TEXT NOT NULL,
            updated_at  TEXT NOT NULL,
            UNIQUE(user_low, user_high)
        );

        CREATE TABLE IF NOT EXISTS messages (
            id              TEXT PRIMARY KEY,
            conversation_id TEXT NOT NULL REFERENCES conversations(id),
            text            TEXT,
            image_url       TEXT,
            video_url       TEXT,
            msg_by_user_id  TEXT NOT NULL REFERENCES users(id),
            delivered       INTEGER NOT NULL DEFAULT 0,
            seen            INTEGER NOT NULL DEFAULT 0,
            created_at      TEXT NOT NULL
        );

        -- Append-only membership list; seq is the arrival order.
        CREATE TABLE IF NOT EXISTS conversation_messages (
            seq             INTEGER PRIMARY KEY AUTOINCREMENT,
            conversation_id TEXT NOT NULL REFERENCES conversations(id),
            message_id      TEXT NOT NULL UNIQUE REFERENCES messages(id)
        );

        CREATE INDEX IF NOT EXISTS idx_conversation_messages_conversation
            ON conversation_messages(conversation_id, seq);

        CREATE INDEX IF NOT EXISTS idx_messages_conversation_author
            ON messages(conversation_id, msg_by_user_id);
        ",
    )?;

    info!("Database migrations complete");
    Ok(())
}
