use crate::Database;
use crate::models::{ConversationRow, MessageRow, NewMessageRow, UserRow, timestamp};
use anyhow::{Result, anyhow};
use chrono::{SubsecRound, Utc};
use rusqlite::{Connection, Row};
use tracing::warn;
use uuid::Uuid;

use tandem_types::models::{Conversation, ConversationSummary, Message, UserProfile};

const USER_COLUMNS: &str = "id, name, email, password, profile_pic, created_at";
const CONVERSATION_COLUMNS: &str = "id, sender_id, receiver_id, created_at, updated_at";
const MESSAGE_COLUMNS: &str = "m.id, m.conversation_id, m.text, m.image_url, m.video_url, \
     m.msg_by_user_id, m.delivered, m.seen, m.created_at";

/// Order-independent key of a participant pair.
pub fn canonical_pair(a: Uuid, b: Uuid) -> (String, String) {
    let (a, b) = (a.to_string(), b.to_string());
    if a <= b { (a, b) } else { (b, a) }
}

impl Database {
    // -- Users --

    /// Insert a user unless the email is already registered. Returns `false`
    /// when another account holds the email, including one inserted by a
    /// concurrent registration.
    pub fn create_user(
        &self,
        id: Uuid,
        name: &str,
        email: &str,
        password_hash: &str,
        profile_pic: Option<&str>,
    ) -> Result<bool> {
        self.with_conn(|conn| {
            let inserted = conn.execute(
                "INSERT INTO users (id, name, email, password, profile_pic, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(email) DO NOTHING",
                rusqlite::params![
                    id.to_string(),
                    name,
                    email,
                    password_hash,
                    profile_pic,
                    timestamp(Utc::now())
                ],
            )?;
            Ok(inserted == 1)
        })
    }

    pub fn get_user_by_email(&self, email: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| {
            let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE email = ?1");
            conn.query_row(&sql, [email], user_row).optional()
        })
    }

    pub fn get_profile(&self, id: Uuid) -> Result<Option<UserProfile>> {
        self.with_conn(|conn| query_profile(conn, &id.to_string()))
    }

    // -- Conversations --

    /// Look up the conversation of an unordered pair without creating it.
    pub fn find_conversation(&self, a: Uuid, b: Uuid) -> Result<Option<Conversation>> {
        let (low, high) = canonical_pair(a, b);
        self.with_conn(|conn| query_conversation_by_pair(conn, &low, &high))
    }

    /// Find-or-create in one statement: the unique (user_low, user_high)
    /// constraint turns a racing second insert into a no-op, and both callers
    /// read back the same row. `a` becomes the sender of record on creation.
    pub fn upsert_conversation(&self, a: Uuid, b: Uuid) -> Result<Conversation> {
        let (low, high) = canonical_pair(a, b);
        self.with_conn(|conn| {
            let now = timestamp(Utc::now());
            conn.execute(
                "INSERT INTO conversations
                    (id, sender_id, receiver_id, user_low, user_high, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
                 ON CONFLICT(user_low, user_high) DO NOTHING",
                rusqlite::params![
                    Uuid::new_v4().to_string(),
                    a.to_string(),
                    b.to_string(),
                    low,
                    high,
                    now
                ],
            )?;

            query_conversation_by_pair(conn, &low, &high)?
                .ok_or_else(|| anyhow!("Conversation vanished after upsert: {} / {}", low, high))
        })
    }

    pub fn count_conversations(&self) -> Result<u64> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row("SELECT COUNT(*) FROM conversations", [], |row| row.get(0))?;
            Ok(count as u64)
        })
    }

    // -- Messages --

    /// Persist a message and append it to the conversation in one transaction.
    pub fn append_message(&self, conversation_id: Uuid, msg: NewMessageRow<'_>) -> Result<Message> {
        // Truncated to what the column stores, so the returned message equals
        // the one read back later.
        let created_at = Utc::now().trunc_subsecs(6);

        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let cid = conversation_id.to_string();
            let mid = msg.id.to_string();
            let stamp = timestamp(created_at);

            tx.execute(
                "INSERT INTO messages
                    (id, conversation_id, text, image_url, video_url, msg_by_user_id, delivered, seen, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, 0, ?7)",
                rusqlite::params![
                    mid,
                    cid,
                    msg.text,
                    msg.image_url,
                    msg.video_url,
                    msg.msg_by_user_id.to_string(),
                    stamp
                ],
            )?;
            tx.execute(
                "INSERT INTO conversation_messages (conversation_id, message_id) VALUES (?1, ?2)",
                (&cid, &mid),
            )?;
            tx.execute(
                "UPDATE conversations SET updated_at = ?2 WHERE id = ?1",
                (&cid, &stamp),
            )?;
            tx.commit()?;
            Ok(())
        })?;

        Ok(Message {
            id: msg.id,
            conversation_id,
            text: msg.text.map(str::to_string),
            image_url: msg.image_url.map(str::to_string),
            video_url: msg.video_url.map(str::to_string),
            msg_by_user_id: msg.msg_by_user_id,
            delivered: false,
            seen: false,
            created_at,
        })
    }

    /// All messages of a conversation in arrival order.
    pub fn conversation_messages(&self, conversation_id: Uuid) -> Result<Vec<Message>> {
        self.with_conn(|conn| query_conversation_messages(conn, &conversation_id.to_string()))
    }

    /// Batch-set `seen` on every message of `author` in the conversation.
    /// Returns how many rows flipped; already-seen rows are left untouched.
    pub fn mark_seen(&self, conversation_id: Uuid, author: Uuid) -> Result<usize> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE messages SET seen = 1
                 WHERE seen = 0
                   AND msg_by_user_id = ?2
                   AND id IN (SELECT message_id FROM conversation_messages WHERE conversation_id = ?1)",
                (conversation_id.to_string(), author.to_string()),
            )?;
            Ok(changed)
        })
    }

    // -- Sidebar --

    /// Conversations of `user_id` that hold at least one message, most
    /// recently active first.
    pub fn conversation_summaries(&self, user_id: Uuid) -> Result<Vec<ConversationSummary>> {
        let uid = user_id.to_string();

        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {CONVERSATION_COLUMNS} FROM conversations c
                 WHERE (c.sender_id = ?1 OR c.receiver_id = ?1)
                   AND EXISTS (SELECT 1 FROM conversation_messages cm WHERE cm.conversation_id = c.id)
                 ORDER BY c.updated_at DESC"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map([&uid], conversation_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            let mut summaries = Vec::with_capacity(rows.len());
            for row in rows {
                let cid = row.id.clone();
                let conversation = Conversation::from(row);
                let peer_id = conversation.peer_of(user_id);

                let Some(peer) = query_profile(conn, &peer_id.to_string())? else {
                    warn!("Conversation {} references unknown user {}", cid, peer_id);
                    continue;
                };

                let last_sql = format!(
                    "SELECT {MESSAGE_COLUMNS} FROM conversation_messages cm
                     JOIN messages m ON m.id = cm.message_id
                     WHERE cm.conversation_id = ?1
                     ORDER BY cm.seq DESC
                     LIMIT 1"
                );
                let last_message = conn
                    .query_row(&last_sql, [&cid], message_row)
                    .optional()?
                    .map(Message::from);

                let unseen_count: u32 = conn.query_row(
                    "SELECT COUNT(*) FROM conversation_messages cm
                     JOIN messages m ON m.id = cm.message_id
                     WHERE cm.conversation_id = ?1 AND m.msg_by_user_id = ?2 AND m.seen = 0",
                    (&cid, peer_id.to_string()),
                    |row| row.get(0),
                )?;

                summaries.push(ConversationSummary {
                    id: conversation.id,
                    peer,
                    last_message,
                    unseen_count,
                });
            }

            Ok(summaries)
        })
    }
}

fn user_row(row: &Row<'_>) -> rusqlite::Result<UserRow> {
    Ok(UserRow {
        id: row.get(0)?,
        name: row.get(1)?,
        email: row.get(2)?,
        password: row.get(3)?,
        profile_pic: row.get(4)?,
        created_at: row.get(5)?,
    })
}

fn conversation_row(row: &Row<'_>) -> rusqlite::Result<ConversationRow> {
    Ok(ConversationRow {
        id: row.get(0)?,
        sender_id: row.get(1)?,
        receiver_id: row.get(2)?,
        created_at: row.get(3)?,
        updated_at: row.get(4)?,
    })
}

fn message_row(row: &Row<'_>) -> rusqlite::Result<MessageRow> {
    Ok(MessageRow {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        text: row.get(2)?,
        image_url: row.get(3)?,
        video_url: row.get(4)?,
        msg_by_user_id: row.get(5)?,
        delivered: row.get(6)?,
        seen: row.get(7)?,
        created_at: row.get(8)?,
    })
}

fn query_profile(conn: &Connection, id: &str) -> Result<Option<UserProfile>> {
    let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1");
    let row = conn.query_row(&sql, [id], user_row).optional()?;
    Ok(row.map(UserProfile::from))
}

fn query_conversation_by_pair(conn: &Connection, low: &str, high: &str) -> Result<Option<Conversation>> {
    let sql = format!("SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE user_low = ?1 AND user_high = ?2");
    let row = conn.query_row(&sql, [low, high], conversation_row).optional()?;
    Ok(row.map(Conversation::from))
}

fn query_conversation_messages(conn: &Connection, conversation_id: &str) -> Result<Vec<Message>> {
    let sql = format!(
        "SELECT {MESSAGE_COLUMNS} FROM conversation_messages cm
         JOIN messages m ON m.id = cm.message_id
         WHERE cm.conversation_id = ?1
         ORDER BY cm.seq ASC"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([conversation_id], message_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(rows.into_iter().map(Message::from).collect())
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
