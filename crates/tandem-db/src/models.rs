//! Database row types — these map directly to SQLite rows.
//! Conversion into tandem-types models happens here so corrupt rows are
//! logged in one place.

use chrono::{DateTime, SecondsFormat, Utc};
use tracing::warn;
use uuid::Uuid;

use tandem_types::models::{Conversation, Message, UserProfile};

pub struct UserRow {
    pub id: String,
    pub name: String,
    pub email: String,
    pub password: String,
    pub profile_pic: Option<String>,
    pub created_at: String,
}

pub struct ConversationRow {
    pub id: String,
    pub sender_id: String,
    pub receiver_id: String,
    pub created_at: String,
    pub updated_at: String,
}

pub struct MessageRow {
    pub id: String,
    pub conversation_id: String,
    pub text: Option<String>,
    pub image_url: Option<String>,
    pub video_url: Option<String>,
    pub msg_by_user_id: String,
    pub delivered: bool,
    pub seen: bool,
    pub created_at: String,
}

/// Fields of a message about to be written. Flags always start false.
pub struct NewMessageRow<'a> {
    pub id: Uuid,
    pub text: Option<&'a str>,
    pub image_url: Option<&'a str>,
    pub video_url: Option<&'a str>,
    pub msg_by_user_id: Uuid,
}

/// Fixed-width RFC 3339 so that TEXT ordering matches time ordering.
pub fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_uuid(value: &str, field: &str, row_id: &str) -> Uuid {
    value.parse().unwrap_or_else(|e| {
        warn!("Corrupt {} '{}' on row '{}': {}", field, value, row_id, e);
        Uuid::default()
    })
}

fn parse_time(value: &str, row_id: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .or_else(|_| {
            // Rows written by hand with datetime('now') carry no timezone.
            chrono::NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S").map(|ndt| ndt.and_utc())
        })
        .unwrap_or_else(|e| {
            warn!("Corrupt timestamp '{}' on row '{}': {}", value, row_id, e);
            DateTime::default()
        })
}

impl From<UserRow> for UserProfile {
    fn from(row: UserRow) -> Self {
        Self {
            id: parse_uuid(&row.id, "id", &row.id),
            name: row.name,
            email: row.email,
            profile_pic: row.profile_pic,
        }
    }
}

impl From<ConversationRow> for Conversation {
    fn from(row: ConversationRow) -> Self {
        Self {
            id: parse_uuid(&row.id, "id", &row.id),
            sender_id: parse_uuid(&row.sender_id, "sender_id", &row.id),
            receiver_id: parse_uuid(&row.receiver_id, "receiver_id", &row.id),
            created_at: parse_time(&row.created_at, &row.id),
            updated_at: parse_time(&row.updated_at, &row.id),
        }
    }
}

impl From<MessageRow> for Message {
    fn from(row: MessageRow) -> Self {
        Self {
            id: parse_uuid(&row.id, "id", &row.id),
            conversation_id: parse_uuid(&row.conversation_id, "conversation_id", &row.id),
            text: row.text,
            image_url: row.image_url,
            video_url: row.video_url,
            msg_by_user_id: parse_uuid(&row.msg_by_user_id, "msg_by_user_id", &row.id),
            delivered: row.delivered,
            seen: row.seen,
            created_at: parse_time(&row.created_at, &row.id),
        }
    }
}
