//! Database row types — these map directly to SQLite rows. Distinct from the
//! chatter-types wire models so the credential hash never leaks onto the wire.

use chrono::{DateTime, Utc};
use tracing::warn;

use chatter_types::models::{ChatMessage, MessageKind, User};

pub struct UserRow {
    pub id: i64,
    pub name: String,
    pub email: String,
    pub password: String,
    pub room: Option<String>,
    pub avatar_url: String,
    pub last_login: i64,
}

pub struct MessageRow {
    pub id: i64,
    pub author_id: i64,
    pub content: String,
    pub kind: String,
    pub recipient: Option<String>,
    pub created_at: i64,
    pub room: Option<String>,
}

fn millis_to_utc(millis: i64, what: &str, id: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(millis).unwrap_or_else(|| {
        warn!("Corrupt {} timestamp {} on row {}", what, millis, id);
        DateTime::<Utc>::default()
    })
}

impl UserRow {
    /// Wire model, credential hash dropped.
    pub fn into_user(self) -> User {
        let last_login = millis_to_utc(self.last_login, "last_login", self.id);
        User {
            id: self.id,
            name: self.name,
            email: self.email,
            room: self.room,
            avatar_url: self.avatar_url,
            last_login,
        }
    }
}

impl MessageRow {
    pub fn into_message(self) -> ChatMessage {
        let kind = MessageKind::parse(&self.kind).unwrap_or_else(|| {
            warn!("Corrupt message kind '{}' on row {}", self.kind, self.id);
            MessageKind::Chat
        });
        let created_at = millis_to_utc(self.created_at, "created_at", self.id);
        ChatMessage {
            id: self.id,
            author_id: self.author_id,
            content: self.content,
            kind,
            recipient: self.recipient,
            created_at,
            room: self.room,
        }
    }
}
