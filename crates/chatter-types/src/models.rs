use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A registered user as seen on the wire. The credential hash lives only in
/// the `users` table and is never part of this model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub name: String,
    pub email: String,
    /// Current room, meaningful only while the user has a live session.
    pub room: Option<String>,
    /// Assigned once at signup, immutable afterwards.
    pub avatar_url: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub last_login: DateTime<Utc>,
}

/// Closed set of message kinds. The kind decides the broadcast scope, so it
/// is validated at construction rather than at the store layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MessageKind {
    Chat,
    Memo,
    EnteredLog,
    LeftLog,
    DmReceive,
    DmSend,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Chat => "chat",
            Self::Memo => "memo",
            Self::EnteredLog => "enteredLog",
            Self::LeftLog => "leftLog",
            Self::DmReceive => "dmReceive",
            Self::DmSend => "dmSend",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "chat" => Some(Self::Chat),
            "memo" => Some(Self::Memo),
            "enteredLog" => Some(Self::EnteredLog),
            "leftLog" => Some(Self::LeftLog),
            "dmReceive" => Some(Self::DmReceive),
            "dmSend" => Some(Self::DmSend),
            _ => None,
        }
    }
}

/// One row of the chat log. `id` is assigned by the store at insertion and
/// breaks ties between messages with equal `created_at`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: i64,
    pub author_id: i64,
    pub content: String,
    pub kind: MessageKind,
    /// Target user name, present only for direct messages.
    pub recipient: Option<String>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    pub room: Option<String>,
}

impl ChatMessage {
    /// Same message re-tagged for one delivery leg of a DM. A single row is
    /// stored; the author sees `dmSend`, the recipient sees `dmReceive`.
    pub fn with_kind(&self, kind: MessageKind) -> Self {
        Self { kind, ..self.clone() }
    }
}

/// Ephemeral binding of a live connection to a user name. Owned by the
/// connection manager; never outlives the connection it represents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveSession {
    pub user_name: String,
    pub connection_id: Uuid,
}
