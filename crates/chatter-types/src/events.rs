use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{ChatMessage, MessageKind, User};

/// Requests sent FROM client TO server over the WebSocket. The enum is the
/// dispatch table: every request kind and its payload shape is closed here,
/// so a malformed or reordered payload fails at deserialization instead of
/// reaching a handler.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ClientEvent {
    /// Register a new user. Name and email must both be unused.
    SignUp {
        name: String,
        email: String,
        password: String,
    },

    /// Authenticate. `identifier` matches name OR email.
    LogIn {
        identifier: String,
        password: String,
        room: String,
    },

    /// Full user snapshot (admin/debug view).
    ListUsers,

    /// Full ordered chat snapshot — the resync mechanism after (re)connect.
    ListChats,

    /// Register presence for this connection. The connection identity is the
    /// server-assigned id of the connection the event arrived on; a
    /// client-supplied copy is never trusted.
    AddActiveUser { name: String },

    /// Drop presence for every connection held by `name` (logout across tabs).
    RemoveActiveUser { name: String },

    /// Post a message to the chat log.
    PostMessage {
        author_id: i64,
        content: String,
        kind: MessageKind,
        #[serde(default)]
        recipient: Option<String>,
        #[serde(default)]
        room: Option<String>,
        #[serde(with = "chrono::serde::ts_milliseconds")]
        created_at: DateTime<Utc>,
    },

    /// Post a private note, visible to the author only.
    MemoMessage {
        author_id: i64,
        content: String,
        #[serde(with = "chrono::serde::ts_milliseconds")]
        created_at: DateTime<Utc>,
    },

    /// Move a user to another room. Pure field update, no cross-table effect.
    ChangeRoom { new_room: String, user_id: i64 },

    /// Delete a message by id. Idempotent — deleting an absent id succeeds.
    DeleteMessage { id: i64 },
}

/// Events sent FROM server TO client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ServerEvent {
    /// Signup succeeded; the stored record, requester only.
    SignupOk { user: User },

    /// Signup conflict; carries the already-registered record, requester only.
    /// Known enumeration leak, preserved from the original behavior.
    SignupFailed { existing: User },

    /// Login succeeded; the refreshed record, requester only.
    LoginOk { user: User },

    /// Login failed. Deliberately content-free: never says which field was wrong.
    LoginFailed,

    /// Full user snapshot. Reply to ListUsers, and pushed to all other
    /// connections after a successful login.
    UserList { users: Vec<User> },

    /// Full chat snapshot ordered by (created_at, id), requester only.
    ChatLog { messages: Vec<ChatMessage> },

    /// Distinct names of users with at least one live session, to all.
    OnlineUsers { names: Vec<String> },

    /// A message was persisted. Scope depends on the kind.
    MessageCreated { message: ChatMessage },

    /// A message is gone. Broadcast to all, even if the row was already absent,
    /// so racing deleters converge.
    MessageDeleted { id: i64 },

    /// Echo of a room change, requester only.
    RoomChanged { user: User },

    /// The store failed while handling the request. Requester only.
    StoreError { context: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_event_wire_shape() {
        let json = r#"{"type":"SignUp","data":{"name":"alice","email":"a@x.com","password":"pw"}}"#;
        let ev: ClientEvent = serde_json::from_str(json).unwrap();
        match ev {
            ClientEvent::SignUp { name, email, .. } => {
                assert_eq!(name, "alice");
                assert_eq!(email, "a@x.com");
            }
            other => panic!("wrong variant: {:?}", other),
        }

        // Unit variants need no data field
        let ev: ClientEvent = serde_json::from_str(r#"{"type":"ListChats"}"#).unwrap();
        assert!(matches!(ev, ClientEvent::ListChats));
    }

    #[test]
    fn test_post_message_optional_fields_default() {
        let json = r#"{"type":"PostMessage","data":{"author_id":1,"content":"hi","kind":"chat","created_at":1700000000000}}"#;
        let ev: ClientEvent = serde_json::from_str(json).unwrap();
        match ev {
            ClientEvent::PostMessage {
                kind, recipient, room, ..
            } => {
                assert_eq!(kind, MessageKind::Chat);
                assert!(recipient.is_none());
                assert!(room.is_none());
            }
            other => panic!("wrong variant: {:?}", other),
        }
    }

    #[test]
    fn test_message_kind_strings() {
        assert_eq!(
            serde_json::to_string(&MessageKind::DmReceive).unwrap(),
            "\"dmReceive\""
        );
        assert_eq!(MessageKind::parse("enteredLog"), Some(MessageKind::EnteredLog));
        assert_eq!(MessageKind::parse("broadcast"), None);
        for kind in [
            MessageKind::Chat,
            MessageKind::Memo,
            MessageKind::EnteredLog,
            MessageKind::LeftLog,
            MessageKind::DmReceive,
            MessageKind::DmSend,
        ] {
            assert_eq!(MessageKind::parse(kind.as_str()), Some(kind));
        }
    }

    #[test]
    fn test_login_failed_is_content_free() {
        let json = serde_json::to_string(&ServerEvent::LoginFailed).unwrap();
        assert_eq!(json, r#"{"type":"LoginFailed"}"#);
    }
}
