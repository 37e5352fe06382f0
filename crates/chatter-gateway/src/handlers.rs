use std::sync::Arc;

use argon2::{
    Argon2, PasswordHash, PasswordHasher, PasswordVerifier,
    password_hash::{SaltString, rand_core::OsRng},
};
use anyhow::anyhow;
use chrono::{DateTime, Utc};
use tracing::{error, info, warn};
use uuid::Uuid;

use chatter_db::Database;
use chatter_db::queries::SignupOutcome;
use chatter_types::events::{ClientEvent, ServerEvent};
use chatter_types::models::{ActiveSession, MessageKind, User};

use crate::avatar;
use crate::dispatcher::Dispatcher;
use crate::error::ChatError;

/// Route one inbound request to its handler and recover typed failures into
/// requester-only events. Nothing that happens here may take down the
/// connection or reach other clients as an error.
pub async fn dispatch(
    db: &Arc<Database>,
    dispatcher: &Dispatcher,
    conn_id: Uuid,
    event: ClientEvent,
) {
    let request = request_name(&event);

    let result = match event {
        ClientEvent::SignUp {
            name,
            email,
            password,
        } => sign_up(db, dispatcher, conn_id, name, email, password).await,
        ClientEvent::LogIn {
            identifier,
            password,
            room,
        } => log_in(db, dispatcher, conn_id, identifier, password, room).await,
        ClientEvent::ListUsers => list_users(db, dispatcher, conn_id).await,
        ClientEvent::ListChats => list_chats(db, dispatcher, conn_id).await,
        ClientEvent::AddActiveUser { name } => {
            add_active_user(db, dispatcher, conn_id, name).await
        }
        ClientEvent::RemoveActiveUser { name } => {
            remove_active_user(db, dispatcher, name).await
        }
        ClientEvent::PostMessage {
            author_id,
            content,
            kind,
            recipient,
            room,
            created_at,
        } => {
            post_message(
                db, dispatcher, conn_id, author_id, content, kind, recipient, room, created_at,
            )
            .await
        }
        ClientEvent::MemoMessage {
            author_id,
            content,
            created_at,
        } => {
            post_message(
                db,
                dispatcher,
                conn_id,
                author_id,
                content,
                MessageKind::Memo,
                None,
                None,
                created_at,
            )
            .await
        }
        ClientEvent::ChangeRoom { new_room, user_id } => {
            change_room(db, dispatcher, conn_id, new_room, user_id).await
        }
        ClientEvent::DeleteMessage { id } => delete_message(db, dispatcher, id).await,
    };

    match result {
        Ok(()) => {}
        Err(ChatError::DuplicateIdentity(existing)) => {
            dispatcher
                .send_to(conn_id, ServerEvent::SignupFailed { existing: *existing })
                .await;
        }
        Err(ChatError::InvalidCredentials) => {
            dispatcher.send_to(conn_id, ServerEvent::LoginFailed).await;
        }
        Err(ChatError::Store(e)) => {
            error!("{} failed in the store for connection {}: {:#}", request, conn_id, e);
            dispatcher
                .send_to(
                    conn_id,
                    ServerEvent::StoreError {
                        context: request.to_string(),
                    },
                )
                .await;
        }
    }
}

fn request_name(event: &ClientEvent) -> &'static str {
    match event {
        ClientEvent::SignUp { .. } => "SignUp",
        ClientEvent::LogIn { .. } => "LogIn",
        ClientEvent::ListUsers => "ListUsers",
        ClientEvent::ListChats => "ListChats",
        ClientEvent::AddActiveUser { .. } => "AddActiveUser",
        ClientEvent::RemoveActiveUser { .. } => "RemoveActiveUser",
        ClientEvent::PostMessage { .. } => "PostMessage",
        ClientEvent::MemoMessage { .. } => "MemoMessage",
        ClientEvent::ChangeRoom { .. } => "ChangeRoom",
        ClientEvent::DeleteMessage { .. } => "DeleteMessage",
    }
}

/// Run a store unit off the async runtime. The whole closure executes under
/// one database lock acquisition, so compound sequences stay serialized.
async fn run_store<T, F>(f: F) -> Result<T, ChatError>
where
    F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    T: Send + 'static,
{
    let joined = tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ChatError::Store(anyhow!("store task join error: {}", e)))?;
    joined.map_err(ChatError::Store)
}

async fn sign_up(
    db: &Arc<Database>,
    dispatcher: &Dispatcher,
    conn_id: Uuid,
    name: String,
    email: String,
    password: String,
) -> Result<(), ChatError> {
    let db = db.clone();
    let avatar_url = avatar::avatar_url(&email, avatar::SIGNUP_AVATAR_SIZE);
    let now = Utc::now().timestamp_millis();

    let outcome = run_store(move || {
        // Hash inside the store unit: the existence check and the insert
        // must not admit a concurrent duplicate in between.
        let salt = SaltString::generate(&mut OsRng);
        let hash = Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .map_err(|e| anyhow!("password hashing failed: {}", e))?
            .to_string();
        db.create_user_unique(&name, &email, &hash, &avatar_url, now)
    })
    .await?;

    match outcome {
        SignupOutcome::Created(row) => {
            let user = row.into_user();
            info!("{} (user {}) signed up", user.name, user.id);
            dispatcher
                .send_to(conn_id, ServerEvent::SignupOk { user })
                .await;
            Ok(())
        }
        SignupOutcome::Exists(row) => {
            Err(ChatError::DuplicateIdentity(Box::new(row.into_user())))
        }
    }
}

async fn log_in(
    db: &Arc<Database>,
    dispatcher: &Dispatcher,
    conn_id: Uuid,
    identifier: String,
    password: String,
    room: String,
) -> Result<(), ChatError> {
    let db = db.clone();
    let now = Utc::now().timestamp_millis();

    let outcome = run_store(move || {
        let row = match db.get_user_by_identifier(&identifier)? {
            Some(row) => row,
            None => return Ok(None),
        };

        let parsed = PasswordHash::new(&row.password)
            .map_err(|e| anyhow!("corrupt credential hash for user {}: {}", row.id, e))?;
        if Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_err()
        {
            return Ok(None);
        }

        // Room and last_login move in one combined update
        let refreshed = db
            .login_user(row.id, &room, now)?
            .ok_or_else(|| anyhow!("user {} vanished during login", row.id))?;
        let users: Vec<User> = db
            .list_users()?
            .into_iter()
            .map(|r| r.into_user())
            .collect();
        Ok(Some((refreshed.into_user(), users)))
    })
    .await?;

    let (user, users) = outcome.ok_or(ChatError::InvalidCredentials)?;

    info!("{} (user {}) logged in to room {:?}", user.name, user.id, user.room);
    dispatcher.bind_user(conn_id, &user.name).await;
    dispatcher
        .send_to(conn_id, ServerEvent::LoginOk { user })
        .await;
    // Other clients refresh their presence/room columns
    dispatcher
        .broadcast_except(conn_id, ServerEvent::UserList { users })
        .await;
    Ok(())
}

async fn list_users(
    db: &Arc<Database>,
    dispatcher: &Dispatcher,
    conn_id: Uuid,
) -> Result<(), ChatError> {
    let db = db.clone();
    let users: Vec<User> = run_store(move || {
        Ok(db.list_users()?.into_iter().map(|r| r.into_user()).collect())
    })
    .await?;
    dispatcher
        .send_to(conn_id, ServerEvent::UserList { users })
        .await;
    Ok(())
}

async fn list_chats(
    db: &Arc<Database>,
    dispatcher: &Dispatcher,
    conn_id: Uuid,
) -> Result<(), ChatError> {
    let db = db.clone();
    let messages = run_store(move || {
        Ok(db
            .list_messages()?
            .into_iter()
            .map(|r| r.into_message())
            .collect())
    })
    .await?;
    dispatcher
        .send_to(conn_id, ServerEvent::ChatLog { messages })
        .await;
    Ok(())
}

async fn add_active_user(
    db: &Arc<Database>,
    dispatcher: &Dispatcher,
    conn_id: Uuid,
    name: String,
) -> Result<(), ChatError> {
    let db = db.clone();
    let session = ActiveSession {
        user_name: name.clone(),
        connection_id: conn_id,
    };
    let names = run_store(move || db.add_session(&session)).await?;

    dispatcher.bind_user(conn_id, &name).await;
    dispatcher
        .broadcast(ServerEvent::OnlineUsers { names })
        .await;
    Ok(())
}

async fn remove_active_user(
    db: &Arc<Database>,
    dispatcher: &Dispatcher,
    name: String,
) -> Result<(), ChatError> {
    let db = db.clone();
    let session_name = name.clone();
    let names = run_store(move || db.remove_sessions_for_user(&session_name)).await?;

    // The sessions are gone, so the bindings must go too: a logged-out
    // connection no longer receives DM legs addressed to that name.
    dispatcher.unbind_user(&name).await;
    dispatcher
        .broadcast(ServerEvent::OnlineUsers { names })
        .await;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn post_message(
    db: &Arc<Database>,
    dispatcher: &Dispatcher,
    conn_id: Uuid,
    author_id: i64,
    content: String,
    kind: MessageKind,
    recipient: Option<String>,
    room: Option<String>,
    created_at: DateTime<Utc>,
) -> Result<(), ChatError> {
    // Kind-specific field validation happens here, at construction, not in
    // the store layer.
    let recipient = match (kind, recipient) {
        (MessageKind::DmSend | MessageKind::DmReceive, Some(r)) => Some(r),
        (MessageKind::DmSend | MessageKind::DmReceive, None) => {
            warn!("direct message from user {} without a recipient, dropped", author_id);
            return Ok(());
        }
        (_, Some(r)) => {
            warn!("recipient '{}' on a {} message ignored", r, kind.as_str());
            None
        }
        (_, None) => None,
    };

    let db = db.clone();
    let millis = created_at.timestamp_millis();
    let (row, author_name) = run_store(move || {
        let author = db
            .get_user_by_id(author_id)?
            .ok_or_else(|| anyhow!("unknown author {}", author_id))?;
        let row = db.insert_message(
            author_id,
            &content,
            kind.as_str(),
            recipient.as_deref(),
            room.as_deref(),
            millis,
        )?;
        Ok((row, author.name))
    })
    .await?;

    let message = row.into_message();
    match (message.kind, message.recipient.clone()) {
        // Private note: never leaves the author's own connections
        (MessageKind::Memo, _) => {
            dispatcher
                .send_to_author(conn_id, &author_name, ServerEvent::MessageCreated { message })
                .await;
        }
        // One stored row, two delivery legs with different tags
        (_, Some(recipient_name)) => {
            dispatcher
                .send_to_author(
                    conn_id,
                    &author_name,
                    ServerEvent::MessageCreated {
                        message: message.with_kind(MessageKind::DmSend),
                    },
                )
                .await;
            dispatcher
                .send_to_user(
                    &recipient_name,
                    ServerEvent::MessageCreated {
                        message: message.with_kind(MessageKind::DmReceive),
                    },
                )
                .await;
        }
        // Chat and room log entries go to everyone; rooms are presence
        // metadata, not a broadcast filter (global-chat policy).
        _ => {
            dispatcher
                .broadcast(ServerEvent::MessageCreated { message })
                .await;
        }
    }
    Ok(())
}

async fn change_room(
    db: &Arc<Database>,
    dispatcher: &Dispatcher,
    conn_id: Uuid,
    new_room: String,
    user_id: i64,
) -> Result<(), ChatError> {
    let db = db.clone();
    let row = run_store(move || db.update_room(user_id, &new_room)).await?;

    match row {
        Some(row) => {
            dispatcher
                .send_to(conn_id, ServerEvent::RoomChanged { user: row.into_user() })
                .await;
        }
        None => warn!("room change for unknown user {}", user_id),
    }
    Ok(())
}

async fn delete_message(
    db: &Arc<Database>,
    dispatcher: &Dispatcher,
    id: i64,
) -> Result<(), ChatError> {
    let db = db.clone();
    run_store(move || db.delete_message(id)).await?;

    // Broadcast even when the row was already gone, so clients that raced on
    // the delete still converge on absence.
    dispatcher
        .broadcast(ServerEvent::MessageDeleted { id })
        .await;
    Ok(())
}
