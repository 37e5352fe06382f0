use thiserror::Error;

use chatter_types::models::User;

/// Typed failure kinds for request handling. The first two recover into
/// failure events delivered to the requester only; `Store` is logged and
/// reported to the requester, and none of them ever terminate a connection.
#[derive(Debug, Error)]
pub enum ChatError {
    /// Signup conflict; carries the committed row that won.
    #[error("name or email already registered")]
    DuplicateIdentity(Box<User>),

    /// Login failure. Deliberately carries nothing: the requester must not
    /// learn which field was wrong.
    #[error("invalid credentials")]
    InvalidCredentials,

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}
