pub mod avatar;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod handlers;
