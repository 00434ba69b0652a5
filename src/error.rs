//! Error types shared across the daemon.

use chatter_proto::Message;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Errors surfaced by command handlers.
///
/// Most protocol errors are answered with a numeric by the handler itself;
/// these variants carry the cases the connection loop must act on.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Mapped to 461 by the dispatcher, with the command name filled in.
    #[error("not enough parameters")]
    NeedMoreParams,

    /// A registered-only command arrived before finalisation (451).
    #[error("not registered")]
    NotRegistered,

    /// Disconnect the client; any error numeric has already been sent.
    #[error("access denied")]
    AccessDenied,

    /// The client asked to leave.
    #[error("client quit: {0:?}")]
    Quit(Option<String>),

    #[error("send error: {0}")]
    Send(#[from] mpsc::error::SendError<Arc<Message>>),

    /// Invariant violation. Aborts the operation, never reaches the peer.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Result type for command handlers.
pub type HandlerResult = Result<(), HandlerError>;

/// Registry operation failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("nickname is bound to another account")]
    NickInUse,

    #[error("no such channel")]
    NoSuchChannel,

    #[error("channel name is taken")]
    ChannelNameInUse,

    #[error("cannot merge a named account")]
    MergeSourceNamed,
}
