//! Protocol-level error types.

use thiserror::Error;

/// Why a single frame failed to parse.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MessageParseError {
    #[error("empty message")]
    EmptyMessage,
    #[error("missing command")]
    MissingCommand,
    #[error("invalid command token")]
    InvalidCommand,
}

/// Stream-level protocol violations. These are fatal for the connection,
/// unlike a single malformed frame which is dropped.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// More than [`crate::MAX_LINE_BUFFER`] bytes accumulated without a LF.
    #[error("line exceeds {limit} bytes without a newline ({actual} buffered)")]
    LineTooLong { actual: usize, limit: usize },

    /// The non-tag portion of a line exceeds [`crate::MAX_MESSAGE_BODY`].
    #[error("message body exceeds {limit} bytes ({actual})")]
    BodyTooLong { actual: usize, limit: usize },

    /// The peer sent bytes that are not valid UTF-8.
    #[error("invalid utf-8 in message")]
    InvalidUtf8,
}
