//! chatter-proto - IRC line protocol library for chatterd.
//!
//! Parses and serialises single IRC frames: an optional `@tags` block, an
//! optional `:source` prefix, a command, middle parameters and an optional
//! trailing parameter. The same byte format travels over raw TCP (one line
//! per CRLF) and WebSocket (one line per text frame).

pub mod casemap;
pub mod error;
pub mod message;
pub mod numeric;
pub mod parser;
pub mod prefix;
pub mod tags;
pub mod validate;

#[cfg(feature = "tokio")]
pub mod codec;
#[cfg(feature = "tokio")]
pub mod transport;

pub use casemap::{irc_eq, irc_to_lower};
pub use error::{MessageParseError, ProtocolError};
pub use message::{Message, MessageRef, Tag};
pub use numeric::Numeric;
pub use prefix::Prefix;
pub use tags::{build_tag_block, escape_tag_value, unescape_tag_value, MAX_TAG_BLOCK};
pub use validate::{is_valid_channel_name, is_valid_nick, NICK_MAX_DEFAULT};

#[cfg(feature = "tokio")]
pub use codec::LineCodec;
#[cfg(feature = "tokio")]
pub use transport::{Transport, TransportError};

/// Hard cap on a buffered line waiting for its LF. Exceeding it is fatal
/// for the connection.
pub const MAX_LINE_BUFFER: usize = 1024;

/// Cap on the non-tag portion of a single line.
pub const MAX_MESSAGE_BODY: usize = 512;
