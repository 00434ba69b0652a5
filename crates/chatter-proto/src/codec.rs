//! Line-oriented codec for raw TCP transports.
//!
//! One IRC frame per CRLF. Enforces the stream limits: a connection that
//! buffers more than [`crate::MAX_LINE_BUFFER`] bytes without a newline, or
//! sends a non-tag body over [`crate::MAX_MESSAGE_BODY`] bytes, is hung up.

use bytes::{BufMut, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

use crate::error::ProtocolError;
use crate::message::Message;
use crate::{MAX_LINE_BUFFER, MAX_MESSAGE_BODY};

/// Codec errors: I/O from the socket or a protocol violation.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Validate a decoded line against the stream limits.
pub fn check_line(line: &str) -> Result<(), ProtocolError> {
    if line.len() > MAX_LINE_BUFFER {
        return Err(ProtocolError::LineTooLong {
            actual: line.len(),
            limit: MAX_LINE_BUFFER,
        });
    }

    // The tag block has its own budget; everything after it counts against
    // the 512-byte body.
    let body = match line.strip_prefix('@') {
        Some(rest) => rest.split_once(' ').map_or("", |(_, b)| b),
        None => line,
    };
    if body.len() > MAX_MESSAGE_BODY {
        return Err(ProtocolError::BodyTooLong {
            actual: body.len(),
            limit: MAX_MESSAGE_BODY,
        });
    }
    Ok(())
}

/// Splits the byte stream into CRLF (or bare LF) terminated lines.
#[derive(Debug, Default)]
pub struct LineCodec {
    scan_from: usize,
}

impl Decoder for LineCodec {
    type Item = String;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<String>, CodecError> {
        let newline = src[self.scan_from..]
            .iter()
            .position(|&b| b == b'\n')
            .map(|p| p + self.scan_from);

        let Some(newline) = newline else {
            if src.len() > MAX_LINE_BUFFER {
                return Err(ProtocolError::LineTooLong {
                    actual: src.len(),
                    limit: MAX_LINE_BUFFER,
                }
                .into());
            }
            self.scan_from = src.len();
            return Ok(None);
        };

        let mut line = src.split_to(newline + 1);
        self.scan_from = 0;
        line.truncate(newline);
        if line.last() == Some(&b'\r') {
            line.truncate(line.len() - 1);
        }

        let line = std::str::from_utf8(&line)
            .map_err(|_| ProtocolError::InvalidUtf8)?
            .to_string();
        check_line(&line)?;
        Ok(Some(line))
    }
}

impl<'a> Encoder<&'a Message> for LineCodec {
    type Error = CodecError;

    fn encode(&mut self, msg: &'a Message, dst: &mut BytesMut) -> Result<(), CodecError> {
        let line = msg.to_string();
        dst.reserve(line.len() + 2);
        dst.put_slice(line.as_bytes());
        dst.put_slice(b"\r\n");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(codec: &mut LineCodec, buf: &mut BytesMut) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(Some(line)) = codec.decode(buf) {
            out.push(line);
        }
        out
    }

    #[test]
    fn splits_crlf_lines() {
        let mut codec = LineCodec::default();
        let mut buf = BytesMut::from("NICK alice\r\nUSER alice 0 * :A\r\n");
        assert_eq!(
            decode_all(&mut codec, &mut buf),
            vec!["NICK alice", "USER alice 0 * :A"]
        );
    }

    #[test]
    fn accepts_bare_lf() {
        let mut codec = LineCodec::default();
        let mut buf = BytesMut::from("PING :x\n");
        assert_eq!(decode_all(&mut codec, &mut buf), vec!["PING :x"]);
    }

    #[test]
    fn partial_line_waits() {
        let mut codec = LineCodec::default();
        let mut buf = BytesMut::from("PRIVMSG #c :par");
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b"tial\r\n");
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), "PRIVMSG #c :partial");
    }

    #[test]
    fn over_long_buffer_is_fatal() {
        let mut codec = LineCodec::default();
        let mut buf = BytesMut::from(vec![b'x'; MAX_LINE_BUFFER + 1].as_slice());
        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(
            err,
            CodecError::Protocol(ProtocolError::LineTooLong { .. })
        ));
    }

    #[test]
    fn over_long_body_is_fatal() {
        let body = format!("PRIVMSG #c :{}", "y".repeat(MAX_MESSAGE_BODY));
        let mut codec = LineCodec::default();
        let mut buf = BytesMut::from(format!("{body}\r\n").as_str());
        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(
            err,
            CodecError::Protocol(ProtocolError::BodyTooLong { .. })
        ));
    }

    #[test]
    fn tag_block_not_counted_against_body() {
        let line = format!("@{} PRIVMSG #c :ok", "t=".to_string() + &"v".repeat(400));
        assert!(check_line(&line).is_ok());
    }

    #[test]
    fn encodes_with_crlf() {
        let mut codec = LineCodec::default();
        let mut buf = BytesMut::new();
        let msg = Message::cmd("PING").trailing("tok");
        codec.encode(&msg, &mut buf).unwrap();
        assert_eq!(&buf[..], b"PING :tok\r\n");
    }
}
