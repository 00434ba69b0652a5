//! Framed transports: raw TCP and WebSocket behind one interface.
//!
//! Both carry one IRC line per unit - a CRLF-terminated line on TCP, a text
//! (or binary) frame on WebSocket. CRLF is retained on WebSocket writes for
//! symmetry and stripped on reads.

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message as WsFrame;
use tokio_tungstenite::WebSocketStream;
use tokio_util::codec::Framed;

use crate::codec::{check_line, CodecError, LineCodec};
use crate::error::ProtocolError;
use crate::message::Message;

/// Transport-level failures.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("websocket error: {0}")]
    Ws(#[from] tokio_tungstenite::tungstenite::Error),
}

impl From<CodecError> for TransportError {
    fn from(e: CodecError) -> Self {
        match e {
            CodecError::Io(e) => TransportError::Io(e),
            CodecError::Protocol(e) => TransportError::Protocol(e),
        }
    }
}

impl TransportError {
    /// Protocol violations hang up the peer; plain I/O errors just end the
    /// connection quietly.
    pub fn is_protocol(&self) -> bool {
        matches!(self, TransportError::Protocol(_))
    }
}

/// A connected peer, whichever listener it arrived on.
pub enum Transport {
    Tcp(Framed<TcpStream, LineCodec>),
    Ws(Box<WebSocketStream<TcpStream>>),
}

impl Transport {
    pub fn tcp(stream: TcpStream) -> Self {
        Transport::Tcp(Framed::new(stream, LineCodec::default()))
    }

    pub fn websocket(stream: WebSocketStream<TcpStream>) -> Self {
        Transport::Ws(Box::new(stream))
    }

    /// Read the next non-empty line. `None` means the peer is gone.
    pub async fn next_line(&mut self) -> Option<Result<String, TransportError>> {
        loop {
            match self {
                Transport::Tcp(framed) => match framed.next().await? {
                    Ok(line) if line.trim().is_empty() => continue,
                    Ok(line) => return Some(Ok(line)),
                    Err(e) => return Some(Err(e.into())),
                },
                Transport::Ws(ws) => {
                    let frame = match ws.next().await? {
                        Ok(f) => f,
                        Err(e) => return Some(Err(e.into())),
                    };
                    let text = match frame {
                        WsFrame::Text(t) => t,
                        WsFrame::Binary(b) => match String::from_utf8(b) {
                            Ok(t) => t,
                            Err(_) => {
                                return Some(Err(ProtocolError::InvalidUtf8.into()));
                            }
                        },
                        WsFrame::Ping(_) | WsFrame::Pong(_) | WsFrame::Frame(_) => continue,
                        WsFrame::Close(_) => return None,
                    };
                    let line = text.trim_end_matches(['\r', '\n']);
                    if line.trim().is_empty() {
                        continue;
                    }
                    if let Err(e) = check_line(line) {
                        return Some(Err(e.into()));
                    }
                    return Some(Ok(line.to_string()));
                }
            }
        }
    }

    /// Serialise and send one message.
    pub async fn send(&mut self, msg: &Message) -> Result<(), TransportError> {
        match self {
            Transport::Tcp(framed) => framed.send(msg).await.map_err(Into::into),
            Transport::Ws(ws) => ws
                .send(WsFrame::Text(format!("{msg}\r\n")))
                .await
                .map_err(Into::into),
        }
    }

    /// Flush buffered writes and close the underlying stream.
    pub async fn shutdown(&mut self) {
        match self {
            Transport::Tcp(framed) => {
                let _ = SinkExt::<&Message>::flush(framed).await;
                let _ = SinkExt::<&Message>::close(framed).await;
            }
            Transport::Ws(ws) => {
                let _ = ws.close().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn tcp_lines_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = tokio::spawn(async move {
            let mut sock = TcpStream::connect(addr).await.unwrap();
            sock.write_all(b"NICK alice\r\nPING :x\r\n").await.unwrap();
        });

        let (stream, _) = listener.accept().await.unwrap();
        let mut transport = Transport::tcp(stream);
        assert_eq!(transport.next_line().await.unwrap().unwrap(), "NICK alice");
        assert_eq!(transport.next_line().await.unwrap().unwrap(), "PING :x");
        client.await.unwrap();
    }

    #[tokio::test]
    async fn tcp_eof_is_none() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::spawn(async move {
            let _sock = TcpStream::connect(addr).await.unwrap();
        });
        let (stream, _) = listener.accept().await.unwrap();
        let mut transport = Transport::tcp(stream);
        client.await.unwrap();
        assert!(transport.next_line().await.is_none());
    }
}
