//! Listeners, timers and the connection lifecycle.

pub mod connection;
pub mod timers;

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use chatter_proto::Transport;

use crate::bus::{Event, PeerMaxConnectionsEvent};
use crate::handlers::CommandSet;
use crate::state::ctx::Ctx;
use connection::Connection;

/// Which framing wraps the state machine. The listening port discriminates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerKind {
    Tcp,
    WebSocket,
}

/// Accepts sockets, enforces the per-IP cap, and hands each connection to
/// its own task.
pub struct Gateway {
    listener: TcpListener,
    kind: ListenerKind,
    ctx: Arc<Ctx>,
    commands: Arc<CommandSet>,
}

impl Gateway {
    pub async fn bind(
        addr: SocketAddr,
        kind: ListenerKind,
        ctx: Arc<Ctx>,
        commands: Arc<CommandSet>,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!(%addr, ?kind, "listening");
        Ok(Self {
            listener,
            kind,
            ctx,
            commands,
        })
    }

    /// The actually bound address (port 0 resolves on bind).
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept until shutdown.
    pub async fn run(self) -> std::io::Result<()> {
        let mut shutdown_rx = self.ctx.shutdown.subscribe();
        loop {
            let accepted = tokio::select! {
                accepted = self.listener.accept() => accepted,
                _ = shutdown_rx.recv() => {
                    info!(kind = ?self.kind, "acceptor stopping");
                    return Ok(());
                }
            };

            let (stream, addr) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    error!(error = %e, "accept failed");
                    continue;
                }
            };

            let ip = addr.ip();
            if !self.ctx.try_acquire_ip(ip) {
                debug!(%ip, "rejected connection (per-IP cap)");
                let mut event = Event::PeerMaxConnections(PeerMaxConnectionsEvent {
                    ip: ip.to_string(),
                    cap: self.ctx.server_info.max_per_ip,
                });
                self.ctx.bus.dispatch(&mut event);
                drop(stream);
                continue;
            }

            let ctx = Arc::clone(&self.ctx);
            let commands = Arc::clone(&self.commands);
            let kind = self.kind;
            tokio::spawn(async move {
                let transport = match kind {
                    ListenerKind::Tcp => Some(Transport::tcp(stream)),
                    ListenerKind::WebSocket => {
                        match tokio_tungstenite::accept_async(stream).await {
                            Ok(ws) => Some(Transport::websocket(ws)),
                            Err(e) => {
                                warn!(%addr, error = %e, "websocket handshake failed");
                                None
                            }
                        }
                    }
                };
                if let Some(transport) = transport {
                    Connection::new(transport, addr, ctx.clone(), commands)
                        .run()
                        .await;
                }
                ctx.release_ip(ip);
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventKind;
    use crate::config::Config;
    use crate::db::Database;
    use parking_lot::Mutex;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpStream;

    #[tokio::test]
    async fn per_ip_cap_closes_the_socket_and_fires_the_event() {
        let db = Database::connect(":memory:").await.unwrap();
        let mut config = Config::default();
        config.server.max_per_ip = 2;
        let (ctx, _message_rx) = crate::state::ctx::Ctx::new(&config, db);

        let seen: Arc<Mutex<Vec<(String, u32)>>> = Arc::new(Mutex::new(Vec::new()));
        let seen_in_handler = Arc::clone(&seen);
        ctx.bus.register(
            EventKind::PeerMaxConnections,
            Box::new(move |event| {
                if let Event::PeerMaxConnections(e) = event {
                    seen_in_handler.lock().push((e.ip.clone(), e.cap));
                }
            }),
        );

        let commands = Arc::new(crate::handlers::CommandSet::new());
        let gateway = Gateway::bind(
            "127.0.0.1:0".parse().unwrap(),
            ListenerKind::Tcp,
            Arc::clone(&ctx),
            commands,
        )
        .await
        .unwrap();
        let addr = gateway.local_addr().unwrap();
        tokio::spawn(gateway.run());

        // the first two connections hold their slots
        let _c1 = TcpStream::connect(addr).await.unwrap();
        let _c2 = TcpStream::connect(addr).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        // the third is over the cap: closed immediately, event dispatched
        let mut c3 = TcpStream::connect(addr).await.unwrap();
        let mut buf = [0u8; 16];
        let read = tokio::time::timeout(
            std::time::Duration::from_secs(2),
            c3.read(&mut buf),
        )
        .await
        .expect("expected prompt close")
        .unwrap();
        assert_eq!(read, 0, "socket should be closed without data");

        let events = seen.lock().clone();
        assert_eq!(events, vec![("127.0.0.1".to_string(), 2)]);

        let _ = ctx.shutdown.send(());
    }
}
