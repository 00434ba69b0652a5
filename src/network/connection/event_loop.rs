//! The ready phase: one select loop per connection.

use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

use chatter_proto::{Message, Transport};

use crate::error::HandlerError;
use crate::handlers::{CommandSet, Session};
use crate::state::ctx::Ctx;

use super::{dispatch_line, drain_outbound, hangup_on};

/// Multiplex inbound frames, the outbound queue and the shutdown signal
/// until the connection ends.
pub(super) async fn run_ready_loop(
    transport: &mut Transport,
    ctx: &Arc<Ctx>,
    commands: &CommandSet,
    session: &mut Session,
    tx: &mpsc::Sender<Arc<Message>>,
    rx: &mut mpsc::Receiver<Arc<Message>>,
) {
    let mut shutdown_rx = ctx.shutdown.subscribe();
    let addr = session.addr;
    let handle = session.handle.clone();

    loop {
        tokio::select! {
            line = transport.next_line() => {
                let line = match line {
                    None => return,
                    Some(Err(e)) => {
                        hangup_on(transport, &e).await;
                        return;
                    }
                    Some(Ok(line)) => line,
                };

                // commands within one connection run in arrival order
                if let Some(handle) = &handle {
                    handle.touch();
                }

                let result = dispatch_line(ctx, commands, session, tx, &addr, line).await;
                if drain_outbound(transport, rx).await.is_err() {
                    return;
                }
                match result {
                    Ok(()) => {}
                    Err(HandlerError::Quit(reason)) => {
                        let text = match reason {
                            Some(reason) => {
                                format!("Closing Link: {} (Quit: {reason})", addr.ip())
                            }
                            None => format!("Closing Link: {} (Client Quit)", addr.ip()),
                        };
                        let _ = transport.send(&Message::cmd("ERROR").trailing(text)).await;
                        return;
                    }
                    Err(HandlerError::AccessDenied) | Err(HandlerError::Send(_)) => return,
                    Err(e) => warn!(error = %e, "handler error"),
                }
            }

            Some(msg) = rx.recv() => {
                if transport.send(&msg).await.is_err() {
                    // pending frames are discarded with the connection
                    return;
                }
                if msg.is_error() {
                    info!("connection closed by server frame");
                    return;
                }
            }

            _ = shutdown_rx.recv() => {
                let goodbye = Message::cmd("ERROR")
                    .trailing("Closing Link: Server shutting down");
                let _ = transport.send(&goodbye).await;
                return;
            }
        }
    }
}
