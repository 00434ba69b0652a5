//! One client connection: greet phase, ready loop, teardown.
//!
//! Each connection runs on its own task. The greet phase drives the
//! registration state machine sequentially; after finalisation the ready
//! loop multiplexes inbound frames, the outbound queue and the shutdown
//! signal with `tokio::select!`.

mod event_loop;
mod handshake;

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use chatter_proto::{irc_to_lower, Message, MessageRef, Transport, TransportError};

use crate::bus::{Event, EventKind, RawLineEvent};
use crate::error::{HandlerError, HandlerResult};
use crate::handlers::helpers::member_handles;
use crate::handlers::{CommandSet, Context, Session};
use crate::state::ctx::Ctx;

pub struct Connection {
    conn_id: Uuid,
    addr: SocketAddr,
    transport: Transport,
    ctx: Arc<Ctx>,
    commands: Arc<CommandSet>,
}

impl Connection {
    pub fn new(
        transport: Transport,
        addr: SocketAddr,
        ctx: Arc<Ctx>,
        commands: Arc<CommandSet>,
    ) -> Self {
        Self {
            conn_id: Uuid::new_v4(),
            addr,
            transport,
            ctx,
            commands,
        }
    }

    #[instrument(skip(self), fields(conn = %self.conn_id, addr = %self.addr), name = "connection")]
    pub async fn run(mut self) {
        info!("client connected");

        let (tx, mut rx) = mpsc::channel::<Arc<Message>>(64);
        let mut session = Session::new(self.conn_id, self.addr);

        let registered = handshake::run_greet_loop(
            &mut self.transport,
            &self.ctx,
            &self.commands,
            &mut session,
            &tx,
            &mut rx,
        )
        .await;

        if registered {
            event_loop::run_ready_loop(
                &mut self.transport,
                &self.ctx,
                &self.commands,
                &mut session,
                &tx,
                &mut rx,
            )
            .await;
        }

        teardown(&self.ctx, &mut session);
        self.transport.shutdown().await;
        info!("client disconnected");
    }
}

/// Run the raw-line observation point. Returns the (possibly rewritten)
/// line, or `None` when a handler cancelled it.
pub(super) fn raw_line_hook(ctx: &Ctx, line: String, addr: &SocketAddr) -> Option<String> {
    if !ctx.bus.has_handler(EventKind::RawLine) {
        return Some(line);
    }
    let mut event = Event::RawLine(RawLineEvent {
        line,
        ip: addr.ip().to_string(),
        cancel: false,
        reason: String::new(),
    });
    ctx.bus.dispatch(&mut event);
    match event {
        Event::RawLine(raw) if !raw.cancel => Some(raw.line),
        _ => None,
    }
}

/// Flush everything handlers queued during one dispatch. An ERROR frame or
/// a failed write ends the connection.
pub(super) async fn drain_outbound(
    transport: &mut Transport,
    rx: &mut mpsc::Receiver<Arc<Message>>,
) -> Result<(), ()> {
    while let Ok(msg) = rx.try_recv() {
        if transport.send(&msg).await.is_err() {
            return Err(());
        }
        if msg.is_error() {
            return Err(());
        }
    }
    Ok(())
}

/// Dispatch one inbound line through the raw hook, the parser and the
/// command set. Returns the handler result; a malformed frame is dropped.
pub(super) async fn dispatch_line(
    ctx: &Arc<Ctx>,
    commands: &CommandSet,
    session: &mut Session,
    tx: &mpsc::Sender<Arc<Message>>,
    addr: &SocketAddr,
    line: String,
) -> HandlerResult {
    let Some(line) = raw_line_hook(ctx, line, addr) else {
        return Ok(());
    };
    let parsed = match MessageRef::parse(&line) {
        Ok(parsed) => parsed,
        Err(e) => {
            debug!(error = %e, "dropping malformed frame");
            return Ok(());
        }
    };

    let mut hctx = Context {
        ctx,
        session,
        sender: tx,
    };
    let result = commands.dispatch(&mut hctx, &parsed).await;
    if let Err(HandlerError::Internal(reason)) = &result {
        // internal faults abort the operation and stay off the wire
        warn!(reason = %reason, command = %parsed.command, "operation aborted");
        return Ok(());
    }
    result
}

/// Send the terminal ERROR frame for a read-side protocol violation.
pub(super) async fn hangup_on(transport: &mut Transport, error: &TransportError) {
    if error.is_protocol() {
        let goodbye = Message::cmd("ERROR").trailing(format!("Closing Link: {error}"));
        let _ = transport.send(&goodbye).await;
    }
}

/// Detach the connection from its account and tear down whatever its
/// departure makes unreachable.
fn teardown(ctx: &Arc<Ctx>, session: &mut Session) {
    ctx.conns.remove(session.conn_id);

    let Some(account) = session.account.take() else {
        return;
    };

    let remaining = account.remove_connection(session.conn_id);
    if remaining > 0 {
        return;
    }

    // nick bindings exist only while the account is connected
    ctx.registry
        .unbind_nick(&irc_to_lower(&account.nick()), account.id);

    if account.is_named() {
        return;
    }

    // an anonymous account dies with its last connection
    for channel in account.channels_snapshot() {
        let folded = irc_to_lower(&channel.name());
        if channel.remove_member(account.id) == Some(0) {
            ctx.registry.remove_channel_if_dead(&channel);
        }
        for (_, handle) in member_handles(ctx, &channel.members_snapshot()) {
            handle.mirror_forget_member(&folded, account.id);
        }
    }
    ctx.registry.remove_account(&account);
    debug!(account = %account.id, "anonymous account destroyed");
}
