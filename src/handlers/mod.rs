//! Command handlers and dispatch.
//!
//! One handler object per command, registered in a [`CommandSet`]. The
//! per-connection [`Session`] carries the state machine data; everything
//! process-wide comes in through the [`Ctx`].

pub mod cap;
pub mod channel;
pub mod chathistory;
pub mod connection;
pub mod helpers;
pub mod messaging;
pub mod mode;
pub mod server_query;

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use chatter_proto::{Message, MessageRef, Numeric, Prefix};

use crate::error::{HandlerError, HandlerResult};
use crate::state::account::Account;
use crate::state::conn::ConnHandle;
use crate::state::ctx::Ctx;

/// Connection phases, mutually exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    #[default]
    Greet,
    Ready,
    Closing,
}

/// Pending setup tasks. Registration finalises when the set empties.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetupTasks(u8);

impl SetupTasks {
    pub const CAP_EXCHANGE: u8 = 1 << 0;
    pub const NICK: u8 = 1 << 1;
    pub const USER: u8 = 1 << 2;

    /// Entry state: all three tasks pending.
    pub fn pending() -> Self {
        SetupTasks(Self::CAP_EXCHANGE | Self::NICK | Self::USER)
    }

    pub fn has(&self, task: u8) -> bool {
        self.0 & task != 0
    }

    pub fn clear(&mut self, task: u8) {
        self.0 &= !task;
    }

    pub fn set(&mut self, task: u8) {
        self.0 |= task;
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

/// SASL exchange progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SaslFlow {
    #[default]
    Idle,
    AwaitingData,
    Done,
}

/// Per-connection state machine data, owned by the connection task.
pub struct Session {
    pub conn_id: Uuid,
    pub addr: SocketAddr,
    pub phase: Phase,
    pub setup: SetupTasks,
    /// Tentative nick before finalisation binds it.
    pub nick: Option<String>,
    pub username: Option<String>,
    pub realname: Option<String>,
    /// PASS argument, checked at finalisation.
    pub pass: Option<String>,
    pub caps: HashSet<String>,
    pub cap_version: u32,
    pub sasl: SaslFlow,
    /// Bound account: set by SASL or at finalisation.
    pub account: Option<Arc<Account>>,
    pub logged_in: bool,
    /// Shared handle, registered at finalisation.
    pub handle: Option<Arc<ConnHandle>>,
}

impl Session {
    pub fn new(conn_id: Uuid, addr: SocketAddr) -> Self {
        Session {
            conn_id,
            addr,
            phase: Phase::Greet,
            setup: SetupTasks::pending(),
            nick: None,
            username: None,
            realname: None,
            pass: None,
            caps: HashSet::new(),
            cap_version: 0,
            sasl: SaslFlow::default(),
            account: None,
            logged_in: false,
            handle: None,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.phase == Phase::Ready
    }

    /// The display nick for replies: account nick wins, then the tentative
    /// nick, then `*`.
    pub fn nick_or_star(&self) -> String {
        if let Some(account) = &self.account {
            return account.nick();
        }
        self.nick.clone().unwrap_or_else(|| "*".to_string())
    }
}

/// Everything a handler gets to work with.
pub struct Context<'a> {
    pub ctx: &'a Arc<Ctx>,
    pub session: &'a mut Session,
    /// Outbound queue of this connection.
    pub sender: &'a mpsc::Sender<Arc<Message>>,
}

impl Context<'_> {
    pub fn server_name(&self) -> &str {
        &self.ctx.server_info.name
    }

    pub async fn send(&self, msg: Message) -> HandlerResult {
        self.sender.send(Arc::new(msg)).await?;
        Ok(())
    }

    /// Send a server-originated numeric addressed to this connection.
    pub async fn numeric(&self, num: Numeric, params: Vec<String>) -> HandlerResult {
        let msg = helpers::server_reply(self.server_name(), num, self.session.nick_or_star(), params);
        self.send(msg).await
    }

    /// Send a server-originated non-numeric line (`MODE`, `CAP`, ...).
    pub async fn server_cmd(&self, msg: Message) -> HandlerResult {
        self.send(msg.with_prefix(Prefix::ServerName(self.server_name().to_string())))
            .await
    }

    /// The bound account, which every Ready-state handler may assume.
    pub fn account(&self) -> Result<Arc<Account>, HandlerError> {
        self.session
            .account
            .clone()
            .ok_or_else(|| HandlerError::Internal("no account bound".into()))
    }

    /// The registered connection handle, present from finalisation on.
    pub fn handle(&self) -> Result<Arc<ConnHandle>, HandlerError> {
        self.session
            .handle
            .clone()
            .ok_or_else(|| HandlerError::Internal("connection not registered".into()))
    }
}

/// A command handler.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, ctx: &mut Context<'_>, msg: &MessageRef<'_>) -> HandlerResult;
}

/// Registry of command handlers plus the Greet-state allowlist.
pub struct CommandSet {
    handlers: HashMap<&'static str, Box<dyn Handler>>,
    greet_allowed: HashSet<&'static str>,
}

impl CommandSet {
    pub fn new() -> Self {
        let mut handlers: HashMap<&'static str, Box<dyn Handler>> = HashMap::new();

        // registration & liveness
        handlers.insert("CAP", Box::new(cap::CapHandler));
        handlers.insert("AUTHENTICATE", Box::new(cap::AuthenticateHandler));
        handlers.insert("NICK", Box::new(connection::NickHandler));
        handlers.insert("USER", Box::new(connection::UserHandler));
        handlers.insert("PASS", Box::new(connection::PassHandler));
        handlers.insert("PING", Box::new(connection::PingHandler));
        handlers.insert("PONG", Box::new(connection::PongHandler));
        handlers.insert("QUIT", Box::new(connection::QuitHandler));

        // channels
        handlers.insert("JOIN", Box::new(channel::JoinHandler));
        handlers.insert("PART", Box::new(channel::PartHandler));
        handlers.insert("TOPIC", Box::new(channel::TopicHandler));
        handlers.insert("NAMES", Box::new(channel::NamesHandler));
        handlers.insert("RENAME", Box::new(channel::RenameHandler));

        // messaging
        handlers.insert("PRIVMSG", Box::new(messaging::PrivmsgHandler));
        handlers.insert("TAGMSG", Box::new(messaging::TagmsgHandler));

        // modes
        handlers.insert("MODE", Box::new(mode::ModeHandler));

        // queries
        handlers.insert("LUSERS", Box::new(server_query::LusersHandler));
        handlers.insert("MOTD", Box::new(server_query::MotdHandler));
        handlers.insert("WHO", Box::new(server_query::WhoHandler));
        handlers.insert("WHOIS", Box::new(server_query::WhoisHandler));
        handlers.insert("CHATHISTORY", Box::new(chathistory::ChatHistoryHandler));

        let greet_allowed = [
            "CAP",
            "NICK",
            "USER",
            "PASS",
            "AUTHENTICATE",
            "QUIT",
            "PING",
            "PONG",
        ]
        .into_iter()
        .collect();

        Self {
            handlers,
            greet_allowed,
        }
    }

    /// Dispatch one frame. Replies 421 for unknown commands, 451 for
    /// Ready-only commands in Greet, 461 for missing parameters.
    pub async fn dispatch(&self, ctx: &mut Context<'_>, msg: &MessageRef<'_>) -> HandlerResult {
        let cmd = msg.command.to_ascii_uppercase();

        let Some(handler) = self.handlers.get(cmd.as_str()) else {
            debug!(command = %cmd, "Unknown command");
            return ctx
                .numeric(Numeric::ERR_UNKNOWNCOMMAND, vec![cmd, "Unknown command".into()])
                .await;
        };

        if !ctx.session.is_ready() && !self.greet_allowed.contains(cmd.as_str()) {
            return ctx
                .numeric(
                    Numeric::ERR_NOTREGISTERED,
                    vec!["You have not registered".into()],
                )
                .await;
        }

        match handler.handle(ctx, msg).await {
            Err(HandlerError::NeedMoreParams) => {
                ctx.numeric(
                    Numeric::ERR_NEEDMOREPARAMS,
                    vec![cmd, "Not enough parameters".into()],
                )
                .await
            }
            Err(HandlerError::NotRegistered) => {
                ctx.numeric(
                    Numeric::ERR_NOTREGISTERED,
                    vec!["You have not registered".into()],
                )
                .await
            }
            other => other,
        }
    }
}

impl Default for CommandSet {
    fn default() -> Self {
        Self::new()
    }
}
