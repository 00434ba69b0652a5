//! Registration and liveness commands: NICK, USER, PASS, PING, PONG, QUIT.

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use chatter_proto::{irc_to_lower, is_valid_nick, Message, MessageRef, Numeric};

use crate::bus::{Event, EventKind, NickChangeEvent};
use crate::error::{HandlerError, HandlerResult};
use crate::handlers::helpers::deliver_to_account;
use crate::handlers::{Context, Handler, Phase, SetupTasks};

pub struct NickHandler;

#[async_trait]
impl Handler for NickHandler {
    async fn handle(&self, ctx: &mut Context<'_>, msg: &MessageRef<'_>) -> HandlerResult {
        let Some(new_nick) = msg.arg(0) else {
            return ctx
                .numeric(Numeric::ERR_NONICKNAMEGIVEN, vec!["No nickname given".into()])
                .await;
        };

        if !is_valid_nick(new_nick, ctx.ctx.server_info.nick_max_len) {
            return ctx
                .numeric(
                    Numeric::ERR_ERRONEUSNICKNAME,
                    vec![new_nick.to_string(), "Erroneous nickname".into()],
                )
                .await;
        }

        let folded = irc_to_lower(new_nick);
        let own_id = ctx.session.account.as_ref().map(|a| a.id);
        if let Some(owner) = ctx.ctx.registry.nick_binding(&folded) {
            if Some(owner) != own_id {
                return ctx
                    .numeric(
                        Numeric::ERR_NICKNAMEINUSE,
                        vec![new_nick.to_string(), "Nickname is already in use".into()],
                    )
                    .await;
            }
        }

        // bootstrap: record the tentative nick and clear the task
        if ctx.session.setup.has(SetupTasks::NICK) {
            ctx.session.nick = Some(new_nick.to_string());
            ctx.session.setup.clear(SetupTasks::NICK);
            return Ok(());
        }

        if !ctx.session.setup.is_empty() {
            return ctx
                .numeric(
                    Numeric::ERR_ERRONEUSNICKNAME,
                    vec!["Finish connect bootstrap first".into()],
                )
                .await;
        }

        // past bootstrap: a live rename
        let account = ctx.account()?;
        let old_nick = account.nick();
        if new_nick == old_nick {
            return ctx
                .numeric(
                    Numeric::ERR_NONICKNAMEGIVEN,
                    vec!["Your nick is already that".into()],
                )
                .await;
        }

        let mut event = Event::NickChange(NickChangeEvent {
            account: account.id,
            old_nick: old_nick.clone(),
            new_nick: new_nick.to_string(),
            cancel: false,
            reason: String::new(),
        });
        ctx.ctx.bus.dispatch(&mut event);
        let rejected = event.cancelled()
            || ctx
                .ctx
                .registry
                .rebind_nick(&irc_to_lower(&old_nick), &folded, account.id)
                .is_err();
        if rejected {
            debug!(reason = %event.reason(), "nick change rejected");
            return ctx
                .numeric(
                    Numeric::ERR_NICKNAMEINUSE,
                    vec![new_nick.to_string(), "Nickname is already in use".into()],
                )
                .await;
        }

        account.write().nick = new_nick.to_string();
        info!(old = %old_nick, new = %new_nick, "nick changed");

        // one NICK line to self and to every account sharing a channel
        let line = Arc::new(
            Message::cmd("NICK")
                .trailing(new_nick)
                .with_prefix(account.prefix_with_nick(&old_nick)),
        );
        let mut notified: HashSet<Uuid> = HashSet::from([account.id]);
        deliver_to_account(ctx.ctx, &account, &line);
        for channel in account.channels_snapshot() {
            for member in channel.members_snapshot() {
                if notified.insert(member) {
                    if let Some(peer) = ctx.ctx.registry.lookup_account_by_uuid(member) {
                        deliver_to_account(ctx.ctx, &peer, &line);
                    }
                }
            }
        }
        Ok(())
    }
}

pub struct UserHandler;

#[async_trait]
impl Handler for UserHandler {
    async fn handle(&self, ctx: &mut Context<'_>, msg: &MessageRef<'_>) -> HandlerResult {
        if !ctx.session.setup.has(SetupTasks::USER) {
            return ctx
                .numeric(
                    Numeric::ERR_NEEDMOREPARAMS,
                    vec!["USER".into(), "User already specified".into()],
                )
                .await;
        }
        if msg.params.len() < 4 {
            return Err(HandlerError::NeedMoreParams);
        }

        let username = msg.params[0];
        if username.len() > 16 {
            ctx.numeric(
                Numeric::ERR_NEEDMOREPARAMS,
                vec![
                    "USER".into(),
                    "Your user is too long (more than 16 characters)".into(),
                ],
            )
            .await?;
            return Err(HandlerError::AccessDenied);
        }

        ctx.session.username = Some(username.to_string());
        ctx.session.realname = Some(msg.params[3].to_string());
        ctx.session.setup.clear(SetupTasks::USER);
        Ok(())
    }
}

pub struct PassHandler;

#[async_trait]
impl Handler for PassHandler {
    async fn handle(&self, ctx: &mut Context<'_>, msg: &MessageRef<'_>) -> HandlerResult {
        let pass = msg.arg(0).ok_or(HandlerError::NeedMoreParams)?;
        ctx.session.pass = Some(pass.to_string());
        Ok(())
    }
}

pub struct PingHandler;

#[async_trait]
impl Handler for PingHandler {
    async fn handle(&self, ctx: &mut Context<'_>, msg: &MessageRef<'_>) -> HandlerResult {
        let Some(token) = msg.params.last() else {
            return ctx
                .numeric(Numeric::ERR_NOORIGIN, vec!["No origin specified".into()])
                .await;
        };
        ctx.send(
            Message::cmd("PONG")
                .param(ctx.server_name())
                .trailing(*token),
        )
        .await
    }
}

pub struct PongHandler;

#[async_trait]
impl Handler for PongHandler {
    async fn handle(&self, _ctx: &mut Context<'_>, _msg: &MessageRef<'_>) -> HandlerResult {
        // activity is recorded by the read loop for every inbound frame
        Ok(())
    }
}

pub struct QuitHandler;

#[async_trait]
impl Handler for QuitHandler {
    async fn handle(&self, ctx: &mut Context<'_>, msg: &MessageRef<'_>) -> HandlerResult {
        ctx.session.phase = Phase::Closing;
        Err(HandlerError::Quit(msg.arg(0).map(str::to_string)))
    }
}
