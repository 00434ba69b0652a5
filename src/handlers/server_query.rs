//! Informational queries: LUSERS, MOTD, WHO, WHOIS.

use async_trait::async_trait;

use chatter_proto::{irc_to_lower, MessageRef, Numeric};

use crate::error::{HandlerError, HandlerResult};
use crate::handlers::{Context, Handler};

/// MOTD body lines are chunked to keep each 372 well inside the body cap.
const MOTD_CHUNK: usize = 400;

pub struct LusersHandler;

#[async_trait]
impl Handler for LusersHandler {
    async fn handle(&self, ctx: &mut Context<'_>, _msg: &MessageRef<'_>) -> HandlerResult {
        send_lusers(ctx).await
    }
}

/// Shared with the welcome burst.
pub async fn send_lusers(ctx: &mut Context<'_>) -> HandlerResult {
    let users = ctx.ctx.registry.account_count();
    let peers = ctx.ctx.conns.len();
    ctx.numeric(
        Numeric::RPL_LUSERCLIENT,
        vec![format!(
            "There are {users} users, {peers} connected peers, and 0 services on 1 server(s)"
        )],
    )
    .await?;
    ctx.numeric(
        Numeric::RPL_LUSERME,
        vec![format!("I have {users} users, {peers} connected peers")],
    )
    .await
}

pub struct MotdHandler;

#[async_trait]
impl Handler for MotdHandler {
    async fn handle(&self, ctx: &mut Context<'_>, _msg: &MessageRef<'_>) -> HandlerResult {
        send_motd(ctx).await
    }
}

/// Shared with the welcome burst.
pub async fn send_motd(ctx: &mut Context<'_>) -> HandlerResult {
    let server = ctx.server_name().to_string();
    ctx.numeric(
        Numeric::RPL_MOTDSTART,
        vec![format!("- {server} Message of the day -")],
    )
    .await?;

    let motd = ctx.ctx.motd();
    for line in motd.lines() {
        let line = line.trim();
        if line.is_empty() {
            ctx.numeric(Numeric::RPL_MOTD, vec![String::new()]).await?;
            continue;
        }
        let mut rest = line;
        while !rest.is_empty() {
            let cut = rest
                .char_indices()
                .take_while(|(i, _)| *i < MOTD_CHUNK)
                .last()
                .map(|(i, c)| i + c.len_utf8())
                .unwrap_or(rest.len());
            ctx.numeric(Numeric::RPL_MOTD, vec![rest[..cut].to_string()])
                .await?;
            rest = &rest[cut..];
        }
    }

    ctx.numeric(Numeric::RPL_ENDOFMOTD, vec!["End of MOTD command.".into()])
        .await
}

pub struct WhoHandler;

#[async_trait]
impl Handler for WhoHandler {
    async fn handle(&self, ctx: &mut Context<'_>, msg: &MessageRef<'_>) -> HandlerResult {
        let raw_target = msg.arg(0).ok_or(HandlerError::NeedMoreParams)?;
        let name = raw_target.strip_prefix('#').unwrap_or(raw_target);

        let Some(channel) = ctx.ctx.registry.lookup_channel_by_name(name) else {
            return ctx
                .numeric(
                    Numeric::ERR_NOSUCHNICK,
                    vec![raw_target.to_string(), "No such nick/channel".into()],
                )
                .await;
        };

        let owner = channel.read().owner;
        for member_id in channel.members_snapshot() {
            let Some(member) = ctx.ctx.registry.lookup_account_by_uuid(member_id) else {
                continue;
            };
            let nick = member.nick();
            let host = {
                let state = member.read();
                state.host.clone()
            };
            let mut status = if member.connection_ids().is_empty() {
                "G".to_string()
            } else {
                "H".to_string()
            };
            if owner == Some(member.id) {
                status.push('@');
            }
            ctx.numeric(
                Numeric::RPL_WHOSPCRPL,
                vec![
                    raw_target.to_string(),
                    "~u".into(),
                    host,
                    nick.clone(),
                    status,
                    "0".into(),
                    "*".into(),
                    nick,
                ],
            )
            .await?;
        }

        ctx.numeric(
            Numeric::RPL_ENDOFWHO,
            vec![raw_target.to_string(), "End of WHO list".into()],
        )
        .await
    }
}

pub struct WhoisHandler;

#[async_trait]
impl Handler for WhoisHandler {
    async fn handle(&self, ctx: &mut Context<'_>, msg: &MessageRef<'_>) -> HandlerResult {
        let target = msg.arg(0).ok_or(HandlerError::NeedMoreParams)?;

        let Some(account) = ctx.ctx.registry.lookup_nick(&irc_to_lower(target)) else {
            return ctx
                .numeric(
                    Numeric::ERR_NOSUCHNICK,
                    vec![target.to_string(), "No such nick/channel".into()],
                )
                .await;
        };

        let nick = account.nick();
        let (user, host) = {
            let state = account.read();
            (
                state.username.clone().unwrap_or_else(|| "user".into()),
                state.host.clone(),
            )
        };
        ctx.numeric(
            Numeric::RPL_WHOISUSER,
            vec![nick.clone(), user, host, "*".into(), nick.clone()],
        )
        .await?;

        let channels: Vec<String> = account
            .channels_snapshot()
            .iter()
            .map(|c| format!("#{}", c.name()))
            .collect();
        if !channels.is_empty() {
            ctx.numeric(
                Numeric::RPL_WHOISCHANNELS,
                vec![nick.clone(), channels.join(" ")],
            )
            .await?;
        }

        ctx.numeric(
            Numeric::RPL_ENDOFWHOIS,
            vec![nick, "End of WHOIS list".into()],
        )
        .await
    }
}
