//! MODE queries and changes for users and channels.

use async_trait::async_trait;
use std::sync::Arc;

use chatter_proto::{Message, MessageRef, Numeric};

use crate::error::{HandlerError, HandlerResult};
use crate::handlers::helpers::member_handles;
use crate::handlers::{Context, Handler};
use crate::state::modes::{ChannelMode, UserMode};

pub struct ModeHandler;

#[async_trait]
impl Handler for ModeHandler {
    async fn handle(&self, ctx: &mut Context<'_>, msg: &MessageRef<'_>) -> HandlerResult {
        let target = msg.arg(0).ok_or(HandlerError::NeedMoreParams)?;
        let own_nick = ctx.session.nick_or_star();

        if msg.params.len() == 1 {
            return query(ctx, target, &own_nick).await;
        }

        let request = msg.params[1];
        let mut letters = request.chars();
        let adding = match letters.next() {
            Some('+') => true,
            Some('-') => false,
            _ => {
                return ctx
                    .numeric(Numeric::ERR_UMODEUNKNOWNFLAG, vec!["Unknown MODE flag".into()])
                    .await;
            }
        };

        if target == own_nick {
            change_user_modes(ctx, &own_nick, adding, letters).await
        } else if target.starts_with('#') {
            change_channel_modes(ctx, target, adding, letters, &msg.params[2..]).await
        } else {
            ctx.numeric(Numeric::ERR_UMODEUNKNOWNFLAG, vec!["Unknown MODE flag".into()])
                .await
        }
    }
}

async fn query(ctx: &mut Context<'_>, target: &str, own_nick: &str) -> HandlerResult {
    if target == own_nick {
        let letters = ctx.handle()?.user_modes.lock().letters();
        return ctx
            .server_cmd(Message::cmd("MODE").param(own_nick).trailing(letters))
            .await;
    }

    if let Some(name) = target.strip_prefix('#') {
        let Some(channel) = ctx.ctx.registry.lookup_channel_by_name(name) else {
            return ctx
                .numeric(
                    Numeric::ERR_NOSUCHCHANNEL,
                    vec![target.to_string(), "No such channel".into()],
                )
                .await;
        };

        let (letters, key, limit) = {
            let state = channel.read();
            (state.modes.letters(), state.key.clone(), state.limit)
        };
        let display = channel.name();

        if letters.is_empty() {
            return ctx
                .numeric(Numeric::RPL_CHANNELMODEIS, vec![format!("#{display}"), String::new()])
                .await;
        }
        let mut modestr = format!("+{letters}");
        if let Some(key) = key {
            modestr.push(' ');
            modestr.push_str(&key);
        }
        if let Some(limit) = limit {
            modestr.push(' ');
            modestr.push_str(&limit.to_string());
        }
        return ctx
            .numeric(Numeric::RPL_CHANNELMODEIS, vec![format!("#{display}"), modestr])
            .await;
    }

    ctx.numeric(Numeric::ERR_UMODEUNKNOWNFLAG, vec!["Unknown MODE flag".into()])
        .await
}

async fn change_user_modes(
    ctx: &mut Context<'_>,
    own_nick: &str,
    adding: bool,
    letters: impl Iterator<Item = char>,
) -> HandlerResult {
    let handle = ctx.handle()?;
    let mut flipped = String::new();
    let mut invalid = false;

    for letter in letters {
        let Some(mode) = UserMode::from_letter(letter) else {
            invalid = true;
            continue;
        };
        let mut modes = handle.user_modes.lock();
        let before = modes.has(mode);
        if adding {
            modes.set(mode);
        } else {
            modes.clear(mode);
        }
        if modes.has(mode) != before {
            flipped.push(letter);
        }
    }

    // only the letters that actually flipped are echoed; an unknown letter
    // flags the request but does not void the applied subset
    if !flipped.is_empty() {
        let sign = if adding { '+' } else { '-' };
        ctx.server_cmd(
            Message::cmd("MODE")
                .param(own_nick)
                .trailing(format!("{sign}{flipped}")),
        )
        .await?;
    }
    if invalid {
        return ctx
            .numeric(Numeric::ERR_UMODEUNKNOWNFLAG, vec!["Unknown MODE flag".into()])
            .await;
    }
    Ok(())
}

async fn change_channel_modes(
    ctx: &mut Context<'_>,
    target: &str,
    adding: bool,
    letters: impl Iterator<Item = char>,
    args: &[&str],
) -> HandlerResult {
    let name = target.trim_start_matches('#');
    let Some(channel) = ctx.ctx.registry.lookup_channel_by_name(name) else {
        return ctx
            .numeric(
                Numeric::ERR_NOSUCHCHANNEL,
                vec![target.to_string(), "No such channel".into()],
            )
            .await;
    };

    let mut arg_index = 0usize;
    let mut flipped = String::new();
    let mut invalid = false;

    for letter in letters {
        let Some(mode) = ChannelMode::from_letter(letter) else {
            invalid = true;
            continue;
        };

        let arg = if mode.takes_arg() {
            match args.get(arg_index) {
                Some(a) => {
                    arg_index += 1;
                    Some(*a)
                }
                None => {
                    // missing argument voids this mode, not the request
                    invalid = true;
                    continue;
                }
            }
        } else {
            None
        };

        if channel.set_mode(mode, adding, arg) {
            flipped.push(letter);
        }
    }

    if !flipped.is_empty() {
        let sign = if adding { '+' } else { '-' };
        let display = channel.name();
        let line = Arc::new(
            Message::cmd("MODE")
                .param(format!("#{display}"))
                .trailing(format!("{sign}{flipped}"))
                .with_prefix(chatter_proto::Prefix::ServerName(
                    ctx.server_name().to_string(),
                )),
        );
        for (_, handle) in member_handles(ctx.ctx, &channel.members_snapshot()) {
            handle.enqueue(&line);
        }
    }
    if invalid {
        return ctx
            .numeric(Numeric::ERR_UMODEUNKNOWNFLAG, vec!["Unknown MODE flag".into()])
            .await;
    }
    Ok(())
}
