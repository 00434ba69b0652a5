//! Channel membership commands: JOIN, PART, TOPIC, NAMES, RENAME.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

use chatter_proto::{irc_to_lower, is_valid_channel_name, Message, MessageRef, Numeric};

use crate::bus::{Event, MembershipEvent, RenameEvent};
use crate::error::{HandlerError, HandlerResult};
use crate::handlers::helpers::{account_handles, member_handles, server_reply};
use crate::handlers::{Context, Handler};
use crate::state::account::Account;
use crate::state::ctx::Ctx;

/// The join path shared by the JOIN handler and auto-join at finalisation.
///
/// Sends the self JOIN, topic and NAMES burst to every connection of the
/// account that has not yet mirrored the channel, and a join notification
/// to every other member connection that has not yet seen this account
/// there.
pub async fn perform_join(ctx: &Arc<Ctx>, account: &Arc<Account>, name: &str, from_system: bool) {
    let mut event = Event::ChannelJoin(MembershipEvent {
        account: account.id,
        channel: name.to_string(),
        from_system,
        message: String::new(),
        cancel: false,
        reason: String::new(),
    });
    ctx.bus.dispatch(&mut event);
    if event.cancelled() {
        debug!(channel = %name, reason = %event.reason(), "join cancelled");
        return;
    }

    let channel = ctx.registry.get_or_create_channel(name);
    let folded = irc_to_lower(&channel.name());

    if channel.add_member(account.id) {
        account.add_channel(&folded, channel.clone());
    }

    let display = channel.name();
    let members = channel.members_snapshot();
    let topic = channel.topic();
    let nick = account.nick();
    let prefix = account.prefix();
    let server = &ctx.server_info.name;

    let self_join = Arc::new(
        Message::cmd("JOIN")
            .trailing(format!("#{display}"))
            .with_prefix(prefix.clone()),
    );

    // member nicks for the NAMES burst, resolved through the registry
    let names: Vec<String> = members
        .iter()
        .filter_map(|id| ctx.registry.lookup_account_by_uuid(*id))
        .map(|member| member.nick())
        .collect();

    for handle in account_handles(ctx, account) {
        if handle.mirrors_channel(&folded) {
            continue;
        }
        handle.mirror_channel(&folded, members.iter().copied());

        handle.enqueue(&self_join);
        let topic_reply = if topic.is_empty() {
            server_reply(
                server,
                Numeric::RPL_NOTOPIC,
                nick.clone(),
                vec![format!("#{display}"), "No topic is set".into()],
            )
        } else {
            server_reply(
                server,
                Numeric::RPL_TOPIC,
                nick.clone(),
                vec![format!("#{display}"), topic.clone()],
            )
        };
        handle.enqueue(&Arc::new(topic_reply));
        handle.enqueue(&Arc::new(server_reply(
            server,
            Numeric::RPL_NAMREPLY,
            nick.clone(),
            vec!["=".into(), format!("#{display}"), names.join(" ")],
        )));
        handle.enqueue(&Arc::new(server_reply(
            server,
            Numeric::RPL_ENDOFNAMES,
            nick.clone(),
            vec![format!("#{display}"), "End of NAMES list".into()],
        )));
    }

    // let the rest of the channel know, once per connection
    let notify = Arc::new(
        Message::cmd("JOIN")
            .trailing(format!("#{display}"))
            .with_prefix(prefix),
    );
    for (member, handle) in member_handles(ctx, &members) {
        if member.id == account.id {
            continue;
        }
        if handle.mirror_see(&folded, account.id) {
            handle.enqueue(&notify);
        }
    }
}

pub struct JoinHandler;

#[async_trait]
impl Handler for JoinHandler {
    async fn handle(&self, ctx: &mut Context<'_>, msg: &MessageRef<'_>) -> HandlerResult {
        let targets = msg.arg(0).ok_or(HandlerError::NeedMoreParams)?;
        let account = ctx.account()?;

        for target in targets.split(',').filter(|t| !t.is_empty()) {
            let name = target.strip_prefix('#').unwrap_or("");
            if !is_valid_channel_name(name, ctx.ctx.server_info.channel_max_len) {
                ctx.numeric(
                    Numeric::ERR_BADCHANMASK,
                    vec![target.to_string(), "Invalid channel name".into()],
                )
                .await?;
                continue;
            }
            perform_join(ctx.ctx, &account, name, false).await;
        }
        Ok(())
    }
}

pub struct PartHandler;

#[async_trait]
impl Handler for PartHandler {
    async fn handle(&self, ctx: &mut Context<'_>, msg: &MessageRef<'_>) -> HandlerResult {
        let targets = msg.arg(0).ok_or(HandlerError::NeedMoreParams)?.to_string();
        let part_msg = msg.arg(1).unwrap_or("").to_string();
        let account = ctx.account()?;

        for target in targets.split(',') {
            let Some(name) = target.strip_prefix('#') else {
                continue;
            };
            let folded = irc_to_lower(name);

            let not_on = match ctx.ctx.registry.lookup_channel_by_name(name) {
                None => true,
                Some(ref channel) => !channel.is_member(account.id),
            };
            if not_on {
                ctx.numeric(
                    Numeric::ERR_NOTONCHANNEL,
                    vec![name.to_string(), "You're not on that channel".into()],
                )
                .await?;
                continue;
            }
            // lookup again is cheap; the race with a concurrent removal is
            // handled by remove_member returning None below
            let Some(channel) = ctx.ctx.registry.lookup_channel_by_name(name) else {
                continue;
            };

            let mut event = Event::ChannelPart(MembershipEvent {
                account: account.id,
                channel: name.to_string(),
                from_system: false,
                message: part_msg.clone(),
                cancel: false,
                reason: String::new(),
            });
            ctx.ctx.bus.dispatch(&mut event);
            if event.cancelled() {
                debug!(channel = %name, reason = %event.reason(), "part cancelled");
                continue;
            }

            let display = channel.name();
            let members = channel.members_snapshot();
            let mut line = Message::cmd("PART").param(format!("#{display}"));
            if !part_msg.is_empty() {
                line = line.trailing(part_msg.clone());
            }
            let line = Arc::new(line.with_prefix(account.prefix()));

            // notify the rest of the channel
            for (member, handle) in member_handles(ctx.ctx, &members) {
                if member.id == account.id {
                    continue;
                }
                handle.enqueue(&line);
                handle.mirror_forget_member(&folded, account.id);
            }

            // self PART to every connection of the leaver
            for handle in account_handles(ctx.ctx, &account) {
                handle.enqueue(&line);
                handle.mirror_forget_channel(&folded);
            }

            if channel.remove_member(account.id) == Some(0) {
                ctx.ctx.registry.remove_channel_if_dead(&channel);
            }
            account.remove_channel(&folded);
        }
        Ok(())
    }
}

pub struct TopicHandler;

#[async_trait]
impl Handler for TopicHandler {
    async fn handle(&self, ctx: &mut Context<'_>, msg: &MessageRef<'_>) -> HandlerResult {
        let target = msg.arg(0).ok_or(HandlerError::NeedMoreParams)?;
        let name = target.strip_prefix('#').unwrap_or(target);

        let Some(channel) = ctx.ctx.registry.lookup_channel_by_name(name) else {
            return ctx
                .numeric(
                    Numeric::ERR_NOSUCHCHANNEL,
                    vec![target.to_string(), "No such channel".into()],
                )
                .await;
        };
        let chan_display = channel.name();

        let Some(new_topic) = msg.arg(1) else {
            let topic = channel.topic();
            return if topic.is_empty() {
                ctx.numeric(
                    Numeric::RPL_NOTOPIC,
                    vec![format!("#{chan_display}"), "No topic is set".into()],
                )
                .await
            } else {
                ctx.numeric(Numeric::RPL_TOPIC, vec![format!("#{chan_display}"), topic])
                    .await
            };
        };

        let account = ctx.account()?;
        if !channel.is_member(account.id) {
            return ctx
                .numeric(
                    Numeric::ERR_NOTONCHANNEL,
                    vec![chan_display, "You're not on that channel".into()],
                )
                .await;
        }

        channel.set_topic(new_topic);
        info!(channel = %chan_display, "topic changed");

        let line = Arc::new(
            Message::cmd("TOPIC")
                .param(format!("#{chan_display}"))
                .trailing(new_topic)
                .with_prefix(account.prefix()),
        );
        for (_, handle) in member_handles(ctx.ctx, &channel.members_snapshot()) {
            handle.enqueue(&line);
        }
        Ok(())
    }
}

pub struct NamesHandler;

#[async_trait]
impl Handler for NamesHandler {
    async fn handle(&self, ctx: &mut Context<'_>, msg: &MessageRef<'_>) -> HandlerResult {
        let account = ctx.account()?;

        let channels = match msg.arg(0) {
            Some(list) => {
                let mut out = Vec::new();
                for target in list.split(',') {
                    let name = target.strip_prefix('#').unwrap_or(target);
                    match ctx.ctx.registry.lookup_channel_by_name(name) {
                        Some(channel) => out.push(channel),
                        None => {
                            ctx.numeric(
                                Numeric::ERR_NOSUCHCHANNEL,
                                vec![target.to_string(), "No such channel".into()],
                            )
                            .await?;
                        }
                    }
                }
                out
            }
            None => account.channels_snapshot(),
        };

        for channel in channels {
            let display = channel.name();
            let names: Vec<String> = channel
                .members_snapshot()
                .iter()
                .filter_map(|id| ctx.ctx.registry.lookup_account_by_uuid(*id))
                .map(|member| member.nick())
                .collect();
            ctx.numeric(
                Numeric::RPL_NAMREPLY,
                vec!["=".into(), format!("#{display}"), names.join(" ")],
            )
            .await?;
            ctx.numeric(
                Numeric::RPL_ENDOFNAMES,
                vec![format!("#{display}"), "End of NAMES list".into()],
            )
            .await?;
        }
        Ok(())
    }
}

pub struct RenameHandler;

#[async_trait]
impl Handler for RenameHandler {
    async fn handle(&self, ctx: &mut Context<'_>, msg: &MessageRef<'_>) -> HandlerResult {
        if msg.params.len() < 2 {
            return Err(HandlerError::NeedMoreParams);
        }
        let old_name = msg.params[0].strip_prefix('#').unwrap_or(msg.params[0]);
        let new_name = msg.params[1].strip_prefix('#').unwrap_or(msg.params[1]);
        let reason = msg.arg(2).unwrap_or("").to_string();
        let account = ctx.account()?;

        let fail = |code: &str, text: &str| {
            Message::cmd("FAIL")
                .param("RENAME")
                .param(code)
                .param(format!("#{old_name}"))
                .param(format!("#{new_name}"))
                .trailing(text)
        };

        if ctx.ctx.registry.lookup_channel_by_name(old_name).is_none() {
            return ctx
                .server_cmd(fail("CANNOT_RENAME", "Channel to rename does not exist"))
                .await;
        }
        if ctx.ctx.registry.lookup_channel_by_name(new_name).is_some() {
            return ctx
                .server_cmd(fail("CHANNEL_NAME_IN_USE", "Channel already exists"))
                .await;
        }
        if !is_valid_channel_name(new_name, ctx.ctx.server_info.channel_max_len) {
            return ctx
                .server_cmd(fail("CANNOT_RENAME", "Invalid channel name"))
                .await;
        }

        let mut event = Event::ChannelRename(RenameEvent {
            account: account.id,
            old_name: old_name.to_string(),
            new_name: new_name.to_string(),
            message: reason.clone(),
            cancel: false,
            reason: String::new(),
        });
        ctx.ctx.bus.dispatch(&mut event);
        if event.cancelled() {
            debug!(reason = %event.reason(), "rename cancelled");
            return Ok(());
        }

        let channel = match ctx.ctx.registry.rename_channel(old_name, new_name) {
            Ok(channel) => channel,
            Err(_) => {
                // lost the race against a concurrent create or rename
                return ctx
                    .server_cmd(fail("CHANNEL_NAME_IN_USE", "Channel already exists"))
                    .await;
            }
        };
        info!(old = %old_name, new = %new_name, "channel renamed");

        let old_folded = irc_to_lower(old_name);
        let new_folded = irc_to_lower(new_name);
        let members = channel.members_snapshot();

        let prefix = account.prefix();
        let mut rename_line = Message::cmd("RENAME")
            .param(format!("#{old_name}"))
            .param(format!("#{new_name}"));
        if !reason.is_empty() {
            rename_line = rename_line.trailing(reason);
        }
        let rename_line = Arc::new(rename_line.with_prefix(prefix.clone()));
        let part_line = Arc::new(
            Message::cmd("PART")
                .param(format!("#{old_name}"))
                .trailing("Changing the channel name")
                .with_prefix(prefix.clone()),
        );
        let join_line = Arc::new(
            Message::cmd("JOIN")
                .trailing(format!("#{new_name}"))
                .with_prefix(prefix),
        );

        for member_id in &members {
            if let Some(member) = ctx.ctx.registry.lookup_account_by_uuid(*member_id) {
                member.remove_channel(&old_folded);
                member.add_channel(&new_folded, channel.clone());
            }
        }
        for (_, handle) in member_handles(ctx.ctx, &members) {
            if handle.has_cap("draft/channel-rename") {
                handle.enqueue(&rename_line);
            } else {
                // fallback for clients without the capability
                handle.enqueue(&part_line);
                handle.enqueue(&join_line);
            }
            handle.mirror_rename_channel(&old_folded, &new_folded);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::testutil::{collect, conn, drive, harness, register};

    #[tokio::test]
    async fn first_join_bursts_join_topic_and_names() {
        let h = harness().await;
        let mut c = conn();
        register(&h, &mut c, "alice", &[]);

        drive(&h, &mut c, "JOIN #rust").await.unwrap();
        let out = collect(&mut c);
        assert_eq!(out[0], ":alice!user@chatter.local JOIN :#rust");
        assert!(out[1].contains(" 331 "));
        assert!(out[2].contains(" 353 alice = #rust :alice"));
        assert!(out[3].contains(" 366 "));

        let channel = h.ctx.registry.lookup_channel_by_name("rust").unwrap();
        assert!(channel.is_member(c.session.account.as_ref().unwrap().id));
    }

    #[tokio::test]
    async fn join_notifies_existing_members_once() {
        let h = harness().await;
        let mut a = conn();
        let mut b = conn();
        let acc_a = register(&h, &mut a, "alice", &[]);
        register(&h, &mut b, "bob", &[]);

        perform_join(&h.ctx, &acc_a, "rust", false).await;
        collect(&mut a);

        drive(&h, &mut b, "JOIN #rust").await.unwrap();
        let a_out = collect(&mut a);
        assert_eq!(a_out, vec![":bob!user@chatter.local JOIN :#rust".to_string()]);

        // a rejoin is a membership no-op and stays silent for peers
        drive(&h, &mut b, "JOIN #rust").await.unwrap();
        assert!(collect(&mut a).is_empty());
        let channel = h.ctx.registry.lookup_channel_by_name("rust").unwrap();
        assert_eq!(channel.members_snapshot().len(), 2);
    }

    #[tokio::test]
    async fn join_without_sigil_is_476() {
        let h = harness().await;
        let mut c = conn();
        register(&h, &mut c, "alice", &[]);
        drive(&h, &mut c, "JOIN rust").await.unwrap();
        assert!(collect(&mut c)[0].contains(" 476 "));
    }

    #[tokio::test]
    async fn part_broadcasts_and_drops_empty_channels() {
        let h = harness().await;
        let mut a = conn();
        let mut b = conn();
        let acc_a = register(&h, &mut a, "alice", &[]);
        let acc_b = register(&h, &mut b, "bob", &[]);

        perform_join(&h.ctx, &acc_a, "rust", false).await;
        perform_join(&h.ctx, &acc_b, "rust", false).await;
        collect(&mut a);
        collect(&mut b);

        drive(&h, &mut a, "PART #rust :gone fishing").await.unwrap();
        let expected = ":alice!user@chatter.local PART #rust :gone fishing";
        assert_eq!(collect(&mut a), vec![expected.to_string()]);
        assert_eq!(collect(&mut b), vec![expected.to_string()]);
        assert!(!h
            .ctx
            .registry
            .lookup_channel_by_name("rust")
            .unwrap()
            .is_member(acc_a.id));

        drive(&h, &mut b, "PART #rust").await.unwrap();
        // last member gone, the anonymous channel dies with it
        assert!(h.ctx.registry.lookup_channel_by_name("rust").is_none());
    }

    #[tokio::test]
    async fn part_when_not_on_channel_is_442() {
        let h = harness().await;
        let mut c = conn();
        register(&h, &mut c, "alice", &[]);
        drive(&h, &mut c, "PART #nowhere").await.unwrap();
        assert!(collect(&mut c)[0].contains(" 442 "));
    }

    #[tokio::test]
    async fn topic_set_broadcasts_and_query_returns_it() {
        let h = harness().await;
        let mut a = conn();
        let mut b = conn();
        let acc_a = register(&h, &mut a, "alice", &[]);
        let acc_b = register(&h, &mut b, "bob", &[]);
        perform_join(&h.ctx, &acc_a, "rust", false).await;
        perform_join(&h.ctx, &acc_b, "rust", false).await;
        collect(&mut a);
        collect(&mut b);

        drive(&h, &mut a, "TOPIC #rust :all things rust").await.unwrap();
        let expected = ":alice!user@chatter.local TOPIC #rust :all things rust";
        assert_eq!(collect(&mut a), vec![expected.to_string()]);
        assert_eq!(collect(&mut b), vec![expected.to_string()]);

        drive(&h, &mut b, "TOPIC #rust").await.unwrap();
        assert!(collect(&mut b)[0].contains(" 332 bob #rust :all things rust"));
    }

    #[tokio::test]
    async fn rename_rewrites_index_and_splits_by_capability() {
        let h = harness().await;
        let mut a = conn();
        let mut b = conn();
        let acc_a = register(&h, &mut a, "alice", &["draft/channel-rename"]);
        let acc_b = register(&h, &mut b, "bob", &[]);
        perform_join(&h.ctx, &acc_a, "old", false).await;
        perform_join(&h.ctx, &acc_b, "old", false).await;
        collect(&mut a);
        collect(&mut b);

        drive(&h, &mut a, "RENAME #old #fresh :tidying up").await.unwrap();

        assert!(h.ctx.registry.lookup_channel_by_name("old").is_none());
        let renamed = h.ctx.registry.lookup_channel_by_name("fresh").unwrap();
        assert!(renamed.is_member(acc_a.id));

        let a_out = collect(&mut a);
        assert_eq!(a_out, vec![":alice!user@chatter.local RENAME #old #fresh :tidying up".to_string()]);
        let b_out = collect(&mut b);
        assert_eq!(b_out[0], ":alice!user@chatter.local PART #old :Changing the channel name");
        assert_eq!(b_out[1], ":alice!user@chatter.local JOIN :#fresh");

        assert!(acc_a.channels_snapshot().iter().any(|c| c.name() == "fresh"));
    }

    #[tokio::test]
    async fn rename_missing_source_fails() {
        let h = harness().await;
        let mut c = conn();
        register(&h, &mut c, "alice", &[]);
        drive(&h, &mut c, "RENAME #ghost #new").await.unwrap();
        let out = collect(&mut c);
        assert!(out[0].contains("FAIL RENAME CANNOT_RENAME #ghost #new"));
    }
}
