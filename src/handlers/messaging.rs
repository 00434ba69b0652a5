//! Message routing: PRIVMSG and TAGMSG.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use chatter_proto::{irc_to_lower, Message, MessageRef, Numeric};

use crate::bus::{Event, MessageEvent};
use crate::db::MessageRecord;
use crate::error::{HandlerError, HandlerResult};
use crate::handlers::helpers::{account_handles, member_handles, should_deliver, tag_for_recipient};
use crate::handlers::{Context, Handler};

fn client_tags(msg: &MessageRef<'_>) -> Vec<(String, String)> {
    msg.tags_iter()
        .map(|(k, v)| (k.to_string(), v.unwrap_or_default()))
        .collect()
}

pub struct PrivmsgHandler;

#[async_trait]
impl Handler for PrivmsgHandler {
    async fn handle(&self, ctx: &mut Context<'_>, msg: &MessageRef<'_>) -> HandlerResult {
        if msg.params.len() < 2 {
            return Err(HandlerError::NeedMoreParams);
        }
        let target = msg.params[0];
        let text = msg.params[1];
        let account = ctx.account()?;
        let origin = ctx.session.conn_id;
        let nick = account.nick();
        let tags = client_tags(msg);

        if let Some(name) = target.strip_prefix('#') {
            // channel route
            let Some(channel) = ctx.ctx.registry.lookup_channel_by_name(name) else {
                return ctx
                    .numeric(
                        Numeric::ERR_NOSUCHNICK,
                        vec![target.to_string(), "No such nick/channel".into()],
                    )
                    .await;
            };

            let mut event = Event::ChannelMsg(MessageEvent {
                account: account.id,
                conn: origin,
                nick: nick.clone(),
                channel: Some(channel.name()),
                target_nick: None,
                text: text.to_string(),
                tags: tags.clone(),
                cancel: false,
                reason: String::new(),
            });
            ctx.ctx.bus.dispatch(&mut event);
            let Event::ChannelMsg(event) = event else {
                return Err(HandlerError::Internal("event kind changed".into()));
            };
            if event.cancel {
                debug!(channel = %name, reason = %event.reason, "channel message cancelled");
                return Ok(());
            }

            let display = channel.name();
            let base = Message::cmd("PRIVMSG")
                .param(format!("#{display}"))
                .trailing(event.text.clone())
                .with_prefix(account.prefix());

            for (_, handle) in member_handles(ctx.ctx, &channel.members_snapshot()) {
                if should_deliver(&handle, &account, origin) {
                    let tagged = tag_for_recipient(&base, &handle, &account, &event.tags);
                    handle.enqueue(&Arc::new(tagged));
                }
            }

            ctx.ctx.queue_message(MessageRecord {
                id: Uuid::new_v4(),
                account: Some(account.id),
                channel: Some(channel.id),
                target_account: None,
                nick,
                text: event.text,
                sent_at: Utc::now(),
            });
        } else {
            // private route
            let Some(dest) = ctx.ctx.registry.lookup_nick(&irc_to_lower(target)) else {
                return ctx
                    .numeric(
                        Numeric::ERR_NOSUCHNICK,
                        vec![target.to_string(), "No such nick/channel".into()],
                    )
                    .await;
            };

            let mut event = Event::PrivateMsg(MessageEvent {
                account: account.id,
                conn: origin,
                nick: nick.clone(),
                channel: None,
                target_nick: Some(dest.nick()),
                text: text.to_string(),
                tags: tags.clone(),
                cancel: false,
                reason: String::new(),
            });
            ctx.ctx.bus.dispatch(&mut event);
            let Event::PrivateMsg(event) = event else {
                return Err(HandlerError::Internal("event kind changed".into()));
            };
            if event.cancel {
                debug!(target = %target, reason = %event.reason, "private message cancelled");
                return Ok(());
            }

            let base = Message::cmd("PRIVMSG")
                .param(dest.nick())
                .trailing(event.text.clone())
                .with_prefix(account.prefix());

            for handle in account_handles(ctx.ctx, &dest) {
                let tagged = tag_for_recipient(&base, &handle, &account, &event.tags);
                handle.enqueue(&Arc::new(tagged));
            }
            // the sender's other connections, per the echo rules
            if dest.id != account.id {
                for handle in account_handles(ctx.ctx, &account) {
                    if should_deliver(&handle, &account, origin) {
                        let tagged = tag_for_recipient(&base, &handle, &account, &event.tags);
                        handle.enqueue(&Arc::new(tagged));
                    }
                }
            }

            ctx.ctx.queue_message(MessageRecord {
                id: Uuid::new_v4(),
                account: Some(account.id),
                channel: None,
                target_account: Some(dest.id),
                nick,
                text: event.text,
                sent_at: Utc::now(),
            });
        }
        Ok(())
    }
}

pub struct TagmsgHandler;

#[async_trait]
impl Handler for TagmsgHandler {
    async fn handle(&self, ctx: &mut Context<'_>, msg: &MessageRef<'_>) -> HandlerResult {
        let target = msg.arg(0).ok_or(HandlerError::NeedMoreParams)?;
        let account = ctx.account()?;
        let origin = ctx.session.conn_id;
        let tags = client_tags(msg);

        let mut event = Event::TagMsg(MessageEvent {
            account: account.id,
            conn: origin,
            nick: account.nick(),
            channel: target.strip_prefix('#').map(str::to_string),
            target_nick: (!target.starts_with('#')).then(|| target.to_string()),
            text: String::new(),
            tags: tags.clone(),
            cancel: false,
            reason: String::new(),
        });
        ctx.ctx.bus.dispatch(&mut event);
        if event.cancelled() {
            return Ok(());
        }

        let recipients = if let Some(name) = target.strip_prefix('#') {
            let Some(channel) = ctx.ctx.registry.lookup_channel_by_name(name) else {
                return ctx
                    .numeric(
                        Numeric::ERR_NOSUCHNICK,
                        vec![target.to_string(), "No such nick/channel".into()],
                    )
                    .await;
            };
            member_handles(ctx.ctx, &channel.members_snapshot())
                .into_iter()
                .map(|(_, handle)| handle)
                .collect::<Vec<_>>()
        } else {
            let Some(dest) = ctx.ctx.registry.lookup_nick(&irc_to_lower(target)) else {
                return ctx
                    .numeric(
                        Numeric::ERR_NOSUCHNICK,
                        vec![target.to_string(), "No such nick/channel".into()],
                    )
                    .await;
            };
            account_handles(ctx.ctx, &dest)
        };

        let base = Message::cmd("TAGMSG")
            .param(target)
            .with_prefix(account.prefix());
        for handle in recipients {
            // TAGMSG only means anything to clients that speak tags
            if !handle.has_cap("message-tags") {
                continue;
            }
            if should_deliver(&handle, &account, origin) {
                let tagged = tag_for_recipient(&base, &handle, &account, &tags);
                handle.enqueue(&Arc::new(tagged));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::channel::perform_join;
    use crate::handlers::testutil::{collect, conn, drive, harness, register};

    #[tokio::test]
    async fn channel_broadcast_skips_sender_without_echo() {
        let h = harness().await;
        let mut a = conn();
        let mut b = conn();
        let acc_a = register(&h, &mut a, "A", &[]);
        let acc_b = register(&h, &mut b, "B", &[]);
        perform_join(&h.ctx, &acc_a, "x", false).await;
        perform_join(&h.ctx, &acc_b, "x", false).await;
        collect(&mut a);
        collect(&mut b);

        drive(&h, &mut a, "PRIVMSG #x :hi").await.unwrap();
        assert_eq!(
            collect(&mut b),
            vec![":A!user@chatter.local PRIVMSG #x :hi".to_string()]
        );
        assert!(collect(&mut a).is_empty());
    }

    #[tokio::test]
    async fn echo_message_cap_echoes_to_sender() {
        let h = harness().await;
        let mut a = conn();
        let mut b = conn();
        let acc_a = register(&h, &mut a, "A", &["echo-message"]);
        let acc_b = register(&h, &mut b, "B", &[]);
        perform_join(&h.ctx, &acc_a, "x", false).await;
        perform_join(&h.ctx, &acc_b, "x", false).await;
        collect(&mut a);
        collect(&mut b);

        drive(&h, &mut a, "PRIVMSG #x :hi").await.unwrap();
        let expected = ":A!user@chatter.local PRIVMSG #x :hi";
        assert_eq!(collect(&mut a), vec![expected.to_string()]);
        assert_eq!(collect(&mut b), vec![expected.to_string()]);
    }

    #[tokio::test]
    async fn unknown_channel_target_is_401() {
        let h = harness().await;
        let mut a = conn();
        register(&h, &mut a, "A", &[]);
        drive(&h, &mut a, "PRIVMSG #void :hi").await.unwrap();
        assert!(collect(&mut a)[0].contains(" 401 "));
    }

    #[tokio::test]
    async fn private_route_reaches_every_destination_connection() {
        let h = harness().await;
        let mut a = conn();
        let mut b1 = conn();
        let acc_a = register(&h, &mut a, "A", &[]);
        let acc_b = register(&h, &mut b1, "B", &[]);

        // B's second connection, attached the way a bouncer would
        let mut b2 = conn();
        acc_b.add_connection(b2.session.conn_id);
        let handle2 = crate::state::conn::ConnHandle::new(
            b2.session.conn_id,
            b2.session.addr.ip(),
            acc_b.id,
            b2.tx.clone(),
            Default::default(),
        );
        h.ctx.conns.insert(handle2);
        let _ = &acc_a;

        drive(&h, &mut a, "PRIVMSG B :psst").await.unwrap();
        let expected = ":A!user@chatter.local PRIVMSG B :psst";
        assert_eq!(collect(&mut b1), vec![expected.to_string()]);
        assert_eq!(collect(&mut b2), vec![expected.to_string()]);
        assert!(collect(&mut a).is_empty());
    }

    #[tokio::test]
    async fn unknown_nick_target_is_401() {
        let h = harness().await;
        let mut a = conn();
        register(&h, &mut a, "A", &[]);
        drive(&h, &mut a, "PRIVMSG nobody :hi").await.unwrap();
        assert!(collect(&mut a)[0].contains(" 401 "));
    }

    #[tokio::test]
    async fn account_tag_reaches_capable_recipients() {
        let h = harness().await;
        let row = crate::db::AccountRow {
            id: uuid::Uuid::new_v4(),
            username: "alice".into(),
            password_hash: "x".into(),
            created: chrono::Utc::now(),
        };
        let acc_a = crate::state::account::Account::from_row(&row, "chatter.local");
        h.ctx.registry.insert_account(acc_a.clone());
        h.ctx
            .registry
            .bind_nick("alice", acc_a.id)
            .unwrap();

        let mut a = conn();
        acc_a.add_connection(a.session.conn_id);
        let handle = crate::state::conn::ConnHandle::new(
            a.session.conn_id,
            a.session.addr.ip(),
            acc_a.id,
            a.tx.clone(),
            Default::default(),
        );
        h.ctx.conns.insert(handle.clone());
        a.session.account = Some(acc_a.clone());
        a.session.handle = Some(handle);
        a.session.phase = crate::handlers::Phase::Ready;

        let mut b = conn();
        let acc_b = register(&h, &mut b, "B", &["message-tags", "account-tag"]);
        perform_join(&h.ctx, &acc_a, "x", false).await;
        perform_join(&h.ctx, &acc_b, "x", false).await;
        collect(&mut a);
        collect(&mut b);

        drive(&h, &mut a, "PRIVMSG #x :hi").await.unwrap();
        assert_eq!(
            collect(&mut b),
            vec!["@account=alice :alice!alice@chatter.local PRIVMSG #x :hi".to_string()]
        );
    }

    #[tokio::test]
    async fn tagmsg_only_reaches_tag_capable_members() {
        let h = harness().await;
        let mut a = conn();
        let mut b = conn();
        let mut c = conn();
        let acc_a = register(&h, &mut a, "A", &[]);
        let acc_b = register(&h, &mut b, "B", &["message-tags"]);
        let acc_c = register(&h, &mut c, "C", &[]);
        perform_join(&h.ctx, &acc_a, "x", false).await;
        perform_join(&h.ctx, &acc_b, "x", false).await;
        perform_join(&h.ctx, &acc_c, "x", false).await;
        collect(&mut a);
        collect(&mut b);
        collect(&mut c);

        drive(&h, &mut a, "@+typing=active TAGMSG #x").await.unwrap();
        let b_out = collect(&mut b);
        assert_eq!(b_out, vec!["@+typing=active :A!user@chatter.local TAGMSG #x".to_string()]);
        assert!(collect(&mut c).is_empty());
    }
}
