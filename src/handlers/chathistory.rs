//! CHATHISTORY: replay stored channel messages inside a batch.

use async_trait::async_trait;
use chrono::SecondsFormat;
use tracing::warn;
use uuid::Uuid;

use chatter_proto::{Message, MessageRef, Prefix};

use crate::error::{HandlerError, HandlerResult};
use crate::handlers::{Context, Handler};

const HISTORY_LIMIT_MAX: u32 = 100;

pub struct ChatHistoryHandler;

#[async_trait]
impl Handler for ChatHistoryHandler {
    async fn handle(&self, ctx: &mut Context<'_>, msg: &MessageRef<'_>) -> HandlerResult {
        if msg.params.len() < 4 {
            return Err(HandlerError::NeedMoreParams);
        }

        let subcommand = msg.params[0].to_ascii_uppercase();
        let target = msg.params[1];
        if subcommand != "LATEST" {
            // only LATEST is served; unknown selectors end quietly
            return Ok(());
        }

        let Some(name) = target.strip_prefix('#') else {
            return Ok(());
        };
        let Some(channel) = ctx.ctx.registry.lookup_channel_by_name(name) else {
            return Ok(());
        };
        let chan_display = channel.name();

        let limit = msg.params[3]
            .parse::<u32>()
            .unwrap_or(50)
            .min(HISTORY_LIMIT_MAX);

        let records = match ctx.ctx.db.load_recent_messages(channel.id, limit).await {
            Ok(records) => records,
            Err(e) => {
                warn!(channel = %chan_display, error = %e, "history load failed");
                Vec::new()
            }
        };

        let batch_ref = Uuid::new_v4().simple().to_string()[..8].to_string();
        ctx.server_cmd(
            Message::cmd("BATCH")
                .param(format!("+{batch_ref}"))
                .param("chathistory")
                .param(format!("#{chan_display}")),
        )
        .await?;

        for record in records {
            let prefix = match record
                .account
                .and_then(|id| ctx.ctx.registry.lookup_account_by_uuid(id))
            {
                Some(account) => account.prefix_with_nick(&record.nick),
                None => Prefix::nickmask(&record.nick, "user", &ctx.ctx.server_info.name),
            };
            let time = record
                .sent_at
                .to_rfc3339_opts(SecondsFormat::Millis, true);
            ctx.send(
                Message::cmd("PRIVMSG")
                    .param(format!("#{chan_display}"))
                    .trailing(record.text)
                    .with_prefix(prefix)
                    .with_tag("batch", Some(&batch_ref))
                    .with_tag("time", Some(&time)),
            )
            .await?;
        }

        ctx.server_cmd(Message::cmd("BATCH").param(format!("-{batch_ref}")))
            .await
    }
}
