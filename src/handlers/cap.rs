//! Capability negotiation and SASL.

use async_trait::async_trait;
use base64::Engine;
use tracing::{debug, info, warn};

use chatter_proto::{Message, MessageRef, Numeric};

use crate::bus::{AuthEvent, Event, EventKind};
use crate::db::passwd;
use crate::error::{HandlerError, HandlerResult};
use crate::handlers::{Context, Handler, SaslFlow, SetupTasks};

/// Capability tokens advertised on `CAP LS`, with their 302 value suffixes.
pub const CAPABILITIES: &[&str] = &[
    "message-tags",
    "multi-prefix",
    "extended-join",
    "chghost",
    "account-tag",
    "account-notify",
    "echo-message",
    "znc.in/self-message",
    "sasl=PLAIN",
    "draft/channel-rename",
    "extended-isupport",
    "soju.im/FILEHOST",
    "draft/metadata",
    "draft/metadata-2",
];

fn cap_base(token: &str) -> &str {
    token.split('=').next().unwrap_or(token)
}

fn cap_known(name: &str) -> bool {
    CAPABILITIES.iter().any(|t| cap_base(t) == name)
}

/// Handler for CAP LS / REQ / LIST / END.
pub struct CapHandler;

#[async_trait]
impl Handler for CapHandler {
    async fn handle(&self, ctx: &mut Context<'_>, msg: &MessageRef<'_>) -> HandlerResult {
        let sub = msg.arg(0).ok_or(HandlerError::NeedMoreParams)?.to_ascii_uppercase();

        match sub.as_str() {
            "LS" => {
                if let Some(ver) = msg.arg(1).and_then(|v| v.parse::<u32>().ok()) {
                    if ver >= 302 {
                        ctx.session.cap_version = ctx.session.cap_version.max(ver);
                    }
                }
                let with_values = ctx.session.cap_version >= 302;
                let tokens: Vec<&str> = if with_values {
                    CAPABILITIES.to_vec()
                } else {
                    CAPABILITIES.iter().map(|t| cap_base(t)).collect()
                };
                ctx.server_cmd(
                    Message::cmd("CAP")
                        .param("*")
                        .param("LS")
                        .trailing(tokens.join(" ")),
                )
                .await
            }
            "REQ" => {
                let requested = msg.arg(1).unwrap_or("");
                let mut grants: Vec<(bool, String)> = Vec::new();
                let mut all_known = true;

                for token in requested.split_whitespace() {
                    let (removal, name) = match token.strip_prefix('-') {
                        Some(rest) => (true, cap_base(rest)),
                        None => (false, cap_base(token)),
                    };
                    if cap_known(name) {
                        grants.push((removal, name.to_string()));
                    } else {
                        all_known = false;
                    }
                }

                // one unknown token rejects the whole request
                if !all_known || grants.is_empty() {
                    return ctx
                        .server_cmd(
                            Message::cmd("CAP")
                                .param("*")
                                .param("NAK")
                                .trailing(requested),
                        )
                        .await;
                }

                let mut acked = Vec::with_capacity(grants.len());
                for (removal, name) in grants {
                    if removal {
                        ctx.session.caps.remove(&name);
                        acked.push(format!("-{name}"));
                    } else {
                        ctx.session.caps.insert(name.clone());
                        acked.push(name);
                    }
                }
                debug!(caps = ?acked, "CAP REQ ACK");
                ctx.server_cmd(
                    Message::cmd("CAP")
                        .param("*")
                        .param("ACK")
                        .trailing(acked.join(" ")),
                )
                .await
            }
            "LIST" => {
                let mut enabled: Vec<&String> = ctx.session.caps.iter().collect();
                enabled.sort();
                let list = enabled
                    .into_iter()
                    .map(String::as_str)
                    .collect::<Vec<_>>()
                    .join(" ");
                ctx.server_cmd(Message::cmd("CAP").param("*").param("LIST").trailing(list))
                    .await
            }
            "END" => {
                ctx.session.setup.clear(SetupTasks::CAP_EXCHANGE);
                debug!(caps = ?ctx.session.caps, "CAP negotiation closed");
                Ok(())
            }
            _ => {
                // NEW/DEL and anything else are server-to-client only
                debug!(subcommand = %sub, "Ignoring CAP subcommand");
                Ok(())
            }
        }
    }
}

/// Handler for AUTHENTICATE (SASL PLAIN).
pub struct AuthenticateHandler;

#[async_trait]
impl Handler for AuthenticateHandler {
    async fn handle(&self, ctx: &mut Context<'_>, msg: &MessageRef<'_>) -> HandlerResult {
        let data = msg.arg(0).ok_or(HandlerError::NeedMoreParams)?;

        if data.eq_ignore_ascii_case("PLAIN") {
            ctx.session.sasl = SaslFlow::AwaitingData;
            return ctx.server_cmd(Message::cmd("AUTHENTICATE").param("+")).await;
        }

        // the next frame carries base64(authzid \0 authcid \0 password)
        let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(data) else {
            return ctx
                .numeric(Numeric::RPL_LOGGEDIN, vec!["SASL authentication failed".into()])
                .await;
        };
        let parts: Vec<&[u8]> = decoded.split(|&b| b == 0).collect();
        if parts.len() != 3 {
            return ctx
                .numeric(Numeric::RPL_LOGGEDIN, vec!["SASL authentication failed".into()])
                .await;
        }

        let authcid = String::from_utf8_lossy(parts[1]).into_owned();
        let password = String::from_utf8_lossy(parts[2]).into_owned();

        let Some(account) = ctx.ctx.registry.lookup_account_by_name(&authcid) else {
            ctx.numeric(Numeric::RPL_LOGGEDIN, vec!["SASL authentication failed".into()])
                .await?;
            return Err(HandlerError::AccessDenied);
        };

        // auth handlers on the bus take precedence over the stored hash
        let mut event = Event::AuthSaslPlain(AuthEvent {
            username: authcid.clone(),
            password: password.clone(),
            ip: ctx.session.addr.ip().to_string(),
            ok: true,
            cancel: false,
            reason: String::new(),
        });
        let (ok, reason) = if ctx.ctx.bus.has_handler(EventKind::AuthSaslPlain) {
            ctx.ctx.bus.dispatch(&mut event);
            match &event {
                Event::AuthSaslPlain(auth) => (auth.ok && !auth.cancel, auth.reason.clone()),
                _ => (false, "application error".to_string()),
            }
        } else {
            let stored = account.password_hash().unwrap_or_default();
            if password.is_empty() || stored.is_empty() {
                (false, "password cannot be empty".to_string())
            } else if passwd::verify(&password, &stored) {
                (true, String::new())
            } else {
                (false, "bad password".to_string())
            }
        };

        if !ok {
            warn!(username = %authcid, reason = %reason, "SASL authentication failed");
            let mut text = "SASL authentication failed".to_string();
            if !reason.is_empty() {
                text.push_str(": ");
                text.push_str(&reason);
            }
            ctx.numeric(Numeric::RPL_LOGGEDIN, vec![text]).await?;
            return Err(HandlerError::AccessDenied);
        }

        // adopt the connection: merge an existing anonymous account, or
        // bind directly when SASL ran before finalisation
        if let Some(anon) = ctx.session.account.take() {
            if anon.id != account.id {
                let moved = ctx
                    .ctx
                    .registry
                    .merge_accounts(&anon, &account)
                    .map_err(|e| HandlerError::Internal(e.to_string()))?;
                for conn_id in moved {
                    if let Some(handle) = ctx.ctx.conns.get(conn_id) {
                        handle.set_account(account.id);
                    }
                }
            }
        }
        ctx.session.account = Some(account.clone());
        ctx.session.sasl = SaslFlow::Done;
        ctx.session.logged_in = true;

        info!(username = %authcid, "SASL PLAIN authentication successful");
        ctx.numeric(
            Numeric::RPL_LOGGEDIN,
            vec![format!("You are now logged in as {authcid}")],
        )
        .await?;
        ctx.numeric(
            Numeric::RPL_SASLSUCCESS,
            vec!["SASL authentication successful".into()],
        )
        .await
    }
}
