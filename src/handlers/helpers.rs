//! Reply construction and fan-out plumbing shared across handlers.

use std::sync::Arc;

use chatter_proto::{build_tag_block, escape_tag_value, irc_to_lower, Message, Numeric, Prefix};
use uuid::Uuid;

use crate::state::account::Account;
use crate::state::conn::ConnHandle;
use crate::state::ctx::Ctx;

/// Build a `:server NNN <target> ...` numeric. The last parameter is
/// always written as trailing.
pub fn server_reply(server: &str, num: Numeric, target: String, params: Vec<String>) -> Message {
    let mut msg = Message::cmd(num.token()).param(target);
    let last = params.len().saturating_sub(1);
    for (i, p) in params.into_iter().enumerate() {
        msg = if i == last { msg.trailing(p) } else { msg.param(p) };
    }
    msg.with_prefix(Prefix::ServerName(server.to_string()))
}

/// Every live connection handle of one account.
pub fn account_handles(ctx: &Ctx, account: &Account) -> Vec<Arc<ConnHandle>> {
    account
        .connection_ids()
        .into_iter()
        .filter_map(|id| ctx.conns.get(id))
        .collect()
}

/// Resolve a member snapshot into `(account, handle)` pairs. Members whose
/// account lookup fails raced a removal and are skipped.
pub fn member_handles(ctx: &Ctx, members: &[Uuid]) -> Vec<(Arc<Account>, Arc<ConnHandle>)> {
    let mut out = Vec::new();
    for id in members {
        let Some(account) = ctx.registry.lookup_account_by_uuid(*id) else {
            continue;
        };
        for handle in account_handles(ctx, &account) {
            out.push((account.clone(), handle));
        }
    }
    out
}

/// Enqueue a frame on all of an account's connections.
pub fn deliver_to_account(ctx: &Ctx, account: &Account, msg: &Arc<Message>) {
    for handle in account_handles(ctx, account) {
        handle.enqueue(msg);
    }
}

/// Prepend negotiated tags to a relayed message for one recipient
/// connection: the incoming client tags when `message-tags` is on, plus an
/// `account` tag when `account-tag` is on and the source is named.
pub fn tag_for_recipient(
    base: &Message,
    recipient: &ConnHandle,
    source: &Account,
    client_tags: &[(String, String)],
) -> Message {
    if !recipient.has_cap("message-tags") {
        let mut bare = base.clone();
        bare.tags.clear();
        return bare;
    }

    let mut pairs: Vec<(String, Option<String>)> = Vec::new();
    if recipient.has_cap("account-tag") {
        if let Some(username) = source.username() {
            pairs.push(("account".to_string(), Some(escape_tag_value(&username))));
        }
    }
    for (key, value) in client_tags {
        if value.is_empty() {
            pairs.push((key.clone(), None));
        } else {
            pairs.push((key.clone(), Some(escape_tag_value(value))));
        }
    }

    let mut tagged = base.clone();
    tagged.tags.clear();
    // the joined block is capped at MAX_TAG_BLOCK bytes
    let block = build_tag_block(pairs.iter().map(|(k, v)| (k.as_str(), v.as_deref())));
    for entry in block.split(';').filter(|e| !e.is_empty()) {
        match entry.split_once('=') {
            Some((k, v)) => {
                tagged = tagged.with_tag(k, Some(&chatter_proto::unescape_tag_value(v)));
            }
            None => tagged = tagged.with_tag(entry, None),
        }
    }
    tagged
}

/// The echo rules of the PRIVMSG/TAGMSG routes: recipients of other
/// accounts always get the frame; the sender's own connections only with
/// `echo-message`, or with `znc.in/self-message` on connections other than
/// the originating one.
pub fn should_deliver(recipient: &ConnHandle, source: &Account, origin_conn: Uuid) -> bool {
    if recipient.account_id() != source.id {
        return true;
    }
    if recipient.has_cap("echo-message") {
        return true;
    }
    recipient.has_cap("znc.in/self-message") && recipient.id != origin_conn
}

/// Fold a `#channel` argument into the lookup key, rejecting targets
/// without the sigil.
pub fn channel_key(target: &str) -> Option<String> {
    target.strip_prefix('#').map(irc_to_lower)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use tokio::sync::mpsc;

    fn handle_with_caps(
        account: Uuid,
        caps: &[&str],
    ) -> (Arc<ConnHandle>, mpsc::Receiver<Arc<Message>>) {
        let (tx, rx) = mpsc::channel(8);
        let handle = ConnHandle::new(
            Uuid::new_v4(),
            "127.0.0.1".parse().unwrap(),
            account,
            tx,
            caps.iter().map(|c| c.to_string()).collect::<HashSet<_>>(),
        );
        (handle, rx)
    }

    #[test]
    fn server_reply_shape() {
        let msg = server_reply(
            "irc.example.net",
            Numeric::ERR_NICKNAMEINUSE,
            "alice".into(),
            vec!["bob".into(), "Nickname is already in use".into()],
        );
        assert_eq!(
            msg.to_string(),
            ":irc.example.net 433 alice bob :Nickname is already in use"
        );
    }

    #[test]
    fn echo_rules() {
        let src = Account::anonymous("a", "h");

        let (other, _rx1) = handle_with_caps(Uuid::new_v4(), &[]);
        assert!(should_deliver(&other, &src, Uuid::new_v4()));

        let (own_plain, _rx2) = handle_with_caps(src.id, &[]);
        assert!(!should_deliver(&own_plain, &src, own_plain.id));

        let (own_echo, _rx3) = handle_with_caps(src.id, &["echo-message"]);
        assert!(should_deliver(&own_echo, &src, own_echo.id));

        let (own_self, _rx4) = handle_with_caps(src.id, &["znc.in/self-message"]);
        assert!(!should_deliver(&own_self, &src, own_self.id));
        assert!(should_deliver(&own_self, &src, Uuid::new_v4()));
    }

    #[test]
    fn account_tag_only_for_named_sources() {
        let base = Message::cmd("PRIVMSG").param("#c").trailing("hi");
        let anon = Account::anonymous("a", "h");
        let (recipient, _rx) = handle_with_caps(Uuid::new_v4(), &["message-tags", "account-tag"]);

        let tagged = tag_for_recipient(&base, &recipient, &anon, &[]);
        assert!(tagged.tags.is_empty());

        let row = crate::db::AccountRow {
            id: Uuid::new_v4(),
            username: "alice".into(),
            password_hash: "x".into(),
            created: chrono::Utc::now(),
        };
        let named = Account::from_row(&row, "h");
        let tagged = tag_for_recipient(&base, &recipient, &named, &[]);
        assert_eq!(tagged.to_string(), "@account=alice PRIVMSG #c :hi");
    }

    #[test]
    fn tags_stripped_without_cap() {
        let base = Message::cmd("PRIVMSG")
            .param("#c")
            .trailing("hi")
            .with_tag("msgid", Some("42"));
        let (plain, _rx) = handle_with_caps(Uuid::new_v4(), &[]);
        let src = Account::anonymous("a", "h");
        let out = tag_for_recipient(&base, &plain, &src, &[("msgid".into(), "42".into())]);
        assert!(out.tags.is_empty());
    }

    #[test]
    fn channel_key_requires_sigil() {
        assert_eq!(channel_key("#Rust"), Some("rust".to_string()));
        assert_eq!(channel_key("rust"), None);
    }
}
