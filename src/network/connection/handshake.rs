//! The greet phase: registration commands and finalisation.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{info, warn};

use chatter_proto::{irc_to_lower, Message, Numeric, Prefix, Transport};

use crate::error::HandlerError;
use crate::handlers::channel::perform_join;
use crate::handlers::helpers::server_reply;
use crate::handlers::server_query::{send_lusers, send_motd};
use crate::handlers::{CommandSet, Context, Phase, Session, SetupTasks};
use crate::state::account::Account;
use crate::state::conn::ConnHandle;
use crate::state::ctx::Ctx;
use crate::state::modes::UserMode;

use super::{dispatch_line, drain_outbound, hangup_on};

enum FinalizeOutcome {
    /// Welcome burst sent, move to Ready.
    Ready,
    /// Something bounced (nick race); keep greeting.
    Continue,
    /// Fatal (bad server password); hang up.
    Close,
}

/// Drive the connection until it registers. Returns true when the session
/// reached Ready, false when the peer must be dropped.
pub(super) async fn run_greet_loop(
    transport: &mut Transport,
    ctx: &Arc<Ctx>,
    commands: &CommandSet,
    session: &mut Session,
    tx: &mpsc::Sender<Arc<Message>>,
    rx: &mut mpsc::Receiver<Arc<Message>>,
) -> bool {
    let deadline = Duration::from_secs(ctx.server_info.idle_timeout_secs);
    let started = Instant::now();
    let addr = session.addr;

    loop {
        let Some(remaining) = deadline.checked_sub(started.elapsed()) else {
            let goodbye = Message::cmd("ERROR").trailing(format!(
                "Closing Link: {} (Registration timeout)",
                addr.ip()
            ));
            let _ = transport.send(&goodbye).await;
            return false;
        };

        let line = match tokio::time::timeout(remaining, transport.next_line()).await {
            Err(_) => continue, // deadline check at the top fires
            Ok(None) => return false,
            Ok(Some(Err(e))) => {
                hangup_on(transport, &e).await;
                return false;
            }
            Ok(Some(Ok(line))) => line,
        };

        let result = dispatch_line(ctx, commands, session, tx, &addr, line).await;
        if drain_outbound(transport, rx).await.is_err() {
            return false;
        }
        match result {
            Ok(()) => {}
            Err(HandlerError::Quit(reason)) => {
                let text = match reason {
                    Some(reason) => format!("Closing Link: {} (Quit: {reason})", addr.ip()),
                    None => format!("Closing Link: {} (Client Quit)", addr.ip()),
                };
                let _ = transport.send(&Message::cmd("ERROR").trailing(text)).await;
                return false;
            }
            Err(HandlerError::AccessDenied) | Err(HandlerError::Send(_)) => return false,
            Err(_) => {}
        }

        if session.setup.is_empty() && !session.is_ready() {
            let outcome = finalize(ctx, session, tx).await;
            if drain_outbound(transport, rx).await.is_err() {
                return false;
            }
            match outcome {
                FinalizeOutcome::Ready => return true,
                FinalizeOutcome::Continue => {}
                FinalizeOutcome::Close => return false,
            }
        }
    }
}

/// All setup tasks cleared: check the server password, materialise the
/// account, bind the nick, attach the connection and send the welcome
/// burst.
async fn finalize(
    ctx: &Arc<Ctx>,
    session: &mut Session,
    tx: &mpsc::Sender<Arc<Message>>,
) -> FinalizeOutcome {
    let server = ctx.server_info.name.clone();

    if let Some(required) = ctx.server_info.password.as_deref() {
        if !required.is_empty() && session.pass.as_deref() != Some(required) {
            let reply = server_reply(
                &server,
                Numeric::ERR_PASSWDMISMATCH,
                session.nick_or_star(),
                vec!["Password incorrect".into()],
            );
            let _ = tx.send(Arc::new(reply)).await;
            return FinalizeOutcome::Close;
        }
    }

    // no SASL bind happened: mint an anonymous account for this connection
    let mut created_here = false;
    let account = match session.account.clone() {
        Some(account) => account,
        None => {
            let nick = session.nick.clone().unwrap_or_default();
            let account = Account::anonymous(&nick, &server);
            ctx.registry.insert_account(account.clone());
            session.account = Some(account.clone());
            created_here = true;
            account
        }
    };

    // the account's nick wins over whatever the connection negotiated
    let account_nick = account.nick();
    let session_nick = session.nick.clone().unwrap_or_default();
    if !session_nick.is_empty() && session_nick != account_nick {
        let old_prefix = Prefix::nickmask(
            &session_nick,
            session.username.as_deref().unwrap_or("user"),
            &server,
        );
        let align = Message::cmd("NICK")
            .trailing(account_nick.clone())
            .with_prefix(old_prefix);
        let _ = tx.send(Arc::new(align)).await;
        session.nick = Some(account_nick.clone());
    }

    if ctx
        .registry
        .bind_nick(&irc_to_lower(&account_nick), account.id)
        .is_err()
    {
        // lost the nick race after validation; back to the greet phase
        warn!(nick = %account_nick, "nick bound while finalising");
        let reply = server_reply(
            &server,
            Numeric::ERR_NICKNAMEINUSE,
            session.nick_or_star(),
            vec![account_nick, "Nickname is already in use".into()],
        );
        let _ = tx.send(Arc::new(reply)).await;
        if created_here {
            ctx.registry.remove_account(&account);
            session.account = None;
        }
        session.setup.set(SetupTasks::NICK);
        return FinalizeOutcome::Continue;
    }

    account.add_connection(session.conn_id);
    let handle = ConnHandle::new(
        session.conn_id,
        session.addr.ip(),
        account.id,
        tx.clone(),
        session.caps.clone(),
    );
    ctx.conns.insert(handle.clone());
    session.handle = Some(handle.clone());

    if welcome_burst(ctx, session, tx).await.is_err() {
        return FinalizeOutcome::Close;
    }

    if session.logged_in {
        handle.user_modes.lock().set(UserMode::Registered);
        let mode = Message::cmd("MODE")
            .param(account.nick())
            .trailing("+r")
            .with_prefix(Prefix::ServerName(server.clone()));
        let _ = tx.send(Arc::new(mode)).await;
    }

    // replay persisted memberships through the ordinary join path
    for channel in account.channels_snapshot() {
        perform_join(ctx, &account, &channel.name(), true).await;
    }

    session.phase = Phase::Ready;
    info!(nick = %account.nick(), account = %account.id, "registration finalised");
    FinalizeOutcome::Ready
}

/// Numerics 001-005 plus LUSERS and MOTD.
async fn welcome_burst(
    ctx: &Arc<Ctx>,
    session: &mut Session,
    tx: &mpsc::Sender<Arc<Message>>,
) -> Result<(), HandlerError> {
    let server = ctx.server_info.name.clone();
    let network = ctx.server_info.network.clone();
    let mut hctx = Context {
        ctx,
        session,
        sender: tx,
    };

    hctx.numeric(Numeric::RPL_WELCOME, vec!["Hi, welcome to IRC".into()])
        .await?;
    hctx.numeric(
        Numeric::RPL_YOURHOST,
        vec![format!(
            "Your host is {server}, running version chatterd-0.3"
        )],
    )
    .await?;
    hctx.numeric(
        Numeric::RPL_CREATED,
        vec!["This server was created Dec 21 1989 at 13:37:00 (lie)".into()],
    )
    .await?;
    hctx.numeric(
        Numeric::RPL_MYINFO,
        vec![
            server.clone(),
            "chatterd-0.3".into(),
            "ixRBdrgpTzoOwsaS".into(),
            "ImnqstbklCEMRU".into(),
        ],
    )
    .await?;

    // ISUPPORT, split over two lines
    let isupport_head = [
        "CASEMAPPING=ascii".to_string(),
        "CHANTYPES=#".into(),
        "CHANNELLEN=64".into(),
        "NICKLEN=32".into(),
        "PREFIX=(qaohv)~&@%+".into(),
        "STATUSMSG=~&@%+".into(),
        "TOPICLEN=390".into(),
        "MAXTARGETS=4".into(),
        "MAXLIST=beI:60".into(),
        "CHANMODES=Ibe,k,fl,CEMRUimnstu".into(),
    ];
    let isupport_tail = [
        format!("NETWORK={network}"),
        "UTF8MAPPING=rfc8265".into(),
        "EXTBAN=,m".into(),
        "BOT=B".into(),
        "EXCEPTS".into(),
        "INVEX".into(),
        "SAFELIST".into(),
        "UTF8ONLY".into(),
        "WHOX".into(),
    ];
    for tokens in [&isupport_head[..], &isupport_tail[..]] {
        let mut params: Vec<String> = tokens.to_vec();
        params.push("are supported by this server".into());
        hctx.numeric(Numeric::RPL_ISUPPORT, params).await?;
    }

    send_lusers(&mut hctx).await?;
    send_motd(&mut hctx).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::db::Database;
    use crate::handlers::CommandSet;
    use chatter_proto::Transport;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::{TcpListener, TcpStream};

    async fn ctx_with(configure: impl FnOnce(&mut Config)) -> Arc<Ctx> {
        let db = Database::connect(":memory:").await.unwrap();
        let mut config = Config::default();
        configure(&mut config);
        Ctx::new(&config, db).0
    }

    /// Accept one peer and drive the greet phase to completion.
    async fn greet_one(ctx: Arc<Ctx>, listener: TcpListener) -> (bool, Session) {
        let (stream, addr) = listener.accept().await.unwrap();
        let mut transport = Transport::tcp(stream);
        let (tx, mut rx) = mpsc::channel(256);
        let mut session = Session::new(uuid::Uuid::new_v4(), addr);
        let commands = CommandSet::new();
        let ok = run_greet_loop(&mut transport, &ctx, &commands, &mut session, &tx, &mut rx).await;
        transport.shutdown().await;
        (ok, session)
    }

    #[tokio::test]
    async fn registration_reaches_ready_and_binds_the_nick() {
        let ctx = ctx_with(|_| {}).await;
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = tokio::spawn(async move {
            let mut sock = TcpStream::connect(addr).await.unwrap();
            sock.write_all(b"CAP LS 302\r\nNICK alice\r\nUSER alice 0 * :Alice\r\nCAP END\r\n")
                .await
                .unwrap();
            let mut lines = BufReader::new(sock).lines();
            let mut seen = Vec::new();
            while let Ok(Some(line)) = lines.next_line().await {
                seen.push(line.clone());
                if line.contains(" 376 ") {
                    break;
                }
            }
            seen
        });

        let (ok, session) = greet_one(ctx.clone(), listener).await;
        assert!(ok);
        assert!(session.is_ready());

        // the folded nick resolves to a fresh anonymous account
        let account = ctx.registry.lookup_nick("alice").unwrap();
        assert!(!account.is_named());
        assert_eq!(account.nick(), "alice");

        let seen = client.await.unwrap();
        for code in [" 001 ", " 002 ", " 003 ", " 004 ", " 005 ", " 251 ", " 375 ", " 376 "] {
            assert!(seen.iter().any(|l| l.contains(code)), "missing {code}");
        }
        assert!(seen.iter().any(|l| l.contains("CASEMAPPING=ascii")));
        assert!(seen.iter().any(|l| l.contains("CHANNELLEN=64")));
    }

    #[tokio::test]
    async fn wrong_server_password_is_464_and_close() {
        let ctx = ctx_with(|c| c.server.password = Some("sekrit".into())).await;
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = tokio::spawn(async move {
            let mut sock = TcpStream::connect(addr).await.unwrap();
            sock.write_all(b"PASS wrong\r\nCAP END\r\nNICK alice\r\nUSER a 0 * :A\r\n")
                .await
                .unwrap();
            let mut lines = BufReader::new(sock).lines();
            let mut seen = Vec::new();
            while let Ok(Some(line)) = lines.next_line().await {
                seen.push(line);
            }
            seen
        });

        let (ok, _session) = greet_one(ctx.clone(), listener).await;
        assert!(!ok);
        let seen = client.await.unwrap();
        assert!(seen.iter().any(|l| l.contains(" 464 ")));
        assert!(ctx.registry.lookup_nick("alice").is_none());
    }

    #[tokio::test]
    async fn sasl_login_registers_against_the_stored_account() {
        use base64::Engine;
        let ctx = ctx_with(|_| {}).await;

        let hash = crate::db::passwd::hash("pw").unwrap();
        let row = crate::db::AccountRow {
            id: uuid::Uuid::new_v4(),
            username: "alice".into(),
            password_hash: hash,
            created: chrono::Utc::now(),
        };
        let stored = Account::from_row(&row, "chatter.local");
        ctx.registry.insert_account(stored.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let payload = base64::engine::general_purpose::STANDARD.encode(b"\0alice\0pw");

        let client = tokio::spawn(async move {
            let mut sock = TcpStream::connect(addr).await.unwrap();
            let script = format!(
                "CAP LS 302\r\nCAP REQ :sasl\r\nAUTHENTICATE PLAIN\r\nAUTHENTICATE {payload}\r\nCAP END\r\nNICK alice\r\nUSER alice 0 * :Alice\r\n"
            );
            sock.write_all(script.as_bytes()).await.unwrap();
            let mut lines = BufReader::new(sock).lines();
            let mut seen = Vec::new();
            while let Ok(Some(line)) = lines.next_line().await {
                seen.push(line.clone());
                if line.contains(" 376 ") {
                    break;
                }
            }
            seen
        });

        let (ok, session) = greet_one(ctx.clone(), listener).await;
        assert!(ok);
        assert!(session.logged_in);

        // no anonymous account was minted, the stored one owns the nick
        let bound = ctx.registry.lookup_nick("alice").unwrap();
        assert_eq!(bound.id, stored.id);
        assert_eq!(ctx.registry.account_count(), 1);

        let seen = client.await.unwrap();
        let pos_900 = seen.iter().position(|l| l.contains(" 900 ")).unwrap();
        let pos_903 = seen.iter().position(|l| l.contains(" 903 ")).unwrap();
        assert!(pos_900 < pos_903);
        // a logged-in finalisation flags the registered user mode
        assert!(seen.iter().any(|l| l.contains("MODE alice :+r")));
    }

    #[tokio::test]
    async fn auto_join_replays_persisted_memberships() {
        let ctx = ctx_with(|_| {}).await;

        let hash = crate::db::passwd::hash("pw").unwrap();
        let row = crate::db::AccountRow {
            id: uuid::Uuid::new_v4(),
            username: "alice".into(),
            password_hash: hash,
            created: chrono::Utc::now(),
        };
        let stored = Account::from_row(&row, "chatter.local");
        ctx.registry.insert_account(stored.clone());

        // membership restored at preload time
        let channel = ctx.registry.get_or_create_channel("lounge");
        channel.add_member(stored.id);
        stored.add_channel("lounge", channel);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        use base64::Engine;
        let payload = base64::engine::general_purpose::STANDARD.encode(b"\0alice\0pw");

        let client = tokio::spawn(async move {
            let mut sock = TcpStream::connect(addr).await.unwrap();
            let script = format!(
                "AUTHENTICATE PLAIN\r\nAUTHENTICATE {payload}\r\nCAP END\r\nNICK alice\r\nUSER alice 0 * :Alice\r\n"
            );
            sock.write_all(script.as_bytes()).await.unwrap();
            let mut lines = BufReader::new(sock).lines();
            let mut seen = Vec::new();
            while let Ok(Some(line)) = lines.next_line().await {
                seen.push(line.clone());
                if line.contains("End of NAMES list") {
                    break;
                }
            }
            seen
        });

        let (ok, _session) = greet_one(ctx.clone(), listener).await;
        assert!(ok);

        let seen = client.await.unwrap();
        assert!(seen.iter().any(|l| l.contains("JOIN :#lounge")));
        assert!(seen.iter().any(|l| l.contains(" 353 ")));
    }
}
