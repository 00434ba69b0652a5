//! chatterd - a multi-tenant IRC chat daemon.
//!
//! Raw TCP and WebSocket transports feed the same connection state
//! machine, backed by an in-memory entity registry preloaded from SQLite.

mod bus;
mod config;
mod db;
mod error;
mod handlers;
mod network;
mod state;
mod telemetry;

use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

use chatter_proto::irc_to_lower;

use crate::config::Config;
use crate::db::{Database, MessageRecord};
use crate::handlers::CommandSet;
use crate::network::{Gateway, ListenerKind};
use crate::state::account::Account;
use crate::state::catalog::{PermissionEntry, RoleEntry, ServerEntry};
use crate::state::channel::Channel;
use crate::state::ctx::Ctx;

#[derive(Debug, Parser)]
#[command(name = "chatterd", about = "Multi-tenant IRC chat daemon")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "chatterd.toml")]
    config: String,

    /// Raw TCP IRC port.
    #[arg(long)]
    port: Option<u16>,

    /// Server password.
    #[arg(long)]
    password: Option<String>,

    /// WebSocket port, 0 to disable.
    #[arg(long)]
    web: Option<u16>,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut config = Config::load(&cli.config)?;
    if let Some(port) = cli.port {
        config.listen.port = port;
    }
    if let Some(password) = cli.password {
        config.server.password = Some(password);
    }
    if let Some(web) = cli.web {
        config.listen.ws_port = web;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.server.workers.max(1))
        .enable_all()
        .build()?;
    runtime.block_on(run(config))
}

async fn run(config: Config) -> anyhow::Result<()> {
    telemetry::init(config.server.log_format);
    info!(
        server = %config.server.name,
        network = %config.server.network,
        "starting chatterd"
    );

    let db = Database::connect(&config.database.path).await?;
    let (ctx, message_rx) = Ctx::new(&config, db.clone());

    preload(&ctx, &db).await?;

    spawn_message_writer(Arc::clone(&ctx), db, message_rx);
    network::timers::spawn_keepalive(Arc::clone(&ctx));
    network::timers::spawn_reaper(Arc::clone(&ctx));

    // signal handler for graceful shutdown
    {
        let shutdown = ctx.shutdown.clone();
        tokio::spawn(async move {
            use tokio::signal::unix::{signal, SignalKind};
            let Ok(mut sigint) = signal(SignalKind::interrupt()) else {
                return;
            };
            let Ok(mut sigterm) = signal(SignalKind::terminate()) else {
                return;
            };
            tokio::select! {
                _ = sigint.recv() => info!("received SIGINT, shutting down"),
                _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
            }
            let _ = shutdown.send(());
        });
    }

    let commands = Arc::new(CommandSet::new());

    let tcp = Gateway::bind(
        config.listen.tcp_addr(),
        ListenerKind::Tcp,
        Arc::clone(&ctx),
        Arc::clone(&commands),
    )
    .await?;

    if config.listen.ws_port != 0 {
        let ws = Gateway::bind(
            config.listen.ws_addr(),
            ListenerKind::WebSocket,
            Arc::clone(&ctx),
            Arc::clone(&commands),
        )
        .await?;
        let (tcp_done, ws_done) = tokio::join!(tcp.run(), ws.run());
        tcp_done?;
        ws_done?;
    } else {
        info!("WebSocket listener disabled");
        tcp.run().await?;
    }

    // leave the connection tasks a moment to flush their goodbyes
    tokio::time::sleep(Duration::from_millis(500)).await;
    info!("shutdown complete");
    Ok(())
}

/// Load the persisted world into the registry: accounts, channels and
/// their member sets, then servers, roles and permissions.
async fn preload(ctx: &Arc<Ctx>, db: &Database) -> anyhow::Result<()> {
    let host = ctx.server_info.name.clone();

    let accounts = db.load_all_accounts().await?;
    let account_count = accounts.len();
    for row in &accounts {
        ctx.registry.insert_account(Account::from_row(row, &host));
    }

    let channels = db.load_all_channels().await?;
    let channel_count = channels.len();
    for row in &channels {
        let channel = Channel::from_row(row);
        ctx.registry.insert_channel(channel.clone());
        let folded = irc_to_lower(&row.name);
        for member in db.load_channel_members(row.id).await? {
            if let Some(account) = ctx.registry.lookup_account_by_uuid(member.id) {
                channel.add_member(account.id);
                account.add_channel(&folded, channel.clone());
            }
        }
    }

    for row in db.load_all_servers().await? {
        ctx.registry.insert_server(Arc::new(ServerEntry {
            id: row.id,
            name: row.name,
            owner: row.owner,
            members: row.members,
            channels: row.channels,
            created: row.created,
        }));
    }
    for row in db.load_all_roles().await? {
        ctx.registry.insert_role(Arc::new(RoleEntry {
            id: row.id,
            name: row.name,
            priority: row.priority,
            color: row.color,
            permissions: row.permissions as u64,
        }));
    }
    for row in db.load_all_permissions().await? {
        ctx.registry.insert_permission(Arc::new(PermissionEntry {
            id: row.id,
            name: row.name,
            bit: row.bit as u64,
        }));
    }

    info!(
        accounts = account_count,
        channels = channel_count,
        "registry preloaded"
    );
    Ok(())
}

/// Drain queued message rows into the repository once a second, with a
/// final flush on shutdown.
fn spawn_message_writer(ctx: Arc<Ctx>, db: Database, mut rx: mpsc::Receiver<MessageRecord>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        let mut shutdown_rx = ctx.shutdown.subscribe();
        let mut pending: Vec<MessageRecord> = Vec::new();

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    while let Ok(record) = rx.try_recv() {
                        pending.push(record);
                    }
                    if !pending.is_empty() {
                        if let Err(e) = db.insert_messages(&pending).await {
                            warn!(error = %e, count = pending.len(), "message flush failed");
                        }
                        pending.clear();
                    }
                }
                _ = shutdown_rx.recv() => {
                    while let Ok(record) = rx.try_recv() {
                        pending.push(record);
                    }
                    if !pending.is_empty() {
                        if let Err(e) = db.insert_messages(&pending).await {
                            warn!(error = %e, "final message flush failed");
                        }
                    }
                    info!("message writer stopping");
                    break;
                }
            }
        }
    });
}
