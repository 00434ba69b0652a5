//! Keepalive pings and the idle reaper.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use chatter_proto::Message;

use crate::state::ctx::Ctx;

/// Seconds of grace past the idle timeout before the reaper closes a
/// connection.
const REAP_GRACE_SECS: u64 = 3;

const REAPER_TICK_SECS: u64 = 5;

/// Ping every live connection once per idle cycle, spread over 4 equal
/// batches so a large server does not burst its writes.
pub fn spawn_keepalive(ctx: Arc<Ctx>) {
    tokio::spawn(async move {
        let cycle = ctx.server_info.idle_timeout_secs;
        let mut interval = tokio::time::interval(Duration::from_secs((cycle / 4).max(1)));
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut shutdown_rx = ctx.shutdown.subscribe();
        let mut batch: u128 = 0;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let ping = Arc::new(
                        Message::cmd("PING").trailing(ctx.server_info.name.clone()),
                    );
                    for handle in ctx.conns.snapshot() {
                        if handle.id.as_u128() % 4 == batch % 4 {
                            handle.enqueue(&ping);
                        }
                    }
                    batch += 1;
                }
                _ = shutdown_rx.recv() => {
                    info!("keepalive timer stopping");
                    break;
                }
            }
        }
    });
}

/// Disconnect connections whose last activity is older than the idle
/// timeout, with a short grace.
pub fn spawn_reaper(ctx: Arc<Ctx>) {
    tokio::spawn(async move {
        let limit = ctx.server_info.idle_timeout_secs + REAP_GRACE_SECS;
        let mut interval = tokio::time::interval(Duration::from_secs(REAPER_TICK_SECS));
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut shutdown_rx = ctx.shutdown.subscribe();

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    for handle in ctx.conns.snapshot() {
                        let idle = handle.idle_secs();
                        if idle > limit {
                            debug!(conn = %handle.id, idle_secs = idle, "reaping idle connection");
                            // the ERROR frame makes the owning task close
                            let goodbye = Arc::new(Message::cmd("ERROR").trailing(format!(
                                "Closing Link: {} (Ping timeout: {idle} seconds)",
                                handle.addr
                            )));
                            handle.enqueue(&goodbye);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("idle reaper stopping");
                    break;
                }
            }
        }
    });
}
