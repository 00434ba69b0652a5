//! The runtime context.
//!
//! All process-wide state is packaged in one `Ctx` value built at startup
//! and handed to every task as `Arc<Ctx>`; nothing in the daemon is a true
//! global. Teardown order: stop acceptors, close connections, stop timers,
//! drop the registry.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::{broadcast, mpsc};
use tracing::warn;

use crate::bus::Bus;
use crate::config::Config;
use crate::db::{Database, MessageRecord};
use crate::state::conn::ConnTable;
use crate::state::registry::Registry;

/// This server's identity and protocol limits.
#[derive(Debug, Clone)]
pub struct ServerInfo {
    pub name: String,
    pub network: String,
    pub password: Option<String>,
    pub motd_file: Option<String>,
    pub nick_max_len: usize,
    pub channel_max_len: usize,
    pub idle_timeout_secs: u64,
    pub max_per_ip: u32,
}

pub struct Ctx {
    pub registry: Registry,
    pub conns: ConnTable,
    pub bus: Bus,
    pub db: Database,
    pub server_info: ServerInfo,
    /// Fans out the shutdown signal to every task.
    pub shutdown: broadcast::Sender<()>,
    per_ip: Mutex<HashMap<IpAddr, u32>>,
    message_queue: mpsc::Sender<MessageRecord>,
    motd_cache: Mutex<(String, Option<SystemTime>)>,
}

impl Ctx {
    /// Build the context. The returned receiver feeds the message writer
    /// task that drains queued rows into the repository.
    pub fn new(config: &Config, db: Database) -> (Arc<Self>, mpsc::Receiver<MessageRecord>) {
        let (shutdown, _) = broadcast::channel(8);
        let (message_tx, message_rx) = mpsc::channel(4096);

        let ctx = Ctx {
            registry: Registry::new(),
            conns: ConnTable::new(),
            bus: Bus::new(),
            db,
            server_info: ServerInfo {
                name: config.server.name.clone(),
                network: config.server.network.clone(),
                password: config.server.password.clone(),
                motd_file: config.server.motd_file.clone(),
                nick_max_len: config.server.nick_max_len,
                channel_max_len: config.server.channel_max_len,
                idle_timeout_secs: config.server.idle_timeout_secs,
                max_per_ip: config.server.max_per_ip,
            },
            shutdown,
            per_ip: Mutex::new(HashMap::new()),
            message_queue: message_tx,
            motd_cache: Mutex::new((String::new(), None)),
        };
        (Arc::new(ctx), message_rx)
    }

    /// Count a new connection from `ip`. False means the per-IP cap is hit
    /// and the caller must drop the socket.
    pub fn try_acquire_ip(&self, ip: IpAddr) -> bool {
        let mut per_ip = self.per_ip.lock();
        let count = per_ip.entry(ip).or_insert(0);
        if *count >= self.server_info.max_per_ip {
            return false;
        }
        *count += 1;
        true
    }

    pub fn release_ip(&self, ip: IpAddr) {
        let mut per_ip = self.per_ip.lock();
        if let Some(count) = per_ip.get_mut(&ip) {
            *count -= 1;
            if *count == 0 {
                per_ip.remove(&ip);
            }
        }
    }

    /// Queue a message row for the batched repository insert. A full queue
    /// drops the row; chat keeps flowing.
    pub fn queue_message(&self, record: MessageRecord) {
        if self.message_queue.try_send(record).is_err() {
            warn!("message persistence queue full, dropping row");
        }
    }

    /// The MOTD text, re-read when the backing file's mtime changes.
    pub fn motd(&self) -> String {
        let Some(path) = self.server_info.motd_file.as_deref() else {
            return "Welcome!".to_string();
        };

        let modified = std::fs::metadata(path).and_then(|m| m.modified()).ok();
        let mut cache = self.motd_cache.lock();
        if cache.1 == modified && modified.is_some() {
            return cache.0.clone();
        }

        let text = std::fs::read_to_string(path).unwrap_or_else(|e| {
            warn!(path = %path, error = %e, "failed to read MOTD file");
            "Welcome!".to_string()
        });
        *cache = (text.clone(), modified);
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn ctx() -> Arc<Ctx> {
        let db = Database::connect(":memory:").await.unwrap();
        let mut config = Config::default();
        config.server.max_per_ip = 2;
        Ctx::new(&config, db).0
    }

    #[tokio::test]
    async fn per_ip_counter_caps_and_releases() {
        let ctx = ctx().await;
        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        assert!(ctx.try_acquire_ip(ip));
        assert!(ctx.try_acquire_ip(ip));
        assert!(!ctx.try_acquire_ip(ip));
        ctx.release_ip(ip);
        assert!(ctx.try_acquire_ip(ip));
    }

    #[tokio::test]
    async fn distinct_ips_do_not_interfere() {
        let ctx = ctx().await;
        let a: IpAddr = "10.0.0.1".parse().unwrap();
        let b: IpAddr = "10.0.0.2".parse().unwrap();
        assert!(ctx.try_acquire_ip(a));
        assert!(ctx.try_acquire_ip(a));
        assert!(!ctx.try_acquire_ip(a));
        assert!(ctx.try_acquire_ip(b));
    }

    #[tokio::test]
    async fn motd_defaults_without_file() {
        let ctx = ctx().await;
        assert_eq!(ctx.motd(), "Welcome!");
    }
}
