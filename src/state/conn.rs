//! Live connection handles.
//!
//! A connection is owned by its task; everything other tasks may touch
//! lives in the [`ConnHandle`] registered here at finalisation. Cross-task
//! delivery is message-passing only: frames are enqueued on the handle's
//! outbound channel and written by the owning task.

use chatter_proto::Message;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::state::modes::UserModeSet;

/// The shared face of one registered connection.
pub struct ConnHandle {
    pub id: Uuid,
    pub addr: IpAddr,
    /// Owning account. Rewritten when a SASL merge adopts the connection.
    pub account: Mutex<Uuid>,
    /// Outbound frame queue, drained by the connection task.
    pub tx: mpsc::Sender<Arc<Message>>,
    /// Capabilities negotiated before registration. Fixed afterwards.
    pub caps: HashSet<String>,
    pub user_modes: Mutex<UserModeSet>,
    /// Seconds-since-epoch of the last inbound frame.
    last_activity: AtomicU64,
    /// Folded channel name -> accounts this connection has seen there.
    /// A superset optimisation for join/part dedup, nothing more.
    mirror: Mutex<HashMap<String, HashSet<Uuid>>>,
}

impl ConnHandle {
    pub fn new(
        id: Uuid,
        addr: IpAddr,
        account: Uuid,
        tx: mpsc::Sender<Arc<Message>>,
        caps: HashSet<String>,
    ) -> Arc<Self> {
        let handle = ConnHandle {
            id,
            addr,
            account: Mutex::new(account),
            tx,
            caps,
            user_modes: Mutex::new(UserModeSet::default()),
            last_activity: AtomicU64::new(now_secs()),
            mirror: Mutex::new(HashMap::new()),
        };
        Arc::new(handle)
    }

    pub fn has_cap(&self, cap: &str) -> bool {
        self.caps.contains(cap)
    }

    pub fn account_id(&self) -> Uuid {
        *self.account.lock()
    }

    pub fn set_account(&self, account: Uuid) {
        *self.account.lock() = account;
    }

    pub fn touch(&self) {
        self.last_activity.store(now_secs(), Ordering::Relaxed);
    }

    pub fn idle_secs(&self) -> u64 {
        now_secs().saturating_sub(self.last_activity.load(Ordering::Relaxed))
    }

    /// Enqueue a frame without blocking. A full queue or a gone receiver
    /// drops the frame - lost broadcasts are not retried.
    pub fn enqueue(&self, msg: &Arc<Message>) {
        let _ = self.tx.try_send(msg.clone());
    }

    // --- seen-members mirror ---

    /// Whether this connection has produced its own view of the channel.
    pub fn mirrors_channel(&self, folded: &str) -> bool {
        self.mirror.lock().contains_key(folded)
    }

    /// Install the channel in the mirror with an initial member set.
    pub fn mirror_channel(&self, folded: &str, members: impl IntoIterator<Item = Uuid>) {
        self.mirror
            .lock()
            .insert(folded.to_string(), members.into_iter().collect());
    }

    /// Record an account as seen in a channel. Returns false when it was
    /// already there (the caller skips the duplicate broadcast).
    pub fn mirror_see(&self, folded: &str, account: Uuid) -> bool {
        self.mirror
            .lock()
            .entry(folded.to_string())
            .or_default()
            .insert(account)
    }

    pub fn mirror_forget_member(&self, folded: &str, account: Uuid) {
        if let Some(seen) = self.mirror.lock().get_mut(folded) {
            seen.remove(&account);
        }
    }

    pub fn mirror_forget_channel(&self, folded: &str) {
        self.mirror.lock().remove(folded);
    }

    pub fn mirror_rename_channel(&self, old_folded: &str, new_folded: &str) {
        let mut mirror = self.mirror.lock();
        if let Some(seen) = mirror.remove(old_folded) {
            mirror.insert(new_folded.to_string(), seen);
        }
    }
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// All registered connections, keyed by connection id.
#[derive(Default)]
pub struct ConnTable {
    conns: DashMap<Uuid, Arc<ConnHandle>>,
}

impl ConnTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, handle: Arc<ConnHandle>) {
        self.conns.insert(handle.id, handle);
    }

    pub fn remove(&self, id: Uuid) -> Option<Arc<ConnHandle>> {
        self.conns.remove(&id).map(|(_, h)| h)
    }

    pub fn get(&self, id: Uuid) -> Option<Arc<ConnHandle>> {
        self.conns.get(&id).map(|r| r.value().clone())
    }

    pub fn len(&self) -> usize {
        self.conns.len()
    }

    /// Snapshot of every live handle, for the keepalive and reaper timers.
    pub fn snapshot(&self) -> Vec<Arc<ConnHandle>> {
        self.conns.iter().map(|r| r.value().clone()).collect()
    }
}
