//! The account entity.
//!
//! Accounts are shared through the registry as `Arc<Account>`; per-entity
//! mutation goes through the internal reader-writer lock. Critical sections
//! hold only references, never I/O handles.

use chatter_proto::Prefix;
use chrono::{DateTime, Utc};
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::db::AccountRow;
use crate::state::channel::Channel;

/// Mutable account state, guarded by the account's lock.
#[derive(Debug, Default)]
pub struct AccountState {
    pub nick: String,
    /// Persisted username. `None` marks an anonymous in-memory account.
    pub username: Option<String>,
    pub password_hash: Option<String>,
    /// Display host used in the `nick!user@host` prefix.
    pub host: String,
    pub created: Option<DateTime<Utc>>,
    /// Live connection ids attached to this account.
    pub connections: Vec<Uuid>,
    /// Folded channel name -> channel. Mirrors channel member sets.
    pub channels: HashMap<String, Arc<Channel>>,
}

pub struct Account {
    pub id: Uuid,
    state: RwLock<AccountState>,
}

impl Account {
    /// A fresh anonymous account, created at finalisation when SASL did not
    /// run. It lives only in memory and dies with its last connection.
    pub fn anonymous(nick: &str, host: &str) -> Arc<Self> {
        Arc::new(Account {
            id: Uuid::new_v4(),
            state: RwLock::new(AccountState {
                nick: nick.to_string(),
                host: host.to_string(),
                created: Some(Utc::now()),
                ..Default::default()
            }),
        })
    }

    /// Materialise a persisted account. The nick starts as the username,
    /// matching what clients expect to address after a fresh boot.
    pub fn from_row(row: &AccountRow, host: &str) -> Arc<Self> {
        Arc::new(Account {
            id: row.id,
            state: RwLock::new(AccountState {
                nick: row.username.clone(),
                username: Some(row.username.clone()),
                password_hash: Some(row.password_hash.clone()),
                host: host.to_string(),
                created: Some(row.created),
                ..Default::default()
            }),
        })
    }

    pub fn read(&self) -> RwLockReadGuard<'_, AccountState> {
        self.state.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, AccountState> {
        self.state.write()
    }

    pub fn nick(&self) -> String {
        let state = self.state.read();
        if state.nick.is_empty() {
            "*".to_string()
        } else {
            state.nick.clone()
        }
    }

    pub fn username(&self) -> Option<String> {
        self.state.read().username.clone()
    }

    pub fn password_hash(&self) -> Option<String> {
        self.state.read().password_hash.clone()
    }

    /// Whether this account survives its last connection.
    pub fn is_named(&self) -> bool {
        self.state.read().username.is_some()
    }

    /// `nick!user@host` with the current nick.
    pub fn prefix(&self) -> Prefix {
        let state = self.state.read();
        let user = state.username.as_deref().unwrap_or("user");
        Prefix::nickmask(
            if state.nick.is_empty() { "*" } else { &state.nick },
            user,
            &state.host,
        )
    }

    /// `nick!user@host` with an explicit (usually old) nick.
    pub fn prefix_with_nick(&self, nick: &str) -> Prefix {
        let state = self.state.read();
        let user = state.username.as_deref().unwrap_or("user");
        Prefix::nickmask(nick, user, &state.host)
    }

    pub fn connection_ids(&self) -> Vec<Uuid> {
        self.state.read().connections.clone()
    }

    pub fn add_connection(&self, conn_id: Uuid) {
        let mut state = self.state.write();
        if !state.connections.contains(&conn_id) {
            state.connections.push(conn_id);
        }
    }

    /// Detach a connection. Returns the number still attached.
    pub fn remove_connection(&self, conn_id: Uuid) -> usize {
        let mut state = self.state.write();
        state.connections.retain(|c| *c != conn_id);
        state.connections.len()
    }

    pub fn add_channel(&self, folded: &str, channel: Arc<Channel>) {
        self.state
            .write()
            .channels
            .insert(folded.to_string(), channel);
    }

    pub fn remove_channel(&self, folded: &str) {
        self.state.write().channels.remove(folded);
    }

    pub fn channels_snapshot(&self) -> Vec<Arc<Channel>> {
        self.state.read().channels.values().cloned().collect()
    }
}

impl std::fmt::Debug for Account {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("Account")
            .field("id", &self.id)
            .field("nick", &state.nick)
            .field("username", &state.username)
            .field("connections", &state.connections.len())
            .finish()
    }
}
