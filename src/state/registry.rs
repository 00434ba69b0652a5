//! The live entity registry.
//!
//! Four lookup tables behind a single reader-writer lock: accounts by id,
//! accounts by username (case-sensitive), channels by folded name, and the
//! folded-nick index. Lookups take the shared mode; insert, remove, merge
//! and rebind take exclusive. Lock order is registry first, entity second -
//! never acquire the registry while holding an entity lock.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use chatter_proto::irc_to_lower;

use crate::error::RegistryError;
use crate::state::account::Account;
use crate::state::catalog::{PermissionEntry, RoleEntry, ServerEntry};
use crate::state::channel::Channel;

#[derive(Default)]
struct Tables {
    accounts_by_id: HashMap<Uuid, Arc<Account>>,
    accounts_by_name: HashMap<String, Arc<Account>>,
    channels_by_name: HashMap<String, Arc<Channel>>,
    /// Folded nick -> owning account id. At most one account per nick.
    nicks: HashMap<String, Uuid>,
    servers: HashMap<Uuid, Arc<ServerEntry>>,
    roles: HashMap<Uuid, Arc<RoleEntry>>,
    permissions: HashMap<Uuid, Arc<PermissionEntry>>,
}

#[derive(Default)]
pub struct Registry {
    tables: RwLock<Tables>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    // --- lookups (shared mode) ---

    pub fn lookup_account_by_uuid(&self, id: Uuid) -> Option<Arc<Account>> {
        self.tables.read().accounts_by_id.get(&id).cloned()
    }

    pub fn lookup_account_by_name(&self, username: &str) -> Option<Arc<Account>> {
        self.tables.read().accounts_by_name.get(username).cloned()
    }

    /// Resolve a folded nick to its account.
    pub fn lookup_nick(&self, folded: &str) -> Option<Arc<Account>> {
        let tables = self.tables.read();
        let id = tables.nicks.get(folded)?;
        tables.accounts_by_id.get(id).cloned()
    }

    /// The account id a folded nick is bound to, if any.
    pub fn nick_binding(&self, folded: &str) -> Option<Uuid> {
        self.tables.read().nicks.get(folded).copied()
    }

    pub fn lookup_channel_by_name(&self, name: &str) -> Option<Arc<Channel>> {
        self.tables
            .read()
            .channels_by_name
            .get(&irc_to_lower(name))
            .cloned()
    }

    // --- mutation (exclusive mode) ---

    pub fn insert_account(&self, account: Arc<Account>) {
        let mut tables = self.tables.write();
        if let Some(username) = account.username() {
            tables.accounts_by_name.insert(username, account.clone());
        }
        tables.accounts_by_id.insert(account.id, account);
    }

    /// Drop an account and any nick bound to it.
    pub fn remove_account(&self, account: &Arc<Account>) {
        let mut tables = self.tables.write();
        tables.accounts_by_id.remove(&account.id);
        if let Some(username) = account.username() {
            tables.accounts_by_name.remove(&username);
        }
        tables.nicks.retain(|_, id| *id != account.id);
    }

    /// Bind a folded nick at finalisation. Fails when another account holds
    /// the nick; rebinding to the same account is a no-op.
    pub fn bind_nick(&self, folded: &str, account: Uuid) -> Result<(), RegistryError> {
        let mut tables = self.tables.write();
        match tables.nicks.get(folded) {
            Some(owner) if *owner != account => Err(RegistryError::NickInUse),
            _ => {
                tables.nicks.insert(folded.to_string(), account);
                Ok(())
            }
        }
    }

    /// Atomic compare-and-swap of the nick binding. After a successful
    /// return every lookup observes the new binding and the old one (when
    /// different) is gone.
    pub fn rebind_nick(
        &self,
        old_folded: &str,
        new_folded: &str,
        account: Uuid,
    ) -> Result<(), RegistryError> {
        let mut tables = self.tables.write();
        if let Some(owner) = tables.nicks.get(new_folded) {
            if *owner != account {
                return Err(RegistryError::NickInUse);
            }
        }
        if tables.nicks.get(old_folded) == Some(&account) {
            tables.nicks.remove(old_folded);
        }
        tables.nicks.insert(new_folded.to_string(), account);
        Ok(())
    }

    /// Remove a nick binding, only if it belongs to the given account.
    pub fn unbind_nick(&self, folded: &str, account: Uuid) {
        let mut tables = self.tables.write();
        if tables.nicks.get(folded) == Some(&account) {
            tables.nicks.remove(folded);
        }
    }

    pub fn insert_channel(&self, channel: Arc<Channel>) {
        let folded = irc_to_lower(&channel.name());
        self.tables.write().channels_by_name.insert(folded, channel);
    }

    /// Look up a channel, creating an anonymous one on first join. Two
    /// racing calls with the same name observe the same handle.
    pub fn get_or_create_channel(&self, name: &str) -> Arc<Channel> {
        let folded = irc_to_lower(name);
        let mut tables = self.tables.write();
        if let Some(existing) = tables.channels_by_name.get(&folded) {
            return existing.clone();
        }
        let channel = Channel::anonymous(name);
        tables.channels_by_name.insert(folded, channel.clone());
        channel
    }

    /// Drop a channel that went empty, unless a database row backs it.
    pub fn remove_channel_if_dead(&self, channel: &Arc<Channel>) -> bool {
        if channel.persisted {
            return false;
        }
        let folded = irc_to_lower(&channel.name());
        let mut tables = self.tables.write();
        // re-check emptiness under the registry lock so a racing join wins
        if channel.members_snapshot().is_empty() {
            tables.channels_by_name.remove(&folded);
            true
        } else {
            false
        }
    }

    /// Atomically rewrite the folded-name index for a rename. The channel's
    /// display name changes under its own lock while the registry lock is
    /// held, so no lookup can observe the intermediate state.
    pub fn rename_channel(&self, old_name: &str, new_name: &str) -> Result<Arc<Channel>, RegistryError> {
        let old_folded = irc_to_lower(old_name);
        let new_folded = irc_to_lower(new_name);
        let mut tables = self.tables.write();
        if tables.channels_by_name.contains_key(&new_folded) && old_folded != new_folded {
            return Err(RegistryError::ChannelNameInUse);
        }
        let channel = tables
            .channels_by_name
            .remove(&old_folded)
            .ok_or(RegistryError::NoSuchChannel)?;
        channel.write().name = new_name.to_string();
        tables.channels_by_name.insert(new_folded, channel.clone());
        Ok(channel)
    }

    /// Transfer connections from an anonymous account into a named one and
    /// drop the anonymous account. Any nick bound to `from` follows.
    pub fn merge_accounts(
        &self,
        from: &Arc<Account>,
        into: &Arc<Account>,
    ) -> Result<Vec<Uuid>, RegistryError> {
        if from.is_named() {
            return Err(RegistryError::MergeSourceNamed);
        }

        let mut tables = self.tables.write();
        // registry lock first, then the two entity locks
        let moved = {
            let mut from_state = from.write();
            let conns = std::mem::take(&mut from_state.connections);
            drop(from_state);
            let mut into_state = into.write();
            for conn in &conns {
                if !into_state.connections.contains(conn) {
                    into_state.connections.push(*conn);
                }
            }
            conns
        };

        for id in tables.nicks.values_mut() {
            if *id == from.id {
                *id = into.id;
            }
        }
        tables.accounts_by_id.remove(&from.id);

        Ok(moved)
    }

    // --- preload & stats ---

    pub fn insert_server(&self, server: Arc<ServerEntry>) {
        self.tables.write().servers.insert(server.id, server);
    }

    pub fn insert_role(&self, role: Arc<RoleEntry>) {
        self.tables.write().roles.insert(role.id, role);
    }

    pub fn insert_permission(&self, permission: Arc<PermissionEntry>) {
        self.tables
            .write()
            .permissions
            .insert(permission.id, permission);
    }

    pub fn account_count(&self) -> usize {
        self.tables.read().accounts_by_id.len()
    }

    pub fn channel_count(&self) -> usize {
        self.tables.read().channels_by_name.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn named(username: &str) -> Arc<Account> {
        let row = crate::db::AccountRow {
            id: Uuid::new_v4(),
            username: username.to_string(),
            password_hash: "x".to_string(),
            created: chrono::Utc::now(),
        };
        Account::from_row(&row, "host")
    }

    #[test]
    fn account_lookup_by_id_and_name() {
        let reg = Registry::new();
        let acc = named("alice");
        reg.insert_account(acc.clone());
        assert!(reg.lookup_account_by_uuid(acc.id).is_some());
        assert!(reg.lookup_account_by_name("alice").is_some());
        // usernames are case-sensitive
        assert!(reg.lookup_account_by_name("Alice").is_none());
        reg.remove_account(&acc);
        assert!(reg.lookup_account_by_uuid(acc.id).is_none());
    }

    #[test]
    fn bind_nick_rejects_other_owner() {
        let reg = Registry::new();
        let a = Account::anonymous("bob", "h");
        let b = Account::anonymous("bob", "h");
        reg.insert_account(a.clone());
        reg.insert_account(b.clone());
        assert!(reg.bind_nick("bob", a.id).is_ok());
        assert_eq!(reg.bind_nick("bob", b.id), Err(RegistryError::NickInUse));
        // same owner is idempotent
        assert!(reg.bind_nick("bob", a.id).is_ok());
    }

    #[test]
    fn rebind_nick_is_a_swap() {
        let reg = Registry::new();
        let a = Account::anonymous("old", "h");
        reg.insert_account(a.clone());
        reg.bind_nick("old", a.id).unwrap();

        reg.rebind_nick("old", "new", a.id).unwrap();
        assert_eq!(reg.nick_binding("new"), Some(a.id));
        assert_eq!(reg.nick_binding("old"), None);
        assert_eq!(reg.lookup_nick("new").unwrap().id, a.id);
    }

    #[test]
    fn rebind_fails_against_foreign_binding() {
        let reg = Registry::new();
        let a = Account::anonymous("a", "h");
        let b = Account::anonymous("b", "h");
        reg.insert_account(a.clone());
        reg.insert_account(b.clone());
        reg.bind_nick("a", a.id).unwrap();
        reg.bind_nick("b", b.id).unwrap();
        assert_eq!(
            reg.rebind_nick("a", "b", a.id),
            Err(RegistryError::NickInUse)
        );
        // failed rebind leaves both bindings untouched
        assert_eq!(reg.nick_binding("a"), Some(a.id));
        assert_eq!(reg.nick_binding("b"), Some(b.id));
    }

    #[test]
    fn get_or_create_channel_returns_same_handle() {
        let reg = Registry::new();
        let first = reg.get_or_create_channel("Rust");
        let second = reg.get_or_create_channel("rust");
        assert!(Arc::ptr_eq(&first, &second));
        // folded lookup finds it under either spelling
        assert!(reg.lookup_channel_by_name("RUST").is_some());
    }

    #[test]
    fn dead_channel_removal_respects_persistence() {
        let reg = Registry::new();
        let anon = reg.get_or_create_channel("temp");
        assert!(reg.remove_channel_if_dead(&anon));
        assert!(reg.lookup_channel_by_name("temp").is_none());

        let row = crate::db::ChannelRow {
            id: Uuid::new_v4(),
            name: "keep".to_string(),
            topic: String::new(),
            owner: None,
            server: None,
            created: chrono::Utc::now(),
        };
        let persisted = Channel::from_row(&row);
        reg.insert_channel(persisted.clone());
        assert!(!reg.remove_channel_if_dead(&persisted));
        assert!(reg.lookup_channel_by_name("keep").is_some());
    }

    #[test]
    fn merge_moves_connections_and_nick() {
        let reg = Registry::new();
        let anon = Account::anonymous("guest", "h");
        let real = named("alice");
        reg.insert_account(anon.clone());
        reg.insert_account(real.clone());
        let conn = Uuid::new_v4();
        anon.add_connection(conn);
        reg.bind_nick("guest", anon.id).unwrap();

        let moved = reg.merge_accounts(&anon, &real).unwrap();
        assert_eq!(moved, vec![conn]);
        assert!(real.connection_ids().contains(&conn));
        assert_eq!(reg.nick_binding("guest"), Some(real.id));
        assert!(reg.lookup_account_by_uuid(anon.id).is_none());
    }

    #[test]
    fn merge_refuses_named_source() {
        let reg = Registry::new();
        let a = named("a");
        let b = named("b");
        reg.insert_account(a.clone());
        reg.insert_account(b.clone());
        assert_eq!(
            reg.merge_accounts(&a, &b),
            Err(RegistryError::MergeSourceNamed)
        );
    }

    #[test]
    fn rename_rewrites_folded_index() {
        let reg = Registry::new();
        let ch = reg.get_or_create_channel("old");
        let renamed = reg.rename_channel("old", "fresh").unwrap();
        assert!(Arc::ptr_eq(&ch, &renamed));
        assert!(reg.lookup_channel_by_name("old").is_none());
        assert_eq!(reg.lookup_channel_by_name("fresh").unwrap().name(), "fresh");

        reg.get_or_create_channel("other");
        assert_eq!(
            reg.rename_channel("fresh", "other"),
            Err(RegistryError::ChannelNameInUse)
        );
        assert_eq!(
            reg.rename_channel("gone", "x"),
            Err(RegistryError::NoSuchChannel)
        );
    }
}
