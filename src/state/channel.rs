//! The channel entity.
//!
//! Channels hold member *account ids*, not account references; fan-out
//! resolves members through the registry and treats a missing lookup as a
//! removal that raced the send.

use chrono::{DateTime, Utc};
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

use crate::db::ChannelRow;
use crate::state::modes::{ChannelMode, ChannelModeSet};

/// Mutable channel state, guarded by the channel's lock.
#[derive(Debug, Default)]
pub struct ChannelState {
    /// Display name, without the `#` sigil.
    pub name: String,
    pub topic: String,
    pub key: Option<String>,
    pub limit: Option<u32>,
    pub modes: ChannelModeSet,
    /// Member account ids, in join order.
    pub members: Vec<Uuid>,
    pub bans: HashSet<String>,
    pub owner: Option<Uuid>,
    pub server: Option<Uuid>,
    pub created: Option<DateTime<Utc>>,
}

pub struct Channel {
    pub id: Uuid,
    /// Whether a database row backs this channel. Unpersisted channels are
    /// destroyed when their last member leaves.
    pub persisted: bool,
    state: RwLock<ChannelState>,
}

impl PartialEq for Channel {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Channel {
    /// A channel created on first join, in memory only.
    pub fn anonymous(name: &str) -> Arc<Self> {
        Arc::new(Channel {
            id: Uuid::new_v4(),
            persisted: false,
            state: RwLock::new(ChannelState {
                name: name.to_string(),
                created: Some(Utc::now()),
                ..Default::default()
            }),
        })
    }

    pub fn from_row(row: &ChannelRow) -> Arc<Self> {
        Arc::new(Channel {
            id: row.id,
            persisted: true,
            state: RwLock::new(ChannelState {
                name: row.name.clone(),
                topic: row.topic.clone(),
                owner: row.owner,
                server: row.server,
                created: Some(row.created),
                ..Default::default()
            }),
        })
    }

    pub fn read(&self) -> RwLockReadGuard<'_, ChannelState> {
        self.state.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, ChannelState> {
        self.state.write()
    }

    pub fn name(&self) -> String {
        self.state.read().name.clone()
    }

    pub fn topic(&self) -> String {
        self.state.read().topic.clone()
    }

    pub fn set_topic(&self, topic: &str) {
        self.state.write().topic = topic.to_string();
    }

    /// Snapshot of the member set, taken under the read lock so fan-out can
    /// iterate after release.
    pub fn members_snapshot(&self) -> Vec<Uuid> {
        self.state.read().members.clone()
    }

    pub fn is_member(&self, account: Uuid) -> bool {
        self.state.read().members.contains(&account)
    }

    /// Append a member. Returns false when already present.
    pub fn add_member(&self, account: Uuid) -> bool {
        let mut state = self.state.write();
        if state.members.contains(&account) {
            return false;
        }
        state.members.push(account);
        true
    }

    /// Remove a member. Returns the remaining member count, or `None` if
    /// the account was not a member.
    pub fn remove_member(&self, account: Uuid) -> Option<usize> {
        let mut state = self.state.write();
        let before = state.members.len();
        state.members.retain(|m| *m != account);
        (state.members.len() < before).then_some(state.members.len())
    }

    /// Apply one mode change. Returns true when the bit actually flipped.
    pub fn set_mode(&self, mode: ChannelMode, adding: bool, arg: Option<&str>) -> bool {
        let mut state = self.state.write();
        let before = state.modes.has(mode);

        match mode {
            ChannelMode::Ban => {
                let Some(mask) = arg else { return false };
                if adding {
                    state.bans.insert(mask.to_string());
                } else {
                    state.bans.remove(mask);
                }
                // the bit reflects whether any ban mask is set
                if state.bans.is_empty() {
                    state.modes.clear(ChannelMode::Ban);
                } else {
                    state.modes.set(ChannelMode::Ban);
                }
            }
            ChannelMode::Key => {
                if adding {
                    let Some(key) = arg else { return false };
                    state.key = Some(key.to_string());
                    state.modes.set(ChannelMode::Key);
                } else {
                    state.key = None;
                    state.modes.clear(ChannelMode::Key);
                }
            }
            ChannelMode::Limit => {
                if adding {
                    let Some(limit) = arg.and_then(|a| a.parse::<u32>().ok()) else {
                        return false;
                    };
                    state.limit = Some(limit);
                    state.modes.set(ChannelMode::Limit);
                } else {
                    state.limit = None;
                    state.modes.clear(ChannelMode::Limit);
                }
            }
            _ => {
                if adding {
                    state.modes.set(mode);
                } else {
                    state.modes.clear(mode);
                }
            }
        }

        state.modes.has(mode) != before
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("name", &state.name)
            .field("members", &state.members.len())
            .field("persisted", &self.persisted)
            .finish()
    }
}
