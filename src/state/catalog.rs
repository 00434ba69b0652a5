//! Servers, roles and permissions.
//!
//! These entities come out of the repository at startup and are never
//! created on the hot path, so they are plain immutable records shared
//! through the registry.

use chrono::{DateTime, Utc};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct ServerEntry {
    pub id: Uuid,
    pub name: String,
    pub owner: Option<Uuid>,
    pub members: Vec<Uuid>,
    pub channels: Vec<Uuid>,
    pub created: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct RoleEntry {
    pub id: Uuid,
    pub name: String,
    pub priority: i64,
    pub color: String,
    /// Permission bitflags, resolved against [`PermissionEntry::bit`].
    pub permissions: u64,
}

#[derive(Debug, Clone)]
pub struct PermissionEntry {
    pub id: Uuid,
    pub name: String,
    pub bit: u64,
}
