//! In-memory server state: entities, registry, live connections.

pub mod account;
pub mod catalog;
pub mod channel;
pub mod conn;
pub mod ctx;
pub mod modes;
pub mod registry;

pub use account::Account;
pub use catalog::{PermissionEntry, RoleEntry, ServerEntry};
pub use channel::Channel;
pub use conn::{ConnHandle, ConnTable};
pub use ctx::{Ctx, ServerInfo};
pub use modes::{ChannelMode, ChannelModeSet, UserMode, UserModeSet};
pub use registry::Registry;
