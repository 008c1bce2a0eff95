//! Authorization: roles, groups and per-Thing permissions.

mod roles;
mod service;
mod store;

pub use roles::{Permission, Role};
pub use service::{required_permission, AuthzService, ALL_GROUP_ID};
pub use store::{Group, GroupStore, Source, DEFAULT_ACL_FILE};
