//! Authorization service: group management and permission evaluation.

use super::roles::{Permission, Role};
use super::store::{Group, GroupStore, Source};
use crate::error::HubError;
use crate::messaging::vocab::*;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::time::Duration;

/// Built-in group every Thing belongs to.
pub const ALL_GROUP_ID: &str = "all";

pub struct AuthzService {
    store: GroupStore,
}

impl AuthzService {
    /// Open the group store and make sure the `all` group exists.
    pub fn start(acl_path: impl AsRef<Path>) -> Result<Self, HubError> {
        let svc = Self {
            store: GroupStore::open(acl_path)?,
        };
        svc.create_group(ALL_GROUP_ID, "All Things", Duration::ZERO)?;
        Ok(svc)
    }

    pub fn stop(&self) {
        log::info!("authz service stopped");
    }

    /// Create a group. An existing group is left untouched.
    pub fn create_group(
        &self,
        group_id: &str,
        display_name: &str,
        retention: Duration,
    ) -> Result<(), HubError> {
        if group_id.is_empty() {
            return Err(HubError::InvalidArgument("missing group ID".into()));
        }
        if self.store.read(|groups, _| groups.contains_key(group_id)) {
            return Ok(());
        }
        self.store.mutate(|groups| {
            groups
                .entry(group_id.to_string())
                .or_insert_with(|| Group::new(group_id, display_name, retention));
            Ok(())
        })?;
        log::info!("authz: created group '{}'", group_id);
        Ok(())
    }

    /// Delete a group. Unknown groups are ignored.
    pub fn delete_group(&self, group_id: &str) -> Result<(), HubError> {
        if !self.store.read(|groups, _| groups.contains_key(group_id)) {
            return Ok(());
        }
        self.store.mutate(|groups| {
            groups.remove(group_id);
            Ok(())
        })?;
        log::info!("authz: deleted group '{}'", group_id);
        Ok(())
    }

    /// Add a Thing source to a group, creating the group if needed.
    pub fn add_source(
        &self,
        publisher_id: &str,
        thing_id: &str,
        group_id: &str,
    ) -> Result<(), HubError> {
        self.store.mutate(|groups| {
            let group = groups
                .entry(group_id.to_string())
                .or_insert_with(|| Group::new(group_id, group_id, Duration::ZERO));
            let exists = group
                .sources
                .iter()
                .any(|s| s.publisher_id == publisher_id && s.thing_id == thing_id);
            if !exists {
                group.sources.push(Source {
                    publisher_id: publisher_id.to_string(),
                    thing_id: thing_id.to_string(),
                });
            }
            Ok(())
        })?;
        log::info!(
            "authz: added source {}/{} to group '{}'",
            publisher_id,
            thing_id,
            group_id
        );
        Ok(())
    }

    /// Add a user to a group with a user role. The group is created if needed.
    pub fn add_user(&self, user_id: &str, role: Role, group_id: &str) -> Result<(), HubError> {
        if !role.is_user_role() {
            return Err(HubError::InvalidArgument(format!(
                "role '{}' doesn't apply to users",
                role
            )));
        }
        self.set_role(user_id, role, group_id)
    }

    /// Change the role of a user in a group.
    pub fn set_user_role(
        &self,
        user_id: &str,
        role: Role,
        group_id: &str,
    ) -> Result<(), HubError> {
        self.add_user(user_id, role, group_id)
    }

    /// Add a service account to a group.
    pub fn add_service(&self, service_id: &str, group_id: &str) -> Result<(), HubError> {
        self.set_role(service_id, Role::Service, group_id)
    }

    fn set_role(&self, client_id: &str, role: Role, group_id: &str) -> Result<(), HubError> {
        if client_id.is_empty() || group_id.is_empty() {
            return Err(HubError::InvalidArgument(
                "missing client or group ID".into(),
            ));
        }
        self.store.mutate(|groups| {
            groups
                .entry(group_id.to_string())
                .or_insert_with(|| Group::new(group_id, group_id, Duration::ZERO))
                .member_roles
                .insert(client_id.to_string(), role);
            Ok(())
        })?;
        log::info!(
            "authz: '{}' has role '{}' in group '{}'",
            client_id,
            role,
            group_id
        );
        Ok(())
    }

    /// Remove a client from a group. No-op when not a member.
    pub fn remove_user(&self, client_id: &str, group_id: &str) -> Result<(), HubError> {
        let is_member = self.store.read(|_, idx| {
            idx.get(client_id)
                .map(|g| g.contains_key(group_id))
                .unwrap_or(false)
        });
        if !is_member {
            return Ok(());
        }
        self.store.mutate(|groups| {
            if let Some(g) = groups.get_mut(group_id) {
                g.member_roles.remove(client_id);
            }
            Ok(())
        })?;
        log::info!("authz: removed '{}' from group '{}'", client_id, group_id);
        Ok(())
    }

    /// Remove a client from every group in one pass.
    pub fn remove_user_all(&self, client_id: &str) -> Result<(), HubError> {
        self.store.mutate(|groups| {
            for g in groups.values_mut() {
                g.member_roles.remove(client_id);
            }
            Ok(())
        })?;
        log::info!("authz: removed '{}' from all groups", client_id);
        Ok(())
    }

    pub fn get_group(&self, group_id: &str) -> Result<Group, HubError> {
        self.store
            .read(|groups, _| groups.get(group_id).cloned())
            .ok_or_else(|| HubError::NotFound(format!("group '{}' does not exist", group_id)))
    }

    /// Groups the client is a member of; every group when `client_id` is empty.
    pub fn get_user_groups(&self, client_id: &str) -> Vec<Group> {
        self.store.read(|groups, _| {
            groups
                .values()
                .filter(|g| client_id.is_empty() || g.member_roles.contains_key(client_id))
                .cloned()
                .collect()
        })
    }

    /// `groupID -> role` of a client.
    pub fn get_user_roles(&self, client_id: &str) -> HashMap<String, Role> {
        self.store
            .read(|_, idx| idx.get(client_id).cloned())
            .unwrap_or_default()
    }

    /// Permissions of a client for each Thing: the union over the client's roles in every
    /// group that carries the Thing, plus its role in the `all` group.
    pub fn get_permissions(
        &self,
        client_id: &str,
        thing_ids: &[&str],
    ) -> BTreeMap<String, Vec<Permission>> {
        self.store.read(|groups, idx| {
            let memberships = idx.get(client_id);
            thing_ids
                .iter()
                .map(|thing_id| {
                    let mut perms = BTreeSet::new();
                    if let Some(memberships) = memberships {
                        for (group_id, role) in memberships {
                            let applies = group_id == ALL_GROUP_ID
                                || groups
                                    .get(group_id)
                                    .map(|g| g.has_thing(thing_id))
                                    .unwrap_or(false);
                            if applies {
                                perms.extend(role.permissions().iter().copied());
                            }
                        }
                    }
                    (thing_id.to_string(), perms.into_iter().collect())
                })
                .collect()
        })
    }

    pub fn has_permission_for(&self, client_id: &str, perm: Permission, thing_id: &str) -> bool {
        self.get_permissions(client_id, &[thing_id])
            .get(thing_id)
            .map(|p| p.contains(&perm))
            .unwrap_or(false)
    }

    /// Whether a client may perform an operation on a Thing. Operations without a required
    /// permission (ping, login) are always allowed; unknown operations never are.
    pub fn has_permission(&self, client_id: &str, operation: &str, thing_id: &str) -> bool {
        match required_permission(operation) {
            Ok(None) => true,
            Ok(Some(perm)) => self.has_permission_for(client_id, perm, thing_id),
            Err(_) => false,
        }
    }
}

/// Permission a consumer needs for an operation. `Ok(None)` for operations anyone may
/// perform, `InvalidArgument` for operations the hub doesn't know.
pub fn required_permission(operation: &str) -> Result<Option<Permission>, HubError> {
    let perm = match operation {
        OP_PING | OP_LOGIN | OP_LOGOUT | OP_REFRESH => return Ok(None),
        OP_INVOKE_ACTION | OP_WRITE_PROPERTY | OP_CANCEL_ACTION => Permission::PubActions,
        OP_QUERY_ACTION | OP_QUERY_ALL_ACTIONS => Permission::ReadActions,
        OP_READ_PROPERTY
        | OP_READ_ALL_PROPERTIES
        | OP_SUBSCRIBE_EVENT
        | OP_SUBSCRIBE_ALL_EVENTS
        | OP_UNSUBSCRIBE_EVENT
        | OP_UNSUBSCRIBE_ALL_EVENTS
        | OP_OBSERVE_PROPERTY
        | OP_OBSERVE_ALL_PROPERTIES
        | OP_UNOBSERVE_PROPERTY
        | OP_UNOBSERVE_ALL_PROPERTIES => Permission::ReadEvents,
        _ => {
            return Err(HubError::InvalidArgument(format!(
                "unknown operation '{}'",
                operation
            )))
        }
    };
    Ok(Some(perm))
}
