//! File-backed group store.
//!
//! Groups live in memory as `groupID -> Group` plus a reverse index
//! `clientID -> groupID -> role`. Every mutation runs under the write lock, rebuilds the
//! reverse index and rewrites the YAML file through a temp file in the same directory.
//! External edits to the file are not picked up while the store is open.

use super::roles::Role;
use crate::error::HubError;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default file name of the group store in the data directory.
pub const DEFAULT_ACL_FILE: &str = "authz-groups.acl";

/// Origin of the Things a group carries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    #[serde(rename = "publisherID", default)]
    pub publisher_id: String,
    #[serde(rename = "thingID", default)]
    pub thing_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Group {
    pub id: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub member_roles: BTreeMap<String, Role>,
    #[serde(default)]
    pub sources: Vec<Source>,
    /// Event retention in seconds; 0 keeps nothing.
    #[serde(default)]
    pub retention: u64,
}

impl Group {
    pub fn new(id: &str, display_name: &str, retention: Duration) -> Self {
        Self {
            id: id.to_string(),
            display_name: display_name.to_string(),
            member_roles: BTreeMap::new(),
            sources: Vec::new(),
            retention: retention.as_secs(),
        }
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention)
    }

    /// Whether the group carries the Thing. An empty source thingID covers every Thing of
    /// that publisher.
    pub fn has_thing(&self, thing_id: &str) -> bool {
        self.sources
            .iter()
            .any(|s| s.thing_id.is_empty() || s.thing_id == thing_id)
    }
}

pub type GroupMap = BTreeMap<String, Group>;
/// `clientID -> groupID -> role`
pub type UserGroupRoles = HashMap<String, HashMap<String, Role>>;

#[derive(Default)]
struct State {
    groups: GroupMap,
    user_group_roles: UserGroupRoles,
}

impl State {
    fn rebuild_index(&mut self) {
        let mut index: UserGroupRoles = HashMap::new();
        for (group_id, group) in &self.groups {
            for (member, role) in &group.member_roles {
                index
                    .entry(member.clone())
                    .or_default()
                    .insert(group_id.clone(), *role);
            }
        }
        self.user_group_roles = index;
    }
}

pub struct GroupStore {
    path: PathBuf,
    state: RwLock<State>,
}

impl GroupStore {
    /// Open the store, creating its directory if needed. A missing or empty file is an
    /// empty store.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, HubError> {
        let path = path.as_ref().to_path_buf();
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).map_err(|e| {
                HubError::Internal(format!("creating store directory {}: {}", dir.display(), e))
            })?;
        }
        let groups: GroupMap = match std::fs::read_to_string(&path) {
            Ok(s) if s.trim().is_empty() => GroupMap::new(),
            Ok(s) => serde_yaml::from_str(&s).map_err(|e| {
                HubError::Internal(format!("parsing {}: {}", path.display(), e))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => GroupMap::new(),
            Err(e) => {
                return Err(HubError::Internal(format!(
                    "reading {}: {}",
                    path.display(),
                    e
                )))
            }
        };
        let mut state = State {
            groups,
            user_group_roles: HashMap::new(),
        };
        state.rebuild_index();
        log::info!(
            "authz store opened: {} ({} group(s))",
            path.display(),
            state.groups.len()
        );
        Ok(Self {
            path,
            state: RwLock::new(state),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Apply `f` to the groups, rebuild the reverse index and persist. When `f` fails nothing
    /// is written. A persistence failure is returned after the in-memory change took effect.
    pub fn mutate<R>(
        &self,
        f: impl FnOnce(&mut GroupMap) -> Result<R, HubError>,
    ) -> Result<R, HubError> {
        let mut state = self.state.write();
        let result = f(&mut state.groups)?;
        state.rebuild_index();
        if let Err(e) = save(&self.path, &state.groups) {
            log::error!("saving authz store {} failed: {}", self.path.display(), e);
            return Err(e);
        }
        Ok(result)
    }

    /// Read access to both indexes.
    pub fn read<R>(&self, f: impl FnOnce(&GroupMap, &UserGroupRoles) -> R) -> R {
        let state = self.state.read();
        f(&state.groups, &state.user_group_roles)
    }
}

fn save(path: &Path, groups: &GroupMap) -> Result<(), HubError> {
    let yaml = serde_yaml::to_string(groups)?;
    let dir = path
        .parent()
        .filter(|d| !d.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = dir.join(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4().simple()));
    std::fs::write(&tmp, yaml)?;
    if let Err(e) = std::fs::rename(&tmp, path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(e.into());
    }
    Ok(())
}
