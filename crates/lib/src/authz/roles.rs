//! Roles, permissions and the fixed role-to-permission table.

use crate::error::HubError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    None,
    Viewer,
    Operator,
    Manager,
    Service,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Permission {
    PubActions,
    PubEvents,
    ReadActions,
    ReadEvents,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::None => "none",
            Role::Viewer => "viewer",
            Role::Operator => "operator",
            Role::Manager => "manager",
            Role::Service => "service",
        }
    }

    /// Roles a human user may hold.
    pub fn is_user_role(&self) -> bool {
        matches!(self, Role::Viewer | Role::Operator | Role::Manager)
    }

    pub fn permissions(&self) -> &'static [Permission] {
        use Permission::*;
        match self {
            Role::None => &[],
            Role::Viewer => &[ReadEvents],
            Role::Operator => &[ReadEvents, ReadActions, PubActions],
            Role::Manager => &[ReadEvents, PubActions],
            Role::Service => &[ReadEvents, ReadActions, PubEvents, PubActions],
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = HubError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Role::None),
            "viewer" => Ok(Role::Viewer),
            "operator" => Ok(Role::Operator),
            "manager" => Ok(Role::Manager),
            "service" => Ok(Role::Service),
            other => Err(HubError::InvalidArgument(format!("unknown role '{}'", other))),
        }
    }
}

impl Permission {
    pub fn as_str(&self) -> &'static str {
        match self {
            Permission::PubActions => "pubActions",
            Permission::PubEvents => "pubEvents",
            Permission::ReadActions => "readActions",
            Permission::ReadEvents => "readEvents",
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
