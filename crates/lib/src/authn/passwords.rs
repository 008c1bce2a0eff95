//! Password file: accounts with salted SHA-256 password hashes, stored as YAML.

use crate::error::HubError;
use base64::Engine;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Default file name of the password store in the data directory.
pub const DEFAULT_PASSWORD_FILE: &str = "hub.passwd";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientType {
    #[default]
    User,
    Agent,
    Service,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    #[serde(rename = "clientID")]
    pub client_id: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub client_type: ClientType,
    pub password_hash: String,
    pub salt: String,
}

pub struct PasswordStore {
    path: PathBuf,
    accounts: RwLock<BTreeMap<String, Account>>,
}

fn random_bytes<const N: usize>() -> Result<[u8; N], HubError> {
    let mut buf = [0u8; N];
    getrandom::getrandom(&mut buf)
        .map_err(|e| HubError::Internal(format!("random source failed: {}", e)))?;
    Ok(buf)
}

fn hash_password(salt: &str, password: &str) -> String {
    let mut h = Sha256::new();
    h.update(salt.as_bytes());
    h.update(password.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(h.finalize())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

impl PasswordStore {
    /// Load the store; a missing file is an empty store.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, HubError> {
        let path = path.as_ref().to_path_buf();
        let accounts = match std::fs::read_to_string(&path) {
            Ok(s) if s.trim().is_empty() => BTreeMap::new(),
            Ok(s) => serde_yaml::from_str(&s)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path,
            accounts: RwLock::new(accounts),
        })
    }

    /// Add or replace an account.
    pub fn add(
        &self,
        client_id: &str,
        display_name: &str,
        client_type: ClientType,
        password: &str,
    ) -> Result<(), HubError> {
        if client_id.is_empty() {
            return Err(HubError::InvalidArgument("missing client ID".into()));
        }
        let salt = base64::engine::general_purpose::STANDARD.encode(random_bytes::<16>()?);
        let account = Account {
            client_id: client_id.to_string(),
            display_name: display_name.to_string(),
            client_type,
            password_hash: hash_password(&salt, password),
            salt,
        };
        let mut accounts = self.accounts.write();
        accounts.insert(client_id.to_string(), account);
        self.save(&accounts)
    }

    pub fn set_password(&self, client_id: &str, password: &str) -> Result<(), HubError> {
        let mut accounts = self.accounts.write();
        let account = accounts
            .get_mut(client_id)
            .ok_or_else(|| HubError::NotFound(format!("account '{}' not found", client_id)))?;
        let salt = base64::engine::general_purpose::STANDARD.encode(random_bytes::<16>()?);
        account.password_hash = hash_password(&salt, password);
        account.salt = salt;
        self.save(&accounts)
    }

    pub fn remove(&self, client_id: &str) -> Result<(), HubError> {
        let mut accounts = self.accounts.write();
        if accounts.remove(client_id).is_none() {
            return Ok(());
        }
        self.save(&accounts)
    }

    pub fn get(&self, client_id: &str) -> Option<Account> {
        self.accounts.read().get(client_id).cloned()
    }

    pub fn list(&self) -> Vec<Account> {
        self.accounts.read().values().cloned().collect()
    }

    /// Check a password. Unknown accounts and wrong passwords are both `Unauthorized`.
    pub fn verify(&self, client_id: &str, password: &str) -> Result<Account, HubError> {
        let account = self
            .get(client_id)
            .ok_or_else(|| HubError::Unauthorized("invalid login or password".into()))?;
        let hash = hash_password(&account.salt, password);
        if constant_time_eq(hash.as_bytes(), account.password_hash.as_bytes()) {
            Ok(account)
        } else {
            Err(HubError::Unauthorized("invalid login or password".into()))
        }
    }

    fn save(&self, accounts: &BTreeMap<String, Account>) -> Result<(), HubError> {
        let yaml = serde_yaml::to_string(accounts)?;
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        std::fs::write(&tmp, yaml)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}
