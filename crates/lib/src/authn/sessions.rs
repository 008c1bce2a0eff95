//! In-memory bearer-token sessions on top of the password store.

use super::passwords::PasswordStore;
use super::Authenticator;
use crate::error::HubError;
use base64::Engine;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

struct Session {
    client_id: String,
    expires: Instant,
}

pub struct SessionAuthenticator {
    passwords: Arc<PasswordStore>,
    validity: Duration,
    sessions: Mutex<HashMap<String, Session>>,
}

impl SessionAuthenticator {
    pub fn new(passwords: Arc<PasswordStore>, validity: Duration) -> Self {
        Self {
            passwords,
            validity,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn passwords(&self) -> &Arc<PasswordStore> {
        &self.passwords
    }

    fn issue(&self, client_id: &str, validity: Duration) -> Result<String, HubError> {
        let mut raw = [0u8; 32];
        getrandom::getrandom(&mut raw)
            .map_err(|e| HubError::Internal(format!("random source failed: {}", e)))?;
        let token = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(raw);
        let mut sessions = self.sessions.lock();
        let now = Instant::now();
        sessions.retain(|_, s| s.expires > now);
        sessions.insert(
            token.clone(),
            Session {
                client_id: client_id.to_string(),
                expires: now + validity,
            },
        );
        Ok(token)
    }
}

impl Authenticator for SessionAuthenticator {
    fn login(&self, login: &str, password: &str) -> Result<String, HubError> {
        let account = self.passwords.verify(login, password).map_err(|e| {
            log::info!("login failed for '{}'", login);
            e
        })?;
        log::info!("login by '{}'", account.client_id);
        self.issue(&account.client_id, self.validity)
    }

    fn validate_token(&self, token: &str) -> Result<String, HubError> {
        let sessions = self.sessions.lock();
        match sessions.get(token) {
            Some(s) if s.expires > Instant::now() => Ok(s.client_id.clone()),
            Some(_) => Err(HubError::Unauthorized("token expired".into())),
            None => Err(HubError::Unauthorized("invalid token".into())),
        }
    }

    fn refresh_token(&self, client_id: &str, old_token: &str) -> Result<String, HubError> {
        let owner = self.validate_token(old_token)?;
        if owner != client_id {
            return Err(HubError::Unauthorized(format!(
                "token does not belong to '{}'",
                client_id
            )));
        }
        self.sessions.lock().remove(old_token);
        self.issue(client_id, self.validity)
    }

    fn logout(&self, token: &str) {
        if let Some(s) = self.sessions.lock().remove(token) {
            log::info!("logout by '{}'", s.client_id);
        }
    }

    fn add_token(&self, client_id: &str, validity: Duration) -> Result<String, HubError> {
        self.issue(client_id, validity)
    }
}
