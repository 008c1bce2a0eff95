//! Authentication: accounts and bearer tokens.

mod passwords;
mod sessions;

pub use passwords::{Account, ClientType, PasswordStore, DEFAULT_PASSWORD_FILE};
pub use sessions::SessionAuthenticator;

use crate::error::HubError;
use std::time::Duration;

/// Token authority used by the servers to authenticate requests.
pub trait Authenticator: Send + Sync {
    /// Verify the password and issue a token.
    fn login(&self, login: &str, password: &str) -> Result<String, HubError>;

    /// Client ID the token was issued to.
    fn validate_token(&self, token: &str) -> Result<String, HubError>;

    /// Replace a valid token of `client_id` with a new one.
    fn refresh_token(&self, client_id: &str, old_token: &str) -> Result<String, HubError>;

    fn logout(&self, token: &str);

    /// Issue a token without a password, for services and tests.
    fn add_token(&self, client_id: &str, validity: Duration) -> Result<String, HubError>;
}
