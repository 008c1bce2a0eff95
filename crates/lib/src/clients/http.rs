//! Connectionless HTTP client for the authentication, ping and `/things` routes.

use crate::error::HubError;
use crate::servers::{
    HTTP_LOGIN_PATH, HTTP_LOGOUT_PATH, HTTP_PING_PATH, HTTP_REFRESH_PATH, HTTP_THINGS_PATH,
};
use parking_lot::RwLock;
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use serde_json::{json, Value};

#[derive(Deserialize)]
struct Problem {
    #[serde(default)]
    title: String,
    #[serde(default)]
    detail: String,
}

/// Error carried by a non-2xx reply: the problem-details body when present, else the status.
pub(crate) async fn error_from_response(resp: reqwest::Response) -> HubError {
    let status = resp.status();
    let body = resp.bytes().await.unwrap_or_default();
    if let Ok(p) = serde_json::from_slice::<Problem>(&body) {
        if !p.title.is_empty() {
            return HubError::from_title(&p.title, p.detail);
        }
    }
    let detail = format!("http status {}", status);
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => HubError::Unauthorized(detail),
        StatusCode::NOT_FOUND => HubError::NotFound(detail),
        StatusCode::BAD_REQUEST => HubError::InvalidArgument(detail),
        StatusCode::GATEWAY_TIMEOUT => HubError::Timeout(detail),
        _ => HubError::Transport(detail),
    }
}

pub(crate) fn parse_url(url: &str) -> Result<Url, HubError> {
    Url::parse(url).map_err(|e| HubError::InvalidArgument(format!("invalid url '{}': {}", url, e)))
}

pub struct HttpClient {
    base: Url,
    http: reqwest::Client,
    token: RwLock<String>,
}

impl HttpClient {
    /// `base_url` is the server root, e.g. `http://127.0.0.1:8444`.
    pub fn new(base_url: &str) -> Result<Self, HubError> {
        Ok(Self {
            base: parse_url(base_url)?,
            http: reqwest::Client::new(),
            token: RwLock::new(String::new()),
        })
    }

    pub fn token(&self) -> String {
        self.token.read().clone()
    }

    pub fn set_token(&self, token: &str) {
        *self.token.write() = token.to_string();
    }

    fn url(&self, path: &str) -> Result<Url, HubError> {
        self.base
            .join(path)
            .map_err(|e| HubError::InvalidArgument(format!("invalid path '{}': {}", path, e)))
    }

    async fn post(&self, path: &str, body: Option<Value>) -> Result<reqwest::Response, HubError> {
        let mut req = self.http.post(self.url(path)?);
        let token = self.token();
        if !token.is_empty() {
            req = req.bearer_auth(token);
        }
        if let Some(body) = body {
            req = req.json(&body);
        }
        let resp = req.send().await?;
        if !resp.status().is_success() {
            return Err(error_from_response(resp).await);
        }
        Ok(resp)
    }

    /// Log in with a password. The token is kept for later calls and returned.
    pub async fn login(&self, client_id: &str, password: &str) -> Result<String, HubError> {
        let body = json!({"login": client_id, "password": password});
        let token: String = self.post(HTTP_LOGIN_PATH, Some(body)).await?.json().await?;
        self.set_token(&token);
        Ok(token)
    }

    pub async fn refresh(&self) -> Result<String, HubError> {
        let old = self.token();
        let token: String = self
            .post(HTTP_REFRESH_PATH, Some(Value::from(old)))
            .await?
            .json()
            .await?;
        self.set_token(&token);
        Ok(token)
    }

    pub async fn logout(&self) -> Result<(), HubError> {
        self.post(HTTP_LOGOUT_PATH, None).await?;
        self.set_token("");
        Ok(())
    }

    pub async fn ping(&self) -> Result<String, HubError> {
        let resp = self.http.get(self.url(HTTP_PING_PATH)?).send().await?;
        if !resp.status().is_success() {
            return Err(error_from_response(resp).await);
        }
        Ok(resp.json().await?)
    }

    /// `POST /things/{op}/{thingID}[/{name}]`. A 201 reply yields the action status.
    pub async fn thing_request(
        &self,
        operation: &str,
        thing_id: &str,
        name: &str,
        input: Value,
    ) -> Result<Value, HubError> {
        let path = if name.is_empty() {
            format!("{}/{}/{}", HTTP_THINGS_PATH, operation, thing_id)
        } else {
            format!("{}/{}/{}/{}", HTTP_THINGS_PATH, operation, thing_id, name)
        };
        let body = if input.is_null() { None } else { Some(input) };
        let resp = self.post(&path, body).await?;
        let bytes = resp.bytes().await?;
        if bytes.is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_slice(&bytes)?)
    }
}
