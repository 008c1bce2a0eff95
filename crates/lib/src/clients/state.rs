//! State shared by the client-side connections: identity, handlers, token and the
//! connected/closing flags that drive reconnection.

use crate::connections::{ConnectionInfo, ConnectionRef, Handlers};
use crate::error::HubError;
use crate::messaging::MessageConverter;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Delay between reconnect attempts after the first, immediate one.
pub const RECONNECT_INTERVAL: Duration = Duration::from_secs(1);

pub(crate) struct ClientState {
    pub info: ConnectionInfo,
    pub handlers: Handlers,
    token: RwLock<String>,
    connected: AtomicBool,
    /// Set by `disconnect`; stops the reconnect loop.
    closing: AtomicBool,
    reconnect: AtomicBool,
}

impl ClientState {
    pub fn new(info: ConnectionInfo) -> Self {
        Self {
            info,
            handlers: Handlers::default(),
            token: RwLock::new(String::new()),
            connected: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            reconnect: AtomicBool::new(true),
        }
    }

    pub fn token(&self) -> String {
        self.token.read().clone()
    }

    pub fn set_token(&self, token: &str) {
        *self.token.write() = token.to_string();
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    pub fn set_closing(&self, closing: bool) {
        self.closing.store(closing, Ordering::SeqCst);
    }

    pub fn set_reconnect(&self, enabled: bool) {
        self.reconnect.store(enabled, Ordering::SeqCst);
    }

    /// Whether a lost connection should be re-established.
    pub fn should_reconnect(&self) -> bool {
        self.reconnect.load(Ordering::SeqCst) && !self.is_closing()
    }

    pub fn mark_connected(&self) {
        if !self.connected.swap(true, Ordering::SeqCst) {
            log::info!(
                "connected to {} as '{}' ({})",
                self.info.connect_url,
                self.info.client_id,
                self.info.protocol_type
            );
            self.handlers.notify_connect(true, None, self.info.clone());
        }
    }

    /// Flip to disconnected; reports to the connect handler on the first call only.
    pub fn mark_disconnected(&self, err: Option<HubError>) -> bool {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return false;
        }
        log::info!(
            "disconnected from {} ({})",
            self.info.connect_url,
            err.as_ref().map(|e| e.to_string()).unwrap_or_else(|| "closed".into())
        );
        self.handlers.notify_connect(false, err, self.info.clone());
        true
    }

    pub fn not_connected(&self) -> HubError {
        HubError::Transport(format!("not connected to {}", self.info.connect_url))
    }

    /// Decode one message from the hub and hand it to the matching handler. A request's
    /// response is returned through `this`.
    pub async fn dispatch(&self, raw: &[u8], converter: &dyn MessageConverter, this: ConnectionRef) {
        if let Some(req) = converter.decode_request(raw) {
            if let Some(resp) = self.handlers.dispatch_request(req, Some(this.clone())).await {
                if let Err(e) = this.send_response(&resp).await {
                    log::warn!("sending response '{}' failed: {}", resp.correlation_id, e);
                }
            }
        } else if let Some(resp) = converter.decode_response(raw) {
            if let Err(e) = self.handlers.dispatch_response(resp).await {
                log::warn!("response handler failed: {}", e);
            }
        } else if let Some(notif) = converter.decode_notification(raw) {
            self.handlers.dispatch_notification(notif).await;
        } else {
            log::warn!(
                "unrecognized {} message from {}",
                converter.protocol_type(),
                self.info.connect_url
            );
        }
    }
}
