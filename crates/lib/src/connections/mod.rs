//! Connection capability set shared by server-side and client-side connections.
//!
//! A connection is one live session of one authenticated client. Every protocol implements
//! [`Connection`]; the [`ConnectionManager`] and the transport servers only depend on that
//! trait. Handlers are swappable at runtime through [`HandlerCell`]s.

mod manager;
mod subscriptions;

pub use manager::ConnectionManager;
pub use subscriptions::{SubscriptionState, Subscriptions};

use crate::error::HubError;
use crate::messaging::{NotificationMessage, ProtocolType, RequestMessage, ResponseMessage};
use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;

/// Default RPC timeout for a connection.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Identity and endpoint of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    /// Authenticated account ID.
    pub client_id: String,
    /// Client-assigned ID (header `cid`); one client may hold several.
    pub connection_id: String,
    pub connect_url: String,
    pub protocol_type: ProtocolType,
    /// PEM CA certificate the client verifies the server with, if any.
    pub ca_cert: Option<String>,
    pub remote_addr: String,
    pub timeout: Duration,
}

impl ConnectionInfo {
    pub fn new(
        client_id: &str,
        connection_id: &str,
        connect_url: &str,
        protocol_type: ProtocolType,
    ) -> Self {
        Self {
            client_id: client_id.to_string(),
            connection_id: connection_id.to_string(),
            connect_url: connect_url.to_string(),
            protocol_type,
            ca_cert: None,
            remote_addr: String::new(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Both IDs are required for a connection to be managed.
    pub fn is_valid(&self) -> bool {
        !self.client_id.is_empty() && !self.connection_id.is_empty()
    }

    /// Manager key.
    pub fn key(&self) -> ConnectionKey {
        (self.client_id.clone(), self.connection_id.clone())
    }
}

/// `(clientID, connectionID)`. Kept as a pair so no ID can alias another's prefix.
pub type ConnectionKey = (String, String);

/// Shared reference to any connection.
pub type ConnectionRef = Arc<dyn Connection>;

/// Handles a request. `reply_to` is the connection the request arrived on, if it has one.
/// Returning `None` means the result is not available yet and will be sent later.
pub type RequestHandler = Arc<
    dyn Fn(RequestMessage, Option<ConnectionRef>) -> BoxFuture<'static, Option<ResponseMessage>>
        + Send
        + Sync,
>;

pub type ResponseHandler =
    Arc<dyn Fn(ResponseMessage) -> BoxFuture<'static, Result<(), HubError>> + Send + Sync>;

pub type NotificationHandler =
    Arc<dyn Fn(NotificationMessage) -> BoxFuture<'static, ()> + Send + Sync>;

/// Called with `(connected, error, info)` when a connection is established or lost.
pub type ConnectHandler = Arc<dyn Fn(bool, Option<HubError>, ConnectionInfo) + Send + Sync>;

/// Runtime-replaceable handler slot. Swaps are atomic and dispatch takes no lock.
pub struct HandlerCell<T: Clone> {
    // handlers are unsized `Arc<dyn Fn>`s, hence the extra `Arc`
    inner: ArcSwapOption<T>,
}

impl<T: Clone> HandlerCell<T> {
    pub fn new() -> Self {
        Self {
            inner: ArcSwapOption::empty(),
        }
    }

    pub fn set(&self, handler: Option<T>) {
        self.inner.store(handler.map(Arc::new));
    }

    pub fn get(&self) -> Option<T> {
        self.inner.load_full().map(|h| T::clone(&h))
    }
}

impl<T: Clone> Default for HandlerCell<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// The four handler slots every connection carries.
#[derive(Default)]
pub struct Handlers {
    pub connect: HandlerCell<ConnectHandler>,
    pub notification: HandlerCell<NotificationHandler>,
    pub request: HandlerCell<RequestHandler>,
    pub response: HandlerCell<ResponseHandler>,
}

impl Handlers {
    /// New handler set holding the same handlers.
    pub fn cloned(&self) -> Self {
        let h = Self::default();
        h.connect.set(self.connect.get());
        h.notification.set(self.notification.get());
        h.request.set(self.request.get());
        h.response.set(self.response.get());
        h
    }

    pub fn notify_connect(&self, connected: bool, err: Option<HubError>, info: ConnectionInfo) {
        if let Some(h) = self.connect.get() {
            h(connected, err, info);
        }
    }

    /// Run the request handler, or answer with a failed response when none is registered.
    pub async fn dispatch_request(
        &self,
        req: RequestMessage,
        reply_to: Option<ConnectionRef>,
    ) -> Option<ResponseMessage> {
        match self.request.get() {
            Some(h) => h(req, reply_to).await,
            None => {
                log::warn!(
                    "no request handler registered for '{}' from '{}'",
                    req.operation,
                    req.sender_id
                );
                let err = HubError::Internal("no request handler registered".to_string());
                Some(req.create_response(serde_json::Value::Null, Some(&err)))
            }
        }
    }

    pub async fn dispatch_response(&self, resp: ResponseMessage) -> Result<(), HubError> {
        match self.response.get() {
            Some(h) => h(resp).await,
            None => {
                log::warn!(
                    "no response handler registered; dropping response '{}' for '{}'",
                    resp.correlation_id,
                    resp.thing_id
                );
                Ok(())
            }
        }
    }

    pub async fn dispatch_notification(&self, notif: NotificationMessage) {
        match self.notification.get() {
            Some(h) => h(notif).await,
            None => log::debug!(
                "no notification handler registered; dropping {} {}/{}",
                notif.operation,
                notif.thing_id,
                notif.name
            ),
        }
    }
}

/// Capability set of a connection, independent of its wire protocol.
#[async_trait]
pub trait Connection: Send + Sync {
    fn connection_info(&self) -> ConnectionInfo;

    fn is_connected(&self) -> bool;

    /// Close the connection. Safe to call more than once.
    async fn disconnect(&self);

    /// Write a request to the peer. Does not wait for the response.
    async fn send_request(&self, req: &RequestMessage) -> Result<(), HubError>;

    async fn send_response(&self, resp: &ResponseMessage) -> Result<(), HubError>;

    /// Server side: deliver if the peer subscribed or observed the affordance, otherwise
    /// a no-op. Client side: publish to the server.
    async fn send_notification(&self, notif: &NotificationMessage) -> Result<(), HubError>;

    fn set_connect_handler(&self, handler: Option<ConnectHandler>);
    fn set_notification_handler(&self, handler: Option<NotificationHandler>);
    fn set_request_handler(&self, handler: Option<RequestHandler>);
    fn set_response_handler(&self, handler: Option<ResponseHandler>);
}

/// Identity comparison for trait objects (ignores vtable differences).
pub fn same_connection(a: &ConnectionRef, b: &ConnectionRef) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}
