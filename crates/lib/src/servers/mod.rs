//! Protocol servers and the transport manager.
//!
//! The HTTP-basic server owns the listener and the axum router; the SSE and websocket
//! servers add their routes to it. All servers share one [`ServerHandlers`] set, so the
//! application registers its handlers once on the [`TransportManager`].

mod connection;
mod http;
mod sse;
mod transport;
mod wss;

pub use http::{
    HttpBasicServer, HTTP_LOGIN_PATH, HTTP_LOGOUT_PATH, HTTP_PING_PATH, HTTP_REFRESH_PATH,
    HTTP_THINGS_PATH,
};
pub use sse::{
    HiveotSseServer, SseServerConnection, DEFAULT_SSE_PATH, SSE_NOTIFICATION_PATH, SSE_PING_EVENT,
    SSE_REQUEST_PATH, SSE_RESPONSE_PATH,
};
pub use transport::{DiscoveryRecord, TransportManager};
pub use wss::{WssServer, WssServerConnection, DEFAULT_HIVEOT_WSS_PATH, DEFAULT_WOT_WSS_PATH};

use crate::connections::{
    ConnectHandler, ConnectionRef, HandlerCell, Handlers, NotificationHandler, RequestHandler,
    ResponseHandler,
};
use crate::messaging::{NotificationMessage, ProtocolType, RequestMessage};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

/// Header carrying the client-assigned connection ID.
pub const CONNECTION_ID_HEADER: &str = "cid";

/// Decides whether the sender of a request may perform it. Consulted by connections before
/// they change their subscriptions.
pub type Authorizer = Arc<dyn Fn(&RequestMessage) -> bool + Send + Sync>;

/// Handlers shared by every server of a transport manager.
#[derive(Default)]
pub struct ServerHandlers {
    pub handlers: Handlers,
    pub authorizer: HandlerCell<Authorizer>,
}

impl ServerHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_request_handler(&self, h: Option<RequestHandler>) {
        self.handlers.request.set(h);
    }

    pub fn set_response_handler(&self, h: Option<ResponseHandler>) {
        self.handlers.response.set(h);
    }

    pub fn set_notification_handler(&self, h: Option<NotificationHandler>) {
        self.handlers.notification.set(h);
    }

    pub fn set_connect_handler(&self, h: Option<ConnectHandler>) {
        self.handlers.connect.set(h);
    }

    pub fn set_authorizer(&self, a: Option<Authorizer>) {
        self.authorizer.set(a);
    }

    /// Handler set for a newly accepted connection.
    pub fn for_connection(&self) -> Handlers {
        self.handlers.cloned()
    }
}

/// Common contract of the protocol servers.
#[async_trait]
pub trait TransportServer: Send + Sync {
    fn protocol_type(&self) -> ProtocolType;

    /// URL clients connect to; empty until started.
    fn connect_url(&self) -> String;

    async fn start(&self) -> anyhow::Result<()>;

    async fn stop(&self);

    fn get_connection_by_connection_id(
        &self,
        client_id: &str,
        connection_id: &str,
    ) -> Option<ConnectionRef>;

    fn get_connection_by_client_id(&self, client_id: &str) -> Option<ConnectionRef>;

    /// Offer a notification to every connection of this server.
    async fn send_notification(&self, notif: &NotificationMessage);

    async fn close_all(&self);

    async fn close_all_client_connections(&self, client_id: &str);

    /// Add this server's forms to a TD document.
    fn add_td_forms(&self, td: &mut Value);
}

/// Append a form to `target.forms`, creating the array if needed.
pub(crate) fn push_form(target: &mut Value, form: Value) {
    if !target.is_object() {
        return;
    }
    match target.get_mut("forms") {
        Some(Value::Array(forms)) => forms.push(form),
        _ => target["forms"] = Value::Array(vec![form]),
    }
}
