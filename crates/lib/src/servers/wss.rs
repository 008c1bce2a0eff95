//! Websocket server. The message format is set by the converter, so the same server serves
//! both the HiveOT and the WoT websocket protocols.

use super::connection::ConnectionCore;
use super::http::AuthenticatedClient;
use super::{push_form, HttpBasicServer, ServerHandlers, TransportServer};
use crate::connections::{
    Connection, ConnectHandler, ConnectionInfo, ConnectionManager, ConnectionRef,
    NotificationHandler, RequestHandler, ResponseHandler,
};
use crate::error::HubError;
use crate::messaging::vocab::*;
use crate::messaging::{
    MessageConverter, NotificationMessage, ProtocolType, RequestMessage, ResponseMessage,
};
use async_trait::async_trait;
use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::{ConnectInfo, State},
    response::Response,
    routing::get,
    Router,
};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use tokio::sync::Notify;

pub const DEFAULT_HIVEOT_WSS_PATH: &str = "/hiveot/wss";
pub const DEFAULT_WOT_WSS_PATH: &str = "/wot/wss";

/// `http://host:port` + path as a websocket URL.
fn ws_url(base: &str, path: &str) -> String {
    if base.is_empty() {
        return String::new();
    }
    match base.strip_prefix("http") {
        Some(rest) => format!("ws{}{}", rest, path),
        None => format!("{}{}", base, path),
    }
}

/// Server side of one websocket.
pub struct WssServerConnection {
    core: ConnectionCore,
    converter: Arc<dyn MessageConverter>,
    sink: tokio::sync::Mutex<SplitSink<WebSocket, Message>>,
    closed: Notify,
}

impl WssServerConnection {
    async fn write(&self, msg: Value) -> Result<(), HubError> {
        if !self.core.is_connected() {
            return Err(self.core.not_connected());
        }
        let text = serde_json::to_string(&msg)?;
        self.sink
            .lock()
            .await
            .send(Message::Text(text))
            .await
            .map_err(|e| HubError::Transport(e.to_string()))
    }

    /// Decode and dispatch one text frame. The response to a request goes back on this socket.
    async fn handle_message(self: Arc<Self>, raw: Vec<u8>) {
        if let Some(req) = self.converter.decode_request(&raw) {
            let this: ConnectionRef = self.clone();
            if let Some(resp) = self.core.on_request(Some(this), req).await {
                if let Err(e) = self.send_response(&resp).await {
                    log::warn!(
                        "failed to return response to '{}': {}",
                        self.core.info.client_id,
                        e
                    );
                }
            }
        } else if let Some(resp) = self.converter.decode_response(&raw) {
            self.core.on_response(resp).await;
        } else if let Some(notif) = self.converter.decode_notification(&raw) {
            self.core.on_notification(notif).await;
        } else {
            log::warn!(
                "unrecognized {} message from '{}'",
                self.converter.protocol_type(),
                self.core.info.client_id
            );
        }
    }
}

#[async_trait]
impl Connection for WssServerConnection {
    fn connection_info(&self) -> ConnectionInfo {
        self.core.info.clone()
    }

    fn is_connected(&self) -> bool {
        self.core.is_connected()
    }

    async fn disconnect(&self) {
        if !self.core.mark_disconnected() {
            return;
        }
        self.closed.notify_one();
        let mut sink = self.sink.lock().await;
        let _ = sink.send(Message::Close(None)).await;
        let _ = sink.close().await;
    }

    async fn send_request(&self, req: &RequestMessage) -> Result<(), HubError> {
        let msg = self.converter.encode_request(req)?;
        self.write(msg).await
    }

    async fn send_response(&self, resp: &ResponseMessage) -> Result<(), HubError> {
        let msg = self.converter.encode_response(resp)?;
        self.write(msg).await
    }

    async fn send_notification(&self, notif: &NotificationMessage) -> Result<(), HubError> {
        if !self.core.subs.matches(notif) {
            return Ok(());
        }
        let msg = self.converter.encode_notification(notif)?;
        self.write(msg).await
    }

    fn set_connect_handler(&self, handler: Option<ConnectHandler>) {
        self.core.handlers.connect.set(handler);
    }

    fn set_notification_handler(&self, handler: Option<NotificationHandler>) {
        self.core.handlers.notification.set(handler);
    }

    fn set_request_handler(&self, handler: Option<RequestHandler>) {
        self.core.handlers.request.set(handler);
    }

    fn set_response_handler(&self, handler: Option<ResponseHandler>) {
        self.core.handlers.response.set(handler);
    }
}

#[derive(Clone)]
struct WssState {
    http: Weak<HttpBasicServer>,
    path: String,
    converter: Arc<dyn MessageConverter>,
    manager: Arc<ConnectionManager>,
    handlers: Arc<ServerHandlers>,
}

async fn wss_connect(
    State(state): State<WssState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    client: AuthenticatedClient,
    ws: WebSocketUpgrade,
) -> Response {
    let cid = match client.require_cid() {
        Ok(cid) => cid.to_string(),
        Err(resp) => return resp,
    };
    let base = state.http.upgrade().map(|h| h.base_url()).unwrap_or_default();
    let mut info = ConnectionInfo::new(
        &client.client_id,
        &cid,
        &ws_url(&base, &state.path),
        state.converter.protocol_type(),
    );
    info.remote_addr = remote.to_string();
    ws.on_upgrade(move |socket| serve_socket(state, info, socket))
}

async fn serve_socket(state: WssState, info: ConnectionInfo, socket: WebSocket) {
    let (sink, mut stream) = socket.split();
    let conn = Arc::new(WssServerConnection {
        core: ConnectionCore::new(info.clone(), &state.handlers),
        converter: state.converter.clone(),
        sink: tokio::sync::Mutex::new(sink),
        closed: Notify::new(),
    });
    if let Err(e) = state.manager.add_connection(conn.clone()).await {
        log::warn!("rejected websocket connection: {}", e);
        return;
    }
    log::info!(
        "{} connection '{}' of client '{}' from {}",
        info.protocol_type,
        info.connection_id,
        info.client_id,
        info.remote_addr
    );
    conn.core.handlers.notify_connect(true, None, info);

    loop {
        tokio::select! {
            _ = conn.closed.notified() => break,
            msg = stream.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    let c = conn.clone();
                    tokio::spawn(async move { c.handle_message(text.into_bytes()).await });
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    log::debug!("websocket read error from '{}': {}", conn.core.info.client_id, e);
                    break;
                }
            }
        }
    }
    let this: ConnectionRef = conn;
    state.manager.remove_connection(&this).await;
}

/// Websocket server. Its upgrade route is served by the HTTP-basic server's listener.
pub struct WssServer {
    http: Arc<HttpBasicServer>,
    path: String,
    protocol: ProtocolType,
    manager: Arc<ConnectionManager>,
}

impl WssServer {
    /// Register the upgrade route on `http`. Call before the HTTP server starts.
    pub fn new(
        http: Arc<HttpBasicServer>,
        path: &str,
        converter: Arc<dyn MessageConverter>,
        handlers: Arc<ServerHandlers>,
    ) -> Self {
        let manager = Arc::new(ConnectionManager::new());
        let protocol = converter.protocol_type();
        let state = WssState {
            http: Arc::downgrade(&http),
            path: path.to_string(),
            converter,
            manager: manager.clone(),
            handlers,
        };
        http.add_routes(Router::new().route(path, get(wss_connect)).with_state(state));
        Self {
            http,
            path: path.to_string(),
            protocol,
            manager,
        }
    }

    pub fn connection_manager(&self) -> &ConnectionManager {
        &self.manager
    }
}

#[async_trait]
impl TransportServer for WssServer {
    fn protocol_type(&self) -> ProtocolType {
        self.protocol
    }

    fn connect_url(&self) -> String {
        ws_url(&self.http.base_url(), &self.path)
    }

    async fn start(&self) -> anyhow::Result<()> {
        log::info!("{} server ready at {}", self.protocol, self.path);
        Ok(())
    }

    async fn stop(&self) {
        self.manager.close_all().await;
    }

    fn get_connection_by_connection_id(&self, client_id: &str, cid: &str) -> Option<ConnectionRef> {
        self.manager.get_connection_by_connection_id(client_id, cid)
    }

    fn get_connection_by_client_id(&self, client_id: &str) -> Option<ConnectionRef> {
        self.manager.get_connection_by_client_id(client_id)
    }

    async fn send_notification(&self, notif: &NotificationMessage) {
        self.manager.send_notification(notif).await;
    }

    async fn close_all(&self) {
        self.manager.close_all().await;
    }

    async fn close_all_client_connections(&self, client_id: &str) {
        self.manager.close_all_client_connections(client_id).await;
    }

    fn add_td_forms(&self, td: &mut Value) {
        push_form(
            td,
            json!({
                "op": [
                    OP_SUBSCRIBE_ALL_EVENTS, OP_UNSUBSCRIBE_ALL_EVENTS,
                    OP_OBSERVE_ALL_PROPERTIES, OP_UNOBSERVE_ALL_PROPERTIES,
                    OP_READ_ALL_PROPERTIES, OP_QUERY_ALL_ACTIONS,
                ],
                "href": self.connect_url(),
                "subprotocol": self.protocol.as_str(),
            }),
        );
    }
}
