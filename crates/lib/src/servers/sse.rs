//! HiveOT SSE server. Clients keep one event stream open per connection ID and post their
//! requests, responses and notifications over plain HTTP with the same `cid` header.

use super::connection::ConnectionCore;
use super::http::{problem_response, AuthenticatedClient};
use super::{push_form, HttpBasicServer, ServerHandlers, TransportServer};
use crate::connections::{
    Connection, ConnectHandler, ConnectionInfo, ConnectionKey, ConnectionManager, ConnectionRef,
    NotificationHandler, RequestHandler, ResponseHandler,
};
use crate::error::HubError;
use crate::messaging::vocab::*;
use crate::messaging::{
    now_rfc3339, HiveotConverter, MessageConverter, NotificationMessage, ProtocolType,
    RequestMessage, ResponseMessage, ResponseStatus,
};
use async_trait::async_trait;
use axum::{
    body::Bytes,
    extract::{ConnectInfo, State},
    http::{header, HeaderValue, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::{mpsc, Notify};

pub const DEFAULT_SSE_PATH: &str = "/hiveot/sse";
pub const SSE_REQUEST_PATH: &str = "/hiveot/request";
pub const SSE_RESPONSE_PATH: &str = "/hiveot/response";
pub const SSE_NOTIFICATION_PATH: &str = "/hiveot/notification";

/// First event on every stream; clients wait for it before they consider themselves connected.
pub const SSE_PING_EVENT: &str = "sse-ping";

const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// How long a send waits for a client that stopped reading its stream.
const SEND_TIMEOUT: Duration = Duration::from_secs(10);

fn converter() -> HiveotConverter {
    HiveotConverter::for_protocol(ProtocolType::HiveotSse)
}

/// Server side of one SSE stream.
pub struct SseServerConnection {
    core: ConnectionCore,
    sender: Mutex<Option<mpsc::Sender<Event>>>,
    closed: Notify,
}

impl SseServerConnection {
    fn new(info: ConnectionInfo, handlers: &ServerHandlers, sender: mpsc::Sender<Event>) -> Self {
        Self {
            core: ConnectionCore::new(info, handlers),
            sender: Mutex::new(Some(sender)),
            closed: Notify::new(),
        }
    }

    /// Queue an event on the stream. Gives up after [`SEND_TIMEOUT`] or when the connection
    /// is closed while waiting for room.
    async fn send_event(&self, kind: &'static str, payload: Value) -> Result<(), HubError> {
        let closed = self.closed.notified();
        tokio::pin!(closed);
        // registered before the sender check so a concurrent disconnect is not missed
        closed.as_mut().enable();
        let sender = self
            .sender
            .lock()
            .clone()
            .ok_or_else(|| self.core.not_connected())?;
        let data = serde_json::to_string(&payload)?;
        let event = Event::default().event(kind).data(data);
        tokio::select! {
            res = sender.send_timeout(event, SEND_TIMEOUT) => match res {
                Ok(()) => Ok(()),
                Err(SendTimeoutError::Timeout(_)) => {
                    log::warn!(
                        "sse client '{}' ({}) is not reading; {} dropped",
                        self.core.info.client_id,
                        self.core.info.connection_id,
                        kind
                    );
                    Err(HubError::Transport(format!(
                        "sse stream of '{}' is full",
                        self.core.info.client_id
                    )))
                }
                Err(SendTimeoutError::Closed(_)) => Err(self.core.not_connected()),
            },
            _ = &mut closed => Err(self.core.not_connected()),
        }
    }
}

#[async_trait]
impl Connection for SseServerConnection {
    fn connection_info(&self) -> ConnectionInfo {
        self.core.info.clone()
    }

    fn is_connected(&self) -> bool {
        self.core.is_connected() && self.sender.lock().is_some()
    }

    async fn disconnect(&self) {
        // dropping the sender ends the event stream
        self.sender.lock().take();
        self.core.mark_disconnected();
        self.closed.notify_waiters();
    }

    async fn send_request(&self, req: &RequestMessage) -> Result<(), HubError> {
        let payload = converter().encode_request(req)?;
        self.send_event(MESSAGE_TYPE_REQUEST, payload).await
    }

    async fn send_response(&self, resp: &ResponseMessage) -> Result<(), HubError> {
        let payload = converter().encode_response(resp)?;
        self.send_event(MESSAGE_TYPE_RESPONSE, payload).await
    }

    async fn send_notification(&self, notif: &NotificationMessage) -> Result<(), HubError> {
        if !self.core.subs.matches(notif) {
            return Ok(());
        }
        let payload = converter().encode_notification(notif)?;
        self.send_event(MESSAGE_TYPE_NOTIFICATION, payload).await
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

/// Open streams by `(clientID, connectionID)`, so posted messages reach the connection core.
type StreamMap = Mutex<HashMap<ConnectionKey, Weak<SseServerConnection>>>;

#[derive(Clone)]
struct SseState {
    http: Weak<HttpBasicServer>,
    path: String,
    manager: Arc<ConnectionManager>,
    handlers: Arc<ServerHandlers>,
    streams: Arc<StreamMap>,
}

impl SseState {
    fn connect_url(&self) -> String {
        match self.http.upgrade() {
            Some(http) => format!("{}{}", http.base_url(), self.path),
            None => self.path.clone(),
        }
    }

    fn stream_of(&self, client: &AuthenticatedClient) -> Option<Arc<SseServerConnection>> {
        if client.connection_id.is_empty() {
            return None;
        }
        let key = (client.client_id.clone(), client.connection_id.clone());
        self.streams
            .lock()
            .get(&key)
            .and_then(Weak::upgrade)
            .filter(|c| c.is_connected())
    }
}

/// Removes the connection once axum drops the event stream.
struct StreamGuard {
    conn: Arc<SseServerConnection>,
    manager: Arc<ConnectionManager>,
    streams: Arc<StreamMap>,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        let key = self.conn.core.info.key();
        {
            let mut streams = self.streams.lock();
            let current = streams.get(&key).map(|w| w.as_ptr() == Arc::as_ptr(&self.conn));
            if current == Some(true) {
                streams.remove(&key);
            }
        }
        let conn: ConnectionRef = self.conn.clone();
        let manager = self.manager.clone();
        if let Ok(rt) = tokio::runtime::Handle::try_current() {
            rt.spawn(async move { manager.remove_connection(&conn).await });
        }
    }
}

async fn sse_connect(
    State(state): State<SseState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    client: AuthenticatedClient,
) -> Response {
    let cid = match client.require_cid() {
        Ok(cid) => cid.to_string(),
        Err(resp) => return resp,
    };
    let mut info = ConnectionInfo::new(
        &client.client_id,
        &cid,
        &state.connect_url(),
        ProtocolType::HiveotSse,
    );
    info.remote_addr = remote.to_string();

    let (tx, rx) = mpsc::channel::<Event>(1);
    // capacity 1 guarantees the ping is the first event
    let _ = tx.try_send(Event::default().event(SSE_PING_EVENT).data(now_rfc3339()));
    let conn = Arc::new(SseServerConnection::new(info.clone(), &state.handlers, tx));
    if let Err(e) = state.manager.add_connection(conn.clone()).await {
        return problem_response(&e);
    }
    state
        .streams
        .lock()
        .insert(info.key(), Arc::downgrade(&conn));
    log::info!(
        "sse connection '{}' of client '{}' from {}",
        cid,
        client.client_id,
        remote
    );
    conn.core.handlers.notify_connect(true, None, info);

    let guard = StreamGuard {
        conn,
        manager: state.manager.clone(),
        streams: state.streams.clone(),
    };
    let stream = futures_util::stream::unfold((rx, guard), |(mut rx, guard)| async move {
        rx.recv()
            .await
            .map(|ev| (Ok::<Event, Infallible>(ev), (rx, guard)))
    });
    let mut resp = Sse::new(stream)
        .keep_alive(KeepAlive::new().interval(KEEP_ALIVE_INTERVAL))
        .into_response();
    resp.headers_mut()
        .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    resp
}

/// 200 with the response message, or 201 with a pending action status when the result
/// follows later on the stream.
fn reply_message(req: &RequestMessage, resp: Option<ResponseMessage>) -> Response {
    match resp {
        None => {
            let status = req.create_action_status(ResponseStatus::Pending, "");
            (StatusCode::CREATED, Json(status)).into_response()
        }
        Some(resp) => match converter().encode_response(&resp) {
            Ok(v) => (StatusCode::OK, Json(v)).into_response(),
            Err(e) => problem_response(&e),
        },
    }
}

fn is_subscription_op(op: &str) -> bool {
    is_subscribe_op(op) || is_unsubscribe_op(op) || is_observe_op(op) || is_unobserve_op(op)
}

async fn sse_request(
    State(state): State<SseState>,
    client: AuthenticatedClient,
    body: Bytes,
) -> Response {
    if let Err(resp) = client.require_cid() {
        return resp;
    }
    let Some(mut req) = converter().decode_request(&body) else {
        return problem_response(&HubError::InvalidArgument("not a request message".into()));
    };
    if let Some(conn) = state.stream_of(&client) {
        let this: ConnectionRef = conn.clone();
        let resp = conn.core.on_request(Some(this), req.clone()).await;
        return reply_message(&req, resp);
    }
    req.sender_id = client.client_id.clone();
    if req.operation == OP_PING {
        let resp = req.create_response(Value::from(PONG), None);
        return reply_message(&req, Some(resp));
    }
    if is_subscription_op(&req.operation) {
        return problem_response(&HubError::NotFound(format!(
            "no sse connection '{}' for client '{}'",
            client.connection_id, client.client_id
        )));
    }
    let resp = state.handlers.handlers.dispatch_request(req.clone(), None).await;
    reply_message(&req, resp)
}

async fn sse_response(
    State(state): State<SseState>,
    client: AuthenticatedClient,
    body: Bytes,
) -> Response {
    if let Err(resp) = client.require_cid() {
        return resp;
    }
    let Some(mut resp) = converter().decode_response(&body) else {
        return problem_response(&HubError::InvalidArgument("not a response message".into()));
    };
    match state.stream_of(&client) {
        Some(conn) => conn.core.on_response(resp).await,
        None => {
            resp.sender_id = client.client_id.clone();
            if let Err(e) = state.handlers.handlers.dispatch_response(resp).await {
                return problem_response(&e);
            }
        }
    }
    StatusCode::OK.into_response()
}

async fn sse_notification(
    State(state): State<SseState>,
    client: AuthenticatedClient,
    body: Bytes,
) -> Response {
    if let Err(resp) = client.require_cid() {
        return resp;
    }
    let Some(mut notif) = converter().decode_notification(&body) else {
        return problem_response(&HubError::InvalidArgument("not a notification message".into()));
    };
    match state.stream_of(&client) {
        Some(conn) => conn.core.on_notification(notif).await,
        None => {
            notif.sender_id = client.client_id.clone();
            state.handlers.handlers.dispatch_notification(notif).await;
        }
    }
    StatusCode::OK.into_response()
}

/// SSE server. Its routes are served by the HTTP-basic server's listener.
pub struct HiveotSseServer {
    http: Arc<HttpBasicServer>,
    path: String,
    manager: Arc<ConnectionManager>,
}

impl HiveotSseServer {
    /// Register the SSE routes on `http`. Call before the HTTP server starts.
    pub fn new(http: Arc<HttpBasicServer>, path: &str, handlers: Arc<ServerHandlers>) -> Self {
        let manager = Arc::new(ConnectionManager::new());
        let state = SseState {
            http: Arc::downgrade(&http),
            path: path.to_string(),
            manager: manager.clone(),
            handlers,
            streams: Arc::new(Mutex::new(HashMap::new())),
        };
        let routes = Router::new()
            .route(path, get(sse_connect))
            .route(SSE_REQUEST_PATH, post(sse_request))
            .route(SSE_RESPONSE_PATH, post(sse_response))
            .route(SSE_NOTIFICATION_PATH, post(sse_notification))
            .with_state(state);
        http.add_routes(routes);
        Self {
            http,
            path: path.to_string(),
            manager,
        }
    }

    pub fn connection_manager(&self) -> &ConnectionManager {
        &self.manager
    }
}

#[async_trait]
impl TransportServer for HiveotSseServer {
    fn protocol_type(&self) -> ProtocolType {
        ProtocolType::HiveotSse
    }

    fn connect_url(&self) -> String {
        let base = self.http.base_url();
        if base.is_empty() {
            return base;
        }
        format!("{}{}", base, self.path)
    }

    async fn start(&self) -> anyhow::Result<()> {
        log::info!("sse server ready at {}", self.path);
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
                ],
                "href": self.connect_url(),
                "subprotocol": "sse",
                "contentType": "text/event-stream",
            }),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn connection(subscribe: bool) -> (SseServerConnection, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(4);
        let info = ConnectionInfo::new("user1", "cid1", "", ProtocolType::HiveotSse);
        let conn = SseServerConnection::new(info, &ServerHandlers::new(), tx);
        if subscribe {
            let req = RequestMessage::new(OP_SUBSCRIBE_EVENT, "thing1", "", Value::Null, "s1");
            conn.core.subs.apply_request(&req);
        }
        (conn, rx)
    }

    #[tokio::test]
    async fn notifications_need_a_subscription() {
        let (conn, mut rx) = connection(false);
        let notif = NotificationMessage::new(OP_SUBSCRIBE_EVENT, "thing1", "event1", json!(1));
        conn.send_notification(&notif).await.unwrap();
        assert!(rx.try_recv().is_err());

        let (conn, mut rx) = connection(true);
        conn.send_notification(&notif).await.unwrap();
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn send_after_disconnect_fails() {
        let (conn, _rx) = connection(false);
        conn.disconnect().await;
        assert!(!conn.is_connected());
        let req = RequestMessage::new(OP_INVOKE_ACTION, "t", "a", Value::Null, "c");
        let err = conn.send_request(&req).await.unwrap_err();
        assert!(matches!(err, HubError::Transport(_)));
    }

    #[tokio::test]
    async fn disconnect_releases_a_blocked_send() {
        let (tx, _rx) = mpsc::channel(1);
        let info = ConnectionInfo::new("user1", "cid1", "", ProtocolType::HiveotSse);
        let conn = Arc::new(SseServerConnection::new(info, &ServerHandlers::new(), tx));
        let req = RequestMessage::new(OP_INVOKE_ACTION, "t", "a", Value::Null, "c");
        // fills the only slot; nobody reads the stream
        conn.send_request(&req).await.unwrap();

        let blocked = {
            let conn = conn.clone();
            let req = req.clone();
            tokio::spawn(async move { conn.send_request(&req).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!blocked.is_finished());
        conn.disconnect().await;

        let res = tokio::time::timeout(Duration::from_secs(1), blocked)
            .await
            .expect("send still blocked after disconnect")
            .unwrap();
        assert!(matches!(res, Err(HubError::Transport(_))));
    }

    #[test]
    fn pending_reply_is_created() {
        let req = RequestMessage::new(OP_INVOKE_ACTION, "t", "a", Value::Null, "c");
        assert_eq!(reply_message(&req, None).status(), StatusCode::CREATED);
        let done = req.create_response(json!(1), None);
        assert_eq!(reply_message(&req, Some(done)).status(), StatusCode::OK);
    }
}
