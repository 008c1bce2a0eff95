//! HiveOT SSE client connection: an event stream for everything the hub sends, plus HTTP
//! posts for everything the client sends.

use super::http::{error_from_response, parse_url};
use super::state::{ClientState, RECONNECT_INTERVAL};
use crate::connections::{
    Connection, ConnectHandler, ConnectionInfo, ConnectionRef, NotificationHandler,
    RequestHandler, ResponseHandler,
};
use crate::error::HubError;
use crate::messaging::{
    new_id, HiveotConverter, MessageConverter, NotificationMessage, ProtocolType,
    RequestMessage, ResponseMessage,
};
use crate::servers::{
    CONNECTION_ID_HEADER, SSE_NOTIFICATION_PATH, SSE_PING_EVENT, SSE_REQUEST_PATH,
    SSE_RESPONSE_PATH,
};
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use futures_util::{FutureExt, StreamExt};
use parking_lot::Mutex;
use reqwest::{StatusCode, Url};
use serde_json::Value;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// How long to wait for the hub's first ping after the stream opens.
const PING_TIMEOUT: Duration = Duration::from_secs(5);

fn converter() -> HiveotConverter {
    HiveotConverter::for_protocol(ProtocolType::HiveotSse)
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct SseEvent {
    event: String,
    data: String,
}

/// Remove the first complete event block (terminated by a blank line) from `buf`.
fn take_block(buf: &mut Vec<u8>) -> Option<String> {
    let end = buf.windows(2).position(|w| w == b"\n\n")?;
    let block: Vec<u8> = buf.drain(..end + 2).collect();
    Some(String::from_utf8_lossy(&block[..end]).replace('\r', ""))
}

fn parse_event(block: &str) -> Option<SseEvent> {
    let mut event = String::new();
    let mut data: Vec<&str> = Vec::new();
    for line in block.lines() {
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        let (field, value) = line.split_once(':').unwrap_or((line, ""));
        let value = value.strip_prefix(' ').unwrap_or(value);
        match field {
            "event" => event = value.to_string(),
            "data" => data.push(value),
            _ => {}
        }
    }
    if event.is_empty() && data.is_empty() {
        return None;
    }
    if event.is_empty() {
        event = "message".to_string();
    }
    Some(SseEvent {
        event,
        data: data.join("\n"),
    })
}

pub struct HiveotSseClient {
    this: Weak<HiveotSseClient>,
    state: ClientState,
    base: Url,
    http: reqwest::Client,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl HiveotSseClient {
    /// Client for `connect_url` (e.g. `http://host:8444/hiveot/sse`) with a fresh connection ID.
    pub fn new(connect_url: &str, client_id: &str) -> Result<Arc<Self>, HubError> {
        let base = parse_url(connect_url)?;
        let info = ConnectionInfo::new(client_id, &new_id(), connect_url, ProtocolType::HiveotSse);
        Ok(Arc::new_cyclic(|this| Self {
            this: this.clone(),
            state: ClientState::new(info),
            base,
            http: reqwest::Client::new(),
            reader: Mutex::new(None),
        }))
    }

    pub fn set_reconnect(&self, enabled: bool) {
        self.state.set_reconnect(enabled);
    }

    /// Open the event stream with a bearer token; returns once the hub's ping arrived.
    pub async fn connect_with_token(&self, token: &str) -> Result<(), HubError> {
        self.state.set_token(token);
        self.state.set_closing(false);
        self.open().await
    }

    async fn open(&self) -> Result<(), HubError> {
        let resp = self
            .http
            .get(self.base.clone())
            .bearer_auth(self.state.token())
            .header(CONNECTION_ID_HEADER, &self.state.info.connection_id)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(error_from_response(resp).await);
        }
        let (ready_tx, ready_rx) = oneshot::channel();
        let reader = tokio::spawn(read_loop(self.this.clone(), resp, ready_tx));
        let handle = reader.abort_handle();
        if let Some(old) = self.reader.lock().replace(reader) {
            old.abort();
        }
        match tokio::time::timeout(PING_TIMEOUT, ready_rx).await {
            Ok(Ok(())) => {
                self.state.mark_connected();
                Ok(())
            }
            _ => {
                handle.abort();
                Err(HubError::Transport(format!(
                    "no ping from {} after connecting",
                    self.state.info.connect_url
                )))
            }
        }
    }

    async fn post(&self, path: &str, body: Value) -> Result<reqwest::Response, HubError> {
        if !self.state.is_connected() {
            return Err(self.state.not_connected());
        }
        let url = self
            .base
            .join(path)
            .map_err(|e| HubError::InvalidArgument(e.to_string()))?;
        let resp = self
            .http
            .post(url)
            .bearer_auth(self.state.token())
            .header(CONNECTION_ID_HEADER, &self.state.info.connection_id)
            .json(&body)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(error_from_response(resp).await);
        }
        Ok(resp)
    }

    async fn on_connection_lost(&self, err: Option<HubError>) {
        self.state.mark_disconnected(err);
        if self.state.should_reconnect() {
            tokio::spawn(reconnect_loop(self.this.clone()));
        }
    }
}

fn read_loop(
    weak: Weak<HiveotSseClient>,
    resp: reqwest::Response,
    ready: oneshot::Sender<()>,
) -> BoxFuture<'static, ()> {
    async move {
        let mut stream = resp.bytes_stream();
        let mut ready = Some(ready);
        let mut buf: Vec<u8> = Vec::new();
        let mut err = None;
        'read: while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(c) => c,
                Err(e) => {
                    err = Some(HubError::from(e));
                    break;
                }
            };
            buf.extend_from_slice(&chunk);
            while let Some(block) = take_block(&mut buf) {
                let Some(ev) = parse_event(&block) else { continue };
                if ev.event == SSE_PING_EVENT {
                    if let Some(tx) = ready.take() {
                        let _ = tx.send(());
                    }
                    continue;
                }
                let Some(client) = weak.upgrade() else { break 'read };
                tokio::spawn(async move {
                    let this: ConnectionRef = client.clone();
                    client
                        .state
                        .dispatch(ev.data.as_bytes(), &converter(), this)
                        .await;
                });
            }
        }
        if let Some(client) = weak.upgrade() {
            client.on_connection_lost(err).await;
        }
    }
    .boxed()
}

fn reconnect_loop(weak: Weak<HiveotSseClient>) -> BoxFuture<'static, ()> {
    async move {
        let mut delay = Duration::ZERO;
        loop {
            tokio::time::sleep(delay).await;
            delay = RECONNECT_INTERVAL;
            let Some(client) = weak.upgrade() else { return };
            if !client.state.should_reconnect() {
                return;
            }
            match client.open().await {
                Ok(()) => return,
                Err(e) if e.is_unauthorized() => {
                    log::warn!("reconnect to {} refused: {}", client.state.info.connect_url, e);
                    client
                        .state
                        .handlers
                        .notify_connect(false, Some(e), client.state.info.clone());
                    return;
                }
                Err(e) => log::debug!("reconnect to {} failed: {}", client.state.info.connect_url, e),
            }
        }
    }
    .boxed()
}

#[async_trait]
impl Connection for HiveotSseClient {
    fn connection_info(&self) -> ConnectionInfo {
        self.state.info.clone()
    }

    fn is_connected(&self) -> bool {
        self.state.is_connected()
    }

    async fn disconnect(&self) {
        self.state.set_closing(true);
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
        self.state.mark_disconnected(None);
    }

    /// Posts the request. An immediate result in the HTTP reply goes to the response handler;
    /// a 201 means the result follows on the event stream.
    async fn send_request(&self, req: &RequestMessage) -> Result<(), HubError> {
        let resp = self.post(SSE_REQUEST_PATH, converter().encode_request(req)?).await?;
        if resp.status() != StatusCode::OK {
            return Ok(());
        }
        let body = resp.bytes().await?;
        match converter().decode_response(&body) {
            Some(r) => self.state.handlers.dispatch_response(r).await,
            None => Err(HubError::InvalidArgument(format!(
                "reply to '{}' is not a response message",
                req.correlation_id
            ))),
        }
    }

    async fn send_response(&self, resp: &ResponseMessage) -> Result<(), HubError> {
        self.post(SSE_RESPONSE_PATH, converter().encode_response(resp)?)
            .await
            .map(|_| ())
    }

    async fn send_notification(&self, notif: &NotificationMessage) -> Result<(), HubError> {
        self.post(SSE_NOTIFICATION_PATH, converter().encode_notification(notif)?)
            .await
            .map(|_| ())
    }

    fn set_connect_handler(&self, handler: Option<ConnectHandler>) {
        self.state.handlers.connect.set(handler);
    }

    fn set_notification_handler(&self, handler: Option<NotificationHandler>) {
        self.state.handlers.notification.set(handler);
    }

    fn set_request_handler(&self, handler: Option<RequestHandler>) {
        self.state.handlers.request.set(handler);
    }

    fn set_response_handler(&self, handler: Option<ResponseHandler>) {
        self.state.handlers.response.set(handler);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocks_split_on_blank_lines() {
        let mut buf = b"event: sse-ping\ndata: x\n\nevent: request\nda".to_vec();
        let first = take_block(&mut buf).unwrap();
        assert_eq!(first, "event: sse-ping\ndata: x");
        assert!(take_block(&mut buf).is_none());
        buf.extend_from_slice(b"ta: {}\n\n");
        assert_eq!(take_block(&mut buf).unwrap(), "event: request\ndata: {}");
        assert!(buf.is_empty());
    }

    #[test]
    fn events_parse_with_multiline_data() {
        let ev = parse_event("event: notification\ndata: {\"a\":\ndata: 1}").unwrap();
        assert_eq!(ev.event, "notification");
        assert_eq!(ev.data, "{\"a\":\n1}");
        // keep-alive comments carry nothing
        assert!(parse_event(":").is_none());
        assert_eq!(parse_event("data: x").unwrap().event, "message");
    }
}
