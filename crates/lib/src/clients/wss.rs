//! Websocket client connection (HiveOT or WoT format, set by the converter).

use super::state::{ClientState, RECONNECT_INTERVAL};
use crate::connections::{
    Connection, ConnectHandler, ConnectionInfo, ConnectionRef, NotificationHandler,
    RequestHandler, ResponseHandler,
};
use crate::error::HubError;
use crate::messaging::{
    new_id, MessageConverter, NotificationMessage, RequestMessage, ResponseMessage,
};
use crate::servers::CONNECTION_ID_HEADER;
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{FutureExt, SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct WssClient {
    this: Weak<WssClient>,
    state: ClientState,
    converter: Arc<dyn MessageConverter>,
    sink: tokio::sync::Mutex<Option<SplitSink<WsStream, Message>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl WssClient {
    /// Client for `connect_url` (e.g. `ws://host:8444/hiveot/wss`) with a fresh connection ID.
    pub fn new(
        connect_url: &str,
        client_id: &str,
        converter: Arc<dyn MessageConverter>,
    ) -> Arc<Self> {
        let info = ConnectionInfo::new(client_id, &new_id(), connect_url, converter.protocol_type());
        Self::with_info(info, converter)
    }

    pub fn with_info(info: ConnectionInfo, converter: Arc<dyn MessageConverter>) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            state: ClientState::new(info),
            converter,
            sink: tokio::sync::Mutex::new(None),
            reader: Mutex::new(None),
        })
    }

    /// Enable or disable reconnecting after the connection drops (default on).
    pub fn set_reconnect(&self, enabled: bool) {
        self.state.set_reconnect(enabled);
    }

    /// Connect with a bearer token. The token is reused when reconnecting.
    pub async fn connect_with_token(&self, token: &str) -> Result<(), HubError> {
        self.state.set_token(token);
        self.state.set_closing(false);
        self.open().await
    }

    async fn open(&self) -> Result<(), HubError> {
        let mut request = self.state.info.connect_url.as_str().into_client_request()?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", self.state.token()))
            .map_err(|e| HubError::InvalidArgument(e.to_string()))?;
        let cid = HeaderValue::from_str(&self.state.info.connection_id)
            .map_err(|e| HubError::InvalidArgument(e.to_string()))?;
        request.headers_mut().insert("authorization", bearer);
        request.headers_mut().insert(CONNECTION_ID_HEADER, cid);

        let (ws, _) = tokio_tungstenite::connect_async(request).await?;
        let (sink, stream) = ws.split();
        *self.sink.lock().await = Some(sink);
        let reader = tokio::spawn(read_loop(self.this.clone(), stream));
        if let Some(old) = self.reader.lock().replace(reader) {
            old.abort();
        }
        self.state.mark_connected();
        Ok(())
    }

    async fn write(&self, msg: Value) -> Result<(), HubError> {
        let text = serde_json::to_string(&msg)?;
        let mut sink = self.sink.lock().await;
        match sink.as_mut() {
            Some(s) => s.send(Message::Text(text)).await.map_err(HubError::from),
            None => Err(self.state.not_connected()),
        }
    }

    async fn on_connection_lost(&self, err: Option<HubError>) {
        self.sink.lock().await.take();
        self.state.mark_disconnected(err);
        if self.state.should_reconnect() {
            tokio::spawn(reconnect_loop(self.this.clone()));
        }
    }
}

fn read_loop(weak: Weak<WssClient>, mut stream: SplitStream<WsStream>) -> BoxFuture<'static, ()> {
    async move {
        let mut err = None;
        while let Some(msg) = stream.next().await {
            let Some(client) = weak.upgrade() else { return };
            match msg {
                Ok(Message::Text(text)) => {
                    tokio::spawn(async move {
                        let this: ConnectionRef = client.clone();
                        client
                            .state
                            .dispatch(text.as_bytes(), client.converter.as_ref(), this)
                            .await;
                    });
                }
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    err = Some(HubError::from(e));
                    break;
                }
            }
        }
        if let Some(client) = weak.upgrade() {
            client.on_connection_lost(err).await;
        }
    }
    .boxed()
}

/// Reconnect immediately, then every [`RECONNECT_INTERVAL`], until connected, closed, or the
/// hub refuses the token.
fn reconnect_loop(weak: Weak<WssClient>) -> BoxFuture<'static, ()> {
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
impl Connection for WssClient {
    fn connection_info(&self) -> ConnectionInfo {
        self.state.info.clone()
    }

    fn is_connected(&self) -> bool {
        self.state.is_connected()
    }

    async fn disconnect(&self) {
        self.state.set_closing(true);
        let sink = self.sink.lock().await.take();
        if let Some(mut sink) = sink {
            let _ = sink.send(Message::Close(None)).await;
            let _ = sink.close().await;
        }
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
        self.state.mark_disconnected(None);
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
        let msg = self.converter.encode_notification(notif)?;
        self.write(msg).await
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
