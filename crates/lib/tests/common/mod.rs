//! Shared setup for the integration tests: a hub on an ephemeral port, tokens and clients.

#![allow(dead_code)]

use futures_util::FutureExt;
use hub::authn::{Authenticator, ClientType, PasswordStore, SessionAuthenticator};
use hub::clients::{HiveotSseClient, WssClient};
use hub::config::ServerConfig;
use hub::connections::{ConnectionRef, NotificationHandler, RequestHandler, ResponseHandler};
use hub::messaging::{
    HiveotConverter, MessageConverter, NotificationMessage, ProtocolType, RequestMessage,
    ResponseMessage, WotWssConverter,
};
use hub::servers::TransportManager;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

pub const TIMEOUT: Duration = Duration::from_secs(5);

pub struct TestHub {
    pub transport: Arc<TransportManager>,
    pub authn: Arc<SessionAuthenticator>,
    pub dir: TempDir,
}

/// Start all transports on 127.0.0.1 with an ephemeral port. No handlers are set.
pub async fn start_hub() -> TestHub {
    let dir = tempfile::tempdir().expect("temp dir");
    let passwords =
        PasswordStore::open(dir.path().join("hub.passwd")).expect("open password store");
    passwords
        .add("user1", "User One", ClientType::User, "pass1")
        .expect("add user1");
    let authn = Arc::new(SessionAuthenticator::new(
        Arc::new(passwords),
        Duration::from_secs(600),
    ));
    let config = ServerConfig {
        port: 0,
        ..ServerConfig::default()
    };
    let transport = Arc::new(TransportManager::new(&config, authn.clone()));
    transport.start().await.expect("start transports");
    TestHub {
        transport,
        authn,
        dir,
    }
}

impl TestHub {
    pub fn url(&self, protocol: ProtocolType) -> String {
        self.transport
            .get_endpoints()
            .get(protocol.as_str())
            .cloned()
            .unwrap_or_default()
    }

    pub fn token(&self, client_id: &str) -> String {
        self.authn
            .add_token(client_id, Duration::from_secs(600))
            .expect("issue token")
    }

    /// Connected websocket client; `protocol` picks the HiveOT or WoT endpoint.
    pub async fn wss_client(&self, client_id: &str, protocol: ProtocolType) -> Arc<WssClient> {
        let converter: Arc<dyn MessageConverter> = match protocol {
            ProtocolType::WotWss => Arc::new(WotWssConverter::new()),
            _ => Arc::new(HiveotConverter::new()),
        };
        let client = WssClient::new(&self.url(protocol), client_id, converter);
        client
            .connect_with_token(&self.token(client_id))
            .await
            .expect("connect websocket client");
        client
    }

    pub async fn sse_client(&self, client_id: &str) -> Arc<HiveotSseClient> {
        let client = HiveotSseClient::new(&self.url(ProtocolType::HiveotSse), client_id)
            .expect("sse client");
        client
            .connect_with_token(&self.token(client_id))
            .await
            .expect("connect sse client");
        client
    }

    /// Wait until the hub holds a connection of `client_id`.
    pub async fn wait_for_client(&self, client_id: &str) -> ConnectionRef {
        for _ in 0..100 {
            if let Some(c) = self.transport.get_connection_by_client_id(client_id) {
                return c;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("client '{}' never connected", client_id);
    }
}

/// Poll `cond` with short sleeps; returns its last value.
pub async fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    cond()
}

/// Answers every request with its input.
pub fn echo_handler() -> RequestHandler {
    Arc::new(|req: RequestMessage, _reply: Option<ConnectionRef>| {
        async move {
            let out = req.input.clone();
            Some(req.create_response(out, None))
        }
        .boxed()
    })
}

pub fn notification_collector() -> (NotificationHandler, Arc<Mutex<Vec<NotificationMessage>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let handler: NotificationHandler = Arc::new(move |n: NotificationMessage| {
        sink.lock().push(n);
        async {}.boxed()
    });
    (handler, seen)
}

pub fn response_collector() -> (ResponseHandler, Arc<Mutex<Vec<ResponseMessage>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let handler: ResponseHandler = Arc::new(move |r: ResponseMessage| {
        sink.lock().push(r);
        async { Ok(()) }.boxed()
    });
    (handler, seen)
}
