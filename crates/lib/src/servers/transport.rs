//! Transport manager: runs the enabled protocol servers as one transport.

use super::{
    Authorizer, HiveotSseServer, HttpBasicServer, ServerHandlers, TransportServer, WssServer,
};
use crate::authn::Authenticator;
use crate::config::ServerConfig;
use crate::connections::{
    ConnectHandler, ConnectionRef, NotificationHandler, RequestHandler, ResponseHandler,
};
use crate::messaging::{HiveotConverter, NotificationMessage, ProtocolType, WotWssConverter};
use anyhow::Context;
use futures_util::future::join_all;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

/// What the hub advertises for discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryRecord {
    pub instance_name: String,
    /// Where the directory TD can be read.
    #[serde(rename = "directoryURL")]
    pub directory_url: String,
    /// protocol type -> connect URL
    pub endpoints: BTreeMap<String, String>,
}

pub struct TransportManager {
    handlers: Arc<ServerHandlers>,
    http: Arc<HttpBasicServer>,
    /// In start order; the HTTP server comes first since it owns the listener.
    servers: Vec<Arc<dyn TransportServer>>,
    preferred: ProtocolType,
    instance_name: String,
    discovery: RwLock<Option<DiscoveryRecord>>,
}

impl TransportManager {
    /// Create the HTTP server plus every sub-protocol server enabled in the config.
    pub fn new(config: &ServerConfig, authn: Arc<dyn Authenticator>) -> Self {
        let handlers = Arc::new(ServerHandlers::new());
        let http = Arc::new(HttpBasicServer::new(
            &config.bind,
            config.port,
            authn,
            handlers.clone(),
        ));
        let mut servers: Vec<Arc<dyn TransportServer>> = vec![http.clone()];
        if config.enable_sse {
            servers.push(Arc::new(HiveotSseServer::new(
                http.clone(),
                &config.sse_path,
                handlers.clone(),
            )));
        }
        if config.enable_hiveot_wss {
            servers.push(Arc::new(WssServer::new(
                http.clone(),
                &config.hiveot_wss_path,
                Arc::new(HiveotConverter::new()),
                handlers.clone(),
            )));
        }
        if config.enable_wot_wss {
            servers.push(Arc::new(WssServer::new(
                http.clone(),
                &config.wot_wss_path,
                Arc::new(WotWssConverter::new()),
                handlers.clone(),
            )));
        }
        let mut preferred = ProtocolType::HttpBasic;
        for s in &servers {
            if s.protocol_type().preference() > preferred.preference() {
                preferred = s.protocol_type();
            }
        }
        Self {
            handlers,
            http,
            servers,
            preferred,
            instance_name: config.instance_name.clone(),
            discovery: RwLock::new(None),
        }
    }

    pub fn set_request_handler(&self, h: Option<RequestHandler>) {
        self.handlers.set_request_handler(h);
    }

    pub fn set_response_handler(&self, h: Option<ResponseHandler>) {
        self.handlers.set_response_handler(h);
    }

    pub fn set_notification_handler(&self, h: Option<NotificationHandler>) {
        self.handlers.set_notification_handler(h);
    }

    pub fn set_connect_handler(&self, h: Option<ConnectHandler>) {
        self.handlers.set_connect_handler(h);
    }

    /// Check subscription and observation requests before a connection applies them.
    pub fn set_authorizer(&self, a: Option<Authorizer>) {
        self.handlers.set_authorizer(a);
    }

    /// Best protocol among the enabled servers.
    pub fn preferred_protocol(&self) -> ProtocolType {
        self.preferred
    }

    pub fn http_server(&self) -> &Arc<HttpBasicServer> {
        &self.http
    }

    pub async fn start(&self) -> anyhow::Result<()> {
        for (i, server) in self.servers.iter().enumerate() {
            let started = server
                .start()
                .await
                .with_context(|| format!("starting {} server", server.protocol_type()));
            if let Err(e) = started {
                for s in self.servers[..i].iter().rev() {
                    s.stop().await;
                }
                return Err(e);
            }
        }
        log::info!(
            "transports started; preferred protocol {} at {}",
            self.preferred,
            self.connect_url()
        );
        Ok(())
    }

    /// Stop all servers, in reverse start order.
    pub async fn stop(&self) {
        for server in self.servers.iter().rev() {
            server.stop().await;
        }
        log::info!("transports stopped");
    }

    /// Connect URL of the preferred protocol.
    pub fn connect_url(&self) -> String {
        self.servers
            .iter()
            .find(|s| s.protocol_type() == self.preferred)
            .map(|s| s.connect_url())
            .unwrap_or_default()
    }

    /// protocol type -> connect URL of every running server.
    pub fn get_endpoints(&self) -> BTreeMap<String, String> {
        self.servers
            .iter()
            .map(|s| (s.protocol_type().to_string(), s.connect_url()))
            .filter(|(_, url)| !url.is_empty())
            .collect()
    }

    /// Offer the notification to the connections of every server.
    pub async fn send_notification(&self, notif: &NotificationMessage) {
        join_all(self.servers.iter().map(|s| s.send_notification(notif))).await;
    }

    pub fn get_connection_by_connection_id(
        &self,
        client_id: &str,
        connection_id: &str,
    ) -> Option<ConnectionRef> {
        self.servers
            .iter()
            .find_map(|s| s.get_connection_by_connection_id(client_id, connection_id))
    }

    pub fn get_connection_by_client_id(&self, client_id: &str) -> Option<ConnectionRef> {
        self.servers
            .iter()
            .find_map(|s| s.get_connection_by_client_id(client_id))
    }

    pub async fn close_all_client_connections(&self, client_id: &str) {
        join_all(
            self.servers
                .iter()
                .map(|s| s.close_all_client_connections(client_id)),
        )
        .await;
    }

    pub async fn close_all(&self) {
        join_all(self.servers.iter().map(|s| s.close_all())).await;
    }

    pub fn add_td_forms(&self, td: &mut Value) {
        for server in &self.servers {
            server.add_td_forms(td);
        }
    }

    /// Publish where the directory lives and which endpoints serve it.
    pub fn start_discovery(&self, directory_path: &str) -> DiscoveryRecord {
        let record = DiscoveryRecord {
            instance_name: self.instance_name.clone(),
            directory_url: format!("{}{}", self.http.base_url(), directory_path),
            endpoints: self.get_endpoints(),
        };
        log::info!(
            "discovery: '{}' directory at {} with {} endpoint(s)",
            record.instance_name,
            record.directory_url,
            record.endpoints.len()
        );
        *self.discovery.write() = Some(record.clone());
        record
    }

    pub fn stop_discovery(&self) {
        self.discovery.write().take();
    }

    pub fn discovery_record(&self) -> Option<DiscoveryRecord> {
        self.discovery.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authn::{PasswordStore, SessionAuthenticator};
    use std::time::Duration;

    fn manager(config: &ServerConfig) -> (TransportManager, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let passwords = Arc::new(PasswordStore::open(&dir.path().join("hub.passwd")).unwrap());
        let authn: Arc<dyn Authenticator> =
            Arc::new(SessionAuthenticator::new(passwords, Duration::from_secs(60)));
        (TransportManager::new(config, authn), dir)
    }

    #[test]
    fn preference_follows_enabled_servers() {
        let mut config = ServerConfig::default();
        let (tm, _dir) = manager(&config);
        assert_eq!(tm.preferred_protocol(), ProtocolType::HiveotWss);

        config.enable_hiveot_wss = false;
        config.enable_wot_wss = false;
        let (tm, _dir) = manager(&config);
        assert_eq!(tm.preferred_protocol(), ProtocolType::HiveotSse);

        config.enable_sse = false;
        let (tm, _dir) = manager(&config);
        assert_eq!(tm.preferred_protocol(), ProtocolType::HttpBasic);
    }

    #[tokio::test]
    async fn endpoints_and_discovery() {
        let config = ServerConfig {
            port: 0,
            ..ServerConfig::default()
        };
        let (tm, _dir) = manager(&config);
        assert!(tm.get_endpoints().is_empty());
        tm.start().await.unwrap();
        let endpoints = tm.get_endpoints();
        assert_eq!(endpoints.len(), 4);
        assert!(endpoints["wot-wss"].starts_with("ws://127.0.0.1:"));
        assert!(endpoints["wot-wss"].ends_with("/wot/wss"));

        let record = tm.start_discovery("/things/directory");
        assert_eq!(record.instance_name, "hiveot");
        assert!(record.directory_url.ends_with("/things/directory"));
        assert_eq!(tm.discovery_record(), Some(record));
        tm.stop().await;
        assert!(tm.connect_url().is_empty());
    }
}
