//! Connection manager: indexes live connections by `(clientID, connectionID)` and by client.

use super::{same_connection, ConnectionKey, ConnectionRef};
use crate::error::HubError;
use crate::messaging::NotificationMessage;
use futures_util::future::join_all;
use futures_util::FutureExt;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;

#[derive(Default)]
struct Indexes {
    /// `(clientID, connectionID)` -> connection
    by_cid: HashMap<ConnectionKey, ConnectionRef>,
    /// clientID -> connection IDs in add order
    by_client: HashMap<String, Vec<String>>,
}

impl Indexes {
    fn insert(&mut self, key: ConnectionKey, c: ConnectionRef) {
        let (client_id, cid) = &key;
        let cids = self.by_client.entry(client_id.clone()).or_default();
        if !cids.iter().any(|x| x == cid) {
            cids.push(cid.clone());
        }
        self.by_cid.insert(key, c);
    }

    fn remove(&mut self, key: &ConnectionKey) -> Option<ConnectionRef> {
        let removed = self.by_cid.remove(key);
        let (client_id, cid) = key;
        if let Some(cids) = self.by_client.get_mut(client_id) {
            cids.retain(|x| x != cid);
            if cids.is_empty() {
                self.by_client.remove(client_id);
            }
        }
        removed
    }
}

/// Tracks the connections of one server.
#[derive(Default)]
pub struct ConnectionManager {
    indexes: RwLock<Indexes>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection. An existing connection with the same client and connection ID
    /// is closed and replaced.
    pub async fn add_connection(&self, c: ConnectionRef) -> Result<(), HubError> {
        let info = c.connection_info();
        if !info.is_valid() {
            return Err(HubError::InvalidArgument(format!(
                "connection without client or connection ID (client='{}', cid='{}')",
                info.client_id, info.connection_id
            )));
        }
        let key = info.key();
        let evicted = {
            let mut idx = self.indexes.write();
            let old = idx.by_cid.get(&key).cloned();
            idx.insert(key, c);
            old
        };
        if let Some(old) = evicted {
            log::warn!(
                "connection '{}' of client '{}' already exists; closing the old one",
                info.connection_id,
                info.client_id
            );
            old.disconnect().await;
        }
        log::debug!(
            "added connection '{}' of client '{}' ({})",
            info.connection_id,
            info.client_id,
            info.protocol_type
        );
        Ok(())
    }

    /// Close and drop a connection. Removing a connection that was already replaced or
    /// removed only closes it.
    pub async fn remove_connection(&self, c: &ConnectionRef) {
        let info = c.connection_info();
        let key = info.key();
        let removed = {
            let mut idx = self.indexes.write();
            match idx.by_cid.get(&key) {
                Some(existing) if same_connection(existing, c) => idx.remove(&key),
                _ => None,
            }
        };
        if removed.is_none() {
            log::debug!(
                "remove connection: '{}' of client '{}' not found",
                info.connection_id,
                info.client_id
            );
        }
        c.disconnect().await;
    }

    /// Close every connection of a client.
    pub async fn close_all_client_connections(&self, client_id: &str) {
        let removed: Vec<ConnectionRef> = {
            let mut idx = self.indexes.write();
            let cids = idx.by_client.remove(client_id).unwrap_or_default();
            cids.iter()
                .filter_map(|cid| idx.by_cid.remove(&(client_id.to_string(), cid.clone())))
                .collect()
        };
        log::info!(
            "closing {} connection(s) of client '{}'",
            removed.len(),
            client_id
        );
        join_all(removed.iter().map(|c| c.disconnect())).await;
    }

    /// Close and drop everything.
    pub async fn close_all(&self) {
        let all: Vec<ConnectionRef> = {
            let mut idx = self.indexes.write();
            idx.by_client.clear();
            idx.by_cid.drain().map(|(_, c)| c).collect()
        };
        if !all.is_empty() {
            log::info!("closing {} connection(s)", all.len());
        }
        join_all(all.iter().map(|c| c.disconnect())).await;
    }

    /// Run `f` for every connection, outside the lock. A panicking callback is logged and
    /// the iteration continues.
    pub fn for_each_connection<F>(&self, f: F)
    where
        F: Fn(&ConnectionRef),
    {
        for c in self.snapshot() {
            if std::panic::catch_unwind(AssertUnwindSafe(|| f(&c))).is_err() {
                log::error!(
                    "connection callback panicked for client '{}'",
                    c.connection_info().client_id
                );
            }
        }
    }

    /// Offer a notification to every connection; each decides based on its subscriptions.
    /// Failures are logged and do not affect the other connections.
    pub async fn send_notification(&self, notif: &NotificationMessage) {
        let conns = self.snapshot();
        let sends = conns.iter().map(|c| async move {
            let res = AssertUnwindSafe(c.send_notification(notif))
                .catch_unwind()
                .await;
            let info = c.connection_info();
            match res {
                Ok(Ok(())) => {}
                Ok(Err(e)) => log::warn!(
                    "notification {}/{} to '{}' ({}) failed: {}",
                    notif.thing_id,
                    notif.name,
                    info.client_id,
                    info.connection_id,
                    e
                ),
                Err(_) => log::error!(
                    "notification send panicked for '{}' ({})",
                    info.client_id,
                    info.connection_id
                ),
            }
        });
        join_all(sends).await;
    }

    pub fn get_connection_by_connection_id(
        &self,
        client_id: &str,
        connection_id: &str,
    ) -> Option<ConnectionRef> {
        let key = (client_id.to_string(), connection_id.to_string());
        self.indexes.read().by_cid.get(&key).cloned()
    }

    /// First connection of a client, in add order.
    pub fn get_connection_by_client_id(&self, client_id: &str) -> Option<ConnectionRef> {
        let idx = self.indexes.read();
        let cid = idx.by_client.get(client_id)?.first()?;
        idx.by_cid.get(&(client_id.to_string(), cid.clone())).cloned()
    }

    /// Connection IDs of a client, in add order.
    pub fn connection_ids(&self, client_id: &str) -> Vec<String> {
        self.indexes
            .read()
            .by_client
            .get(client_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.indexes.read().by_cid.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn snapshot(&self) -> Vec<ConnectionRef> {
        self.indexes.read().by_cid.values().cloned().collect()
    }
}
