//! State and inbound dispatch shared by the SSE and websocket server connections.

use super::{Authorizer, ServerHandlers};
use crate::connections::{ConnectionInfo, ConnectionRef, Handlers, SubscriptionState};
use crate::error::HubError;
use crate::messaging::vocab::*;
use crate::messaging::{NotificationMessage, RequestMessage, ResponseMessage};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

pub(crate) struct ConnectionCore {
    pub info: ConnectionInfo,
    pub subs: SubscriptionState,
    pub handlers: Handlers,
    authorizer: Option<Authorizer>,
    connected: AtomicBool,
    last_activity: Mutex<Instant>,
}

impl ConnectionCore {
    pub fn new(info: ConnectionInfo, server: &ServerHandlers) -> Self {
        Self {
            info,
            subs: SubscriptionState::new(),
            handlers: server.for_connection(),
            authorizer: server.authorizer.get(),
            connected: AtomicBool::new(true),
            last_activity: Mutex::new(Instant::now()),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Flip to disconnected. Returns true only for the first call; that call also informs
    /// the connect handler and drops the subscriptions.
    pub fn mark_disconnected(&self) -> bool {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return false;
        }
        self.subs.clear();
        log::debug!(
            "connection '{}' of client '{}' closed",
            self.info.connection_id,
            self.info.client_id
        );
        self.handlers
            .notify_connect(false, None, self.info.clone());
        true
    }

    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    pub fn last_activity(&self) -> Instant {
        *self.last_activity.lock()
    }

    pub fn not_connected(&self) -> HubError {
        HubError::Transport(format!(
            "connection '{}' of client '{}' is closed",
            self.info.connection_id, self.info.client_id
        ))
    }

    /// Handle a request that arrived on this connection. Pings are answered here; subscription
    /// changes are applied before the application handler sees them.
    pub async fn on_request(
        &self,
        this: Option<ConnectionRef>,
        mut req: RequestMessage,
    ) -> Option<ResponseMessage> {
        self.touch();
        req.sender_id = self.info.client_id.clone();
        let op = req.operation.clone();
        if op == OP_PING {
            return Some(req.create_response(Value::from(PONG), None));
        }
        let is_subscription =
            is_subscribe_op(&op) || is_unsubscribe_op(&op) || is_observe_op(&op) || is_unobserve_op(&op);
        if !is_subscription {
            return self.handlers.dispatch_request(req, this).await;
        }
        if let Some(authorize) = &self.authorizer {
            if !authorize(&req) {
                log::info!(
                    "'{}' is not allowed to {} '{}'",
                    req.sender_id,
                    op,
                    req.thing_id
                );
                let err = HubError::Unauthorized(format!(
                    "'{}' may not {} '{}'",
                    req.sender_id, op, req.thing_id
                ));
                return Some(req.create_response(Value::Null, Some(&err)));
            }
        }
        self.subs.apply_request(&req);
        let ack = req.create_response(Value::Null, None);
        match self.handlers.request.get() {
            Some(h) => h(req, this).await.or(Some(ack)),
            None => Some(ack),
        }
    }

    pub async fn on_response(&self, mut resp: ResponseMessage) {
        self.touch();
        resp.sender_id = self.info.client_id.clone();
        if let Err(e) = self.handlers.dispatch_response(resp).await {
            log::warn!(
                "response from '{}' not handled: {}",
                self.info.client_id,
                e
            );
        }
    }

    pub async fn on_notification(&self, mut notif: NotificationMessage) {
        self.touch();
        notif.sender_id = self.info.client_id.clone();
        self.handlers.dispatch_notification(notif).await;
    }
}
