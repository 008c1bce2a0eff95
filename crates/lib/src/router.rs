//! Hub request router: joins consumers to agents through digital-twin Thing IDs.
//!
//! Consumers address `dtw:{agentID}:{thingID}`. Requests are authorized, then forwarded to
//! the agent's connection with the agent-local thingID. Agent responses travel back to the
//! requesting connection; agent notifications are republished under the digital-twin ID.

use crate::authz::{required_permission, AuthzService, Permission};
use crate::connections::{
    ConnectHandler, ConnectionInfo, ConnectionRef, NotificationHandler, RequestHandler,
    ResponseHandler, DEFAULT_TIMEOUT,
};
use crate::error::HubError;
use crate::messaging::vocab::*;
use crate::messaging::{new_id, NotificationMessage, RequestMessage, ResponseMessage};
use crate::servers::{Authorizer, TransportManager};
use futures_util::FutureExt;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

pub const DIGITWIN_PREFIX: &str = "dtw";

/// Active requests older than this are dropped even if the agent never answered.
pub const ACTIVE_REQUEST_TTL: Duration = Duration::from_secs(3600);

/// `dtw:{agentID}:{thingID}`
pub fn make_dthing_id(agent_id: &str, thing_id: &str) -> String {
    format!("{}:{}:{}", DIGITWIN_PREFIX, agent_id, thing_id)
}

/// Split a digital-twin Thing ID into agent ID and agent-local thingID.
pub fn split_dthing_id(dthing_id: &str) -> Option<(&str, &str)> {
    let rest = dthing_id.strip_prefix(DIGITWIN_PREFIX)?.strip_prefix(':')?;
    let (agent_id, thing_id) = rest.split_once(':')?;
    if agent_id.is_empty() || thing_id.is_empty() {
        return None;
    }
    Some((agent_id, thing_id))
}

enum ReplyTo {
    Connection(ConnectionRef),
    /// Connectionless requester waiting on the HTTP call.
    Waiter(oneshot::Sender<ResponseMessage>),
}

impl ReplyTo {
    fn is_gone(&self) -> bool {
        match self {
            ReplyTo::Connection(c) => !c.is_connected(),
            ReplyTo::Waiter(tx) => tx.is_closed(),
        }
    }
}

struct ActiveRequest {
    agent_id: String,
    sender_id: String,
    /// The requester's own correlationID, restored on the way back.
    correlation_id: String,
    dthing_id: String,
    operation: String,
    name: String,
    reply: ReplyTo,
    started: Instant,
}

pub struct HubRouter {
    authz: Arc<AuthzService>,
    transport: Arc<TransportManager>,
    /// hub-assigned request ID -> request waiting for its agent
    active: Mutex<HashMap<String, ActiveRequest>>,
    wait_timeout: Duration,
}

impl HubRouter {
    pub fn new(authz: Arc<AuthzService>, transport: Arc<TransportManager>) -> Arc<Self> {
        Self::with_wait_timeout(authz, transport, DEFAULT_TIMEOUT)
    }

    /// `wait_timeout` bounds how long a connectionless request waits for the agent before
    /// it is answered as pending.
    pub fn with_wait_timeout(
        authz: Arc<AuthzService>,
        transport: Arc<TransportManager>,
        wait_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            authz,
            transport,
            active: Mutex::new(HashMap::new()),
            wait_timeout,
        })
    }

    /// Register the router as the transport's handlers and subscription authorizer.
    pub fn install(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let on_request: RequestHandler = Arc::new(
            move |req: RequestMessage, reply_to: Option<ConnectionRef>| {
                let router = Weak::upgrade(&weak);
                async move {
                    match router {
                        Some(r) => r.handle_request(req, reply_to).await,
                        None => Some(req.create_response(
                            Value::Null,
                            Some(&HubError::Internal("router stopped".into())),
                        )),
                    }
                }
                .boxed()
            },
        );
        let weak = Arc::downgrade(self);
        let on_response: ResponseHandler = Arc::new(move |resp: ResponseMessage| {
            let router = Weak::upgrade(&weak);
            async move {
                match router {
                    Some(r) => r.handle_response(resp).await,
                    None => Ok(()),
                }
            }
            .boxed()
        });
        let weak = Arc::downgrade(self);
        let on_notification: NotificationHandler = Arc::new(move |notif: NotificationMessage| {
            let router = Weak::upgrade(&weak);
            async move {
                if let Some(r) = router {
                    r.handle_notification(notif).await;
                }
            }
            .boxed()
        });
        let weak = Arc::downgrade(self);
        let on_connect: ConnectHandler =
            Arc::new(move |connected: bool, _err: Option<HubError>, info: ConnectionInfo| {
                if connected {
                    return;
                }
                if let Some(r) = Weak::upgrade(&weak) {
                    r.drop_orphaned(&info);
                }
            });
        let authz = self.authz.clone();
        let authorizer: Authorizer = Arc::new(move |req: &RequestMessage| {
            authz.has_permission(&req.sender_id, &req.operation, &req.thing_id)
        });
        self.transport.set_request_handler(Some(on_request));
        self.transport.set_response_handler(Some(on_response));
        self.transport.set_notification_handler(Some(on_notification));
        self.transport.set_connect_handler(Some(on_connect));
        self.transport.set_authorizer(Some(authorizer));
    }

    /// Drop the active requests whose requester or agent went away with the connection
    /// described by `info`. Requesters still connected get a failed response.
    fn drop_orphaned(&self, info: &ConnectionInfo) {
        let agent_alive = |agent_id: &str| {
            self.transport
                .get_connection_by_client_id(agent_id)
                .map(|c| c.is_connected())
                .unwrap_or(false)
        };
        let dropped: Vec<ActiveRequest> = {
            let mut active = self.active.lock();
            let ids: Vec<String> = active
                .iter()
                .filter(|(_, e)| {
                    e.reply.is_gone() || (e.agent_id == info.client_id && !agent_alive(&e.agent_id))
                })
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| active.remove(id)).collect()
        };
        if dropped.is_empty() {
            return;
        }
        log::info!(
            "dropping {} active request(s) after '{}' ({}) disconnected",
            dropped.len(),
            info.client_id,
            info.connection_id
        );
        for entry in dropped {
            if entry.reply.is_gone() {
                continue;
            }
            let err = HubError::NotFound(format!("agent '{}' disconnected", entry.agent_id));
            let resp = ResponseMessage::new(
                &entry.operation,
                &entry.dthing_id,
                &entry.name,
                Value::Null,
                Some(&err),
                &entry.correlation_id,
            );
            match entry.reply {
                ReplyTo::Waiter(tx) => {
                    let _ = tx.send(resp);
                }
                ReplyTo::Connection(c) => {
                    if let Ok(rt) = tokio::runtime::Handle::try_current() {
                        rt.spawn(async move {
                            let _ = c.send_response(&resp).await;
                        });
                    }
                }
            }
        }
    }

    /// Drop requests that outlived [`ACTIVE_REQUEST_TTL`] or whose requester is gone.
    fn prune_expired(&self) {
        let mut active = self.active.lock();
        let before = active.len();
        active.retain(|_, e| e.started.elapsed() < ACTIVE_REQUEST_TTL && !e.reply.is_gone());
        let pruned = before - active.len();
        if pruned > 0 {
            log::info!("pruned {} stale active request(s)", pruned);
        }
    }

    /// Number of requests still waiting for their agent.
    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }

    /// Handle a consumer request. `None` means the agent answers later on `reply_to`.
    pub async fn handle_request(
        &self,
        mut req: RequestMessage,
        reply_to: Option<ConnectionRef>,
    ) -> Option<ResponseMessage> {
        let op = req.operation.clone();
        if op == OP_PING {
            return Some(req.create_response(Value::from(PONG), None));
        }
        // connections applied these already
        if is_subscribe_op(&op) || is_unsubscribe_op(&op) || is_observe_op(&op) || is_unobserve_op(&op)
        {
            return Some(req.create_response(Value::Null, None));
        }
        if let Err(err) = required_permission(&op) {
            log::warn!("'{}' sent unknown operation '{}'", req.sender_id, op);
            return Some(req.create_response(Value::Null, Some(&err)));
        }
        if !self.authz.has_permission(&req.sender_id, &op, &req.thing_id) {
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
        let Some((agent_id, thing_id)) = split_dthing_id(&req.thing_id) else {
            let err = HubError::InvalidArgument(format!(
                "'{}' is not a digital twin thing ID",
                req.thing_id
            ));
            return Some(req.create_response(Value::Null, Some(&err)));
        };
        let (agent_id, thing_id) = (agent_id.to_string(), thing_id.to_string());
        let Some(agent) = self.transport.get_connection_by_client_id(&agent_id) else {
            log::warn!(
                "{} '{}/{}' by '{}': agent '{}' not reachable",
                op,
                req.thing_id,
                req.name,
                req.sender_id,
                agent_id
            );
            let err = HubError::NotFound(format!("agent '{}' not reachable", agent_id));
            return Some(req.create_response(Value::Null, Some(&err)));
        };
        if req.correlation_id.is_empty() {
            req.correlation_id = new_id();
        }

        let (reply, waiter) = match reply_to {
            Some(c) => (ReplyTo::Connection(c), None),
            None => {
                let (tx, rx) = oneshot::channel();
                (ReplyTo::Waiter(tx), Some(rx))
            }
        };
        self.prune_expired();
        // requesters pick their own correlationIDs, so the agent sees a hub-assigned one
        let request_id = new_id();
        self.active.lock().insert(
            request_id.clone(),
            ActiveRequest {
                agent_id: agent_id.clone(),
                sender_id: req.sender_id.clone(),
                correlation_id: req.correlation_id.clone(),
                dthing_id: req.thing_id.clone(),
                operation: op.clone(),
                name: req.name.clone(),
                reply,
                started: Instant::now(),
            },
        );

        let mut forwarded = req.clone();
        forwarded.thing_id = thing_id;
        forwarded.correlation_id = request_id.clone();
        log::debug!(
            "forwarding {} '{}' to agent '{}' ({} as {})",
            op,
            req.name,
            agent_id,
            req.correlation_id,
            request_id
        );
        if let Err(e) = agent.send_request(&forwarded).await {
            self.active.lock().remove(&request_id);
            log::warn!("forwarding to agent '{}' failed: {}", agent_id, e);
            return Some(req.create_response(Value::Null, Some(&e)));
        }

        let rx = waiter?;
        match tokio::time::timeout(self.wait_timeout, rx).await {
            Ok(Ok(resp)) => Some(resp),
            _ => {
                self.active.lock().remove(&request_id);
                log::debug!("{} '{}' still pending after wait", op, req.correlation_id);
                None
            }
        }
    }

    /// Route an agent response back to the requester.
    pub async fn handle_response(&self, mut resp: ResponseMessage) -> Result<(), HubError> {
        let (dthing_id, correlation_id, reply) = {
            let mut active = self.active.lock();
            let Some(entry) = active.get(&resp.correlation_id) else {
                log::warn!(
                    "response '{}' from '{}' has no active request; ignored",
                    resp.correlation_id,
                    resp.sender_id
                );
                return Ok(());
            };
            if entry.agent_id != resp.sender_id {
                log::error!(
                    "response '{}' came from '{}' instead of agent '{}'; ignored",
                    resp.correlation_id,
                    resp.sender_id,
                    entry.agent_id
                );
                return Ok(());
            }
            let dthing_id = entry.dthing_id.clone();
            let correlation_id = entry.correlation_id.clone();
            let kept = match &entry.reply {
                ReplyTo::Connection(c) if !resp.status.is_final() => Some(c.clone()),
                _ => None,
            };
            match kept {
                Some(c) => (dthing_id, correlation_id, ReplyTo::Connection(c)),
                None => match active.remove(&resp.correlation_id) {
                    Some(entry) => {
                        log::debug!(
                            "{} '{}' for '{}' finished after {:?}",
                            entry.operation,
                            correlation_id,
                            entry.sender_id,
                            entry.started.elapsed()
                        );
                        (dthing_id, correlation_id, entry.reply)
                    }
                    None => return Ok(()),
                },
            }
        };
        resp.thing_id = dthing_id;
        resp.correlation_id = correlation_id;
        match reply {
            ReplyTo::Connection(c) => {
                if let Err(e) = c.send_response(&resp).await {
                    log::warn!(
                        "returning response '{}' to '{}' failed: {}",
                        resp.correlation_id,
                        c.connection_info().client_id,
                        e
                    );
                }
            }
            ReplyTo::Waiter(tx) => {
                let _ = tx.send(resp);
            }
        }
        Ok(())
    }

    /// Republish an agent notification under the digital-twin Thing ID.
    pub async fn handle_notification(&self, mut notif: NotificationMessage) {
        let agent_id = notif.sender_id.clone();
        let dthing_id = make_dthing_id(&agent_id, &notif.thing_id);
        if !self
            .authz
            .has_permission_for(&agent_id, Permission::PubEvents, &dthing_id)
        {
            log::warn!(
                "'{}' may not publish {} '{}' of '{}'; dropped",
                agent_id,
                notif.operation,
                notif.name,
                dthing_id
            );
            return;
        }
        notif.thing_id = dthing_id;
        self.transport.send_notification(&notif).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authn::{Authenticator, PasswordStore, SessionAuthenticator};
    use crate::authz::{Role, ALL_GROUP_ID, DEFAULT_ACL_FILE};
    use crate::config::ServerConfig;
    use crate::messaging::ResponseStatus;

    fn router() -> (tempfile::TempDir, Arc<HubRouter>) {
        let dir = tempfile::tempdir().unwrap();
        let passwords = Arc::new(PasswordStore::open(dir.path().join("hub.passwd")).unwrap());
        let authn: Arc<dyn Authenticator> =
            Arc::new(SessionAuthenticator::new(passwords, Duration::from_secs(60)));
        let transport = Arc::new(TransportManager::new(&ServerConfig::default(), authn));
        let authz = Arc::new(AuthzService::start(dir.path().join(DEFAULT_ACL_FILE)).unwrap());
        authz.add_user("op1", Role::Operator, ALL_GROUP_ID).unwrap();
        authz.add_user("viewer1", Role::Viewer, ALL_GROUP_ID).unwrap();
        (dir, HubRouter::new(authz, transport))
    }

    #[test]
    fn digital_twin_ids() {
        assert_eq!(make_dthing_id("agent1", "thing1"), "dtw:agent1:thing1");
        assert_eq!(split_dthing_id("dtw:agent1:thing1"), Some(("agent1", "thing1")));
        // agent-local IDs may contain colons
        assert_eq!(split_dthing_id("dtw:agent1:urn:x"), Some(("agent1", "urn:x")));
        assert_eq!(split_dthing_id("thing1"), None);
        assert_eq!(split_dthing_id("dtw:agent1"), None);
        assert_eq!(split_dthing_id("dtw::thing1"), None);
    }

    #[tokio::test]
    async fn unauthorized_request_fails() {
        let (_dir, r) = router();
        let mut req = RequestMessage::new(OP_INVOKE_ACTION, "dtw:a1:t1", "start", Value::Null, "c1");
        req.sender_id = "viewer1".into();
        let resp = r.handle_request(req, None).await.unwrap();
        assert!(resp.into_result().unwrap_err().is_unauthorized());
    }

    #[tokio::test]
    async fn unreachable_agent_is_not_found() {
        let (_dir, r) = router();
        let mut req = RequestMessage::new(OP_INVOKE_ACTION, "dtw:a1:t1", "start", Value::Null, "c1");
        req.sender_id = "op1".into();
        let resp = r.handle_request(req, None).await.unwrap();
        assert_eq!(resp.status, ResponseStatus::Failed);
        assert_eq!(resp.correlation_id, "c1");
        assert!(matches!(resp.into_result(), Err(HubError::NotFound(_))));
        assert_eq!(r.active_count(), 0);
    }

    #[tokio::test]
    async fn ping_and_subscriptions_complete_immediately() {
        let (_dir, r) = router();
        let req = RequestMessage::new(OP_PING, "", "", Value::Null, "p1");
        assert_eq!(r.handle_request(req, None).await.unwrap().output, Value::from(PONG));
        let req = RequestMessage::new(OP_SUBSCRIBE_ALL_EVENTS, "dtw:a1:t1", "", Value::Null, "s1");
        let resp = r.handle_request(req, None).await.unwrap();
        assert_eq!(resp.status, ResponseStatus::Completed);
    }

    #[tokio::test]
    async fn unknown_operation_is_invalid() {
        let (_dir, r) = router();
        let mut req = RequestMessage::new("frobnicate", "dtw:a1:t1", "x", Value::Null, "c1");
        req.sender_id = "op1".into();
        let resp = r.handle_request(req, None).await.unwrap();
        assert_eq!(resp.correlation_id, "c1");
        assert_eq!(
            resp.into_result().unwrap_err(),
            HubError::InvalidArgument("unknown operation 'frobnicate'".into())
        );
        assert_eq!(r.active_count(), 0);
    }

    #[tokio::test]
    async fn stray_response_is_ignored() {
        let (_dir, r) = router();
        let mut resp = ResponseMessage::new(OP_INVOKE_ACTION, "t1", "start", Value::Null, None, "x");
        resp.sender_id = "a1".into();
        assert!(r.handle_response(resp).await.is_ok());
    }
}
