//! HTTP-basic server: connectionless request/response, and host of the SSE and websocket
//! routes.

use super::{push_form, ServerHandlers, TransportServer, CONNECTION_ID_HEADER};
use crate::authn::Authenticator;
use crate::connections::ConnectionRef;
use crate::error::HubError;
use crate::messaging::vocab::*;
use crate::messaging::{new_id, NotificationMessage, ProtocolType, RequestMessage, ResponseMessage, ResponseStatus};
use anyhow::Context;
use async_trait::async_trait;
use axum::{
    body::Bytes,
    extract::{FromRequestParts, Path, State},
    http::{header, request::Parts, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Extension, Json, Router,
};
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

pub const HTTP_LOGIN_PATH: &str = "/authn/login";
pub const HTTP_REFRESH_PATH: &str = "/authn/refresh";
pub const HTTP_LOGOUT_PATH: &str = "/authn/logout";
pub const HTTP_PING_PATH: &str = "/ping";
pub const HTTP_THINGS_PATH: &str = "/things";

/// RFC7807 problem-details reply for an error. 401 replies carry `WWW-Authenticate: Bearer`.
pub(crate) fn problem_response(err: &HubError) -> Response {
    let status = StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let body = json!({
        "title": err.title(),
        "detail": err.detail(),
        "status": status.as_u16(),
    });
    let mut resp = (status, Json(body)).into_response();
    resp.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/problem+json"),
    );
    if err.is_unauthorized() {
        resp.headers_mut()
            .insert(header::WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
    }
    resp
}

/// HTTP reply for a request handled by the application: 200 with the output when complete,
/// 201 with an action status while pending, problem details on error.
pub(crate) fn reply_for(req: &RequestMessage, resp: Option<ResponseMessage>) -> Response {
    match resp {
        None => {
            let status = req.create_action_status(ResponseStatus::Pending, "");
            (StatusCode::CREATED, Json(status)).into_response()
        }
        Some(resp) => {
            if let Some(err) = &resp.error {
                return problem_response(&err.to_error());
            }
            if !resp.status.is_final() {
                let mut status = req.create_action_status(resp.status, &resp.sender_id);
                status.output = resp.output;
                return (StatusCode::CREATED, Json(status)).into_response();
            }
            (StatusCode::OK, Json(resp.output)).into_response()
        }
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let token = value
        .strip_prefix("Bearer ")
        .or_else(|| value.strip_prefix("bearer "))?
        .trim();
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}

/// Client authenticated through the bearer token of the request.
pub(crate) struct AuthenticatedClient {
    pub client_id: String,
    /// Value of the `cid` header; empty when absent.
    pub connection_id: String,
    pub token: String,
}

impl AuthenticatedClient {
    /// The `cid` header, or a 400 reply when it is missing.
    pub fn require_cid(&self) -> Result<&str, Response> {
        if self.connection_id.is_empty() {
            Err(problem_response(&HubError::InvalidArgument(format!(
                "missing '{}' header",
                CONNECTION_ID_HEADER
            ))))
        } else {
            Ok(&self.connection_id)
        }
    }
}

#[axum::async_trait]
impl<S> FromRequestParts<S> for AuthenticatedClient
where
    S: Send + Sync,
{
    type Rejection = Response;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let authn = parts
            .extensions
            .get::<Arc<dyn Authenticator>>()
            .cloned()
            .ok_or_else(|| {
                problem_response(&HubError::Internal("authenticator not configured".into()))
            })?;
        let token = bearer_token(&parts.headers).ok_or_else(|| {
            problem_response(&HubError::Unauthorized("missing bearer token".into()))
        })?;
        let client_id = authn.validate_token(&token).map_err(|e| problem_response(&e))?;
        let connection_id = parts
            .headers
            .get(CONNECTION_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        Ok(Self {
            client_id,
            connection_id,
            token,
        })
    }
}

#[derive(Clone)]
struct HttpState {
    authn: Arc<dyn Authenticator>,
    handlers: Arc<ServerHandlers>,
}

#[derive(Deserialize)]
struct LoginArgs {
    login: String,
    password: String,
}

async fn login_http(State(state): State<HttpState>, body: Bytes) -> Response {
    let args: LoginArgs = match serde_json::from_slice(&body) {
        Ok(a) => a,
        Err(e) => return problem_response(&HubError::InvalidArgument(e.to_string())),
    };
    match state.authn.login(&args.login, &args.password) {
        Ok(token) => Json(token).into_response(),
        Err(e) => problem_response(&e),
    }
}

async fn refresh_http(
    State(state): State<HttpState>,
    client: AuthenticatedClient,
    body: Bytes,
) -> Response {
    let old_token = if body.is_empty() {
        client.token.clone()
    } else {
        match serde_json::from_slice::<String>(&body) {
            Ok(t) => t,
            Err(e) => return problem_response(&HubError::InvalidArgument(e.to_string())),
        }
    };
    match state.authn.refresh_token(&client.client_id, &old_token) {
        Ok(token) => Json(token).into_response(),
        Err(e) => problem_response(&e),
    }
}

async fn logout_http(State(state): State<HttpState>, client: AuthenticatedClient) -> Response {
    state.authn.logout(&client.token);
    StatusCode::OK.into_response()
}

async fn ping_http() -> Json<&'static str> {
    Json(PONG)
}

async fn thing_op_http(
    State(state): State<HttpState>,
    client: AuthenticatedClient,
    Path((op, thing_id)): Path<(String, String)>,
    body: Bytes,
) -> Response {
    handle_thing_request(state, client, op, thing_id, String::new(), body).await
}

async fn affordance_op_http(
    State(state): State<HttpState>,
    client: AuthenticatedClient,
    Path((op, thing_id, name)): Path<(String, String, String)>,
    body: Bytes,
) -> Response {
    handle_thing_request(state, client, op, thing_id, name, body).await
}

async fn handle_thing_request(
    state: HttpState,
    client: AuthenticatedClient,
    op: String,
    thing_id: String,
    name: String,
    body: Bytes,
) -> Response {
    let input = if body.is_empty() {
        Value::Null
    } else {
        match serde_json::from_slice(&body) {
            Ok(v) => v,
            Err(e) => return problem_response(&HubError::InvalidArgument(e.to_string())),
        }
    };
    let mut req = RequestMessage::new(&op, &thing_id, &name, input, &new_id());
    req.sender_id = client.client_id;
    if op == OP_PING {
        return Json(PONG).into_response();
    }
    log::debug!("http {} {}/{} by '{}'", op, thing_id, name, req.sender_id);
    let resp = state.handlers.handlers.dispatch_request(req.clone(), None).await;
    reply_for(&req, resp)
}

/// Connectionless HTTP server. Also serves the routes other servers register before start.
pub struct HttpBasicServer {
    bind: String,
    port: u16,
    authn: Arc<dyn Authenticator>,
    handlers: Arc<ServerHandlers>,
    extra_routes: Mutex<Option<Router>>,
    local_addr: RwLock<Option<SocketAddr>>,
    shutdown: Arc<Notify>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl HttpBasicServer {
    /// Port 0 binds an ephemeral port; see [`HttpBasicServer::local_addr`].
    pub fn new(
        bind: &str,
        port: u16,
        authn: Arc<dyn Authenticator>,
        handlers: Arc<ServerHandlers>,
    ) -> Self {
        Self {
            bind: bind.to_string(),
            port,
            authn,
            handlers,
            extra_routes: Mutex::new(None),
            local_addr: RwLock::new(None),
            shutdown: Arc::new(Notify::new()),
            task: Mutex::new(None),
        }
    }

    /// Add routes served on the same listener. Must be called before [`TransportServer::start`].
    pub fn add_routes(&self, routes: Router) {
        let mut extra = self.extra_routes.lock();
        let merged = match extra.take() {
            Some(r) => r.merge(routes),
            None => routes,
        };
        *extra = Some(merged);
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.read()
    }

    /// `http://host:port` of the running server; empty when stopped.
    pub fn base_url(&self) -> String {
        self.local_addr()
            .map(|a| format!("http://{}", a))
            .unwrap_or_default()
    }

    fn router(&self) -> Router {
        let state = HttpState {
            authn: self.authn.clone(),
            handlers: self.handlers.clone(),
        };
        let mut app = Router::new()
            .route(HTTP_LOGIN_PATH, post(login_http))
            .route(HTTP_REFRESH_PATH, post(refresh_http))
            .route(HTTP_LOGOUT_PATH, post(logout_http))
            .route(HTTP_PING_PATH, get(ping_http))
            .route("/things/:op/:thing_id", post(thing_op_http))
            .route("/things/:op/:thing_id/:name", post(affordance_op_http))
            .with_state(state);
        if let Some(extra) = self.extra_routes.lock().clone() {
            app = app.merge(extra);
        }
        app.layer(Extension(self.authn.clone()))
    }
}

fn http_form(op: &str, href: String) -> Value {
    json!({
        "op": op,
        "href": href,
        "contentType": "application/json",
        "htv:methodName": "POST",
    })
}

#[async_trait]
impl TransportServer for HttpBasicServer {
    fn protocol_type(&self) -> ProtocolType {
        ProtocolType::HttpBasic
    }

    fn connect_url(&self) -> String {
        self.base_url()
    }

    async fn start(&self) -> anyhow::Result<()> {
        let app = self.router();
        let bind_addr = format!("{}:{}", self.bind, self.port);
        let listener = tokio::net::TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("binding to {}", bind_addr))?;
        let addr = listener.local_addr().context("reading listener address")?;
        *self.local_addr.write() = Some(addr);
        log::info!("hub listening on {}", addr);

        let shutdown = self.shutdown.clone();
        let handle = tokio::spawn(async move {
            let res = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move { shutdown.notified().await })
            .await;
            if let Err(e) = res {
                log::error!("http server exited: {}", e);
            }
            log::info!("http server stopped");
        });
        *self.task.lock() = Some(handle);
        Ok(())
    }

    async fn stop(&self) {
        self.shutdown.notify_one();
        let handle = self.task.lock().take();
        if let Some(mut handle) = handle {
            if tokio::time::timeout(Duration::from_secs(3), &mut handle)
                .await
                .is_err()
            {
                log::warn!("http server did not drain in time; aborting");
                handle.abort();
            }
        }
        *self.local_addr.write() = None;
    }

    fn get_connection_by_connection_id(&self, _client_id: &str, _cid: &str) -> Option<ConnectionRef> {
        None
    }

    fn get_connection_by_client_id(&self, _client_id: &str) -> Option<ConnectionRef> {
        None
    }

    async fn send_notification(&self, _notif: &NotificationMessage) {}

    async fn close_all(&self) {}

    async fn close_all_client_connections(&self, _client_id: &str) {}

    fn add_td_forms(&self, td: &mut Value) {
        let base = self.base_url();
        let thing_id = td
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let href = |op: &str, name: &str| {
            if name.is_empty() {
                format!("{}{}/{}/{}", base, HTTP_THINGS_PATH, op, thing_id)
            } else {
                format!("{}{}/{}/{}/{}", base, HTTP_THINGS_PATH, op, thing_id, name)
            }
        };
        if let Some(actions) = td.get_mut("actions").and_then(Value::as_object_mut) {
            for (name, aff) in actions.iter_mut() {
                push_form(aff, http_form(OP_INVOKE_ACTION, href(OP_INVOKE_ACTION, name)));
                push_form(aff, http_form(OP_QUERY_ACTION, href(OP_QUERY_ACTION, name)));
            }
        }
        if let Some(props) = td.get_mut("properties").and_then(Value::as_object_mut) {
            for (name, aff) in props.iter_mut() {
                push_form(aff, http_form(OP_READ_PROPERTY, href(OP_READ_PROPERTY, name)));
                let read_only = aff.get("readOnly").and_then(Value::as_bool).unwrap_or(false);
                if !read_only {
                    push_form(aff, http_form(OP_WRITE_PROPERTY, href(OP_WRITE_PROPERTY, name)));
                }
            }
        }
        push_form(td, http_form(OP_READ_ALL_PROPERTIES, href(OP_READ_ALL_PROPERTIES, "")));
        push_form(td, http_form(OP_QUERY_ALL_ACTIONS, href(OP_QUERY_ALL_ACTIONS, "")));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn problem_body_and_headers() {
        let resp = problem_response(&HubError::Unauthorized("no token".into()));
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(resp.headers()[header::WWW_AUTHENTICATE], "Bearer");
        assert_eq!(
            resp.headers()[header::CONTENT_TYPE],
            "application/problem+json"
        );
        let resp = problem_response(&HubError::NotFound("x".into()));
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert!(resp.headers().get(header::WWW_AUTHENTICATE).is_none());
    }

    #[test]
    fn reply_status_mapping() {
        let req = RequestMessage::new(OP_INVOKE_ACTION, "t1", "a1", json!(1), "c1");
        assert_eq!(reply_for(&req, None).status(), StatusCode::CREATED);
        let done = req.create_response(json!(2), None);
        assert_eq!(reply_for(&req, Some(done)).status(), StatusCode::OK);
        let running = req.create_progress(ResponseStatus::Running, Value::Null);
        assert_eq!(reply_for(&req, Some(running)).status(), StatusCode::CREATED);
        let failed = req.create_response(Value::Null, Some(&HubError::InvalidArgument("bad".into())));
        assert_eq!(reply_for(&req, Some(failed)).status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn bearer_token_parsing() {
        let mut h = HeaderMap::new();
        assert!(bearer_token(&h).is_none());
        h.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer abc"));
        assert_eq!(bearer_token(&h).as_deref(), Some("abc"));
        h.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert!(bearer_token(&h).is_none());
    }

    #[test]
    fn forms_cover_affordances() {
        let handlers = Arc::new(ServerHandlers::new());
        let authn: Arc<dyn Authenticator> = Arc::new(NoAuthn);
        let srv = HttpBasicServer::new("127.0.0.1", 0, authn, handlers);
        let mut td = json!({
            "id": "dtw:agent1:thing1",
            "actions": {"start": {}},
            "properties": {"temp": {"readOnly": true}, "mode": {}},
        });
        srv.add_td_forms(&mut td);
        assert_eq!(td["actions"]["start"]["forms"].as_array().unwrap().len(), 2);
        assert_eq!(td["properties"]["temp"]["forms"].as_array().unwrap().len(), 1);
        assert_eq!(td["properties"]["mode"]["forms"].as_array().unwrap().len(), 2);
        assert_eq!(td["forms"].as_array().unwrap().len(), 2);
        let href = td["actions"]["start"]["forms"][0]["href"].as_str().unwrap();
        assert!(href.ends_with("/things/invokeAction/dtw:agent1:thing1/start"));
    }

    struct NoAuthn;

    impl Authenticator for NoAuthn {
        fn login(&self, _l: &str, _p: &str) -> Result<String, HubError> {
            Err(HubError::Unauthorized("no".into()))
        }
        fn validate_token(&self, _t: &str) -> Result<String, HubError> {
            Err(HubError::Unauthorized("no".into()))
        }
        fn refresh_token(&self, _c: &str, _t: &str) -> Result<String, HubError> {
            Err(HubError::Unauthorized("no".into()))
        }
        fn logout(&self, _t: &str) {}
        fn add_token(&self, _c: &str, _v: Duration) -> Result<String, HubError> {
            Err(HubError::Unauthorized("no".into()))
        }
    }
}
