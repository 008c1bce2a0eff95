//! HTTP-basic routes: login, refresh, logout, ping and `/things` requests.

mod common;

use common::*;
use futures_util::FutureExt;
use hub::clients::HttpClient;
use hub::connections::ConnectionRef;
use hub::error::HubError;
use hub::messaging::{ProtocolType, RequestMessage, ResponseMessage};
use serde_json::json;
use std::sync::Arc;

#[tokio::test]
async fn login_refresh_logout() {
    let hub = start_hub().await;
    let client = HttpClient::new(&hub.url(ProtocolType::HttpBasic)).unwrap();

    let err = client.login("user1", "wrong").await.unwrap_err();
    assert!(err.is_unauthorized());

    let token = client.login("user1", "pass1").await.unwrap();
    assert!(!token.is_empty());
    let refreshed = client.refresh().await.unwrap();
    assert_ne!(refreshed, token);
    assert_eq!(client.token(), refreshed);

    client.logout().await.unwrap();
    client.set_token(&refreshed);
    assert!(client.refresh().await.unwrap_err().is_unauthorized());

    hub.transport.stop().await;
}

#[tokio::test]
async fn ping_needs_no_token() {
    let hub = start_hub().await;
    let client = HttpClient::new(&hub.url(ProtocolType::HttpBasic)).unwrap();
    assert_eq!(client.ping().await.unwrap(), "pong");
    hub.transport.stop().await;
}

#[tokio::test]
async fn thing_requests_reach_the_request_handler() {
    let hub = start_hub().await;
    hub.transport.set_request_handler(Some(echo_handler()));
    let client = HttpClient::new(&hub.url(ProtocolType::HttpBasic)).unwrap();
    client.set_token(&hub.token("user1"));

    let out = client
        .thing_request("invokeAction", "thing1", "action1", json!("hello world 1"))
        .await
        .unwrap();
    assert_eq!(out, json!("hello world 1"));

    hub.transport.stop().await;
}

#[tokio::test]
async fn deferred_result_is_pending_action_status() {
    let hub = start_hub().await;
    hub.transport.set_request_handler(Some(Arc::new(
        |_req: RequestMessage, _reply: Option<ConnectionRef>| async { None::<ResponseMessage> }.boxed(),
    )));
    let client = HttpClient::new(&hub.url(ProtocolType::HttpBasic)).unwrap();
    client.set_token(&hub.token("user1"));

    let status = client
        .thing_request("invokeAction", "thing1", "action1", json!(1))
        .await
        .unwrap();
    assert_eq!(status["status"], json!("pending"));
    assert_eq!(status["thingID"], json!("thing1"));
    assert_eq!(status["input"], json!(1));

    hub.transport.stop().await;
}

#[tokio::test]
async fn failed_request_maps_to_problem_details() {
    let hub = start_hub().await;
    hub.transport.set_request_handler(Some(Arc::new(
        |req: RequestMessage, _reply: Option<ConnectionRef>| {
            async move {
                let err = HubError::NotFound(format!("no thing '{}'", req.thing_id));
                Some(req.create_response(serde_json::Value::Null, Some(&err)))
            }
            .boxed()
        },
    )));
    let client = HttpClient::new(&hub.url(ProtocolType::HttpBasic)).unwrap();
    client.set_token(&hub.token("user1"));

    let err = client
        .thing_request("readProperty", "thing9", "p1", serde_json::Value::Null)
        .await
        .unwrap_err();
    assert_eq!(err, HubError::NotFound("no thing 'thing9'".into()));

    hub.transport.stop().await;
}

#[tokio::test]
async fn missing_token_is_401_with_challenge() {
    let hub = start_hub().await;
    let url = format!("{}/things/readProperty/thing1/p1", hub.url(ProtocolType::HttpBasic));
    let resp = reqwest::Client::new().post(&url).send().await.unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::UNAUTHORIZED);
    let challenge = resp
        .headers()
        .get(reqwest::header::WWW_AUTHENTICATE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    assert!(challenge.starts_with("Bearer"));
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["title"], json!("Unauthorized"));

    hub.transport.stop().await;
}

#[tokio::test]
async fn sse_connect_without_cid_is_rejected() {
    let hub = start_hub().await;
    let resp = reqwest::Client::new()
        .get(hub.url(ProtocolType::HiveotSse))
        .bearer_auth(hub.token("user1"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);
    hub.transport.stop().await;
}
