//! End-to-end messaging over real sockets: RPC, subscriptions, connection reversal and
//! duplicate connection eviction, over the HiveOT websocket, WoT websocket and SSE transports.

mod common;

use common::*;
use futures_util::FutureExt;
use hub::clients::{Agent, Consumer, WssClient};
use hub::connections::{Connection, ConnectionInfo, ConnectionRef, NotificationHandler};
use hub::messaging::vocab::OP_INVOKE_ACTION;
use hub::messaging::{HiveotConverter, NotificationMessage, ProtocolType, RequestMessage};
use serde_json::{json, Value};
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Republish whatever a client publishes to every subscriber.
fn republish(hub: &TestHub) -> NotificationHandler {
    let transport = Arc::downgrade(&hub.transport);
    Arc::new(move |n: NotificationMessage| {
        let transport = Weak::upgrade(&transport);
        async move {
            if let Some(t) = transport {
                t.send_notification(&n).await;
            }
        }
        .boxed()
    })
}

#[tokio::test]
async fn action_with_immediate_reply() {
    let hub = start_hub().await;
    hub.transport.set_request_handler(Some(echo_handler()));

    let client = hub.wss_client("consumer1", ProtocolType::HiveotWss).await;
    let consumer = Consumer::new(client, TIMEOUT);
    let out = consumer
        .invoke_action("thing1", "action1", json!("hello world 1"))
        .await
        .unwrap();
    assert_eq!(out, json!("hello world 1"));
    assert_eq!(consumer.ping().await.unwrap(), "pong");

    consumer.disconnect().await;
    hub.transport.stop().await;
}

#[tokio::test]
async fn action_over_wot_websocket() {
    let hub = start_hub().await;
    hub.transport.set_request_handler(Some(echo_handler()));

    let client = hub.wss_client("consumer1", ProtocolType::WotWss).await;
    let consumer = Consumer::new(client, TIMEOUT);
    let out = consumer
        .invoke_action("thing1", "action1", json!("hello world 1"))
        .await
        .unwrap();
    assert_eq!(out, json!("hello world 1"));

    consumer.disconnect().await;
    hub.transport.stop().await;
}

#[tokio::test]
async fn subscribe_and_publish() {
    let hub = start_hub().await;
    hub.transport.set_request_handler(Some(echo_handler()));
    hub.transport.set_notification_handler(Some(republish(&hub)));

    let c1 = Consumer::new(hub.wss_client("c1", ProtocolType::HiveotWss).await, TIMEOUT);
    let c2 = Consumer::new(hub.wss_client("c2", ProtocolType::HiveotWss).await, TIMEOUT);
    let agent = Agent::new(hub.wss_client("agent1", ProtocolType::HiveotWss).await, TIMEOUT);
    let (h1, seen1) = notification_collector();
    let (h2, seen2) = notification_collector();
    c1.set_notification_handler(Some(h1));
    c2.set_notification_handler(Some(h2));

    c1.subscribe("", "").await.unwrap();
    c2.subscribe("thing1", "event11").await.unwrap();

    agent.pub_event("thing1", "event11", json!("hello world 1")).await.unwrap();
    assert!(wait_until(|| seen1.lock().len() == 1 && seen2.lock().len() == 1).await);
    assert_eq!(seen1.lock()[0].data, json!("hello world 1"));
    assert_eq!(seen2.lock()[0].name, "event11");
    assert_eq!(seen2.lock()[0].sender_id, "agent1");

    c1.unsubscribe("", "").await.unwrap();
    agent.pub_event("thing1", "event11", json!("hello world 2")).await.unwrap();
    assert!(wait_until(|| seen2.lock().len() == 2).await);
    assert_eq!(seen2.lock()[1].data, json!("hello world 2"));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(seen1.lock().len(), 1);

    hub.transport.stop().await;
}

#[tokio::test]
async fn server_sends_request_to_agent() {
    let hub = start_hub().await;
    let (on_response, responses) = response_collector();
    hub.transport.set_response_handler(Some(on_response));

    let agent = Agent::new(hub.wss_client("agent1", ProtocolType::HiveotWss).await, TIMEOUT);
    agent.set_request_handler(Some(Arc::new(
        |req: RequestMessage, _reply: Option<ConnectionRef>| {
            async move {
                let out = if req.operation == OP_INVOKE_ACTION {
                    json!("hello world 2")
                } else {
                    Value::Null
                };
                Some(req.create_response(out, None))
            }
            .boxed()
        },
    )));

    let conn = hub.wait_for_client("agent1").await;
    let req = RequestMessage::new(
        OP_INVOKE_ACTION,
        "thing1",
        "action1",
        json!("hello world 1"),
        "corr-1",
    );
    conn.send_request(&req).await.unwrap();

    assert!(wait_until(|| !responses.lock().is_empty()).await);
    let resp = responses.lock()[0].clone();
    assert_eq!(resp.correlation_id, "corr-1");
    assert_eq!(resp.output, json!("hello world 2"));
    assert_eq!(resp.sender_id, "agent1");

    hub.transport.stop().await;
}

#[tokio::test]
async fn duplicate_connection_id_evicts_the_first() {
    let hub = start_hub().await;
    let url = hub.url(ProtocolType::HiveotWss);
    let info = ConnectionInfo::new("client1", "sess1", &url, ProtocolType::HiveotWss);
    let token = hub.token("client1");

    let first = WssClient::with_info(info.clone(), Arc::new(HiveotConverter::new()));
    first.set_reconnect(false);
    first.connect_with_token(&token).await.unwrap();
    hub.wait_for_client("client1").await;

    let second = WssClient::with_info(info, Arc::new(HiveotConverter::new()));
    second.set_reconnect(false);
    second.connect_with_token(&token).await.unwrap();

    assert!(wait_until(|| !first.is_connected()).await);
    assert!(second.is_connected());
    let held = hub
        .transport
        .get_connection_by_connection_id("client1", "sess1")
        .unwrap();
    assert!(held.is_connected());
    assert_eq!(held.connection_info().connection_id, "sess1");

    second.disconnect().await;
    hub.transport.stop().await;
}

#[tokio::test]
async fn sse_rpc_and_notifications() {
    let hub = start_hub().await;
    hub.transport.set_request_handler(Some(echo_handler()));
    hub.transport.set_notification_handler(Some(republish(&hub)));

    let consumer = Consumer::new(hub.sse_client("sse1").await, TIMEOUT);
    let (h, seen) = notification_collector();
    consumer.set_notification_handler(Some(h));
    hub.wait_for_client("sse1").await;

    let out = consumer
        .invoke_action("thing1", "action1", json!({"on": true}))
        .await
        .unwrap();
    assert_eq!(out, json!({"on": true}));
    assert_eq!(consumer.ping().await.unwrap(), "pong");

    consumer.subscribe("thing1", "").await.unwrap();
    let agent = Agent::new(hub.wss_client("agent1", ProtocolType::HiveotWss).await, TIMEOUT);
    agent.pub_event("thing1", "event11", json!(42)).await.unwrap();
    assert!(wait_until(|| seen.lock().len() == 1).await);
    assert_eq!(seen.lock()[0].data, json!(42));

    consumer.disconnect().await;
    assert!(!consumer.is_connected());
    hub.transport.stop().await;
}

#[tokio::test]
async fn connection_without_token_is_refused() {
    let hub = start_hub().await;
    let client = WssClient::new(
        &hub.url(ProtocolType::HiveotWss),
        "nobody",
        Arc::new(HiveotConverter::new()),
    );
    client.set_reconnect(false);
    let err = client.connect_with_token("not-a-token").await.unwrap_err();
    assert!(err.is_unauthorized());
    hub.transport.stop().await;
}
