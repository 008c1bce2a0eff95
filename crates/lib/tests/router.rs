//! Consumers reaching an agent's Things through the hub router, with authorization.

mod common;

use common::*;
use futures_util::FutureExt;
use hub::authz::{AuthzService, Role, ALL_GROUP_ID, DEFAULT_ACL_FILE};
use hub::clients::{Agent, Consumer, HttpClient};
use hub::connections::ConnectionRef;
use hub::error::HubError;
use hub::messaging::vocab::OP_INVOKE_ACTION;
use hub::messaging::{ProtocolType, RequestMessage};
use hub::router::{make_dthing_id, HubRouter};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

struct RoutedHub {
    hub: TestHub,
    router: Arc<HubRouter>,
}

/// Hub with `op1` and `op2` as operators and `viewer1` as viewer of the agent's Thing, and
/// `agent1` allowed to publish it.
async fn start_routed_hub() -> RoutedHub {
    let hub = start_hub().await;
    let authz = Arc::new(AuthzService::start(hub.dir.path().join(DEFAULT_ACL_FILE)).unwrap());
    let dthing = make_dthing_id("agent1", "thing1");
    authz.add_source("agent1", &dthing, "g1").unwrap();
    authz.add_user("op1", Role::Operator, "g1").unwrap();
    authz.add_user("op2", Role::Operator, "g1").unwrap();
    authz.add_user("viewer1", Role::Viewer, ALL_GROUP_ID).unwrap();
    authz.add_service("agent1", "g1").unwrap();
    let router = HubRouter::new(authz, hub.transport.clone());
    router.install();
    RoutedHub { hub, router }
}

async fn start_agent(hub: &TestHub) -> Agent {
    let agent = Agent::new(hub.wss_client("agent1", ProtocolType::HiveotWss).await, TIMEOUT);
    agent.set_request_handler(Some(Arc::new(
        |req: RequestMessage, _reply: Option<ConnectionRef>| {
            async move {
                let out = match req.operation.as_str() {
                    OP_INVOKE_ACTION => json!(format!("{} done", req.thing_id)),
                    _ => Value::Null,
                };
                Some(req.create_response(out, None))
            }
            .boxed()
        },
    )));
    hub.wait_for_client("agent1").await;
    agent
}

/// Agent that answers with its input after `delay`, or never when `delay` is `None`.
async fn start_slow_agent(hub: &TestHub, delay: Option<Duration>) -> Agent {
    let agent = Agent::new(hub.wss_client("agent1", ProtocolType::HiveotWss).await, TIMEOUT);
    agent.set_request_handler(Some(Arc::new(
        move |req: RequestMessage, _reply: Option<ConnectionRef>| {
            async move {
                let delay = delay?;
                tokio::time::sleep(delay).await;
                let out = req.input.clone();
                Some(req.create_response(out, None))
            }
            .boxed()
        },
    )));
    hub.wait_for_client("agent1").await;
    agent
}

#[tokio::test]
async fn consumer_invokes_action_on_agent() {
    let RoutedHub { hub, router } = start_routed_hub().await;
    let _agent = start_agent(&hub).await;
    let consumer = Consumer::new(hub.wss_client("op1", ProtocolType::HiveotWss).await, TIMEOUT);

    let dthing = make_dthing_id("agent1", "thing1");
    // the agent sees its own thing ID
    let out = consumer.invoke_action(&dthing, "switch", json!(true)).await.unwrap();
    assert_eq!(out, json!("thing1 done"));
    assert!(wait_until(|| router.active_count() == 0).await);

    hub.transport.stop().await;
}

#[tokio::test]
async fn http_request_waits_for_the_agent() {
    let RoutedHub { hub, router: _router } = start_routed_hub().await;
    let _agent = start_agent(&hub).await;
    let client = HttpClient::new(&hub.url(ProtocolType::HttpBasic)).unwrap();
    client.set_token(&hub.token("op1"));

    let dthing = make_dthing_id("agent1", "thing1");
    let out = client
        .thing_request(OP_INVOKE_ACTION, &dthing, "switch", json!(false))
        .await
        .unwrap();
    assert_eq!(out, json!("thing1 done"));

    hub.transport.stop().await;
}

#[tokio::test]
async fn viewer_may_not_invoke_actions() {
    let RoutedHub { hub, router: _router } = start_routed_hub().await;
    let _agent = start_agent(&hub).await;
    let consumer =
        Consumer::new(hub.wss_client("viewer1", ProtocolType::HiveotWss).await, TIMEOUT);

    let dthing = make_dthing_id("agent1", "thing1");
    let err = consumer.invoke_action(&dthing, "switch", json!(true)).await.unwrap_err();
    assert!(err.is_unauthorized());

    hub.transport.stop().await;
}

#[tokio::test]
async fn agent_events_reach_subscribers_under_digital_twin_id() {
    let RoutedHub { hub, router: _router } = start_routed_hub().await;
    let agent = start_agent(&hub).await;
    let consumer = Consumer::new(hub.wss_client("op1", ProtocolType::HiveotWss).await, TIMEOUT);
    let (h, seen) = notification_collector();
    consumer.set_notification_handler(Some(h));

    let dthing = make_dthing_id("agent1", "thing1");
    consumer.subscribe(&dthing, "").await.unwrap();
    agent.pub_event("thing1", "alarm", json!("on")).await.unwrap();

    assert!(wait_until(|| seen.lock().len() == 1).await);
    let notif = seen.lock()[0].clone();
    assert_eq!(notif.thing_id, dthing);
    assert_eq!(notif.name, "alarm");
    assert_eq!(notif.data, json!("on"));

    hub.transport.stop().await;
}

#[tokio::test]
async fn subscription_without_permission_is_refused() {
    let RoutedHub { hub, router: _router } = start_routed_hub().await;
    let consumer =
        Consumer::new(hub.wss_client("stranger", ProtocolType::HiveotWss).await, TIMEOUT);
    let err = consumer
        .subscribe(&make_dthing_id("agent1", "thing1"), "alarm")
        .await
        .unwrap_err();
    assert!(err.is_unauthorized());
    hub.transport.stop().await;
}

#[tokio::test]
async fn consumers_reusing_a_correlation_id_get_their_own_reply() {
    let RoutedHub { hub, router } = start_routed_hub().await;
    let _agent = start_slow_agent(&hub, Some(Duration::from_millis(100))).await;
    let c1 = Consumer::new(hub.wss_client("op1", ProtocolType::HiveotWss).await, TIMEOUT);
    let c2 = Consumer::new(hub.wss_client("op2", ProtocolType::HiveotWss).await, TIMEOUT);

    let dthing = make_dthing_id("agent1", "thing1");
    let req1 = RequestMessage::new(OP_INVOKE_ACTION, &dthing, "switch", json!("op1"), "same-id");
    let req2 = RequestMessage::new(OP_INVOKE_ACTION, &dthing, "switch", json!("op2"), "same-id");
    let (r1, r2) = tokio::join!(c1.send_request(req1, true), c2.send_request(req2, true));

    let r1 = r1.unwrap().unwrap();
    let r2 = r2.unwrap().unwrap();
    assert_eq!(r1.correlation_id, "same-id");
    assert_eq!(r1.output, json!("op1"));
    assert_eq!(r1.thing_id, dthing);
    assert_eq!(r2.correlation_id, "same-id");
    assert_eq!(r2.output, json!("op2"));
    assert!(wait_until(|| router.active_count() == 0).await);

    hub.transport.stop().await;
}

#[tokio::test]
async fn requests_of_a_disconnected_consumer_are_dropped() {
    let RoutedHub { hub, router } = start_routed_hub().await;
    let _agent = start_slow_agent(&hub, None).await;
    let consumer = Consumer::new(hub.wss_client("op1", ProtocolType::HiveotWss).await, TIMEOUT);

    let dthing = make_dthing_id("agent1", "thing1");
    let req = RequestMessage::new(OP_INVOKE_ACTION, &dthing, "switch", json!(1), "c1");
    consumer.send_request(req, false).await.unwrap();
    assert!(wait_until(|| router.active_count() == 1).await);

    consumer.disconnect().await;
    assert!(wait_until(|| router.active_count() == 0).await);

    hub.transport.stop().await;
}

#[tokio::test]
async fn agent_disconnect_fails_waiting_requests() {
    let RoutedHub { hub, router } = start_routed_hub().await;
    let agent = start_slow_agent(&hub, None).await;
    let consumer = Consumer::new(hub.wss_client("op1", ProtocolType::HiveotWss).await, TIMEOUT);

    let dthing = make_dthing_id("agent1", "thing1");
    let (res, ()) = tokio::join!(
        consumer.invoke_action(&dthing, "switch", json!(true)),
        async {
            assert!(wait_until(|| router.active_count() == 1).await);
            agent.consumer().disconnect().await;
        }
    );
    assert_eq!(
        res.unwrap_err(),
        HubError::NotFound("agent 'agent1' disconnected".into())
    );
    assert_eq!(router.active_count(), 0);

    hub.transport.stop().await;
}

#[tokio::test]
async fn unknown_operation_is_refused() {
    let RoutedHub { hub, router: _router } = start_routed_hub().await;
    let _agent = start_agent(&hub).await;
    let consumer = Consumer::new(hub.wss_client("op1", ProtocolType::HiveotWss).await, TIMEOUT);

    let err = consumer
        .rpc("frobnicate", &make_dthing_id("agent1", "thing1"), "switch", Value::Null)
        .await
        .unwrap_err();
    assert!(matches!(err, HubError::InvalidArgument(_)));

    hub.transport.stop().await;
}
