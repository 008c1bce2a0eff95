//! Agent role: serves requests for its Things and publishes their events and properties.

use super::consumer::Consumer;
use crate::connections::{ConnectionRef, RequestHandler};
use crate::error::HubError;
use crate::messaging::vocab::{OP_OBSERVE_ALL_PROPERTIES, OP_OBSERVE_PROPERTY, OP_SUBSCRIBE_EVENT};
use crate::messaging::{NotificationMessage, RequestMessage, ResponseMessage, ResponseStatus};
use serde_json::Value;
use std::time::Duration;

/// An agent is also a consumer of the hub.
pub struct Agent {
    consumer: Consumer,
}

impl Agent {
    pub fn new(conn: ConnectionRef, timeout: Duration) -> Self {
        Self {
            consumer: Consumer::new(conn, timeout),
        }
    }

    pub fn consumer(&self) -> &Consumer {
        &self.consumer
    }

    /// Handler for action and property requests sent to this agent's Things. Returning `None`
    /// means the response will be sent later with [`Agent::send_response`].
    pub fn set_request_handler(&self, handler: Option<RequestHandler>) {
        self.consumer.set_request_handler(handler);
    }

    pub async fn pub_event(&self, thing_id: &str, name: &str, data: Value) -> Result<(), HubError> {
        let notif = NotificationMessage::new(OP_SUBSCRIBE_EVENT, thing_id, name, data);
        self.consumer.connection().send_notification(&notif).await
    }

    pub async fn pub_property(
        &self,
        thing_id: &str,
        name: &str,
        value: Value,
    ) -> Result<(), HubError> {
        let notif = NotificationMessage::new(OP_OBSERVE_PROPERTY, thing_id, name, value);
        self.consumer.connection().send_notification(&notif).await
    }

    /// Publish several property values at once as a `{name: value}` map.
    pub async fn pub_properties(&self, thing_id: &str, values: Value) -> Result<(), HubError> {
        let notif = NotificationMessage::new(OP_OBSERVE_ALL_PROPERTIES, thing_id, "", values);
        self.consumer.connection().send_notification(&notif).await
    }

    /// Report that `req` is still pending or running.
    pub async fn pub_action_progress(
        &self,
        req: &RequestMessage,
        status: ResponseStatus,
        output: Value,
    ) -> Result<(), HubError> {
        self.send_response(&req.create_progress(status, output)).await
    }

    pub async fn send_response(&self, resp: &ResponseMessage) -> Result<(), HubError> {
        self.consumer.connection().send_response(resp).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connections::{
        Connection, ConnectHandler, ConnectionInfo, Handlers, NotificationHandler,
        ResponseHandler,
    };
    use crate::messaging::vocab::OP_INVOKE_ACTION;
    use crate::messaging::ProtocolType;
    use async_trait::async_trait;
    use futures_util::FutureExt;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::Arc;

    /// Records what the agent publishes; inbound requests are fed in with `deliver`.
    #[derive(Default)]
    struct Recorder {
        handlers: Handlers,
        notifications: Mutex<Vec<NotificationMessage>>,
        responses: Mutex<Vec<ResponseMessage>>,
    }

    impl Recorder {
        async fn deliver(self: &Arc<Self>, req: RequestMessage) {
            let this: ConnectionRef = self.clone();
            if let Some(resp) = self.handlers.dispatch_request(req, Some(this)).await {
                self.responses.lock().push(resp);
            }
        }
    }

    #[async_trait]
    impl Connection for Recorder {
        fn connection_info(&self) -> ConnectionInfo {
            ConnectionInfo::new("agent1", "cid1", "", ProtocolType::HiveotWss)
        }
        fn is_connected(&self) -> bool {
            true
        }
        async fn disconnect(&self) {}
        async fn send_request(&self, _req: &RequestMessage) -> Result<(), HubError> {
            Ok(())
        }
        async fn send_response(&self, resp: &ResponseMessage) -> Result<(), HubError> {
            self.responses.lock().push(resp.clone());
            Ok(())
        }
        async fn send_notification(&self, n: &NotificationMessage) -> Result<(), HubError> {
            self.notifications.lock().push(n.clone());
            Ok(())
        }
        fn set_connect_handler(&self, h: Option<ConnectHandler>) {
            self.handlers.connect.set(h);
        }
        fn set_notification_handler(&self, h: Option<NotificationHandler>) {
            self.handlers.notification.set(h);
        }
        fn set_request_handler(&self, h: Option<RequestHandler>) {
            self.handlers.request.set(h);
        }
        fn set_response_handler(&self, h: Option<ResponseHandler>) {
            self.handlers.response.set(h);
        }
    }

    fn agent() -> (Arc<Recorder>, Agent) {
        let conn = Arc::new(Recorder::default());
        let agent = Agent::new(conn.clone(), Duration::from_secs(1));
        (conn, agent)
    }

    #[tokio::test]
    async fn publishes_events_and_properties() {
        let (conn, agent) = agent();
        agent.pub_event("thing1", "alarm", json!("on")).await.unwrap();
        agent.pub_property("thing1", "temp", json!(21.5)).await.unwrap();
        agent
            .pub_properties("thing1", json!({"temp": 21.5, "humidity": 40}))
            .await
            .unwrap();

        let sent = conn.notifications.lock();
        let ops: Vec<&str> = sent.iter().map(|n| n.operation.as_str()).collect();
        assert_eq!(
            ops,
            vec![OP_SUBSCRIBE_EVENT, OP_OBSERVE_PROPERTY, OP_OBSERVE_ALL_PROPERTIES]
        );
        assert_eq!(sent[0].name, "alarm");
        assert_eq!(sent[1].data, json!(21.5));
        // bulk values carry no single affordance name
        assert_eq!(sent[2].name, "");
        assert_eq!(sent[2].data["humidity"], json!(40));
        assert!(sent.iter().all(|n| n.thing_id == "thing1"));
    }

    #[tokio::test]
    async fn action_progress_then_result() {
        let (conn, agent) = agent();
        let req = RequestMessage::new(OP_INVOKE_ACTION, "thing1", "open", json!(1), "corr-7");

        agent
            .pub_action_progress(&req, ResponseStatus::Running, json!(30))
            .await
            .unwrap();
        agent
            .send_response(&req.create_response(json!("opened"), None))
            .await
            .unwrap();

        let sent = conn.responses.lock();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].status, ResponseStatus::Running);
        assert_eq!(sent[0].output, json!(30));
        assert_eq!(sent[0].correlation_id, "corr-7");
        assert!(!sent[0].status.is_final());
        assert_eq!(sent[1].status, ResponseStatus::Completed);
        assert_eq!(sent[1].correlation_id, "corr-7");
    }

    #[tokio::test]
    async fn requests_reach_the_agent_handler() {
        let (conn, agent) = agent();
        agent.set_request_handler(Some(Arc::new(
            |req: RequestMessage, _reply: Option<ConnectionRef>| {
                async move {
                    let out = json!(format!("{} {}", req.name, req.input));
                    Some(req.create_response(out, None))
                }
                .boxed()
            },
        )));
        let req = RequestMessage::new(OP_INVOKE_ACTION, "thing1", "dim", json!(5), "corr-8");
        conn.deliver(req).await;

        let sent = conn.responses.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].output, json!("dim 5"));
        assert_eq!(sent[0].correlation_id, "corr-8");
    }
}
