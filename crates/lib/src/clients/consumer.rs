//! Consumer role on top of any client connection: RPC with correlation, property access and
//! subscriptions.

use super::correlator::{Delivery, RpcCorrelator};
use crate::connections::{
    ConnectHandler, ConnectionRef, HandlerCell, NotificationHandler, RequestHandler,
    ResponseHandler,
};
use crate::error::HubError;
use crate::messaging::vocab::*;
use crate::messaging::{new_id, NotificationMessage, RequestMessage, ResponseMessage};
use futures_util::FutureExt;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

pub struct Consumer {
    conn: ConnectionRef,
    rpc: Arc<RpcCorrelator>,
    timeout: Duration,
    notification: Arc<HandlerCell<NotificationHandler>>,
    response: Arc<HandlerCell<ResponseHandler>>,
}

impl Consumer {
    /// Take over the response and notification handlers of `conn`. Responses to waiting
    /// requests go to their waiter; the rest reach the handlers set on the consumer.
    pub fn new(conn: ConnectionRef, timeout: Duration) -> Self {
        let rpc = Arc::new(RpcCorrelator::new());
        let notification: Arc<HandlerCell<NotificationHandler>> = Arc::new(HandlerCell::new());
        let response: Arc<HandlerCell<ResponseHandler>> = Arc::new(HandlerCell::new());

        let on_response: ResponseHandler = {
            let rpc = rpc.clone();
            let notification = notification.clone();
            let response = response.clone();
            Arc::new(move |resp: ResponseMessage| {
                let rpc = rpc.clone();
                let notification = notification.clone();
                let response = response.clone();
                async move {
                    match rpc.handle_response(resp.clone()) {
                        Delivery::Delivered => Ok(()),
                        Delivery::Progress => {
                            if let Some(h) = notification.get() {
                                let mut notif = NotificationMessage::new(
                                    OP_INVOKE_ACTION,
                                    &resp.thing_id,
                                    &resp.name,
                                    resp.output.clone(),
                                );
                                notif.correlation_id = resp.correlation_id.clone();
                                h(notif).await;
                            }
                            Ok(())
                        }
                        Delivery::Unmatched => match response.get() {
                            Some(h) => h(resp).await,
                            None => {
                                log::debug!("unexpected response '{}'", resp.correlation_id);
                                Ok(())
                            }
                        },
                    }
                }
                .boxed()
            })
        };
        let on_notification: NotificationHandler = {
            let notification = notification.clone();
            Arc::new(move |notif: NotificationMessage| {
                let notification = notification.clone();
                async move {
                    if let Some(h) = notification.get() {
                        h(notif).await;
                    }
                }
                .boxed()
            })
        };
        conn.set_response_handler(Some(on_response));
        conn.set_notification_handler(Some(on_notification));
        Self {
            conn,
            rpc,
            timeout,
            notification,
            response,
        }
    }

    pub fn connection(&self) -> &ConnectionRef {
        &self.conn
    }

    pub fn rpc_correlator(&self) -> &RpcCorrelator {
        &self.rpc
    }

    pub fn is_connected(&self) -> bool {
        self.conn.is_connected()
    }

    pub async fn disconnect(&self) {
        self.conn.disconnect().await;
    }

    pub fn set_connect_handler(&self, handler: Option<ConnectHandler>) {
        self.conn.set_connect_handler(handler);
    }

    pub fn set_notification_handler(&self, handler: Option<NotificationHandler>) {
        self.notification.set(handler);
    }

    /// Handler for responses nobody is waiting for.
    pub fn set_response_handler(&self, handler: Option<ResponseHandler>) {
        self.response.set(handler);
    }

    pub(crate) fn set_request_handler(&self, handler: Option<RequestHandler>) {
        self.conn.set_request_handler(handler);
    }

    /// Send a request. With `wait` this blocks until the final response arrives or the
    /// timeout passes; without it the response goes to the response handler.
    pub async fn send_request(
        &self,
        req: RequestMessage,
        wait: bool,
    ) -> Result<Option<ResponseMessage>, HubError> {
        if !wait {
            self.conn.send_request(&req).await?;
            return Ok(None);
        }
        let rx = self.rpc.open(&req.correlation_id);
        if let Err(e) = self.conn.send_request(&req).await {
            self.rpc.close(&req.correlation_id);
            return Err(e);
        }
        let resp = self.rpc.wait(&req.correlation_id, rx, self.timeout).await?;
        Ok(Some(resp))
    }

    /// Request and wait for the output. A failed response becomes its error.
    pub async fn rpc(
        &self,
        operation: &str,
        thing_id: &str,
        name: &str,
        input: Value,
    ) -> Result<Value, HubError> {
        let req = RequestMessage::new(operation, thing_id, name, input, &new_id());
        match self.send_request(req, true).await? {
            Some(resp) => resp.into_result(),
            None => Ok(Value::Null),
        }
    }

    pub async fn invoke_action(
        &self,
        thing_id: &str,
        name: &str,
        input: Value,
    ) -> Result<Value, HubError> {
        self.rpc(OP_INVOKE_ACTION, thing_id, name, input).await
    }

    pub async fn query_action(&self, thing_id: &str, name: &str) -> Result<Value, HubError> {
        self.rpc(OP_QUERY_ACTION, thing_id, name, Value::Null).await
    }

    pub async fn read_property(&self, thing_id: &str, name: &str) -> Result<Value, HubError> {
        self.rpc(OP_READ_PROPERTY, thing_id, name, Value::Null).await
    }

    pub async fn read_all_properties(&self, thing_id: &str) -> Result<Value, HubError> {
        self.rpc(OP_READ_ALL_PROPERTIES, thing_id, "", Value::Null).await
    }

    pub async fn write_property(
        &self,
        thing_id: &str,
        name: &str,
        value: Value,
    ) -> Result<(), HubError> {
        self.rpc(OP_WRITE_PROPERTY, thing_id, name, value).await.map(|_| ())
    }

    /// Subscribe to an event; an empty name subscribes to all events of the Thing, an empty
    /// thingID to all Things.
    pub async fn subscribe(&self, thing_id: &str, name: &str) -> Result<(), HubError> {
        let op = if name.is_empty() { OP_SUBSCRIBE_ALL_EVENTS } else { OP_SUBSCRIBE_EVENT };
        self.rpc(op, thing_id, name, Value::Null).await.map(|_| ())
    }

    pub async fn unsubscribe(&self, thing_id: &str, name: &str) -> Result<(), HubError> {
        let op = if name.is_empty() { OP_UNSUBSCRIBE_ALL_EVENTS } else { OP_UNSUBSCRIBE_EVENT };
        self.rpc(op, thing_id, name, Value::Null).await.map(|_| ())
    }

    pub async fn observe(&self, thing_id: &str, name: &str) -> Result<(), HubError> {
        let op = if name.is_empty() { OP_OBSERVE_ALL_PROPERTIES } else { OP_OBSERVE_PROPERTY };
        self.rpc(op, thing_id, name, Value::Null).await.map(|_| ())
    }

    pub async fn unobserve(&self, thing_id: &str, name: &str) -> Result<(), HubError> {
        let op = if name.is_empty() {
            OP_UNOBSERVE_ALL_PROPERTIES
        } else {
            OP_UNOBSERVE_PROPERTY
        };
        self.rpc(op, thing_id, name, Value::Null).await.map(|_| ())
    }

    pub async fn ping(&self) -> Result<String, HubError> {
        let out = self.rpc(OP_PING, "", "", Value::Null).await?;
        Ok(out.as_str().unwrap_or_default().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connections::{Connection, ConnectionInfo, Handlers};
    use crate::messaging::{ProtocolType, ResponseStatus};
    use async_trait::async_trait;
    use parking_lot::Mutex;

    /// Loopback connection: requests are answered by `answer` through the response handler.
    struct Loopback {
        handlers: Handlers,
        sent: Mutex<Vec<RequestMessage>>,
        answer: fn(&RequestMessage) -> Vec<ResponseMessage>,
    }

    impl Loopback {
        fn new(answer: fn(&RequestMessage) -> Vec<ResponseMessage>) -> Arc<Self> {
            Arc::new(Self {
                handlers: Handlers::default(),
                sent: Mutex::new(Vec::new()),
                answer,
            })
        }
    }

    #[async_trait]
    impl Connection for Loopback {
        fn connection_info(&self) -> ConnectionInfo {
            ConnectionInfo::new("c1", "cid1", "", ProtocolType::HiveotWss)
        }
        fn is_connected(&self) -> bool {
            true
        }
        async fn disconnect(&self) {}
        async fn send_request(&self, req: &RequestMessage) -> Result<(), HubError> {
            self.sent.lock().push(req.clone());
            for resp in (self.answer)(req) {
                self.handlers.dispatch_response(resp).await?;
            }
            Ok(())
        }
        async fn send_response(&self, _resp: &ResponseMessage) -> Result<(), HubError> {
            Ok(())
        }
        async fn send_notification(&self, _n: &NotificationMessage) -> Result<(), HubError> {
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

    fn echo(req: &RequestMessage) -> Vec<ResponseMessage> {
        vec![req.create_response(req.input.clone(), None)]
    }

    fn progress_then_done(req: &RequestMessage) -> Vec<ResponseMessage> {
        vec![
            req.create_progress(ResponseStatus::Running, Value::from(50)),
            req.create_response(Value::from("done"), None),
        ]
    }

    fn silent(_req: &RequestMessage) -> Vec<ResponseMessage> {
        Vec::new()
    }

    fn refuse(req: &RequestMessage) -> Vec<ResponseMessage> {
        let err = HubError::Unauthorized("nope".into());
        vec![req.create_response(Value::Null, Some(&err))]
    }

    #[tokio::test]
    async fn invoke_action_returns_output() {
        let conn = Loopback::new(echo);
        let consumer = Consumer::new(conn.clone(), Duration::from_secs(1));
        let out = consumer
            .invoke_action("thing1", "action1", Value::from("hello world 1"))
            .await
            .unwrap();
        assert_eq!(out, Value::from("hello world 1"));
        assert!(consumer.rpc_correlator().is_empty());
        assert_eq!(conn.sent.lock()[0].operation, OP_INVOKE_ACTION);
    }

    #[tokio::test]
    async fn progress_goes_to_notification_handler() {
        let conn = Loopback::new(progress_then_done);
        let consumer = Consumer::new(conn, Duration::from_secs(1));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        consumer.set_notification_handler(Some(Arc::new(move |n: NotificationMessage| {
            sink.lock().push(n);
            async {}.boxed()
        })));
        let out = consumer.invoke_action("thing1", "a1", Value::Null).await.unwrap();
        assert_eq!(out, Value::from("done"));
        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].operation, OP_INVOKE_ACTION);
        assert_eq!(seen[0].data, Value::from(50));
    }

    #[tokio::test]
    async fn failed_response_becomes_error() {
        let consumer = Consumer::new(Loopback::new(refuse), Duration::from_secs(1));
        let err = consumer.read_property("thing1", "p1").await.unwrap_err();
        assert!(err.is_unauthorized());
    }

    #[tokio::test]
    async fn missing_response_times_out() {
        let consumer = Consumer::new(Loopback::new(silent), Duration::from_millis(30));
        let err = consumer.ping().await.unwrap_err();
        assert!(matches!(err, HubError::Timeout(_)));
        assert!(consumer.rpc_correlator().is_empty());
    }

    #[tokio::test]
    async fn subscribe_picks_operation_by_name() {
        let conn = Loopback::new(echo);
        let consumer = Consumer::new(conn.clone(), Duration::from_secs(1));
        consumer.subscribe("thing1", "").await.unwrap();
        consumer.subscribe("thing1", "event11").await.unwrap();
        consumer.unobserve("thing1", "p1").await.unwrap();
        let ops: Vec<String> = conn.sent.lock().iter().map(|r| r.operation.clone()).collect();
        assert_eq!(
            ops,
            vec![OP_SUBSCRIBE_ALL_EVENTS, OP_SUBSCRIBE_EVENT, OP_UNOBSERVE_PROPERTY]
        );
    }

    #[tokio::test]
    async fn unmatched_responses_reach_response_handler() {
        let conn = Loopback::new(silent);
        let consumer = Consumer::new(conn.clone(), Duration::from_secs(1));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        consumer.set_response_handler(Some(Arc::new(move |r: ResponseMessage| {
            sink.lock().push(r.correlation_id);
            async { Ok(()) }.boxed()
        })));
        let req = RequestMessage::new(OP_INVOKE_ACTION, "t1", "a1", Value::Null, "late");
        assert!(consumer.send_request(req.clone(), false).await.unwrap().is_none());
        conn.handlers
            .dispatch_response(req.create_response(Value::Null, None))
            .await
            .unwrap();
        assert_eq!(seen.lock().as_slice(), ["late".to_string()]);
    }
}
