//! Matches responses to the requests waiting for them by correlationID.

use crate::error::HubError;
use crate::messaging::ResponseMessage;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::oneshot;

/// What [`RpcCorrelator::handle_response`] did with a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Final response handed to its waiter.
    Delivered,
    /// Pending or running status for a waiting request; the waiter keeps waiting.
    Progress,
    /// No request is waiting for it.
    Unmatched,
}

#[derive(Default)]
pub struct RpcCorrelator {
    waiting: Mutex<HashMap<String, oneshot::Sender<ResponseMessage>>>,
}

impl RpcCorrelator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a waiter. Must happen before the request is sent so a fast response
    /// cannot be missed.
    pub fn open(&self, correlation_id: &str) -> oneshot::Receiver<ResponseMessage> {
        let (tx, rx) = oneshot::channel();
        self.waiting.lock().insert(correlation_id.to_string(), tx);
        rx
    }

    pub fn close(&self, correlation_id: &str) {
        self.waiting.lock().remove(correlation_id);
    }

    pub fn is_waiting(&self, correlation_id: &str) -> bool {
        self.waiting.lock().contains_key(correlation_id)
    }

    pub fn len(&self) -> usize {
        self.waiting.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn handle_response(&self, resp: ResponseMessage) -> Delivery {
        let mut waiting = self.waiting.lock();
        if !waiting.contains_key(&resp.correlation_id) {
            return Delivery::Unmatched;
        }
        if !resp.status.is_final() {
            return Delivery::Progress;
        }
        match waiting.remove(&resp.correlation_id) {
            Some(tx) => {
                // a dropped receiver means the waiter already gave up
                let _ = tx.send(resp);
                Delivery::Delivered
            }
            None => Delivery::Unmatched,
        }
    }

    /// Wait for the response of an opened request. The waiter is removed on delivery and
    /// on timeout.
    pub async fn wait(
        &self,
        correlation_id: &str,
        rx: oneshot::Receiver<ResponseMessage>,
        timeout: Duration,
    ) -> Result<ResponseMessage, HubError> {
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(resp)) => Ok(resp),
            Ok(Err(_)) => {
                self.close(correlation_id);
                Err(HubError::Transport(format!(
                    "request '{}' was abandoned",
                    correlation_id
                )))
            }
            Err(_) => {
                self.close(correlation_id);
                Err(HubError::Timeout(format!(
                    "no response to '{}' within {:?}",
                    correlation_id, timeout
                )))
            }
        }
    }
}
