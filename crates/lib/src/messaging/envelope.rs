//! Request, response and notification envelopes.
//!
//! These are the transport-agnostic messages every server and client works with.
//! The HiveOT wire format serializes them verbatim.

use crate::error::HubError;
use crate::messaging::vocab::{
    MESSAGE_TYPE_NOTIFICATION, MESSAGE_TYPE_REQUEST, MESSAGE_TYPE_RESPONSE,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Current time as RFC3339 with millisecond precision (UTC).
pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// New unique message or correlation ID.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Progress of a request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Pending,
    Running,
    #[default]
    Completed,
    Failed,
}

impl ResponseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseStatus::Pending => "pending",
            ResponseStatus::Running => "running",
            ResponseStatus::Completed => "completed",
            ResponseStatus::Failed => "failed",
        }
    }

    /// Completed or failed; no further responses follow.
    pub fn is_final(&self) -> bool {
        matches!(self, ResponseStatus::Completed | ResponseStatus::Failed)
    }
}

/// Error carried in a response: problem title plus detail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorValue {
    pub title: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub detail: String,
}

impl ErrorValue {
    pub fn to_error(&self) -> HubError {
        HubError::from_title(&self.title, self.detail.clone())
    }
}

impl From<&HubError> for ErrorValue {
    fn from(e: &HubError) -> Self {
        Self {
            title: e.title().to_string(),
            detail: e.detail().to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestMessage {
    pub message_type: String,
    #[serde(rename = "messageID", default)]
    pub message_id: String,
    #[serde(rename = "correlationID", default, skip_serializing_if = "String::is_empty")]
    pub correlation_id: String,
    pub operation: String,
    #[serde(rename = "thingID", default, skip_serializing_if = "String::is_empty")]
    pub thing_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub input: Value,
    #[serde(rename = "senderID", default, skip_serializing_if = "String::is_empty")]
    pub sender_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub created: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub updated: String,
}

impl RequestMessage {
    pub fn new(
        operation: &str,
        thing_id: &str,
        name: &str,
        input: Value,
        correlation_id: &str,
    ) -> Self {
        Self {
            message_type: MESSAGE_TYPE_REQUEST.to_string(),
            message_id: new_id(),
            correlation_id: correlation_id.to_string(),
            operation: operation.to_string(),
            thing_id: thing_id.to_string(),
            name: name.to_string(),
            input,
            sender_id: String::new(),
            created: now_rfc3339(),
            updated: String::new(),
        }
    }

    /// Final response to this request. An error makes it `failed`.
    pub fn create_response(&self, output: Value, err: Option<&HubError>) -> ResponseMessage {
        let mut resp = ResponseMessage::new(
            &self.operation,
            &self.thing_id,
            &self.name,
            output,
            err,
            &self.correlation_id,
        );
        resp.created = self.created.clone();
        resp
    }

    /// Response announcing the request is still in progress.
    pub fn create_progress(&self, status: ResponseStatus, output: Value) -> ResponseMessage {
        let mut resp = self.create_response(output, None);
        resp.status = status;
        resp
    }

    /// Notification about this request's affordance, e.g. action progress.
    pub fn create_notification(&self, data: Value) -> NotificationMessage {
        NotificationMessage::new(&self.operation, &self.thing_id, &self.name, data)
    }

    /// Action status record for this request.
    pub fn create_action_status(&self, status: ResponseStatus, agent_id: &str) -> ActionStatus {
        ActionStatus {
            agent_id: agent_id.to_string(),
            id: self.correlation_id.clone(),
            thing_id: self.thing_id.clone(),
            name: self.name.clone(),
            input: self.input.clone(),
            output: Value::Null,
            status,
            error: None,
            sender_id: self.sender_id.clone(),
            requested: self.created.clone(),
            updated: now_rfc3339(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseMessage {
    pub message_type: String,
    #[serde(rename = "messageID", default)]
    pub message_id: String,
    #[serde(rename = "correlationID", default, skip_serializing_if = "String::is_empty")]
    pub correlation_id: String,
    pub operation: String,
    #[serde(rename = "thingID", default, skip_serializing_if = "String::is_empty")]
    pub thing_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub output: Value,
    #[serde(default)]
    pub status: ResponseStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorValue>,
    #[serde(rename = "senderID", default, skip_serializing_if = "String::is_empty")]
    pub sender_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub created: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub updated: String,
}

impl ResponseMessage {
    pub fn new(
        operation: &str,
        thing_id: &str,
        name: &str,
        output: Value,
        err: Option<&HubError>,
        correlation_id: &str,
    ) -> Self {
        let now = now_rfc3339();
        Self {
            message_type: MESSAGE_TYPE_RESPONSE.to_string(),
            message_id: new_id(),
            correlation_id: correlation_id.to_string(),
            operation: operation.to_string(),
            thing_id: thing_id.to_string(),
            name: name.to_string(),
            output,
            status: if err.is_some() {
                ResponseStatus::Failed
            } else {
                ResponseStatus::Completed
            },
            error: err.map(ErrorValue::from),
            sender_id: String::new(),
            created: now.clone(),
            updated: now,
        }
    }

    /// Output on success, the carried error otherwise.
    pub fn into_result(self) -> Result<Value, HubError> {
        match self.error {
            Some(e) => Err(e.to_error()),
            None => Ok(self.output),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationMessage {
    pub message_type: String,
    #[serde(rename = "messageID", default)]
    pub message_id: String,
    #[serde(rename = "correlationID", default, skip_serializing_if = "String::is_empty")]
    pub correlation_id: String,
    pub operation: String,
    #[serde(rename = "thingID", default, skip_serializing_if = "String::is_empty")]
    pub thing_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
    #[serde(rename = "senderID", default, skip_serializing_if = "String::is_empty")]
    pub sender_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub created: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub updated: String,
}

impl NotificationMessage {
    pub fn new(operation: &str, thing_id: &str, name: &str, data: Value) -> Self {
        Self {
            message_type: MESSAGE_TYPE_NOTIFICATION.to_string(),
            message_id: new_id(),
            correlation_id: String::new(),
            operation: operation.to_string(),
            thing_id: thing_id.to_string(),
            name: name.to_string(),
            data,
            sender_id: String::new(),
            created: now_rfc3339(),
            updated: String::new(),
        }
    }
}

/// Status of an action request, returned with 201 for pending requests and
/// published as action progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionStatus {
    #[serde(rename = "agentID", default, skip_serializing_if = "String::is_empty")]
    pub agent_id: String,
    /// Correlation ID of the request.
    #[serde(default)]
    pub id: String,
    #[serde(rename = "thingID", default, skip_serializing_if = "String::is_empty")]
    pub thing_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub input: Value,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub output: Value,
    pub status: ResponseStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorValue>,
    #[serde(rename = "senderID", default, skip_serializing_if = "String::is_empty")]
    pub sender_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub requested: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub updated: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::vocab::OP_INVOKE_ACTION;
    use serde_json::json;

    #[test]
    fn request_uses_wire_field_names() {
        let mut req = RequestMessage::new(OP_INVOKE_ACTION, "thing1", "action1", json!(1), "c1");
        req.sender_id = "user1".into();
        let v = serde_json::to_value(&req).unwrap();
        assert_eq!(v["messageType"], "request");
        assert_eq!(v["correlationID"], "c1");
        assert_eq!(v["thingID"], "thing1");
        assert_eq!(v["senderID"], "user1");
        assert!(v.get("messageID").is_some());
        assert!(v.get("updated").is_none());
    }

    #[test]
    fn response_echoes_correlation_id() {
        let req = RequestMessage::new(OP_INVOKE_ACTION, "thing1", "action1", json!("x"), "c42");
        let resp = req.create_response(json!("y"), None);
        assert_eq!(resp.correlation_id, "c42");
        assert_eq!(resp.operation, OP_INVOKE_ACTION);
        assert_eq!(resp.status, ResponseStatus::Completed);
        assert_eq!(resp.into_result().unwrap(), json!("y"));
    }

    #[test]
    fn failed_response_carries_error_kind() {
        let req = RequestMessage::new(OP_INVOKE_ACTION, "t", "a", Value::Null, "c");
        let err = HubError::NotFound("agent 'a1' not reachable".into());
        let resp = req.create_response(Value::Null, Some(&err));
        assert_eq!(resp.status, ResponseStatus::Failed);
        assert_eq!(resp.error.as_ref().unwrap().title, "NotFound");
        assert_eq!(resp.into_result().unwrap_err(), err);
    }

    #[test]
    fn created_has_millisecond_precision() {
        let ts = now_rfc3339();
        // 2024-01-02T03:04:05.678Z
        assert_eq!(ts.len(), 24);
        assert!(ts.ends_with('Z'));
        assert_eq!(&ts[19..20], ".");
    }

    #[test]
    fn status_defaults_to_completed_when_missing() {
        let raw = r#"{"messageType":"response","operation":"readProperty","output":3}"#;
        let resp: ResponseMessage = serde_json::from_str(raw).unwrap();
        assert_eq!(resp.status, ResponseStatus::Completed);
        assert!(resp.error.is_none());
    }
}
