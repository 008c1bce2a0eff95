//! WoT websocket converter.
//!
//! Maps envelope operations onto the WoT-WSS message-type vocabulary. Some message types
//! answer more than one operation (`actionStatus` for invokeAction and queryAction,
//! `propertyReading` for readProperty and observeProperty), so every encoded message also
//! carries the envelope `operation` as an extra field. When a peer omits it, the operation
//! falls back to the fixed `msg_type_to_op` table.
//!
//! `event`, `propertyReading(s)` and `actionStatus` messages without a correlationID are
//! notifications; with one they are responses.

use crate::error::HubError;
use crate::messaging::converter::MessageConverter;
use crate::messaging::envelope::{
    now_rfc3339, ActionStatus, ErrorValue, NotificationMessage, RequestMessage, ResponseMessage,
    ResponseStatus,
};
use crate::messaging::vocab::*;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

pub const MSG_TYPE_ACK: &str = "ack";
pub const MSG_TYPE_ACTION_STATUS: &str = "actionStatus";
pub const MSG_TYPE_ACTION_STATUSES: &str = "actionStatuses";
pub const MSG_TYPE_CANCEL_ACTION: &str = "cancelAction";
pub const MSG_TYPE_ERROR: &str = "error";
pub const MSG_TYPE_EVENT: &str = "event";
pub const MSG_TYPE_INVOKE_ACTION: &str = "invokeAction";
pub const MSG_TYPE_OBSERVE_ALL_PROPERTIES: &str = "observeAllProperties";
pub const MSG_TYPE_OBSERVE_PROPERTY: &str = "observeProperty";
pub const MSG_TYPE_PING: &str = "ping";
pub const MSG_TYPE_PONG: &str = "pong";
pub const MSG_TYPE_PROPERTY_READING: &str = "propertyReading";
pub const MSG_TYPE_PROPERTY_READINGS: &str = "propertyReadings";
pub const MSG_TYPE_QUERY_ACTION: &str = "queryAction";
pub const MSG_TYPE_QUERY_ALL_ACTIONS: &str = "queryAllActions";
pub const MSG_TYPE_READ_ALL_PROPERTIES: &str = "readAllProperties";
pub const MSG_TYPE_READ_PROPERTY: &str = "readProperty";
pub const MSG_TYPE_SUBSCRIBE_ALL_EVENTS: &str = "subscribeAllEvents";
pub const MSG_TYPE_SUBSCRIBE_EVENT: &str = "subscribeEvent";
pub const MSG_TYPE_UNOBSERVE_ALL_PROPERTIES: &str = "unobserveAllProperties";
pub const MSG_TYPE_UNOBSERVE_PROPERTY: &str = "unobserveProperty";
pub const MSG_TYPE_UNSUBSCRIBE_ALL_EVENTS: &str = "unsubscribeAllEvents";
pub const MSG_TYPE_UNSUBSCRIBE_EVENT: &str = "unsubscribeEvent";
pub const MSG_TYPE_WRITE_PROPERTY: &str = "writeProperty";

/// Default operation for a message type when the hidden `operation` field is absent.
pub fn msg_type_to_op(msg_type: &str) -> Option<&'static str> {
    let op = match msg_type {
        MSG_TYPE_ACTION_STATUS => OP_QUERY_ACTION,
        MSG_TYPE_ACTION_STATUSES => OP_QUERY_ALL_ACTIONS,
        MSG_TYPE_CANCEL_ACTION => OP_CANCEL_ACTION,
        MSG_TYPE_INVOKE_ACTION => OP_INVOKE_ACTION,
        MSG_TYPE_OBSERVE_ALL_PROPERTIES => OP_OBSERVE_ALL_PROPERTIES,
        MSG_TYPE_OBSERVE_PROPERTY => OP_OBSERVE_PROPERTY,
        MSG_TYPE_ERROR => OP_ERROR,
        MSG_TYPE_PING | MSG_TYPE_PONG => OP_PING,
        MSG_TYPE_PROPERTY_READINGS => OP_OBSERVE_ALL_PROPERTIES,
        MSG_TYPE_PROPERTY_READING => OP_OBSERVE_PROPERTY,
        MSG_TYPE_EVENT => OP_SUBSCRIBE_EVENT,
        MSG_TYPE_QUERY_ACTION => OP_QUERY_ACTION,
        MSG_TYPE_QUERY_ALL_ACTIONS => OP_QUERY_ALL_ACTIONS,
        MSG_TYPE_READ_ALL_PROPERTIES => OP_READ_ALL_PROPERTIES,
        MSG_TYPE_READ_PROPERTY => OP_READ_PROPERTY,
        MSG_TYPE_SUBSCRIBE_ALL_EVENTS => OP_SUBSCRIBE_ALL_EVENTS,
        MSG_TYPE_SUBSCRIBE_EVENT => OP_SUBSCRIBE_EVENT,
        MSG_TYPE_UNOBSERVE_ALL_PROPERTIES => OP_UNOBSERVE_ALL_PROPERTIES,
        MSG_TYPE_UNOBSERVE_PROPERTY => OP_UNOBSERVE_PROPERTY,
        MSG_TYPE_UNSUBSCRIBE_ALL_EVENTS => OP_UNSUBSCRIBE_ALL_EVENTS,
        MSG_TYPE_UNSUBSCRIBE_EVENT => OP_UNSUBSCRIBE_EVENT,
        MSG_TYPE_WRITE_PROPERTY => OP_WRITE_PROPERTY,
        _ => return None,
    };
    Some(op)
}

/// Message type used for a request with the given operation.
pub fn request_msg_type(op: &str) -> Option<&'static str> {
    let t = match op {
        OP_CANCEL_ACTION => MSG_TYPE_CANCEL_ACTION,
        OP_INVOKE_ACTION => MSG_TYPE_INVOKE_ACTION,
        OP_OBSERVE_ALL_PROPERTIES => MSG_TYPE_OBSERVE_ALL_PROPERTIES,
        OP_OBSERVE_PROPERTY => MSG_TYPE_OBSERVE_PROPERTY,
        OP_ERROR => MSG_TYPE_ERROR,
        OP_PING => MSG_TYPE_PING,
        OP_QUERY_ACTION => MSG_TYPE_QUERY_ACTION,
        OP_QUERY_ALL_ACTIONS => MSG_TYPE_QUERY_ALL_ACTIONS,
        OP_READ_ALL_PROPERTIES => MSG_TYPE_READ_ALL_PROPERTIES,
        OP_READ_PROPERTY => MSG_TYPE_READ_PROPERTY,
        OP_SUBSCRIBE_ALL_EVENTS => MSG_TYPE_SUBSCRIBE_ALL_EVENTS,
        OP_SUBSCRIBE_EVENT => MSG_TYPE_SUBSCRIBE_EVENT,
        OP_UNOBSERVE_ALL_PROPERTIES => MSG_TYPE_UNOBSERVE_ALL_PROPERTIES,
        OP_UNOBSERVE_PROPERTY => MSG_TYPE_UNOBSERVE_PROPERTY,
        OP_UNSUBSCRIBE_ALL_EVENTS => MSG_TYPE_UNSUBSCRIBE_ALL_EVENTS,
        OP_UNSUBSCRIBE_EVENT => MSG_TYPE_UNSUBSCRIBE_EVENT,
        OP_WRITE_PROPERTY => MSG_TYPE_WRITE_PROPERTY,
        _ => return None,
    };
    Some(t)
}

/// Message type used for a response to the given operation.
pub fn response_msg_type(op: &str) -> Option<&'static str> {
    let t = match op {
        OP_INVOKE_ACTION | OP_QUERY_ACTION => MSG_TYPE_ACTION_STATUS,
        OP_QUERY_ALL_ACTIONS => MSG_TYPE_ACTION_STATUSES,
        OP_OBSERVE_ALL_PROPERTIES | OP_READ_ALL_PROPERTIES => MSG_TYPE_PROPERTY_READINGS,
        OP_OBSERVE_PROPERTY | OP_READ_PROPERTY => MSG_TYPE_PROPERTY_READING,
        OP_ERROR => MSG_TYPE_ERROR,
        OP_PING => MSG_TYPE_PONG,
        OP_SUBSCRIBE_ALL_EVENTS | OP_SUBSCRIBE_EVENT => MSG_TYPE_EVENT,
        OP_CANCEL_ACTION
        | OP_UNOBSERVE_ALL_PROPERTIES
        | OP_UNOBSERVE_PROPERTY
        | OP_UNSUBSCRIBE_ALL_EVENTS
        | OP_UNSUBSCRIBE_EVENT
        | OP_WRITE_PROPERTY => MSG_TYPE_ACK,
        _ => return None,
    };
    Some(t)
}

fn is_notification_type(msg_type: &str) -> bool {
    matches!(
        msg_type,
        MSG_TYPE_EVENT | MSG_TYPE_PROPERTY_READING | MSG_TYPE_PROPERTY_READINGS | MSG_TYPE_ACTION_STATUS
    )
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct BaseMessage {
    #[serde(rename = "correlationID", default, skip_serializing_if = "String::is_empty")]
    correlation_id: String,
    #[serde(rename = "messageID", default)]
    message_id: String,
    #[serde(rename = "messageType")]
    message_type: String,
    #[serde(rename = "thingId", default, skip_serializing_if = "String::is_empty")]
    thing_id: String,
    // hidden extension field
    #[serde(default, skip_serializing_if = "String::is_empty")]
    operation: String,
    #[serde(rename = "senderID", default, skip_serializing_if = "String::is_empty")]
    sender_id: String,
}

impl BaseMessage {
    fn resolved_op(&self) -> String {
        if !self.operation.is_empty() {
            return self.operation.clone();
        }
        msg_type_to_op(&self.message_type)
            .unwrap_or_default()
            .to_string()
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ActionMessage {
    #[serde(flatten)]
    base: BaseMessage,
    #[serde(rename = "action", default, skip_serializing_if = "String::is_empty")]
    name: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    input: Value,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    timestamp: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ActionStatusMessage {
    #[serde(flatten)]
    base: BaseMessage,
    #[serde(rename = "action", default, skip_serializing_if = "String::is_empty")]
    name: String,
    #[serde(default)]
    status: ResponseStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<ErrorValue>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    output: Value,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    time_requested: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    time_ended: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    timestamp: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct EventMessage {
    #[serde(flatten)]
    base: BaseMessage,
    #[serde(rename = "event", default, skip_serializing_if = "String::is_empty")]
    name: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    data: Value,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    timestamp: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct PropertyMessage {
    #[serde(flatten)]
    base: BaseMessage,
    #[serde(rename = "property", default, skip_serializing_if = "String::is_empty")]
    name: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    data: Value,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    timestamp: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct ErrorMessage {
    #[serde(flatten)]
    base: BaseMessage,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    name: String,
    #[serde(default)]
    title: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    detail: String,
    #[serde(default)]
    status: ResponseStatus,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    timestamp: String,
}

/// Converter between envelopes and WoT-WSS messages.
#[derive(Debug, Clone, Copy, Default)]
pub struct WotWssConverter;

impl WotWssConverter {
    pub fn new() -> Self {
        Self
    }
}

fn parse<T: DeserializeOwned>(raw: &[u8]) -> Option<T> {
    match serde_json::from_slice(raw) {
        Ok(v) => Some(v),
        Err(e) => {
            log::warn!("wot-wss: unmarshalling message failed, ignored: {}", e);
            None
        }
    }
}

fn base_for(
    message_type: &str,
    operation: &str,
    thing_id: &str,
    message_id: &str,
    correlation_id: &str,
    sender_id: &str,
) -> BaseMessage {
    BaseMessage {
        correlation_id: correlation_id.to_string(),
        message_id: message_id.to_string(),
        message_type: message_type.to_string(),
        thing_id: thing_id.to_string(),
        operation: operation.to_string(),
        sender_id: sender_id.to_string(),
    }
}

fn or_now(ts: &str) -> String {
    if ts.is_empty() {
        now_rfc3339()
    } else {
        ts.to_string()
    }
}

impl MessageConverter for WotWssConverter {
    fn protocol_type(&self) -> ProtocolType {
        ProtocolType::WotWss
    }

    fn encode_request(&self, req: &RequestMessage) -> Result<Value, HubError> {
        let msg_type = request_msg_type(&req.operation).ok_or_else(|| {
            HubError::InvalidArgument(format!(
                "unknown operation for WoT WSS: {}",
                req.operation
            ))
        })?;
        let base = base_for(
            msg_type,
            &req.operation,
            &req.thing_id,
            &req.message_id,
            &req.correlation_id,
            &req.sender_id,
        );
        let timestamp = or_now(&req.created);
        let v = match req.operation.as_str() {
            OP_INVOKE_ACTION | OP_QUERY_ACTION | OP_QUERY_ALL_ACTIONS | OP_CANCEL_ACTION => {
                serde_json::to_value(ActionMessage {
                    base,
                    name: req.name.clone(),
                    input: req.input.clone(),
                    timestamp,
                })?
            }
            OP_SUBSCRIBE_EVENT
            | OP_SUBSCRIBE_ALL_EVENTS
            | OP_UNSUBSCRIBE_EVENT
            | OP_UNSUBSCRIBE_ALL_EVENTS => serde_json::to_value(EventMessage {
                base,
                name: req.name.clone(),
                data: req.input.clone(),
                timestamp,
            })?,
            OP_PING | OP_ERROR => serde_json::to_value(base)?,
            _ => serde_json::to_value(PropertyMessage {
                base,
                name: req.name.clone(),
                data: req.input.clone(),
                timestamp,
            })?,
        };
        Ok(v)
    }

    fn encode_response(&self, resp: &ResponseMessage) -> Result<Value, HubError> {
        if let Some(err) = &resp.error {
            let msg = ErrorMessage {
                base: base_for(
                    MSG_TYPE_ERROR,
                    &resp.operation,
                    &resp.thing_id,
                    &resp.message_id,
                    &resp.correlation_id,
                    &resp.sender_id,
                ),
                name: resp.name.clone(),
                title: err.title.clone(),
                detail: err.detail.clone(),
                status: ResponseStatus::Failed,
                timestamp: or_now(&resp.updated),
            };
            return Ok(serde_json::to_value(msg)?);
        }
        let msg_type = response_msg_type(&resp.operation).ok_or_else(|| {
            HubError::InvalidArgument(format!(
                "unknown response operation for WoT WSS: {}",
                resp.operation
            ))
        })?;
        let base = base_for(
            msg_type,
            &resp.operation,
            &resp.thing_id,
            &resp.message_id,
            &resp.correlation_id,
            &resp.sender_id,
        );
        let timestamp = or_now(&resp.updated);
        let v = match msg_type {
            MSG_TYPE_ACTION_STATUS | MSG_TYPE_ACTION_STATUSES => {
                let time_ended = if resp.status.is_final() {
                    timestamp.clone()
                } else {
                    String::new()
                };
                serde_json::to_value(ActionStatusMessage {
                    base,
                    name: resp.name.clone(),
                    status: resp.status,
                    error: None,
                    output: resp.output.clone(),
                    time_requested: resp.created.clone(),
                    time_ended,
                    timestamp,
                })?
            }
            MSG_TYPE_EVENT => serde_json::to_value(EventMessage {
                base,
                name: resp.name.clone(),
                data: resp.output.clone(),
                timestamp,
            })?,
            MSG_TYPE_PROPERTY_READING | MSG_TYPE_PROPERTY_READINGS => {
                serde_json::to_value(PropertyMessage {
                    base,
                    name: resp.name.clone(),
                    data: resp.output.clone(),
                    timestamp,
                })?
            }
            _ => serde_json::to_value(base)?,
        };
        Ok(v)
    }

    fn encode_notification(&self, notif: &NotificationMessage) -> Result<Value, HubError> {
        let msg_type = match notif.operation.as_str() {
            OP_SUBSCRIBE_EVENT | OP_SUBSCRIBE_ALL_EVENTS => MSG_TYPE_EVENT,
            OP_OBSERVE_PROPERTY => MSG_TYPE_PROPERTY_READING,
            OP_OBSERVE_ALL_PROPERTIES => MSG_TYPE_PROPERTY_READINGS,
            OP_INVOKE_ACTION => MSG_TYPE_ACTION_STATUS,
            other => {
                return Err(HubError::InvalidArgument(format!(
                    "unknown notification operation for WoT WSS: {}",
                    other
                )))
            }
        };
        // notifications never carry a correlation ID on this protocol
        let base = base_for(
            msg_type,
            &notif.operation,
            &notif.thing_id,
            &notif.message_id,
            "",
            &notif.sender_id,
        );
        let timestamp = or_now(&notif.created);
        let v = match msg_type {
            MSG_TYPE_EVENT => serde_json::to_value(EventMessage {
                base,
                name: notif.name.clone(),
                data: notif.data.clone(),
                timestamp,
            })?,
            MSG_TYPE_ACTION_STATUS => {
                let status: Option<ActionStatus> = serde_json::from_value(notif.data.clone()).ok();
                let msg = match status {
                    Some(st) => ActionStatusMessage {
                        base,
                        name: notif.name.clone(),
                        status: st.status,
                        error: st.error,
                        output: st.output,
                        time_requested: st.requested,
                        time_ended: String::new(),
                        timestamp,
                    },
                    None => ActionStatusMessage {
                        base,
                        name: notif.name.clone(),
                        status: ResponseStatus::Running,
                        error: None,
                        output: notif.data.clone(),
                        time_requested: String::new(),
                        time_ended: String::new(),
                        timestamp,
                    },
                };
                serde_json::to_value(msg)?
            }
            _ => serde_json::to_value(PropertyMessage {
                base,
                name: notif.name.clone(),
                data: notif.data.clone(),
                timestamp,
            })?,
        };
        Ok(v)
    }

    fn decode_request(&self, raw: &[u8]) -> Option<RequestMessage> {
        let base: BaseMessage = parse(raw)?;
        let op = base.resolved_op();
        let (name, input, timestamp) = match base.message_type.as_str() {
            MSG_TYPE_INVOKE_ACTION
            | MSG_TYPE_QUERY_ACTION
            | MSG_TYPE_QUERY_ALL_ACTIONS
            | MSG_TYPE_CANCEL_ACTION => {
                let m: ActionMessage = parse(raw)?;
                (m.name, m.input, m.timestamp)
            }
            MSG_TYPE_SUBSCRIBE_EVENT
            | MSG_TYPE_SUBSCRIBE_ALL_EVENTS
            | MSG_TYPE_UNSUBSCRIBE_EVENT
            | MSG_TYPE_UNSUBSCRIBE_ALL_EVENTS => {
                let m: EventMessage = parse(raw)?;
                (m.name, m.data, m.timestamp)
            }
            MSG_TYPE_READ_ALL_PROPERTIES
            | MSG_TYPE_READ_PROPERTY
            | MSG_TYPE_WRITE_PROPERTY
            | MSG_TYPE_OBSERVE_PROPERTY
            | MSG_TYPE_OBSERVE_ALL_PROPERTIES
            | MSG_TYPE_UNOBSERVE_PROPERTY
            | MSG_TYPE_UNOBSERVE_ALL_PROPERTIES => {
                let m: PropertyMessage = parse(raw)?;
                (m.name, m.data, m.timestamp)
            }
            MSG_TYPE_PING => (String::new(), Value::Null, String::new()),
            _ => return None,
        };
        let mut req = RequestMessage::new(&op, &base.thing_id, &name, input, &base.correlation_id);
        req.message_id = base.message_id;
        req.sender_id = base.sender_id;
        req.created = timestamp;
        Some(req)
    }

    fn decode_response(&self, raw: &[u8]) -> Option<ResponseMessage> {
        let base: BaseMessage = parse(raw)?;
        if is_notification_type(&base.message_type) && base.correlation_id.is_empty() {
            return None;
        }
        let op = base.resolved_op();
        let mut resp = ResponseMessage::new(
            &op,
            &base.thing_id,
            "",
            Value::Null,
            None,
            &base.correlation_id,
        );
        resp.message_id = base.message_id.clone();
        resp.sender_id = base.sender_id.clone();
        match base.message_type.as_str() {
            MSG_TYPE_ACK => {}
            MSG_TYPE_PONG => resp.output = Value::from(PONG),
            MSG_TYPE_ACTION_STATUS | MSG_TYPE_ACTION_STATUSES => {
                let m: ActionStatusMessage = parse(raw)?;
                resp.name = m.name;
                resp.output = m.output;
                resp.status = m.status;
                if let Some(e) = m.error {
                    resp.error = Some(e);
                    resp.status = ResponseStatus::Failed;
                }
                if !m.time_requested.is_empty() {
                    resp.created = m.time_requested;
                }
                resp.updated = if m.time_ended.is_empty() {
                    m.timestamp
                } else {
                    m.time_ended
                };
            }
            MSG_TYPE_EVENT => {
                let m: EventMessage = parse(raw)?;
                resp.name = m.name;
                resp.output = m.data;
                resp.updated = m.timestamp;
            }
            MSG_TYPE_PROPERTY_READING | MSG_TYPE_PROPERTY_READINGS => {
                let m: PropertyMessage = parse(raw)?;
                resp.name = m.name;
                resp.output = m.data;
                resp.updated = m.timestamp;
            }
            MSG_TYPE_ERROR => {
                let m: ErrorMessage = parse(raw)?;
                resp.name = m.name;
                resp.status = ResponseStatus::Failed;
                resp.error = Some(ErrorValue {
                    title: m.title,
                    detail: m.detail,
                });
                resp.updated = m.timestamp;
            }
            _ => return None,
        }
        Some(resp)
    }

    fn decode_notification(&self, raw: &[u8]) -> Option<NotificationMessage> {
        let base: BaseMessage = parse(raw)?;
        if !is_notification_type(&base.message_type) || !base.correlation_id.is_empty() {
            return None;
        }
        let op = if !base.operation.is_empty() {
            base.operation.clone()
        } else {
            match base.message_type.as_str() {
                MSG_TYPE_ACTION_STATUS => OP_INVOKE_ACTION.to_string(),
                other => msg_type_to_op(other).unwrap_or_default().to_string(),
            }
        };
        let (name, data, timestamp) = match base.message_type.as_str() {
            MSG_TYPE_EVENT => {
                let m: EventMessage = parse(raw)?;
                (m.name, m.data, m.timestamp)
            }
            MSG_TYPE_ACTION_STATUS => {
                let m: ActionStatusMessage = parse(raw)?;
                let status = ActionStatus {
                    agent_id: String::new(),
                    id: String::new(),
                    thing_id: base.thing_id.clone(),
                    name: m.name.clone(),
                    input: Value::Null,
                    output: m.output,
                    status: m.status,
                    error: m.error,
                    sender_id: base.sender_id.clone(),
                    requested: m.time_requested,
                    updated: m.timestamp.clone(),
                };
                (m.name, serde_json::to_value(status).ok()?, m.timestamp)
            }
            _ => {
                let m: PropertyMessage = parse(raw)?;
                (m.name, m.data, m.timestamp)
            }
        };
        let mut notif = NotificationMessage::new(&op, &base.thing_id, &name, data);
        notif.message_id = base.message_id;
        notif.sender_id = base.sender_id;
        if !timestamp.is_empty() {
            notif.created = timestamp;
        }
        Some(notif)
    }
}
