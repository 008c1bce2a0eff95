//! Message converter contract and the native HiveOT converter.

use crate::error::HubError;
use crate::messaging::envelope::{NotificationMessage, RequestMessage, ResponseMessage};
use crate::messaging::vocab::{
    ProtocolType, MESSAGE_TYPE_NOTIFICATION, MESSAGE_TYPE_REQUEST, MESSAGE_TYPE_RESPONSE,
};
use serde_json::Value;

/// Translates between the envelope model and a wire JSON format.
///
/// Encoding produces a JSON value ready to serialize. Decoding returns `None` when the raw
/// message is not of the requested kind, so a receiver can try each kind in turn.
pub trait MessageConverter: Send + Sync {
    fn protocol_type(&self) -> ProtocolType;

    fn encode_request(&self, req: &RequestMessage) -> Result<Value, HubError>;
    fn encode_response(&self, resp: &ResponseMessage) -> Result<Value, HubError>;
    fn encode_notification(&self, notif: &NotificationMessage) -> Result<Value, HubError>;

    fn decode_request(&self, raw: &[u8]) -> Option<RequestMessage>;
    fn decode_response(&self, raw: &[u8]) -> Option<ResponseMessage>;
    fn decode_notification(&self, raw: &[u8]) -> Option<NotificationMessage>;
}

/// Identity mapping: envelopes are the wire format, `messageType` discriminates.
#[derive(Debug, Clone, Copy, Default)]
pub struct HiveotConverter {
    protocol: Option<ProtocolType>,
}

impl HiveotConverter {
    /// Converter for the HiveOT websocket protocol.
    pub fn new() -> Self {
        Self { protocol: None }
    }

    /// Same format reported under a different protocol type (e.g. SSE).
    pub fn for_protocol(protocol: ProtocolType) -> Self {
        Self {
            protocol: Some(protocol),
        }
    }
}

fn message_type_of(raw: &[u8]) -> Option<String> {
    let v: Value = serde_json::from_slice(raw).ok()?;
    v.get("messageType")?.as_str().map(str::to_string)
}

impl MessageConverter for HiveotConverter {
    fn protocol_type(&self) -> ProtocolType {
        self.protocol.unwrap_or(ProtocolType::HiveotWss)
    }

    fn encode_request(&self, req: &RequestMessage) -> Result<Value, HubError> {
        let mut v = serde_json::to_value(req)?;
        v["messageType"] = Value::from(MESSAGE_TYPE_REQUEST);
        Ok(v)
    }

    fn encode_response(&self, resp: &ResponseMessage) -> Result<Value, HubError> {
        let mut v = serde_json::to_value(resp)?;
        v["messageType"] = Value::from(MESSAGE_TYPE_RESPONSE);
        Ok(v)
    }

    fn encode_notification(&self, notif: &NotificationMessage) -> Result<Value, HubError> {
        let mut v = serde_json::to_value(notif)?;
        v["messageType"] = Value::from(MESSAGE_TYPE_NOTIFICATION);
        Ok(v)
    }

    fn decode_request(&self, raw: &[u8]) -> Option<RequestMessage> {
        if message_type_of(raw)? != MESSAGE_TYPE_REQUEST {
            return None;
        }
        serde_json::from_slice(raw).ok()
    }

    fn decode_response(&self, raw: &[u8]) -> Option<ResponseMessage> {
        if message_type_of(raw)? != MESSAGE_TYPE_RESPONSE {
            return None;
        }
        serde_json::from_slice(raw).ok()
    }

    fn decode_notification(&self, raw: &[u8]) -> Option<NotificationMessage> {
        if message_type_of(raw)? != MESSAGE_TYPE_NOTIFICATION {
            return None;
        }
        serde_json::from_slice(raw).ok()
    }
}
