//! Operation, message-type and protocol vocabulary shared by every transport.

use serde::{Deserialize, Serialize};
use std::fmt;

pub const MESSAGE_TYPE_REQUEST: &str = "request";
pub const MESSAGE_TYPE_RESPONSE: &str = "response";
pub const MESSAGE_TYPE_NOTIFICATION: &str = "notification";

// WoT operations
pub const OP_CANCEL_ACTION: &str = "cancelAction";
pub const OP_INVOKE_ACTION: &str = "invokeAction";
pub const OP_OBSERVE_ALL_PROPERTIES: &str = "observeAllProperties";
pub const OP_OBSERVE_PROPERTY: &str = "observeProperty";
pub const OP_QUERY_ACTION: &str = "queryAction";
pub const OP_QUERY_ALL_ACTIONS: &str = "queryAllActions";
pub const OP_READ_ALL_PROPERTIES: &str = "readAllProperties";
pub const OP_READ_PROPERTY: &str = "readProperty";
pub const OP_SUBSCRIBE_ALL_EVENTS: &str = "subscribeAllEvents";
pub const OP_SUBSCRIBE_EVENT: &str = "subscribeEvent";
pub const OP_UNOBSERVE_ALL_PROPERTIES: &str = "unobserveAllProperties";
pub const OP_UNOBSERVE_PROPERTY: &str = "unobserveProperty";
pub const OP_UNSUBSCRIBE_ALL_EVENTS: &str = "unsubscribeAllEvents";
pub const OP_UNSUBSCRIBE_EVENT: &str = "unsubscribeEvent";
pub const OP_WRITE_PROPERTY: &str = "writeProperty";

// hub extensions
pub const OP_PING: &str = "ping";
pub const OP_ERROR: &str = "error";
pub const OP_LOGIN: &str = "login";
pub const OP_LOGOUT: &str = "logout";
pub const OP_REFRESH: &str = "refresh";

/// Output of a ping request.
pub const PONG: &str = "pong";

/// Subscription-set operations handled by the connection itself.
pub fn is_subscribe_op(op: &str) -> bool {
    op == OP_SUBSCRIBE_EVENT || op == OP_SUBSCRIBE_ALL_EVENTS
}

pub fn is_unsubscribe_op(op: &str) -> bool {
    op == OP_UNSUBSCRIBE_EVENT || op == OP_UNSUBSCRIBE_ALL_EVENTS
}

pub fn is_observe_op(op: &str) -> bool {
    op == OP_OBSERVE_PROPERTY || op == OP_OBSERVE_ALL_PROPERTIES
}

pub fn is_unobserve_op(op: &str) -> bool {
    op == OP_UNOBSERVE_PROPERTY || op == OP_UNOBSERVE_ALL_PROPERTIES
}

/// Wire protocol a connection speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProtocolType {
    HttpBasic,
    HiveotSse,
    HiveotWss,
    WotWss,
}

impl ProtocolType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProtocolType::HttpBasic => "http-basic",
            ProtocolType::HiveotSse => "hiveot-sse",
            ProtocolType::HiveotWss => "hiveot-wss",
            ProtocolType::WotWss => "wot-wss",
        }
    }

    /// Preference rank when several protocols are enabled; higher wins.
    pub fn preference(&self) -> u8 {
        match self {
            ProtocolType::HttpBasic => 1,
            ProtocolType::HiveotSse => 2,
            ProtocolType::HiveotWss | ProtocolType::WotWss => 3,
        }
    }
}

impl fmt::Display for ProtocolType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wss_is_preferred_over_sse_over_http() {
        assert!(ProtocolType::WotWss.preference() > ProtocolType::HiveotSse.preference());
        assert!(ProtocolType::HiveotSse.preference() > ProtocolType::HttpBasic.preference());
    }

    #[test]
    fn protocol_type_serializes_kebab_case() {
        let s = serde_json::to_string(&ProtocolType::HiveotSse).unwrap();
        assert_eq!(s, "\"hiveot-sse\"");
        assert_eq!(ProtocolType::WotWss.to_string(), "wot-wss");
    }
}
