//! Message envelopes and wire converters.

mod converter;
mod envelope;
pub mod vocab;
pub mod wotwss;

pub use converter::{HiveotConverter, MessageConverter};
pub use envelope::{
    new_id, now_rfc3339, ActionStatus, ErrorValue, NotificationMessage, RequestMessage,
    ResponseMessage, ResponseStatus,
};
pub use vocab::ProtocolType;
pub use wotwss::WotWssConverter;
