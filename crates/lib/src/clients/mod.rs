//! Client side of the hub protocols.
//!
//! [`WssClient`] and [`HiveotSseClient`] implement [`crate::connections::Connection`] from the
//! client end and reconnect on their own. [`Consumer`] and [`Agent`] add the request/response
//! roles on top of any such connection. [`HttpClient`] covers the connectionless routes.

mod agent;
mod consumer;
mod correlator;
mod http;
mod sse;
mod state;
mod wss;

pub use agent::Agent;
pub use consumer::Consumer;
pub use correlator::{Delivery, RpcCorrelator};
pub use http::HttpClient;
pub use sse::HiveotSseClient;
pub use state::RECONNECT_INTERVAL;
pub use wss::WssClient;
