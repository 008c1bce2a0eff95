//! Hub messaging core: message envelopes and converters, protocol-agnostic connections,
//! the HTTP/SSE/websocket transport servers, authentication, authorization and the router
//! that joins consumers to agents. Used by the `hubd` CLI and by the integration tests.

pub mod authn;
pub mod authz;
pub mod clients;
pub mod config;
pub mod connections;
pub mod error;
pub mod init;
pub mod messaging;
pub mod router;
pub mod servers;
