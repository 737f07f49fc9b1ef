//! Remote API access: transport, policies and configured connections.

pub mod connection;
pub mod http;
pub mod policy;
