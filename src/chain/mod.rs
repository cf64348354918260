//! Authoritative ledger reached through an HTTP gateway in front of the
//! prediction contract.
mod authority;
mod client;

pub use authority::GatewayAuthority;
