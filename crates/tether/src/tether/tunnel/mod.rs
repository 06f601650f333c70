//! Reverse tunnel: one authenticated control link carries the traffic of many external peers,
//! each tagged with an identity, between the public server and the client next to the service.

pub mod client;
pub mod link;
pub mod peer;
pub mod pipe;
pub mod protocol;
pub mod routes;
pub mod server;
pub mod transport;

#[cfg(test)]
mod tests;
