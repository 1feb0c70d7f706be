//! Reverse-tunnel client.
//!
//! One TCP connection to the tunnel server is upgraded with an HTTP `CONNECT` and then
//! multiplexed with yamux. The first stream carries control messages; every
//! later stream is bridged to a local backend on request.

pub mod bridge;
pub mod client;
pub mod control;
pub mod error;
pub mod handshake;
pub mod mux;
pub mod proxy;
pub mod wait;
