//! Multiplexed PTY-over-WebSocket tunnel.
//!
//! A producer process spawns a child under a PTY and streams its output to a
//! routing daemon (the bus); any number of subscribers attach to the same
//! session to observe and drive the terminal concurrently. Child output
//! produced before a controller signals READY is buffered so that even
//! short-lived commands lose nothing.

pub mod buffering;
pub mod bus;
pub mod config;
pub mod modes;
pub mod protocol;
pub mod server;
pub mod term;
pub mod transport;
