//! The `transport` module is responsible for network communication with
//! clients over WebSockets.
//!
//! `connection` wraps a single upgraded socket in independent read and write
//! loops; `websocket` runs the server, routes upgrade requests to the publish
//! or subscribe role, and wires connections to the broker.

pub mod connection;
pub mod websocket;

pub use connection::{Connection, ConnectionHandle, ConnectionId};
pub use websocket::{serve, start_websocket_server};

#[cfg(test)]
mod tests;
