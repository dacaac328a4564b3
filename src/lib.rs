//! # pubsub-relay
//!
//! `pubsub_relay` is an in-memory, topic-based publish/subscribe relay that
//! speaks WebSockets. Subscribers connect to `/subscribe?topic=…` and receive
//! every message published on their topics; publishers connect to
//! `/publish?topic=…` once that topic exists and stream envelopes into it.
//! Delivery is best-effort: a subscriber that cannot keep up loses messages
//! rather than slowing anybody else down.
//!
//! ## Core Modules
//!
//! - `broker`: the topic registry, the per-topic fan-out actors and the wire envelope.
//! - `client`: WebSocket publisher and subscriber clients for a running relay.
//! - `config`: layered configuration loading (defaults, file, environment).
//! - `transport`: the WebSocket server and per-connection read/write loops.
//! - `utils`: the crate error type and logging setup.

pub mod broker;
pub mod client;
pub mod config;
pub mod transport;
pub mod utils;
