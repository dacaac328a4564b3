//! The broker: the topic registry, the per-topic fan-out actors, and the
//! envelope exchanged with clients.
//!
//! Public types:
//! - `Broker`: topic registry and publish/subscribe entry points.
//! - `Topic`: handle to one topic's task.
//! - `Envelope` / `Action`: the wire message.

pub mod engine;
pub mod message;
pub mod topic;

pub use engine::Broker;
pub use message::{Action, Envelope};
pub use topic::Topic;
