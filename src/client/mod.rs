//! The `client` module talks to a running relay from the outside.
//!
//! It provides `Publisher` and `Subscriber`, thin wrappers over a WebSocket
//! connection to the publish and subscribe endpoints. The CLI uses them for
//! its `publish` / `subscribe` commands and the end-to-end tests drive the
//! server through them.

pub mod pubsub_client;

pub use pubsub_client::{Publisher, Subscriber, endpoint_url};
