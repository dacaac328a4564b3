//! Topic management
//!
//! Each topic is an actor: one task owns the subscriber set and handles
//! register, unregister and broadcast events strictly in arrival order, so
//! no lock guards the set. The rest of the relay talks to it through the
//! cloneable [`Topic`] handle.
//!
//! Backpressure: a broadcast never waits on a subscriber. If a subscriber's
//! mailbox is full the message is dropped for that subscriber only and the
//! others still get it. Subscribers whose mailbox is closed are forgotten.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::transport::connection::{ConnectionHandle, ConnectionId};
use crate::utils::{RelayError, Result};

pub type SubscriberId = ConnectionId;

#[derive(Debug)]
enum TopicEvent {
    Register(ConnectionHandle),
    Unregister(SubscriberId),
    Broadcast(Bytes),
    SubscriberCount(oneshot::Sender<usize>),
}

/// Handle to a running topic.
#[derive(Debug, Clone)]
pub struct Topic {
    name: Arc<str>,
    events: mpsc::Sender<TopicEvent>,
}

impl Topic {
    /// Start the topic task. Must be called from within a tokio runtime.
    ///
    /// The task runs until every handle is dropped, which for topics held by
    /// the broker means for the life of the broker.
    pub fn spawn(name: &str, queue_capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(queue_capacity.max(1));
        let state = TopicState::new(name);
        tokio::spawn(state.run(rx));
        Self {
            name: Arc::from(name),
            events: tx,
        }
    }

    /// A handle whose task has already stopped.
    #[cfg(test)]
    pub(crate) fn stopped(name: &str) -> Self {
        let (tx, _) = mpsc::channel(1);
        Self {
            name: Arc::from(name),
            events: tx,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn register(&self, subscriber: ConnectionHandle) -> Result<()> {
        self.send(TopicEvent::Register(subscriber)).await
    }

    pub async fn unregister(&self, id: SubscriberId) -> Result<()> {
        self.send(TopicEvent::Unregister(id)).await
    }

    /// Queue `bytes` for every subscriber registered when the event is processed.
    pub async fn broadcast(&self, bytes: Bytes) -> Result<()> {
        self.send(TopicEvent::Broadcast(bytes)).await
    }

    /// Number of subscribers once every previously queued event has been handled.
    pub async fn subscriber_count(&self) -> Result<usize> {
        let (tx, rx) = oneshot::channel();
        self.send(TopicEvent::SubscriberCount(tx)).await?;
        rx.await.map_err(|_| self.closed())
    }

    async fn send(&self, event: TopicEvent) -> Result<()> {
        self.events.send(event).await.map_err(|_| self.closed())
    }

    fn closed(&self) -> RelayError {
        RelayError::TopicClosed(self.name.to_string())
    }
}

/// State owned by the topic task.
#[derive(Debug)]
pub(crate) struct TopicState {
    pub(crate) name: String,
    pub(crate) subscribers: HashMap<SubscriberId, ConnectionHandle>,
}

impl TopicState {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            subscribers: HashMap::new(),
        }
    }

    async fn run(mut self, mut events: mpsc::Receiver<TopicEvent>) {
        debug!(topic = %self.name, "topic started");
        while let Some(event) = events.recv().await {
            match event {
                TopicEvent::Register(subscriber) => self.subscribe(subscriber),
                TopicEvent::Unregister(id) => self.unsubscribe(&id),
                TopicEvent::Broadcast(bytes) => self.deliver(bytes),
                TopicEvent::SubscriberCount(reply) => {
                    let _ = reply.send(self.subscribers.len());
                }
            }
        }
        debug!(topic = %self.name, "topic stopped");
    }

    /// Add a subscriber. Registering the same connection twice keeps one entry.
    pub(crate) fn subscribe(&mut self, subscriber: ConnectionHandle) {
        debug!(topic = %self.name, connection = %subscriber.id(), "subscriber registered");
        self.subscribers.insert(subscriber.id(), subscriber);
    }

    pub(crate) fn unsubscribe(&mut self, id: &SubscriberId) {
        if self.subscribers.remove(id).is_some() {
            debug!(topic = %self.name, connection = %id, "subscriber unregistered");
        }
    }

    /// Hand `bytes` to every subscriber without blocking on any of them.
    pub(crate) fn deliver(&mut self, bytes: Bytes) {
        let name = &self.name;
        self.subscribers
            .retain(|id, subscriber| match subscriber.try_deliver(bytes.clone()) {
                Ok(()) => true,
                Err(err @ RelayError::SlowConsumer(_)) => {
                    warn!(
                        topic = %name,
                        connection = %id,
                        error = %err,
                        "dropping message for slow subscriber"
                    );
                    true
                }
                Err(err) => {
                    debug!(
                        topic = %name,
                        connection = %id,
                        error = %err,
                        "removing departed subscriber"
                    );
                    false
                }
            });
    }
}
