//! Broker engine
//!
//! The broker owns the topic registry: a map from topic name to the handle
//! of that topic's task. It is built once at startup and shared with the
//! endpoint handlers as `Arc<Broker>`.
//!
//! Concurrency notes:
//! - The registry sits behind a `std::sync::RwLock`. Lookups take the read
//!   lock; creation takes the write lock, so two subscribers racing to create
//!   the same topic always end up with the same instance.
//! - No lock is held across an `.await`; topic handles are cloned out first.
//! - Topics are never removed. The registry only grows with the number of
//!   distinct names ever subscribed to.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use tracing::{debug, info};

use crate::broker::message::{Action, Envelope};
use crate::broker::topic::Topic;
use crate::config::BrokerSettings;
use crate::transport::connection::ConnectionHandle;
use crate::utils::{RelayError, Result};

#[derive(Debug)]
pub struct Broker {
    topics: RwLock<HashMap<String, Topic>>,
    topic_queue_capacity: usize,
}

impl Default for Broker {
    fn default() -> Self {
        Self::new(&BrokerSettings::default())
    }
}

impl Broker {
    pub fn new(settings: &BrokerSettings) -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
            topic_queue_capacity: settings.topic_queue_capacity,
        }
    }

    /// Look up an existing topic.
    pub fn topic(&self, name: &str) -> Option<Topic> {
        self.topics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Like [`Broker::topic`], failing with `UnknownTopic` when absent.
    pub fn resolve_topic(&self, name: &str) -> Result<Topic> {
        self.topic(name)
            .ok_or_else(|| RelayError::UnknownTopic(name.to_string()))
    }

    /// Return the topic called `name`, starting it if this is the first reference.
    pub fn get_or_create_topic(&self, name: &str) -> Topic {
        if let Some(topic) = self.topic(name) {
            return topic;
        }

        let mut topics = self.topics.write().unwrap_or_else(PoisonError::into_inner);
        topics
            .entry(name.to_string())
            .or_insert_with(|| {
                info!(topic = %name, "topic created");
                Topic::spawn(name, self.topic_queue_capacity)
            })
            .clone()
    }

    /// Names of every topic created so far, sorted.
    pub fn topic_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .topics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Route a publish envelope to its topic.
    ///
    /// Only `publish` envelopes are accepted, and only for topics that already
    /// exist. The envelope is re-encoded so subscribers always receive the
    /// canonical form.
    pub async fn publish(&self, envelope: &Envelope) -> Result<()> {
        envelope.expect_action(Action::Publish)?;
        let topic = self.resolve_topic(&envelope.topic)?;
        let bytes = envelope.encode()?;
        topic.broadcast(bytes).await
    }

    /// Register `subscriber` on each named topic, creating topics as needed.
    ///
    /// Blank names are skipped. Returns the topics the subscriber joined.
    pub async fn subscribe<I, S>(
        &self,
        subscriber: &ConnectionHandle,
        names: I,
    ) -> Result<Vec<Topic>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut joined = Vec::new();
        for name in names {
            if let Some(topic) = self.join(subscriber, name.as_ref()).await? {
                joined.push(topic);
            }
        }
        Ok(joined)
    }

    /// Like [`Broker::subscribe`], recording each joined topic in `joined` by name.
    ///
    /// On failure `joined` still holds every topic registered before the
    /// failing one, so the caller can unregister from them.
    pub async fn subscribe_into<I, S>(
        &self,
        subscriber: &ConnectionHandle,
        names: I,
        joined: &mut HashMap<String, Topic>,
    ) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for name in names {
            if let Some(topic) = self.join(subscriber, name.as_ref()).await? {
                joined.insert(topic.name().to_string(), topic);
            }
        }
        Ok(())
    }

    async fn join(&self, subscriber: &ConnectionHandle, name: &str) -> Result<Option<Topic>> {
        if name.trim().is_empty() {
            return Ok(None);
        }
        let topic = self.get_or_create_topic(name);
        topic.register(subscriber.clone()).await?;
        debug!(topic = %name, connection = %subscriber.id(), "subscribed");
        Ok(Some(topic))
    }

    #[cfg(test)]
    pub(crate) fn insert_topic(&self, topic: Topic) {
        self.topics
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(topic.name().to_string(), topic);
    }
}
