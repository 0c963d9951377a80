//! Subscription manager: one change feed per topic, shared by refcount.

use crate::collab::PushCollaborator;
use crate::feed::{ChangeFeedClient, FeedSignal};
use crate::types::Topic;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

use super::types::{AttachToken, SubscriptionConfig, TopicSummary};

/// Internal subscription state.
struct TopicSubscription {
    ref_count: usize,
    client: ChangeFeedClient,
    /// Set while the refcount is zero; the feed closes at this instant.
    close_at: Option<Instant>,
}

/// Owns every open change feed.
///
/// All methods take `&mut self`, so attach and detach on a topic are
/// linearized by construction.
pub struct SubscriptionManager {
    push: Arc<dyn PushCollaborator>,
    config: SubscriptionConfig,
    /// Active subscriptions by topic.
    topics: HashMap<Topic, TopicSubscription>,
    /// Which topic each live token is attached to.
    tokens: HashMap<AttachToken, Topic>,
    /// Counter for generating tokens.
    next_token: u64,
}

impl SubscriptionManager {
    /// Create a new subscription manager.
    pub fn new(push: Arc<dyn PushCollaborator>, config: SubscriptionConfig) -> Self {
        Self {
            push,
            config,
            topics: HashMap::new(),
            tokens: HashMap::new(),
            next_token: 1,
        }
    }

    /// Attach a consumer to `topic`.
    ///
    /// Opens the feed on first attach; re-attaching during the grace period
    /// reuses the feed that was about to close.
    pub fn attach(&mut self, topic: Topic) -> AttachToken {
        let token = AttachToken(self.next_token);
        self.next_token += 1;

        match self.topics.get_mut(&topic) {
            Some(sub) => {
                sub.ref_count += 1;
                if sub.close_at.take().is_some() {
                    debug!(topic = %topic, "Pending close cancelled");
                }
            }
            None => {
                let client =
                    ChangeFeedClient::open(self.push.as_ref(), topic.clone(), self.config.feed_buffer);
                info!(topic = %topic, "Topic subscription opened");
                self.topics.insert(
                    topic.clone(),
                    TopicSubscription {
                        ref_count: 1,
                        client,
                        close_at: None,
                    },
                );
            }
        }

        self.tokens.insert(token, topic);
        token
    }

    /// Detach a consumer. Unknown or already-detached tokens are ignored.
    ///
    /// Returns the topic if this was its last consumer.
    pub fn detach(&mut self, token: AttachToken, now: Instant) -> Option<Topic> {
        let topic = self.tokens.remove(&token)?;
        let sub = self.topics.get_mut(&topic)?;

        sub.ref_count = sub.ref_count.saturating_sub(1);
        if sub.ref_count > 0 {
            return None;
        }

        sub.close_at = Some(now + self.config.grace_period);
        debug!(topic = %topic, grace = ?self.config.grace_period, "Last consumer detached");
        Some(topic)
    }

    /// Close every feed whose grace period has elapsed.
    pub fn expire(&mut self, now: Instant) -> Vec<Topic> {
        let due: Vec<Topic> = self
            .topics
            .iter()
            .filter(|(_, sub)| sub.close_at.is_some_and(|at| at <= now))
            .map(|(topic, _)| topic.clone())
            .collect();

        for topic in &due {
            if let Some(mut sub) = self.topics.remove(topic) {
                sub.client.close();
                info!(topic = %topic, "Topic subscription closed");
            }
        }
        due
    }

    /// Drain every ready signal of every open feed.
    pub fn poll(&mut self) -> Vec<(Topic, FeedSignal)> {
        let mut signals = Vec::new();
        for (topic, sub) in self.topics.iter_mut() {
            for signal in sub.client.feed_mut().ready() {
                signals.push((topic.clone(), signal));
            }
        }
        signals
    }

    /// Close every feed immediately.
    pub fn close_all(&mut self) -> Vec<Topic> {
        self.tokens.clear();
        let topics: Vec<Topic> = self.topics.keys().cloned().collect();
        for (_, mut sub) in self.topics.drain() {
            sub.client.close();
        }
        topics
    }

    /// Number of consumers attached to `topic`.
    pub fn ref_count(&self, topic: &Topic) -> usize {
        self.topics.get(topic).map_or(0, |sub| sub.ref_count)
    }

    /// True while a feed for `topic` is open (including its grace period).
    pub fn is_open(&self, topic: &Topic) -> bool {
        self.topics.contains_key(topic)
    }

    /// The topic a token is attached to.
    pub fn topic_of(&self, token: AttachToken) -> Option<&Topic> {
        self.tokens.get(&token)
    }

    pub fn open_topics(&self) -> Vec<Topic> {
        let mut topics: Vec<Topic> = self.topics.keys().cloned().collect();
        topics.sort();
        topics
    }

    /// Get subscription count.
    pub fn subscription_count(&self) -> usize {
        self.topics.len()
    }

    pub fn summaries(&self) -> Vec<TopicSummary> {
        let mut summaries: Vec<TopicSummary> = self
            .topics
            .iter()
            .map(|(topic, sub)| TopicSummary {
                topic: topic.clone(),
                ref_count: sub.ref_count,
                closing: sub.close_at.is_some(),
                delivered: sub.client.feed().delivered(),
            })
            .collect();
        summaries.sort_by(|a, b| a.topic.cmp(&b.topic));
        summaries
    }
}

impl Drop for SubscriptionManager {
    fn drop(&mut self) {
        self.close_all();
    }
}
