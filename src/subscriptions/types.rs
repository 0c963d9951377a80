//! Subscription types for topic feeds.

use crate::types::Topic;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for topic subscriptions.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscriptionConfig {
    /// How long a topic stays open after its last consumer detaches.
    /// Default: 2s
    pub grace_period: Duration,

    /// Max buffered feed signals before the provider's pushes are dropped.
    /// Default: 1024
    pub feed_buffer: usize,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(2),
            feed_buffer: 1024,
        }
    }
}

/// Opaque token held by one attached consumer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AttachToken(pub u64);

/// Point-in-time view of one topic subscription.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicSummary {
    pub topic: Topic,
    pub ref_count: usize,
    /// True while waiting out the grace period.
    pub closing: bool,
    /// Change events delivered so far.
    pub delivered: u64,
}
