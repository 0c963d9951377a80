//! Push subscription wrapper and its event stream.

use crate::collab::{PushCollaborator, Unsubscribe};
use crate::types::{ChangeEvent, Topic};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Link state reported by the provider.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Connectivity {
    Connected,
    Disconnected,
}

/// Normalized item of a change feed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedSignal {
    Event(ChangeEvent),
    Connectivity(Connectivity),
    /// This many signals were dropped on a full buffer since the last
    /// report. Raised by the feed itself once its buffer has drained.
    Lagged(u64),
}

#[derive(Debug, Default)]
struct FeedCounters {
    closed: AtomicBool,
    delivered: AtomicU64,
    overflowed: AtomicU64,
}

/// Handle the provider pushes into.
///
/// Cheap to clone. Sends after the feed is closed are discarded.
#[derive(Clone, Debug)]
pub struct EventSink {
    topic: Topic,
    tx: Sender<FeedSignal>,
    counters: Arc<FeedCounters>,
}

impl EventSink {
    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    /// Push a change. Returns false if it was not accepted.
    ///
    /// A full buffer drops the event; the feed then yields
    /// [`FeedSignal::Lagged`] after its buffered signals.
    pub fn send(&self, event: ChangeEvent) -> bool {
        if event.topic != self.topic {
            warn!(topic = %self.topic, event_topic = %event.topic, "Event for foreign topic discarded");
            return false;
        }
        self.push(FeedSignal::Event(event))
    }

    /// Report a link state change.
    pub fn connectivity(&self, state: Connectivity) -> bool {
        self.push(FeedSignal::Connectivity(state))
    }

    pub fn is_closed(&self) -> bool {
        self.counters.closed.load(Ordering::Acquire)
    }

    fn push(&self, signal: FeedSignal) -> bool {
        if self.is_closed() {
            return false;
        }
        match self.tx.try_send(signal) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.counters.overflowed.fetch_add(1, Ordering::Relaxed);
                warn!(topic = %self.topic, "Change feed buffer full, signal dropped");
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }
}

/// Lazy, non-restartable stream of feed signals for one topic.
#[derive(Debug)]
pub struct ChangeFeed {
    topic: Topic,
    rx: Receiver<FeedSignal>,
    counters: Arc<FeedCounters>,
    /// Overflow count already reported as `Lagged`.
    reported_overflow: u64,
}

impl ChangeFeed {
    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    /// Next signal if one is ready.
    pub fn try_next(&mut self) -> Option<FeedSignal> {
        if self.is_closed() {
            return None;
        }
        match self.rx.try_recv() {
            Ok(signal) => {
                self.count(&signal);
                Some(signal)
            }
            Err(_) => self.take_lag(),
        }
    }

    /// Wait up to `timeout` for the next signal.
    pub fn next_timeout(&mut self, timeout: Duration) -> Option<FeedSignal> {
        if self.is_closed() {
            return None;
        }
        if let Some(lag) = self.take_lag() {
            return Some(lag);
        }
        match self.rx.recv_timeout(timeout) {
            Ok(signal) => {
                self.count(&signal);
                Some(signal)
            }
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                self.take_lag()
            }
        }
    }

    /// Drain every signal that is ready now.
    pub fn ready(&mut self) -> impl Iterator<Item = FeedSignal> + '_ {
        std::iter::from_fn(move || self.try_next())
    }

    /// True once cancelled; a closed feed never yields again.
    pub fn is_closed(&self) -> bool {
        self.counters.closed.load(Ordering::Acquire)
    }

    /// Number of change events handed out so far.
    pub fn delivered(&self) -> u64 {
        self.counters.delivered.load(Ordering::Relaxed)
    }

    /// Number of signals the provider pushed into a full buffer.
    pub fn overflowed(&self) -> u64 {
        self.counters.overflowed.load(Ordering::Relaxed)
    }

    fn take_lag(&mut self) -> Option<FeedSignal> {
        let overflowed = self.overflowed();
        let lagged = overflowed.saturating_sub(self.reported_overflow);
        if lagged == 0 {
            return None;
        }
        self.reported_overflow = overflowed;
        Some(FeedSignal::Lagged(lagged))
    }

    fn count(&self, signal: &FeedSignal) {
        if matches!(signal, FeedSignal::Event(_)) {
            self.counters.delivered.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn cancel(&self) {
        self.counters.closed.store(true, Ordering::Release);
    }
}

/// One open push subscription.
pub struct ChangeFeedClient {
    feed: ChangeFeed,
    unsubscribe: Option<Box<dyn Unsubscribe>>,
}

impl ChangeFeedClient {
    /// Subscribe to `topic` through the provider.
    pub fn open(push: &dyn PushCollaborator, topic: Topic, buffer_size: usize) -> Self {
        let (tx, rx) = bounded(buffer_size.max(1));
        let counters = Arc::new(FeedCounters::default());
        let sink = EventSink {
            topic: topic.clone(),
            tx,
            counters: Arc::clone(&counters),
        };

        let unsubscribe = push.subscribe(&topic, sink);
        debug!(topic = %topic, "Change feed opened");

        Self {
            feed: ChangeFeed {
                topic,
                rx,
                counters,
                reported_overflow: 0,
            },
            unsubscribe: Some(unsubscribe),
        }
    }

    pub fn topic(&self) -> &Topic {
        self.feed.topic()
    }

    pub fn feed(&self) -> &ChangeFeed {
        &self.feed
    }

    pub fn feed_mut(&mut self) -> &mut ChangeFeed {
        &mut self.feed
    }

    pub fn is_closed(&self) -> bool {
        self.feed.is_closed()
    }

    /// Release the push subscription. Safe to call repeatedly.
    pub fn close(&mut self) {
        if let Some(mut unsubscribe) = self.unsubscribe.take() {
            self.feed.cancel();
            unsubscribe.unsubscribe();
            debug!(topic = %self.feed.topic, delivered = self.feed.delivered(), "Change feed closed");
        }
    }
}

impl Drop for ChangeFeedClient {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for ChangeFeedClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeFeedClient")
            .field("topic", self.topic())
            .field("closed", &self.is_closed())
            .finish()
    }
}
