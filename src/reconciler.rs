//! Reconciler: folds feed signals and query results into the cache.
//!
//! Owns the per-topic sequence cursors used for gap detection and the
//! fetch lifecycle of every live key (initial load, resync, retry with
//! backoff).

use crate::cache::{ApplyOutcome, CacheKey, CacheStore};
use crate::collab::{Completion, FetchReply, QueryCollaborator, Snapshot};
use crate::error::TransportError;
use crate::feed::{Connectivity, FeedSignal};
use crate::mutations::OptimisticMutationQueue;
use crate::types::{ChangeEvent, Sequence, Timestamp, Topic};
use crossbeam_channel::Sender;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Timing of gap detection and resyncs.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcilerConfig {
    /// How long a hole in a topic's sequence may stay open before the
    /// topic is resynced.
    /// Default: 10s
    pub gap_timeout: Duration,

    /// Delay before retrying a failed fetch. Doubles per failure.
    /// Default: 1s
    pub resync_backoff: Duration,

    /// Default: 30s
    pub max_resync_backoff: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            gap_timeout: Duration::from_secs(10),
            resync_backoff: Duration::from_secs(1),
            max_resync_backoff: Duration::from_secs(30),
        }
    }
}

/// Sequence bookkeeping for one topic.
#[derive(Debug, Default)]
struct TopicCursor {
    /// Every seq up to here is accounted for.
    contiguous: Sequence,
    /// Seen seqs above `contiguous`.
    ahead: BTreeSet<Sequence>,
    /// When the current gap was first noticed.
    gap_since: Option<Instant>,
}

impl TopicCursor {
    fn observe(&mut self, seq: Sequence, now: Instant) {
        if seq <= self.contiguous {
            return;
        }
        self.ahead.insert(seq);
        self.advance();
        if self.has_gap() {
            self.gap_since.get_or_insert(now);
        }
    }

    /// A snapshot accounts for everything up to `seq`.
    fn rebase(&mut self, seq: Sequence) {
        self.contiguous = self.contiguous.max(seq);
        self.ahead = self.ahead.split_off(&self.contiguous.next());
        self.advance();
        if !self.has_gap() {
            self.gap_since = None;
        }
    }

    fn advance(&mut self) {
        while self.ahead.remove(&self.contiguous.next()) {
            self.contiguous = self.contiguous.next();
        }
        if !self.has_gap() {
            self.gap_since = None;
        }
    }

    fn has_gap(&self) -> bool {
        !self.ahead.is_empty()
    }
}

#[derive(Debug)]
struct FetchState {
    /// Id of the query in flight, if any.
    in_flight: Option<u64>,
    failures: u32,
    retry_at: Option<Instant>,
    /// Resync asked for while a query was in flight; its result may
    /// predate the reason, so query again once it lands.
    refetch: bool,
}

/// Applies changes and snapshots to the cache.
pub struct Reconciler {
    query: Arc<dyn QueryCollaborator>,
    completions: Sender<Completion>,
    config: ReconcilerConfig,
    cursors: HashMap<Topic, TopicCursor>,
    fetches: HashMap<CacheKey, FetchState>,
    /// Topics whose push connection is down.
    offline: HashSet<Topic>,
    next_request: u64,
}

impl Reconciler {
    pub(crate) fn new(
        query: Arc<dyn QueryCollaborator>,
        completions: Sender<Completion>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            query,
            completions,
            config,
            cursors: HashMap::new(),
            fetches: HashMap::new(),
            offline: HashSet::new(),
            next_request: 1,
        }
    }

    /// Start a query for `key` unless one is already in flight.
    pub fn request_fetch(&mut self, key: &CacheKey) -> bool {
        let state = self.fetches.entry(key.clone()).or_insert(FetchState {
            in_flight: None,
            failures: 0,
            retry_at: None,
            refetch: false,
        });
        if state.in_flight.is_some() {
            return false;
        }

        let request_id = self.next_request;
        self.next_request += 1;
        state.in_flight = Some(request_id);
        state.retry_at = None;

        debug!(key = ?key, request_id, "Fetch requested");
        self.query
            .fetch(FetchReply::new(key.clone(), request_id, self.completions.clone()));
        true
    }

    pub fn is_fetching(&self, key: &CacheKey) -> bool {
        self.fetches
            .get(key)
            .is_some_and(|state| state.in_flight.is_some())
    }

    /// Handle one feed signal of `topic`.
    pub(crate) fn on_signal(
        &mut self,
        topic: &Topic,
        signal: FeedSignal,
        store: &mut CacheStore,
        mutations: &mut OptimisticMutationQueue,
        now: Instant,
        wall: Timestamp,
    ) {
        match signal {
            FeedSignal::Event(event) => self.on_event(topic, &event, store, mutations, now, wall),
            FeedSignal::Connectivity(Connectivity::Disconnected) => {
                if self.offline.insert(topic.clone()) {
                    warn!(topic = %topic, "Change feed disconnected");
                }
                for key in store.keys_for_topic(topic) {
                    store.mark_stale(&key);
                }
            }
            FeedSignal::Connectivity(Connectivity::Connected) => {
                if self.offline.remove(topic) {
                    info!(topic = %topic, "Change feed reconnected, resyncing");
                    self.resync_topic(topic, store);
                }
            }
            FeedSignal::Lagged(dropped) => {
                // The lost signals may include a link change, so the link
                // state is unknown until the snapshot answers.
                self.offline.remove(topic);
                warn!(topic = %topic, dropped, "Change feed lagged, resyncing");
                self.resync_topic(topic, store);
            }
        }
    }

    fn on_event(
        &mut self,
        topic: &Topic,
        event: &ChangeEvent,
        store: &mut CacheStore,
        mutations: &mut OptimisticMutationQueue,
        now: Instant,
        wall: Timestamp,
    ) {
        if &event.topic != topic {
            warn!(topic = %topic, event_topic = %event.topic, "Event for foreign topic dropped");
            return;
        }

        self.cursors
            .entry(topic.clone())
            .or_default()
            .observe(event.server_seq, now);

        let mut applied = 0;
        let mut duplicates = 0;
        for key in store.keys_for_topic(topic) {
            if !key.matches(event) {
                continue;
            }
            match store.apply_change(&key, event, wall) {
                ApplyOutcome::Applied | ApplyOutcome::Buffered => applied += 1,
                ApplyOutcome::Duplicate => {
                    duplicates += 1;
                    debug!(key = ?key, seq = %event.server_seq, "Duplicate change ignored");
                }
                ApplyOutcome::Deferred => {
                    applied += 1;
                    debug!(key = ?key, entity = %event.entity_id, "Update deferred");
                }
            }
        }

        // A replay may still carry the acked id of its mutation, but its
        // content says nothing about sends made since.
        let replay = duplicates > 0 && applied == 0;
        mutations.match_event(event, replay, store);
    }

    /// Handle a fetch completion.
    pub(crate) fn on_fetch(
        &mut self,
        key: CacheKey,
        request_id: u64,
        result: Result<Snapshot, TransportError>,
        store: &mut CacheStore,
        mutations: &mut OptimisticMutationQueue,
        now: Instant,
        wall: Timestamp,
    ) {
        let Some(state) = self.fetches.get_mut(&key) else {
            debug!(key = ?key, request_id, "Result for forgotten key discarded");
            return;
        };
        if state.in_flight != Some(request_id) {
            debug!(key = ?key, request_id, "Superseded fetch result discarded");
            return;
        }
        state.in_flight = None;
        let again = std::mem::take(&mut state.refetch);

        if !store.contains(&key) {
            debug!(key = ?key, "Result for evicted key discarded");
            return;
        }

        match result {
            Ok(snapshot) => {
                state.failures = 0;
                state.retry_at = None;
                let count = snapshot.items.len();
                let synced = store.replace(&key, snapshot.items.clone(), snapshot.seq, wall);
                self.cursors
                    .entry(key.topic().clone())
                    .or_default()
                    .rebase(snapshot.seq);
                info!(key = ?key, items = count, seq = %synced, "Snapshot installed");
                mutations.after_snapshot(&key, &snapshot.items, store);
                if again {
                    debug!(key = ?key, "Refetching for a resync raised mid-flight");
                    self.request_fetch(&key);
                }
            }
            Err(error) => {
                state.failures += 1;
                let delay = backoff(&self.config, state.failures);
                state.retry_at = Some(now + delay);
                warn!(
                    key = ?key,
                    error = %error,
                    failures = state.failures,
                    retry_in = ?delay,
                    "Fetch failed"
                );
                store.mark_stale(&key);
            }
        }
    }

    /// Resync every live key of `topic`.
    pub fn resync_topic(&mut self, topic: &Topic, store: &mut CacheStore) {
        for key in store.keys_for_topic(topic) {
            store.mark_stale(&key);
            if !self.request_fetch(&key) {
                if let Some(state) = self.fetches.get_mut(&key) {
                    state.refetch = true;
                }
            }
        }
    }

    /// Periodic work: gap timeouts, deferred retries and fetch retries.
    pub(crate) fn tick(&mut self, store: &mut CacheStore, now: Instant, wall: Timestamp) {
        let gap_timeout = self.config.gap_timeout;
        let expired: Vec<Topic> = self
            .cursors
            .iter_mut()
            .filter_map(|(topic, cursor)| {
                let since = cursor.gap_since?;
                if now.duration_since(since) < gap_timeout {
                    return None;
                }
                // One resync per gap; the snapshot rebases the cursor.
                cursor.gap_since = None;
                Some(topic.clone())
            })
            .collect();
        for topic in expired {
            warn!(topic = %topic, "Sequence gap timed out, resyncing");
            self.resync_topic(&topic, store);
        }

        for key in store.keys() {
            let stats = store.retry_deferred(&key, wall);
            if stats.dropped > 0 {
                warn!(key = ?key, dropped = stats.dropped, "Deferred updates gave up, resyncing");
                self.request_fetch(&key);
            }
        }

        let due: Vec<CacheKey> = self
            .fetches
            .iter()
            .filter(|(key, state)| {
                state.in_flight.is_none()
                    && state.retry_at.is_some_and(|at| at <= now)
                    && !self.offline.contains(key.topic())
            })
            .map(|(key, _)| key.clone())
            .collect();
        for key in due {
            if store.contains(&key) {
                self.request_fetch(&key);
            }
        }
    }

    /// Highest contiguous sequence seen on `topic`.
    pub fn cursor(&self, topic: &Topic) -> Sequence {
        self.cursors
            .get(topic)
            .map_or(Sequence(0), |cursor| cursor.contiguous)
    }

    pub fn has_gap(&self, topic: &Topic) -> bool {
        self.cursors.get(topic).is_some_and(TopicCursor::has_gap)
    }

    pub fn is_offline(&self, topic: &Topic) -> bool {
        self.offline.contains(topic)
    }

    /// Drop all bookkeeping of a closed topic.
    pub(crate) fn forget_topic(&mut self, topic: &Topic) {
        self.cursors.remove(topic);
        self.offline.remove(topic);
        self.fetches.retain(|key, _| key.topic() != topic);
    }
}

fn backoff(config: &ReconcilerConfig, failures: u32) -> Duration {
    let factor = 1u32 << failures.saturating_sub(1).min(16);
    config
        .resync_backoff
        .saturating_mul(factor)
        .min(config.max_resync_backoff)
}
