//! The sync engine: one owner for the cache, feeds, reconciler and
//! mutation queue.

use crate::cache::{
    CacheEntry, CacheKey, CacheStore, EntryStatus, EntryWatch, MergePolicy, ObserverCallback,
    ObserverId,
};
use crate::clock::{Clock, SystemClock};
use crate::collab::{
    Completion, IdentityCollaborator, PushCollaborator, QueryCollaborator, SessionContext,
    WriteCollaborator,
};
use crate::error::{Result, SyncError};
use crate::mutations::{
    MutationConfig, MutationIntent, MutationState, NoticeHandle, OptimisticMutationQueue,
    PendingMutation,
};
use crate::reconciler::{Reconciler, ReconcilerConfig};
use crate::subscriptions::{AttachToken, SubscriptionConfig, SubscriptionManager, TopicSummary};
use crate::types::{EntityId, LocalId, Topic, UserIdentity};
use crate::views::{self, MessageView, NotificationFeedSummary};
use crossbeam_channel::{unbounded, Receiver};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// The external services the engine drives.
#[derive(Clone)]
pub struct Collaborators {
    pub query: Arc<dyn QueryCollaborator>,
    pub write: Arc<dyn WriteCollaborator>,
    pub push: Arc<dyn PushCollaborator>,
    pub identity: Arc<dyn IdentityCollaborator>,
}

/// Engine configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub subscriptions: SubscriptionConfig,
    pub merge: MergePolicy,
    pub reconciler: ReconcilerConfig,
    pub mutations: MutationConfig,

    /// Entries of closed topics kept for instant remounts.
    /// Default: 32
    pub retired_entries: usize,

    /// Window of the notification centre.
    /// Default: 10
    pub notification_limit: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            subscriptions: SubscriptionConfig::default(),
            merge: MergePolicy::default(),
            reconciler: ReconcilerConfig::default(),
            mutations: MutationConfig::default(),
            retired_entries: 32,
            notification_limit: 10,
        }
    }
}

impl SyncConfig {
    /// Parse a JSON document; missing fields take their defaults.
    pub fn from_json(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}

/// Handle of one open view.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ViewToken(pub u64);

struct OpenView {
    key: CacheKey,
    attach: AttachToken,
}

/// What one [`SyncEngine::pump`] did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PumpStats {
    /// Feed signals handled.
    pub signals: usize,
    /// Query results handled.
    pub fetches: usize,
    /// Write outcomes handled.
    pub writes: usize,
    /// Topics whose grace period ran out.
    pub closed_topics: usize,
}

impl PumpStats {
    pub fn is_idle(&self) -> bool {
        *self == PumpStats::default()
    }
}

/// Entry point for UI code.
///
/// Every method takes `&mut self` and runs to completion, so handlers are
/// serialized by construction and the cache needs no locks. Collaborators
/// complete through reply handles; their results are applied by the next
/// [`pump`](SyncEngine::pump).
pub struct SyncEngine {
    config: SyncConfig,
    clock: Arc<dyn Clock>,
    session: SessionContext,
    store: CacheStore,
    subscriptions: SubscriptionManager,
    reconciler: Reconciler,
    mutations: OptimisticMutationQueue,
    completions: Receiver<Completion>,
    views: HashMap<ViewToken, OpenView>,
    next_view: u64,
}

impl SyncEngine {
    pub fn new(collaborators: Collaborators, config: SyncConfig) -> Self {
        Self::with_clock(collaborators, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        collaborators: Collaborators,
        config: SyncConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (tx, rx) = unbounded();
        let session = SessionContext::new(collaborators.identity);
        let store = CacheStore::with_policy(config.merge, config.retired_entries);
        let subscriptions =
            SubscriptionManager::new(collaborators.push, config.subscriptions.clone());
        let reconciler =
            Reconciler::new(collaborators.query, tx.clone(), config.reconciler.clone());
        let mutations =
            OptimisticMutationQueue::new(collaborators.write, tx, config.mutations.clone());

        info!(user = ?session.user_id(), "Sync engine started");
        Self {
            config,
            clock,
            session,
            store,
            subscriptions,
            reconciler,
            mutations,
            completions: rx,
            views: HashMap::new(),
            next_view: 1,
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    // --- Views ---

    /// Open a live view of `key`.
    ///
    /// Attaches to the key's topic and starts a load unless the entry is
    /// already live and fresh. A retired copy is shown as `Stale` meanwhile.
    pub fn open_view(&mut self, key: CacheKey) -> Result<ViewToken> {
        key.validate()?;

        let attach = self.subscriptions.attach(key.topic().clone());
        let status = if self.store.contains(&key) {
            self.store.read(&key).status()
        } else {
            self.store.begin_load(&key)
        };
        if status != EntryStatus::Fresh {
            self.reconciler.request_fetch(&key);
        }

        let token = ViewToken(self.next_view);
        self.next_view += 1;
        debug!(view = token.0, key = ?key, status = ?status, "View opened");
        self.views.insert(token, OpenView { key, attach });
        Ok(token)
    }

    /// Messages of a room, oldest first.
    pub fn chat_view(&mut self, room_id: impl Into<String>) -> Result<ViewToken> {
        self.open_view(CacheKey::room_messages(room_id))
    }

    /// The signed-in user's newest notifications.
    pub fn notification_view(&mut self) -> Result<ViewToken> {
        let user = self.session.current().ok_or(SyncError::NotSignedIn)?;
        self.open_view(CacheKey::user_notifications(
            user.id,
            self.config.notification_limit,
        ))
    }

    /// Close a view. Its topic closes after the grace period if nothing
    /// else holds it; in-flight mutations are unaffected.
    pub fn close_view(&mut self, token: ViewToken) -> Result<()> {
        let view = self
            .views
            .remove(&token)
            .ok_or(SyncError::UnknownView(token.0))?;
        self.subscriptions.detach(view.attach, self.clock.now());
        debug!(view = token.0, key = ?view.key, "View closed");
        Ok(())
    }

    pub fn view_key(&self, token: ViewToken) -> Option<&CacheKey> {
        self.views.get(&token).map(|view| &view.key)
    }

    pub fn open_views(&self) -> usize {
        self.views.len()
    }

    // --- Reads ---

    pub fn read(&self, key: &CacheKey) -> Arc<CacheEntry> {
        self.store.read(key)
    }

    pub fn read_view(&self, token: ViewToken) -> Result<Arc<CacheEntry>> {
        Ok(self.store.read(self.key_of(token)?))
    }

    /// Chat messages of a view, with authorship resolved against the
    /// session.
    pub fn messages(&self, token: ViewToken) -> Result<Vec<MessageView>> {
        let entry = self.read_view(token)?;
        let me = self.session.user_id();
        Ok(views::messages(&entry, me.as_deref()))
    }

    pub fn notifications(&self, token: ViewToken) -> Result<NotificationFeedSummary> {
        let entry = self.read_view(token)?;
        Ok(NotificationFeedSummary::from_entry(&entry))
    }

    /// Call `callback` with every new version of the view's entry.
    pub fn subscribe(&mut self, token: ViewToken, callback: ObserverCallback) -> Result<ObserverId> {
        let key = self.key_of(token)?.clone();
        Ok(self.store.subscribe(&key, callback))
    }

    /// Bounded channel of new versions of the view's entry.
    pub fn watch(&mut self, token: ViewToken, buffer_size: usize) -> Result<EntryWatch> {
        let key = self.key_of(token)?.clone();
        Ok(self.store.watch(&key, buffer_size))
    }

    pub fn unsubscribe(&mut self, id: ObserverId) -> bool {
        self.store.unsubscribe(id)
    }

    // --- Mutations ---

    /// Apply `intent` optimistically and start its durable write.
    pub fn submit(&mut self, intent: MutationIntent) -> Result<LocalId> {
        let now = self.clock.now();
        let wall = self.clock.wall();
        self.mutations
            .submit(intent, &self.session, &mut self.store, now, wall)
    }

    pub fn send_message(
        &mut self,
        room_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Result<LocalId> {
        self.submit(MutationIntent::SendMessage {
            room_id: room_id.into(),
            content: content.into(),
        })
    }

    pub fn mark_notification_read(&mut self, notification_id: impl Into<EntityId>) -> Result<LocalId> {
        self.submit(MutationIntent::MarkNotificationRead {
            notification_id: notification_id.into(),
        })
    }

    /// Receive a notice for every mutation settled from now on.
    pub fn notices(&mut self) -> NoticeHandle {
        self.mutations.notices()
    }

    pub fn mutation_state(&mut self, local_id: LocalId) -> Option<MutationState> {
        self.mutations.state(local_id)
    }

    pub fn pending_mutations(&self) -> Vec<&PendingMutation> {
        self.mutations.pending().collect()
    }

    // --- Session ---

    /// Re-read the identity collaborator after sign-in or sign-out.
    pub fn refresh_session(&mut self) -> Option<UserIdentity> {
        let user = self.session.refresh();
        info!(user = ?user.as_ref().map(|u| &u.id), "Session refreshed");
        user
    }

    pub fn session(&self) -> &SessionContext {
        &self.session
    }

    // --- Event loop ---

    /// Run every handler that is due: feed signals, collaborator
    /// completions, then timers. Publications are coalesced so each key
    /// is published at most once per pump.
    pub fn pump(&mut self) -> PumpStats {
        let now = self.clock.now();
        let wall = self.clock.wall();
        let mut stats = PumpStats::default();

        self.store.begin_batch();

        for (topic, signal) in self.subscriptions.poll() {
            self.reconciler.on_signal(
                &topic,
                signal,
                &mut self.store,
                &mut self.mutations,
                now,
                wall,
            );
            stats.signals += 1;
        }

        while let Ok(completion) = self.completions.try_recv() {
            match completion {
                Completion::Fetch {
                    key,
                    request_id,
                    result,
                } => {
                    self.reconciler.on_fetch(
                        key,
                        request_id,
                        result,
                        &mut self.store,
                        &mut self.mutations,
                        now,
                        wall,
                    );
                    stats.fetches += 1;
                }
                Completion::Write { local_id, result } => {
                    self.mutations
                        .on_write(local_id, result, &mut self.store, now);
                    stats.writes += 1;
                }
            }
        }

        self.reconciler.tick(&mut self.store, now, wall);
        self.mutations.tick(now, &mut self.store);

        for topic in self.subscriptions.expire(now) {
            for key in self.store.keys_for_topic(&topic) {
                self.store.evict(&key);
            }
            self.reconciler.forget_topic(&topic);
            stats.closed_topics += 1;
        }

        self.store.end_batch();
        stats
    }

    // --- Diagnostics ---

    pub fn is_topic_open(&self, topic: &Topic) -> bool {
        self.subscriptions.is_open(topic)
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.subscription_count()
    }

    pub fn topics(&self) -> Vec<TopicSummary> {
        self.subscriptions.summaries()
    }

    pub fn has_gap(&self, topic: &Topic) -> bool {
        self.reconciler.has_gap(topic)
    }

    pub fn is_fetching(&self, key: &CacheKey) -> bool {
        self.reconciler.is_fetching(key)
    }

    fn key_of(&self, token: ViewToken) -> Result<&CacheKey> {
        self.view_key(token).ok_or(SyncError::UnknownView(token.0))
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        let closed = self.subscriptions.close_all();
        if !closed.is_empty() {
            debug!(topics = closed.len(), "Sync engine shut down");
        }
    }
}
