//! Keyed cache of query results with optimistic edits and observers.

use super::entry::{
    ApplyOutcome, CacheEntry, CacheKey, EntryStatus, MergePolicy, RetryStats,
};
use super::observers::{EntryWatch, ObserverCallback, ObserverId, Observers};
use crate::types::{ChangeEvent, Entity, EntityId, LocalId, Operation, Sequence, Timestamp, Topic};
use lru::LruCache;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tracing::debug;

/// Default number of retired entries kept for quick remounts.
const DEFAULT_RETIRED_CAPACITY: usize = 32;

/// Handle for undoing one optimistic edit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UndoToken(pub u64);

/// A speculative local change.
#[derive(Clone, Debug, PartialEq)]
pub enum OptimisticPatch {
    /// Show a provisional entity.
    Insert { local_id: LocalId, entity: Entity },
    /// Overwrite some fields of a cached entity.
    Merge {
        local_id: LocalId,
        entity_id: EntityId,
        fields: Map<String, Value>,
    },
}

/// Compensating record kept for each optimistic edit.
#[derive(Clone, Debug)]
enum UndoRecord {
    Inserted {
        key: CacheKey,
        local_id: LocalId,
        entity_id: EntityId,
    },
    Patched {
        key: CacheKey,
        entity_id: EntityId,
        fields: Map<String, Value>,
        /// Prior field values; `None` if the entity was not cached.
        previous: Option<Map<String, Value>>,
    },
}

impl UndoRecord {
    fn key(&self) -> &CacheKey {
        match self {
            UndoRecord::Inserted { key, .. } | UndoRecord::Patched { key, .. } => key,
        }
    }
}

/// The cache.
///
/// Entries are shared with readers as `Arc` snapshots and copied on write,
/// so a reader never observes a half-applied change.
pub struct CacheStore {
    entries: std::collections::HashMap<CacheKey, Arc<CacheEntry>>,
    /// Entries of closed topics, kept stale for instant remounts.
    retired: LruCache<CacheKey, Arc<CacheEntry>>,
    undo: BTreeMap<UndoToken, UndoRecord>,
    next_undo: u64,
    observers: Observers,
    policy: MergePolicy,
    batch_depth: usize,
    dirty: Vec<CacheKey>,
}

impl CacheStore {
    pub fn new() -> Self {
        Self::with_policy(MergePolicy::default(), DEFAULT_RETIRED_CAPACITY)
    }

    pub fn with_policy(policy: MergePolicy, retired_capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(retired_capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: std::collections::HashMap::new(),
            retired: LruCache::new(capacity),
            undo: BTreeMap::new(),
            next_undo: 1,
            observers: Observers::default(),
            policy,
            batch_depth: 0,
            dirty: Vec::new(),
        }
    }

    // --- Reads ---

    /// Current version of an entry; a `Loading` placeholder if absent.
    pub fn read(&self, key: &CacheKey) -> Arc<CacheEntry> {
        self.entries
            .get(key)
            .cloned()
            .unwrap_or_else(|| Arc::new(CacheEntry::loading(key.clone())))
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn keys(&self) -> Vec<CacheKey> {
        self.entries.keys().cloned().collect()
    }

    /// Live keys whose results come from `topic`.
    pub fn keys_for_topic(&self, topic: &Topic) -> Vec<CacheKey> {
        self.entries
            .keys()
            .filter(|key| key.topic() == topic)
            .cloned()
            .collect()
    }

    /// Number of optimistic edits not yet settled.
    pub fn pending_patches(&self) -> usize {
        self.undo.len()
    }

    // --- Authoritative changes ---

    /// Make `key` live before its (re)load.
    ///
    /// Restores a retired version as `Stale` when one exists, else creates a
    /// `Loading` placeholder. A live entry is marked `Stale`.
    pub fn begin_load(&mut self, key: &CacheKey) -> EntryStatus {
        if let Some(entry) = self.entries.get_mut(key) {
            if Arc::make_mut(entry).mark_stale() {
                self.mark_dirty(key);
            }
            return entry_status(&self.entries, key);
        }

        let entry = match self.retired.pop(key) {
            Some(mut retired) => {
                Arc::make_mut(&mut retired).mark_stale();
                retired
            }
            None => Arc::new(CacheEntry::loading(key.clone())),
        };
        let status = entry.status();
        self.entries.insert(key.clone(), entry);
        self.mark_dirty(key);
        status
    }

    /// Install a full snapshot. Returns the entry's `last_synced_seq`.
    pub fn replace(
        &mut self,
        key: &CacheKey,
        items: Vec<Entity>,
        seq: Sequence,
        now: Timestamp,
    ) -> Sequence {
        let policy = self.policy;
        let synced = {
            let entry = self.entry_mut(key);
            entry.replace(items, seq, now, policy);
            entry.last_synced_seq()
        };
        self.reapply_patches(key, None);
        self.mark_dirty(key);
        synced
    }

    /// Merge one pushed change into an entry.
    pub fn apply_change(
        &mut self,
        key: &CacheKey,
        event: &ChangeEvent,
        now: Timestamp,
    ) -> ApplyOutcome {
        let policy = self.policy;
        let outcome = self.entry_mut(key).apply_change(event, now, policy);
        match outcome {
            ApplyOutcome::Applied => {
                if event.operation != Operation::Delete {
                    self.reapply_patches(key, Some(&event.entity_id));
                }
                self.mark_dirty(key);
            }
            ApplyOutcome::Deferred | ApplyOutcome::Buffered => {
                // Bookkeeping only; nothing visible changed.
            }
            ApplyOutcome::Duplicate => {}
        }
        outcome
    }

    /// Run one retry pass over an entry's deferred updates.
    pub fn retry_deferred(&mut self, key: &CacheKey, now: Timestamp) -> RetryStats {
        let policy = self.policy;
        let Some(entry) = self.entries.get(key) else {
            return RetryStats::default();
        };
        if entry.deferred_count() == 0 {
            return RetryStats::default();
        }

        let status_before = entry.status();
        let stats = self.entry_mut(key).retry_deferred(now, policy);
        if stats.applied > 0 || entry_status(&self.entries, key) != status_before {
            self.reapply_patches(key, None);
            self.mark_dirty(key);
        }
        stats
    }

    /// Flag an entry as possibly behind the server.
    pub fn mark_stale(&mut self, key: &CacheKey) -> bool {
        let Some(entry) = self.entries.get_mut(key) else {
            return false;
        };
        let changed = Arc::make_mut(entry).mark_stale();
        if changed {
            self.mark_dirty(key);
        }
        changed
    }

    /// Drop a live entry into the retired cache.
    ///
    /// Optimistic edits on it are reverted first so the retired copy only
    /// holds server data.
    pub fn evict(&mut self, key: &CacheKey) -> bool {
        let tokens: Vec<UndoToken> = self
            .undo
            .iter()
            .filter(|(_, record)| record.key() == key)
            .map(|(token, _)| *token)
            .collect();
        for token in tokens {
            self.revert(token);
        }

        let Some(mut entry) = self.entries.remove(key) else {
            return false;
        };
        Arc::make_mut(&mut entry).mark_stale();
        self.dirty.retain(|k| k != key);
        self.retired.put(key.clone(), entry);
        debug!(key = ?key, "Cache entry retired");
        true
    }

    // --- Optimistic changes ---

    /// Apply a speculative change outside the authoritative sequence.
    pub fn patch_optimistic(&mut self, key: &CacheKey, patch: OptimisticPatch) -> UndoToken {
        let token = UndoToken(self.next_undo);
        self.next_undo += 1;

        let record = match patch {
            OptimisticPatch::Insert { local_id, entity } => {
                let entity_id = entity.id.clone();
                self.entry_mut(key).insert_optimistic(entity, local_id);
                UndoRecord::Inserted {
                    key: key.clone(),
                    local_id,
                    entity_id,
                }
            }
            OptimisticPatch::Merge {
                entity_id, fields, ..
            } => {
                let previous = self.entry_mut(key).patch_item(&entity_id, &fields);
                UndoRecord::Patched {
                    key: key.clone(),
                    entity_id,
                    fields,
                    previous,
                }
            }
        };

        self.undo.insert(token, record);
        self.mark_dirty(key);
        token
    }

    /// Undo an optimistic change. Returns false for unknown tokens.
    pub fn revert(&mut self, token: UndoToken) -> bool {
        let Some(record) = self.undo.remove(&token) else {
            return false;
        };
        let key = record.key().clone();
        let Some(entry) = self.entries.get_mut(&key) else {
            return true;
        };
        let entry = Arc::make_mut(entry);
        match &record {
            UndoRecord::Inserted { entity_id, .. } => {
                entry.remove_item(entity_id);
            }
            UndoRecord::Patched {
                entity_id,
                previous: Some(previous),
                ..
            } => entry.restore_fields(entity_id, previous),
            UndoRecord::Patched { previous: None, .. } => {}
        }
        self.mark_dirty(&key);
        true
    }

    /// Keep an optimistic change and forget how to undo it.
    pub fn settle(&mut self, token: UndoToken) -> bool {
        self.undo.remove(&token).is_some()
    }

    /// The authoritative version arrived: drop the optimistic one.
    ///
    /// A provisional entity is removed; a field patch is kept as-is since
    /// the authoritative row already carries it.
    pub fn supersede(&mut self, token: UndoToken) -> bool {
        match self.undo.get(&token) {
            Some(UndoRecord::Inserted { .. }) => self.revert(token),
            Some(UndoRecord::Patched { .. }) => self.settle(token),
            None => false,
        }
    }

    /// No confirming event arrived: keep the provisional entity under its
    /// real id.
    pub fn promote(&mut self, token: UndoToken, real_id: EntityId) -> bool {
        let Some(record) = self.undo.remove(&token) else {
            return false;
        };
        if let UndoRecord::Inserted {
            key,
            local_id,
            entity_id,
        } = record
        {
            if let Some(entry) = self.entries.get_mut(&key) {
                Arc::make_mut(entry).promote(&entity_id, real_id, local_id);
                self.mark_dirty(&key);
            }
        }
        true
    }

    /// Key an optimistic edit lives in.
    pub fn patch_key(&self, token: UndoToken) -> Option<&CacheKey> {
        self.undo.get(&token).map(UndoRecord::key)
    }

    // --- Observers ---

    /// Call `callback` with every new version of `key`.
    pub fn subscribe(&mut self, key: &CacheKey, callback: ObserverCallback) -> ObserverId {
        self.observers.add_callback(key.clone(), callback)
    }

    /// Bounded channel of new versions of `key`.
    pub fn watch(&mut self, key: &CacheKey, buffer_size: usize) -> EntryWatch {
        self.observers.add_watch(key.clone(), buffer_size)
    }

    pub fn unsubscribe(&mut self, id: ObserverId) -> bool {
        self.observers.remove(id)
    }

    pub fn observer_count(&self) -> usize {
        self.observers.count()
    }

    /// Hold publications until the matching `end_batch`.
    pub fn begin_batch(&mut self) {
        self.batch_depth += 1;
    }

    /// Publish every key touched since the outermost `begin_batch`, once.
    pub fn end_batch(&mut self) {
        self.batch_depth = self.batch_depth.saturating_sub(1);
        if self.batch_depth == 0 {
            for key in std::mem::take(&mut self.dirty) {
                self.publish(&key);
            }
        }
    }

    /// Run `f` with publications coalesced.
    pub fn batch<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> R {
        self.begin_batch();
        let result = f(self);
        self.end_batch();
        result
    }

    // --- Internal ---

    fn entry_mut(&mut self, key: &CacheKey) -> &mut CacheEntry {
        let entry = self
            .entries
            .entry(key.clone())
            .or_insert_with(|| Arc::new(CacheEntry::loading(key.clone())));
        Arc::make_mut(entry)
    }

    /// Re-lay field patches over rows the server just rewrote.
    fn reapply_patches(&mut self, key: &CacheKey, only: Option<&EntityId>) {
        let touches = |record: &UndoRecord| match record {
            UndoRecord::Patched { key: k, entity_id, .. } => {
                k == key && only.map_or(true, |id| id == entity_id)
            }
            UndoRecord::Inserted { .. } => false,
        };
        if !self.undo.values().any(touches) {
            return;
        }
        let Some(entry) = self.entries.get_mut(key) else {
            return;
        };
        let entry = Arc::make_mut(entry);
        for record in self.undo.values_mut() {
            if !touches(record) {
                continue;
            }
            if let UndoRecord::Patched {
                entity_id,
                fields,
                previous,
                ..
            } = record
            {
                if let Some(prior) = entry.patch_item(entity_id, fields) {
                    *previous = Some(prior);
                }
            }
        }
    }

    fn mark_dirty(&mut self, key: &CacheKey) {
        if self.batch_depth > 0 {
            if !self.dirty.contains(key) {
                self.dirty.push(key.clone());
            }
        } else {
            self.publish(key);
        }
    }

    fn publish(&mut self, key: &CacheKey) {
        if let Some(entry) = self.entries.get(key) {
            let entry = Arc::clone(entry);
            self.observers.publish(key, &entry);
        }
    }
}

impl Default for CacheStore {
    fn default() -> Self {
        Self::new()
    }
}

fn entry_status(
    entries: &std::collections::HashMap<CacheKey, Arc<CacheEntry>>,
    key: &CacheKey,
) -> EntryStatus {
    entries
        .get(key)
        .map(|e| e.status())
        .unwrap_or(EntryStatus::Loading)
}
