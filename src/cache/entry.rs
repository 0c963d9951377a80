//! Cache keys, entries and the seq-gated merge rules.

use crate::error::{Result, SyncError};
use crate::types::{
    ChangeEvent, Entity, EntityId, EntityKind, LocalId, Operation, Sequence, Timestamp, Topic,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::collections::{HashMap, VecDeque};
use tracing::warn;

/// Direction of a view's natural (chronological) order.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    #[default]
    Ascending,
    Descending,
}

/// Filter, order and window of one query.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueryParams {
    /// Rows scoped to this room or user.
    pub scope: Topic,
    pub order: SortOrder,
    /// Keep only the first `limit` rows in `order`.
    pub limit: Option<usize>,
}

/// Address of a cached query result.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    pub kind: EntityKind,
    pub params: QueryParams,
}

impl CacheKey {
    pub fn new(kind: EntityKind, params: QueryParams) -> Self {
        Self { kind, params }
    }

    /// Messages of a room, oldest first.
    pub fn room_messages(room_id: impl Into<String>) -> Self {
        Self::new(
            EntityKind::Message,
            QueryParams {
                scope: Topic::room(room_id),
                order: SortOrder::Ascending,
                limit: None,
            },
        )
    }

    /// The newest `limit` notifications of a user.
    pub fn user_notifications(user_id: impl Into<String>, limit: usize) -> Self {
        Self::new(
            EntityKind::Notification,
            QueryParams {
                scope: Topic::user(user_id),
                order: SortOrder::Descending,
                limit: Some(limit),
            },
        )
    }

    pub fn topic(&self) -> &Topic {
        &self.params.scope
    }

    /// True if `event` belongs to this key's result set.
    pub fn matches(&self, event: &ChangeEvent) -> bool {
        event.entity_kind == self.kind && event.topic == self.params.scope
    }

    /// Reject keys whose kind cannot appear on their topic.
    pub fn validate(&self) -> Result<()> {
        if self.params.scope.entity_kind() != self.kind {
            return Err(SyncError::InvalidView(format!(
                "{:?} rows are not published on {}",
                self.kind, self.params.scope
            )));
        }
        if self.params.limit == Some(0) {
            return Err(SyncError::InvalidView("limit must be positive".to_string()));
        }
        Ok(())
    }
}

/// Freshness of an entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    /// Snapshot loaded and kept live by events.
    Fresh,
    /// May have missed changes; a resync is due.
    Stale,
    /// No snapshot yet.
    Loading,
}

/// Where a cached item came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemOrigin {
    Authoritative,
    /// Speculative local write, not yet confirmed.
    Optimistic(LocalId),
    /// Write acknowledged but its event never arrived.
    ReconciledByTimeout(LocalId),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CachedItem {
    pub entity: Entity,
    pub origin: ItemOrigin,
}

impl CachedItem {
    pub fn is_pending(&self) -> bool {
        matches!(self.origin, ItemOrigin::Optimistic(_))
    }
}

/// What `apply_change` did with an event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// Already reflected (replay or older than the entity's last change).
    Duplicate,
    /// Update for an entity not yet cached; retried later.
    Deferred,
    /// Held until the first snapshot lands.
    Buffered,
}

/// Bounds on the merge bookkeeping.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MergePolicy {
    /// Retry passes a deferred update gets before the entry is marked stale.
    pub max_deferred_attempts: u32,
    /// Events kept for replay over the next snapshot.
    pub journal_capacity: usize,
}

impl Default for MergePolicy {
    fn default() -> Self {
        Self {
            max_deferred_attempts: 5,
            journal_capacity: 512,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
struct DeferredChange {
    event: ChangeEvent,
    attempts: u32,
}

/// Result of a deferred retry pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RetryStats {
    pub applied: usize,
    pub dropped: usize,
}

/// The materialized result of one query.
#[derive(Clone, Debug, PartialEq)]
pub struct CacheEntry {
    key: CacheKey,
    items: Vec<CachedItem>,
    last_synced_seq: Sequence,
    status: EntryStatus,
    /// Sequence of the last snapshot; older events are already reflected.
    baseline_seq: Sequence,
    /// Last applied seq per entity, kept after deletes as a tombstone.
    entity_seqs: HashMap<EntityId, Sequence>,
    deferred: Vec<DeferredChange>,
    /// Events accepted since the last snapshot, replayed over the next one.
    journal: VecDeque<ChangeEvent>,
}

impl CacheEntry {
    /// Empty placeholder for a key with no snapshot yet.
    pub fn loading(key: CacheKey) -> Self {
        Self {
            key,
            items: Vec::new(),
            last_synced_seq: Sequence(0),
            status: EntryStatus::Loading,
            baseline_seq: Sequence(0),
            entity_seqs: HashMap::new(),
            deferred: Vec::new(),
            journal: VecDeque::new(),
        }
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn items(&self) -> &[CachedItem] {
        &self.items
    }

    pub fn entities(&self) -> impl Iterator<Item = &Entity> {
        self.items.iter().map(|item| &item.entity)
    }

    pub fn ids(&self) -> Vec<EntityId> {
        self.items.iter().map(|i| i.entity.id.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn status(&self) -> EntryStatus {
        self.status
    }

    pub fn last_synced_seq(&self) -> Sequence {
        self.last_synced_seq
    }

    pub fn get(&self, id: &EntityId) -> Option<&CachedItem> {
        self.items.iter().find(|item| &item.entity.id == id)
    }

    pub fn contains(&self, id: &EntityId) -> bool {
        self.position(id).is_some()
    }

    /// Number of optimistic items.
    pub fn pending_count(&self) -> usize {
        self.items.iter().filter(|i| i.is_pending()).count()
    }

    /// Updates waiting for their entity to show up.
    pub fn deferred_count(&self) -> usize {
        self.deferred.len()
    }

    fn position(&self, id: &EntityId) -> Option<usize> {
        self.items.iter().position(|item| &item.entity.id == id)
    }

    fn authoritative_len(&self) -> usize {
        self.items.iter().filter(|i| !i.is_pending()).count()
    }

    fn insert_sorted(&mut self, item: CachedItem) {
        let order = self.key.params.order;
        let pos = self
            .items
            .partition_point(|x| natural_cmp(order, &x.entity, &item.entity) == Ordering::Less);
        self.items.insert(pos, item);
    }

    /// Drop authoritative rows beyond the window. Optimistic rows stay.
    fn trim_to_limit(&mut self) {
        if let Some(limit) = self.key.params.limit {
            let mut kept = 0;
            self.items.retain(|item| {
                if item.is_pending() {
                    return true;
                }
                kept += 1;
                kept <= limit
            });
        }
    }

    fn journal_push(&mut self, event: &ChangeEvent, policy: MergePolicy) {
        self.journal.push_back(event.clone());
        while self.journal.len() > policy.journal_capacity {
            self.journal.pop_front();
        }
    }

    pub(crate) fn mark_stale(&mut self) -> bool {
        if self.status == EntryStatus::Fresh {
            self.status = EntryStatus::Stale;
            true
        } else {
            false
        }
    }

    // --- Authoritative merge ---

    /// Merge one pushed change.
    pub(crate) fn apply_change(
        &mut self,
        event: &ChangeEvent,
        now: Timestamp,
        policy: MergePolicy,
    ) -> ApplyOutcome {
        if self.status == EntryStatus::Loading {
            self.journal_push(event, policy);
            return ApplyOutcome::Buffered;
        }

        let outcome = self.apply_gated(event, now);
        if outcome != ApplyOutcome::Duplicate {
            self.journal_push(event, policy);
        }
        if outcome == ApplyOutcome::Applied && event.operation == Operation::Insert {
            self.retry_deferred_for(&event.entity_id, now);
        }
        outcome
    }

    fn apply_gated(&mut self, event: &ChangeEvent, now: Timestamp) -> ApplyOutcome {
        let seq = event.server_seq;
        let id = &event.entity_id;

        if seq <= self.baseline_seq {
            return ApplyOutcome::Duplicate;
        }
        if self.entity_seqs.get(id).is_some_and(|seen| seq <= *seen) {
            return ApplyOutcome::Duplicate;
        }

        match event.operation {
            Operation::Insert | Operation::Update => {
                if let Some(pos) = self.position(id) {
                    let fallback = self.items[pos].entity.created_at;
                    self.replace_at(pos, event.to_entity(fallback));
                } else if event.operation == Operation::Insert {
                    self.insert_sorted(CachedItem {
                        entity: event.to_entity(now),
                        origin: ItemOrigin::Authoritative,
                    });
                    self.trim_to_limit();
                } else {
                    let queued = self
                        .deferred
                        .iter()
                        .any(|d| &d.event.entity_id == id && d.event.server_seq == seq);
                    if queued {
                        return ApplyOutcome::Duplicate;
                    }
                    self.deferred.push(DeferredChange {
                        event: event.clone(),
                        attempts: 0,
                    });
                    return ApplyOutcome::Deferred;
                }
            }
            Operation::Delete => {
                if let Some(pos) = self.position(id) {
                    let window_full = self
                        .key
                        .params
                        .limit
                        .is_some_and(|limit| self.authoritative_len() >= limit);
                    self.items.remove(pos);
                    if window_full {
                        // The row below the window is unknown until refetched.
                        self.mark_stale();
                    }
                }
                self.deferred
                    .retain(|d| &d.event.entity_id != id || d.event.server_seq > seq);
            }
        }

        self.entity_seqs.insert(id.clone(), seq);
        self.last_synced_seq = self.last_synced_seq.max(seq);
        ApplyOutcome::Applied
    }

    fn replace_at(&mut self, pos: usize, entity: Entity) {
        if self.items[pos].entity.created_at == entity.created_at {
            self.items[pos] = CachedItem {
                entity,
                origin: ItemOrigin::Authoritative,
            };
        } else {
            self.items.remove(pos);
            self.insert_sorted(CachedItem {
                entity,
                origin: ItemOrigin::Authoritative,
            });
        }
    }

    fn retry_deferred_for(&mut self, id: &EntityId, now: Timestamp) {
        if !self.deferred.iter().any(|d| &d.event.entity_id == id) {
            return;
        }
        let (mut ready, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.deferred)
            .into_iter()
            .partition(|d| &d.event.entity_id == id);
        self.deferred = waiting;
        ready.sort_by_key(|d| d.event.server_seq);
        for change in ready {
            self.apply_gated(&change.event, now);
        }
    }

    /// One bounded retry pass over deferred updates.
    ///
    /// Updates that exhaust their attempts are dropped and the entry is
    /// marked stale so a refetch restores the missing row.
    pub(crate) fn retry_deferred(&mut self, now: Timestamp, policy: MergePolicy) -> RetryStats {
        let mut stats = RetryStats::default();
        if self.deferred.is_empty() || self.status == EntryStatus::Loading {
            return stats;
        }

        let mut pending = std::mem::take(&mut self.deferred);
        pending.sort_by_key(|d| d.event.server_seq);

        for mut change in pending {
            let seq = change.event.server_seq;
            let id = &change.event.entity_id;
            let superseded = seq <= self.baseline_seq
                || self.entity_seqs.get(id).is_some_and(|seen| seq <= *seen);
            if superseded {
                continue;
            }
            if self.contains(id) {
                self.apply_gated(&change.event, now);
                stats.applied += 1;
                continue;
            }
            change.attempts += 1;
            if change.attempts >= policy.max_deferred_attempts {
                warn!(key = ?self.key, entity = %id, seq = seq.0, "Dropping update for unknown entity");
                stats.dropped += 1;
                self.mark_stale();
            } else {
                self.deferred.push(change);
            }
        }
        stats
    }

    /// Install a full snapshot.
    ///
    /// Journaled events newer than `seq` are replayed on top, and optimistic
    /// items survive until their mutation settles.
    pub(crate) fn replace(
        &mut self,
        items: Vec<Entity>,
        seq: Sequence,
        now: Timestamp,
        policy: MergePolicy,
    ) {
        let optimistic: Vec<CachedItem> = self
            .items
            .drain(..)
            .filter(|item| item.is_pending())
            .collect();

        let order = self.key.params.order;
        let mut seen = std::collections::HashSet::new();
        let mut fresh: Vec<CachedItem> = items
            .into_iter()
            .filter(|entity| seen.insert(entity.id.clone()))
            .map(|entity| CachedItem {
                entity,
                origin: ItemOrigin::Authoritative,
            })
            .collect();
        fresh.sort_by(|a, b| natural_cmp(order, &a.entity, &b.entity));

        self.items = fresh;
        self.trim_to_limit();
        for item in optimistic {
            self.insert_sorted(item);
        }

        self.baseline_seq = seq;
        self.entity_seqs.clear();
        self.deferred.clear();
        self.status = EntryStatus::Fresh;
        self.last_synced_seq = self.last_synced_seq.max(seq);

        let mut journal: Vec<ChangeEvent> = std::mem::take(&mut self.journal).into();
        journal.sort_by_key(|e| e.server_seq);
        for event in journal.iter().filter(|e| e.server_seq > seq) {
            self.apply_change(event, now, policy);
        }
    }

    // --- Optimistic edits ---

    pub(crate) fn insert_optimistic(&mut self, entity: Entity, local_id: LocalId) {
        if let Some(pos) = self.position(&entity.id) {
            self.items.remove(pos);
        }
        self.insert_sorted(CachedItem {
            entity,
            origin: ItemOrigin::Optimistic(local_id),
        });
    }

    pub(crate) fn remove_item(&mut self, id: &EntityId) -> Option<CachedItem> {
        let pos = self.position(id)?;
        Some(self.items.remove(pos))
    }

    /// Merge `fields` into an item's payload. Returns the prior value of
    /// each field (`None` when it was absent).
    ///
    /// Ordering is not re-derived from patched fields.
    pub(crate) fn patch_item(
        &mut self,
        id: &EntityId,
        fields: &Map<String, Value>,
    ) -> Option<Map<String, Value>> {
        let pos = self.position(id)?;
        let payload = &mut self.items[pos].entity.payload;
        if !payload.is_object() {
            *payload = Value::Object(Map::new());
        }
        let object = payload.as_object_mut()?;

        let mut previous = Map::new();
        for (name, value) in fields {
            let prior = object.insert(name.clone(), value.clone());
            previous.insert(name.clone(), prior.map_or(Value::Null, wrap_present));
        }
        Some(previous)
    }

    /// Undo a `patch_item` using the map it returned.
    pub(crate) fn restore_fields(&mut self, id: &EntityId, previous: &Map<String, Value>) {
        let Some(pos) = self.position(id) else {
            return;
        };
        let Some(object) = self.items[pos].entity.payload.as_object_mut() else {
            return;
        };
        for (name, prior) in previous {
            match unwrap_present(prior) {
                Some(value) => {
                    object.insert(name.clone(), value);
                }
                None => {
                    object.remove(name);
                }
            }
        }
    }

    /// Turn an optimistic insert into a kept item carrying its real id.
    pub(crate) fn promote(&mut self, provisional: &EntityId, real: EntityId, local_id: LocalId) {
        let Some(mut item) = self.remove_item(provisional) else {
            return;
        };
        if self.contains(&real) {
            return;
        }
        item.entity.id = real.clone();
        if let Some(object) = item.entity.payload.as_object_mut() {
            object.insert("id".to_string(), Value::String(real.0));
        }
        item.origin = ItemOrigin::ReconciledByTimeout(local_id);
        self.insert_sorted(item);
    }
}

/// Chronological order with id as tie-break, flipped for descending views.
fn natural_cmp(order: SortOrder, a: &Entity, b: &Entity) -> Ordering {
    let ord = (a.created_at, &a.id).cmp(&(b.created_at, &b.id));
    match order {
        SortOrder::Ascending => ord,
        SortOrder::Descending => ord.reverse(),
    }
}

// A prior field value is stored as `{"v": value}` so that an explicit JSON
// null stays distinguishable from an absent field.
fn wrap_present(value: Value) -> Value {
    let mut wrapper = Map::new();
    wrapper.insert("v".to_string(), value);
    Value::Object(wrapper)
}

fn unwrap_present(prior: &Value) -> Option<Value> {
    prior.get("v").cloned()
}
