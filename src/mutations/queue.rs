//! Queue of optimistic mutations awaiting their authoritative outcome.

use crate::cache::{CacheKey, CacheStore, ItemOrigin, OptimisticPatch, UndoToken};
use crate::collab::{Completion, SessionContext, WriteAck, WriteCollaborator, WriteReply};
use crate::error::{Result, SyncError, WriteError};
use crate::types::{ChangeEvent, Entity, EntityId, LocalId, Timestamp, CREATED_AT_FIELD};
use crossbeam_channel::{unbounded, Sender};
use lru::LruCache;
use serde_json::Value;
use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use super::types::{
    Confirmation, MutationConfig, MutationIntent, MutationNotice, MutationState,
    NoticeHandle, PendingMutation,
};

/// Tracks every in-flight mutation and the optimistic edits it made.
///
/// A mutation settles exactly once: confirmed by its event, by a snapshot,
/// by its acknowledgement, or by timeout; or failed with its edits reverted.
pub struct OptimisticMutationQueue {
    writer: Arc<dyn WriteCollaborator>,
    completions: Sender<Completion>,
    config: MutationConfig,
    /// In-flight mutations, oldest first.
    pending: BTreeMap<LocalId, PendingMutation>,
    /// Terminal states of recently settled mutations.
    history: LruCache<LocalId, MutationState>,
    /// Rows that already settled an insert; none settles a second one.
    claimed: LruCache<EntityId, LocalId>,
    listeners: Vec<Sender<MutationNotice>>,
    next_local: u64,
}

impl OptimisticMutationQueue {
    pub(crate) fn new(
        writer: Arc<dyn WriteCollaborator>,
        completions: Sender<Completion>,
        config: MutationConfig,
    ) -> Self {
        let capacity = NonZeroUsize::new(config.history_size).unwrap_or(NonZeroUsize::MIN);
        Self {
            writer,
            completions,
            config,
            pending: BTreeMap::new(),
            history: LruCache::new(capacity),
            claimed: LruCache::new(capacity),
            listeners: Vec::new(),
            next_local: 1,
        }
    }

    /// Apply `intent` optimistically to every live key it touches and start
    /// the durable write.
    pub fn submit(
        &mut self,
        intent: MutationIntent,
        session: &SessionContext,
        store: &mut CacheStore,
        now: Instant,
        wall: Timestamp,
    ) -> Result<LocalId> {
        let user = session.current().ok_or(SyncError::NotSignedIn)?;
        let resolved = intent.resolve(&user)?;

        let local_id = LocalId(self.next_local);
        self.next_local += 1;

        let keys: Vec<CacheKey> = store
            .keys_for_topic(&resolved.scope)
            .into_iter()
            .filter(|key| key.kind == resolved.kind)
            .collect();

        let lookalikes: Vec<EntityId> = match &resolved.target {
            Some(_) => Vec::new(),
            None => {
                let mut ids: Vec<EntityId> = keys
                    .iter()
                    .flat_map(|key| {
                        store
                            .read(key)
                            .entities()
                            .filter(|e| !e.id.is_provisional() && e.fulfils(&resolved.fields))
                            .map(|e| e.id.clone())
                            .collect::<Vec<_>>()
                    })
                    .collect();
                ids.sort();
                ids.dedup();
                ids
            }
        };

        let undo: Vec<UndoToken> = match &resolved.target {
            None => {
                let provisional = local_id.provisional_entity_id();
                let mut payload = resolved.fields.clone();
                payload.insert("id".to_string(), Value::String(provisional.0.clone()));
                payload.insert(CREATED_AT_FIELD.to_string(), Value::from(wall.0));
                let entity = Entity::from_payload(provisional, Value::Object(payload), wall);

                store.batch(|store| {
                    keys.iter()
                        .map(|key| {
                            store.patch_optimistic(
                                key,
                                OptimisticPatch::Insert {
                                    local_id,
                                    entity: entity.clone(),
                                },
                            )
                        })
                        .collect()
                })
            }
            Some(target) => store.batch(|store| {
                keys.iter()
                    .map(|key| {
                        store.patch_optimistic(
                            key,
                            OptimisticPatch::Merge {
                                local_id,
                                entity_id: target.clone(),
                                fields: resolved.fields.clone(),
                            },
                        )
                    })
                    .collect()
            }),
        };

        self.pending.insert(
            local_id,
            PendingMutation {
                local_id,
                entity_kind: resolved.kind,
                scope: resolved.scope.clone(),
                intended: resolved.fields.clone(),
                target: resolved.target.clone(),
                submitted_at: now,
                state: MutationState::InFlight,
                entity_id: None,
                acked_at: None,
                undo,
                lookalikes,
            },
        );
        info!(
            local_id = %local_id,
            topic = %resolved.scope,
            keys = keys.len(),
            "Mutation submitted"
        );

        let reply = WriteReply::new(local_id, self.completions.clone());
        let fields = Value::Object(resolved.fields);
        match &resolved.target {
            None => self.writer.insert(resolved.kind, fields, reply),
            Some(target) => self.writer.update(resolved.kind, target, fields, reply),
        }
        Ok(local_id)
    }

    /// Handle the write collaborator's outcome.
    pub(crate) fn on_write(
        &mut self,
        local_id: LocalId,
        result: std::result::Result<WriteAck, WriteError>,
        store: &mut CacheStore,
        now: Instant,
    ) {
        let Some(mutation) = self.pending.get_mut(&local_id) else {
            debug!(local_id = %local_id, "Write outcome for settled mutation ignored");
            return;
        };

        match result {
            Err(error) => {
                warn!(local_id = %local_id, error = %error, "Mutation failed, reverting");
                self.fail(local_id, error, store);
            }
            Ok(ack) => {
                mutation.entity_id = Some(match &mutation.target {
                    Some(target) => target.clone(),
                    None => ack.entity_id,
                });
                mutation.acked_at = Some(now);
                debug!(local_id = %local_id, entity_id = ?mutation.entity_id, "Write acknowledged");

                if mutation.is_insert() && authoritative_present(mutation, store) {
                    self.confirm(local_id, store, Confirmation::Acknowledgement);
                }
            }
        }
    }

    /// Settle the oldest mutation `event` confirms, if any.
    ///
    /// `replay` marks an event every live key had already applied.
    pub(crate) fn match_event(
        &mut self,
        event: &ChangeEvent,
        replay: bool,
        store: &mut CacheStore,
    ) -> Option<LocalId> {
        let claimed = self.claimed.contains(&event.entity_id);
        let local_id = self
            .pending
            .values()
            .find(|m| {
                m.matches_event(event, replay)
                    && !(claimed && m.is_insert() && m.entity_id.is_none())
            })
            .map(|m| m.local_id)?;

        if let Some(mutation) = self.pending.get_mut(&local_id) {
            mutation.entity_id.get_or_insert_with(|| event.entity_id.clone());
        }
        self.confirm(local_id, store, Confirmation::Event);
        Some(local_id)
    }

    /// Settle mutations whose effect a fresh snapshot of `key` already shows.
    pub(crate) fn after_snapshot(
        &mut self,
        key: &CacheKey,
        items: &[Entity],
        store: &mut CacheStore,
    ) -> Vec<LocalId> {
        let mut claimed: Vec<EntityId> = Vec::new();
        let mut settled = Vec::new();

        for mutation in self.pending.values() {
            if mutation.entity_kind != key.kind || &mutation.scope != key.topic() {
                continue;
            }
            let found = items.iter().find(|entity| {
                !claimed.contains(&entity.id)
                    && match (&mutation.target, &mutation.entity_id) {
                        (None, Some(id)) => &entity.id == id,
                        (None, None) => {
                            !self.claimed.contains(&entity.id)
                                && mutation.may_be(&entity.id, &entity.payload)
                        }
                        (Some(target), _) => {
                            &entity.id == target && entity.fulfils(&mutation.intended)
                        }
                    }
            });
            if let Some(entity) = found {
                claimed.push(entity.id.clone());
                settled.push((mutation.local_id, entity.id.clone()));
            }
        }

        for (local_id, entity_id) in &settled {
            if let Some(mutation) = self.pending.get_mut(local_id) {
                mutation.entity_id.get_or_insert_with(|| entity_id.clone());
            }
            self.confirm(*local_id, store, Confirmation::Snapshot);
        }
        settled.into_iter().map(|(local_id, _)| local_id).collect()
    }

    /// Resolve mutations whose timers ran out.
    ///
    /// An acknowledged mutation with no event is kept under its real id; an
    /// unacknowledged one fails with [`WriteError::TimedOut`].
    pub(crate) fn tick(&mut self, now: Instant, store: &mut CacheStore) {
        let mut reconciled = Vec::new();
        let mut timed_out = Vec::new();
        for mutation in self.pending.values() {
            match mutation.acked_at {
                Some(acked) if now.duration_since(acked) >= self.config.confirm_timeout => {
                    reconciled.push(mutation.local_id);
                }
                None if now.duration_since(mutation.submitted_at) >= self.config.ack_timeout => {
                    timed_out.push(mutation.local_id);
                }
                _ => {}
            }
        }

        for local_id in reconciled {
            let Some(mutation) = self.pending.remove(&local_id) else {
                continue;
            };
            for token in &mutation.undo {
                match &mutation.entity_id {
                    Some(real) if mutation.is_insert() => {
                        store.promote(*token, real.clone());
                    }
                    _ => {
                        store.settle(*token);
                    }
                }
            }
            self.claim(&mutation);
            info!(local_id = %local_id, entity_id = ?mutation.entity_id, "Mutation reconciled by timeout");
            self.finish(local_id, MutationState::Confirmed);
            self.notify(MutationNotice::Confirmed {
                local_id,
                entity_id: mutation.entity_id,
                via: Confirmation::Timeout,
            });
        }

        for local_id in timed_out {
            warn!(local_id = %local_id, "Write acknowledgement timed out, reverting");
            self.fail(local_id, WriteError::TimedOut, store);
        }
    }

    /// State of a mutation, if it is in flight or recently settled.
    pub fn state(&mut self, local_id: LocalId) -> Option<MutationState> {
        match self.pending.get(&local_id) {
            Some(mutation) => Some(mutation.state),
            None => self.history.get(&local_id).copied(),
        }
    }

    pub fn get(&self, local_id: LocalId) -> Option<&PendingMutation> {
        self.pending.get(&local_id)
    }

    pub fn pending(&self) -> impl Iterator<Item = &PendingMutation> {
        self.pending.values()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Receive a notice for every settled mutation from now on.
    pub fn notices(&mut self) -> NoticeHandle {
        let (tx, rx) = unbounded();
        self.listeners.push(tx);
        NoticeHandle { receiver: rx }
    }

    // --- Internal ---

    fn confirm(&mut self, local_id: LocalId, store: &mut CacheStore, via: Confirmation) {
        let Some(mutation) = self.pending.remove(&local_id) else {
            return;
        };
        for token in &mutation.undo {
            store.supersede(*token);
        }
        self.claim(&mutation);
        info!(local_id = %local_id, entity_id = ?mutation.entity_id, via = ?via, "Mutation confirmed");
        self.finish(local_id, MutationState::Confirmed);
        self.notify(MutationNotice::Confirmed {
            local_id,
            entity_id: mutation.entity_id,
            via,
        });
    }

    fn fail(&mut self, local_id: LocalId, error: WriteError, store: &mut CacheStore) {
        let Some(mutation) = self.pending.remove(&local_id) else {
            return;
        };
        store.batch(|store| {
            for token in mutation.undo.iter().rev() {
                store.revert(*token);
            }
        });
        self.finish(local_id, MutationState::Failed);
        self.notify(MutationNotice::Failed { local_id, error });
    }

    fn claim(&mut self, mutation: &PendingMutation) {
        if let (true, Some(id)) = (mutation.is_insert(), &mutation.entity_id) {
            self.claimed.put(id.clone(), mutation.local_id);
        }
    }

    fn finish(&mut self, local_id: LocalId, state: MutationState) {
        self.history.put(local_id, state);
    }

    fn notify(&mut self, notice: MutationNotice) {
        self.listeners.retain(|tx| tx.send(notice.clone()).is_ok());
    }
}

/// True if every key the insert touched already holds its row as
/// authoritative data.
fn authoritative_present(mutation: &PendingMutation, store: &CacheStore) -> bool {
    let Some(id) = &mutation.entity_id else {
        return false;
    };
    let mut keys = mutation
        .undo
        .iter()
        .filter_map(|token| store.patch_key(*token))
        .peekable();
    if keys.peek().is_none() {
        return false;
    }
    keys.all(|key| {
        store
            .read(key)
            .get(id)
            .is_some_and(|item| item.origin == ItemOrigin::Authoritative)
    })
}
