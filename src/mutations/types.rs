//! Mutation intents, pending-mutation state and outcome notices.

use crate::cache::UndoToken;
use crate::error::{Result, SyncError, WriteError};
use crate::types::{ChangeEvent, EntityId, EntityKind, LocalId, Operation, Topic, UserIdentity};
use crossbeam_channel::Receiver;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::{Duration, Instant};

/// Longest chat message accepted for sending.
pub const MAX_MESSAGE_CHARS: usize = 10_000;

/// Configuration for optimistic mutations.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MutationConfig {
    /// After the write is acknowledged, how long to wait for its event.
    /// Default: 15s
    pub confirm_timeout: Duration,

    /// How long to wait for the write acknowledgement itself.
    /// Default: 30s
    pub ack_timeout: Duration,

    /// Settled mutations remembered for status queries.
    /// Default: 256
    pub history_size: usize,
}

impl Default for MutationConfig {
    fn default() -> Self {
        Self {
            confirm_timeout: Duration::from_secs(15),
            ack_timeout: Duration::from_secs(30),
            history_size: 256,
        }
    }
}

/// A user-initiated change.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MutationIntent {
    /// Post a chat message as the signed-in user.
    SendMessage { room_id: String, content: String },
    /// Mark one of the signed-in user's notifications as read.
    MarkNotificationRead { notification_id: EntityId },
    /// Insert an arbitrary row on a topic.
    Insert {
        scope: Topic,
        payload: Map<String, Value>,
    },
    /// Patch an arbitrary row on a topic.
    Update {
        scope: Topic,
        entity_id: EntityId,
        patch: Map<String, Value>,
    },
}

/// Intent with the session filled in.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct ResolvedIntent {
    pub kind: EntityKind,
    pub scope: Topic,
    /// Row being patched; `None` for inserts.
    pub target: Option<EntityId>,
    /// Fields the write sets.
    pub fields: Map<String, Value>,
}

impl MutationIntent {
    pub(crate) fn resolve(self, user: &UserIdentity) -> Result<ResolvedIntent> {
        match self {
            MutationIntent::SendMessage { room_id, content } => {
                if content.trim().is_empty() {
                    return Err(SyncError::InvalidMutation("empty message".to_string()));
                }
                if content.chars().count() > MAX_MESSAGE_CHARS {
                    return Err(SyncError::InvalidMutation(format!(
                        "message longer than {} characters",
                        MAX_MESSAGE_CHARS
                    )));
                }
                let mut fields = Map::new();
                fields.insert("room_id".to_string(), Value::String(room_id.clone()));
                fields.insert("sender_id".to_string(), Value::String(user.id.clone()));
                fields.insert("content".to_string(), Value::String(content));
                Ok(ResolvedIntent {
                    kind: EntityKind::Message,
                    scope: Topic::room(room_id),
                    target: None,
                    fields,
                })
            }
            MutationIntent::MarkNotificationRead { notification_id } => {
                let mut fields = Map::new();
                fields.insert("is_read".to_string(), Value::Bool(true));
                Ok(ResolvedIntent {
                    kind: EntityKind::Notification,
                    scope: user.notification_topic(),
                    target: Some(notification_id),
                    fields,
                })
            }
            MutationIntent::Insert { scope, mut payload } => {
                let kind = scope.entity_kind();
                payload
                    .entry(kind.scope_field())
                    .or_insert_with(|| Value::String(scope.id().to_string()));
                if kind == EntityKind::Message {
                    payload
                        .entry("sender_id")
                        .or_insert_with(|| Value::String(user.id.clone()));
                }
                Ok(ResolvedIntent {
                    kind,
                    scope,
                    target: None,
                    fields: payload,
                })
            }
            MutationIntent::Update {
                scope,
                entity_id,
                patch,
            } => {
                if patch.is_empty() {
                    return Err(SyncError::InvalidMutation("empty patch".to_string()));
                }
                Ok(ResolvedIntent {
                    kind: scope.entity_kind(),
                    scope,
                    target: Some(entity_id),
                    fields: patch,
                })
            }
        }
    }
}

/// Lifecycle of a pending mutation. `Confirmed` and `Failed` are terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationState {
    InFlight,
    Confirmed,
    Failed,
}

/// What settled a confirmed mutation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confirmation {
    /// Its change event arrived.
    Event,
    /// A snapshot already contained it.
    Snapshot,
    /// The acknowledged row was already cached.
    Acknowledgement,
    /// Acknowledged, but no event arrived in time.
    Timeout,
}

/// Outcome of one mutation, keyed by its local id.
#[derive(Clone, Debug, PartialEq)]
pub enum MutationNotice {
    Confirmed {
        local_id: LocalId,
        entity_id: Option<EntityId>,
        via: Confirmation,
    },
    Failed {
        local_id: LocalId,
        error: WriteError,
    },
}

impl MutationNotice {
    pub fn local_id(&self) -> LocalId {
        match self {
            MutationNotice::Confirmed { local_id, .. } | MutationNotice::Failed { local_id, .. } => {
                *local_id
            }
        }
    }
}

/// Handle to receive mutation notices.
pub struct NoticeHandle {
    /// Channel to receive notices.
    pub receiver: Receiver<MutationNotice>,
}

impl NoticeHandle {
    /// Try to receive a notice (non-blocking).
    pub fn try_recv(&self) -> std::result::Result<MutationNotice, crossbeam_channel::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Receive with timeout.
    pub fn recv_timeout(
        &self,
        timeout: Duration,
    ) -> std::result::Result<MutationNotice, crossbeam_channel::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Every notice received so far.
    pub fn drain(&self) -> Vec<MutationNotice> {
        self.receiver.try_iter().collect()
    }
}

/// A local mutation awaiting its outcome.
#[derive(Clone, Debug)]
pub struct PendingMutation {
    pub local_id: LocalId,
    pub entity_kind: EntityKind,
    pub scope: Topic,
    /// Fields the write sets.
    pub intended: Map<String, Value>,
    /// Row being patched; `None` for inserts.
    pub target: Option<EntityId>,
    pub submitted_at: Instant,
    pub state: MutationState,
    /// Real id, once known.
    pub entity_id: Option<EntityId>,
    pub acked_at: Option<Instant>,
    pub(crate) undo: Vec<UndoToken>,
    /// Rows that already carried the intended fields at submit time, so
    /// they can never be this insert's echo.
    pub(crate) lookalikes: Vec<EntityId>,
}

impl PendingMutation {
    pub fn is_insert(&self) -> bool {
        self.target.is_none()
    }

    /// True if `event` is the authoritative echo of this mutation.
    ///
    /// A `replay` (already applied earlier) only matches by acked id.
    pub(crate) fn matches_event(&self, event: &ChangeEvent, replay: bool) -> bool {
        if self.state != MutationState::InFlight
            || event.entity_kind != self.entity_kind
            || event.topic != self.scope
        {
            return false;
        }
        match &self.target {
            None => {
                event.operation == Operation::Insert
                    && match &self.entity_id {
                        Some(id) => id == &event.entity_id,
                        None => !replay && self.may_be(&event.entity_id, &event.payload),
                    }
            }
            Some(target) => {
                !replay
                    && event.operation != Operation::Delete
                    && target == &event.entity_id
                    && fulfils(&event.payload, &self.intended)
            }
        }
    }

    /// Content match for an unacknowledged insert.
    pub(crate) fn may_be(&self, id: &EntityId, payload: &Value) -> bool {
        !id.is_provisional() && !self.lookalikes.contains(id) && fulfils(payload, &self.intended)
    }
}

pub(crate) fn fulfils(payload: &Value, fields: &Map<String, Value>) -> bool {
    fields
        .iter()
        .all(|(name, value)| payload.get(name) == Some(value))
}
