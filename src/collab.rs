//! Contracts of the external collaborators the sync layer drives.
//!
//! The query and write collaborators complete through reply handles rather
//! than return values, so an implementation may finish inline, on another
//! thread, or much later. Completions are queued and picked up by the
//! next [`SyncEngine::pump`](crate::SyncEngine::pump).

use crate::cache::CacheKey;
use crate::error::{TransportError, WriteError};
use crate::feed::EventSink;
use crate::types::{Entity, EntityId, EntityKind, LocalId, Sequence, Topic, UserIdentity};
use crossbeam_channel::Sender;
use parking_lot::RwLock;
use serde_json::Value;
use std::sync::Arc;

/// Result of a full query.
#[derive(Clone, Debug, PartialEq)]
pub struct Snapshot {
    /// Rows in the key's natural order.
    pub items: Vec<Entity>,
    /// Highest sequence of the topic reflected by these rows.
    pub seq: Sequence,
}

impl Snapshot {
    pub fn new(items: Vec<Entity>, seq: u64) -> Self {
        Self {
            items,
            seq: Sequence(seq),
        }
    }
}

/// Acknowledgement of a durable write.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WriteAck {
    pub entity_id: EntityId,
}

/// Completion handed back to the engine loop.
#[derive(Debug)]
pub(crate) enum Completion {
    Fetch {
        key: CacheKey,
        request_id: u64,
        result: Result<Snapshot, TransportError>,
    },
    Write {
        local_id: LocalId,
        result: Result<WriteAck, WriteError>,
    },
}

/// One-shot reply handle for a fetch.
#[derive(Debug)]
pub struct FetchReply {
    key: CacheKey,
    request_id: u64,
    tx: Sender<Completion>,
}

impl FetchReply {
    pub(crate) fn new(key: CacheKey, request_id: u64, tx: Sender<Completion>) -> Self {
        Self {
            key,
            request_id,
            tx,
        }
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// Deliver the result. Silently dropped if the engine is gone.
    pub fn complete(self, result: Result<Snapshot, TransportError>) {
        let _ = self.tx.send(Completion::Fetch {
            key: self.key,
            request_id: self.request_id,
            result,
        });
    }
}

/// One-shot reply handle for a write.
#[derive(Debug)]
pub struct WriteReply {
    local_id: LocalId,
    tx: Sender<Completion>,
}

impl WriteReply {
    pub(crate) fn new(local_id: LocalId, tx: Sender<Completion>) -> Self {
        Self { local_id, tx }
    }

    pub fn local_id(&self) -> LocalId {
        self.local_id
    }

    /// Deliver the result. Silently dropped if the engine is gone.
    pub fn complete(self, result: Result<WriteAck, WriteError>) {
        let _ = self.tx.send(Completion::Write {
            local_id: self.local_id,
            result,
        });
    }
}

/// Runs the initial and resync queries.
pub trait QueryCollaborator: Send + Sync {
    /// Fetch every row matching `reply.key()` in its natural order.
    fn fetch(&self, reply: FetchReply);
}

/// Performs durable writes.
pub trait WriteCollaborator: Send + Sync {
    fn insert(&self, kind: EntityKind, payload: Value, reply: WriteReply);

    fn update(&self, kind: EntityKind, id: &EntityId, patch: Value, reply: WriteReply);
}

/// Releases a push subscription.
pub trait Unsubscribe: Send {
    fn unsubscribe(&mut self);
}

impl<F> Unsubscribe for F
where
    F: FnMut() + Send,
{
    fn unsubscribe(&mut self) {
        self()
    }
}

/// The realtime provider.
pub trait PushCollaborator: Send + Sync {
    /// Start delivering changes of `topic` into `sink`.
    fn subscribe(&self, topic: &Topic, sink: EventSink) -> Box<dyn Unsubscribe>;
}

/// Reports who is signed in.
pub trait IdentityCollaborator: Send + Sync {
    fn current_user(&self) -> Option<UserIdentity>;
}

/// Read-only view of the signed-in user.
///
/// The identity is cached when the context is built and only changes on
/// [`SessionContext::refresh`], which hosts call on sign-in and sign-out.
#[derive(Clone)]
pub struct SessionContext {
    identity: Arc<dyn IdentityCollaborator>,
    current: Arc<RwLock<Option<UserIdentity>>>,
}

impl SessionContext {
    pub fn new(identity: Arc<dyn IdentityCollaborator>) -> Self {
        let current = identity.current_user();
        Self {
            identity,
            current: Arc::new(RwLock::new(current)),
        }
    }

    /// Re-read the identity collaborator. Returns the new identity.
    pub fn refresh(&self) -> Option<UserIdentity> {
        let user = self.identity.current_user();
        *self.current.write() = user.clone();
        user
    }

    pub fn current(&self) -> Option<UserIdentity> {
        self.current.read().clone()
    }

    pub fn user_id(&self) -> Option<String> {
        self.current.read().as_ref().map(|u| u.id.clone())
    }
}

impl std::fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionContext")
            .field("current", &*self.current.read())
            .finish()
    }
}
