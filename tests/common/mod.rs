//! In-memory collaborators shared by the integration tests.

#![allow(dead_code)]

use livesync::{
    CacheKey, ChangeEvent, Collaborators, Connectivity, EntityId, EntityKind, EventSink,
    FetchReply, IdentityCollaborator, ManualClock, PushCollaborator, QueryCollaborator, Role,
    Snapshot, SyncConfig, SyncEngine, Timestamp, Topic, TransportError, Unsubscribe,
    UserIdentity, WriteAck, WriteCollaborator, WriteError, WriteReply,
};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

// --- Query ---

/// Holds fetches until the test answers them.
#[derive(Default)]
pub struct MockQuery {
    held: Mutex<Vec<FetchReply>>,
    calls: Mutex<HashMap<CacheKey, usize>>,
}

impl MockQuery {
    pub fn fetch_count(&self, key: &CacheKey) -> usize {
        self.calls.lock().get(key).copied().unwrap_or(0)
    }

    pub fn pending(&self) -> usize {
        self.held.lock().len()
    }

    /// Answer the oldest held fetch of `key`. Returns false if none is held.
    pub fn respond(&self, key: &CacheKey, result: Result<Snapshot, TransportError>) -> bool {
        let reply = {
            let mut held = self.held.lock();
            match held.iter().position(|r| r.key() == key) {
                Some(pos) => held.remove(pos),
                None => return false,
            }
        };
        reply.complete(result);
        true
    }
}

impl QueryCollaborator for MockQuery {
    fn fetch(&self, reply: FetchReply) {
        *self.calls.lock().entry(reply.key().clone()).or_default() += 1;
        self.held.lock().push(reply);
    }
}

// --- Write ---

pub struct HeldWrite {
    pub kind: EntityKind,
    pub target: Option<EntityId>,
    pub payload: Value,
    pub reply: WriteReply,
}

#[derive(Default)]
pub struct MockWrite {
    held: Mutex<Vec<HeldWrite>>,
}

impl MockWrite {
    pub fn count(&self) -> usize {
        self.held.lock().len()
    }

    pub fn payload(&self, index: usize) -> Value {
        self.held.lock()[index].payload.clone()
    }

    /// Complete the held write at `index` (in submission order of the
    /// writes still held).
    pub fn complete(&self, index: usize, result: Result<WriteAck, WriteError>) {
        let write = self.held.lock().remove(index);
        write.reply.complete(result);
    }

    pub fn ack(&self, index: usize, entity_id: &str) {
        self.complete(
            index,
            Ok(WriteAck {
                entity_id: entity_id.into(),
            }),
        );
    }
}

impl WriteCollaborator for MockWrite {
    fn insert(&self, kind: EntityKind, payload: Value, reply: WriteReply) {
        self.held.lock().push(HeldWrite {
            kind,
            target: None,
            payload,
            reply,
        });
    }

    fn update(&self, kind: EntityKind, id: &EntityId, patch: Value, reply: WriteReply) {
        self.held.lock().push(HeldWrite {
            kind,
            target: Some(id.clone()),
            payload: patch,
            reply,
        });
    }
}

// --- Push ---

#[derive(Default)]
pub struct MockPush {
    sinks: Mutex<HashMap<Topic, EventSink>>,
    subscribes: Mutex<HashMap<Topic, usize>>,
    unsubscribes: Arc<AtomicUsize>,
}

impl MockPush {
    pub fn subscribe_count(&self, topic: &Topic) -> usize {
        self.subscribes.lock().get(topic).copied().unwrap_or(0)
    }

    pub fn unsubscribe_count(&self) -> usize {
        self.unsubscribes.load(Ordering::SeqCst)
    }

    /// Deliver an event on its topic's live sink.
    pub fn emit(&self, event: ChangeEvent) -> bool {
        let sink = self.sinks.lock().get(&event.topic).cloned();
        sink.is_some_and(|sink| sink.send(event))
    }

    pub fn set_connectivity(&self, topic: &Topic, state: Connectivity) -> bool {
        let sink = self.sinks.lock().get(topic).cloned();
        sink.is_some_and(|sink| sink.connectivity(state))
    }
}

impl PushCollaborator for MockPush {
    fn subscribe(&self, topic: &Topic, sink: EventSink) -> Box<dyn Unsubscribe> {
        *self.subscribes.lock().entry(topic.clone()).or_default() += 1;
        self.sinks.lock().insert(topic.clone(), sink);
        let unsubscribes = Arc::clone(&self.unsubscribes);
        Box::new(move || {
            unsubscribes.fetch_add(1, Ordering::SeqCst);
        })
    }
}

// --- Identity ---

pub struct MockIdentity(pub Mutex<Option<UserIdentity>>);

impl MockIdentity {
    pub fn signed_in(id: &str, role: Role) -> Self {
        Self(Mutex::new(Some(UserIdentity::new(id, role))))
    }

    pub fn set(&self, user: Option<UserIdentity>) {
        *self.0.lock() = user;
    }
}

impl IdentityCollaborator for MockIdentity {
    fn current_user(&self) -> Option<UserIdentity> {
        self.0.lock().clone()
    }
}

// --- Harness ---

pub struct Harness {
    pub engine: SyncEngine,
    pub clock: Arc<ManualClock>,
    pub query: Arc<MockQuery>,
    pub write: Arc<MockWrite>,
    pub push: Arc<MockPush>,
    pub identity: Arc<MockIdentity>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(SyncConfig::default())
    }

    pub fn with_config(config: SyncConfig) -> Self {
        Self::build(config, MockIdentity::signed_in("u1", Role::Student))
    }

    pub fn signed_out() -> Self {
        Self::build(SyncConfig::default(), MockIdentity(Mutex::new(None)))
    }

    fn build(config: SyncConfig, identity: MockIdentity) -> Self {
        init_tracing();
        let clock = Arc::new(ManualClock::new(Timestamp(1_700_000_000_000_000)));
        let query = Arc::new(MockQuery::default());
        let write = Arc::new(MockWrite::default());
        let push = Arc::new(MockPush::default());
        let identity = Arc::new(identity);
        let engine = SyncEngine::with_clock(
            Collaborators {
                query: query.clone(),
                write: write.clone(),
                push: push.clone(),
                identity: identity.clone(),
            },
            config,
            clock.clone(),
        );
        Self {
            engine,
            clock,
            query,
            write,
            push,
            identity,
        }
    }

    pub fn advance(&mut self, by: Duration) {
        self.clock.advance(by);
        self.engine.pump();
    }

    /// Answer the held fetch of `key` and pump it in.
    pub fn load(&mut self, key: &CacheKey, snapshot: Snapshot) {
        assert!(self.query.respond(key, Ok(snapshot)), "no fetch held for {:?}", key);
        self.engine.pump();
    }

    pub fn emit(&mut self, event: ChangeEvent) {
        assert!(self.push.emit(event), "event not accepted");
        self.engine.pump();
    }
}

// --- Rows ---

pub fn message_row(id: &str, room: &str, sender: &str, content: &str, at: i64) -> Value {
    serde_json::json!({
        "id": id,
        "room_id": room,
        "sender_id": sender,
        "content": content,
        "created_at": at,
    })
}

pub fn message(id: &str, room: &str, sender: &str, content: &str, at: i64) -> livesync::Entity {
    livesync::Entity::from_payload(
        id.into(),
        message_row(id, room, sender, content, at),
        Timestamp(at),
    )
}

pub fn notification_row(id: &str, user: &str, kind: &str, read: bool, at: i64) -> Value {
    serde_json::json!({
        "id": id,
        "user_id": user,
        "title": format!("title {}", id),
        "message": format!("body {}", id),
        "type": kind,
        "is_read": read,
        "created_at": at,
    })
}

pub fn notification(id: &str, user: &str, kind: &str, read: bool, at: i64) -> livesync::Entity {
    livesync::Entity::from_payload(
        id.into(),
        notification_row(id, user, kind, read, at),
        Timestamp(at),
    )
}
