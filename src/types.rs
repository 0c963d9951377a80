//! Core types for the sync layer.

use crate::error::SyncError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

/// Payload field holding an entity's creation time (microseconds).
pub const CREATED_AT_FIELD: &str = "created_at";

/// Position in a topic's change stream, assigned by the origin store.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Sequence(pub u64);

impl fmt::Debug for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Seq({})", self.0)
    }
}

impl fmt::Display for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Sequence {
    pub fn next(self) -> Self {
        Sequence(self.0 + 1)
    }
}

/// Microseconds since Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current wall-clock time.
    pub fn now() -> Self {
        let micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as i64)
            .unwrap_or_default();
        Timestamp(micros)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

/// Identifier of a stored entity (message or notification row).
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityId(pub String);

impl EntityId {
    pub fn new(id: impl Into<String>) -> Self {
        EntityId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True for provisional ids handed out to optimistic entities.
    pub fn is_provisional(&self) -> bool {
        self.0.starts_with(LocalId::PREFIX)
    }
}

impl fmt::Debug for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntityId({})", self.0)
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityId {
    fn from(s: &str) -> Self {
        EntityId(s.to_string())
    }
}

impl From<String> for EntityId {
    fn from(s: String) -> Self {
        EntityId(s)
    }
}

/// Client-side identifier of a submitted mutation.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LocalId(pub u64);

impl LocalId {
    const PREFIX: &'static str = "local:";

    /// Temporary entity id used by the optimistic representation.
    pub fn provisional_entity_id(self) -> EntityId {
        EntityId(format!("{}{}", Self::PREFIX, self.0))
    }
}

impl fmt::Debug for LocalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LocalId({})", self.0)
    }
}

impl fmt::Display for LocalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", Self::PREFIX, self.0)
    }
}

/// A change stream: a chat room or one user's notification feed.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Topic {
    Room(String),
    User(String),
}

impl Topic {
    pub fn room(room_id: impl Into<String>) -> Self {
        Topic::Room(room_id.into())
    }

    pub fn user(user_id: impl Into<String>) -> Self {
        Topic::User(user_id.into())
    }

    /// The room or user id this topic is scoped to.
    pub fn id(&self) -> &str {
        match self {
            Topic::Room(id) | Topic::User(id) => id,
        }
    }

    /// Entity kind carried by this topic.
    pub fn entity_kind(&self) -> EntityKind {
        match self {
            Topic::Room(_) => EntityKind::Message,
            Topic::User(_) => EntityKind::Notification,
        }
    }
}

impl fmt::Debug for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Topic({})", self)
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Topic::Room(id) => write!(f, "room:{}", id),
            Topic::User(id) => write!(f, "user:{}", id),
        }
    }
}

impl FromStr for Topic {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (prefix, id) = s
            .split_once(':')
            .ok_or_else(|| SyncError::InvalidTopic(s.to_string()))?;
        if id.is_empty() {
            return Err(SyncError::InvalidTopic(s.to_string()));
        }
        match prefix {
            "room" => Ok(Topic::Room(id.to_string())),
            "user" => Ok(Topic::User(id.to_string())),
            _ => Err(SyncError::InvalidTopic(s.to_string())),
        }
    }
}

impl TryFrom<String> for Topic {
    type Error = SyncError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Topic> for String {
    fn from(topic: Topic) -> Self {
        topic.to_string()
    }
}

/// What kind of row an entity is.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Message,
    Notification,
}

impl EntityKind {
    /// Table name in the origin store.
    pub fn resource(self) -> &'static str {
        match self {
            EntityKind::Message => "messages",
            EntityKind::Notification => "notifications",
        }
    }

    /// Payload field that scopes rows of this kind to a topic.
    pub fn scope_field(self) -> &'static str {
        match self {
            EntityKind::Message => "room_id",
            EntityKind::Notification => "user_id",
        }
    }
}

/// Kind of change carried by an event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Operation {
    Insert,
    Update,
    Delete,
}

/// A cached row.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: EntityId,
    pub created_at: Timestamp,
    /// Full row as a JSON object.
    pub payload: Value,
}

impl Entity {
    /// Build an entity from a row, reading `created_at` from the payload.
    pub fn from_payload(id: EntityId, payload: Value, fallback: Timestamp) -> Self {
        let created_at = payload
            .get(CREATED_AT_FIELD)
            .and_then(Value::as_i64)
            .map(Timestamp)
            .unwrap_or(fallback);
        Self {
            id,
            created_at,
            payload,
        }
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.payload.get(name)
    }

    /// True if every field of `fields` has the same value in this entity.
    pub fn fulfils(&self, fields: &serde_json::Map<String, Value>) -> bool {
        fields
            .iter()
            .all(|(name, value)| self.payload.get(name) == Some(value))
    }
}

/// A single change pushed by the origin store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub topic: Topic,
    pub operation: Operation,
    pub entity_kind: EntityKind,
    pub entity_id: EntityId,
    /// New row for inserts and updates; may be `Null` for deletes.
    pub payload: Value,
    pub server_seq: Sequence,
}

impl ChangeEvent {
    pub fn new(
        topic: Topic,
        operation: Operation,
        entity_id: impl Into<EntityId>,
        payload: Value,
        server_seq: u64,
    ) -> Self {
        let entity_kind = topic.entity_kind();
        Self {
            topic,
            operation,
            entity_kind,
            entity_id: entity_id.into(),
            payload,
            server_seq: Sequence(server_seq),
        }
    }

    pub fn insert(topic: Topic, id: impl Into<EntityId>, payload: Value, seq: u64) -> Self {
        Self::new(topic, Operation::Insert, id, payload, seq)
    }

    pub fn update(topic: Topic, id: impl Into<EntityId>, payload: Value, seq: u64) -> Self {
        Self::new(topic, Operation::Update, id, payload, seq)
    }

    pub fn delete(topic: Topic, id: impl Into<EntityId>, seq: u64) -> Self {
        Self::new(topic, Operation::Delete, id, Value::Null, seq)
    }

    /// The entity this event describes.
    pub fn to_entity(&self, fallback: Timestamp) -> Entity {
        Entity::from_payload(self.entity_id.clone(), self.payload.clone(), fallback)
    }
}

/// Role of a signed-in user.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    Teacher,
    Student,
}

/// The signed-in user, as reported by the identity collaborator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserIdentity {
    pub id: String,
    pub role: Role,
}

impl UserIdentity {
    pub fn new(id: impl Into<String>, role: Role) -> Self {
        Self {
            id: id.into(),
            role,
        }
    }

    /// Topic of this user's notification feed.
    pub fn notification_topic(&self) -> Topic {
        Topic::user(self.id.clone())
    }
}
