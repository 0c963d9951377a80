//! Typed projections of cached rows for chat and notification UIs.

use crate::cache::{CacheEntry, CachedItem, ItemOrigin};
use crate::types::{Entity, EntityId, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One chat message as a UI renders it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageView {
    pub id: EntityId,
    pub room_id: String,
    pub sender_id: String,
    /// Sender's display name when the row embeds the profile.
    pub sender_name: Option<String>,
    pub content: String,
    pub created_at: Timestamp,
    /// Local send not yet confirmed.
    pub pending: bool,
    /// Authored by the signed-in user.
    pub is_own: bool,
}

impl MessageView {
    /// `me` is the cached session user id.
    pub fn from_item(item: &CachedItem, me: Option<&str>) -> Self {
        let entity = &item.entity;
        let sender_id = text(entity, "sender_id");
        let is_own = me.is_some_and(|me| !sender_id.is_empty() && me == sender_id);
        Self {
            id: entity.id.clone(),
            room_id: text(entity, "room_id"),
            sender_name: entity
                .field("profiles")
                .and_then(|p| p.get("name"))
                .and_then(Value::as_str)
                .map(str::to_string),
            sender_id,
            content: text(entity, "content"),
            created_at: entity.created_at,
            pending: matches!(item.origin, ItemOrigin::Optimistic(_)),
            is_own,
        }
    }
}

/// Messages of an entry, in its order.
pub fn messages(entry: &CacheEntry, me: Option<&str>) -> Vec<MessageView> {
    entry
        .items()
        .iter()
        .map(|item| MessageView::from_item(item, me))
        .collect()
}

/// Category of a notification.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationType {
    Announcement,
    Grade,
    Assignment,
    Deadline,
    Attendance,
    #[default]
    General,
}

impl NotificationType {
    /// Unknown categories read as `General`.
    pub fn parse(raw: &str) -> Self {
        match raw {
            "announcement" => NotificationType::Announcement,
            "grade" => NotificationType::Grade,
            "assignment" => NotificationType::Assignment,
            "deadline" => NotificationType::Deadline,
            "attendance" => NotificationType::Attendance,
            _ => NotificationType::General,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationView {
    pub id: EntityId,
    pub user_id: String,
    pub title: String,
    pub message: String,
    pub kind: NotificationType,
    pub link: Option<String>,
    pub is_read: bool,
    pub created_at: Timestamp,
}

impl NotificationView {
    pub fn from_item(item: &CachedItem) -> Self {
        let entity = &item.entity;
        Self {
            id: entity.id.clone(),
            user_id: text(entity, "user_id"),
            title: text(entity, "title"),
            message: text(entity, "message"),
            kind: NotificationType::parse(&text(entity, "type")),
            link: entity
                .field("link")
                .and_then(Value::as_str)
                .map(str::to_string),
            // A null flag counts as unread.
            is_read: entity
                .field("is_read")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            created_at: entity.created_at,
        }
    }
}

/// What the notification centre shows.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationFeedSummary {
    /// Newest first.
    pub items: Vec<NotificationView>,
    pub unread_count: usize,
}

impl NotificationFeedSummary {
    pub fn from_entry(entry: &CacheEntry) -> Self {
        let items: Vec<NotificationView> =
            entry.items().iter().map(NotificationView::from_item).collect();
        let unread_count = items.iter().filter(|n| !n.is_read).count();
        Self {
            items,
            unread_count,
        }
    }
}

fn text(entity: &Entity, field: &str) -> String {
    entity
        .field(field)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheKey;
    use crate::types::{LocalId, Sequence};
    use serde_json::json;

    fn item(payload: Value, origin: ItemOrigin) -> CachedItem {
        let id = payload["id"].as_str().unwrap_or("x").to_string();
        CachedItem {
            entity: Entity::from_payload(id.into(), payload, Timestamp(0)),
            origin,
        }
    }

    #[test]
    fn test_message_authorship_uses_session_id() {
        let row = item(
            json!({"id": "m1", "room_id": "42", "sender_id": "u1", "content": "hi",
                   "profiles": {"name": "Ada"}}),
            ItemOrigin::Authoritative,
        );

        let mine = MessageView::from_item(&row, Some("u1"));
        assert!(mine.is_own);
        assert_eq!(mine.sender_name.as_deref(), Some("Ada"));

        assert!(!MessageView::from_item(&row, Some("u2")).is_own);
        assert!(!MessageView::from_item(&row, None).is_own);
    }

    #[test]
    fn test_optimistic_message_is_pending() {
        let row = item(
            json!({"id": "local:1", "sender_id": "u1", "content": "hi"}),
            ItemOrigin::Optimistic(LocalId(1)),
        );
        let view = MessageView::from_item(&row, Some("u1"));
        assert!(view.pending);
        assert!(view.sender_name.is_none());
    }

    #[test]
    fn test_unread_count() {
        let mut entry = CacheEntry::loading(CacheKey::user_notifications("u1", 10));
        entry.replace(
            vec![
                Entity::from_payload(
                    "n1".into(),
                    json!({"id": "n1", "type": "grade", "is_read": false, "created_at": 2}),
                    Timestamp(0),
                ),
                Entity::from_payload(
                    "n2".into(),
                    json!({"id": "n2", "type": "deadline", "is_read": true, "created_at": 1}),
                    Timestamp(0),
                ),
                Entity::from_payload(
                    "n3".into(),
                    json!({"id": "n3", "type": "party", "is_read": null, "created_at": 3}),
                    Timestamp(0),
                ),
            ],
            Sequence(3),
            Timestamp(0),
            Default::default(),
        );

        let summary = NotificationFeedSummary::from_entry(&entry);
        assert_eq!(summary.unread_count, 2);
        let ids: Vec<&str> = summary.items.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec!["n3", "n1", "n2"]);
        assert_eq!(summary.items[0].kind, NotificationType::General);
        assert_eq!(summary.items[2].kind, NotificationType::Deadline);
    }
}
