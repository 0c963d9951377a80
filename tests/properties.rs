//! Property-based tests for merge convergence and subscription refcounts.

mod common;

use common::{message, message_row, notification_row, Harness, MockPush};
use livesync::{
    CacheKey, CacheStore, ChangeEvent, Connectivity, Entity, EntityId, EntryStatus, LocalId,
    MutationNotice, Operation, OptimisticPatch, Sequence, Snapshot, SubscriptionConfig,
    SubscriptionManager, Timestamp, Topic,
};
use proptest::prelude::*;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn room_key() -> CacheKey {
    CacheKey::room_messages("42")
}

/// One entity's server history: insert, `updates` edits, then maybe a delete.
#[derive(Clone, Debug)]
struct History {
    updates: usize,
    deleted: bool,
}

fn arb_histories() -> impl Strategy<Value = Vec<History>> {
    prop::collection::vec(
        (0usize..4, any::<bool>()).prop_map(|(updates, deleted)| History { updates, deleted }),
        1..6,
    )
}

/// Interleave the histories round-robin and number them in server order.
fn server_order(
    histories: &[History],
    topic: &Topic,
    prefix: &str,
    row: fn(&str, usize, usize) -> Value,
) -> Vec<ChangeEvent> {
    let mut streams: Vec<Vec<(usize, Option<usize>)>> = histories
        .iter()
        .enumerate()
        .map(|(entity, history)| {
            let mut ops = vec![(entity, Some(0))];
            ops.extend((1..=history.updates).map(|version| (entity, Some(version))));
            if history.deleted {
                ops.push((entity, None));
            }
            ops
        })
        .collect();
    for stream in streams.iter_mut() {
        stream.reverse();
    }

    let mut events = Vec::new();
    let mut seq = 0;
    while streams.iter().any(|s| !s.is_empty()) {
        for stream in streams.iter_mut() {
            let Some((entity, op)) = stream.pop() else {
                continue;
            };
            seq += 1;
            let id = format!("{}{}", prefix, entity);
            let topic = topic.clone();
            events.push(match op {
                Some(0) => ChangeEvent::insert(topic, id.as_str(), row(&id, entity, 0), seq),
                Some(version) => {
                    ChangeEvent::update(topic, id.as_str(), row(&id, entity, version), seq)
                }
                None => ChangeEvent::delete(topic, id.as_str(), seq),
            });
        }
    }
    events
}

fn row(id: &str, entity: usize, version: usize) -> Value {
    message_row(id, "42", "u2", &format!("v{}", version), entity as i64 + 1)
}

fn arb_delivery() -> impl Strategy<Value = (Vec<ChangeEvent>, Vec<ChangeEvent>)> {
    arb_histories().prop_flat_map(|histories| {
        let ordered = server_order(&histories, &Topic::room("42"), "m", row);
        (Just(ordered.clone()), Just(ordered).prop_shuffle())
    })
}

fn notification_version(id: &str, entity: usize, version: usize) -> Value {
    notification_row(id, "u1", "general", version % 2 == 1, entity as i64 + 1)
}

/// Window size, server order and a shuffled delivery of a notification feed.
fn arb_window_delivery() -> impl Strategy<Value = (usize, Vec<ChangeEvent>, Vec<ChangeEvent>)> {
    (1usize..4, arb_histories()).prop_flat_map(|(limit, histories)| {
        let ordered = server_order(&histories, &Topic::user("u1"), "n", notification_version);
        (Just(limit), Just(ordered.clone()), Just(ordered).prop_shuffle())
    })
}

/// What the server returns for the window after applying events up to `seq`.
fn window_at(ordered: &[ChangeEvent], seq: u64, limit: usize) -> Vec<Entity> {
    let mut live: HashMap<EntityId, Entity> = HashMap::new();
    for event in ordered.iter().filter(|e| e.server_seq.0 <= seq) {
        match event.operation {
            Operation::Delete => {
                live.remove(&event.entity_id);
            }
            _ => {
                live.insert(event.entity_id.clone(), event.to_entity(Timestamp(0)));
            }
        }
    }
    let mut rows: Vec<Entity> = live.into_values().collect();
    rows.sort_by(|a, b| (&b.created_at, &b.id).cmp(&(&a.created_at, &a.id)));
    rows.truncate(limit);
    rows
}

/// Run retry passes until every deferred update is applied or dropped.
fn settle_deferred(store: &mut CacheStore, key: &CacheKey) {
    for _ in 0..16 {
        if store.read(key).deferred_count() == 0 {
            break;
        }
        store.retry_deferred(key, Timestamp(0));
    }
}

fn loaded_store() -> CacheStore {
    let mut store = CacheStore::new();
    store.replace(&room_key(), Vec::new(), Sequence(0), Timestamp(0));
    store
}

fn apply_all(store: &mut CacheStore, events: &[ChangeEvent]) {
    for event in events {
        store.apply_change(&room_key(), event, Timestamp(0));
    }
}

// --- Merge ---

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    /// Any delivery order of the same events yields the in-order result.
    #[test]
    fn prop_out_of_order_delivery_converges((ordered, delivered) in arb_delivery()) {
        let mut expected = loaded_store();
        apply_all(&mut expected, &ordered);

        let mut actual = loaded_store();
        apply_all(&mut actual, &delivered);

        let expected = expected.read(&room_key());
        let actual = actual.read(&room_key());
        prop_assert_eq!(actual.items(), expected.items());
        prop_assert_eq!(actual.deferred_count(), 0);
    }

    /// A limited window either matches the in-order server window or goes
    /// stale, and the refetch it asks for converges with the journal replayed.
    #[test]
    fn prop_limited_window_converges_after_refetch(
        (limit, ordered, delivered) in arb_window_delivery(),
        cut in any::<prop::sample::Index>(),
    ) {
        let key = CacheKey::user_notifications("u1", limit);
        let head = ordered.len() as u64;
        let expected = window_at(&ordered, head, limit);

        let mut store = CacheStore::new();
        store.replace(&key, Vec::new(), Sequence(0), Timestamp(0));
        for event in &delivered {
            store.apply_change(&key, event, Timestamp(0));
        }
        settle_deferred(&mut store, &key);

        let entry = store.read(&key);
        prop_assert_eq!(entry.deferred_count(), 0);
        if entry.status() == EntryStatus::Stale {
            // The snapshot may predate events the feed already delivered.
            let at = cut.index(ordered.len() + 1) as u64;
            store.replace(&key, window_at(&ordered, at, limit), Sequence(at), Timestamp(0));
            settle_deferred(&mut store, &key);
            if store.read(&key).status() == EntryStatus::Stale {
                store.replace(&key, expected.clone(), Sequence(head), Timestamp(0));
            }
        }

        let entry = store.read(&key);
        prop_assert_eq!(entry.status(), EntryStatus::Fresh);
        prop_assert_eq!(entry.deferred_count(), 0);
        let actual: Vec<Entity> = entry.entities().cloned().collect();
        prop_assert_eq!(actual, expected);
    }

    /// Delivering every event a second time changes nothing.
    #[test]
    fn prop_replay_is_idempotent((_, delivered) in arb_delivery()) {
        let mut store = loaded_store();
        apply_all(&mut store, &delivered);
        let once = store.read(&room_key());

        apply_all(&mut store, &delivered);
        let twice = store.read(&room_key());

        prop_assert_eq!(&*once, &*twice);
    }

    /// An optimistic edit followed by its revert restores the entry.
    #[test]
    fn prop_patch_then_revert_restores(
        (_, delivered) in arb_delivery(),
        target in 0usize..6,
        fields in prop::collection::btree_map(
            prop::sample::select(vec!["content", "is_read", "extra", "sender_id"]),
            prop_oneof![Just(Value::Null), any::<bool>().prop_map(Value::Bool), "[a-z]{0,8}".prop_map(Value::String)],
            1..4,
        ),
    ) {
        let mut store = loaded_store();
        apply_all(&mut store, &delivered);
        let before = store.read(&room_key());

        let fields: Map<String, Value> =
            fields.into_iter().map(|(k, v)| (k.to_string(), v)).collect();
        let token = store.patch_optimistic(
            &room_key(),
            OptimisticPatch::Merge {
                local_id: LocalId(1),
                entity_id: format!("m{}", target).as_str().into(),
                fields,
            },
        );
        let insert = store.patch_optimistic(
            &room_key(),
            OptimisticPatch::Insert {
                local_id: LocalId(2),
                entity: Entity::from_payload(
                    "local:2".into(),
                    json!({"id": "local:2", "content": "draft"}),
                    Timestamp(100),
                ),
            },
        );

        prop_assert!(store.revert(insert));
        prop_assert!(store.revert(token));
        prop_assert_eq!(&*store.read(&room_key()), &*before);
        prop_assert_eq!(store.pending_patches(), 0);
    }
}

// --- Subscriptions ---

#[derive(Clone, Debug)]
enum FeedOp {
    Attach(usize),
    Detach(usize),
    Wait(u64),
}

fn arb_feed_ops() -> impl Strategy<Value = Vec<FeedOp>> {
    prop::collection::vec(
        prop_oneof![
            (0usize..3).prop_map(FeedOp::Attach),
            (0usize..8).prop_map(FeedOp::Detach),
            (0u64..4).prop_map(FeedOp::Wait),
        ],
        1..40,
    )
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    /// At most one push subscription per topic, and it lives exactly as
    /// long as the topic has consumers or is inside its grace period.
    #[test]
    fn prop_refcounts_track_consumers(ops in arb_feed_ops()) {
        let push = Arc::new(MockPush::default());
        let config = SubscriptionConfig::default();
        let grace = config.grace_period;
        let mut manager = SubscriptionManager::new(push.clone(), config);
        let topics = [Topic::room("1"), Topic::room("2"), Topic::user("u1")];

        let start = Instant::now();
        let mut now = start;
        let mut live = Vec::new();

        for op in ops {
            match op {
                FeedOp::Attach(i) => live.push(manager.attach(topics[i].clone())),
                FeedOp::Detach(i) if !live.is_empty() => {
                    let token = live.remove(i % live.len());
                    manager.detach(token, now);
                }
                FeedOp::Detach(_) => {}
                FeedOp::Wait(secs) => {
                    now += Duration::from_secs(secs);
                    manager.expire(now);
                }
            }

            let mut consumers: HashMap<Topic, usize> = HashMap::new();
            for token in &live {
                let topic = manager.topic_of(*token).cloned();
                prop_assert!(topic.is_some());
                if let Some(topic) = topic {
                    *consumers.entry(topic).or_default() += 1;
                }
            }
            for topic in &topics {
                let expected = consumers.get(topic).copied().unwrap_or(0);
                prop_assert_eq!(manager.ref_count(topic), expected);
                if expected > 0 {
                    prop_assert!(manager.is_open(topic));
                }
            }
            let subscribed: usize = topics.iter().map(|t| push.subscribe_count(t)).sum();
            prop_assert_eq!(subscribed - push.unsubscribe_count(), manager.subscription_count());
        }

        manager.expire(now + grace);
        let in_use = topics
            .iter()
            .filter(|t| manager.ref_count(t) > 0)
            .count();
        prop_assert_eq!(manager.subscription_count(), in_use);
    }
}

// --- Mutations ---

#[derive(Clone, Debug)]
enum Delivery {
    Ack,
    Event,
    Resync,
    Wait(u64),
}

fn arb_deliveries() -> impl Strategy<Value = Vec<Delivery>> {
    prop::collection::vec(
        prop_oneof![
            Just(Delivery::Ack),
            Just(Delivery::Event),
            Just(Delivery::Resync),
            prop::sample::select(vec![1u64, 5, 15, 30]).prop_map(Delivery::Wait),
        ],
        0..6,
    )
}

fn sent_event() -> ChangeEvent {
    ChangeEvent::insert(Topic::room("42"), "m1", message_row("m1", "42", "u1", "hi", 5), 1)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// However ack, event, snapshot and timers interleave, a send settles
    /// exactly once and leaves exactly one row behind.
    #[test]
    fn prop_send_settles_once(deliveries in arb_deliveries()) {
        let mut h = Harness::new();
        let notices = h.engine.notices();
        let view = h.engine.chat_view("42").unwrap();
        h.load(&room_key(), Snapshot::new(Vec::new(), 0));

        let local_id = h.engine.send_message("42", "hi").unwrap();

        for delivery in deliveries {
            match delivery {
                Delivery::Ack if h.write.count() > 0 => {
                    h.write.ack(0, "m1");
                    h.engine.pump();
                }
                Delivery::Ack => {}
                Delivery::Event => h.emit(sent_event()),
                Delivery::Resync => {
                    let topic = Topic::room("42");
                    h.push.set_connectivity(&topic, Connectivity::Disconnected);
                    h.push.set_connectivity(&topic, Connectivity::Connected);
                    h.engine.pump();
                    h.load(
                        &room_key(),
                        Snapshot::new(vec![message("m1", "42", "u1", "hi", 5)], 1),
                    );
                }
                Delivery::Wait(secs) => h.advance(Duration::from_secs(secs)),
            }
        }

        if h.write.count() > 0 {
            h.write.ack(0, "m1");
        }
        h.emit(sent_event());
        h.advance(Duration::from_secs(30));

        let settled: Vec<MutationNotice> = notices
            .drain()
            .into_iter()
            .filter(|n| n.local_id() == local_id)
            .collect();
        prop_assert_eq!(settled.len(), 1);

        let entry = h.engine.read_view(view).unwrap();
        let copies = entry
            .entities()
            .filter(|e| e.field("content") == Some(&json!("hi")))
            .count();
        prop_assert_eq!(copies, 1);
        prop_assert_eq!(entry.pending_count(), 0);
        prop_assert!(h.engine.pending_mutations().is_empty());
    }
}
