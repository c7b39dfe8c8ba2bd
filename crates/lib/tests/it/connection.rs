//! Connection lifecycle against the in-memory bridge.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use serde_json::json;

use scopesync::{
    ConnectionRegistry, MirrorConfig, apply_patches,
    connection::{ConnectionError, ConnectionState, MemoryBridge},
    mirror::{ChangeSet, MirrorObserver, Origin},
    model::{Collection, Node},
    patch::Patch,
};

use crate::helpers::{SHAPE, acquire_people, attached_registry, person, text_at, wait_until};

fn alice_bridge() -> Arc<MemoryBridge> {
    let bridge = Arc::new(MemoryBridge::new());
    bridge.set_snapshot(
        SHAPE,
        json!([{"@graph": "g1", "@id": "s1", "name": "Alice", "tags": ["a"]}]),
    );
    bridge
}

fn delayed(release_delay_ms: u64) -> MirrorConfig {
    MirrorConfig {
        release_delay_ms,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_ready_after_initial_snapshot() {
    let bridge = alice_bridge();
    let registry = attached_registry(&bridge, MirrorConfig::default());

    let handle = acquire_people(&registry, &["g1"]);
    handle.ready().await.unwrap();

    assert_eq!(handle.state(), ConnectionState::Ready { subscription: 1 });
    assert_eq!(
        handle.read(|mirror| text_at(mirror.root(), &["g1|s1", "name"])),
        Some("Alice".to_string())
    );
    assert_eq!(
        handle.snapshot(),
        json!([{"@graph": "g1", "@id": "s1", "name": "Alice", "tags": ["a"]}])
    );
}

#[tokio::test]
async fn test_subscribes_once_a_session_is_attached() {
    let bridge = alice_bridge();
    let registry = ConnectionRegistry::new(MirrorConfig::default());

    let handle = acquire_people(&registry, &["g1"]);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(handle.state(), ConnectionState::Subscribing);
    assert_eq!(bridge.subscribe_calls(), 0);

    registry.attach(bridge.clone(), 7);
    handle.ready().await.unwrap();
    assert_eq!(bridge.subscribe_calls(), 1);
}

#[tokio::test]
async fn test_equal_scopes_share_one_connection() {
    let bridge = alice_bridge();
    let registry = attached_registry(&bridge, MirrorConfig::default());

    let first = acquire_people(&registry, &["g2", "g1"]);
    let second = acquire_people(&registry, &["g1", "g2"]);
    assert_eq!(first.key(), second.key());
    assert_eq!(first.key().as_str(), "Person::g1,g2");
    assert_eq!(registry.len(), 1);
    assert_eq!(registry.ref_count(first.key()), Some(2));

    let third = second.clone();
    assert_eq!(registry.ref_count(first.key()), Some(3));
    drop(third);
    assert_eq!(registry.ref_count(first.key()), Some(2));

    first.ready().await.unwrap();
    second.ready().await.unwrap();
    assert_eq!(bridge.subscribe_calls(), 1);

    first
        .edit(|editor| editor.set(&["g1|s1", "name"], "Alicia"))
        .unwrap();
    assert_eq!(
        second.read(|mirror| text_at(mirror.root(), &["g1|s1", "name"])),
        Some("Alicia".to_string())
    );
}

#[tokio::test]
async fn test_reacquire_within_delay_keeps_subscription() {
    let bridge = alice_bridge();
    let registry = attached_registry(&bridge, delayed(200));

    let handle = acquire_people(&registry, &["g1"]);
    handle.ready().await.unwrap();
    let key = handle.key().clone();

    drop(handle);
    assert!(registry.contains(&key));
    assert_eq!(registry.ref_count(&key), Some(0));

    let again = acquire_people(&registry, &["g1"]);
    assert_eq!(registry.ref_count(&key), Some(1));

    // Past the first teardown deadline
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(registry.contains(&key));
    assert!(again.is_ready());
    assert_eq!(bridge.subscribe_calls(), 1);

    drop(again);
    wait_until("the connection is torn down", || !registry.contains(&key)).await;
    wait_until("the subscription is closed", || bridge.open_subscriptions() == 0).await;
}

#[tokio::test]
async fn test_immediate_release_resubscribes() {
    let bridge = alice_bridge();
    let registry = attached_registry(&bridge, MirrorConfig::immediate_release());

    let handle = acquire_people(&registry, &["g1"]);
    handle.ready().await.unwrap();
    drop(handle);
    assert!(registry.is_empty());

    let again = acquire_people(&registry, &["g1"]);
    again.ready().await.unwrap();
    assert_eq!(bridge.subscribe_calls(), 2);
    assert_eq!(bridge.subscription_ids().last(), Some(&2));
}

#[tokio::test]
async fn test_rejected_subscription_fails_readiness() {
    let bridge = alice_bridge();
    bridge.fail_subscriptions(Some("denied"));
    let registry = attached_registry(&bridge, MirrorConfig::default());

    let handle = acquire_people(&registry, &["g1"]);
    let err = handle.ready().await.unwrap_err();

    assert!(err.is_readiness_error());
    assert!(matches!(err, ConnectionError::SubscriptionFailed { .. }));
    assert_eq!(err.key(), Some("Person::g1"));
    assert!(matches!(handle.state(), ConnectionState::Failed(_)));

    let err: scopesync::Error = err.into();
    assert!(err.is_readiness_error());
}

#[tokio::test]
async fn test_unusable_snapshot_fails_readiness() {
    let bridge = Arc::new(MemoryBridge::new());
    bridge.set_snapshot(SHAPE, json!("not a collection"));
    let registry = attached_registry(&bridge, MirrorConfig::default());

    let handle = acquire_people(&registry, &["g1"]);
    let err = handle.ready().await.unwrap_err();
    assert!(matches!(err, ConnectionError::InvalidSnapshot { .. }));
}

#[derive(Default)]
struct Origins(Mutex<Vec<Origin>>);

impl MirrorObserver for Origins {
    fn on_change(&self, changes: &ChangeSet) {
        self.0.lock().unwrap().push(changes.origin);
    }
}

#[tokio::test]
async fn test_inbound_updates_are_applied_and_not_echoed() {
    let bridge = alice_bridge();
    let registry = attached_registry(&bridge, MirrorConfig::default());
    let handle = acquire_people(&registry, &["g1"]);
    handle.ready().await.unwrap();

    let origins = Arc::new(Origins::default());
    handle.observe(origins.clone());

    let reached = bridge.push_update(
        SHAPE,
        vec![
            Patch::literal("/g1|s1/name", "Alicia"),
            Patch::set_add("/g1|s1/tags", ["b"]),
        ],
    );
    assert_eq!(reached, 1);
    wait_until("the update is applied", || {
        handle.read(|mirror| text_at(mirror.root(), &["g1|s1", "name"])) == Some("Alicia".to_string())
    })
    .await;

    let raw = json!({"update": {"patches": [{"op": "add", "path": "/g1|s1/age", "value": 30}]}});
    assert_eq!(bridge.push_raw(SHAPE, raw), 1);
    assert_eq!(bridge.push_raw(SHAPE, json!({"bogus": true})), 0);
    wait_until("the raw update is applied", || {
        handle.read(|mirror| mirror.get(&["g1|s1", "age"]).is_some())
    })
    .await;

    handle.flush().await.unwrap();
    assert!(bridge.sent().is_empty());
    assert_eq!(*origins.0.lock().unwrap(), [Origin::Remote, Origin::Remote]);
}

#[tokio::test]
async fn test_local_edits_wait_for_readiness_and_keep_order() {
    let bridge = Arc::new(MemoryBridge::new());
    // The backend knows another member, and an older copy of the one created below
    bridge.set_snapshot(
        SHAPE,
        json!([
            {"@graph": "g1", "@id": "s0", "name": "Carol"},
            {"@graph": "g1", "@id": "s1", "name": "Stale"}
        ]),
    );
    bridge.hold_initial(true);
    let registry = attached_registry(&bridge, MirrorConfig::default());
    let handle = acquire_people(&registry, &["g1"]);

    handle
        .edit(|editor| editor.insert_root(person("g1", "s1", "Alice")))
        .unwrap();
    handle
        .edit(|editor| editor.set(&["g1|s1", "age"], 30i64))
        .unwrap();

    wait_until("the subscription is open", || bridge.open_subscriptions() == 1).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!handle.is_ready());
    assert!(bridge.sent().is_empty());

    assert_eq!(bridge.release_initial(), 1);
    handle.ready().await.unwrap();
    handle.flush().await.unwrap();

    let sent = bridge.sent();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].subscription, 1);
    assert_eq!(sent[0].shape, SHAPE);
    assert_eq!(sent[0].patches[0], Patch::object_add("/g1|s1"));
    assert_eq!(sent[0].patches.len(), 4);
    assert_eq!(sent[1].patches, [Patch::literal("/g1|s1/age", 30i64)]);

    // The snapshot merged in without dropping the edits that were sent
    let (local, carol) = handle.read(|mirror| {
        (
            mirror.get(&["g1|s1"]).cloned(),
            text_at(mirror.root(), &["g1|s0", "name"]),
        )
    });
    assert_eq!(carol.as_deref(), Some("Carol"));
    let local = local.expect("locally created member is kept");
    assert_eq!(local.lookup(&["name"]).and_then(Node::as_text), Some("Alice"));
    assert_eq!(local.lookup(&["age"]), Some(&Node::from(30i64)));

    // Replaying what was sent reproduces the mirrored member
    let mut replica = Node::Collection(Collection::new());
    for batch in &sent {
        assert!(apply_patches(&mut replica, &batch.patches, false).is_clean());
    }
    assert_eq!(replica.lookup(&["g1|s1"]), Some(&local));
}

#[tokio::test]
async fn test_transaction_sends_one_batch() {
    let bridge = alice_bridge();
    let registry = attached_registry(&bridge, MirrorConfig::default());
    let handle = acquire_people(&registry, &["g1"]);
    handle.ready().await.unwrap();

    assert_eq!(
        handle.commit_transaction().await.unwrap_err(),
        ConnectionError::NoTransactionOpen
    );

    handle.begin_transaction().unwrap();
    assert_eq!(
        handle.begin_transaction().unwrap_err(),
        ConnectionError::TransactionAlreadyOpen
    );
    handle
        .edit(|editor| editor.insert_root(person("g1", "s2", "Bob")))
        .unwrap();
    handle
        .edit(|editor| editor.set(&["g1|s2", "age"], 40i64))
        .unwrap();

    handle.flush().await.unwrap();
    assert!(bridge.sent().is_empty());
    assert!(handle.in_transaction());

    handle.commit_transaction().await.unwrap();
    assert!(!handle.in_transaction());
    let sent = bridge.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].patches.len(), 5);
    assert_eq!(sent[0].patches[4], Patch::literal("/g1|s2/age", 40i64));
}

#[tokio::test]
async fn test_failed_send_is_reported_to_committer() {
    let bridge = alice_bridge();
    let registry = attached_registry(&bridge, MirrorConfig::default());
    let handle = acquire_people(&registry, &["g1"]);
    handle.ready().await.unwrap();

    bridge.fail_updates(Some("offline"));
    handle.begin_transaction().unwrap();
    handle
        .edit(|editor| editor.set(&["g1|s1", "name"], "Alicia"))
        .unwrap();
    let err = handle.commit_transaction().await.unwrap_err();
    assert!(err.is_bridge_error());
    assert_eq!(
        err,
        ConnectionError::Bridge {
            reason: "offline".to_string()
        }
    );

    // The mirror keeps the local change and later batches still go out
    bridge.fail_updates(None);
    handle
        .edit(|editor| editor.set(&["g1|s1", "age"], 31i64))
        .unwrap();
    handle.flush().await.unwrap();
    assert_eq!(bridge.sent().len(), 1);
    assert_eq!(
        handle.read(|mirror| text_at(mirror.root(), &["g1|s1", "name"])),
        Some("Alicia".to_string())
    );
}

#[tokio::test]
async fn test_sweep_tears_down_idle_connections() {
    let bridge = alice_bridge();
    let registry = attached_registry(&bridge, delayed(60_000));

    let handle = acquire_people(&registry, &["g1"]);
    handle.ready().await.unwrap();
    let kept = acquire_people(&registry, &["g2"]);
    drop(handle);

    assert_eq!(registry.len(), 2);
    assert_eq!(registry.sweep_idle(), 1);
    assert_eq!(registry.len(), 1);
    assert!(registry.contains(kept.key()));
    assert_eq!(registry.sweep_idle(), 0);
}

#[test]
fn test_acquire_requires_a_runtime() {
    let registry = ConnectionRegistry::default();
    let err = registry
        .acquire(
            scopesync::ShapeDescriptor::new(SHAPE),
            scopesync::Scope::graphs(["g1"]),
        )
        .unwrap_err();
    assert_eq!(err, ConnectionError::NoRuntime);
    assert!(registry.is_empty());
}
