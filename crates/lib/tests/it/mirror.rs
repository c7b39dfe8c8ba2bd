//! Local edits and the patches they produce.

use std::sync::{Arc, Mutex};

use serde_json::json;

use scopesync::{
    Mirror, apply_patches,
    mirror::{ChangeSet, MirrorObserver, Origin, deltas_to_patches},
    model::{Entity, Identity, Multiset, Node},
    patch::Patch,
};

use crate::helpers::{Sequential, person, text_at};

#[derive(Default)]
struct Recorder {
    changes: Mutex<Vec<ChangeSet>>,
}

impl Recorder {
    fn take(&self) -> Vec<ChangeSet> {
        std::mem::take(&mut *self.changes.lock().unwrap())
    }
}

impl MirrorObserver for Recorder {
    fn on_change(&self, changes: &ChangeSet) {
        self.changes.lock().unwrap().push(changes.clone());
    }
}

fn observed_mirror() -> (Mirror, Arc<Recorder>) {
    let mut mirror = Mirror::new(Arc::new(Sequential::default()));
    let recorder = Arc::new(Recorder::default());
    mirror.subscribe(recorder.clone());
    (mirror, recorder)
}

#[test]
fn test_edit_patches_rebuild_the_same_tree() {
    let (mut mirror, recorder) = observed_mirror();
    let before = mirror.root().clone();

    let alice = Identity::new("g1", "s1");
    mirror
        .edit(|editor| {
            editor.insert_root(
                person("g1", "s1", "Alice").with("tags", ["a", "b"].into_iter().collect::<Multiset>()),
            )?;
            editor.set_entity(&["g1|s1", "address"], Entity::new().with("street", "1st street"))?;
            editor.create_collection(&["g1|s1", "children"])?;
            editor.insert_entity(&["g1|s1", "children"], Entity::new().with("name", "Kid"))?;
            editor.add_to_set(&["g1|s1", "tags"], ["b", "c"])?;
            editor.remove_from_set(&["g1|s1", "tags"], ["a"])?;
            editor.set(&["g1|s1", "age"], 30i64)?;
            editor.remove(&["g1|s1", "name"])?;
            Ok(())
        })
        .unwrap();

    let changes = recorder.take();
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].origin, Origin::Local);

    let mut replica = before;
    let report = apply_patches(&mut replica, &deltas_to_patches(&changes[0].deltas), false);
    assert!(report.is_clean(), "skipped: {:?}", report.skipped);
    assert_eq!(&replica, mirror.root());

    let root = mirror.root();
    assert_eq!(text_at(root, &["g1|s1", "address", "street"]).as_deref(), Some("1st street"));
    assert_eq!(
        root.lookup(&["g1|s1", "address"])
            .and_then(Node::as_entity)
            .and_then(Entity::identity),
        Some(Identity::new("g1", "g1/n0"))
    );
    assert_eq!(
        text_at(root, &["g1|s1", "children", "g1|g1/n1", "name"]).as_deref(),
        Some("Kid")
    );
    assert!(mirror.get(&[alice.to_segment(), "name".to_string()]).is_none());
}

#[test]
fn test_outbound_patches_use_wire_form() {
    let (mut mirror, recorder) = observed_mirror();
    mirror
        .edit(|editor| {
            editor.insert_root(person("g1", "s1", "Alice"))?;
            editor.add_to_set(&["g1|s1", "tags"], ["x"])?;
            // Nothing new: recorded, but not sent
            editor.add_to_set(&["g1|s1", "tags"], ["x"])?;
            Ok(())
        })
        .unwrap();

    let patches = deltas_to_patches(&recorder.take()[0].deltas);
    assert_eq!(
        serde_json::to_value(&patches).unwrap(),
        json!([
            {"op": "add", "path": "/g1|s1", "valType": "object"},
            {"op": "add", "path": "/g1|s1/@graph", "value": "g1"},
            {"op": "add", "path": "/g1|s1/@id", "value": "s1"},
            {"op": "add", "path": "/g1|s1/name", "value": "Alice"},
            {"op": "add", "path": "/g1|s1/tags", "valType": "set", "value": ["x"]}
        ])
    );
}

#[test]
fn test_failed_edit_keeps_earlier_changes() {
    let (mut mirror, recorder) = observed_mirror();
    mirror
        .edit(|editor| editor.insert_root(person("g1", "s1", "Alice")))
        .unwrap();
    recorder.take();

    let err = mirror
        .edit(|editor| {
            editor.set(&["g1|s1", "name"], "Alicia")?;
            editor.set(&["g1|nobody", "name"], "Bob")
        })
        .unwrap_err();
    assert!(err.is_not_found());

    assert_eq!(
        text_at(mirror.root(), &["g1|s1", "name"]).as_deref(),
        Some("Alicia")
    );
    let changes = recorder.take();
    assert_eq!(changes.len(), 1);
    assert_eq!(
        deltas_to_patches(&changes[0].deltas),
        [Patch::literal("/g1|s1/name", "Alicia")]
    );
}

#[test]
fn test_remote_batch_is_one_notification() {
    let (mut mirror, recorder) = observed_mirror();
    let report = mirror.apply_remote(&[
        Patch::object_add("/g1|s1"),
        Patch::literal("/g1|s1/@graph", "g1"),
        Patch::literal("/g1|s1/@id", "s1"),
        Patch::literal("/g1|s1/name", "Alice"),
        Patch::literal("/g1|s2/name", "Nobody"),
    ]);

    assert_eq!(report.applied, 2);
    assert_eq!(report.skipped.len(), 1);
    assert_eq!(mirror.len(), 1);

    let changes = recorder.take();
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].origin, Origin::Remote);
    // The skipped patch for the unknown member is not reported
    assert_eq!(changes[0].deltas.len(), 4);
    assert!(changes[0].deltas.iter().all(|delta| delta.path[0] == "g1|s1"));
}

#[test]
fn test_unsubscribed_observer_hears_nothing() {
    let mut mirror = Mirror::new(Arc::new(Sequential::default()));
    let recorder = Arc::new(Recorder::default());
    let id = mirror.subscribe(recorder.clone());
    assert!(mirror.unsubscribe(id));
    assert!(!mirror.unsubscribe(id));

    mirror
        .edit(|editor| editor.insert_root(person("g1", "s1", "Alice")))
        .unwrap();
    assert!(recorder.take().is_empty());
}
