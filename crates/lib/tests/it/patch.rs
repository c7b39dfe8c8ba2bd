//! Batch application against hand-built trees.

use serde_json::json;

use scopesync::{
    apply_patches,
    model::{Collection, Entity, Identity, Multiset, Node, NodeKind, Scalar},
    patch::{Patch, PatchKind, SkipReason},
};

use crate::helpers::{entity_root, person, text_at};

fn wire(patches: serde_json::Value) -> Vec<Patch> {
    serde_json::from_value(patches).expect("valid wire patches")
}

fn tags_at<'a>(root: &'a Node, path: &[&str]) -> &'a Multiset {
    root.lookup(path)
        .and_then(Node::as_multiset)
        .expect("multiset at path")
}

#[test]
fn test_object_add_with_identity_creates_entity() {
    let mut root = entity_root();
    let patches = wire(json!([
        {"op": "add", "valType": "object", "path": "/p1"},
        {"op": "add", "path": "/p1/@graph", "value": "g1"},
        {"op": "add", "path": "/p1/@id", "value": "u1"},
        {"op": "add", "path": "/p1/name", "value": "John"}
    ]));

    let report = apply_patches(&mut root, &patches, false);

    assert!(report.is_clean());
    assert_eq!(report.applied, 2);
    assert_eq!(report.consumed, 2);
    assert_eq!(
        root.to_json(),
        json!({"p1": {"@graph": "g1", "@id": "u1", "name": "John"}})
    );
}

#[test]
fn test_set_add_then_remove() {
    let mut root = entity_root();
    let patches = wire(json!([
        {"op": "add", "valType": "set", "path": "/tags", "value": ["a", "b"]},
        {"op": "remove", "valType": "set", "path": "/tags", "value": "a"}
    ]));

    assert!(apply_patches(&mut root, &patches, false).is_clean());

    let tags = tags_at(&root, &["tags"]);
    assert_eq!(tags, &["b"].into_iter().collect::<Multiset>());
}

#[test]
fn test_remove_collection_member_by_subject() {
    let children: Collection = [
        Entity::identified(&Identity::subject_only("c1")),
        Entity::identified(&Identity::new("g", "c2")),
    ]
    .into_iter()
    .collect();
    let mut root = Node::Entity(Entity::new().with("p1", Entity::new().with("children", children)));

    let report = apply_patches(&mut root, &[Patch::remove("/p1/children/c1")], false);

    assert!(report.is_clean());
    let remaining = root
        .lookup(&["p1", "children"])
        .and_then(Node::as_collection)
        .unwrap();
    assert_eq!(remaining.len(), 1);
    assert!(remaining.find("g|c2").is_some());
    assert!(remaining.find("c1").is_none());
}

#[test]
fn test_applying_batch_twice_matches_once() {
    let patches = wire(json!([
        {"op": "add", "valType": "object", "path": "/g1|s1"},
        {"op": "add", "path": "/g1|s1/@graph", "value": "g1"},
        {"op": "add", "path": "/g1|s1/@id", "value": "s1"},
        {"op": "add", "path": "/g1|s1/name", "value": "Alice"},
        {"op": "add", "valType": "set", "path": "/g1|s1/tags", "value": ["a", "b"]},
        {"op": "add", "valType": "object", "path": "/g1|s1/children"},
        {"op": "add", "valType": "object", "path": "/g1|s1/children/g1|c1"},
        {"op": "add", "path": "/g1|s1/children/g1|c1/@graph", "value": "g1"},
        {"op": "add", "path": "/g1|s1/children/g1|c1/@id", "value": "c1"},
        {"op": "add", "path": "/g1|s1/children/g1|c1/name", "value": "Kid"},
        {"op": "remove", "valType": "set", "path": "/g1|s1/tags", "value": ["a"]}
    ]));

    let mut once = Node::Collection(Collection::new());
    let first = apply_patches(&mut once, &patches, false);
    assert!(first.is_clean());
    assert_eq!(first.consumed, 4);

    let mut twice = once.clone();
    let second = apply_patches(&mut twice, &patches, false);
    assert!(second.is_clean());
    // Nothing is created the second time, so every identity patch applies
    assert_eq!(second.consumed, 0);
    assert_eq!(twice, once);

    assert_eq!(text_at(&once, &["g1|s1", "children", "g1|c1", "name"]).as_deref(), Some("Kid"));
    assert_eq!(
        tags_at(&once, &["g1|s1", "tags"]),
        &["b"].into_iter().collect::<Multiset>()
    );
}

#[test]
fn test_multiset_membership_is_unique() {
    let mut root = entity_root();
    let patches = vec![
        Patch::set_add("/tags", ["a", "a", "b"]),
        Patch::set_add("/tags", ["b", "c"]),
        Patch::set_remove("/tags", ["z"]),
        Patch::set_add("/scores", [1i64, 2, 2]),
    ];

    assert!(apply_patches(&mut root, &patches, false).is_clean());

    let tags = tags_at(&root, &["tags"]);
    assert_eq!(tags.len(), 3);
    assert_eq!(tags, &["c", "b", "a"].into_iter().collect::<Multiset>());
    assert_eq!(tags_at(&root, &["scores"]).len(), 2);
    assert!(tags_at(&root, &["scores"]).contains(&Scalar::from(2i64)));
}

#[test]
fn test_object_add_kind_follows_identity_lookahead() {
    let mut root = entity_root();
    let patches = wire(json!([
        // No identity follows: a collection
        {"op": "add", "valType": "object", "path": "/friends"},
        // Identity follows: an entity
        {"op": "add", "valType": "object", "path": "/address"},
        {"op": "add", "path": "/address/@graph", "value": "g1"},
        {"op": "add", "path": "/address/@id", "value": "urn:addr1"},
        // `@id` one position too early: a collection, and the identity patch is skipped
        {"op": "add", "valType": "object", "path": "/misplaced"},
        {"op": "add", "path": "/misplaced/@id", "value": "urn:x"}
    ]));

    let report = apply_patches(&mut root, &patches, false);

    let kind = |key: &str| root.lookup(&[key]).map(Node::kind);
    assert_eq!(kind("friends"), Some(NodeKind::Collection));
    assert_eq!(kind("address"), Some(NodeKind::Entity));
    assert_eq!(kind("misplaced"), Some(NodeKind::Collection));
    assert_eq!(
        root.lookup(&["address"]).and_then(Node::as_entity).and_then(Entity::identity),
        Some(Identity::new("g1", "urn:addr1"))
    );

    assert_eq!(report.skipped.len(), 1);
    assert_eq!(report.skipped[0].index, 5);
    assert_eq!(
        report.skipped[0].reason,
        SkipReason::UnexpectedOperation {
            kind: PatchKind::IdentityAdd,
            parent: NodeKind::Collection,
        }
    );
}

#[test]
fn test_bad_patches_do_not_block_the_batch() {
    let mut root = Node::Collection([person("g1", "s1", "Alice")].into_iter().collect());
    let patches = vec![
        Patch::literal("/g1|s1/name", "Alicia"),
        Patch::literal("/g1|missing/name", "Nobody"),
        Patch::literal("relative/name", "x"),
        Patch::literal("/g1|s1/name/first", "A"),
        Patch::literal("/g1|s1/age", 42i64),
    ];

    let report = apply_patches(&mut root, &patches, false);

    assert_eq!(report.applied, 2);
    let skipped: Vec<usize> = report.skipped.iter().map(|skip| skip.index).collect();
    assert_eq!(skipped, [1, 2, 3]);
    assert!(matches!(report.skipped[0].reason, SkipReason::Unresolved(_)));
    assert!(matches!(report.skipped[1].reason, SkipReason::InvalidPath(_)));
    assert_eq!(
        report.skipped[2].reason,
        SkipReason::UnexpectedParent(NodeKind::Scalar)
    );

    assert_eq!(text_at(&root, &["g1|s1", "name"]).as_deref(), Some("Alicia"));
    assert_eq!(
        root.lookup(&["g1|s1", "age"]).and_then(Node::as_scalar),
        Some(&Scalar::from(42i64))
    );
}

#[test]
fn test_escaped_segments_address_literal_keys() {
    let mut root = entity_root();
    let patches = vec![
        Patch::literal("/a~1b", "slash"),
        Patch::literal("/c~0d", "tilde"),
        Patch::literal("/e~01", "both"),
    ];

    assert!(apply_patches(&mut root, &patches, false).is_clean());

    assert_eq!(text_at(&root, &["a/b"]).as_deref(), Some("slash"));
    assert_eq!(text_at(&root, &["c~d"]).as_deref(), Some("tilde"));
    assert_eq!(text_at(&root, &["e~1"]).as_deref(), Some("both"));
}
