//! Conversion between transport JSON and mirror nodes.
//!
//! The backend can only transport JSON, so multi-valued properties arrive as
//! arrays and keyed collections arrive as objects keyed by identity. The rules are:
//!
//! - arrays of scalars become [`Multiset`]s
//! - arrays containing objects become [`Collection`]s
//! - objects carrying `@id` become [`Entity`]s
//! - objects without `@id` become [`Collection`]s of their values
//! - `null` values are dropped

use serde_json::{Map, Value};

use super::{Collection, Entity, Multiset, Node, SUBJECT_FIELD, Scalar};

/// Converts one transport value into a node. Returns `None` for `null`.
pub fn from_json(value: &Value) -> Option<Node> {
    match value {
        Value::Null => None,
        Value::Array(items) => Some(from_array(items)),
        Value::Object(map) if map.contains_key(SUBJECT_FIELD) => Some(Node::Entity(entity_from_map(map))),
        Value::Object(map) => Some(Node::Collection(collection_from_values(map.values()))),
        scalar => Scalar::from_json(scalar).map(Node::Scalar),
    }
}

/// Converts an initial snapshot into the root collection of a mirror.
///
/// `null` yields an empty collection. A bare entity or a multiset cannot be a
/// root and yields `None`.
pub fn root_from_snapshot(snapshot: &Value) -> Option<Collection> {
    match snapshot {
        Value::Null => Some(Collection::new()),
        other => match from_json(other)? {
            Node::Collection(collection) => Some(collection),
            // An empty array reads as an empty multiset
            Node::Multiset(set) if set.is_empty() => Some(Collection::new()),
            _ => None,
        },
    }
}

fn from_array(items: &[Value]) -> Node {
    if items.iter().all(|item| Scalar::from_json(item).is_some()) {
        Node::Multiset(items.iter().filter_map(Scalar::from_json).collect::<Multiset>())
    } else {
        Node::Collection(collection_from_values(items.iter()))
    }
}

fn entity_from_map(map: &Map<String, Value>) -> Entity {
    let mut entity = Entity::new();
    for (key, value) in map {
        if let Some(node) = from_json(value) {
            entity.insert(key.clone(), node);
        }
    }
    entity
}

fn collection_from_values<'a>(values: impl Iterator<Item = &'a Value>) -> Collection {
    let mut collection = Collection::new();
    for value in values {
        match from_json(value) {
            Some(Node::Entity(entity)) => {
                if !collection.insert(entity) {
                    tracing::warn!("dropping snapshot entity with duplicate identity");
                }
            }
            Some(Node::Collection(nested)) => {
                collection.push(Node::Collection(nested));
            }
            Some(other) => {
                tracing::warn!(kind = %other.kind(), "dropping non-entity snapshot collection member");
            }
            None => {}
        }
    }
    collection
}

impl Node {
    /// Renders the node as JSON. Collections and multisets become arrays.
    pub fn to_json(&self) -> Value {
        match self {
            Node::Scalar(scalar) => scalar.to_json(),
            Node::Entity(entity) => entity.to_json(),
            Node::Collection(collection) => collection.to_json(),
            Node::Multiset(set) => Value::Array(set.iter().map(Scalar::to_json).collect()),
        }
    }
}

impl Entity {
    pub fn to_json(&self) -> Value {
        Value::Object(
            self.iter()
                .map(|(key, node)| (key.to_string(), node.to_json()))
                .collect(),
        )
    }
}

impl Collection {
    pub fn to_json(&self) -> Value {
        Value::Array(self.iter().map(Node::to_json).collect())
    }
}
