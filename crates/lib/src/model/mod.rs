//! In-memory data model for mirrored graph data.
//!
//! A mirror is a tree of [`Node`]s. Containers come in three flavours:
//!
//! - [`Entity`] - a mapping from property name to value, optionally carrying a
//!   composite identity in its `@graph` and `@id` properties
//! - [`Collection`] - an unordered set of identified entities, addressed by
//!   composite identity
//! - [`Multiset`] - an unordered set of unique [`Scalar`]s
//!
//! Leaves are [`Scalar`]s: text, numbers and booleans.

use std::fmt;

use indexmap::{IndexMap, IndexSet};
use serde_json::Number;

pub mod snapshot;

/// Property holding the graph part of an entity's identity.
pub const GRAPH_FIELD: &str = "@graph";

/// Property holding the subject part of an entity's identity.
pub const SUBJECT_FIELD: &str = "@id";

/// Separates the graph and subject parts of an identity path segment.
pub const IDENTITY_SEPARATOR: char = '|';

/// Returns true if `field` is one of the two identity properties.
pub fn is_identity_field(field: &str) -> bool {
    field == GRAPH_FIELD || field == SUBJECT_FIELD
}

/// A primitive value stored in an entity property or a [`Multiset`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Scalar {
    Bool(bool),
    Number(Number),
    Text(String),
}

impl Scalar {
    /// Converts a JSON value into a scalar. Returns `None` for null, arrays and objects.
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Bool(b) => Some(Scalar::Bool(*b)),
            serde_json::Value::Number(n) => Some(Scalar::Number(n.clone())),
            serde_json::Value::String(s) => Some(Scalar::Text(s.clone())),
            _ => None,
        }
    }

    /// Builds a numeric scalar from a float. Returns `None` for NaN and infinities.
    pub fn from_f64(value: f64) -> Option<Self> {
        Number::from_f64(value).map(Scalar::Number)
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Scalar::Bool(b) => serde_json::Value::Bool(*b),
            Scalar::Number(n) => serde_json::Value::Number(n.clone()),
            Scalar::Text(s) => serde_json::Value::String(s.clone()),
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Scalar::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Scalar::Number(n) => n.as_i64(),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Scalar::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Bool(b) => write!(f, "{b}"),
            Scalar::Number(n) => write!(f, "{n}"),
            Scalar::Text(s) => write!(f, "{s}"),
        }
    }
}

impl From<bool> for Scalar {
    fn from(value: bool) -> Self {
        Scalar::Bool(value)
    }
}

impl From<i64> for Scalar {
    fn from(value: i64) -> Self {
        Scalar::Number(value.into())
    }
}

impl From<i32> for Scalar {
    fn from(value: i32) -> Self {
        Scalar::Number(value.into())
    }
}

impl From<u64> for Scalar {
    fn from(value: u64) -> Self {
        Scalar::Number(value.into())
    }
}

impl From<&str> for Scalar {
    fn from(value: &str) -> Self {
        Scalar::Text(value.to_string())
    }
}

impl From<String> for Scalar {
    fn from(value: String) -> Self {
        Scalar::Text(value)
    }
}

/// The composite identity of an entity: an optional graph plus a subject.
///
/// In paths, an identity is written as `graph|subject`, or just `subject`
/// when no graph is known.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity {
    pub graph: Option<String>,
    pub subject: String,
}

impl Identity {
    pub fn new(graph: impl Into<String>, subject: impl Into<String>) -> Self {
        let graph = graph.into();
        Self {
            graph: (!graph.is_empty()).then_some(graph),
            subject: subject.into(),
        }
    }

    pub fn subject_only(subject: impl Into<String>) -> Self {
        Self {
            graph: None,
            subject: subject.into(),
        }
    }

    /// Parses a path segment of the form `graph|subject`.
    ///
    /// Splits on the first separator. A segment without a separator, or with an
    /// empty graph part, yields a subject-only identity.
    pub fn parse_segment(segment: &str) -> Self {
        match segment.split_once(IDENTITY_SEPARATOR) {
            Some((graph, subject)) => Self::new(graph, subject),
            None => Self::subject_only(segment),
        }
    }

    /// Returns true if `segment` is written in composite-identity form.
    pub fn looks_like_segment(segment: &str) -> bool {
        segment.contains(IDENTITY_SEPARATOR)
    }

    /// Renders this identity as a path segment.
    pub fn to_segment(&self) -> String {
        match &self.graph {
            Some(graph) => format!("{graph}{IDENTITY_SEPARATOR}{}", self.subject),
            None => self.subject.clone(),
        }
    }

    /// Returns true if `entity` carries this identity.
    ///
    /// When a graph is present both parts must match; otherwise only the subject is compared.
    pub fn matches(&self, entity: &Entity) -> bool {
        if entity.subject() != Some(self.subject.as_str()) {
            return false;
        }
        match &self.graph {
            Some(graph) => entity.graph() == Some(graph.as_str()),
            None => true,
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_segment())
    }
}

/// The kind of a [`Node`], used in diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    Scalar,
    Entity,
    Collection,
    Multiset,
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodeKind::Scalar => "scalar",
            NodeKind::Entity => "entity",
            NodeKind::Collection => "collection",
            NodeKind::Multiset => "multiset",
        };
        f.write_str(name)
    }
}

/// A value in the mirror tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Scalar(Scalar),
    Entity(Entity),
    Collection(Collection),
    Multiset(Multiset),
}

impl Node {
    pub fn kind(&self) -> NodeKind {
        match self {
            Node::Scalar(_) => NodeKind::Scalar,
            Node::Entity(_) => NodeKind::Entity,
            Node::Collection(_) => NodeKind::Collection,
            Node::Multiset(_) => NodeKind::Multiset,
        }
    }

    /// Entities and collections can be traversed by a path; scalars and multisets cannot.
    pub fn is_container(&self) -> bool {
        matches!(self, Node::Entity(_) | Node::Collection(_))
    }

    pub fn as_scalar(&self) -> Option<&Scalar> {
        match self {
            Node::Scalar(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        self.as_scalar().and_then(Scalar::as_text)
    }

    pub fn as_entity(&self) -> Option<&Entity> {
        match self {
            Node::Entity(e) => Some(e),
            _ => None,
        }
    }

    pub fn as_entity_mut(&mut self) -> Option<&mut Entity> {
        match self {
            Node::Entity(e) => Some(e),
            _ => None,
        }
    }

    pub fn as_collection(&self) -> Option<&Collection> {
        match self {
            Node::Collection(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_collection_mut(&mut self) -> Option<&mut Collection> {
        match self {
            Node::Collection(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_multiset(&self) -> Option<&Multiset> {
        match self {
            Node::Multiset(m) => Some(m),
            _ => None,
        }
    }

    /// Follows `segments` from this node without modifying anything.
    ///
    /// Entity segments are property names; collection segments are identity segments.
    pub fn lookup<S: AsRef<str>>(&self, segments: &[S]) -> Option<&Node> {
        let mut current = self;
        for segment in segments {
            let segment = segment.as_ref();
            current = match current {
                Node::Entity(entity) => entity.get(segment)?,
                Node::Collection(collection) => collection.find_node(segment)?,
                _ => return None,
            };
        }
        Some(current)
    }
}

impl From<Scalar> for Node {
    fn from(value: Scalar) -> Self {
        Node::Scalar(value)
    }
}

impl From<Entity> for Node {
    fn from(value: Entity) -> Self {
        Node::Entity(value)
    }
}

impl From<Collection> for Node {
    fn from(value: Collection) -> Self {
        Node::Collection(value)
    }
}

impl From<Multiset> for Node {
    fn from(value: Multiset) -> Self {
        Node::Multiset(value)
    }
}

impl From<&str> for Node {
    fn from(value: &str) -> Self {
        Node::Scalar(value.into())
    }
}

impl From<String> for Node {
    fn from(value: String) -> Self {
        Node::Scalar(value.into())
    }
}

impl From<i64> for Node {
    fn from(value: i64) -> Self {
        Node::Scalar(value.into())
    }
}

impl From<bool> for Node {
    fn from(value: bool) -> Self {
        Node::Scalar(value.into())
    }
}

/// A mutable mapping from property name to [`Node`].
///
/// Property order is insertion order; equality ignores order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Entity {
    props: IndexMap<String, Node>,
}

impl Entity {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an entity whose identity properties are already populated.
    pub fn identified(identity: &Identity) -> Self {
        let mut entity = Self::new();
        if let Some(graph) = &identity.graph {
            entity.set_graph(graph.clone());
        }
        entity.set_subject(identity.subject.clone());
        entity
    }

    /// Builder-style property assignment.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Node>) -> Self {
        self.props.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Node> {
        self.props.get(key)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut Node> {
        self.props.get_mut(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.props.contains_key(key)
    }

    /// Sets a property, returning the previous value.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Node>) -> Option<Node> {
        self.props.insert(key.into(), value.into())
    }

    pub fn remove(&mut self, key: &str) -> Option<Node> {
        self.props.shift_remove(key)
    }

    pub fn len(&self) -> usize {
        self.props.len()
    }

    pub fn is_empty(&self) -> bool {
        self.props.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Node)> {
        self.props.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&str, &mut Node)> {
        self.props.iter_mut().map(|(k, v)| (k.as_str(), v))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.props.keys().map(String::as_str)
    }

    pub fn graph(&self) -> Option<&str> {
        self.text_field(GRAPH_FIELD)
    }

    pub fn subject(&self) -> Option<&str> {
        self.text_field(SUBJECT_FIELD)
    }

    pub fn set_graph(&mut self, graph: impl Into<String>) {
        self.props
            .insert(GRAPH_FIELD.to_string(), Node::Scalar(Scalar::Text(graph.into())));
    }

    pub fn set_subject(&mut self, subject: impl Into<String>) {
        self.props
            .insert(SUBJECT_FIELD.to_string(), Node::Scalar(Scalar::Text(subject.into())));
    }

    /// The composite identity, if a subject is set.
    pub fn identity(&self) -> Option<Identity> {
        let subject = self.subject()?;
        Some(match self.graph() {
            Some(graph) => Identity::new(graph, subject),
            None => Identity::subject_only(subject),
        })
    }

    fn text_field(&self, key: &str) -> Option<&str> {
        self.get(key)
            .and_then(Node::as_text)
            .filter(|text| !text.is_empty())
    }
}

/// An unordered container of identified entities.
///
/// Members are looked up by composite identity. Lookup is a linear scan, which
/// matches the small scope sizes mirrors are used with.
#[derive(Debug, Clone, Default)]
pub struct Collection {
    items: Vec<Node>,
}

impl Collection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &Node> {
        self.items.iter()
    }

    /// Iterates over the entity members, skipping nested collections.
    pub fn entities(&self) -> impl Iterator<Item = &Entity> {
        self.items.iter().filter_map(Node::as_entity)
    }

    /// Index of the entity addressed by an identity segment.
    pub fn position(&self, segment: &str) -> Option<usize> {
        self.position_of(&Identity::parse_segment(segment))
    }

    pub fn position_of(&self, identity: &Identity) -> Option<usize> {
        self.items.iter().position(|node| match node {
            Node::Entity(entity) => identity.matches(entity),
            _ => false,
        })
    }

    /// Finds the entity addressed by an identity segment.
    pub fn find(&self, segment: &str) -> Option<&Entity> {
        self.find_node(segment).and_then(Node::as_entity)
    }

    pub fn find_mut(&mut self, segment: &str) -> Option<&mut Entity> {
        let index = self.position(segment)?;
        self.items[index].as_entity_mut()
    }

    pub fn find_node(&self, segment: &str) -> Option<&Node> {
        self.position(segment).map(|index| &self.items[index])
    }

    pub fn contains_identity(&self, identity: &Identity) -> bool {
        self.position_of(identity).is_some()
    }

    /// Inserts an entity unless one with the same identity is already present.
    ///
    /// Returns false, leaving the collection unchanged, on an identity clash.
    pub fn insert(&mut self, entity: Entity) -> bool {
        if let Some(identity) = entity.identity() {
            if self.contains_identity(&identity) {
                return false;
            }
        }
        self.items.push(Node::Entity(entity));
        true
    }

    /// Removes the member addressed by an identity segment.
    pub fn remove(&mut self, segment: &str) -> Option<Node> {
        let index = self.position(segment)?;
        Some(self.items.remove(index))
    }

    /// Appends a node without identity checks and returns its index.
    pub(crate) fn push(&mut self, node: Node) -> usize {
        self.items.push(node);
        self.items.len() - 1
    }

    pub(crate) fn node_mut(&mut self, index: usize) -> &mut Node {
        &mut self.items[index]
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut Node> {
        self.items.iter_mut()
    }
}

impl PartialEq for Collection {
    fn eq(&self, other: &Self) -> bool {
        self.items.len() == other.items.len()
            && self.items.iter().all(|item| other.items.contains(item))
            && other.items.iter().all(|item| self.items.contains(item))
    }
}

impl Eq for Collection {}

impl IntoIterator for Collection {
    type Item = Node;
    type IntoIter = std::vec::IntoIter<Node>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.into_iter()
    }
}

impl FromIterator<Entity> for Collection {
    fn from_iter<T: IntoIterator<Item = Entity>>(iter: T) -> Self {
        let mut collection = Collection::new();
        for entity in iter {
            collection.insert(entity);
        }
        collection
    }
}

/// An unordered container of unique scalars.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Multiset {
    values: IndexSet<Scalar>,
}

impl Multiset {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a value, returning false if it was already present.
    pub fn insert(&mut self, value: impl Into<Scalar>) -> bool {
        self.values.insert(value.into())
    }

    /// Removes a value, returning false if it was not a member.
    pub fn remove(&mut self, value: &Scalar) -> bool {
        self.values.shift_remove(value)
    }

    pub fn contains(&self, value: &Scalar) -> bool {
        self.values.contains(value)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Scalar> {
        self.values.iter()
    }
}

impl<S: Into<Scalar>> FromIterator<S> for Multiset {
    fn from_iter<T: IntoIterator<Item = S>>(iter: T) -> Self {
        Self {
            values: iter.into_iter().map(Into::into).collect(),
        }
    }
}

impl<S: Into<Scalar>> Extend<S> for Multiset {
    fn extend<T: IntoIterator<Item = S>>(&mut self, iter: T) {
        self.values.extend(iter.into_iter().map(Into::into));
    }
}
