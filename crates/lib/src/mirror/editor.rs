//! Local edits to a mirror.
//!
//! An [`Editor`] is handed out by [`Mirror::edit`](super::Mirror::edit). Each
//! method mutates the tree and records the [`Delta`]s a remote replica needs to
//! reproduce the mutation. Paths are decoded segments; collection members are
//! addressed by their identity segment (`graph|subject`).
//!
//! Entities inserted through the editor are always fully identified: a missing
//! `@graph` is inherited from the enclosing entity and a missing `@id` is minted
//! by the mirror's [`IdentityGenerator`]. Their deltas follow the batch ordering
//! contract of [`apply_patches`](crate::patch::apply_patches), so the recorded
//! patches rebuild the same tree on the other side.

use serde_json::Value;

use super::{Delta, IdentityGenerator, MirrorError};
use crate::{
    model::{
        Collection, Entity, GRAPH_FIELD, Identity, Multiset, Node, NodeKind, SUBJECT_FIELD,
        Scalar, is_identity_field,
    },
    patch::{Op, ValType, path::encode_segments, resolve::resolve_node},
};

/// Records local mutations made during one [`Mirror::edit`](super::Mirror::edit).
pub struct Editor<'m> {
    root: &'m mut Node,
    identity: &'m dyn IdentityGenerator,
    deltas: &'m mut Vec<Delta>,
}

impl<'m> Editor<'m> {
    pub(crate) fn new(
        root: &'m mut Node,
        identity: &'m dyn IdentityGenerator,
        deltas: &'m mut Vec<Delta>,
    ) -> Self {
        Self {
            root,
            identity,
            deltas,
        }
    }

    /// Reads a node, seeing the changes made so far in this edit.
    pub fn get<S: AsRef<str>>(&self, path: &[S]) -> Option<&Node> {
        self.root.lookup(path)
    }

    /// Assigns a scalar property, replacing whatever the key held.
    pub fn set<S: AsRef<str>>(
        &mut self,
        path: &[S],
        value: impl Into<Scalar>,
    ) -> Result<(), MirrorError> {
        let (parent, key) = split_writable(path)?;
        let value = value.into();
        entity_at(self.root, parent)?.insert(key, value.clone());
        self.record(path, Op::Add, None, Some(value.to_json()));
        Ok(())
    }

    /// Removes an entity property or a collection member.
    ///
    /// Returns false if there was nothing to remove.
    pub fn remove<S: AsRef<str>>(&mut self, path: &[S]) -> Result<bool, MirrorError> {
        let (parent, key) = split(path)?;
        let removed = match node_at(self.root, parent)? {
            Node::Entity(entity) => {
                if is_identity_field(key) {
                    return Err(MirrorError::ReadOnlyField {
                        field: key.to_string(),
                    });
                }
                entity.remove(key).is_some()
            }
            Node::Collection(collection) => collection.remove(key).is_some(),
            other => {
                return Err(MirrorError::KindMismatch {
                    path: encode_segments(parent),
                    expected: NodeKind::Entity,
                    actual: other.kind(),
                });
            }
        };
        if removed {
            self.record(path, Op::Remove, None, None);
        }
        Ok(removed)
    }

    /// Adds scalars to the multiset at `path`, creating it if absent.
    ///
    /// Returns the number of values that were not already members.
    pub fn add_to_set<S, V>(
        &mut self,
        path: &[S],
        values: impl IntoIterator<Item = V>,
    ) -> Result<usize, MirrorError>
    where
        S: AsRef<str>,
        V: Into<Scalar>,
    {
        let (parent, key) = split_writable(path)?;
        let values: Vec<Scalar> = values.into_iter().map(Into::into).collect();
        let entity = entity_at(self.root, parent)?;
        if !entity.contains_key(key) {
            if values.is_empty() {
                return Ok(0);
            }
            entity.insert(key, Multiset::new());
        }
        let set = multiset_in(entity, key, path)?;
        let added: Vec<Scalar> = values
            .into_iter()
            .filter(|value| set.insert(value.clone()))
            .collect();

        // Recorded even when nothing was new; outbound translation drops it
        self.record(path, Op::Add, Some(ValType::Set), Some(scalars_json(&added)));
        Ok(added.len())
    }

    /// Removes scalars from the multiset at `path`. An absent multiset is left absent.
    ///
    /// Returns the number of values that were members.
    pub fn remove_from_set<S, V>(
        &mut self,
        path: &[S],
        values: impl IntoIterator<Item = V>,
    ) -> Result<usize, MirrorError>
    where
        S: AsRef<str>,
        V: Into<Scalar>,
    {
        let (parent, key) = split_writable(path)?;
        let entity = entity_at(self.root, parent)?;
        if !entity.contains_key(key) {
            return Ok(0);
        }
        let set = multiset_in(entity, key, path)?;
        let removed: Vec<Scalar> = values
            .into_iter()
            .map(Into::into)
            .filter(|value| set.remove(value))
            .collect();

        if !removed.is_empty() {
            self.record(path, Op::Remove, Some(ValType::Set), Some(scalars_json(&removed)));
        }
        Ok(removed.len())
    }

    /// Inserts a new root entity. It must name its graph.
    pub fn insert_root(&mut self, entity: Entity) -> Result<Identity, MirrorError> {
        self.insert_entity::<&str>(&[], entity)
    }

    /// Inserts an entity into the collection at `collection_path`.
    ///
    /// The entity and every entity nested in it receive a full identity before
    /// insertion. Fails with [`MirrorError::DuplicateIdentity`] if the collection
    /// already holds an entity with the resulting identity.
    pub fn insert_entity<S: AsRef<str>>(
        &mut self,
        collection_path: &[S],
        mut entity: Entity,
    ) -> Result<Identity, MirrorError> {
        let owner = self.owner_of(collection_path);
        let collection = collection_at(self.root, collection_path)?;
        let identity = assign_identity(&mut entity, owner.as_ref(), self.identity)?;
        if collection.contains_identity(&identity) {
            return Err(MirrorError::DuplicateIdentity {
                path: encode_segments(collection_path),
                identity,
            });
        }

        let mut member_path = owned(collection_path);
        member_path.push(identity.to_segment());
        emit_entity(&member_path, &entity, self.deltas);
        collection.insert(entity);
        Ok(identity)
    }

    /// Assigns a single nested entity to a property, replacing whatever the key held.
    pub fn set_entity<S: AsRef<str>>(
        &mut self,
        path: &[S],
        mut entity: Entity,
    ) -> Result<Identity, MirrorError> {
        let (parent, key) = split_writable(path)?;
        let owner = self.owner_of(parent);
        let target = entity_at(self.root, parent)?;
        let identity = assign_identity(&mut entity, owner.as_ref(), self.identity)?;

        let path = owned(path);
        if target.get(key).is_some_and(Node::is_container) {
            self.deltas.push(delta(&path, Op::Remove, None, None));
        }
        emit_entity(&path, &entity, self.deltas);
        target.insert(key, entity);
        Ok(identity)
    }

    /// Makes the property at `path` an empty collection.
    ///
    /// Returns false, changing nothing, if it already holds a collection.
    pub fn create_collection<S: AsRef<str>>(&mut self, path: &[S]) -> Result<bool, MirrorError> {
        let (parent, key) = split_writable(path)?;
        let target = entity_at(self.root, parent)?;
        let replaced = match target.get(key) {
            Some(Node::Collection(_)) => return Ok(false),
            Some(Node::Entity(_)) => true,
            _ => false,
        };
        target.insert(key, Collection::new());

        let path = owned(path);
        if replaced {
            self.deltas.push(delta(&path, Op::Remove, None, None));
        }
        self.deltas
            .push(delta(&path, Op::Add, Some(ValType::Object), None));
        Ok(true)
    }

    /// Identity of the entity that holds the node at `path`, if any.
    fn owner_of<S: AsRef<str>>(&self, path: &[S]) -> Option<Identity> {
        let mut owner = None;
        let mut current = &*self.root;
        for segment in path {
            if let Node::Entity(entity) = current {
                owner = entity.identity().or(owner);
            }
            current = current.lookup(&[segment.as_ref()])?;
        }
        if let Node::Entity(entity) = current {
            owner = entity.identity().or(owner);
        }
        owner
    }

    fn record<S: AsRef<str>>(
        &mut self,
        path: &[S],
        op: Op,
        val_type: Option<ValType>,
        value: Option<Value>,
    ) {
        self.deltas.push(delta(&owned(path), op, val_type, value));
    }
}

fn delta(path: &[String], op: Op, val_type: Option<ValType>, value: Option<Value>) -> Delta {
    Delta {
        path: path.to_vec(),
        op,
        val_type,
        value,
    }
}

fn owned<S: AsRef<str>>(path: &[S]) -> Vec<String> {
    path.iter().map(|segment| segment.as_ref().to_string()).collect()
}

fn child(path: &[String], segment: &str) -> Vec<String> {
    let mut child = path.to_vec();
    child.push(segment.to_string());
    child
}

fn scalars_json(values: &[Scalar]) -> Value {
    Value::Array(values.iter().map(Scalar::to_json).collect())
}

fn split<S: AsRef<str>>(path: &[S]) -> Result<(&[S], &str), MirrorError> {
    match path.split_last() {
        Some((key, parent)) => Ok((parent, key.as_ref())),
        None => Err(MirrorError::RootPath),
    }
}

/// Like [`split`], but the key must not be an identity field.
fn split_writable<S: AsRef<str>>(path: &[S]) -> Result<(&[S], &str), MirrorError> {
    let (parent, key) = split(path)?;
    if is_identity_field(key) {
        return Err(MirrorError::ReadOnlyField {
            field: key.to_string(),
        });
    }
    Ok((parent, key))
}

fn node_at<'a, S: AsRef<str>>(root: &'a mut Node, path: &[S]) -> Result<&'a mut Node, MirrorError> {
    resolve_node(root, path).map_err(|err| MirrorError::from_resolve(&encode_segments(path), err))
}

fn entity_at<'a, S: AsRef<str>>(
    root: &'a mut Node,
    path: &[S],
) -> Result<&'a mut Entity, MirrorError> {
    match node_at(root, path)? {
        Node::Entity(entity) => Ok(entity),
        other => Err(MirrorError::KindMismatch {
            path: encode_segments(path),
            expected: NodeKind::Entity,
            actual: other.kind(),
        }),
    }
}

fn collection_at<'a, S: AsRef<str>>(
    root: &'a mut Node,
    path: &[S],
) -> Result<&'a mut Collection, MirrorError> {
    match node_at(root, path)? {
        Node::Collection(collection) => Ok(collection),
        other => Err(MirrorError::KindMismatch {
            path: encode_segments(path),
            expected: NodeKind::Collection,
            actual: other.kind(),
        }),
    }
}

fn multiset_in<'a, S: AsRef<str>>(
    entity: &'a mut Entity,
    key: &str,
    path: &[S],
) -> Result<&'a mut Multiset, MirrorError> {
    match entity.get_mut(key) {
        Some(Node::Multiset(set)) => Ok(set),
        Some(other) => Err(MirrorError::KindMismatch {
            path: encode_segments(path),
            expected: NodeKind::Multiset,
            actual: other.kind(),
        }),
        None => Err(MirrorError::PathNotFound {
            path: encode_segments(path),
        }),
    }
}

/// Completes the identity of `entity` and of every entity nested in it.
fn assign_identity(
    entity: &mut Entity,
    owner: Option<&Identity>,
    generator: &dyn IdentityGenerator,
) -> Result<Identity, MirrorError> {
    let graph = match entity
        .graph()
        .or_else(|| owner.and_then(|owner| owner.graph.as_deref()))
    {
        Some(graph) => graph.to_string(),
        None => {
            return Err(MirrorError::MissingGraph {
                subject: entity.subject().unwrap_or_default().to_string(),
            });
        }
    };
    let subject = match entity.subject().map(str::to_string) {
        Some(subject) => subject,
        None => generator.subject(&graph, owner),
    };
    entity.set_graph(graph.clone());
    entity.set_subject(subject.clone());
    let identity = Identity::new(graph, subject);

    for (_, node) in entity.iter_mut() {
        match node {
            Node::Entity(nested) => {
                assign_identity(nested, Some(&identity), generator)?;
            }
            Node::Collection(collection) => {
                for member in collection.iter_mut() {
                    if let Node::Entity(nested) = member {
                        assign_identity(nested, Some(&identity), generator)?;
                    }
                }
            }
            _ => {}
        }
    }
    Ok(identity)
}

/// Records the deltas that recreate `entity` at `path`: the object add, the two
/// identity fields, then every other property.
fn emit_entity(path: &[String], entity: &Entity, out: &mut Vec<Delta>) {
    out.push(delta(path, Op::Add, Some(ValType::Object), None));
    for field in [GRAPH_FIELD, SUBJECT_FIELD] {
        if let Some(Node::Scalar(value)) = entity.get(field) {
            out.push(delta(&child(path, field), Op::Add, None, Some(value.to_json())));
        }
    }
    for (key, node) in entity.iter() {
        if !is_identity_field(key) {
            emit_node(&child(path, key), node, out);
        }
    }
}

fn emit_node(path: &[String], node: &Node, out: &mut Vec<Delta>) {
    match node {
        Node::Scalar(value) => out.push(delta(path, Op::Add, None, Some(value.to_json()))),
        Node::Multiset(set) => {
            let values: Vec<Scalar> = set.iter().cloned().collect();
            out.push(delta(path, Op::Add, Some(ValType::Set), Some(scalars_json(&values))));
        }
        Node::Entity(entity) => emit_entity(path, entity, out),
        Node::Collection(collection) => {
            out.push(delta(path, Op::Add, Some(ValType::Object), None));
            for member in collection.entities() {
                if let Some(identity) = member.identity() {
                    emit_entity(&child(path, &identity.to_segment()), member, out);
                }
            }
        }
    }
}
