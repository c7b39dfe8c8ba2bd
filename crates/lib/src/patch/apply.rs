//! Ordered application of patch batches.
//!
//! # Batch ordering contract
//!
//! A patch that creates an identified entity must be followed immediately by
//! the patch setting its `@graph` (one position later) and the patch setting
//! its `@id` (two positions later), before any property patch for that entity:
//!
//! ```text
//! i     add  /people/g|urn:p1          valType=object
//! i + 1 add  /people/g|urn:p1/@graph   "g"
//! i + 2 add  /people/g|urn:p1/@id      "urn:p1"
//! i + 3 add  /people/g|urn:p1/name     "Alice"
//! ```
//!
//! The applicator relies on this in two ways. An object add is created as an
//! entity only when the `@id` patch for the same target sits exactly two
//! positions later; otherwise it becomes a collection. And the new entity is
//! created with both identity properties already set from those patches, which
//! are then consumed rather than applied again. A producer that breaks the
//! contract gets an anonymous collection where it meant an entity.
//!
//! Identity is fixed when an entity is created. An `@graph` or `@id` patch that
//! is not consumed by a creation only applies if it repeats the current value;
//! otherwise it is skipped with [`SkipReason::ReadOnlyIdentity`].

use std::collections::HashSet;

use serde_json::Value;
use thiserror::Error;
use tracing::{trace, warn};

use super::{Op, Patch, PatchKind, PatchPath, PathError, ResolveError, resolve::resolve_parent};
use crate::model::{
    Collection, Entity, GRAPH_FIELD, Identity, Multiset, Node, NodeKind, SUBJECT_FIELD, Scalar,
};

/// Why a patch was skipped. Skips are reported, never raised.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SkipReason {
    /// The path is not of the `/segment/...` form or addresses the root.
    #[error(transparent)]
    InvalidPath(#[from] PathError),

    /// An intermediate segment is missing and creation was not permitted.
    #[error(transparent)]
    Unresolved(#[from] ResolveError),

    /// The resolved parent is neither an entity nor a collection.
    #[error("Parent is a {0}, not an entity or collection")]
    UnexpectedParent(NodeKind),

    /// The operation is not supported on this kind of parent.
    #[error("{kind:?} patch cannot target a member of a {parent}")]
    UnexpectedOperation { kind: PatchKind, parent: NodeKind },

    /// The patch needs a value and carries none.
    #[error("Patch carries no value")]
    MissingValue,

    /// The value is not a scalar (or list of scalars, for set patches).
    #[error("Patch value is not a scalar")]
    InvalidValue,

    /// An identity patch outside an entity creation would change an identity.
    #[error("Identity field '{field}' is only set when its entity is created")]
    ReadOnlyIdentity { field: String },
}

/// A patch that was not applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedPatch {
    /// Position of the patch in its batch.
    pub index: usize,
    pub path: String,
    pub reason: SkipReason,
}

/// Outcome of applying one batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyReport {
    /// Patches applied, including no-ops such as removing an absent key.
    pub applied: usize,
    /// Identity patches folded into a newly created entity.
    pub consumed: usize,
    pub skipped: Vec<SkippedPatch>,
}

impl ApplyReport {
    /// True if no patch was skipped.
    pub fn is_clean(&self) -> bool {
        self.skipped.is_empty()
    }
}

/// Applies `patches` to `root` in order.
///
/// Each patch is independent: a patch that cannot be applied is logged, recorded
/// in the report and skipped, and the rest of the batch still applies. With
/// `create_missing`, missing intermediate containers are created on the way.
///
/// Applying the same batch twice yields the same state as applying it once.
pub fn apply_patches(root: &mut Node, patches: &[Patch], create_missing: bool) -> ApplyReport {
    let mut report = ApplyReport::default();
    let mut consumed = HashSet::new();

    for (index, patch) in patches.iter().enumerate() {
        if consumed.remove(&index) {
            report.consumed += 1;
            continue;
        }
        match apply_one(root, patches, index, create_missing, &mut consumed) {
            Ok(()) => report.applied += 1,
            Err(reason) => {
                warn!(index, path = %patch.path, %reason, "Skipping patch");
                report.skipped.push(SkippedPatch {
                    index,
                    path: patch.path.clone(),
                    reason,
                });
            }
        }
    }

    trace!(
        applied = report.applied,
        consumed = report.consumed,
        skipped = report.skipped.len(),
        "Applied patch batch"
    );
    report
}

/// The patch being applied, with access to the rest of its batch.
struct Step<'p> {
    patches: &'p [Patch],
    index: usize,
    path: PatchPath,
}

impl<'p> Step<'p> {
    fn patch(&self) -> &'p Patch {
        &self.patches[self.index]
    }

    fn lookahead(&self) -> IdentityLookahead<'p> {
        IdentityLookahead {
            graph: identity_patch(self.patches, self.index + 1, &self.path, GRAPH_FIELD),
            subject: identity_patch(self.patches, self.index + 2, &self.path, SUBJECT_FIELD),
        }
    }
}

/// Identity values announced right after an object add, with their batch positions.
struct IdentityLookahead<'p> {
    graph: Option<(usize, &'p str)>,
    subject: Option<(usize, &'p str)>,
}

impl IdentityLookahead<'_> {
    fn announces_entity(&self) -> bool {
        self.subject.is_some()
    }

    /// Builds the new entity with its identity already in place and marks the
    /// identity patches it absorbed. `fallback` supplies the parts not announced.
    fn seed(&self, fallback: Option<&Identity>, consumed: &mut HashSet<usize>) -> Entity {
        let mut entity = Entity::new();

        if let Some((index, graph)) = self.graph {
            entity.set_graph(graph);
            consumed.insert(index);
        } else if let Some(graph) = fallback.and_then(|identity| identity.graph.as_deref()) {
            entity.set_graph(graph);
        }

        if let Some((index, subject)) = self.subject {
            entity.set_subject(subject);
            consumed.insert(index);
        } else if let Some(identity) = fallback {
            entity.set_subject(identity.subject.clone());
        }

        entity
    }
}

/// Returns the value of the patch at `index` if it adds `field` directly under `target`.
fn identity_patch<'p>(
    patches: &'p [Patch],
    index: usize,
    target: &PatchPath,
    field: &str,
) -> Option<(usize, &'p str)> {
    let patch = patches.get(index)?;
    if patch.op != Op::Add || !patch.targets_identity_field() {
        return None;
    }
    let path = PatchPath::parse(&patch.path).ok()?;
    if path.key() != field || path.parent_segments() != target.segments() {
        return None;
    }
    let value = patch.value.as_ref()?.as_str()?;
    Some((index, value))
}

fn apply_one(
    root: &mut Node,
    patches: &[Patch],
    index: usize,
    create_missing: bool,
    consumed: &mut HashSet<usize>,
) -> Result<(), SkipReason> {
    let step = Step {
        patches,
        index,
        path: PatchPath::parse(&patches[index].path)?,
    };

    match resolve_parent(root, &step.path, create_missing)? {
        Node::Collection(collection) => apply_to_collection(collection, &step, consumed),
        Node::Entity(entity) => apply_to_entity(entity, &step, consumed),
        other => Err(SkipReason::UnexpectedParent(other.kind())),
    }
}

fn apply_to_collection(
    collection: &mut Collection,
    step: &Step<'_>,
    consumed: &mut HashSet<usize>,
) -> Result<(), SkipReason> {
    let key = step.path.key();
    match step.patch().kind() {
        PatchKind::ObjectAdd => {
            if collection.position(key).is_some() {
                return Ok(());
            }
            let lookahead = step.lookahead();
            if lookahead.announces_entity() {
                let entity = lookahead.seed(Some(&Identity::parse_segment(key)), consumed);
                if !collection.insert(entity) {
                    trace!(path = %step.path, "Announced identity already present");
                }
            } else {
                collection.push(Node::Collection(Collection::new()));
            }
            Ok(())
        }
        PatchKind::Remove => {
            collection.remove(key);
            Ok(())
        }
        kind => Err(SkipReason::UnexpectedOperation {
            kind,
            parent: NodeKind::Collection,
        }),
    }
}

fn apply_to_entity(
    entity: &mut Entity,
    step: &Step<'_>,
    consumed: &mut HashSet<usize>,
) -> Result<(), SkipReason> {
    let key = step.path.key();
    let patch = step.patch();
    match patch.kind() {
        PatchKind::SetAdd => {
            let values = scalar_values(patch)?;
            if values.is_empty() {
                return Ok(());
            }
            if let Some(Node::Multiset(set)) = entity.get_mut(key) {
                set.extend(values);
            } else {
                entity.insert(key, values.into_iter().collect::<Multiset>());
            }
            Ok(())
        }
        PatchKind::SetRemove => {
            let values = scalar_values(patch)?;
            if let Some(Node::Multiset(set)) = entity.get_mut(key) {
                for value in &values {
                    set.remove(value);
                }
            }
            Ok(())
        }
        PatchKind::ObjectAdd => {
            // Any existing container is kept; only absent keys and leaves are replaced
            if entity.get(key).is_some_and(Node::is_container) {
                return Ok(());
            }
            let lookahead = step.lookahead();
            let node = if lookahead.announces_entity() {
                Node::Entity(lookahead.seed(None, consumed))
            } else {
                Node::Collection(Collection::new())
            };
            entity.insert(key, node);
            Ok(())
        }
        PatchKind::IdentityAdd => {
            let value = patch.value.as_ref().ok_or(SkipReason::MissingValue)?;
            let scalar = Scalar::from_json(value).ok_or(SkipReason::InvalidValue)?;
            // Repeating the current value is a no-op; anything else could clash
            // with a sibling in the enclosing collection
            if entity.get(key).and_then(Node::as_scalar) == Some(&scalar) {
                return Ok(());
            }
            Err(SkipReason::ReadOnlyIdentity {
                field: key.to_string(),
            })
        }
        PatchKind::LiteralAdd => {
            let value = patch.value.as_ref().ok_or(SkipReason::MissingValue)?;
            let scalar = Scalar::from_json(value).ok_or(SkipReason::InvalidValue)?;
            entity.insert(key, scalar);
            Ok(())
        }
        PatchKind::Remove => {
            entity.remove(key);
            Ok(())
        }
    }
}

/// Normalizes a set patch value to a list of scalars. Non-scalar list items are dropped.
fn scalar_values(patch: &Patch) -> Result<Vec<Scalar>, SkipReason> {
    match &patch.value {
        None | Some(Value::Null) => Err(SkipReason::MissingValue),
        Some(Value::Array(items)) => Ok(items.iter().filter_map(Scalar::from_json).collect()),
        Some(value) => Scalar::from_json(value)
            .map(|scalar| vec![scalar])
            .ok_or(SkipReason::InvalidValue),
    }
}
