//! The observable in-memory mirror of one scope.
//!
//! A [`Mirror`] owns a root [`Collection`] and an explicit mutation log. Every
//! grouped mutation, whether a local [`Mirror::edit`], an inbound patch batch or
//! a snapshot, produces exactly one [`ChangeSet`] delivered to each
//! registered [`MirrorObserver`]. Local edits record structural [`Delta`]s that
//! translate one-to-one into outbound [`Patch`]es.

use std::{collections::HashSet, sync::Arc};

use serde_json::Value;
use tracing::trace;

use crate::{
    config::IdentityConfig,
    model::{Collection, Entity, Node},
    patch::{ApplyReport, Op, Patch, PatchPath, ValType, apply_patches, path::encode_segments},
};

pub mod editor;
mod errors;
pub mod identity;

pub use editor::Editor;
pub use errors::MirrorError;
pub use identity::{IdentityGenerator, RandomIdentityGenerator};

/// One structural change, addressed by decoded path segments.
#[derive(Debug, Clone, PartialEq)]
pub struct Delta {
    pub path: Vec<String>,
    pub op: Op,
    pub val_type: Option<ValType>,
    pub value: Option<Value>,
}

impl Delta {
    /// Encodes the delta as an outbound patch.
    pub fn to_patch(&self) -> Patch {
        Patch {
            path: encode_segments(&self.path),
            op: self.op,
            val_type: self.val_type,
            value: self.value.clone(),
        }
    }

    /// Decodes a patch into a delta. Returns `None` for malformed paths.
    pub fn from_patch(patch: &Patch) -> Option<Self> {
        let path = PatchPath::parse(&patch.path).ok()?;
        Some(Self {
            path: path.segments().to_vec(),
            op: patch.op,
            val_type: patch.val_type,
            value: patch.value.clone(),
        })
    }

    /// True for a set add that carries no values.
    pub fn is_empty_set_add(&self) -> bool {
        self.op == Op::Add
            && self.val_type == Some(ValType::Set)
            && match &self.value {
                None => true,
                Some(Value::Array(items)) => items.is_empty(),
                Some(_) => false,
            }
    }
}

/// Translates deltas into outbound patches, dropping empty set adds.
pub fn deltas_to_patches(deltas: &[Delta]) -> Vec<Patch> {
    deltas
        .iter()
        .filter(|delta| !delta.is_empty_set_add())
        .map(Delta::to_patch)
        .collect()
}

/// What caused a change set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Origin {
    /// An edit made through [`Mirror::edit`].
    Local,
    /// An inbound patch batch.
    Remote,
    /// A snapshot was merged into or replaced the root. Carries no deltas.
    Snapshot,
}

/// The deltas of one grouped mutation.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeSet {
    pub origin: Origin,
    pub deltas: Vec<Delta>,
}

/// Receives one notification per grouped mutation.
///
/// Observers are called synchronously, after the mutation completed and while
/// the mirror is still borrowed, so they must not try to access the mirror.
pub trait MirrorObserver: Send + Sync {
    fn on_change(&self, changes: &ChangeSet);
}

/// Handle returned by [`Mirror::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

/// An observable tree rooted at a collection.
pub struct Mirror {
    root: Node,
    observers: Vec<(ObserverId, Arc<dyn MirrorObserver>)>,
    next_observer: u64,
    identity: Arc<dyn IdentityGenerator>,
}

impl Mirror {
    /// Creates an empty mirror that mints subjects with `identity`.
    pub fn new(identity: Arc<dyn IdentityGenerator>) -> Self {
        Self {
            root: Node::Collection(Collection::new()),
            observers: Vec::new(),
            next_observer: 0,
            identity,
        }
    }

    /// Creates an empty mirror with a [`RandomIdentityGenerator`].
    pub fn with_config(config: &IdentityConfig) -> Self {
        Self::new(Arc::new(RandomIdentityGenerator::new(config.clone())))
    }

    /// The root node. Always a collection.
    pub fn root(&self) -> &Node {
        &self.root
    }

    /// The root members.
    pub fn entities(&self) -> impl Iterator<Item = &Entity> {
        self.root
            .as_collection()
            .into_iter()
            .flat_map(Collection::entities)
    }

    pub fn len(&self) -> usize {
        self.root.as_collection().map_or(0, Collection::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Looks up a node by decoded path segments. An empty path yields the root.
    pub fn get<S: AsRef<str>>(&self, path: &[S]) -> Option<&Node> {
        self.root.lookup(path)
    }

    pub fn to_json(&self) -> Value {
        self.root.to_json()
    }

    pub fn subscribe(&mut self, observer: Arc<dyn MirrorObserver>) -> ObserverId {
        let id = ObserverId(self.next_observer);
        self.next_observer += 1;
        self.observers.push((id, observer));
        id
    }

    /// Removes an observer. Returns false if it was not registered.
    pub fn unsubscribe(&mut self, id: ObserverId) -> bool {
        let before = self.observers.len();
        self.observers.retain(|(observer_id, _)| *observer_id != id);
        self.observers.len() != before
    }

    /// Runs a grouped local mutation.
    ///
    /// Observers receive one [`Origin::Local`] change set holding every delta the
    /// closure recorded. If the closure fails, the changes it made before failing
    /// are kept and still notified.
    pub fn edit<R>(
        &mut self,
        f: impl FnOnce(&mut Editor<'_>) -> Result<R, MirrorError>,
    ) -> Result<R, MirrorError> {
        let mut deltas = Vec::new();
        let result = {
            let mut editor = Editor::new(&mut self.root, self.identity.as_ref(), &mut deltas);
            f(&mut editor)
        };
        self.notify(Origin::Local, deltas);
        result
    }

    /// Applies an inbound batch as one grouped mutation. Missing paths are not created.
    ///
    /// Observers only see the patches that were applied.
    pub fn apply_remote(&mut self, patches: &[Patch]) -> ApplyReport {
        let report = apply_patches(&mut self.root, patches, false);
        let skipped: HashSet<usize> = report.skipped.iter().map(|skip| skip.index).collect();
        let deltas = patches
            .iter()
            .enumerate()
            .filter(|(index, _)| !skipped.contains(index))
            .filter_map(|(_, patch)| Delta::from_patch(patch))
            .collect();
        self.notify(Origin::Remote, deltas);
        report
    }

    /// Replaces the whole tree.
    pub fn replace_root(&mut self, root: Collection) {
        self.root = Node::Collection(root);
        self.notify(Origin::Snapshot, Vec::new());
    }

    /// Adds the members of an initial snapshot to the root.
    ///
    /// Members created locally before the snapshot arrived are kept; a snapshot
    /// member whose identity is already present is dropped. Returns the number
    /// of members added.
    pub fn merge_snapshot(&mut self, snapshot: Collection) -> usize {
        let mut merged = 0;
        if let Node::Collection(root) = &mut self.root {
            for node in snapshot {
                match node {
                    Node::Entity(entity) => {
                        if root.insert(entity) {
                            merged += 1;
                        } else {
                            trace!("Keeping local member over snapshot member");
                        }
                    }
                    other => {
                        root.push(other);
                        merged += 1;
                    }
                }
            }
        }
        self.notify(Origin::Snapshot, Vec::new());
        merged
    }

    fn notify(&self, origin: Origin, deltas: Vec<Delta>) {
        if origin == Origin::Local && deltas.is_empty() {
            return;
        }
        trace!(?origin, deltas = deltas.len(), "Notifying mirror observers");
        let changes = ChangeSet { origin, deltas };
        for (_, observer) in &self.observers {
            observer.on_change(&changes);
        }
    }
}

impl std::fmt::Debug for Mirror {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mirror")
            .field("root", &self.root)
            .field("observers", &self.observers.len())
            .finish()
    }
}
