//! Path resolution against a mirror tree.

use thiserror::Error;

use super::PatchPath;
use crate::model::{Collection, Entity, Identity, Node, NodeKind};

/// Why a path could not be resolved.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ResolveError {
    /// A segment names nothing and creation was not permitted.
    #[error("Segment '{segment}' at depth {depth} not found")]
    Missing { segment: String, depth: usize },

    /// A segment passes through a scalar or a multiset.
    #[error("Segment '{segment}' at depth {depth} crosses a {kind}")]
    NotAContainer {
        segment: String,
        depth: usize,
        kind: NodeKind,
    },
}

/// Resolves all but the last segment of `path`, returning the parent node.
///
/// Collection segments are matched against member identities; entity segments
/// are property names. With `create_missing`, an absent collection member is
/// created as an empty entity, and an absent entity property becomes a
/// collection when the following segment is an identity segment and an entity
/// otherwise.
pub fn resolve_parent<'a>(
    root: &'a mut Node,
    path: &PatchPath,
    create_missing: bool,
) -> Result<&'a mut Node, ResolveError> {
    walk(root, path.segments(), path.parent_segments().len(), create_missing)
}

/// Resolves every segment of `segments`, creating nothing.
pub fn resolve_node<'a, S: AsRef<str>>(
    root: &'a mut Node,
    segments: &[S],
) -> Result<&'a mut Node, ResolveError> {
    walk(root, segments, segments.len(), false)
}

/// Walks the first `depth` segments. Later segments are only consulted for the
/// entity-or-collection decision.
fn walk<'a, S: AsRef<str>>(
    root: &'a mut Node,
    segments: &[S],
    depth: usize,
    create_missing: bool,
) -> Result<&'a mut Node, ResolveError> {
    let mut current = root;
    for (index, segment) in segments[..depth].iter().enumerate() {
        let segment = segment.as_ref();
        current = match current {
            Node::Collection(collection) => {
                let position = match collection.position(segment) {
                    Some(position) => position,
                    None if create_missing => collection.push(Node::Entity(Entity::new())),
                    None => return Err(missing(segment, index)),
                };
                collection.node_mut(position)
            }
            Node::Entity(entity) => {
                if !entity.contains_key(segment) {
                    if !create_missing {
                        return Err(missing(segment, index));
                    }
                    let next: Option<&str> = segments.get(index + 1).map(|s| s.as_ref());
                    let fresh = if next.is_some_and(Identity::looks_like_segment) {
                        Node::Collection(Collection::new())
                    } else {
                        Node::Entity(Entity::new())
                    };
                    entity.insert(segment, fresh);
                }
                match entity.get_mut(segment) {
                    Some(node) => node,
                    None => return Err(missing(segment, index)),
                }
            }
            other => {
                return Err(ResolveError::NotAContainer {
                    segment: segment.to_string(),
                    depth: index,
                    kind: other.kind(),
                });
            }
        };
    }
    Ok(current)
}

fn missing(segment: &str, depth: usize) -> ResolveError {
    ResolveError::Missing {
        segment: segment.to_string(),
        depth,
    }
}
