//! Error types for local mirror edits.

use thiserror::Error;

use crate::{
    model::{Identity, NodeKind},
    patch::ResolveError,
};

/// Structured error types for edits made through a [`crate::mirror::Editor`].
///
/// An edit that fails leaves the mirror as it was at the point of failure;
/// changes made earlier in the same edit closure are kept and still notified.
#[non_exhaustive]
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MirrorError {
    /// The path does not name an existing node
    #[error("Path not found: {path}")]
    PathNotFound { path: String },

    /// The path names a node of the wrong kind
    #[error("Expected {expected} at {path}, found {actual}")]
    KindMismatch {
        path: String,
        expected: NodeKind,
        actual: NodeKind,
    },

    /// An empty path was given where a property or member is required
    #[error("Edits cannot target the root")]
    RootPath,

    /// `@graph` and `@id` are set once, when an entity is inserted
    #[error("Identity field '{field}' is read-only")]
    ReadOnlyField { field: String },

    /// A new root entity was inserted without naming its graph
    #[error("Root entity '{subject}' has no graph")]
    MissingGraph { subject: String },

    /// The collection already holds an entity with this identity
    #[error("Duplicate identity {identity} in {path}")]
    DuplicateIdentity { path: String, identity: Identity },
}

impl MirrorError {
    /// Check if this error is a lookup failure
    pub fn is_not_found(&self) -> bool {
        matches!(self, MirrorError::PathNotFound { .. })
    }

    /// Check if this error is a node kind mismatch
    pub fn is_type_error(&self) -> bool {
        matches!(self, MirrorError::KindMismatch { .. })
    }

    /// Check if this error concerns entity identity
    pub fn is_identity_error(&self) -> bool {
        matches!(
            self,
            MirrorError::ReadOnlyField { .. }
                | MirrorError::MissingGraph { .. }
                | MirrorError::DuplicateIdentity { .. }
        )
    }

    /// Get the path if this is a path-related error
    pub fn path(&self) -> Option<&str> {
        match self {
            MirrorError::PathNotFound { path }
            | MirrorError::KindMismatch { path, .. }
            | MirrorError::DuplicateIdentity { path, .. } => Some(path),
            _ => None,
        }
    }

    pub(crate) fn from_resolve(path: &str, err: ResolveError) -> Self {
        match err {
            ResolveError::Missing { .. } => MirrorError::PathNotFound {
                path: path.to_string(),
            },
            ResolveError::NotAContainer { kind, .. } => MirrorError::KindMismatch {
                path: path.to_string(),
                expected: NodeKind::Entity,
                actual: kind,
            },
        }
    }
}

impl From<MirrorError> for crate::Error {
    fn from(err: MirrorError) -> Self {
        crate::Error::Mirror(err)
    }
}
