//!
//! Scopesync: client-side reconciliation for a local-first replicated graph store.
//! This library keeps an in-memory mirror of a scope of the store in sync with the
//! backend through ordered batches of structural patches, in both directions.
//!
//! ## Core Concepts
//!
//! * **Model (`model::Node`)**: The mirrored tree. Entities map property names to values and
//!   carry a composite identity (`@graph` plus `@id`); collections hold identified entities;
//!   multisets hold unique scalars.
//! * **Patches (`patch::Patch`)**: One structural mutation at an escaped `/`-delimited path.
//!   `patch::apply_patches` applies an ordered batch, skipping (never failing on) patches that
//!   cannot be applied.
//! * **Mirrors (`mirror::Mirror`)**: An observable tree. Local edits made through
//!   `mirror::Editor` record deltas that translate into outbound patches.
//! * **Connections (`connection::ConnectionHandle`)**: A counted lease on the mirror for one
//!   (shape, scope) pair. The connection subscribes through a `connection::Bridge`, applies the
//!   initial snapshot and inbound batches, and sends local changes back.

pub mod config;
pub mod connection;
pub mod mirror;
pub mod model;
pub mod patch;

pub use config::MirrorConfig;
pub use connection::{ConnectionHandle, ConnectionRegistry, Scope, ShapeDescriptor};
pub use mirror::Mirror;
pub use patch::{Patch, apply_patches};

/// Result type used throughout the Scopesync library.
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for the Scopesync library.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    /// Malformed patch paths
    #[error(transparent)]
    Path(patch::PathError),

    /// Structured errors from local mirror edits
    #[error(transparent)]
    Mirror(mirror::MirrorError),

    /// Structured errors from the connection lifecycle
    #[error(transparent)]
    Connection(connection::ConnectionError),
}

impl Error {
    /// Get the originating module of this error.
    pub fn module(&self) -> &'static str {
        match self {
            Error::Serialize(_) => "serialize",
            Error::Path(_) => "patch",
            Error::Mirror(_) => "mirror",
            Error::Connection(_) => "connection",
        }
    }

    /// Check if this error indicates a missing node.
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::Mirror(mirror_err) => mirror_err.is_not_found(),
            _ => false,
        }
    }

    /// Check if this error is a node kind mismatch.
    pub fn is_type_error(&self) -> bool {
        match self {
            Error::Mirror(mirror_err) => mirror_err.is_type_error(),
            _ => false,
        }
    }

    /// Check if this error concerns entity identity.
    pub fn is_identity_error(&self) -> bool {
        match self {
            Error::Mirror(mirror_err) => mirror_err.is_identity_error(),
            _ => false,
        }
    }

    /// Check if this error originates in the backend bridge.
    pub fn is_bridge_error(&self) -> bool {
        match self {
            Error::Connection(connection_err) => connection_err.is_bridge_error(),
            _ => false,
        }
    }

    /// Check if this error means a connection never became ready.
    pub fn is_readiness_error(&self) -> bool {
        match self {
            Error::Connection(connection_err) => connection_err.is_readiness_error(),
            _ => false,
        }
    }

    /// Check if this error is a misuse of the transaction API.
    pub fn is_transaction_error(&self) -> bool {
        match self {
            Error::Connection(connection_err) => connection_err.is_transaction_error(),
            _ => false,
        }
    }

    /// Check if this error is a serialization failure.
    pub fn is_serialization_error(&self) -> bool {
        matches!(self, Error::Serialize(_))
    }
}

impl From<patch::PathError> for Error {
    fn from(err: patch::PathError) -> Self {
        Error::Path(err)
    }
}
