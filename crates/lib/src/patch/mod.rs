//! Structural patches and their application to a mirror tree.
//!
//! A [`Patch`] describes one structural mutation at a path. Its wire form is
//! inspired by RFC 6902 but is not compatible with it:
//!
//! ```jsonc
//! // Single nested entity: the identity patches follow immediately
//! { "op": "add", "path": "/g|urn:p1/address", "valType": "object" }
//! { "op": "add", "path": "/g|urn:p1/address/@graph", "value": "g" }
//! { "op": "add", "path": "/g|urn:p1/address/@id", "value": "urn:addr1" }
//! { "op": "add", "path": "/g|urn:p1/address/street", "value": "1st street" }
//!
//! // Keyed collection: no identity patches follow the container itself
//! { "op": "add", "path": "/g|urn:p1/children", "valType": "object" }
//! { "op": "add", "path": "/g|urn:p1/children/g|urn:c1", "valType": "object" }
//! { "op": "add", "path": "/g|urn:p1/children/g|urn:c1/@graph", "value": "g" }
//! { "op": "add", "path": "/g|urn:p1/children/g|urn:c1/@id", "value": "urn:c1" }
//! { "op": "remove", "path": "/g|urn:p1/children/g|urn:c1" }
//!
//! // Primitive multisets
//! { "op": "add", "valType": "set", "path": "/g|urn:p1/tags", "value": ["a", "b"] }
//! { "op": "remove", "valType": "set", "path": "/g|urn:p1/tags", "value": "a" }
//! ```
//!
//! See [`apply::apply_patches`] for the application algorithm and the ordering
//! contract producers must honour.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::{GRAPH_FIELD, SUBJECT_FIELD, Scalar};

pub mod apply;
pub mod path;
pub mod resolve;

pub use apply::{ApplyReport, SkipReason, SkippedPatch, apply_patches};
pub use path::{PatchPath, PathError};
pub use resolve::ResolveError;

/// Mutation kind of a patch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Op {
    Add,
    Remove,
}

/// Declares what kind of value a patch carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValType {
    /// One or many scalars for a primitive multiset.
    Set,
    /// The target becomes an entity or a collection.
    Object,
}

/// One structural mutation at a path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Patch {
    /// Escaped path from the root to the mutated location.
    pub path: String,
    pub op: Op,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub val_type: Option<ValType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

/// The semantic variant of a [`Patch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PatchKind {
    /// Union scalars into a multiset.
    SetAdd,
    /// Subtract scalars from a multiset.
    SetRemove,
    /// Make the target an entity or a collection.
    ObjectAdd,
    /// Delete a property or an identified collection member.
    Remove,
    /// Assign `@graph` or `@id`.
    IdentityAdd,
    /// Assign a scalar to a property.
    LiteralAdd,
}

impl Patch {
    pub fn set_add<S: Into<Scalar>>(path: impl Into<String>, values: impl IntoIterator<Item = S>) -> Self {
        Self {
            path: path.into(),
            op: Op::Add,
            val_type: Some(ValType::Set),
            value: Some(scalars_to_json(values)),
        }
    }

    pub fn set_remove<S: Into<Scalar>>(
        path: impl Into<String>,
        values: impl IntoIterator<Item = S>,
    ) -> Self {
        Self {
            path: path.into(),
            op: Op::Remove,
            val_type: Some(ValType::Set),
            value: Some(scalars_to_json(values)),
        }
    }

    pub fn object_add(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            op: Op::Add,
            val_type: Some(ValType::Object),
            value: None,
        }
    }

    pub fn literal(path: impl Into<String>, value: impl Into<Scalar>) -> Self {
        Self {
            path: path.into(),
            op: Op::Add,
            val_type: None,
            value: Some(value.into().to_json()),
        }
    }

    pub fn remove(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            op: Op::Remove,
            val_type: None,
            value: None,
        }
    }

    /// Classifies the patch.
    ///
    /// An add without `valType` whose value is a JSON object is treated as an
    /// object add, which some producers emit instead of `valType: "object"`.
    pub fn kind(&self) -> PatchKind {
        match (self.op, self.val_type) {
            (Op::Add, Some(ValType::Set)) => PatchKind::SetAdd,
            (Op::Remove, Some(ValType::Set)) => PatchKind::SetRemove,
            (Op::Add, Some(ValType::Object)) => PatchKind::ObjectAdd,
            (Op::Remove, _) => PatchKind::Remove,
            (Op::Add, None) if matches!(self.value, Some(Value::Object(_))) => PatchKind::ObjectAdd,
            (Op::Add, None) if self.targets_identity_field() => PatchKind::IdentityAdd,
            (Op::Add, None) => PatchKind::LiteralAdd,
        }
    }

    /// Returns true if the last path segment is `@graph` or `@id`.
    pub fn targets_identity_field(&self) -> bool {
        let last = self.path.rsplit('/').next().unwrap_or_default();
        last == GRAPH_FIELD || last == SUBJECT_FIELD
    }
}

fn scalars_to_json<S: Into<Scalar>>(values: impl IntoIterator<Item = S>) -> Value {
    Value::Array(values.into_iter().map(|v| v.into().to_json()).collect())
}
