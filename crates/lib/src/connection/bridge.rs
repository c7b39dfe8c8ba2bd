//! The narrow interface to the backing store.
//!
//! A [`Bridge`] starts subscriptions and accepts outbound patch batches. The
//! backend answers a subscription with exactly one [`BackendMessage::Initial`]
//! followed by any number of [`BackendMessage::Update`]s, delivered on the
//! [`MessageSink`] handed to [`Bridge::subscribe`]. The subscription ends when
//! the receiving side of the sink is dropped.

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::warn;

use super::ConnectionError;
use crate::patch::Patch;

/// Backend-assigned id of a live subscription.
pub type SubscriptionId = u64;

/// Backend-assigned id of a client session.
pub type SessionId = u64;

/// Delivers backend messages to one connection.
pub type MessageSink = mpsc::UnboundedSender<BackendMessage>;

/// Identifies which entity kind a connection mirrors.
///
/// The schema is opaque here and passed through to the backend unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShapeDescriptor {
    pub shape: String,
    #[serde(default)]
    pub schema: Value,
}

impl ShapeDescriptor {
    pub fn new(shape: impl Into<String>) -> Self {
        Self {
            shape: shape.into(),
            schema: Value::Null,
        }
    }

    pub fn with_schema(mut self, schema: Value) -> Self {
        self.schema = schema;
        self
    }
}

/// The subset of the store a connection mirrors: a set of graphs, optionally
/// narrowed to a set of subjects.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Scope {
    #[serde(default)]
    pub graphs: Vec<String>,
    #[serde(default)]
    pub subjects: Vec<String>,
}

impl Scope {
    pub fn graphs<I, S>(graphs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            graphs: graphs.into_iter().map(Into::into).collect(),
            subjects: Vec::new(),
        }
    }

    pub fn with_subjects<I, S>(mut self, subjects: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.subjects = subjects.into_iter().map(Into::into).collect();
        self
    }

    /// Order-independent rendering: sorted, comma-joined graphs, then `;` and
    /// the sorted subjects when there are any.
    pub fn canonical(&self) -> String {
        let graphs = sorted_join(&self.graphs);
        if self.subjects.is_empty() {
            graphs
        } else {
            format!("{graphs};{}", sorted_join(&self.subjects))
        }
    }
}

fn sorted_join(values: &[String]) -> String {
    let mut sorted: Vec<&str> = values.iter().map(String::as_str).collect();
    sorted.sort_unstable();
    sorted.join(",")
}

/// Registry key of a connection: `{shape}::{canonical scope}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionKey(String);

impl ConnectionKey {
    pub fn new(shape: &ShapeDescriptor, scope: &Scope) -> Self {
        Self(format!("{}::{}", shape.shape, scope.canonical()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Everything a bridge needs to start or address a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionRequest {
    pub shape: ShapeDescriptor,
    pub scope: Scope,
    pub session_id: SessionId,
}

impl SubscriptionRequest {
    pub fn key(&self) -> ConnectionKey {
        ConnectionKey::new(&self.shape, &self.scope)
    }
}

/// A message from the backend for one subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendMessage {
    /// The full initial state, in transport JSON form.
    Initial {
        snapshot: Value,
        subscription_id: SubscriptionId,
    },
    /// An ordered batch of changes.
    Update { patches: Vec<Patch> },
}

impl BackendMessage {
    /// Decodes a raw message. Unknown or malformed messages are logged and
    /// yield `None`.
    pub fn decode(raw: Value) -> Option<Self> {
        match serde_json::from_value(raw) {
            Ok(message) => Some(message),
            Err(err) => {
                warn!(%err, "Ignoring unknown backend message");
                None
            }
        }
    }
}

/// The backend as seen by connections.
#[async_trait]
pub trait Bridge: Send + Sync {
    /// Starts a subscription whose messages are delivered on `sink`.
    ///
    /// Returning `Ok` means the subscription was accepted; the initial snapshot
    /// may arrive later.
    async fn subscribe(
        &self,
        request: &SubscriptionRequest,
        sink: MessageSink,
    ) -> Result<(), ConnectionError>;

    /// Sends one outbound batch for a live subscription.
    async fn send_update(
        &self,
        request: &SubscriptionRequest,
        subscription: SubscriptionId,
        patches: Vec<Patch>,
    ) -> Result<(), ConnectionError>;
}

/// A bridge together with the session it belongs to.
#[derive(Clone)]
pub struct BackendSession {
    pub bridge: Arc<dyn Bridge>,
    pub session_id: SessionId,
}

impl fmt::Debug for BackendSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendSession")
            .field("session_id", &self.session_id)
            .finish_non_exhaustive()
    }
}
