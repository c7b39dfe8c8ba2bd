//! In-process backend bridge.
//!
//! [`MemoryBridge`] answers subscriptions from configured snapshots and records
//! outbound batches. It backs the crate's tests and can stand in for a real
//! backend when embedding mirrors in a single process.

use std::{collections::HashMap, sync::Mutex};

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use super::{
    BackendMessage, Bridge, ConnectionError, MessageSink, SubscriptionId, SubscriptionRequest,
    lock,
};
use crate::patch::Patch;

/// An outbound batch received by a [`MemoryBridge`].
#[derive(Debug, Clone, PartialEq)]
pub struct SentUpdate {
    pub subscription: SubscriptionId,
    pub shape: String,
    pub patches: Vec<Patch>,
}

struct Subscription {
    id: SubscriptionId,
    request: SubscriptionRequest,
    sink: MessageSink,
    /// Initial message withheld by [`MemoryBridge::hold_initial`].
    held: Option<BackendMessage>,
}

#[derive(Default)]
struct MemoryState {
    snapshots: HashMap<String, Value>,
    subscriptions: Vec<Subscription>,
    next_subscription: SubscriptionId,
    subscribe_calls: usize,
    subscribe_error: Option<String>,
    update_error: Option<String>,
    hold_initial: bool,
    sent: Vec<SentUpdate>,
}

impl MemoryState {
    fn prune(&mut self) {
        self.subscriptions.retain(|subscription| !subscription.sink.is_closed());
    }
}

/// A [`Bridge`] backed by in-memory state.
#[derive(Default)]
pub struct MemoryBridge {
    state: Mutex<MemoryState>,
}

impl MemoryBridge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the snapshot returned to new subscriptions for `shape`.
    ///
    /// Shapes without a snapshot start empty.
    pub fn set_snapshot(&self, shape: &str, snapshot: Value) {
        lock(&self.state).snapshots.insert(shape.to_string(), snapshot);
    }

    /// Makes subsequent subscriptions fail with `reason`, or succeed again with `None`.
    pub fn fail_subscriptions(&self, reason: Option<&str>) {
        lock(&self.state).subscribe_error = reason.map(str::to_string);
    }

    /// Makes subsequent outbound batches fail with `reason`, or succeed again with `None`.
    pub fn fail_updates(&self, reason: Option<&str>) {
        lock(&self.state).update_error = reason.map(str::to_string);
    }

    /// While set, initial snapshots are withheld until [`release_initial`](Self::release_initial).
    pub fn hold_initial(&self, hold: bool) {
        lock(&self.state).hold_initial = hold;
    }

    /// Delivers every withheld initial snapshot. Returns how many were delivered.
    pub fn release_initial(&self) -> usize {
        let mut state = lock(&self.state);
        state.prune();
        let mut delivered = 0;
        for subscription in &mut state.subscriptions {
            if let Some(message) = subscription.held.take() {
                if subscription.sink.send(message).is_ok() {
                    delivered += 1;
                }
            }
        }
        delivered
    }

    /// Sends a patch batch to every open subscription for `shape`.
    ///
    /// Returns the number of subscriptions reached.
    pub fn push_update(&self, shape: &str, patches: Vec<Patch>) -> usize {
        self.push(shape, BackendMessage::Update { patches })
    }

    /// Decodes and delivers a raw message. Unknown messages are dropped.
    pub fn push_raw(&self, shape: &str, raw: Value) -> usize {
        match BackendMessage::decode(raw) {
            Some(message) => self.push(shape, message),
            None => 0,
        }
    }

    fn push(&self, shape: &str, message: BackendMessage) -> usize {
        let mut state = lock(&self.state);
        state.prune();
        let mut reached = 0;
        for subscription in &state.subscriptions {
            if subscription.request.shape.shape == shape
                && subscription.sink.send(message.clone()).is_ok()
            {
                reached += 1;
            }
        }
        debug!(shape, reached, "Pushed backend message");
        reached
    }

    /// Subscriptions whose connection is still listening.
    pub fn open_subscriptions(&self) -> usize {
        let mut state = lock(&self.state);
        state.prune();
        state.subscriptions.len()
    }

    /// Ids of the open subscriptions, oldest first.
    pub fn subscription_ids(&self) -> Vec<SubscriptionId> {
        let mut state = lock(&self.state);
        state.prune();
        state.subscriptions.iter().map(|subscription| subscription.id).collect()
    }

    /// Total number of subscribe calls, including failed ones.
    pub fn subscribe_calls(&self) -> usize {
        lock(&self.state).subscribe_calls
    }

    /// Every outbound batch received so far, in order.
    pub fn sent(&self) -> Vec<SentUpdate> {
        lock(&self.state).sent.clone()
    }
}

#[async_trait]
impl Bridge for MemoryBridge {
    async fn subscribe(
        &self,
        request: &SubscriptionRequest,
        sink: MessageSink,
    ) -> Result<(), ConnectionError> {
        let mut state = lock(&self.state);
        state.subscribe_calls += 1;
        if let Some(reason) = &state.subscribe_error {
            return Err(ConnectionError::Bridge {
                reason: reason.clone(),
            });
        }

        state.next_subscription += 1;
        let id = state.next_subscription;
        let initial = BackendMessage::Initial {
            snapshot: state
                .snapshots
                .get(&request.shape.shape)
                .cloned()
                .unwrap_or(Value::Null),
            subscription_id: id,
        };

        let held = if state.hold_initial {
            Some(initial)
        } else {
            // A closed sink is pruned on the next push
            let _ = sink.send(initial);
            None
        };
        state.subscriptions.push(Subscription {
            id,
            request: request.clone(),
            sink,
            held,
        });
        debug!(subscription = id, key = %request.key(), "Accepted subscription");
        Ok(())
    }

    async fn send_update(
        &self,
        request: &SubscriptionRequest,
        subscription: SubscriptionId,
        patches: Vec<Patch>,
    ) -> Result<(), ConnectionError> {
        let mut state = lock(&self.state);
        if let Some(reason) = &state.update_error {
            return Err(ConnectionError::Bridge {
                reason: reason.clone(),
            });
        }
        state.sent.push(SentUpdate {
            subscription,
            shape: request.shape.shape.clone(),
            patches,
        });
        Ok(())
    }
}
