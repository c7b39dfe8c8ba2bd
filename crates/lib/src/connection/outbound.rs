//! Translation of local mirror changes into outbound patch batches.
//!
//! The [`OutboundWatcher`] observes a connection's mirror. Local change sets are
//! turned into patches and queued, or accumulated while a transaction is open.
//! A per-connection task drains the queue in order, waiting for readiness
//! before the first send.

use std::sync::{
    Arc, Mutex,
    atomic::{AtomicUsize, Ordering},
};

use tokio::sync::{mpsc, oneshot, watch};
use tracing::{Instrument, debug, error, info_span, warn};

use super::{
    ConnectionError, ConnectionState,
    bridge::{
        BackendSession, ConnectionKey, Scope, ShapeDescriptor, SubscriptionId,
        SubscriptionRequest,
    },
    lock,
};
use crate::{
    mirror::{ChangeSet, MirrorObserver, deltas_to_patches},
    patch::Patch,
};

type Ack = oneshot::Sender<Result<(), ConnectionError>>;

/// One queued outbound batch. An empty batch with an ack is a flush marker.
pub(crate) struct OutboundBatch {
    patches: Vec<Patch>,
    ack: Option<Ack>,
}

/// Mirror observer that forwards local changes to the outbound queue.
pub(crate) struct OutboundWatcher {
    suspended: AtomicUsize,
    transaction: Mutex<Option<Vec<Patch>>>,
    queue: mpsc::UnboundedSender<OutboundBatch>,
}

/// Keeps the watcher suspended until dropped.
pub(crate) struct SuspendGuard<'a> {
    watcher: &'a OutboundWatcher,
}

impl Drop for SuspendGuard<'_> {
    fn drop(&mut self) {
        self.watcher.suspended.fetch_sub(1, Ordering::SeqCst);
    }
}

impl OutboundWatcher {
    pub(crate) fn new(queue: mpsc::UnboundedSender<OutboundBatch>) -> Self {
        Self {
            suspended: AtomicUsize::new(0),
            transaction: Mutex::new(None),
            queue,
        }
    }

    /// Ignores change sets until the guard is dropped. Nests.
    pub(crate) fn suspend(&self) -> SuspendGuard<'_> {
        self.suspended.fetch_add(1, Ordering::SeqCst);
        SuspendGuard { watcher: self }
    }

    pub(crate) fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::SeqCst) > 0
    }

    pub(crate) fn begin_transaction(&self) -> Result<(), ConnectionError> {
        let mut transaction = lock(&self.transaction);
        if transaction.is_some() {
            return Err(ConnectionError::TransactionAlreadyOpen);
        }
        *transaction = Some(Vec::new());
        Ok(())
    }

    pub(crate) fn in_transaction(&self) -> bool {
        lock(&self.transaction).is_some()
    }

    /// Closes the transaction and queues its patches as one batch.
    ///
    /// The receiver resolves once the batch has been sent.
    pub(crate) fn commit_transaction(
        &self,
    ) -> Result<oneshot::Receiver<Result<(), ConnectionError>>, ConnectionError> {
        let patches = lock(&self.transaction)
            .take()
            .ok_or(ConnectionError::NoTransactionOpen)?;
        Ok(self.enqueue_acked(patches))
    }

    /// Queues a marker that resolves once every earlier batch has been handled.
    pub(crate) fn flush(&self) -> oneshot::Receiver<Result<(), ConnectionError>> {
        self.enqueue_acked(Vec::new())
    }

    fn enqueue_acked(&self, patches: Vec<Patch>) -> oneshot::Receiver<Result<(), ConnectionError>> {
        let (ack, receiver) = oneshot::channel();
        self.enqueue(OutboundBatch {
            patches,
            ack: Some(ack),
        });
        receiver
    }

    fn enqueue(&self, batch: OutboundBatch) {
        if self.queue.send(batch).is_err() {
            warn!("Outbound queue closed, dropping batch");
        }
    }
}

impl MirrorObserver for OutboundWatcher {
    fn on_change(&self, changes: &ChangeSet) {
        if self.is_suspended() {
            return;
        }
        let patches = deltas_to_patches(&changes.deltas);
        if patches.is_empty() {
            return;
        }

        let mut transaction = lock(&self.transaction);
        if let Some(pending) = transaction.as_mut() {
            pending.extend(patches);
            return;
        }
        drop(transaction);

        self.enqueue(OutboundBatch { patches, ack: None });
    }
}

/// What the outbound task needs to address the backend.
pub(crate) struct OutboundTarget {
    pub key: ConnectionKey,
    pub shape: ShapeDescriptor,
    pub scope: Scope,
    pub state: watch::Receiver<ConnectionState>,
    pub session: watch::Receiver<Option<BackendSession>>,
}

/// Drains the outbound queue until every sender is gone.
///
/// Batches wait for readiness. Once a subscription id is known, queued batches
/// are still sent after the connection is released; batches queued on a
/// connection that is released before becoming ready fail with `Released`.
pub(crate) async fn run(
    mut queue: mpsc::UnboundedReceiver<OutboundBatch>,
    mut target: OutboundTarget,
) {
    let span = info_span!("outbound", key = %target.key);
    async move {
        let mut subscription: Option<SubscriptionId> = None;
        while let Some(batch) = queue.recv().await {
            let result = match subscription {
                Some(id) => Ok(id),
                None => wait_ready(&mut target).await,
            };
            let result = match result {
                Ok(id) => {
                    subscription = Some(id);
                    send(&target, id, batch.patches).await
                }
                Err(err) => Err(err),
            };
            if let Some(ack) = batch.ack {
                // The caller may have stopped waiting
                let _ = ack.send(result);
            }
        }
        debug!("Outbound queue closed");
    }
    .instrument(span)
    .await
}

async fn wait_ready(target: &mut OutboundTarget) -> Result<SubscriptionId, ConnectionError> {
    let state = match target
        .state
        .wait_for(|state| !matches!(state, ConnectionState::Subscribing))
        .await
    {
        Ok(state) => state.clone(),
        Err(_) => ConnectionState::Released,
    };
    match state {
        ConnectionState::Ready { subscription } => Ok(subscription),
        ConnectionState::Failed(err) => Err(err),
        ConnectionState::Subscribing | ConnectionState::Released => {
            Err(ConnectionError::Released {
                key: target.key.to_string(),
            })
        }
    }
}

async fn send(
    target: &OutboundTarget,
    subscription: SubscriptionId,
    patches: Vec<Patch>,
) -> Result<(), ConnectionError> {
    if patches.is_empty() {
        return Ok(());
    }
    let session = target.session.borrow().clone();
    let Some(session) = session else {
        return Err(ConnectionError::Bridge {
            reason: "no backend session".to_string(),
        });
    };
    let request = SubscriptionRequest {
        shape: target.shape.clone(),
        scope: target.scope.clone(),
        session_id: session.session_id,
    };

    debug!(subscription, patches = patches.len(), "Sending outbound batch");
    let result = session
        .bridge
        .send_update(&request, subscription, patches)
        .await;
    if let Err(err) = &result {
        error!(subscription, %err, "Outbound batch failed");
    }
    result
}

/// Builds a watcher and the receiving end of its queue.
pub(crate) fn channel() -> (Arc<OutboundWatcher>, mpsc::UnboundedReceiver<OutboundBatch>) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (Arc::new(OutboundWatcher::new(sender)), receiver)
}
