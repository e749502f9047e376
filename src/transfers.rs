use crate::ids::ServerId;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

pub fn transfer_cancel_pair() -> (TransferCancelHandle, TransferCancelSignal) {
    let (tx, rx) = oneshot::channel();

    (TransferCancelHandle { _tx: tx }, TransferCancelSignal { rx })
}

/// Held by the transfer registry; dropping it requests cancellation of the
/// in-flight snapshot send.
pub struct TransferCancelHandle {
    _tx: oneshot::Sender<()>,
}

/// Resolves once cancellation was requested. Handed to the transport so a
/// long snapshot send can return early.
pub struct TransferCancelSignal {
    rx: oneshot::Receiver<()>,
}

impl Future for TransferCancelSignal {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // Sent value and dropped sender both mean "cancel".
        let _ = ready!(Pin::new(&mut self.rx).poll(cx));
        Poll::Ready(())
    }
}

struct LiveTransfer {
    id: u64,
    cancel: TransferCancelHandle,
    task: JoinHandle<()>,
}

/// What a completing transfer task should do with its result.
#[derive(Debug, PartialEq)]
pub(crate) enum TransferCompletion {
    /// Still live: feed the reply back into the protocol core.
    Deliver,
    /// Aborted while in flight: discard the result.
    Discard,
}

/// Outbound snapshot transfer bookkeeping. At most one live transfer per
/// destination. Aborted transfers keep their task handles around so that
/// shutdown can drain them instead of orphaning the sends.
#[derive(Default)]
pub(crate) struct SnapshotTransfers {
    next_transfer_id: u64,
    live: HashMap<ServerId, LiveTransfer>,
    aborted: HashMap<u64, JoinHandle<()>>,
}

impl SnapshotTransfers {
    pub fn next_id(&mut self) -> u64 {
        let id = self.next_transfer_id;
        self.next_transfer_id += 1;
        id
    }

    pub fn insert(&mut self, dst: ServerId, id: u64, cancel: TransferCancelHandle, task: JoinHandle<()>) {
        let previous = self.live.insert(dst, LiveTransfer { id, cancel, task });
        assert!(previous.is_none(), "snapshot transfer to {} already in flight", dst);
    }

    /// Called by the transfer task itself once the send resolved.
    pub fn finish(&mut self, dst: ServerId, id: u64) -> TransferCompletion {
        if self.aborted.remove(&id).is_some() {
            return TransferCompletion::Discard;
        }
        // An id that is neither live nor parked was already drained by
        // shutdown; its result is stale.
        if self.live.get(&dst).map(|transfer| transfer.id) == Some(id) {
            self.live.remove(&dst);
            return TransferCompletion::Deliver;
        }
        TransferCompletion::Discard
    }

    /// Request cancellation of the transfer to `dst`, keeping its task for
    /// the shutdown drain.
    pub fn abort_one(&mut self, dst: ServerId) {
        if let Some(transfer) = self.live.remove(&dst) {
            self.aborted.insert(transfer.id, transfer.task);
            drop(transfer.cancel);
        }
    }

    /// Request cancellation of every live transfer.
    pub fn abort_all(&mut self) {
        for (_, transfer) in self.live.drain() {
            self.aborted.insert(transfer.id, transfer.task);
            drop(transfer.cancel);
        }
    }

    /// Take every parked task handle for the final join.
    pub fn drain(&mut self) -> Vec<JoinHandle<()>> {
        self.aborted.drain().map(|(_, task)| task).collect()
    }

    pub fn has_live(&self, dst: &ServerId) -> bool {
        self.live.contains_key(dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn parked_task(cancel: TransferCancelSignal) {
        cancel.await;
    }

    #[tokio::test]
    async fn abort_moves_transfer_to_drain_set() {
        let mut transfers = SnapshotTransfers::default();
        let dst = ServerId::random();

        let id = transfers.next_id();
        let (handle, signal) = transfer_cancel_pair();
        let task = tokio::spawn(parked_task(signal));
        transfers.insert(dst, id, handle, task);
        assert!(transfers.has_live(&dst));

        transfers.abort_one(dst);
        assert!(!transfers.has_live(&dst));

        // A completion arriving after the abort is discarded.
        assert_eq!(transfers.finish(dst, id), TransferCompletion::Discard);

        // The drained task resolves because the cancel handle was dropped.
        for task in transfers.drain() {
            task.await.unwrap();
        }
    }

    #[tokio::test]
    async fn live_completion_is_delivered() {
        let mut transfers = SnapshotTransfers::default();
        let dst = ServerId::random();

        let id = transfers.next_id();
        let (handle, signal) = transfer_cancel_pair();
        let task = tokio::spawn(parked_task(signal));
        transfers.insert(dst, id, handle, task);

        assert_eq!(transfers.finish(dst, id), TransferCompletion::Deliver);
        assert!(!transfers.has_live(&dst));
    }

    #[tokio::test]
    async fn abort_all_cancels_every_destination() {
        let mut transfers = SnapshotTransfers::default();

        for _ in 0..3 {
            let dst = ServerId::random();
            let id = transfers.next_id();
            let (handle, signal) = transfer_cancel_pair();
            let task = tokio::spawn(parked_task(signal));
            transfers.insert(dst, id, handle, task);
        }

        transfers.abort_all();
        let drained = transfers.drain();
        assert_eq!(drained.len(), 3);
        for task in drained {
            task.await.unwrap();
        }
    }
}
