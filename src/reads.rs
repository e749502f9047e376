use crate::ids::{Index, ReadId, ServerId};
use crate::types::ReadBarrierReply;
use std::collections::VecDeque;
use tokio::sync::oneshot;

struct ActiveRead {
    id: ReadId,
    idx: Index,
    promise: oneshot::Sender<ReadBarrierReply>,
}

/// In-flight read barriers in insertion order. Read ids grow per leader, so
/// a quorum confirmation for id N releases the whole prefix with id <= N.
#[derive(Default)]
pub(crate) struct ReadTracker {
    reads: VecDeque<ActiveRead>,
}

impl ReadTracker {
    pub fn push(&mut self, id: ReadId, idx: Index) -> oneshot::Receiver<ReadBarrierReply> {
        let (tx, rx) = oneshot::channel();
        self.reads.push_back(ActiveRead { id, idx, promise: tx });
        rx
    }

    /// Release every barrier whose id has quorum confirmation.
    pub fn resolve_up_to(&mut self, max_confirmed: ReadId) {
        while let Some(front) = self.reads.front() {
            if front.id > max_confirmed {
                break;
            }
            if let Some(read) = self.reads.pop_front() {
                let _ = read.promise.send(ReadBarrierReply::Ready(read.idx));
            }
        }
    }

    /// Leadership is gone; no outstanding barrier can complete here.
    pub fn fail_all(&mut self, leader: Option<ServerId>) {
        for read in self.reads.drain(..) {
            let _ = read.promise.send(ReadBarrierReply::NotALeader(leader));
        }
    }
}
