use crate::error::Error;
use crate::ids::{Index, Term};
use crate::types::LogEntryRef;
use std::collections::BTreeMap;
use tokio::sync::oneshot;

pub(crate) type Notifier = oneshot::Sender<Result<(), Error>>;

/// What a submitted entry's waiter is released on.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum WaitType {
    /// Released once the entry is replicated to a majority.
    Committed,
    /// Released once the entry is applied to the user state machine.
    Applied,
}

struct EntryWaiter {
    // Term the entry was submitted with. A committed entry with a different
    // term at the same index means the submission was replaced.
    term: Term,
    done: Notifier,
}

/// Client promises keyed by log index, one map per wait type. The apply
/// pipeline resolves them in index order; commit waiters for an index are
/// always resolved before apply waiters for the same index because
/// commit notification happens before the state machine apply.
#[derive(Default)]
pub(crate) struct WaiterRegistry {
    awaited_commits: BTreeMap<Index, EntryWaiter>,
    awaited_applies: BTreeMap<Index, EntryWaiter>,
}

impl WaiterRegistry {
    pub fn register(&mut self, wait: WaitType, idx: Index, term: Term, done: Notifier) {
        let map = match wait {
            WaitType::Committed => &mut self.awaited_commits,
            WaitType::Applied => &mut self.awaited_applies,
        };
        let previous = map.insert(idx, EntryWaiter { term, done });
        assert!(previous.is_none(), "duplicate waiter registered at index {}", idx);
    }

    /// Resolve commit waiters against a committed batch. Returns how many
    /// waiters were awakened.
    pub fn notify_committed(&mut self, entries: &[LogEntryRef]) -> u64 {
        notify(&mut self.awaited_commits, entries)
    }

    /// Resolve apply waiters against an applied batch.
    pub fn notify_applied(&mut self, entries: &[LogEntryRef]) -> u64 {
        notify(&mut self.awaited_applies, entries)
    }

    /// Fail waiters at index <= `up_to` (all of them if absent) with
    /// `CommitStatusUnknown`: the server lost track of those entries, either
    /// because it was deposed or because a snapshot subsumed them.
    pub fn drop_waiters(&mut self, up_to: Option<Index>) -> u64 {
        fail_up_to(&mut self.awaited_commits, up_to, Error::CommitStatusUnknown)
            + fail_up_to(&mut self.awaited_applies, up_to, Error::CommitStatusUnknown)
    }

    /// Fail every waiter with `error`. Shutdown path.
    pub fn fail_all(&mut self, error: Error) -> u64 {
        fail_up_to(&mut self.awaited_commits, None, error.clone())
            + fail_up_to(&mut self.awaited_applies, None, error)
    }
}

fn notify(waiters: &mut BTreeMap<Index, EntryWaiter>, entries: &[LogEntryRef]) -> u64 {
    let (first, last) = match (entries.first(), entries.last()) {
        (Some(first), Some(last)) => (first, last),
        _ => return 0,
    };
    let first_idx = first.idx;
    let commit_idx = last.idx;
    let mut awaken = 0;

    while let Some(slot) = waiters.first_entry() {
        let idx = *slot.key();
        if idx > commit_idx {
            break;
        }
        // A waiter below the batch start means a notification arrived out
        // of order, which the apply queue ordering forbids.
        assert!(
            idx >= first_idx,
            "waiter at index {} notified out of order (batch starts at {})",
            idx,
            first_idx
        );
        let waiter = slot.remove();
        let offset = (idx.val() - first_idx.val()) as usize;
        let result = if waiter.term == entries[offset].term {
            Ok(())
        } else {
            // A leadership change replaced the entry between submission and
            // commit.
            Err(Error::DroppedEntry)
        };
        let _ = waiter.done.send(result);
        awaken += 1;
    }

    // Terms in the log only grow, so a residual waiter with a term below
    // the last committed one can never commit.
    let last_term = last.term;
    while let Some(slot) = waiters.first_entry() {
        if slot.get().term >= last_term {
            break;
        }
        let waiter = slot.remove();
        let _ = waiter.done.send(Err(Error::DroppedEntry));
        awaken += 1;
    }

    awaken
}

fn fail_up_to(waiters: &mut BTreeMap<Index, EntryWaiter>, up_to: Option<Index>, error: Error) -> u64 {
    let mut dropped = 0;
    while let Some(slot) = waiters.first_entry() {
        if let Some(limit) = up_to {
            if *slot.key() > limit {
                break;
            }
        }
        let waiter = slot.remove();
        let _ = waiter.done.send(Err(error.clone()));
        dropped += 1;
    }
    dropped
}

/// Promises waiting for the apply index to reach a given log index, in
/// support of read barriers. Multiple waiters may share one index.
#[derive(Default)]
pub(crate) struct AppliedWaiters {
    waiters: BTreeMap<Index, Vec<Notifier>>,
}

impl AppliedWaiters {
    pub fn register(&mut self, idx: Index) -> oneshot::Receiver<Result<(), Error>> {
        let (tx, rx) = oneshot::channel();
        self.waiters.entry(idx).or_default().push(tx);
        rx
    }

    /// Release every waiter at index <= `applied`.
    pub fn signal_up_to(&mut self, applied: Index) {
        while let Some(slot) = self.waiters.first_entry() {
            if *slot.key() > applied {
                break;
            }
            for done in slot.remove() {
                let _ = done.send(Ok(()));
            }
        }
    }

    pub fn fail_all(&mut self, error: Error) {
        for (_, senders) in std::mem::take(&mut self.waiters) {
            for done in senders {
                let _ = done.send(Err(error.clone()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EntryPayload, LogEntry};
    use proptest::prelude::*;
    use std::sync::Arc;

    fn entry(term: u64, idx: u64) -> LogEntryRef {
        Arc::new(LogEntry {
            term: Term::new(term),
            idx: Index::new(idx),
            payload: EntryPayload::Dummy,
        })
    }

    fn register(
        registry: &mut WaiterRegistry,
        wait: WaitType,
        idx: u64,
        term: u64,
    ) -> oneshot::Receiver<Result<(), Error>> {
        let (tx, rx) = oneshot::channel();
        registry.register(wait, Index::new(idx), Term::new(term), tx);
        rx
    }

    fn resolved(mut rx: oneshot::Receiver<Result<(), Error>>) -> Result<(), Error> {
        rx.try_recv().expect("waiter should be resolved")
    }

    #[test]
    fn matching_term_resolves_successfully() {
        let mut registry = WaiterRegistry::default();
        let rx1 = register(&mut registry, WaitType::Committed, 1, 2);
        let rx2 = register(&mut registry, WaitType::Committed, 2, 2);

        let awaken = registry.notify_committed(&[entry(2, 1), entry(2, 2)]);

        assert_eq!(awaken, 2);
        assert_eq!(resolved(rx1), Ok(()));
        assert_eq!(resolved(rx2), Ok(()));
    }

    #[test]
    fn term_mismatch_fails_with_dropped_entry() {
        let mut registry = WaiterRegistry::default();
        let rx = register(&mut registry, WaitType::Committed, 5, 2);

        // Index 5 was overwritten by a term-3 entry.
        registry.notify_committed(&[entry(3, 5)]);

        assert_eq!(resolved(rx), Err(Error::DroppedEntry));
    }

    #[test]
    fn residual_lower_term_waiters_are_evicted() {
        let mut registry = WaiterRegistry::default();
        // Waiter beyond the committed batch, but with an outdated term.
        let stale = register(&mut registry, WaitType::Committed, 9, 2);
        // Waiter beyond the batch with a current term stays pending.
        let pending = register(&mut registry, WaitType::Committed, 10, 3);

        registry.notify_committed(&[entry(3, 4)]);

        assert_eq!(resolved(stale), Err(Error::DroppedEntry));
        let mut pending = pending;
        pending.try_recv().expect_err("current-term waiter must stay pending");
    }

    #[test]
    #[should_panic(expected = "out of order")]
    fn out_of_order_notification_is_a_bug() {
        let mut registry = WaiterRegistry::default();
        let _rx = register(&mut registry, WaitType::Committed, 1, 1);

        // Batch starting past the pending waiter.
        registry.notify_committed(&[entry(1, 3)]);
    }

    #[test]
    #[should_panic(expected = "duplicate waiter")]
    fn duplicate_registration_is_a_bug() {
        let mut registry = WaiterRegistry::default();
        let _rx1 = register(&mut registry, WaitType::Applied, 4, 1);
        let _rx2 = register(&mut registry, WaitType::Applied, 4, 1);
    }

    #[test]
    fn drop_waiters_respects_upper_bound() {
        let mut registry = WaiterRegistry::default();
        let below = register(&mut registry, WaitType::Committed, 3, 1);
        let above = register(&mut registry, WaitType::Applied, 8, 1);

        let dropped = registry.drop_waiters(Some(Index::new(5)));

        assert_eq!(dropped, 1);
        assert_eq!(resolved(below), Err(Error::CommitStatusUnknown));
        let mut above = above;
        above.try_recv().expect_err("waiter above the bound must survive");
    }

    #[test]
    fn fail_all_uses_given_error() {
        let mut registry = WaiterRegistry::default();
        let commit = register(&mut registry, WaitType::Committed, 1, 1);
        let apply = register(&mut registry, WaitType::Applied, 2, 1);

        registry.fail_all(Error::Stopped);

        assert_eq!(resolved(commit), Err(Error::Stopped));
        assert_eq!(resolved(apply), Err(Error::Stopped));
    }

    #[test]
    fn applied_waiters_release_in_index_order() {
        let mut waiters = AppliedWaiters::default();
        let rx3 = waiters.register(Index::new(3));
        let rx3b = waiters.register(Index::new(3));
        let rx5 = waiters.register(Index::new(5));

        waiters.signal_up_to(Index::new(4));

        assert_eq!(resolved(rx3), Ok(()));
        assert_eq!(resolved(rx3b), Ok(()));
        let mut rx5 = rx5;
        rx5.try_recv().expect_err("index 5 not applied yet");

        waiters.fail_all(Error::Stopped);
        assert_eq!(resolved(rx5), Err(Error::Stopped));
    }

    proptest! {
        /// For any batch and any set of waiters at or past the batch start,
        /// notification resolves exactly the waiters inside the batch range
        /// (successfully iff the terms match) plus stale-term waiters past
        /// the range.
        #[test]
        fn notify_resolves_exactly_the_covered_prefix(
            first_idx in 1u64..5,
            terms in prop::collection::vec(1u64..5, 1..8),
            waiter_specs in prop::collection::btree_map(0u64..12, 1u64..6, 0..8),
        ) {
            // Batch with non-decreasing terms, contiguous indexes.
            let mut sorted_terms = terms;
            sorted_terms.sort_unstable();
            let batch: Vec<LogEntryRef> = sorted_terms
                .iter()
                .enumerate()
                .map(|(offset, term)| entry(*term, first_idx + offset as u64))
                .collect();
            let last = batch.last().unwrap();
            let (last_idx, last_term) = (last.idx, last.term);

            let mut registry = WaiterRegistry::default();
            let mut receivers = Vec::new();
            for (offset, term) in waiter_specs {
                let idx = first_idx + offset;
                let rx = register(&mut registry, WaitType::Committed, idx, term);
                receivers.push((Index::new(idx), Term::new(term), rx));
            }

            registry.notify_committed(&batch);

            for (idx, term, mut rx) in receivers {
                if idx <= last_idx {
                    let offset = (idx.val() - first_idx) as usize;
                    let expected = if term == batch[offset].term {
                        Ok(())
                    } else {
                        Err(Error::DroppedEntry)
                    };
                    prop_assert_eq!(rx.try_recv().unwrap(), expected);
                } else if term < last_term {
                    prop_assert_eq!(rx.try_recv().unwrap(), Err(Error::DroppedEntry));
                } else {
                    prop_assert!(rx.try_recv().is_err());
                }
            }
        }
    }
}
