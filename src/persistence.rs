use crate::ids::{Index, ServerId, Term};
use crate::types::{LogEntryRef, SnapshotDescriptor};
use std::io;
use std::sync::Mutex;

/// Durable storage for the server's hard state: the current term and vote,
/// the latest snapshot descriptor, and the contiguous log tail.
///
/// Failures are fatal to the I/O pipeline; there is no retry at this layer.
#[async_trait::async_trait]
pub trait Persistence: Send + Sync + 'static {
    /// Term and vote are always persisted together; a vote may change
    /// independently of the term but updating both is safe.
    async fn store_term_and_vote(&self, term: Term, vote: Option<ServerId>) -> io::Result<()>;

    async fn load_term_and_vote(&self) -> io::Result<(Term, Option<ServerId>)>;

    /// Persist `snapshot` and discard log entries it subsumes, keeping
    /// `preserve_log_entries` entries behind the snapshot index.
    async fn store_snapshot_descriptor(
        &self,
        snapshot: &SnapshotDescriptor,
        preserve_log_entries: u64,
    ) -> io::Result<()>;

    async fn load_snapshot_descriptor(&self) -> io::Result<Option<SnapshotDescriptor>>;

    /// Append entries to the stored log. The caller guarantees they follow
    /// the currently stored tail.
    async fn store_log_entries(&self, entries: &[LogEntryRef]) -> io::Result<()>;

    /// The contiguous log tail following the stored snapshot.
    async fn load_log(&self) -> io::Result<Vec<LogEntryRef>>;

    /// Remove the stored suffix `[idx, ...]`.
    async fn truncate_log(&self, idx: Index) -> io::Result<()>;

    async fn abort(&self);
}

#[derive(Default)]
struct PersistedState {
    term: Term,
    vote: Option<ServerId>,
    snapshot: Option<SnapshotDescriptor>,
    entries: Vec<LogEntryRef>,
}

/// Volatile `Persistence` for tests and exploratory embeddings. Keeps the
/// same observable behavior as a durable implementation, minus surviving a
/// process restart.
#[derive(Default)]
pub struct InMemoryPersistence {
    state: Mutex<PersistedState>,
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl Persistence for InMemoryPersistence {
    async fn store_term_and_vote(&self, term: Term, vote: Option<ServerId>) -> io::Result<()> {
        let mut state = self.state.lock().expect("persistence state poisoned");
        state.term = term;
        state.vote = vote;
        Ok(())
    }

    async fn load_term_and_vote(&self) -> io::Result<(Term, Option<ServerId>)> {
        let state = self.state.lock().expect("persistence state poisoned");
        Ok((state.term, state.vote))
    }

    async fn store_snapshot_descriptor(
        &self,
        snapshot: &SnapshotDescriptor,
        preserve_log_entries: u64,
    ) -> io::Result<()> {
        let mut state = self.state.lock().expect("persistence state poisoned");
        let cutoff = snapshot.idx.val().saturating_sub(preserve_log_entries);
        state.entries.retain(|entry| entry.idx.val() > cutoff);
        state.snapshot = Some(snapshot.clone());
        Ok(())
    }

    async fn load_snapshot_descriptor(&self) -> io::Result<Option<SnapshotDescriptor>> {
        let state = self.state.lock().expect("persistence state poisoned");
        Ok(state.snapshot.clone())
    }

    async fn store_log_entries(&self, entries: &[LogEntryRef]) -> io::Result<()> {
        let mut state = self.state.lock().expect("persistence state poisoned");
        state.entries.extend_from_slice(entries);
        Ok(())
    }

    async fn load_log(&self) -> io::Result<Vec<LogEntryRef>> {
        let state = self.state.lock().expect("persistence state poisoned");
        Ok(state.entries.clone())
    }

    async fn truncate_log(&self, idx: Index) -> io::Result<()> {
        let mut state = self.state.lock().expect("persistence state poisoned");
        state.entries.retain(|entry| entry.idx < idx);
        Ok(())
    }

    async fn abort(&self) {}
}
