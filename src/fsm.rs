use crate::failure_detector::FailureDetector;
use crate::ids::{Index, ReadId, ServerId, SnapshotId, Term};
use crate::types::{Configuration, EntryPayload, LogEntryRef, Message, RestoredLog, ServerAddressSet, SnapshotDescriptor};
use std::sync::Arc;

/// Logical-clock ticks after which a quiet follower starts an election.
pub const ELECTION_TIMEOUT_TICKS: u64 = 10;

#[derive(Clone)]
pub struct FsmConfig {
    pub append_request_threshold: u64,
    pub max_log_size: u64,
    pub enable_prevoting: bool,
}

/// Everything needed to reconstruct the protocol core from persisted state.
/// Built by `Server::start` after loading persistence, handed to the
/// caller-supplied FSM factory.
pub struct FsmContext {
    pub id: ServerId,
    pub term: Term,
    pub voted_for: Option<ServerId>,
    pub log: RestoredLog,
    pub failure_detector: Arc<dyn FailureDetector>,
    pub config: FsmConfig,
}

/// One drained batch of protocol outputs. Field order mirrors the order in
/// which the I/O pipeline must act on them: term/vote persistence first,
/// then snapshot, log entries, messages, committed entries, read quorums.
#[derive(Default)]
pub struct FsmOutput {
    pub term_and_vote: Option<(Term, Option<ServerId>)>,
    pub snapshot: Option<FsmSnapshotUpdate>,
    pub log_entries: Vec<LogEntryRef>,
    /// Address set derived from the latest configuration entry (joint
    /// halves already merged), when that entry changed in this batch.
    pub configuration: Option<ServerAddressSet>,
    pub messages: Vec<(ServerId, Message)>,
    pub committed: Vec<LogEntryRef>,
    pub max_read_id_with_quorum: Option<ReadId>,
    pub abort_leadership_transfer: bool,
}

/// A snapshot newly recorded in the protocol log, either taken locally or
/// received from the leader.
pub struct FsmSnapshotUpdate {
    pub descriptor: SnapshotDescriptor,
    pub is_local: bool,
    /// Snapshot superseded by this one; dropped from the user state machine
    /// once the new descriptor is persisted.
    pub old_id: SnapshotId,
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("not a leader, current leader is {leader:?}")]
pub struct NotLeader {
    pub leader: Option<ServerId>,
}

/// The deterministic protocol finite-state machine, as consumed by the
/// server orchestrator. Implementations carry the election and
/// log-matching rules; the orchestrator only persists, ships and applies
/// what the FSM emits.
///
/// The contract is synchronous: every method returns without suspending.
/// Outputs accumulate internally and are drained through `poll_output`;
/// the orchestrator guarantees a poll happens after every mutating call.
///
/// Message delivery is best effort. A send failure is never reported back;
/// implementations must re-emit whatever matters (append retries on the
/// heartbeat timer, votes on re-election).
pub trait Fsm: Send + 'static {
    /// Ingest one message from `from`.
    fn step(&mut self, from: ServerId, message: Message);

    /// Advance the logical clock by one tick.
    fn tick(&mut self);

    /// Append a new entry to the in-memory log, assigning its slot.
    fn add_entry(&mut self, payload: EntryPayload) -> Result<(Term, Index), NotLeader>;

    /// Drain accumulated outputs, if any.
    fn poll_output(&mut self) -> Option<FsmOutput>;

    /// Whether the in-memory log is at `max_log_size`; submissions must
    /// wait until entries stabilize or a snapshot trims the log.
    fn log_is_full(&self) -> bool;

    fn is_leader(&self) -> bool;
    fn is_follower(&self) -> bool;
    fn is_candidate(&self) -> bool;
    fn current_term(&self) -> Term;
    fn current_leader(&self) -> Option<ServerId>;
    fn configuration(&self) -> Configuration;

    /// Begin a read barrier on behalf of `from`. `Ok(None)` means no entry
    /// is committed in the current term yet.
    fn start_read_barrier(&mut self, from: ServerId) -> Result<Option<(ReadId, Index)>, NotLeader>;

    /// Record a snapshot at `descriptor`, keeping `trailing` entries of log
    /// behind it. Returns false if a later snapshot is already recorded, in
    /// which case the caller owns disposing of the descriptor's id.
    fn apply_snapshot(&mut self, descriptor: SnapshotDescriptor, trailing: u64, local: bool) -> bool;

    fn log_last_snapshot_idx(&self) -> Index;

    /// The configuration in effect at `idx`.
    fn log_last_conf_for(&self, idx: Index) -> Configuration;

    fn log_last_idx(&self) -> Index;
    fn log_last_term(&self) -> Term;
    fn in_memory_log_size(&self) -> u64;

    /// Ticks elapsed since the last leader contact.
    fn election_elapsed(&self) -> u64;

    /// Start transferring leadership away, giving up after `timeout_ticks`.
    fn transfer_leadership(&mut self, timeout_ticks: u64) -> Result<(), NotLeader>;
}
