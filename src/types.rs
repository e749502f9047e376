use crate::ids::{Index, ReadId, ServerId, SnapshotId, Term};
use bytes::Bytes;
use std::collections::HashSet;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// A single replicated log entry. Entries are produced by the protocol core
/// and shared read-only between the persistence and apply pipelines.
#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    pub term: Term,
    pub idx: Index,
    pub payload: EntryPayload,
}

pub type LogEntryRef = Arc<LogEntry>;

#[derive(Debug, Clone, PartialEq)]
pub enum EntryPayload {
    /// Opaque user command, applied to the user state machine.
    Command(Bytes),
    /// Cluster membership change.
    Configuration(Configuration),
    /// No-op appended to force commit progress.
    Dummy,
}

/// Network identity of one cluster member. Equality and hashing consider
/// only the id: the connection info is free to change without the member
/// becoming a different server.
#[derive(Clone)]
pub struct ServerAddress {
    pub id: ServerId,
    pub info: Bytes,
}

impl ServerAddress {
    pub fn new(id: ServerId, info: Bytes) -> Self {
        ServerAddress { id, info }
    }

    /// Address probe carrying no connection info, for set lookups.
    pub fn from_id(id: ServerId) -> Self {
        ServerAddress { id, info: Bytes::new() }
    }
}

impl PartialEq for ServerAddress {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ServerAddress {}

impl Hash for ServerAddress {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)
    }
}

pub type ServerAddressSet = HashSet<ServerAddress>;

/// Cluster configuration. A configuration is joint while `previous` is
/// non-empty: both member sets vote until the transition entry commits.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Configuration {
    pub current: ServerAddressSet,
    pub previous: ServerAddressSet,
}

impl Configuration {
    pub fn new(current: ServerAddressSet) -> Self {
        Configuration {
            current,
            previous: ServerAddressSet::new(),
        }
    }

    pub fn is_joint(&self) -> bool {
        !self.previous.is_empty()
    }

    /// Union of both halves: every server that may need to receive messages
    /// while this configuration is in effect.
    pub fn joint_addresses(&self) -> ServerAddressSet {
        self.current.union(&self.previous).cloned().collect()
    }

    /// Membership diff from this configuration's target set to `new`.
    pub fn diff(&self, new: &ServerAddressSet) -> ConfigurationDiff {
        diff_address_sets(&self.current, new)
    }
}

#[derive(Debug, Default)]
pub struct ConfigurationDiff {
    pub joining: ServerAddressSet,
    pub leaving: ServerAddressSet,
}

impl ConfigurationDiff {
    pub fn is_empty(&self) -> bool {
        self.joining.is_empty() && self.leaving.is_empty()
    }
}

pub fn diff_address_sets(prev: &ServerAddressSet, current: &ServerAddressSet) -> ConfigurationDiff {
    let mut result = ConfigurationDiff::default();
    for addr in current {
        if !prev.contains(addr) {
            result.joining.insert(addr.clone());
        }
    }
    for addr in prev {
        if !current.contains(addr) {
            result.leaving.insert(addr.clone());
        }
    }
    result
}

/// Descriptor of one state-machine snapshot: the opaque id plus the log
/// position and configuration it subsumes.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotDescriptor {
    pub id: SnapshotId,
    pub idx: Index,
    pub term: Term,
    pub config: Configuration,
}

// ------- Wire messages --------
//
// The orchestrator routes these between the protocol core and the
// transport. Other than `InstallSnapshot` and `SnapshotReply` it never
// looks inside them.

#[derive(Debug, Clone, PartialEq)]
pub struct AppendRequest {
    pub current_term: Term,
    pub prev_log_idx: Index,
    pub prev_log_term: Term,
    pub leader_commit_idx: Index,
    pub entries: Vec<LogEntryRef>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AppendReply {
    pub current_term: Term,
    pub commit_idx: Index,
    pub accepted: bool,
    pub last_idx: Index,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VoteRequest {
    pub current_term: Term,
    pub last_log_idx: Index,
    pub last_log_term: Term,
    pub is_prevote: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VoteReply {
    pub current_term: Term,
    pub vote_granted: bool,
    pub is_prevote: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TimeoutNow {
    pub current_term: Term,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReadQuorum {
    pub current_term: Term,
    pub leader_commit_idx: Index,
    pub id: ReadId,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReadQuorumReply {
    pub current_term: Term,
    pub commit_idx: Index,
    pub id: ReadId,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InstallSnapshot {
    pub current_term: Term,
    pub snp: SnapshotDescriptor,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotReply {
    pub current_term: Term,
    pub success: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    AppendRequest(AppendRequest),
    AppendReply(AppendReply),
    VoteRequest(VoteRequest),
    VoteReply(VoteReply),
    TimeoutNow(TimeoutNow),
    ReadQuorum(ReadQuorum),
    ReadQuorumReply(ReadQuorumReply),
    InstallSnapshot(InstallSnapshot),
    SnapshotReply(SnapshotReply),
}

impl Message {
    /// Stable label for the per-type message metrics.
    pub(crate) fn type_label(&self) -> &'static str {
        match self {
            Message::AppendRequest(_) => "append_entries",
            Message::AppendReply(_) => "append_entries_reply",
            Message::VoteRequest(_) => "request_vote",
            Message::VoteReply(_) => "request_vote_reply",
            Message::TimeoutNow(_) => "timeout_now",
            Message::ReadQuorum(_) => "read_quorum",
            Message::ReadQuorumReply(_) => "read_quorum_reply",
            Message::InstallSnapshot(_) => "install_snapshot",
            Message::SnapshotReply(_) => "snapshot_reply",
        }
    }
}

/// Reply to a read barrier request, local or forwarded.
#[derive(Debug, Clone, PartialEq)]
pub enum ReadBarrierReply {
    /// Barrier established; reads are linearizable once the local apply
    /// index reaches the carried index.
    Ready(Index),
    /// The leader has not committed any entry in its term yet.
    NotReady,
    NotALeader(Option<ServerId>),
}

/// The log state restored from persistence at startup: the optional
/// snapshot descriptor and the contiguous entry tail following it.
#[derive(Debug, Clone)]
pub struct RestoredLog {
    snapshot: Option<SnapshotDescriptor>,
    entries: Vec<LogEntryRef>,
}

impl RestoredLog {
    pub fn new(snapshot: Option<SnapshotDescriptor>, entries: Vec<LogEntryRef>) -> Self {
        RestoredLog { snapshot, entries }
    }

    pub fn snapshot(&self) -> Option<&SnapshotDescriptor> {
        self.snapshot.as_ref()
    }

    pub fn entries(&self) -> &[LogEntryRef] {
        &self.entries
    }

    /// Index of the last entry known to be durable.
    pub fn stable_idx(&self) -> Index {
        if let Some(last) = self.entries.last() {
            return last.idx;
        }
        self.snapshot.as_ref().map(|snp| snp.idx).unwrap_or_default()
    }

    /// The most recent cluster configuration: the last configuration entry
    /// in the tail, or the one recorded in the snapshot.
    pub fn last_configuration(&self) -> Option<Configuration> {
        for entry in self.entries.iter().rev() {
            if let EntryPayload::Configuration(config) = &entry.payload {
                return Some(config.clone());
            }
        }
        self.snapshot.as_ref().map(|snp| snp.config.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn addr(n: u128) -> ServerAddress {
        ServerAddress::new(ServerId::new(uuid::Uuid::from_u128(n)), Bytes::new())
    }

    fn entry(term: u64, idx: u64, payload: EntryPayload) -> LogEntryRef {
        Arc::new(LogEntry {
            term: Term::new(term),
            idx: Index::new(idx),
            payload,
        })
    }

    #[test]
    fn address_equality_ignores_info() {
        let a = ServerAddress::new(ServerId::new(uuid::Uuid::from_u128(7)), Bytes::from_static(b"host-a"));
        let b = ServerAddress::new(ServerId::new(uuid::Uuid::from_u128(7)), Bytes::from_static(b"host-b"));

        assert_eq!(a, b);

        let set: ServerAddressSet = [a].into_iter().collect();
        assert!(set.contains(&ServerAddress::from_id(b.id)));
    }

    #[test]
    fn diff_splits_joining_and_leaving() {
        let prev: ServerAddressSet = [addr(1), addr(2), addr(3)].into_iter().collect();
        let current: ServerAddressSet = [addr(2), addr(3), addr(4)].into_iter().collect();

        let diff = diff_address_sets(&prev, &current);

        assert_eq!(diff.joining, [addr(4)].into_iter().collect());
        assert_eq!(diff.leaving, [addr(1)].into_iter().collect());
    }

    #[test]
    fn joint_configuration_merges_both_halves() {
        let config = Configuration {
            current: [addr(1), addr(2)].into_iter().collect(),
            previous: [addr(2), addr(3)].into_iter().collect(),
        };

        assert!(config.is_joint());
        assert_eq!(config.joint_addresses().len(), 3);
    }

    #[test]
    fn restored_log_prefers_tail_configuration() {
        let snapshot_config = Configuration::new([addr(1)].into_iter().collect());
        let tail_config = Configuration::new([addr(1), addr(2)].into_iter().collect());
        let log = RestoredLog::new(
            Some(SnapshotDescriptor {
                id: SnapshotId::random(),
                idx: Index::new(5),
                term: Term::new(2),
                config: snapshot_config,
            }),
            vec![
                entry(3, 6, EntryPayload::Dummy),
                entry(3, 7, EntryPayload::Configuration(tail_config.clone())),
                entry(3, 8, EntryPayload::Command(Bytes::from_static(b"x"))),
            ],
        );

        assert_eq!(log.stable_idx(), Index::new(8));
        assert_eq!(log.last_configuration(), Some(tail_config));
    }

    #[test]
    fn restored_log_falls_back_to_snapshot() {
        let config = Configuration::new([addr(1)].into_iter().collect());
        let log = RestoredLog::new(
            Some(SnapshotDescriptor {
                id: SnapshotId::random(),
                idx: Index::new(5),
                term: Term::new(2),
                config: config.clone(),
            }),
            vec![],
        );

        assert_eq!(log.stable_idx(), Index::new(5));
        assert_eq!(log.last_configuration(), Some(config));

        let empty = RestoredLog::new(None, vec![]);
        assert_eq!(empty.stable_idx(), Index::new(0));
        assert_eq!(empty.last_configuration(), None);
    }

    proptest! {
        /// Applying a diff to the set it was computed from must yield the
        /// target set.
        #[test]
        fn diff_apply_round_trip(prev_ids in prop::collection::hash_set(0u128..20, 0..10),
                                 current_ids in prop::collection::hash_set(0u128..20, 0..10)) {
            let prev: ServerAddressSet = prev_ids.iter().map(|n| addr(*n)).collect();
            let current: ServerAddressSet = current_ids.iter().map(|n| addr(*n)).collect();

            let diff = diff_address_sets(&prev, &current);

            let mut applied = prev;
            for a in diff.joining {
                applied.insert(a);
            }
            for a in diff.leaving {
                applied.remove(&a);
            }
            prop_assert_eq!(applied, current);
        }
    }
}
