use crate::ids::ServerId;
use metrics::{counter, gauge};

/// Counter and gauge publication for one server instance. Every series is
/// labelled with the server id so co-located servers stay distinguishable.
pub(crate) struct ServerMetrics {
    server_id: String,
}

impl ServerMetrics {
    pub fn new(id: ServerId) -> Self {
        ServerMetrics {
            server_id: id.to_string(),
        }
    }

    pub fn add_entries(&self, kind: &'static str) {
        counter!("raft_add_entries", "server_id" => self.server_id.clone(), "kind" => kind).increment(1);
    }

    pub fn message_received(&self, message_type: &'static str) {
        counter!("raft_messages_received", "server_id" => self.server_id.clone(), "type" => message_type)
            .increment(1);
    }

    pub fn message_sent(&self, message_type: &'static str) {
        counter!("raft_messages_sent", "server_id" => self.server_id.clone(), "type" => message_type).increment(1);
    }

    pub fn waiters_awaken(&self, count: u64) {
        counter!("raft_waiter_awaken", "server_id" => self.server_id.clone()).increment(count);
    }

    pub fn waiters_dropped(&self, count: u64) {
        counter!("raft_waiter_dropped", "server_id" => self.server_id.clone()).increment(count);
    }

    pub fn poll(&self) {
        counter!("raft_polls", "server_id" => self.server_id.clone()).increment(1);
    }

    pub fn store_term_and_vote(&self) {
        counter!("raft_store_term_and_vote", "server_id" => self.server_id.clone()).increment(1);
    }

    pub fn store_snapshot(&self) {
        counter!("raft_store_snapshot", "server_id" => self.server_id.clone()).increment(1);
    }

    pub fn sm_load_snapshot(&self) {
        counter!("raft_sm_load_snapshot", "server_id" => self.server_id.clone()).increment(1);
    }

    pub fn truncate_persisted_log(&self) {
        counter!("raft_truncate_persisted_log", "server_id" => self.server_id.clone()).increment(1);
    }

    pub fn persisted_log_entries(&self, count: u64) {
        counter!("raft_persisted_log_entries", "server_id" => self.server_id.clone()).increment(count);
    }

    pub fn queue_entries_for_apply(&self, count: u64) {
        counter!("raft_queue_entries_for_apply", "server_id" => self.server_id.clone()).increment(count);
    }

    pub fn applied_entries(&self, count: u64) {
        counter!("raft_applied_entries", "server_id" => self.server_id.clone()).increment(count);
    }

    pub fn snapshots_taken(&self) {
        counter!("raft_snapshots_taken", "server_id" => self.server_id.clone()).increment(1);
    }

    pub fn in_memory_log_size(&self, size: u64) {
        gauge!("raft_in_memory_log_size", "server_id" => self.server_id.clone()).set(size as f64);
    }
}
