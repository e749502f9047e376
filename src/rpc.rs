use crate::ids::ServerId;
use crate::transfers::TransferCancelSignal;
use crate::types::{
    AppendReply, AppendRequest, InstallSnapshot, ReadBarrierReply, ReadQuorum, ReadQuorumReply, SnapshotReply,
    TimeoutNow, VoteReply, VoteRequest,
};
use bytes::Bytes;

#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("peer unreachable: {0}")]
    Unreachable(String),

    #[error("send was cancelled")]
    Cancelled,
}

/// Outbound transport used by the server. Wire format and connection
/// management are the implementation's business; the server only assumes
/// typed, best-effort delivery.
///
/// The fire-and-forget sends may fail without consequence: the protocol
/// tolerates message loss. `send_append_entries` is awaited so that at most
/// one append per destination is in flight; `send_snapshot` must resolve
/// promptly (with `RpcError::Cancelled` or otherwise) once `cancel` fires,
/// or shutdown will block on the transfer drain.
#[async_trait::async_trait]
pub trait Rpc: Send + Sync + 'static {
    async fn send_append_entries(&self, dst: ServerId, request: AppendRequest) -> Result<(), RpcError>;

    fn send_append_entries_reply(&self, dst: ServerId, reply: AppendReply) -> Result<(), RpcError>;

    fn send_vote_request(&self, dst: ServerId, request: VoteRequest) -> Result<(), RpcError>;

    fn send_vote_reply(&self, dst: ServerId, reply: VoteReply) -> Result<(), RpcError>;

    fn send_timeout_now(&self, dst: ServerId, request: TimeoutNow) -> Result<(), RpcError>;

    fn send_read_quorum(&self, dst: ServerId, request: ReadQuorum) -> Result<(), RpcError>;

    fn send_read_quorum_reply(&self, dst: ServerId, reply: ReadQuorumReply) -> Result<(), RpcError>;

    /// Stream a snapshot to `dst`, returning the receiver's reply.
    async fn send_snapshot(
        &self,
        dst: ServerId,
        request: InstallSnapshot,
        cancel: TransferCancelSignal,
    ) -> Result<SnapshotReply, RpcError>;

    /// Run a read barrier on the remote leader on behalf of this server.
    async fn execute_read_barrier_on_leader(&self, leader: ServerId) -> Result<ReadBarrierReply, RpcError>;

    /// Maintain the transport's address map as members join and leave.
    fn add_server(&self, id: ServerId, info: Bytes);
    fn remove_server(&self, id: ServerId);

    async fn abort(&self);
}
