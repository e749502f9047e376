use crate::ids::SnapshotId;
use bytes::Bytes;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("state machine failure: {0}")]
pub struct StateMachineError(pub String);

/// The user state machine the replicated commands are applied to. Apply
/// order is the commit order; an entry is never applied twice and never
/// rolled back.
///
/// Snapshots are opaque to the server: it only tracks their ids and the
/// log positions they subsume.
#[async_trait::async_trait]
pub trait StateMachine: Send + Sync + 'static {
    /// Apply a batch of committed commands in order. An error is fatal to
    /// the apply pipeline.
    async fn apply(&self, commands: Vec<Bytes>) -> Result<(), StateMachineError>;

    /// Capture the current state under a fresh id.
    async fn take_snapshot(&self) -> Result<SnapshotId, StateMachineError>;

    /// Replace the current state with a previously stored snapshot.
    async fn load_snapshot(&self, id: SnapshotId) -> Result<(), StateMachineError>;

    /// Dispose of a snapshot that is no longer referenced.
    fn drop_snapshot(&self, id: SnapshotId);

    async fn abort(&self);
}

/// State machine that discards every command. Stands in where the
/// application only needs replication side effects.
pub struct NoOpStateMachine;

#[async_trait::async_trait]
impl StateMachine for NoOpStateMachine {
    async fn apply(&self, _commands: Vec<Bytes>) -> Result<(), StateMachineError> {
        Ok(())
    }

    async fn take_snapshot(&self) -> Result<SnapshotId, StateMachineError> {
        Ok(SnapshotId::random())
    }

    async fn load_snapshot(&self, _id: SnapshotId) -> Result<(), StateMachineError> {
        Ok(())
    }

    fn drop_snapshot(&self, _id: SnapshotId) {}

    async fn abort(&self) {}
}
