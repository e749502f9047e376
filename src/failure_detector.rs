use crate::ids::ServerId;

/// Liveness oracle consulted by the protocol core before starting
/// elections or transferring leadership.
pub trait FailureDetector: Send + Sync + 'static {
    fn is_alive(&self, server: ServerId) -> bool;
}

/// Trivial detector that considers every peer alive. Useful for tests and
/// single-node deployments.
pub struct AlwaysAliveFailureDetector;

impl FailureDetector for AlwaysAliveFailureDetector {
    fn is_alive(&self, _server: ServerId) -> bool {
        true
    }
}
