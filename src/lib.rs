mod error;
mod failure_detector;
mod fsm;
mod ids;
mod metrics;
mod options;
mod persistence;
mod reads;
mod rpc;
mod server;
mod state_machine;
mod transfers;
mod types;
mod waiters;

pub use error::Error;
pub use error::StartError;
pub use failure_detector::AlwaysAliveFailureDetector;
pub use failure_detector::FailureDetector;
pub use fsm::Fsm;
pub use fsm::FsmConfig;
pub use fsm::FsmContext;
pub use fsm::FsmOutput;
pub use fsm::FsmSnapshotUpdate;
pub use fsm::NotLeader;
pub use fsm::ELECTION_TIMEOUT_TICKS;
pub use ids::Index;
pub use ids::ReadId;
pub use ids::ServerId;
pub use ids::SnapshotId;
pub use ids::Term;
pub use options::ConfigError;
pub use options::ServerOptions;
pub use persistence::InMemoryPersistence;
pub use persistence::Persistence;
pub use rpc::Rpc;
pub use rpc::RpcError;
pub use server::Server;
pub use server::ServerConfig;
pub use state_machine::NoOpStateMachine;
pub use state_machine::StateMachine;
pub use state_machine::StateMachineError;
pub use transfers::transfer_cancel_pair;
pub use transfers::TransferCancelHandle;
pub use transfers::TransferCancelSignal;
pub use types::diff_address_sets;
pub use types::AppendReply;
pub use types::AppendRequest;
pub use types::Configuration;
pub use types::ConfigurationDiff;
pub use types::EntryPayload;
pub use types::InstallSnapshot;
pub use types::LogEntry;
pub use types::LogEntryRef;
pub use types::Message;
pub use types::ReadBarrierReply;
pub use types::ReadQuorum;
pub use types::ReadQuorumReply;
pub use types::RestoredLog;
pub use types::ServerAddress;
pub use types::ServerAddressSet;
pub use types::SnapshotDescriptor;
pub use types::SnapshotReply;
pub use types::TimeoutNow;
pub use types::VoteReply;
pub use types::VoteRequest;
pub use waiters::WaitType;
