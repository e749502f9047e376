use crate::error::{Error, StartError};
use crate::failure_detector::FailureDetector;
use crate::fsm::{Fsm, FsmConfig, FsmContext, FsmOutput, ELECTION_TIMEOUT_TICKS};
use crate::ids::{Index, ServerId, Term};
use crate::metrics::ServerMetrics;
use crate::options::{ConfigError, ServerOptions, ValidatedOptions};
use crate::persistence::Persistence;
use crate::reads::ReadTracker;
use crate::rpc::Rpc;
use crate::state_machine::{StateMachine, StateMachineError};
use crate::transfers::{transfer_cancel_pair, SnapshotTransfers, TransferCancelSignal, TransferCompletion};
use crate::types::{
    diff_address_sets, AppendReply, AppendRequest, Configuration, EntryPayload, InstallSnapshot, LogEntryRef,
    Message, ReadBarrierReply, ReadQuorum, ReadQuorumReply, RestoredLog, ServerAddress, ServerAddressSet,
    SnapshotDescriptor, SnapshotReply, TimeoutNow, VoteReply, VoteRequest,
};
use crate::waiters::{AppliedWaiters, WaiterRegistry, WaitType};
use bytes::Bytes;
use std::collections::HashMap;
use std::convert::TryFrom;
use std::io;
use std::pin::pin;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::Duration;

/// The apply queue couples the I/O pipeline's pace to the apply pipeline's.
const APPLY_QUEUE_DEPTH: usize = 10;

/// Append requests queued per peer beyond the one in flight. Overflow is
/// dropped like any other failed send.
const APPEND_QUEUE_DEPTH: usize = 16;

const READ_BARRIER_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Everything needed to start a server.
pub struct ServerConfig<F: Fsm> {
    pub id: ServerId,
    pub options: ServerOptions,
    pub rpc: Arc<dyn Rpc>,
    pub state_machine: Arc<dyn StateMachine>,
    pub persistence: Arc<dyn Persistence>,
    pub failure_detector: Arc<dyn FailureDetector>,
    /// Builds the protocol core from the restored persistent state.
    pub fsm_factory: Box<dyn FnOnce(FsmContext) -> F + Send>,
    pub logger: slog::Logger,
}

/// Server is the orchestrator around the protocol core: it persists what
/// the core emits, ships messages to peers, applies committed entries to
/// the user state machine and arbitrates client waits.
///
/// Handles are cheap to clone; the transport should hold one to deliver
/// inbound messages. `abort()` must be called before dropping the last
/// handle, otherwise the pipeline tasks are left running.
pub struct Server<F: Fsm> {
    inner: Arc<Mutex<ServerInner<F>>>,
    shared: Arc<Shared>,
}

impl<F: Fsm> Clone for Server<F> {
    fn clone(&self) -> Self {
        Server {
            inner: Arc::clone(&self.inner),
            shared: Arc::clone(&self.shared),
        }
    }
}

struct Shared {
    id: ServerId,
    options: ValidatedOptions,
    rpc: Arc<dyn Rpc>,
    state_machine: Arc<dyn StateMachine>,
    persistence: Arc<dyn Persistence>,
    metrics: ServerMetrics,
    logger: slog::Logger,
    /// Signalled after every FSM mutation; parks the I/O pipeline between
    /// output batches.
    output_ready: Notify,
    /// Signalled after every drained batch; parks submitters waiting for
    /// log space.
    log_space: Notify,
    apply_tx: mpsc::Sender<ApplyItem>,
}

/// State behind the single mutex. The lock is never held across an await,
/// which makes every locked section atomic with respect to both pipelines
/// and all facade calls.
struct ServerInner<F: Fsm> {
    fsm: F,
    waiters: WaiterRegistry,
    applied_waiters: AppliedWaiters,
    reads: ReadTracker,
    /// Highest index durably applied to the state machine or covered by a
    /// loaded snapshot. Monotonic.
    applied_idx: Index,
    /// Address set the transport currently knows about: union of current
    /// and previous members of the latest observed configuration.
    rpc_config: ServerAddressSet,
    transfers: SnapshotTransfers,
    /// At most one pending inbound snapshot application per source.
    snapshot_application_done: HashMap<ServerId, oneshot::Sender<SnapshotReply>>,
    append_workers: HashMap<ServerId, AppendWorker>,
    leader_waiters: Vec<oneshot::Sender<Result<(), Error>>>,
    stepdown: Option<oneshot::Sender<Result<(), Error>>>,
    stopped: bool,
    io_task: Option<JoinHandle<()>>,
    applier_task: Option<JoinHandle<()>>,
}

struct AppendWorker {
    tx: mpsc::Sender<AppendRequest>,
    task: JoinHandle<()>,
}

enum ApplyItem {
    Entries(Vec<LogEntryRef>),
    Snapshot(SnapshotDescriptor),
    Stop,
}

#[derive(Debug, thiserror::Error)]
enum PipelineFatal {
    #[error("persistence failure: {0}")]
    Storage(#[from] io::Error),

    #[error(transparent)]
    StateMachine(#[from] StateMachineError),

    #[error("apply queue closed")]
    QueueClosed,
}

impl<F: Fsm> Server<F> {
    pub async fn start(config: ServerConfig<F>) -> Result<Server<F>, StartError> {
        if config.id.is_nil() {
            return Err(StartError::Config(ConfigError("server id must not be nil")));
        }
        let options = ValidatedOptions::try_from(config.options)?;
        let logger = config.logger.new(slog::o!("server_id" => config.id.to_string()));

        let (term, voted_for) = config.persistence.load_term_and_vote().await?;
        let snapshot = config.persistence.load_snapshot_descriptor().await?;
        let entries = config.persistence.load_log().await?;
        let log = RestoredLog::new(snapshot, entries);
        let last_stable = log.stable_idx();
        let restored_snapshot = log.snapshot().cloned();
        let restored_config = log.last_configuration();

        let fsm = (config.fsm_factory)(FsmContext {
            id: config.id,
            term,
            voted_for,
            log,
            failure_detector: config.failure_detector,
            config: FsmConfig {
                append_request_threshold: options.append_request_threshold,
                max_log_size: options.max_log_size,
                enable_prevoting: options.enable_prevoting,
            },
        });

        let mut applied_idx = Index::new(0);
        if let Some(snapshot) = restored_snapshot {
            config.state_machine.load_snapshot(snapshot.id).await?;
            applied_idx = snapshot.idx;
        }

        // Seed the transport's address map from the latest configuration.
        // Both halves are merged in case it is the joint entry.
        let mut rpc_config = ServerAddressSet::new();
        if let Some(configuration) = restored_config {
            for addr in configuration.joint_addresses() {
                config.rpc.add_server(addr.id, addr.info.clone());
                rpc_config.insert(addr);
            }
        }

        let (apply_tx, apply_rx) = mpsc::channel(APPLY_QUEUE_DEPTH);
        let metrics = ServerMetrics::new(config.id);
        metrics.in_memory_log_size(fsm.in_memory_log_size());

        let server = Server {
            inner: Arc::new(Mutex::new(ServerInner {
                fsm,
                waiters: WaiterRegistry::default(),
                applied_waiters: AppliedWaiters::default(),
                reads: ReadTracker::default(),
                applied_idx,
                rpc_config,
                transfers: SnapshotTransfers::default(),
                snapshot_application_done: HashMap::new(),
                append_workers: HashMap::new(),
                leader_waiters: Vec::new(),
                stepdown: None,
                stopped: false,
                io_task: None,
                applier_task: None,
            })),
            shared: Arc::new(Shared {
                id: config.id,
                options,
                rpc: config.rpc,
                state_machine: config.state_machine,
                persistence: config.persistence,
                metrics,
                logger,
                output_ready: Notify::new(),
                log_space: Notify::new(),
                apply_tx,
            }),
        };

        let io_task = tokio::spawn(server.clone().io_pipeline(last_stable));
        let applier_task = tokio::spawn(server.clone().applier_pipeline(apply_rx));
        {
            let mut inner = server.locked();
            inner.io_task = Some(io_task);
            inner.applier_task = Some(applier_task);
        }

        slog::trace!(server.shared.logger, "server started");
        Ok(server)
    }

    fn locked(&self) -> MutexGuard<'_, ServerInner<F>> {
        self.inner.lock().expect("server state poisoned")
    }

    fn wake_io(&self) {
        self.shared.output_ready.notify_one();
    }

    // ------- Client submissions --------

    /// Submit a user command, resolving once it committed or applied per
    /// `wait`.
    pub async fn add_entry(&self, command: Bytes, wait: WaitType) -> Result<(), Error> {
        self.shared.metrics.add_entries("command");
        self.add_entry_internal(EntryPayload::Command(command), wait).await
    }

    async fn add_entry_internal(&self, payload: EntryPayload, wait: WaitType) -> Result<(), Error> {
        slog::trace!(self.shared.logger, "an entry is submitted");

        // Wait for a log slot to become available.
        let done = loop {
            let mut notified = pin!(self.shared.log_space.notified());
            notified.as_mut().enable();
            {
                let mut inner = self.locked();
                if inner.stopped {
                    return Err(Error::Stopped);
                }
                if !inner.fsm.log_is_full() {
                    let (term, idx) = inner
                        .fsm
                        .add_entry(payload)
                        .map_err(|not_leader| Error::NotALeader(not_leader.leader))?;
                    let (tx, rx) = oneshot::channel();
                    inner.waiters.register(wait, idx, term, tx);
                    break rx;
                }
            }
            notified.await;
        };
        self.wake_io();

        done.await.map_err(|_| Error::Stopped)?
    }

    /// Replace the cluster member set. Appends the joint configuration
    /// entry and waits for the transition to fully commit. No-op when the
    /// requested set matches the current one.
    pub async fn set_configuration(&self, new_config: ServerAddressSet) -> Result<(), Error> {
        let diff = {
            let inner = self.locked();
            if inner.stopped {
                return Err(Error::Stopped);
            }
            inner.fsm.configuration().diff(&new_config)
        };
        if diff.is_empty() {
            return Ok(());
        }

        self.shared.metrics.add_entries("config");
        self.add_entry_internal(EntryPayload::Configuration(Configuration::new(new_config)), WaitType::Committed)
            .await?;

        // Once the joint entry commits, the protocol core appends the
        // non-joint entry without yielding. A committed dummy entry after
        // that point therefore implies the non-joint entry committed too.
        self.shared.metrics.add_entries("dummy");
        self.add_entry_internal(EntryPayload::Dummy, WaitType::Committed).await
    }

    // ------- Read barriers --------

    /// Establish a linearizable read point: resolves once every entry
    /// committed before the call is visible in the local state machine.
    pub async fn read_barrier(&self) -> Result<(), Error> {
        slog::trace!(self.shared.logger, "read_barrier start");
        let mut leader = { self.locked().fsm.current_leader() };

        let read_idx = loop {
            let Some(leader_id) = leader else {
                self.wait_for_leader().await?;
                leader = { self.locked().fsm.current_leader() };
                continue;
            };

            let applied_before = { self.locked().applied_idx };
            let reply = if leader_id == self.shared.id {
                Some(self.execute_read_barrier(self.shared.id).await?)
            } else {
                match self.shared.rpc.execute_read_barrier_on_leader(leader_id).await {
                    Ok(reply) => Some(reply),
                    Err(error) => {
                        slog::debug!(self.shared.logger, "read_barrier forward to {} failed: {}", leader_id, error);
                        tokio::time::sleep(READ_BARRIER_RETRY_DELAY).await;
                        let inner = self.locked();
                        if inner.stopped {
                            return Err(Error::Stopped);
                        }
                        leader = inner.fsm.current_leader();
                        None
                    }
                }
            };

            match reply {
                Some(ReadBarrierReply::Ready(idx)) => break idx,
                Some(ReadBarrierReply::NotReady) => {
                    // The leader has no committed entry in its term yet.
                    // Wait for any apply progress past the point observed
                    // before the request, then retry.
                    slog::trace!(self.shared.logger, "read_barrier leader not ready");
                    self.wait_for_apply(applied_before.plus(1)).await?;
                }
                Some(ReadBarrierReply::NotALeader(hint)) => leader = hint,
                None => {}
            }
        };

        slog::trace!(self.shared.logger, "read_barrier read index {}", read_idx);
        self.wait_for_apply(read_idx).await
    }

    /// Leader-side half of a read barrier; also invoked by the transport on
    /// behalf of forwarding followers.
    pub async fn execute_read_barrier(&self, from: ServerId) -> Result<ReadBarrierReply, Error> {
        let done = {
            let mut inner = self.locked();
            if inner.stopped {
                return Err(Error::Stopped);
            }
            match inner.fsm.start_read_barrier(from) {
                Err(not_leader) => return Ok(ReadBarrierReply::NotALeader(not_leader.leader)),
                Ok(None) => return Ok(ReadBarrierReply::NotReady),
                Ok(Some((id, idx))) => {
                    slog::trace!(self.shared.logger, "read barrier {} started at commit index {}", id, idx);
                    inner.reads.push(id, idx)
                }
            }
        };
        self.wake_io();

        done.await.map_err(|_| Error::Stopped)
    }

    async fn wait_for_apply(&self, idx: Index) -> Result<(), Error> {
        let done = {
            let mut inner = self.locked();
            if inner.stopped {
                return Err(Error::Stopped);
            }
            if idx <= inner.applied_idx {
                return Ok(());
            }
            inner.applied_waiters.register(idx)
        };

        done.await.map_err(|_| Error::Stopped)?
    }

    async fn wait_for_leader(&self) -> Result<(), Error> {
        let done = {
            let mut inner = self.locked();
            if inner.stopped {
                return Err(Error::Stopped);
            }
            if inner.fsm.current_leader().is_some() {
                return Ok(());
            }
            let (tx, rx) = oneshot::channel();
            inner.leader_waiters.push(tx);
            rx
        };

        done.await.map_err(|_| Error::Stopped)?
    }

    // ------- Snapshot application (inbound) --------

    /// Feed a leader-sent snapshot into the protocol core and wait for the
    /// apply pipeline to install it. The reply travels back through the
    /// core's outgoing `SnapshotReply` message.
    pub async fn apply_snapshot(&self, from: ServerId, request: InstallSnapshot) -> Result<SnapshotReply, Error> {
        let snapshot_id = request.snp.id;
        let done = {
            let mut inner = self.locked();
            if inner.stopped {
                return Err(Error::Stopped);
            }
            // Only one snapshot can be in flight from each source.
            if inner.snapshot_application_done.contains_key(&from) {
                return Err(Error::AlreadyInProgress);
            }
            inner.fsm.step(from, Message::InstallSnapshot(request));
            let (tx, rx) = oneshot::channel();
            inner.snapshot_application_done.insert(from, tx);
            rx
        };
        self.wake_io();

        match done.await {
            Ok(reply) => {
                if !reply.success {
                    self.shared.state_machine.drop_snapshot(snapshot_id);
                }
                Ok(reply)
            }
            Err(_) => {
                self.shared.state_machine.drop_snapshot(snapshot_id);
                Err(Error::Stopped)
            }
        }
    }

    // ------- Inbound message delivery (transport-facing) --------

    pub fn append_entries(&self, from: ServerId, request: AppendRequest) {
        self.shared.metrics.message_received("append_entries");
        self.step(from, Message::AppendRequest(request));
    }

    pub fn append_entries_reply(&self, from: ServerId, reply: AppendReply) {
        self.shared.metrics.message_received("append_entries_reply");
        self.step(from, Message::AppendReply(reply));
    }

    pub fn request_vote(&self, from: ServerId, request: VoteRequest) {
        self.shared.metrics.message_received("request_vote");
        self.step(from, Message::VoteRequest(request));
    }

    pub fn request_vote_reply(&self, from: ServerId, reply: VoteReply) {
        self.shared.metrics.message_received("request_vote_reply");
        self.step(from, Message::VoteReply(reply));
    }

    pub fn timeout_now_request(&self, from: ServerId, request: TimeoutNow) {
        self.shared.metrics.message_received("timeout_now");
        self.step(from, Message::TimeoutNow(request));
    }

    pub fn read_quorum_request(&self, from: ServerId, request: ReadQuorum) {
        self.shared.metrics.message_received("read_quorum");
        self.step(from, Message::ReadQuorum(request));
    }

    pub fn read_quorum_reply(&self, from: ServerId, reply: ReadQuorumReply) {
        self.shared.metrics.message_received("read_quorum_reply");
        self.step(from, Message::ReadQuorumReply(reply));
    }

    fn step(&self, from: ServerId, message: Message) {
        {
            let mut inner = self.locked();
            if inner.stopped {
                return;
            }
            inner.fsm.step(from, message);
        }
        self.wake_io();
    }

    // ------- Leadership --------

    /// Transfer leadership away, failing with `Timeout` if no new leader
    /// takes over within `timeout_ticks` logical ticks.
    pub async fn stepdown(&self, timeout_ticks: u64) -> Result<(), Error> {
        let done = {
            let mut inner = self.locked();
            if inner.stopped {
                return Err(Error::Stopped);
            }
            if inner.stepdown.is_some() {
                return Err(Error::AlreadyInProgress);
            }
            inner
                .fsm
                .transfer_leadership(timeout_ticks)
                .map_err(|not_leader| Error::NotALeader(not_leader.leader))?;
            let (tx, rx) = oneshot::channel();
            inner.stepdown = Some(tx);
            rx
        };
        self.wake_io();

        done.await.map_err(|_| Error::Stopped)?
    }

    // ------- Accessors and clock --------

    pub fn id(&self) -> ServerId {
        self.shared.id
    }

    pub fn is_leader(&self) -> bool {
        self.locked().fsm.is_leader()
    }

    pub fn get_current_term(&self) -> Term {
        self.locked().fsm.current_term()
    }

    pub fn get_configuration(&self) -> Configuration {
        self.locked().fsm.configuration()
    }

    /// Advance the protocol's logical clock by one tick.
    pub fn tick(&self) {
        {
            let mut inner = self.locked();
            if inner.stopped {
                return;
            }
            inner.fsm.tick();
        }
        self.wake_io();
    }

    // ------- Test hooks (controlled-clock drivers) --------

    pub fn wait_until_candidate(&self) {
        {
            let mut inner = self.locked();
            while inner.fsm.is_follower() {
                inner.fsm.tick();
            }
        }
        self.wake_io();
    }

    pub async fn wait_election_done(&self) {
        while { self.locked().fsm.is_candidate() } {
            tokio::task::yield_now().await;
        }
    }

    pub fn elapse_election(&self) {
        {
            let mut inner = self.locked();
            while inner.fsm.election_elapsed() < ELECTION_TIMEOUT_TICKS {
                inner.fsm.tick();
            }
        }
        self.wake_io();
    }

    pub async fn wait_log_idx_term(&self, target: (Index, Term)) {
        loop {
            {
                let inner = self.locked();
                if inner.fsm.log_last_term() >= target.1 && inner.fsm.log_last_idx() >= target.0 {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_micros(5)).await;
        }
    }

    pub fn log_last_idx_term(&self) -> (Index, Term) {
        let inner = self.locked();
        (inner.fsm.log_last_idx(), inner.fsm.log_last_term())
    }

    // ------- Shutdown --------

    /// Stop both pipelines, abort the collaborators and fail every pending
    /// promise. Idempotent.
    pub async fn abort(&self) {
        slog::trace!(self.shared.logger, "abort() called");
        let (io_task, applier_task) = {
            let mut inner = self.locked();
            inner.stopped = true;
            (inner.io_task.take(), inner.applier_task.take())
        };
        self.shared.output_ready.notify_one();
        self.shared.log_space.notify_waiters();
        let _ = self.shared.apply_tx.send(ApplyItem::Stop).await;

        // The pipelines resolve waiters and start snapshot transfers, so
        // they must be fully stopped before the final sweep below.
        if let Some(task) = io_task {
            let _ = task.await;
        }
        if let Some(task) = applier_task {
            let _ = task.await;
        }

        self.shared.rpc.abort().await;
        self.shared.state_machine.abort().await;
        self.shared.persistence.abort().await;

        let (transfer_tasks, append_workers) = {
            let mut inner = self.locked();
            let _ = inner.waiters.fail_all(Error::Stopped);
            for waiter in inner.leader_waiters.drain(..) {
                let _ = waiter.send(Err(Error::Stopped));
            }
            if let Some(done) = inner.stepdown.take() {
                let _ = done.send(Err(Error::Stopped));
            }
            inner.reads.fail_all(None);
            inner.applied_waiters.fail_all(Error::Stopped);
            // Dropping the senders fails the pending inbound applications.
            inner.snapshot_application_done.clear();
            inner.transfers.abort_all();
            let transfer_tasks = inner.transfers.drain();
            let append_workers: Vec<AppendWorker> =
                inner.append_workers.drain().map(|(_, worker)| worker).collect();
            (transfer_tasks, append_workers)
        };

        for task in transfer_tasks {
            let _ = task.await;
        }
        for worker in append_workers {
            drop(worker.tx);
            let _ = worker.task.await;
        }
    }

    // ------- I/O pipeline --------

    async fn io_pipeline(self, last_stable: Index) {
        slog::trace!(self.shared.logger, "io pipeline start");
        match self.run_io_pipeline(last_stable).await {
            Ok(()) | Err(PipelineFatal::QueueClosed) => {
                slog::trace!(self.shared.logger, "io pipeline stopped");
            }
            Err(error) => {
                slog::error!(self.shared.logger, "io pipeline stopped because of an error: {}", error);
                self.mark_stopped();
            }
        }
    }

    async fn run_io_pipeline(&self, mut last_stable: Index) -> Result<(), PipelineFatal> {
        loop {
            let Some(batch) = self.next_output().await else {
                return Ok(());
            };
            self.shared.metrics.poll();
            self.process_batch(batch, &mut last_stable).await?;
            // Entries may have stabilized or the log may have shrunk;
            // submitters parked on a full log get to re-check.
            self.shared.log_space.notify_waiters();
        }
    }

    async fn next_output(&self) -> Option<FsmOutput> {
        loop {
            let notified = self.shared.output_ready.notified();
            {
                let mut inner = self.locked();
                if inner.stopped {
                    return None;
                }
                if let Some(batch) = inner.fsm.poll_output() {
                    return Some(batch);
                }
            }
            notified.await;
        }
    }

    /// Drain one output batch. The step order is the safety contract:
    /// term/vote before anything that could disclose the term, snapshot and
    /// entries before the messages announcing them, joining members before
    /// dispatch, leaving members after, committed entries before read
    /// barrier resolution.
    async fn process_batch(&self, batch: FsmOutput, last_stable: &mut Index) -> Result<(), PipelineFatal> {
        if let Some((term, vote)) = batch.term_and_vote {
            self.shared.persistence.store_term_and_vote(term, vote).await?;
            self.shared.metrics.store_term_and_vote();
        }

        if let Some(update) = batch.snapshot {
            slog::trace!(self.shared.logger, "storing snapshot {}", update.descriptor.id);
            let trailing = if update.is_local { self.shared.options.snapshot_trailing } else { 0 };
            self.shared
                .persistence
                .store_snapshot_descriptor(&update.descriptor, trailing)
                .await?;
            self.shared.metrics.store_snapshot();
            // The superseded snapshot is no longer referenced.
            self.shared.state_machine.drop_snapshot(update.old_id);
            // A locally taken snapshot is already reflected in the state
            // machine; a remote one must go through the apply queue so it
            // lands in commit order.
            if !update.is_local {
                self.push_apply(ApplyItem::Snapshot(update.descriptor)).await?;
            }
        }

        if let (Some(first), Some(last)) = (batch.log_entries.first(), batch.log_entries.last()) {
            if *last_stable >= first.idx {
                self.shared.persistence.truncate_log(first.idx).await?;
                self.shared.metrics.truncate_persisted_log();
            }
            self.shared.persistence.store_log_entries(&batch.log_entries).await?;
            *last_stable = last.idx;
            self.shared.metrics.persisted_log_entries(batch.log_entries.len() as u64);
        }

        {
            let mut inner = self.locked();
            // Joining members must be known to the transport before this
            // batch's messages go out; members that left are removed only
            // after dispatch, since the same batch may still address them.
            let rpc_diff = batch
                .configuration
                .as_ref()
                .map(|config| diff_address_sets(&inner.rpc_config, config));
            if let Some(diff) = &rpc_diff {
                for addr in &diff.joining {
                    inner.rpc_config.insert(addr.clone());
                    self.shared.rpc.add_server(addr.id, addr.info.clone());
                }
            }

            for (dst, message) in batch.messages {
                self.dispatch_message(&mut inner, dst, message);
            }

            if let Some(diff) = rpc_diff {
                for addr in diff.leaving {
                    inner.transfers.abort_one(addr.id);
                    inner.rpc_config.remove(&addr);
                    self.shared.rpc.remove_server(addr.id);
                }
            }
        }

        if !batch.committed.is_empty() {
            self.shared.metrics.queue_entries_for_apply(batch.committed.len() as u64);
            self.push_apply(ApplyItem::Entries(batch.committed)).await?;
        }

        {
            let mut inner = self.locked();
            if let Some(max_confirmed) = batch.max_read_id_with_quorum {
                inner.reads.resolve_up_to(max_confirmed);
            }

            if !inner.fsm.is_leader() {
                if let Some(done) = inner.stepdown.take() {
                    let _ = done.send(Ok(()));
                }
                // Deposed and no longer in the configuration: this server
                // will never learn the fate of entries it accepted.
                if !inner.rpc_config.contains(&ServerAddress::from_id(self.shared.id)) {
                    let dropped = inner.waiters.drop_waiters(None);
                    self.shared.metrics.waiters_dropped(dropped);
                }
                inner.transfers.abort_all();
                let leader = inner.fsm.current_leader();
                inner.reads.fail_all(leader);
            } else if batch.abort_leadership_transfer {
                if let Some(done) = inner.stepdown.take() {
                    let _ = done.send(Err(Error::Timeout));
                }
            }

            if inner.fsm.current_leader().is_some() {
                for waiter in inner.leader_waiters.drain(..) {
                    let _ = waiter.send(Ok(()));
                }
            }

            self.shared.metrics.in_memory_log_size(inner.fsm.in_memory_log_size());
        }

        Ok(())
    }

    async fn push_apply(&self, item: ApplyItem) -> Result<(), PipelineFatal> {
        self.shared
            .apply_tx
            .send(item)
            .await
            .map_err(|_| PipelineFatal::QueueClosed)
    }

    fn dispatch_message(&self, inner: &mut ServerInner<F>, dst: ServerId, message: Message) {
        self.shared.metrics.message_sent(message.type_label());
        let send_result = match message {
            Message::AppendRequest(request) => {
                self.dispatch_append(inner, dst, request);
                Ok(())
            }
            Message::InstallSnapshot(request) => {
                self.start_snapshot_transfer(inner, dst, request);
                Ok(())
            }
            Message::SnapshotReply(reply) => {
                // Completes the pending inbound application from `dst`.
                match inner.snapshot_application_done.remove(&dst) {
                    Some(done) => {
                        let _ = done.send(reply);
                    }
                    None => {
                        slog::error!(self.shared.logger, "snapshot reply for {} without a pending application", dst);
                    }
                }
                Ok(())
            }
            Message::AppendReply(reply) => self.shared.rpc.send_append_entries_reply(dst, reply),
            Message::VoteRequest(request) => self.shared.rpc.send_vote_request(dst, request),
            Message::VoteReply(reply) => self.shared.rpc.send_vote_reply(dst, reply),
            Message::TimeoutNow(request) => self.shared.rpc.send_timeout_now(dst, request),
            Message::ReadQuorum(request) => self.shared.rpc.send_read_quorum(dst, request),
            Message::ReadQuorumReply(reply) => self.shared.rpc.send_read_quorum_reply(dst, reply),
        };
        if let Err(error) = send_result {
            // Not being able to send a message is not a critical error.
            slog::debug!(self.shared.logger, "failed to send a message to {}: {}", dst, error);
        }
    }

    /// Append requests are serialized per destination: a worker task sends
    /// one at a time, which bounds the in-flight appends to one per peer.
    fn dispatch_append(&self, inner: &mut ServerInner<F>, dst: ServerId, request: AppendRequest) {
        let worker = inner.append_workers.entry(dst).or_insert_with(|| {
            let (tx, rx) = mpsc::channel(APPEND_QUEUE_DEPTH);
            let rpc = Arc::clone(&self.shared.rpc);
            let logger = self.shared.logger.clone();
            let task = tokio::spawn(append_sender_task(rpc, dst, rx, logger));
            AppendWorker { tx, task }
        });
        if worker.tx.try_send(request).is_err() {
            // Queue full (or worker gone): treated like any lost message.
            slog::debug!(self.shared.logger, "dropping append request to {}", dst);
        }
    }

    fn start_snapshot_transfer(&self, inner: &mut ServerInner<F>, dst: ServerId, request: InstallSnapshot) {
        let transfer_id = inner.transfers.next_id();
        let (cancel_handle, cancel_signal) = transfer_cancel_pair();
        slog::trace!(self.shared.logger, "starting snapshot transfer {} to {}", transfer_id, dst);
        let task = tokio::spawn(self.clone().snapshot_transfer_task(dst, transfer_id, request, cancel_signal));
        inner.transfers.insert(dst, transfer_id, cancel_handle, task);
    }

    async fn snapshot_transfer_task(
        self,
        dst: ServerId,
        transfer_id: u64,
        request: InstallSnapshot,
        cancel: TransferCancelSignal,
    ) {
        // The spawner inserts the registry entry under the lock it still
        // holds; yielding here keeps the ordering obvious even when the
        // send resolves immediately.
        tokio::task::yield_now().await;
        let result = self.shared.rpc.send_snapshot(dst, request, cancel).await;
        {
            let mut inner = self.locked();
            if inner.transfers.finish(dst, transfer_id) == TransferCompletion::Discard {
                return;
            }
            let reply = match result {
                Ok(reply) => {
                    slog::trace!(self.shared.logger, "transferred snapshot to {}", dst);
                    reply
                }
                Err(error) => {
                    slog::error!(self.shared.logger, "transferring snapshot to {} failed: {}", dst, error);
                    SnapshotReply {
                        current_term: inner.fsm.current_term(),
                        success: false,
                    }
                }
            };
            inner.fsm.step(dst, Message::SnapshotReply(reply));
        }
        self.wake_io();
    }

    fn mark_stopped(&self) {
        self.locked().stopped = true;
        self.shared.log_space.notify_waiters();
        self.shared.output_ready.notify_one();
    }

    // ------- Apply pipeline --------

    async fn applier_pipeline(self, apply_rx: mpsc::Receiver<ApplyItem>) {
        slog::trace!(self.shared.logger, "applier pipeline start");
        match self.run_applier_pipeline(apply_rx).await {
            Ok(()) => slog::trace!(self.shared.logger, "applier pipeline stopped"),
            Err(error) => {
                slog::error!(self.shared.logger, "applier pipeline stopped because of an error: {}", error);
                self.mark_stopped();
            }
        }
    }

    async fn run_applier_pipeline(&self, mut apply_rx: mpsc::Receiver<ApplyItem>) -> Result<(), PipelineFatal> {
        loop {
            let Some(item) = apply_rx.recv().await else {
                return Ok(());
            };
            match item {
                ApplyItem::Stop => return Ok(()),
                ApplyItem::Entries(batch) => self.apply_entries(batch).await?,
                ApplyItem::Snapshot(descriptor) => self.apply_remote_snapshot(descriptor).await?,
            }

            let mut inner = self.locked();
            let applied_idx = inner.applied_idx;
            inner.applied_waiters.signal_up_to(applied_idx);
        }
    }

    async fn apply_entries(&self, batch: Vec<LogEntryRef>) -> Result<(), PipelineFatal> {
        let (last_idx, last_term) = match batch.last() {
            Some(last) => (last.idx, last.term),
            None => {
                slog::trace!(self.shared.logger, "applier received an empty batch");
                return Ok(());
            }
        };

        let commands: Vec<Bytes> = {
            let mut inner = self.locked();
            // Commit waiters resolve before the entries are applied, and in
            // the same pipeline that loads snapshots, so a commit is never
            // notified for an entry an earlier queued snapshot subsumes.
            let awaken = inner.waiters.notify_committed(&batch);
            self.shared.metrics.waiters_awaken(awaken);

            assert_eq!(
                last_idx.val(),
                inner.applied_idx.val() + batch.len() as u64,
                "committed batch is not contiguous with the applied prefix"
            );

            batch
                .iter()
                .filter_map(|entry| match &entry.payload {
                    EntryPayload::Command(data) => Some(data.clone()),
                    _ => None,
                })
                .collect()
        };

        if !commands.is_empty() {
            let count = commands.len() as u64;
            self.shared.state_machine.apply(commands).await?;
            self.shared.metrics.applied_entries(count);
        }

        let snapshot_config = {
            let mut inner = self.locked();
            inner.applied_idx = last_idx;
            let awaken = inner.waiters.notify_applied(&batch);
            self.shared.metrics.waiters_awaken(awaken);

            // The protocol core may already hold a later (remote) snapshot
            // that has not come through the queue yet; compare against its
            // view so stale state is not snapshotted.
            let last_snapshot_idx = inner.fsm.log_last_snapshot_idx();
            if inner.applied_idx >= last_snapshot_idx
                && inner.applied_idx.val() - last_snapshot_idx.val() >= self.shared.options.snapshot_threshold
            {
                Some(inner.fsm.log_last_conf_for(inner.applied_idx))
            } else {
                None
            }
        };

        if let Some(config) = snapshot_config {
            self.take_local_snapshot(last_idx, last_term, config).await?;
        }

        Ok(())
    }

    async fn take_local_snapshot(&self, idx: Index, term: Term, config: Configuration) -> Result<(), PipelineFatal> {
        slog::trace!(self.shared.logger, "applier taking snapshot at term={} idx={}", term, idx);
        let id = self.shared.state_machine.take_snapshot().await?;
        let descriptor = SnapshotDescriptor { id, idx, term, config };

        // While the snapshot was being taken the protocol core may have
        // accepted a later one; it rejects ours in that case and the fresh
        // id is dropped.
        let accepted = {
            let mut inner = self.locked();
            inner
                .fsm
                .apply_snapshot(descriptor, self.shared.options.snapshot_trailing, true)
        };
        if accepted {
            // The core now has a snapshot update to emit; let the I/O
            // pipeline persist it.
            self.wake_io();
        } else {
            self.shared.state_machine.drop_snapshot(id);
        }
        self.shared.metrics.snapshots_taken();
        Ok(())
    }

    async fn apply_remote_snapshot(&self, descriptor: SnapshotDescriptor) -> Result<(), PipelineFatal> {
        slog::trace!(self.shared.logger, "applier loading snapshot {}", descriptor.id);
        {
            let inner = self.locked();
            assert!(
                descriptor.idx >= inner.applied_idx,
                "snapshot at {} precedes the applied prefix {}",
                descriptor.idx,
                inner.applied_idx
            );
        }

        self.shared.state_machine.load_snapshot(descriptor.id).await?;

        {
            let mut inner = self.locked();
            // Whatever those entries were, the snapshot subsumed them; their
            // individual fate is unknowable now.
            let dropped = inner.waiters.drop_waiters(Some(descriptor.idx));
            self.shared.metrics.waiters_dropped(dropped);
            inner.applied_idx = descriptor.idx;
        }
        self.shared.metrics.sm_load_snapshot();
        Ok(())
    }
}

async fn append_sender_task(
    rpc: Arc<dyn Rpc>,
    dst: ServerId,
    mut requests: mpsc::Receiver<AppendRequest>,
    logger: slog::Logger,
) {
    while let Some(request) = requests.recv().await {
        if let Err(error) = rpc.send_append_entries(dst, request).await {
            slog::debug!(logger, "failed to send append entries to {}: {}", dst, error);
        }
    }
}
