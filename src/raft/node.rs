use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use log::{debug, error, info, warn};
use rand::Rng as _;
use serde_derive::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::time::timeout;

use super::log::{Command, Entry, Index, Log, Snapshot};
use super::membership::{ClusterConfig, Synchronizer};
use super::message::{
    AppendEntries, AppendEntriesResponse, InstallSnapshot, InstallSnapshotResponse, Request,
    RequestVote, RequestVoteResponse, Response,
};
use super::quorum;
use super::state::State;
use crate::errinput;
use crate::error::{Error, Result};
use crate::net;
use crate::storage;

/// A node ID.
pub type NodeID = u64;

/// A leader term.
pub type Term = u64;

/// The interval between timer ticks, which drive elections and heartbeats.
const TICK_INTERVAL: Duration = Duration::from_millis(10);

/// Node tuning options.
#[derive(Clone, Debug)]
pub struct Options {
    /// The interval between leader heartbeats.
    pub heartbeat_interval: Duration,
    /// The election timeout range. Randomized per election to avoid ties.
    pub election_timeout: std::ops::Range<Duration>,
    /// The timeout for a single RPC round trip.
    pub rpc_timeout: Duration,
    /// The maximum number of entries per append message.
    pub max_append_entries: usize,
    /// The number of applied entries to retain in the log before taking a
    /// snapshot and compacting the prefix. 0 disables snapshots.
    pub snapshot_threshold: u64,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(50),
            election_timeout: Duration::from_millis(150)..Duration::from_millis(300),
            rpc_timeout: Duration::from_millis(1000),
            max_append_entries: 100,
            snapshot_threshold: 1000,
        }
    }
}

impl Options {
    /// Validates the options.
    pub fn validate(&self) -> Result<()> {
        if self.heartbeat_interval.is_zero() {
            return errinput!("heartbeat interval must be positive");
        }
        if self.election_timeout.start.is_zero() {
            return errinput!("election timeout must be positive");
        }
        if self.election_timeout.start >= self.election_timeout.end {
            return errinput!("election timeout range must not be empty");
        }
        // Heartbeats must fit comfortably within the election timeout,
        // otherwise healthy leaders get deposed by spurious elections.
        if self.heartbeat_interval > self.election_timeout.start / 3 {
            return errinput!("heartbeat interval must be at most a third of the election timeout");
        }
        if self.rpc_timeout.is_zero() {
            return errinput!("rpc timeout must be positive");
        }
        if self.max_append_entries == 0 {
            return errinput!("max append entries must be positive");
        }
        Ok(())
    }
}

/// Node status, as reported by [`Node::status`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Status {
    /// This node.
    pub server: NodeID,
    /// The current term.
    pub term: Term,
    /// The known leader, if any.
    pub leader: Option<NodeID>,
    /// The current role: follower, candidate, or leader.
    pub role: String,
    /// The last log index.
    pub last_index: Index,
    /// The commit index.
    pub commit_index: Index,
    /// The applied index.
    pub apply_index: Index,
    /// The log storage engine status.
    pub storage: storage::Status,
}

/// A Raft node.
///
/// The node's state (term, role, log, commit index) is guarded by a single
/// mutex, so elections and replication never observe torn state. The lock is
/// only held for local decisions and storage writes, never across network
/// IO: RPC fan-out happens in spawned tasks that reacquire the lock to apply
/// the outcome, revalidating the term and role first.
///
/// Cloning the node yields another handle to the same node. Background
/// timers stop once all handles are dropped.
#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

pub(crate) struct NodeInner {
    id: NodeID,
    opts: Options,
    client: Arc<dyn net::Client>,
    state: Mutex<RaftState>,
}

/// A follower replicates entries from a leader.
struct Follower {
    /// The leader, or None if just initialized or in a fresh term.
    leader: Option<NodeID>,
    /// The node we voted for in the current term, if any.
    voted_for: Option<NodeID>,
    /// When the election timer fires, absent leader contact.
    election_deadline: Instant,
}

/// A candidate is campaigning for leadership. The vote tally lives in the
/// campaign task's quorum collector, not here.
struct Candidate {
    /// When the election times out and restarts with a fresh randomized
    /// timeout, to avoid livelock on split votes.
    election_deadline: Instant,
}

/// A leader replicates its log to followers and serves client requests.
struct Leader {
    /// Replication progress per peer.
    progress: HashMap<NodeID, Progress>,
    /// Pending client writes, keyed by log index. Resolved when the entry is
    /// applied, aborted on leadership loss.
    writes: HashMap<Index, Write>,
    /// The configuration change synchronizer.
    sync: Synchronizer,
    /// The time of the last heartbeat broadcast.
    last_heartbeat: Instant,
}

/// Peer replication progress.
struct Progress {
    /// The next index to replicate to the peer.
    next: Index,
    /// The last index known to be replicated to the peer.
    match_index: Index,
    /// Whether an RPC to this peer is in flight. At most one append is
    /// outstanding per peer, preserving per-session ordering.
    inflight: bool,
}

/// A pending client write.
struct Write {
    /// Resolves the client's future with the applied command result.
    tx: oneshot::Sender<Result<Vec<u8>>>,
}

enum Role {
    Follower(Follower),
    Candidate(Candidate),
    Leader(Leader),
}

impl Role {
    fn name(&self) -> &'static str {
        match self {
            Role::Follower(_) => "follower",
            Role::Candidate(_) => "candidate",
            Role::Leader(_) => "leader",
        }
    }
}

struct RaftState {
    id: NodeID,
    opts: Options,
    term: Term,
    log: Log,
    state: Box<dyn State>,
    config: ClusterConfig,
    role: Role,
    /// Set when a fatal error (e.g. a storage failure) occurred. A node that
    /// can't write durably must not acknowledge appends or grant votes, so
    /// it stops participating entirely.
    halted: bool,
}

impl Node {
    /// Creates a new Raft node and starts its timers. The node begins as a
    /// leaderless follower. `peers` seeds the cluster configuration on first
    /// boot; a configuration recovered from the log or snapshot takes
    /// precedence. Must be called within a tokio runtime.
    pub fn new(
        id: NodeID,
        peers: impl IntoIterator<Item = NodeID>,
        mut log: Log,
        mut state: Box<dyn State>,
        client: Arc<dyn net::Client>,
        opts: Options,
    ) -> Result<Self> {
        opts.validate()?;

        // Catch the state machine up to the latest snapshot, e.g. after the
        // state machine lost its (non-durable) state in a restart.
        if let Some(snapshot) = log.get_snapshot()? {
            if snapshot.index > state.get_applied_index() {
                state.restore(snapshot.index, &snapshot.data)?;
            }
        }

        let seed = ClusterConfig::new(peers.into_iter().chain([id]));
        let config = Self::scan_config(&mut log)?.unwrap_or(seed);
        let (term, voted_for) = log.get_term();
        let election_deadline = rand_election_deadline(&opts);

        let raft = RaftState {
            id,
            opts: opts.clone(),
            term,
            log,
            state,
            config,
            role: Role::Follower(Follower { leader: None, voted_for, election_deadline }),
            halted: false,
        };
        let inner = Arc::new(NodeInner { id, opts, client, state: Mutex::new(raft) });
        tokio::spawn(Self::tick_loop(Arc::downgrade(&inner)));
        Ok(Node { inner })
    }

    /// Returns the node ID.
    pub fn id(&self) -> NodeID {
        self.inner.id
    }

    /// Returns the node's current term.
    pub fn term(&self) -> Term {
        self.inner.lock().term
    }

    /// Returns whether the node currently believes it is the leader.
    pub fn is_leader(&self) -> bool {
        matches!(self.inner.lock().role, Role::Leader(_))
    }

    /// Returns node status.
    pub fn status(&self) -> Result<Status> {
        let mut state = self.inner.lock();
        let leader = match &state.role {
            Role::Follower(follower) => follower.leader,
            Role::Candidate(_) => None,
            Role::Leader(_) => Some(state.id),
        };
        Ok(Status {
            server: state.id,
            term: state.term,
            leader,
            role: state.role.name().to_string(),
            last_index: state.log.get_last_index().0,
            commit_index: state.log.get_commit_index().0,
            apply_index: state.state.get_applied_index(),
            storage: state.log.status()?,
        })
    }

    /// Submits a write command for consensus. As leader, appends it to the
    /// local log and replicates it; the returned future resolves with the
    /// state machine result once the entry commits and is applied.
    ///
    /// Fails with NotLeader when not the leader, Abort if leadership is lost
    /// before the entry commits, and Timeout on deadline. A timed-out or
    /// dropped future does not withdraw the entry: once committed, it is
    /// applied regardless.
    pub async fn submit(&self, command: Vec<u8>, deadline: Duration) -> Result<Vec<u8>> {
        let rx = {
            let mut state = self.inner.lock();
            state.check_halted()?;
            if !matches!(state.role, Role::Leader(_)) {
                return Err(Error::NotLeader);
            }
            let index = state.log.append(Command::Write(command))?;
            let (tx, rx) = oneshot::channel();
            if let Role::Leader(leader) = &mut state.role {
                leader.writes.insert(index, Write { tx });
            }
            // A single-node cluster commits immediately.
            if let Err(err) = state.commit_and_apply() {
                state.halt(&err);
                return Err(err);
            }
            Self::replicate_all(&self.inner, &mut state);
            rx
        };
        match timeout(deadline, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::Abort), // sender dropped: leadership lost
            Err(_) => Err(Error::Timeout),
        }
    }

    /// Adds a voting member to the cluster via joint consensus.
    pub async fn add_server(&self, node: NodeID, deadline: Duration) -> Result<()> {
        let mut members = self.inner.lock().config.members().clone();
        if !members.insert(node) {
            return errinput!("node {node} is already a member");
        }
        self.reconfigure(members, deadline).await
    }

    /// Removes a voting member from the cluster via joint consensus.
    pub async fn remove_server(&self, node: NodeID, deadline: Duration) -> Result<()> {
        let mut members = self.inner.lock().config.members().clone();
        if !members.remove(&node) {
            return errinput!("node {node} is not a member");
        }
        self.reconfigure(members, deadline).await
    }

    /// Reconfigures the cluster to the given member set, via a committed
    /// joint configuration followed by a committed final configuration. Only
    /// one reconfiguration can be in flight at a time; concurrent requests
    /// are rejected.
    pub async fn reconfigure(&self, members: BTreeSet<NodeID>, deadline: Duration) -> Result<()> {
        let rx = {
            let mut state = self.inner.lock();
            state.check_halted()?;
            if !matches!(state.role, Role::Leader(_)) {
                return Err(Error::NotLeader);
            }
            let joint = state.config.to_joint(members.clone())?;
            let (tx, rx) = oneshot::channel();
            let Role::Leader(leader) = &mut state.role else {
                unreachable!("role checked above");
            };
            leader.sync.begin(members, tx)?;
            info!("node {}: appending joint configuration {joint:?}", state.id);
            state.log.append(Command::Config(joint.clone()))?;
            state.adopt_config(joint);
            if let Err(err) = state.commit_and_apply() {
                state.halt(&err);
                return Err(err);
            }
            Self::replicate_all(&self.inner, &mut state);
            rx
        };
        match timeout(deadline, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::Abort),
            Err(_) => Err(Error::Timeout),
        }
    }

    /// Scans the log for the most recent configuration entry, falling back
    /// to the snapshot configuration.
    fn scan_config(log: &mut Log) -> Result<Option<ClusterConfig>> {
        let mut scan = log.scan(..);
        while let Some(entry) = scan.next_back().transpose()? {
            if let Command::Config(config) = entry.command {
                return Ok(Some(config));
            }
        }
        drop(scan);
        Ok(log.get_snapshot()?.map(|snapshot| snapshot.config))
    }

    /// Drives election and heartbeat timers until the node is dropped or
    /// halts.
    async fn tick_loop(weak: Weak<NodeInner>) {
        enum Action {
            Campaign,
            Heartbeat,
            Wait,
        }
        let mut ticker = tokio::time::interval(TICK_INTERVAL);
        loop {
            ticker.tick().await;
            let Some(inner) = weak.upgrade() else { return };
            let mut state = inner.lock();
            if state.halted {
                return;
            }
            let now = Instant::now();
            let action = match &mut state.role {
                Role::Follower(follower) if now >= follower.election_deadline => Action::Campaign,
                Role::Candidate(candidate) if now >= candidate.election_deadline => {
                    Action::Campaign
                }
                Role::Leader(leader)
                    if now.duration_since(leader.last_heartbeat)
                        >= inner.opts.heartbeat_interval =>
                {
                    leader.last_heartbeat = now;
                    Action::Heartbeat
                }
                _ => Action::Wait,
            };
            let result = match action {
                Action::Campaign => Self::campaign(&inner, &mut state),
                Action::Heartbeat => {
                    Self::replicate_all(&inner, &mut state);
                    Ok(())
                }
                Action::Wait => Ok(()),
            };
            if let Err(err) = result {
                state.halt(&err);
                return;
            }
        }
    }

    /// Campaigns for leadership: increments the term, votes for ourself, and
    /// solicits votes from all peers concurrently. The vote responses are
    /// aggregated by the quorum collector in a spawned task, which assumes
    /// leadership on a majority grant, steps down on discovering a higher
    /// term, and otherwise leaves the candidate to restart the election when
    /// its randomized timeout fires.
    fn campaign(inner: &Arc<NodeInner>, state: &mut RaftState) -> Result<()> {
        // Nodes outside the configuration (e.g. removed members) don't
        // campaign; they wait quietly for a leader to contact them.
        if !state.config.contains(state.id) {
            let (_, voted_for) = state.log.get_term();
            state.role = Role::Follower(Follower {
                leader: None,
                voted_for,
                election_deadline: rand_election_deadline(&state.opts),
            });
            return Ok(());
        }
        let term = state.term + 1;
        info!("node {}: starting election for term {term}", state.id);
        state.log.set_term(term, Some(state.id))?; // durably vote for ourself
        state.term = term;
        state.abort_pending();
        state.role =
            Role::Candidate(Candidate { election_deadline: rand_election_deadline(&state.opts) });

        let (last_index, last_term) = state.log.get_last_index();
        let request = RequestVote { term, candidate: state.id, last_index, last_term };
        let config = state.config.clone();
        let peers = config.peers(state.id);
        let id = state.id;
        let client = inner.client.clone();
        let rpc_timeout = inner.opts.rpc_timeout;
        let weak = Arc::downgrade(inner);

        tokio::spawn(async move {
            // The highest term seen in any response; if above ours, we must
            // step down regardless of the vote tally.
            let seen_term = Arc::new(AtomicU64::new(0));
            let votes: Vec<_> = peers
                .into_iter()
                .map(|peer| {
                    let client = client.clone();
                    let request = request.clone();
                    let seen_term = seen_term.clone();
                    let vote = async move {
                        match timeout(rpc_timeout, client.call(peer, Request::Vote(request))).await
                        {
                            Ok(Ok(Response::Vote(resp))) => {
                                seen_term.fetch_max(resp.term, Ordering::Relaxed);
                                resp.term == term && resp.vote_granted
                            }
                            Ok(Ok(resp)) => {
                                warn!("unexpected response {resp:?} to vote request");
                                false
                            }
                            Ok(Err(err)) => {
                                debug!("vote request to {peer} failed: {err}");
                                false
                            }
                            Err(_) => {
                                debug!("vote request to {peer} timed out");
                                false
                            }
                        }
                    };
                    (peer, vote)
                })
                .collect();
            let won = quorum::collect(votes, [id].into(), &config).await.is_ok();

            let Some(inner) = weak.upgrade() else { return };
            let mut state = inner.lock();
            let seen_term = seen_term.load(Ordering::Relaxed);
            let result = if seen_term > state.term {
                state.become_follower(seen_term, None)
            } else if state.term != term || !matches!(state.role, Role::Candidate(_)) {
                Ok(()) // stale election, drop the outcome
            } else if won {
                Self::become_leader(&inner, &mut state)
            } else {
                // Split vote or too many failures. Stay candidate; the
                // election restarts when the randomized timeout fires.
                debug!("node {}: election for term {term} not won", state.id);
                Ok(())
            };
            if let Err(err) = result {
                state.halt(&err);
            }
        });
        Ok(())
    }

    /// Assumes leadership after winning an election.
    fn become_leader(inner: &Arc<NodeInner>, state: &mut RaftState) -> Result<()> {
        info!("node {}: won election for term {}, becoming leader", state.id, state.term);
        let (last_index, _) = state.log.get_last_index();
        let progress = state
            .config
            .peers(state.id)
            .into_iter()
            .map(|peer| (peer, Progress { next: last_index + 1, match_index: 0, inflight: false }))
            .collect();
        state.role = Role::Leader(Leader {
            progress,
            writes: HashMap::new(),
            sync: Synchronizer::new(),
            last_heartbeat: Instant::now(),
        });

        // Append a noop to safely commit entries from prior terms (Raft
        // paper §5.4.2).
        state.log.append(Command::Noop)?;

        // If a prior leader left a joint configuration behind, carry the
        // transition forward by appending the final configuration.
        if state.config.is_joint() {
            let config = state.config.finalize();
            info!("node {}: completing configuration change to {config:?}", state.id);
            state.log.append(Command::Config(config.clone()))?;
            state.adopt_config(config);
        }

        state.commit_and_apply()?;
        Self::replicate_all(inner, state);
        Ok(())
    }

    /// Starts replication to all peers that don't have an RPC in flight.
    /// Serves as both heartbeat and log replication: peers that are up to
    /// date receive an empty append asserting leadership.
    fn replicate_all(inner: &Arc<NodeInner>, state: &mut RaftState) {
        let term = state.term;
        let Role::Leader(leader) = &mut state.role else {
            return;
        };
        for (peer, progress) in leader.progress.iter_mut() {
            if progress.inflight {
                continue;
            }
            progress.inflight = true;
            tokio::spawn(Self::replicate(Arc::downgrade(inner), *peer, term));
        }
    }

    /// Replicates to a single peer until it is caught up, then sends the
    /// final (possibly empty) append as a heartbeat. On log mismatch, backs
    /// the next index off to the peer's match hint and retries. Peers behind
    /// the compacted log prefix receive a snapshot instead. Transport
    /// failures end the attempt; the next heartbeat retries.
    async fn replicate(weak: Weak<NodeInner>, peer: NodeID, term: Term) {
        loop {
            let Some(inner) = weak.upgrade() else { return };

            // Build the next request under the lock.
            let request = {
                let mut guard = inner.lock();
                let state = &mut *guard;
                if state.term != term {
                    return;
                }
                let Role::Leader(leader) = &state.role else { return };
                let Some(progress) = leader.progress.get(&peer) else { return };
                match build_replicate(&mut state.log, progress, state.id, term, &state.opts) {
                    Ok(request) => request,
                    Err(err) => {
                        state.halt(&err);
                        return;
                    }
                }
            };

            // Exchange the RPC without holding the lock.
            let result =
                timeout(inner.opts.rpc_timeout, inner.client.call(peer, request.clone())).await;

            // Apply the outcome under the lock.
            let mut guard = inner.lock();
            let state = &mut *guard;
            if state.term != term || !matches!(state.role, Role::Leader(_)) {
                return;
            }
            match handle_replicate_response(state, peer, &request, result) {
                Ok(true) => continue, // more to send
                Ok(false) => break,   // caught up, or a transport failure
                Err(err) => {
                    state.halt(&err);
                    return;
                }
            }
        }

        // Clear the inflight flag so the next heartbeat replicates again.
        let Some(inner) = weak.upgrade() else { return };
        let mut state = inner.lock();
        if state.term != term {
            return;
        }
        if let Role::Leader(leader) = &mut state.role {
            if let Some(progress) = leader.progress.get_mut(&peer) {
                progress.inflight = false;
            }
        }
    }
}

/// Builds the next replication request for a peer: a snapshot install if
/// the peer is behind the compacted prefix, otherwise an append from its
/// next index.
fn build_replicate(
    log: &mut Log,
    progress: &Progress,
    id: NodeID,
    term: Term,
    opts: &Options,
) -> Result<Request> {
    let (prefix_index, prefix_term) = log.get_prefix_index();
    if progress.next <= prefix_index {
        let snapshot = log.get_snapshot()?.expect("compacted log must have a snapshot");
        debug!("sending snapshot at {}", snapshot.index);
        return Ok(Request::Snapshot(InstallSnapshot { term, leader: id, snapshot }));
    }
    let prev_index = progress.next - 1;
    let prev_term = match prev_index {
        0 => 0,
        i if i == prefix_index => prefix_term,
        i => log.get(i)?.map(|e| e.term).expect("missing base entry"),
    };
    let entries =
        log.scan(progress.next..).take(opts.max_append_entries).collect::<Result<Vec<_>>>()?;
    let (leader_commit, _) = log.get_commit_index();
    Ok(Request::Append(AppendEntries {
        term,
        leader: id,
        prev_index,
        prev_term,
        entries,
        leader_commit,
    }))
}

/// Handles a replication response on the leader. Returns whether replication
/// to the peer should continue immediately.
fn handle_replicate_response(
    state: &mut RaftState,
    peer: NodeID,
    sent: &Request,
    result: std::result::Result<Result<Response>, tokio::time::error::Elapsed>,
) -> Result<bool> {
    let response = match result {
        Ok(Ok(response)) => response,
        Ok(Err(err)) => {
            debug!("replication to peer {peer} failed: {err}");
            return Ok(false);
        }
        Err(_) => {
            debug!("replication to peer {peer} timed out");
            return Ok(false);
        }
    };
    if response.term() > state.term {
        state.become_follower(response.term(), None)?;
        return Ok(false);
    }

    match response {
        Response::Append(resp) if resp.success => {
            let (last_index, _) = state.log.get_last_index();
            let mut matched = 0;
            if let Role::Leader(leader) = &mut state.role {
                if let Some(progress) = leader.progress.get_mut(&peer) {
                    // Clamp against our own log, in case of a bogus response.
                    progress.match_index = progress.match_index.max(resp.match_index.min(last_index));
                    progress.next = progress.match_index + 1;
                    matched = progress.match_index;
                }
            }
            state.commit_and_apply()?;
            // Keep going if entries were appended in the meantime.
            Ok(matched < state.log.get_last_index().0)
        }
        Response::Append(resp) => {
            // Log mismatch: back off to the peer's hint and retry. The hint
            // is capped below the probed index, so this terminates.
            if let Role::Leader(leader) = &mut state.role {
                if let Some(progress) = leader.progress.get_mut(&peer) {
                    let next = (resp.match_index + 1).min(progress.next.saturating_sub(1)).max(1);
                    debug!("peer {peer} rejected append, backing off to {next}");
                    progress.next = next;
                }
            }
            Ok(true)
        }
        Response::Snapshot(resp) => {
            let Request::Snapshot(req) = sent else {
                warn!("unexpected snapshot response from peer {peer}");
                return Ok(false);
            };
            if resp.success {
                if let Role::Leader(leader) = &mut state.role {
                    if let Some(progress) = leader.progress.get_mut(&peer) {
                        progress.match_index = req.snapshot.index;
                        progress.next = req.snapshot.index + 1;
                    }
                }
                state.commit_and_apply()?;
                Ok(true)
            } else {
                // The peer was already ahead of the snapshot. Probe with an
                // append after the prefix on the next heartbeat.
                let (prefix_index, _) = state.log.get_prefix_index();
                if let Role::Leader(leader) = &mut state.role {
                    if let Some(progress) = leader.progress.get_mut(&peer) {
                        progress.next = progress.next.max(prefix_index + 1);
                    }
                }
                Ok(false)
            }
        }
        Response::Vote(_) => {
            warn!("unexpected vote response from peer {peer}");
            Ok(false)
        }
    }
}

impl NodeInner {
    fn lock(&self) -> MutexGuard<'_, RaftState> {
        self.state.lock().expect("state lock poisoned")
    }
}

#[async_trait]
impl net::Handler for Node {
    async fn handle(&self, request: Request) -> Result<Response> {
        let mut state = self.inner.lock();
        state.check_halted()?;
        let result = state.step(request);
        if let Err(err) = &result {
            if !err.is_deterministic() {
                state.halt(err);
            }
        }
        result
    }
}

impl RaftState {
    /// Processes an inbound RPC request.
    fn step(&mut self, request: Request) -> Result<Response> {
        // A request with a future term moves us into that term as a
        // leaderless follower before the request is processed.
        if request.term() > self.term {
            self.become_follower(request.term(), None)?;
        }
        match request {
            Request::Vote(req) => self.request_vote(req).map(Response::Vote),
            Request::Append(req) => self.append_entries(req).map(Response::Append),
            Request::Snapshot(req) => self.install_snapshot(req).map(Response::Snapshot),
        }
    }

    /// Processes a RequestVote RPC. Grants the vote if we haven't voted for
    /// another candidate in this term and the candidate's log is at least as
    /// up-to-date as ours (Raft paper §5.4.1).
    fn request_vote(&mut self, req: RequestVote) -> Result<RequestVoteResponse> {
        assert!(req.term <= self.term, "future term must have been stepped into");
        if req.term < self.term {
            debug!("denying vote for {} in stale term {}", req.candidate, req.term);
            return Ok(RequestVoteResponse { term: self.term, vote_granted: false });
        }

        // Only leaderless followers grant votes; candidates voted for
        // themselves, and a leader means the term's election is already won.
        let may_grant = match &self.role {
            Role::Follower(follower) => {
                follower.leader.is_none()
                    && follower.voted_for.map(|vote| vote == req.candidate).unwrap_or(true)
            }
            Role::Candidate(_) | Role::Leader(_) => false,
        };
        let (last_index, last_term) = self.log.get_last_index();
        let up_to_date = (req.last_term, req.last_index) >= (last_term, last_index);
        if !may_grant || !up_to_date {
            return Ok(RequestVoteResponse { term: self.term, vote_granted: false });
        }

        info!("node {}: voting for {} in term {}", self.id, req.candidate, self.term);
        self.log.set_term(self.term, Some(req.candidate))?;
        let election_deadline = rand_election_deadline(&self.opts);
        if let Role::Follower(follower) = &mut self.role {
            follower.voted_for = Some(req.candidate);
            follower.election_deadline = election_deadline;
        }
        Ok(RequestVoteResponse { term: self.term, vote_granted: true })
    }

    /// Processes an AppendEntries RPC: performs the log consistency check
    /// against prev_index/prev_term, splices the entries (truncating any
    /// conflicting suffix), and advances the commit index.
    fn append_entries(&mut self, req: AppendEntries) -> Result<AppendEntriesResponse> {
        assert!(req.term <= self.term, "future term must have been stepped into");
        if req.term < self.term {
            debug!("rejecting append from {} in stale term {}", req.leader, req.term);
            return Ok(AppendEntriesResponse { term: self.term, success: false, match_index: 0 });
        }
        self.follow(req.leader);

        // Log consistency check. On mismatch, hint at where to resume.
        if req.prev_index > 0 && !self.log.has(req.prev_index, req.prev_term)? {
            let (last_index, _) = self.log.get_last_index();
            let hint = last_index.min(req.prev_index - 1);
            debug!(
                "node {}: rejecting append at {}@{}, hinting {hint}",
                self.id, req.prev_index, req.prev_term
            );
            return Ok(AppendEntriesResponse {
                term: self.term,
                success: false,
                match_index: hint,
            });
        }

        let has_config = req.entries.iter().any(|e| matches!(e.command, Command::Config(_)));
        let (old_last, _) = self.log.get_last_index();
        let last_index = self.log.splice(req.entries)?;

        // Adopt the latest configuration in the log. A conflicting splice
        // may have truncated a previously adopted configuration entry, so
        // rescan the log rather than trusting the appended entries alone.
        if has_config || last_index < old_last {
            if let Some(config) = Node::scan_config(&mut self.log)? {
                self.config = config;
            }
        }

        // Advance the commit index and apply entries. Entries up to
        // last_index are known to match the leader's log.
        let commit = req.leader_commit.min(last_index);
        if commit > self.log.get_commit_index().0 {
            self.log.commit(commit)?;
            self.apply_committed()?;
        }

        Ok(AppendEntriesResponse { term: self.term, success: true, match_index: last_index })
    }

    /// Processes an InstallSnapshot RPC, replacing the local log prefix and
    /// state machine when the snapshot is more recent than local state.
    fn install_snapshot(&mut self, req: InstallSnapshot) -> Result<InstallSnapshotResponse> {
        assert!(req.term <= self.term, "future term must have been stepped into");
        if req.term < self.term {
            return Ok(InstallSnapshotResponse { term: self.term, success: false });
        }
        self.follow(req.leader);

        // Ignore snapshots at or below our commit index; local state is
        // already as recent.
        if req.snapshot.index <= self.log.get_commit_index().0 {
            debug!("node {}: ignoring stale snapshot at {}", self.id, req.snapshot.index);
            return Ok(InstallSnapshotResponse { term: self.term, success: false });
        }

        info!("node {}: installing snapshot at {}", self.id, req.snapshot.index);
        self.state.restore(req.snapshot.index, &req.snapshot.data)?;
        self.config = req.snapshot.config.clone();
        self.log.install(req.snapshot)?;
        Ok(InstallSnapshotResponse { term: self.term, success: true })
    }

    /// Registers leader contact in the current term: candidates convert to
    /// followers (they lost the election), leaderless followers adopt the
    /// leader, and the election timer is reset.
    fn follow(&mut self, leader: NodeID) {
        let election_deadline = rand_election_deadline(&self.opts);
        match &mut self.role {
            Role::Leader(_) => panic!("saw other leader {leader} in term {}", self.term),
            Role::Candidate(_) => {
                info!("node {}: lost election, following leader {leader}", self.id);
                let (_, voted_for) = self.log.get_term();
                self.role = Role::Follower(Follower {
                    leader: Some(leader),
                    voted_for,
                    election_deadline,
                });
            }
            Role::Follower(follower) => {
                match follower.leader {
                    Some(known) => assert_eq!(known, leader, "multiple leaders in term"),
                    None => {
                        info!("node {}: following leader {leader} in term {}", self.id, self.term);
                        follower.leader = Some(leader);
                    }
                }
                follower.election_deadline = election_deadline;
            }
        }
    }

    /// Steps into a new term as a leaderless follower, aborting any pending
    /// leader or candidate work.
    fn become_follower(&mut self, term: Term, leader: Option<NodeID>) -> Result<()> {
        assert!(term > self.term, "can only become follower in a later term");
        info!("node {}: discovered new term {term}", self.id);
        self.log.set_term(term, None)?;
        self.term = term;
        self.abort_pending();
        self.role = Role::Follower(Follower {
            leader,
            voted_for: None,
            election_deadline: rand_election_deadline(&self.opts),
        });
        Ok(())
    }

    /// Aborts pending client writes and configuration changes, typically on
    /// leadership loss. The clients receive Abort and must retry.
    fn abort_pending(&mut self) {
        if let Role::Leader(leader) = &mut self.role {
            for (_, write) in std::mem::take(&mut leader.writes) {
                let _ = write.tx.send(Err(Error::Abort));
            }
            leader.sync.abort();
        }
    }

    /// Commits and applies everything currently possible, iterating until
    /// no further progress is made (e.g. a committed joint configuration
    /// appends the final configuration, which may itself commit).
    fn commit_and_apply(&mut self) -> Result<()> {
        while self.maybe_commit_and_apply()? {}
        Ok(())
    }

    /// As leader, commits any new entries that have been replicated to a
    /// quorum, and applies them. Returns whether the commit index advanced,
    /// in which case another call may make further progress (e.g. when a
    /// committed joint configuration appends the final configuration).
    fn maybe_commit_and_apply(&mut self) -> Result<bool> {
        let Role::Leader(leader) = &self.role else { return Ok(false) };

        let (last_index, _) = self.log.get_last_index();
        let id = self.id;
        let progress = &leader.progress;
        let quorum_index = self.config.quorum_index(|node| {
            if node == id {
                last_index
            } else {
                progress.get(&node).map(|p| p.match_index).unwrap_or(0)
            }
        });
        let (commit_index, _) = self.log.get_commit_index();
        if quorum_index <= commit_index {
            return Ok(false);
        }

        // Only entries from our own term can be committed directly; earlier
        // terms are committed indirectly by covering them (Raft figure 8).
        match self.log.get(quorum_index)? {
            Some(entry) if entry.term == self.term => {
                self.log.commit(quorum_index)?;
            }
            Some(_) => return Ok(false),
            None => return Ok(false), // at or below the compacted prefix
        }

        self.apply_committed()?;
        Ok(true)
    }

    /// Applies any committed-but-unapplied entries to the state machine,
    /// responding to waiting clients and advancing configuration changes.
    /// Takes a snapshot and compacts the log when it exceeds the threshold.
    fn apply_committed(&mut self) -> Result<()> {
        let applied = self.state.get_applied_index();
        let entries: Vec<Entry> = self.log.scan_apply(applied).collect::<Result<_>>()?;

        let mut committed_configs = Vec::new();
        let mut step_aside = false;
        for entry in entries {
            debug!("node {}: applying {entry:?}", self.id);
            let index = entry.index;
            let result = self.state.apply(&entry);
            if let Err(err) = &result {
                if !err.is_deterministic() {
                    return Err(err.clone());
                }
            }
            if let Command::Config(config) = &entry.command {
                // A committed final configuration that excludes us means we
                // should no longer lead (Raft thesis §4.2.2).
                if !config.is_joint() && !config.contains(self.id) {
                    step_aside = true;
                }
                if let Role::Leader(leader) = &mut self.role {
                    if let Some(final_config) = leader.sync.committed(config) {
                        committed_configs.push(final_config);
                    }
                }
            }
            if let Role::Leader(leader) = &mut self.role {
                if let Some(write) = leader.writes.remove(&index) {
                    let _ = write.tx.send(result);
                }
            }
        }

        // A committed joint configuration advances to the final
        // configuration, which the next heartbeat replicates.
        for config in committed_configs {
            info!("node {}: appending final configuration {config:?}", self.id);
            self.log.append(Command::Config(config.clone()))?;
            self.adopt_config(config);
        }

        if step_aside {
            if let Role::Leader(_) = self.role {
                info!("node {}: removed from configuration, stepping aside", self.id);
                self.abort_pending();
                let (_, voted_for) = self.log.get_term();
                self.role = Role::Follower(Follower {
                    leader: None,
                    voted_for,
                    election_deadline: rand_election_deadline(&self.opts),
                });
            }
        }

        self.maybe_snapshot()
    }

    /// Takes a snapshot of the state machine and compacts the log prefix
    /// once enough entries have been applied since the last snapshot.
    fn maybe_snapshot(&mut self) -> Result<()> {
        if self.opts.snapshot_threshold == 0 {
            return Ok(());
        }
        let applied = self.state.get_applied_index();
        let (prefix_index, _) = self.log.get_prefix_index();
        if applied - prefix_index < self.opts.snapshot_threshold {
            return Ok(());
        }
        let term = self.log.get(applied)?.map(|e| e.term).expect("applied entry must exist");
        info!("node {}: taking snapshot at {applied}", self.id);
        let data = self.state.snapshot()?;
        self.log.compact(Snapshot { index: applied, term, config: self.config.clone(), data })
    }

    /// Adopts a new cluster configuration. As leader, tracks progress for
    /// new peers and drops removed ones. The leader keeps leading even if
    /// the configuration excludes it, until the configuration commits.
    fn adopt_config(&mut self, config: ClusterConfig) {
        if let Role::Leader(leader) = &mut self.role {
            let (last_index, _) = self.log.get_last_index();
            for peer in config.peers(self.id) {
                leader.progress.entry(peer).or_insert(Progress {
                    next: last_index + 1,
                    match_index: 0,
                    inflight: false,
                });
            }
            leader.progress.retain(|peer, _| config.contains(*peer));
        }
        self.config = config;
    }

    /// Errors if the node has halted.
    fn check_halted(&self) -> Result<()> {
        if self.halted {
            return Err(Error::Unavailable);
        }
        Ok(())
    }

    /// Halts the node after a fatal error. The node stops participating:
    /// acknowledging appends or granting votes without durability could
    /// violate consensus safety.
    fn halt(&mut self, err: &Error) {
        error!("node {} halted: {err}", self.id);
        self.halted = true;
        self.abort_pending();
    }
}

/// Generates a randomized election deadline.
fn rand_election_deadline(opts: &Options) -> Instant {
    let range = &opts.election_timeout;
    let ms = rand::thread_rng().gen_range(range.start.as_millis()..range.end.as_millis());
    Instant::now() + Duration::from_millis(ms as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::Value as _;
    use crate::net::local::LocalNetwork;
    use crate::raft::state::KVState;
    use crate::raft::KVCommand;

    fn test_options() -> Options {
        Options {
            heartbeat_interval: Duration::from_millis(10),
            election_timeout: Duration::from_millis(30)..Duration::from_millis(60),
            rpc_timeout: Duration::from_millis(100),
            ..Options::default()
        }
    }

    fn new_node(id: NodeID, peers: &[NodeID], network: &LocalNetwork) -> Result<Node> {
        let log = Log::new(Box::new(crate::storage::Memory::new()))?;
        let node = Node::new(
            id,
            peers.iter().copied(),
            log,
            Box::new(KVState::new()),
            Arc::new(network.client(id)),
            test_options(),
        )?;
        network.serve(id, Arc::new(node.clone()));
        Ok(node)
    }

    #[test]
    fn options_validation() {
        assert!(Options::default().validate().is_ok());
        let opts = Options { heartbeat_interval: Duration::from_millis(0), ..Options::default() };
        assert!(opts.validate().is_err());
        let opts = Options {
            heartbeat_interval: Duration::from_millis(100),
            election_timeout: Duration::from_millis(150)..Duration::from_millis(300),
            ..Options::default()
        };
        assert!(opts.validate().is_err(), "heartbeat must fit within election timeout");
    }

    #[tokio::test]
    async fn single_node_elects_itself_and_commits() -> Result<()> {
        let network = LocalNetwork::new();
        let node = new_node(1, &[], &network)?;

        // The node elects itself once the election timeout fires.
        for _ in 0..100 {
            if node.is_leader() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(node.is_leader());

        let command = KVCommand::Put { key: "x".into(), value: "1".into() };
        node.submit(command.encode(), Duration::from_secs(1)).await?;

        let status = node.status()?;
        assert_eq!(status.apply_index, status.commit_index);
        assert!(status.commit_index >= 2); // noop + write
        Ok(())
    }

    #[tokio::test]
    async fn submit_fails_on_non_leader() -> Result<()> {
        let network = LocalNetwork::new();
        // A node with an unreachable peer can never win an election, so it
        // remains a candidate and rejects submissions.
        let node = new_node(1, &[2], &network)?;
        let result = node.submit(vec![0x01], Duration::from_millis(100)).await;
        assert!(matches!(result, Err(Error::NotLeader)), "{result:?}");
        Ok(())
    }
}
