use serde_derive::{Deserialize, Serialize};

use super::log::{Entry, Index, Snapshot};
use super::node::{NodeID, Term};
use crate::encoding;

/// An RPC request passed between Raft nodes. Requests and responses are
/// encoded with Bincode and carried as opaque payloads by the transport.
/// Requests are hashable by value, so the transport can content-address its
/// serialization cache.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Request {
    /// A candidate solicits a vote (Raft paper §5.2).
    Vote(RequestVote),
    /// A leader replicates log entries, or asserts leadership with an empty
    /// entry set (heartbeat).
    Append(AppendEntries),
    /// A leader catches up a lagging peer with a state machine snapshot.
    Snapshot(InstallSnapshot),
}

/// An RPC response. The variant always matches the request's.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Response {
    Vote(RequestVoteResponse),
    Append(AppendEntriesResponse),
    Snapshot(InstallSnapshotResponse),
}

impl encoding::Value for Request {}
impl encoding::Value for Response {}

/// Solicits a vote for a candidate in an election.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestVote {
    /// The candidate's term.
    pub term: Term,
    /// The candidate soliciting the vote.
    pub candidate: NodeID,
    /// The index of the candidate's last log entry.
    pub last_index: Index,
    /// The term of the candidate's last log entry.
    pub last_term: Term,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RequestVoteResponse {
    /// The voter's current term. If above the candidate's, the candidate
    /// must step down.
    pub term: Term,
    /// Whether the vote was granted. A node grants at most one vote per
    /// term, on a first-come first-serve basis.
    pub vote_granted: bool,
}

/// Replicates log entries to a follower. An empty entry set serves as a
/// leadership-asserting heartbeat.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AppendEntries {
    /// The leader's term.
    pub term: Term,
    /// The leader sending the entries.
    pub leader: NodeID,
    /// The index of the log entry immediately preceding entries. An
    /// index/term pair uniquely identifies a log prefix (Raft paper §5.3),
    /// so the follower can verify that the entries connect to its log.
    pub prev_index: Index,
    /// The term of the entry at prev_index.
    pub prev_term: Term,
    /// Log entries to replicate.
    pub entries: Vec<Entry>,
    /// The leader's commit index, allowing followers to advance theirs.
    pub leader_commit: Index,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    /// The follower's current term.
    pub term: Term,
    /// Whether the entries were appended, i.e. the log consistency check
    /// against prev_index/prev_term passed.
    pub success: bool,
    /// On success, the index of the follower's last log entry. On failure, a
    /// hint for where the leader should resume replication: the follower's
    /// last index, capped below prev_index. This avoids the one-by-one probing
    /// of divergent logs described in the Raft paper.
    pub match_index: Index,
}

/// Installs a state machine snapshot on a follower whose log lags behind the
/// leader's compacted log prefix.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstallSnapshot {
    /// The leader's term.
    pub term: Term,
    /// The leader sending the snapshot.
    pub leader: NodeID,
    /// The snapshot, covering the log up to and including its index.
    pub snapshot: Snapshot,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InstallSnapshotResponse {
    /// The follower's current term.
    pub term: Term,
    /// Whether the snapshot was installed. False if the follower's state was
    /// already at or beyond the snapshot, in which case it was ignored.
    pub success: bool,
}

impl Request {
    /// Returns the sender's term.
    pub fn term(&self) -> Term {
        match self {
            Request::Vote(req) => req.term,
            Request::Append(req) => req.term,
            Request::Snapshot(req) => req.term,
        }
    }
}

impl Response {
    /// Returns the responder's term.
    pub fn term(&self) -> Term {
        match self {
            Response::Vote(resp) => resp.term,
            Response::Append(resp) => resp.term,
            Response::Snapshot(resp) => resp.term,
        }
    }
}
