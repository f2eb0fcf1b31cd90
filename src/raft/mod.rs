//! Implements the Raft distributed consensus protocol.
//!
//! For details, see Diego Ongaro's original writings:
//!
//! * Raft paper: <https://raft.github.io/raft.pdf>
//! * Raft thesis: <https://web.stanford.edu/~ouster/cgi-bin/papers/OngaroPhD.pdf>
//!
//! Raft replicates an ordered log of arbitrary commands across a cluster of
//! nodes and applies it to a local state machine on each node once committed.
//! A command is committed when a strict majority of voting nodes (a quorum)
//! have durably appended it. A single elected leader serves client requests
//! and replicates writes; if it fails, a new leader is elected.
//!
//! LEADER ELECTION
//! ===============
//!
//! Nodes are in one of three roles: follower, candidate, or leader. Time is
//! divided into terms, monotonically increasing numbers, with at most one
//! leader per term. Followers that don't hear from a leader within a
//! randomized election timeout become candidates, increment the term, vote
//! for themselves, and solicit votes from all peers concurrently. The vote
//! responses are aggregated by `quorum::collect`, which resolves as soon as
//! the outcome is decided (see the module docs). A node grants at most one
//! vote per term (persisted via `Log::set_term`), and only to candidates
//! whose log is at least as up-to-date as its own -- this guarantees a new
//! leader has all committed entries (Raft paper §5.4.1).
//!
//! On winning, the leader appends an empty entry to commit entries from
//! prior terms (Raft paper §5.4.2) and begins sending periodic
//! AppendEntries heartbeats asserting its leadership. Discovering a higher
//! term anywhere -- an incoming RPC or a response -- reverts the node to
//! follower in that term.
//!
//! REPLICATION
//! ===========
//!
//! The leader tracks a next and match index per peer in `Progress`. Appends
//! carry the index and term of the entry preceding the replicated entries;
//! followers reject the append if their log doesn't contain that entry, and
//! return a match index hint the leader backs off to before retrying. Once a
//! quorum has acknowledged an entry from the leader's current term, the
//! leader commits it, applies it to the state machine, and responds to the
//! waiting client. Entries from prior terms are only committed indirectly,
//! via a later entry in the current term (Raft paper figure 8).
//!
//! When the log outgrows a configured threshold, the node takes a snapshot
//! of the state machine and compacts the log prefix. Peers that have fallen
//! behind the compacted prefix are caught up with an InstallSnapshot
//! instead.
//!
//! MEMBERSHIP CHANGES
//! ==================
//!
//! Cluster reconfiguration uses joint consensus (Raft paper §6): a
//! transitional configuration containing both the old and new member sets is
//! appended and committed first, requiring majorities in both sets, followed
//! by the final configuration. See `membership` for details.

mod log;
mod membership;
mod message;
mod node;
pub mod quorum;
mod state;

pub use log::{Command, Entry, Index, Log, Snapshot};
pub use membership::ClusterConfig;
pub use message::{
    AppendEntries, AppendEntriesResponse, InstallSnapshot, InstallSnapshotResponse, Request,
    RequestVote, RequestVoteResponse, Response,
};
pub use node::{Node, NodeID, Options, Status, Term};
pub use state::{KVCommand, KVState, State};
