//! Multi-node cluster tests over the in-process transport, covering leader
//! election, replication, commits, partitions, and membership changes.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use kythira::encoding::Value as _;
use kythira::error::{Error, Result};
use kythira::net::local::LocalNetwork;
use kythira::raft::{Entry, Index, KVCommand, KVState, Log, Node, NodeID, Options, State};
use kythira::storage::Memory;

/// A key/value state machine with an externally inspectable handle, so
/// tests can verify what each node actually applied.
struct SharedState(Arc<Mutex<KVState>>);

impl State for SharedState {
    fn get_applied_index(&self) -> Index {
        self.0.lock().expect("lock poisoned").get_applied_index()
    }

    fn apply(&mut self, entry: &Entry) -> Result<Vec<u8>> {
        self.0.lock().expect("lock poisoned").apply(entry)
    }

    fn snapshot(&self) -> Result<Vec<u8>> {
        self.0.lock().expect("lock poisoned").snapshot()
    }

    fn restore(&mut self, index: Index, data: &[u8]) -> Result<()> {
        self.0.lock().expect("lock poisoned").restore(index, data)
    }
}

/// A test cluster of Raft nodes connected via a LocalNetwork.
struct Cluster {
    network: LocalNetwork,
    nodes: BTreeMap<NodeID, Node>,
    states: BTreeMap<NodeID, Arc<Mutex<KVState>>>,
}

impl Cluster {
    /// Election and heartbeat timing tuned for fast tests.
    fn options() -> Options {
        Options {
            heartbeat_interval: Duration::from_millis(10),
            election_timeout: Duration::from_millis(30)..Duration::from_millis(60),
            rpc_timeout: Duration::from_millis(100),
            ..Options::default()
        }
    }

    /// Creates a cluster with nodes 1..=size.
    fn new(size: u64) -> Result<Self> {
        let network = LocalNetwork::new();
        let mut cluster =
            Self { network, nodes: BTreeMap::new(), states: BTreeMap::new() };
        let ids: Vec<NodeID> = (1..=size).collect();
        for id in &ids {
            cluster.add_node(*id, ids.clone())?;
        }
        Ok(cluster)
    }

    /// Creates and registers a node with the given seed peer set.
    fn add_node(&mut self, id: NodeID, peers: Vec<NodeID>) -> Result<()> {
        self.add_node_with_options(id, peers, Self::options())
    }

    fn add_node_with_options(
        &mut self,
        id: NodeID,
        peers: Vec<NodeID>,
        options: Options,
    ) -> Result<()> {
        let log = Log::new(Box::new(Memory::new()))?;
        let state = Arc::new(Mutex::new(KVState::new()));
        let node = Node::new(
            id,
            peers,
            log,
            Box::new(SharedState(state.clone())),
            Arc::new(self.network.client(id)),
            options,
        )?;
        self.network.serve(id, Arc::new(node.clone()));
        self.nodes.insert(id, node);
        self.states.insert(id, state);
        Ok(())
    }

    /// Waits until one of the given nodes is leader and returns it.
    async fn wait_leader(&self, among: &[NodeID]) -> Node {
        for _ in 0..500 {
            for id in among {
                let node = &self.nodes[id];
                if node.is_leader() {
                    return node.clone();
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("no leader elected among {among:?}");
    }

    /// Waits until all given nodes have applied up to at least the given
    /// index.
    async fn wait_applied(&self, among: &[NodeID], index: Index) {
        for _ in 0..500 {
            let caught_up = among.iter().all(|id| {
                self.nodes[id].status().map(|s| s.apply_index >= index).unwrap_or(false)
            });
            if caught_up {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("nodes {among:?} did not apply index {index}");
    }

    /// Returns the value of a key on a node's local state machine.
    fn get(&self, id: NodeID, key: &str) -> Option<String> {
        self.states[&id].lock().expect("lock poisoned").get(key).cloned()
    }

    fn ids(&self) -> Vec<NodeID> {
        self.nodes.keys().copied().collect()
    }
}

fn put(key: &str, value: &str) -> Vec<u8> {
    KVCommand::Put { key: key.into(), value: value.into() }.encode()
}

/// A 5-node cluster elects a leader, and a submitted command commits once a
/// quorum acknowledges it, resolving the client's future and applying the
/// write on every node.
#[tokio::test(flavor = "multi_thread")]
async fn five_node_commit() -> Result<()> {
    let cluster = Cluster::new(5)?;
    let leader = cluster.wait_leader(&cluster.ids()).await;

    leader.submit(put("x", "1"), Duration::from_secs(5)).await?;

    let status = leader.status()?;
    assert!(status.commit_index >= 2, "noop and write must be committed");

    cluster.wait_applied(&cluster.ids(), status.commit_index).await;
    for id in cluster.ids() {
        assert_eq!(cluster.get(id, "x").as_deref(), Some("1"), "node {id} missing write");
    }
    Ok(())
}

/// Commit indexes never regress, across leadership changes.
#[tokio::test(flavor = "multi_thread")]
async fn commit_index_is_monotonic() -> Result<()> {
    let cluster = Cluster::new(3)?;
    let leader = cluster.wait_leader(&cluster.ids()).await;
    let mut high = BTreeMap::new();
    for i in 0..5 {
        leader.submit(put("k", &i.to_string()), Duration::from_secs(5)).await?;
        for id in cluster.ids() {
            let commit = cluster.nodes[&id].status()?.commit_index;
            let previous = high.insert(id, commit).unwrap_or(0);
            assert!(commit >= previous, "commit index regressed on node {id}");
        }
    }
    Ok(())
}

/// A leader partitioned from the majority can't commit; the remaining
/// majority elects a new leader at a higher term, and the old leader's
/// conflicting uncommitted entries are overwritten when it rejoins.
#[tokio::test(flavor = "multi_thread")]
async fn partitioned_leader_is_replaced() -> Result<()> {
    let cluster = Cluster::new(5)?;
    let old_leader = cluster.wait_leader(&cluster.ids()).await;
    let old_term = old_leader.term();

    // Commit a baseline write.
    old_leader.submit(put("a", "1"), Duration::from_secs(5)).await?;

    // Partition the leader (with one follower) away from the other three.
    let follower = cluster
        .ids()
        .into_iter()
        .find(|id| *id != old_leader.id())
        .expect("cluster must have a follower");
    let minority = [old_leader.id(), follower];
    cluster.network.partition(&minority);

    // A write on the old leader can't reach a quorum and times out, leaving
    // an uncommitted entry in its log.
    let orphan = old_leader.submit(put("a", "orphan"), Duration::from_millis(500)).await;
    assert_eq!(orphan, Err(Error::Timeout));

    // The majority elects a new leader with a higher term, which commits.
    let majority: Vec<NodeID> =
        cluster.ids().into_iter().filter(|id| !minority.contains(id)).collect();
    let new_leader = cluster.wait_leader(&majority).await;
    assert!(new_leader.term() > old_term, "new leader must have a higher term");
    new_leader.submit(put("a", "2"), Duration::from_secs(5)).await?;

    // After healing, the old leader steps down and converges: its orphaned
    // entry is overwritten by the new leader's log.
    cluster.network.heal();
    let commit = new_leader.status()?.commit_index;
    cluster.wait_applied(&cluster.ids(), commit).await;
    for _ in 0..500 {
        if !old_leader.is_leader() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(!old_leader.is_leader(), "deposed leader must step down");
    for id in cluster.ids() {
        assert_eq!(cluster.get(id, "a").as_deref(), Some("2"), "node {id} diverged");
    }
    Ok(())
}

/// Committed entries survive into future leaders: after enough randomized
/// leader changes, every committed write remains on whatever leader emerges.
#[tokio::test(flavor = "multi_thread")]
async fn committed_entries_survive_leader_changes() -> Result<()> {
    let cluster = Cluster::new(5)?;
    let mut committed = Vec::new();

    for round in 0..3 {
        let leader = cluster.wait_leader(&cluster.ids()).await;
        let key = format!("round{round}");
        leader.submit(put(&key, "committed"), Duration::from_secs(5)).await?;
        committed.push(key);

        // Depose the leader by partitioning it away and back.
        cluster.network.partition(&[leader.id()]);
        let others: Vec<NodeID> =
            cluster.ids().into_iter().filter(|id| *id != leader.id()).collect();
        let new_leader = cluster.wait_leader(&others).await;
        cluster.network.heal();

        // Wait for the deposed leader to learn of the new term, so the next
        // round can't pick it up as a stale leader.
        for _ in 0..500 {
            if !leader.is_leader() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!leader.is_leader(), "deposed leader must step down");

        // Every previously committed write must be present on the new
        // leader (leader completeness), observable once it applies.
        let commit = new_leader.status()?.commit_index;
        cluster.wait_applied(&[new_leader.id()], commit).await;
        for key in &committed {
            assert_eq!(
                cluster.get(new_leader.id(), key).as_deref(),
                Some("committed"),
                "leader {} lost committed key {key}",
                new_leader.id()
            );
        }

        // Election safety: no two nodes may lead in the same term.
        let mut leaders_by_term = std::collections::HashMap::new();
        for id in cluster.ids() {
            let status = cluster.nodes[&id].status()?;
            if status.role == "leader" {
                if let Some(other) = leaders_by_term.insert(status.term, id) {
                    panic!("two leaders {other} and {id} in term {}", status.term);
                }
            }
        }
    }
    Ok(())
}

/// Adding a sixth node commits a joint configuration followed by the final
/// configuration, after which the new node participates in replication.
#[tokio::test(flavor = "multi_thread")]
async fn membership_change_adds_node() -> Result<()> {
    let mut cluster = Cluster::new(5)?;
    let leader = cluster.wait_leader(&cluster.ids()).await;
    leader.submit(put("before", "1"), Duration::from_secs(5)).await?;

    // Start the new node, seeded with the full member set so it can locate
    // its peers. A long election timeout keeps it passive until the leader
    // contacts it, so it can't disrupt the reconfiguration.
    let passive = Options {
        election_timeout: Duration::from_secs(5)..Duration::from_secs(10),
        ..Cluster::options()
    };
    cluster.add_node_with_options(6, (1..=6).collect(), passive)?;

    // The reconfiguration commits the joint and then the final
    // configuration.
    leader.add_server(6, Duration::from_secs(10)).await?;

    // Re-adding an existing member is rejected.
    let result = leader.add_server(6, Duration::from_secs(1)).await;
    assert!(result.is_err(), "re-adding an existing member must fail");

    // The new node replicates both old and new writes.
    leader.submit(put("after", "2"), Duration::from_secs(5)).await?;
    let commit = leader.status()?.commit_index;
    cluster.wait_applied(&[6], commit).await;
    assert_eq!(cluster.get(6, "before").as_deref(), Some("1"));
    assert_eq!(cluster.get(6, "after").as_deref(), Some("2"));
    Ok(())
}

/// A follower rejects client submissions with a typed error.
#[tokio::test(flavor = "multi_thread")]
async fn follower_rejects_submit() -> Result<()> {
    let cluster = Cluster::new(3)?;
    let leader = cluster.wait_leader(&cluster.ids()).await;
    let follower =
        cluster.ids().into_iter().find(|id| *id != leader.id()).expect("must have follower");
    let result = cluster.nodes[&follower].submit(put("x", "1"), Duration::from_secs(1)).await;
    assert_eq!(result, Err(Error::NotLeader));
    Ok(())
}

/// With the whole cluster partitioned into minorities, no leader can commit
/// and submissions surface as unavailability (here: timeout), not a crash.
#[tokio::test(flavor = "multi_thread")]
async fn no_quorum_means_no_commit() -> Result<()> {
    let cluster = Cluster::new(5)?;
    let leader = cluster.wait_leader(&cluster.ids()).await;
    leader.submit(put("x", "1"), Duration::from_secs(5)).await?;

    // Isolate every node from every other.
    for id in cluster.ids() {
        cluster.network.partition(&[id]);
    }
    let result = leader.submit(put("x", "2"), Duration::from_millis(500)).await;
    assert!(
        matches!(result, Err(Error::Timeout) | Err(Error::Abort) | Err(Error::NotLeader)),
        "{result:?}"
    );
    Ok(())
}
