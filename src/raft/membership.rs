use std::collections::{BTreeSet, HashSet};

use serde_derive::{Deserialize, Serialize};
use tokio::sync::oneshot;

use super::log::Index;
use super::node::NodeID;
use super::quorum::{quorum_size, quorum_value};
use crate::errinput;
use crate::error::{Error, Result};

/// A cluster configuration: the set of voting members. During a
/// reconfiguration, a transient joint configuration holds both the old and
/// new member sets, and quorum decisions require majorities in both. This
/// guarantees that at no point can a single quorum decision be made under
/// both the old and new membership independently, which would allow two
/// leaders (Raft paper §6).
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// The voting members. During joint consensus, the new member set.
    members: BTreeSet<NodeID>,
    /// The old member set, present only during joint consensus.
    old: Option<BTreeSet<NodeID>>,
}

impl ClusterConfig {
    /// Creates a configuration with the given members.
    pub fn new(members: impl IntoIterator<Item = NodeID>) -> Self {
        Self { members: members.into_iter().collect(), old: None }
    }

    /// Returns whether this is a transitional joint configuration.
    pub fn is_joint(&self) -> bool {
        self.old.is_some()
    }

    /// Returns the (new) member set.
    pub fn members(&self) -> &BTreeSet<NodeID> {
        &self.members
    }

    /// Returns all voting nodes: the union of the old and new member sets.
    pub fn voters(&self) -> BTreeSet<NodeID> {
        let mut voters = self.members.clone();
        if let Some(old) = &self.old {
            voters.extend(old.iter().copied());
        }
        voters
    }

    /// Returns whether the given node is a voter in any member set.
    pub fn contains(&self, id: NodeID) -> bool {
        self.members.contains(&id) || self.old.as_ref().is_some_and(|old| old.contains(&id))
    }

    /// Returns all voters except the given node, in sorted order.
    pub fn peers(&self, id: NodeID) -> Vec<NodeID> {
        self.voters().into_iter().filter(|peer| *peer != id).collect()
    }

    /// Creates the joint configuration transitioning from this configuration
    /// to the given member set. Errors if a transition is already underway or
    /// if the new member set is empty.
    pub fn to_joint(&self, new: BTreeSet<NodeID>) -> Result<Self> {
        if self.is_joint() {
            return errinput!("configuration change already in progress");
        }
        if new.is_empty() {
            return errinput!("new configuration can't be empty");
        }
        Ok(Self { members: new, old: Some(self.members.clone()) })
    }

    /// Returns the final configuration of a joint configuration: the new
    /// member set alone.
    pub fn finalize(&self) -> Self {
        assert!(self.is_joint(), "can only finalize a joint configuration");
        Self { members: self.members.clone(), old: None }
    }

    /// Returns whether the given set of acknowledging nodes forms a quorum:
    /// a majority of the members, and during joint consensus also a majority
    /// of the old members.
    pub fn has_quorum(&self, acks: &HashSet<NodeID>) -> bool {
        Self::set_quorum(&self.members, acks)
            && self.old.as_ref().map(|old| Self::set_quorum(old, acks)).unwrap_or(true)
    }

    /// Returns whether a quorum is still reachable given the nodes that have
    /// acknowledged and those that have definitively failed. Used for
    /// fail-fast quorum decisions.
    pub fn quorum_reachable(&self, acks: &HashSet<NodeID>, failed: &HashSet<NodeID>) -> bool {
        let reachable = |set: &BTreeSet<NodeID>| {
            let undecided = set.iter().filter(|id| !acks.contains(id) && !failed.contains(id));
            let acked = set.iter().filter(|id| acks.contains(id)).count();
            acked + undecided.count() >= quorum_size(set.len())
        };
        reachable(&self.members) && self.old.as_ref().map(&reachable).unwrap_or(true)
    }

    /// Returns the highest index replicated to a quorum, given each voter's
    /// match index (the local node should be included with its last index).
    /// During joint consensus this is the minimum of each member set's quorum
    /// index, since an entry must be on a majority of both sets.
    pub fn quorum_index(&self, matched: impl Fn(NodeID) -> Index) -> Index {
        let set_index = |set: &BTreeSet<NodeID>| {
            quorum_value(set.iter().map(|id| matched(*id)).collect())
        };
        let index = set_index(&self.members);
        match &self.old {
            Some(old) => index.min(set_index(old)),
            None => index,
        }
    }

    fn set_quorum(set: &BTreeSet<NodeID>, acks: &HashSet<NodeID>) -> bool {
        set.iter().filter(|id| acks.contains(id)).count() >= quorum_size(set.len())
    }
}

/// The phase of an in-flight configuration change.
#[derive(Debug, PartialEq)]
enum Phase {
    /// Waiting for the joint configuration entry to commit.
    Joint,
    /// Waiting for the final configuration entry to commit.
    Final,
}

/// An in-flight configuration change.
struct Change {
    /// The target member set.
    target: BTreeSet<NodeID>,
    /// The current phase.
    phase: Phase,
    /// Resolves the caller's future when the final configuration commits.
    tx: oneshot::Sender<Result<()>>,
}

/// Synchronizes cluster configuration changes through their two phases:
/// first the joint configuration (old ∪ new) is appended and committed, then
/// the final configuration. At most one change can be in flight at a time;
/// concurrent requests are rejected. Leadership loss aborts the change (the
/// next leader completes any committed joint transition).
pub struct Synchronizer {
    change: Option<Change>,
}

impl Synchronizer {
    pub fn new() -> Self {
        Self { change: None }
    }

    /// Begins a configuration change towards the given member set. Errors if
    /// a change is already in flight. The sender resolves when the final
    /// configuration commits.
    pub fn begin(
        &mut self,
        target: BTreeSet<NodeID>,
        tx: oneshot::Sender<Result<()>>,
    ) -> Result<()> {
        if self.change.is_some() {
            return errinput!("configuration change already in progress");
        }
        self.change = Some(Change { target, phase: Phase::Joint, tx });
        Ok(())
    }

    /// Returns whether a change is in flight.
    pub fn in_progress(&self) -> bool {
        self.change.is_some()
    }

    /// Notifies the synchronizer that a configuration entry has committed.
    /// Returns the final configuration to append when the joint phase
    /// completes; resolves the caller when the final phase completes.
    #[must_use]
    pub fn committed(&mut self, config: &ClusterConfig) -> Option<ClusterConfig> {
        let Some(change) = &mut self.change else {
            return None;
        };
        match change.phase {
            Phase::Joint if config.is_joint() && *config.members() == change.target => {
                change.phase = Phase::Final;
                Some(config.finalize())
            }
            Phase::Final if !config.is_joint() && *config.members() == change.target => {
                let change = self.change.take().expect("change must exist");
                let _ = change.tx.send(Ok(()));
                None
            }
            _ => None,
        }
    }

    /// Aborts any in-flight change, typically on leadership loss. The caller
    /// receives an Abort error and must retry against the new leader.
    pub fn abort(&mut self) {
        if let Some(change) = self.change.take() {
            let _ = change.tx.send(Err(Error::Abort));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn joint_quorum_requires_both_majorities() -> Result<()> {
        // Transitioning 1,2,3 → 1,2,3,4,5,6: joint quorum needs 2 of the old
        // three and 4 of the new six.
        let old = ClusterConfig::new([1, 2, 3]);
        let joint = old.to_joint([1, 2, 3, 4, 5, 6].into())?;
        assert!(joint.is_joint());

        // A majority of the new set alone is not a quorum.
        let acks: HashSet<NodeID> = [4, 5, 6, 1].into();
        assert!(!joint.has_quorum(&acks));
        // A majority of the old set alone is not a quorum either.
        let acks: HashSet<NodeID> = [1, 2].into();
        assert!(!joint.has_quorum(&acks));
        // Majorities in both sets are.
        let acks: HashSet<NodeID> = [1, 2, 4, 5].into();
        assert!(joint.has_quorum(&acks));

        // The final configuration only needs the new majority.
        let fin = joint.finalize();
        assert!(!fin.is_joint());
        let acks: HashSet<NodeID> = [1, 2, 4, 5].into();
        assert!(fin.has_quorum(&acks));
        Ok(())
    }

    #[test]
    fn joint_quorum_index_is_minimum_of_sets() -> Result<()> {
        let joint = ClusterConfig::new([1, 2, 3]).to_joint([1, 4, 5].into())?;
        // Old set 1,2,3 matched at 5,5,0 → quorum 5. New set 1,4,5 matched at
        // 5,1,0 → quorum 1. The joint quorum index is the minimum.
        let matched = |id: NodeID| match id {
            1 => 5,
            2 => 5,
            4 => 1,
            _ => 0,
        };
        assert_eq!(joint.quorum_index(matched), 1);
        Ok(())
    }

    #[test]
    fn quorum_reachability() -> Result<()> {
        let config = ClusterConfig::new([1, 2, 3, 4, 5]);
        let acks: HashSet<NodeID> = [1].into();
        let failed: HashSet<NodeID> = [2, 3].into();
        assert!(config.quorum_reachable(&acks, &failed));
        let failed: HashSet<NodeID> = [2, 3, 4].into();
        assert!(!config.quorum_reachable(&acks, &failed));
        Ok(())
    }

    #[test]
    fn rejects_concurrent_changes() -> Result<()> {
        let mut sync = Synchronizer::new();
        let (tx, _rx) = oneshot::channel();
        sync.begin([1, 2, 3, 4].into(), tx)?;
        let (tx, _rx) = oneshot::channel();
        assert_eq!(
            sync.begin([1, 2].into(), tx),
            Err(Error::InvalidInput("configuration change already in progress".into()))
        );
        Ok(())
    }

    #[tokio::test]
    async fn change_resolves_after_both_phases() -> Result<()> {
        let mut sync = Synchronizer::new();
        let (tx, mut rx) = oneshot::channel();
        let target: BTreeSet<NodeID> = [1, 2, 3, 4].into();
        sync.begin(target.clone(), tx)?;

        let joint = ClusterConfig::new([1, 2, 3]).to_joint(target)?;
        // Committing an unrelated configuration does nothing.
        assert_eq!(sync.committed(&ClusterConfig::new([9])), None);
        // Committing the joint configuration yields the final one to append.
        let fin = sync.committed(&joint).expect("must yield final config");
        assert!(!fin.is_joint());
        assert!(rx.try_recv().is_err()); // not resolved yet
        // Committing the final configuration resolves the change.
        assert_eq!(sync.committed(&fin), None);
        assert_eq!(rx.try_recv().expect("change must resolve"), Ok(()));
        assert!(!sync.in_progress());
        Ok(())
    }

    #[tokio::test]
    async fn abort_fails_the_change() -> Result<()> {
        let mut sync = Synchronizer::new();
        let (tx, mut rx) = oneshot::channel();
        sync.begin([1, 2].into(), tx)?;
        sync.abort();
        assert_eq!(rx.try_recv().expect("abort must resolve"), Err(Error::Abort));
        Ok(())
    }
}
