//! Quorum arithmetic and the quorum future collector.
//!
//! The collector aggregates a set of per-peer RPC decision futures into a
//! single majority decision. It resolves success as soon as every voting set
//! has a majority of grants, and failure as soon as enough peers have failed
//! that a majority can no longer be reached (fail fast). Outstanding
//! minority futures are dropped once the decision resolves, cancelling them
//! best-effort rather than awaiting them.
//!
//! Per-RPC timeouts are the caller's responsibility (a timed-out RPC simply
//! resolves as a failed decision), as are retries -- the collector decides a
//! single round.

use std::collections::HashSet;
use std::future::Future;

use futures::stream::{FuturesUnordered, StreamExt as _};

use super::membership::ClusterConfig;
use super::node::NodeID;
use crate::error::{Error, Result};

/// Returns the size of a quorum (strict majority), given a total size.
pub fn quorum_size(size: usize) -> usize {
    size / 2 + 1
}

/// Returns the quorum (median) value of the given unsorted slice, in
/// descending order. The slice cannot be empty.
pub fn quorum_value<T: Ord + Copy>(mut values: Vec<T>) -> T {
    assert!(!values.is_empty(), "no values provided");
    let index = quorum_size(values.len()) - 1;
    *values.select_nth_unstable_by(index, |a, b: &T| a.cmp(b).reverse()).1
}

/// Collects per-peer decision futures into a quorum decision under the given
/// configuration. Each future resolves to whether the peer granted its vote
/// or acknowledged the request; RPC failures and timeouts must be mapped to
/// false by the caller. `granted` seeds the tally with nodes that have
/// already granted (typically the local node).
///
/// Resolves Ok(()) as soon as every voting set has a majority, and
/// Err(Unavailable) as soon as no voting set can reach one. Unresolved
/// futures are dropped at that point.
pub async fn collect<F>(
    votes: Vec<(NodeID, F)>,
    mut granted: HashSet<NodeID>,
    config: &ClusterConfig,
) -> Result<()>
where
    F: Future<Output = bool>,
{
    if config.has_quorum(&granted) {
        return Ok(());
    }
    let mut failed = HashSet::new();
    let mut pending: FuturesUnordered<_> = votes
        .into_iter()
        .map(|(id, future)| async move { (id, future.await) })
        .collect();
    while let Some((id, vote)) = pending.next().await {
        if vote {
            granted.insert(id);
            if config.has_quorum(&granted) {
                return Ok(());
            }
        } else {
            failed.insert(id);
            if !config.quorum_reachable(&granted, &failed) {
                return Err(Error::Unavailable);
            }
        }
    }
    // All futures resolved without reaching a quorum. This can happen if not
    // every voter was given a future (e.g. unreachable peers).
    Err(Error::Unavailable)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future;
    use futures::FutureExt as _;
    use pretty_assertions::assert_eq;

    #[test]
    fn quorum_size() {
        for (size, quorum) in [(1, 1), (2, 2), (3, 2), (4, 3), (5, 3), (6, 4), (7, 4), (8, 5)] {
            assert_eq!(super::quorum_size(size), quorum);
        }
    }

    #[test]
    fn quorum_value() {
        assert_eq!(super::quorum_value(vec![1]), 1);
        assert_eq!(super::quorum_value(vec![1, 3, 2]), 2);
        assert_eq!(super::quorum_value(vec![4, 1, 3, 2]), 2);
        assert_eq!(super::quorum_value(vec![1, 1, 1, 2, 2]), 1);
        assert_eq!(super::quorum_value(vec![1, 1, 2, 2, 2]), 2);
    }

    #[tokio::test]
    async fn collect_resolves_on_majority() -> Result<()> {
        let config = ClusterConfig::new([1, 2, 3, 4, 5]);
        // Two grants plus the local node's own vote form a quorum of 5, even
        // though the remaining peers never resolve.
        let votes = vec![
            (2, future::ready(true).boxed_local()),
            (3, future::ready(true).boxed_local()),
            (4, future::pending().boxed_local()),
            (5, future::pending().boxed_local()),
        ];
        collect(votes, [1].into(), &config).await
    }

    #[tokio::test]
    async fn collect_fails_fast() {
        let config = ClusterConfig::new([1, 2, 3, 4, 5]);
        // Three denials decide the election even with peers still pending.
        let votes = vec![
            (2, future::ready(false).boxed_local()),
            (3, future::ready(false).boxed_local()),
            (4, future::ready(false).boxed_local()),
            (5, future::pending().boxed_local()),
        ];
        assert_eq!(collect(votes, [1].into(), &config).await, Err(Error::Unavailable));
    }

    #[tokio::test]
    async fn collect_joint_needs_both_sets() -> Result<()> {
        let joint = ClusterConfig::new([1, 2, 3]).to_joint([4, 5, 6].into())?;
        // A majority of the new set alone doesn't decide a joint quorum.
        let votes = vec![
            (4, future::ready(true).boxed_local()),
            (5, future::ready(true).boxed_local()),
            (6, future::ready(true).boxed_local()),
            (2, future::ready(false).boxed_local()),
            (3, future::ready(false).boxed_local()),
        ];
        assert_eq!(collect(votes, [1].into(), &joint).await, Err(Error::Unavailable));

        // Majorities in both sets do.
        let votes = vec![
            (2, future::ready(true).boxed_local()),
            (4, future::ready(true).boxed_local()),
            (5, future::ready(true).boxed_local()),
        ];
        collect(votes, [1].into(), &joint).await
    }

    #[tokio::test]
    async fn collect_single_node_cluster() -> Result<()> {
        // A single-node cluster has quorum with only its own vote.
        let config = ClusterConfig::new([1]);
        collect(Vec::<(NodeID, future::Ready<bool>)>::new(), [1].into(), &config).await
    }
}
