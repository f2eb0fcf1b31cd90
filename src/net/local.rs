//! An in-process transport for multi-node cluster tests. Requests are routed
//! over channels between nodes registered in a shared network, with support
//! for partitioning groups of nodes from each other to simulate network
//! splits.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use super::{Client, Handler};
use crate::error::{Error, Result};
use crate::raft::{NodeID, Request, Response};

type Envelope = (Request, oneshot::Sender<Result<Response>>);

/// A shared in-process network. Cheap to clone; clones refer to the same
/// network.
#[derive(Clone)]
pub struct LocalNetwork {
    inner: Arc<Inner>,
}

struct Inner {
    /// Inbound request channels, keyed by node.
    nodes: Mutex<HashMap<NodeID, mpsc::UnboundedSender<Envelope>>>,
    /// Blocked directed links.
    blocked: Mutex<HashSet<(NodeID, NodeID)>>,
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                nodes: Mutex::new(HashMap::new()),
                blocked: Mutex::new(HashSet::new()),
            }),
        }
    }

    /// Registers a node's handler with the network and starts dispatching
    /// inbound requests to it.
    pub fn serve(&self, id: NodeID, handler: Arc<dyn Handler>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<Envelope>();
        self.inner.nodes.lock().expect("lock poisoned").insert(id, tx);
        tokio::spawn(async move {
            while let Some((request, response_tx)) = rx.recv().await {
                let handler = handler.clone();
                // Dispatch concurrently, so a slow handler doesn't stall the
                // node's inbound queue.
                tokio::spawn(async move {
                    let response = handler.handle(request).await;
                    let _ = response_tx.send(response);
                });
            }
        });
    }

    /// Returns a client sending requests on behalf of the given node.
    pub fn client(&self, id: NodeID) -> LocalClient {
        LocalClient { id, inner: self.inner.clone() }
    }

    /// Partitions the given group of nodes away from all other registered
    /// nodes, in both directions. Nodes within the group can still reach
    /// each other.
    pub fn partition(&self, group: &[NodeID]) {
        let nodes: Vec<NodeID> =
            self.inner.nodes.lock().expect("lock poisoned").keys().copied().collect();
        let mut blocked = self.inner.blocked.lock().expect("lock poisoned");
        for &inside in group {
            for &outside in nodes.iter().filter(|id| !group.contains(id)) {
                blocked.insert((inside, outside));
                blocked.insert((outside, inside));
            }
        }
    }

    /// Heals all partitions.
    pub fn heal(&self) {
        self.inner.blocked.lock().expect("lock poisoned").clear();
    }
}

/// A client handle for one node in a LocalNetwork.
#[derive(Clone)]
pub struct LocalClient {
    id: NodeID,
    inner: Arc<Inner>,
}

#[async_trait]
impl Client for LocalClient {
    async fn call(&self, to: NodeID, request: Request) -> Result<Response> {
        if self.inner.blocked.lock().expect("lock poisoned").contains(&(self.id, to)) {
            return Err(Error::Unavailable);
        }
        let tx = self
            .inner
            .nodes
            .lock()
            .expect("lock poisoned")
            .get(&to)
            .cloned()
            .ok_or(Error::Unavailable)?;
        let (response_tx, response_rx) = oneshot::channel();
        tx.send((request, response_tx)).map_err(|_| Error::Unavailable)?;
        let response = response_rx.await.map_err(|_| Error::Unavailable)?;
        // The response also needs a working return path.
        if self.inner.blocked.lock().expect("lock poisoned").contains(&(to, self.id)) {
            return Err(Error::Unavailable);
        }
        response
    }
}
