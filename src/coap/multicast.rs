//! Multicast peer discovery. Nodes listening on the discovery group answer
//! probes with an announcement naming their node ID and unicast RPC port;
//! discovered peers feed the session pool's known-peer set.

use std::net::Ipv4Addr;

use serde_derive::{Deserialize, Serialize};

use crate::encoding;
use crate::raft::NodeID;

/// The default discovery group, from the CoAP "All CoAP Nodes" range.
pub const DEFAULT_MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(224, 0, 1, 187);

/// The resource path for discovery probes.
pub const DISCOVERY_PATH: &str = "discovery";

/// A discovery announcement, sent in response to a probe.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Announce {
    /// The announcing node.
    pub node_id: NodeID,
    /// The node's unicast RPC port. The address is taken from the packet
    /// source.
    pub port: u16,
}

impl encoding::Value for Announce {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::Value as _;
    use pretty_assertions::assert_eq;

    #[test]
    fn announce_roundtrip() {
        let announce = Announce { node_id: 3, port: 5683 };
        let decoded = Announce::decode(&announce.encode()).expect("decode failed");
        assert_eq!(decoded, announce);
    }

    #[test]
    fn default_group_is_multicast() {
        assert!(DEFAULT_MULTICAST_GROUP.is_multicast());
    }
}
