//! A CoAP-style transport for Raft RPCs over constrained links.
//!
//! Each RPC maps to a confirmable request/response exchange over UDP:
//! requests are confirmable POSTs to a per-RPC resource path, responses are
//! piggybacked on the acknowledgement. Payloads exceeding the negotiated
//! block size are fragmented with block-wise transfer (RFC 7959) and
//! reassembled by the receiver, tolerating loss, reordering, and
//! duplication. Lost messages are retransmitted with exponential backoff.
//!
//! The transport tracks its resources explicitly: a bounded session pool
//! per peer, bounded reassembly memory, and a bounded in-flight request
//! count. Exceeding any of these produces an explicit overloaded signal
//! (5.03 Service Unavailable on the wire, [`crate::error::Error::Overloaded`]
//! locally) rather than silent drops or unbounded growth. Inbound datagrams
//! that fail structural validation are rejected and logged, never panic the
//! event loop.
//!
//! Peers can be discovered passively via a multicast announce/listen
//! exchange, feeding the session pool's known-peer set.

mod block;
mod cache;
mod client;
mod message;
mod multicast;
mod server;
mod session;

pub use block::{should_use_block_transfer, split_into_blocks, BlockOption, Reassembler};
pub use cache::SerializationCache;
pub use client::CoapClient;
pub use message::{Code, Message, Type};
pub use multicast::{Announce, DEFAULT_MULTICAST_GROUP};
pub use server::CoapServer;
pub use session::{Session, SessionPool};

use std::time::Duration;

use serde_derive::{Deserialize, Serialize};

use crate::errinput;
use crate::error::Result;

/// CoAP transport configuration, shared by client and server.
#[derive(Clone, Debug)]
pub struct CoapConfig {
    /// The block size for block-wise transfers, in bytes. Must be a power of
    /// two between 16 and 1024. Payloads above this size are fragmented.
    pub block_size: usize,
    /// The maximum number of concurrent peer sessions.
    pub max_sessions: usize,
    /// The idle timeout after which sessions are evicted.
    pub session_timeout: Duration,
    /// The initial acknowledgement timeout for confirmable messages.
    pub ack_timeout: Duration,
    /// The exponential backoff factor applied to the ack timeout per
    /// retransmission.
    pub backoff_factor: f64,
    /// The maximum number of retransmissions before a message fails.
    pub max_retransmit: usize,
    /// The maximum number of concurrently processed inbound requests.
    /// Requests beyond this receive 5.03 Service Unavailable.
    pub max_inflight: usize,
    /// The timeout after which incomplete block reassembly state is
    /// discarded and the transfer fails.
    pub reassembly_timeout: Duration,
    /// The maximum memory held in reassembly buffers. New transfers beyond
    /// this are rejected as overloaded.
    pub max_reassembly_bytes: usize,
    /// The maximum number of serialization cache entries.
    pub cache_entries: usize,
    /// The time-to-live for serialization cache entries.
    pub cache_ttl: Duration,
    /// Whether to join the multicast discovery group.
    pub enable_multicast: bool,
    /// The multicast discovery group.
    pub multicast_group: std::net::Ipv4Addr,
    /// The multicast discovery port.
    pub multicast_port: u16,
}

impl Default for CoapConfig {
    fn default() -> Self {
        Self {
            block_size: 1024,
            max_sessions: 100,
            session_timeout: Duration::from_secs(30),
            ack_timeout: Duration::from_secs(2),
            backoff_factor: 2.0,
            max_retransmit: 4,
            max_inflight: 100,
            reassembly_timeout: Duration::from_secs(30),
            max_reassembly_bytes: 1 << 20,
            cache_entries: 100,
            cache_ttl: Duration::from_secs(60),
            enable_multicast: false,
            multicast_group: multicast::DEFAULT_MULTICAST_GROUP,
            multicast_port: 5683,
        }
    }
}

impl CoapConfig {
    /// Validates the configuration.
    pub fn validate(&self) -> Result<()> {
        if !self.block_size.is_power_of_two()
            || !(block::MIN_BLOCK_SIZE..=block::MAX_BLOCK_SIZE).contains(&self.block_size)
        {
            return errinput!("block size must be a power of two between 16 and 1024");
        }
        if self.max_sessions == 0 {
            return errinput!("max sessions must be positive");
        }
        if self.ack_timeout.is_zero() {
            return errinput!("ack timeout must be positive");
        }
        if self.backoff_factor < 1.0 {
            return errinput!("backoff factor must be at least 1");
        }
        if self.max_inflight == 0 {
            return errinput!("max inflight requests must be positive");
        }
        if self.max_reassembly_bytes < self.block_size {
            return errinput!("max reassembly bytes must hold at least one block");
        }
        if !self.multicast_group.is_multicast() {
            return errinput!("multicast group must be a multicast address");
        }
        Ok(())
    }
}

/// Transport status counters, for observability.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CoapStatus {
    /// Active sessions in the pool.
    pub sessions: usize,
    /// Entries in the serialization cache.
    pub cache_entries: usize,
    /// Serialization cache hits.
    pub cache_hits: u64,
    /// Serialization cache misses.
    pub cache_misses: u64,
    /// Inbound requests currently being processed.
    pub inflight: usize,
    /// Memory held in reassembly buffers.
    pub reassembly_bytes: usize,
    /// Requests rejected as overloaded.
    pub overloaded: u64,
    /// Datagrams rejected as malformed.
    pub malformed: u64,
}
