//! Network transport capabilities.
//!
//! The Raft node is decoupled from the concrete transport through two
//! capability traits: [`Client`] sends RPC requests to peers and awaits
//! their responses, and [`Handler`] processes inbound requests (the node
//! itself implements it). Transports carry requests and responses as opaque
//! Bincode payloads; see [`crate::coap`] for the wire transport and
//! [`local`] for the in-process transport used by cluster tests.

pub mod local;

use async_trait::async_trait;

use crate::error::Result;
use crate::raft::{NodeID, Request, Response};

/// A network client, sending RPC requests to peers. Implementations must be
/// safe for concurrent use; requests to distinct peers must not serialize
/// behind each other.
#[async_trait]
pub trait Client: Send + Sync {
    /// Sends a request to the given peer and awaits its response. Transport
    /// failures surface as errors (typically Timeout or Unavailable); they
    /// never panic the caller.
    async fn call(&self, to: NodeID, request: Request) -> Result<Response>;
}

/// An inbound RPC handler. The Raft node implements this; transports invoke
/// it for every valid request they receive and send back the response.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Processes a request and returns the response. Errors are transport
    /// failures; RPC-level rejections (e.g. a denied vote) are encoded in
    /// the response itself.
    async fn handle(&self, request: Request) -> Result<Response>;
}
