//! The CoAP transport client. Each RPC is a confirmable request/response
//! exchange: a POST to the RPC's resource path, with the response
//! piggybacked on the acknowledgement. Exchanges are matched by token, lost
//! messages retransmitted with exponential backoff, and oversized payloads
//! fragmented block-wise.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use rand::Rng as _;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;

use super::block::{should_use_block_transfer, split_into_blocks};
use super::cache::SerializationCache;
use super::message::{Code, Message, Type, OPTION_BLOCK1};
use super::multicast::{Announce, DISCOVERY_PATH};
use super::session::SessionPool;
use super::{CoapConfig, CoapStatus};
use crate::encoding::Value as _;
use crate::error::{Error, Result};
use crate::net;
use crate::raft::{NodeID, Request, Response};

/// Resolves an RPC request variant to its resource path.
pub(super) fn resource_path(request: &Request) -> &'static str {
    match request {
        Request::Vote(_) => "raft/vote",
        Request::Append(_) => "raft/append",
        Request::Snapshot(_) => "raft/snapshot",
    }
}

/// A CoAP network client. Cheap to clone; clones share the socket, session
/// pool, and caches.
#[derive(Clone)]
pub struct CoapClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    socket: Arc<UdpSocket>,
    config: CoapConfig,
    /// Peer addresses by node ID, from configuration and discovery.
    routes: Mutex<HashMap<NodeID, SocketAddr>>,
    /// The per-peer session pool.
    pool: Mutex<SessionPool>,
    /// Content-addressed request serialization cache.
    cache: Mutex<SerializationCache<Request>>,
    /// In-flight exchanges by token, resolved by the receive loop.
    pending: Mutex<HashMap<Vec<u8>, oneshot::Sender<Message>>>,
    /// In-flight multicast discoveries by token, collecting all responders.
    discoveries: Mutex<HashMap<Vec<u8>, mpsc::UnboundedSender<(SocketAddr, Message)>>>,
    token_counter: AtomicU64,
    malformed: AtomicU64,
}

impl CoapClient {
    /// Creates a client bound to an ephemeral local port, with the given
    /// initial peer routes. Must be called within a tokio runtime.
    pub async fn new(routes: HashMap<NodeID, SocketAddr>, config: CoapConfig) -> Result<Self> {
        config.validate()?;
        let socket = Arc::new(UdpSocket::bind("0.0.0.0:0").await?);
        let inner = Arc::new(ClientInner {
            socket: socket.clone(),
            pool: Mutex::new(SessionPool::new(config.max_sessions, config.session_timeout)),
            cache: Mutex::new(SerializationCache::new(config.cache_entries, config.cache_ttl)),
            config,
            routes: Mutex::new(routes),
            pending: Mutex::new(HashMap::new()),
            discoveries: Mutex::new(HashMap::new()),
            token_counter: AtomicU64::new(1),
            malformed: AtomicU64::new(0),
        });
        tokio::spawn(Self::receive_loop(Arc::downgrade(&inner), socket));
        tokio::spawn(Self::cleanup_loop(Arc::downgrade(&inner)));
        Ok(Self { inner })
    }

    /// Returns the local socket address.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.inner.socket.local_addr()?)
    }

    /// Adds or replaces the route for a peer.
    pub fn add_route(&self, id: NodeID, addr: SocketAddr) {
        self.inner.routes.lock().expect("lock poisoned").insert(id, addr);
    }

    /// Returns transport status counters.
    pub fn status(&self) -> CoapStatus {
        let (cache_entries, cache_hits, cache_misses) = {
            let cache = self.inner.lock_cache();
            let (hits, misses) = cache.stats();
            (cache.len(), hits, misses)
        };
        CoapStatus {
            sessions: self.inner.lock_pool().len(),
            cache_entries,
            cache_hits,
            cache_misses,
            malformed: self.inner.malformed.load(Ordering::Relaxed),
            ..CoapStatus::default()
        }
    }

    /// Probes the multicast discovery group and collects announcements for
    /// the given duration, feeding discovered peers into the routing table
    /// and the session pool's known-peer set.
    pub async fn discover(&self, wait: Duration) -> Result<Vec<(NodeID, SocketAddr)>> {
        let token = self.next_token();
        let (tx, mut rx) = mpsc::unbounded_channel();
        self.inner.lock_discoveries().insert(token.clone(), tx);

        let group =
            SocketAddr::from((self.inner.config.multicast_group, self.inner.config.multicast_port));
        let probe =
            Message::new(Type::NonConfirmable, Code::GET, rand::thread_rng().gen(), token.clone())
                .with_uri_path(DISCOVERY_PATH);
        let result = self.collect_discoveries(group, probe, wait, &mut rx).await;
        self.inner.lock_discoveries().remove(&token);
        result
    }

    async fn collect_discoveries(
        &self,
        group: SocketAddr,
        probe: Message,
        wait: Duration,
        rx: &mut mpsc::UnboundedReceiver<(SocketAddr, Message)>,
    ) -> Result<Vec<(NodeID, SocketAddr)>> {
        self.inner.socket.send_to(&probe.encode(), group).await?;
        let deadline = tokio::time::Instant::now() + wait;
        let mut found = Vec::new();
        while let Ok(Some((from, message))) = tokio::time::timeout_at(deadline, rx.recv()).await {
            let announce = match Announce::decode(&message.payload) {
                Ok(announce) => announce,
                Err(err) => {
                    debug!("ignoring invalid announcement from {from}: {err}");
                    continue;
                }
            };
            let addr = SocketAddr::new(from.ip(), announce.port);
            debug!("discovered node {} at {addr}", announce.node_id);
            self.inner.lock_pool().add_known_peer(addr);
            self.inner.routes.lock().expect("lock poisoned").insert(announce.node_id, addr);
            found.push((announce.node_id, addr));
        }
        Ok(found)
    }

    /// Sends a request payload to a peer and returns the response payload.
    /// Fragments the payload block-wise if it exceeds the block size.
    async fn request(&self, peer: SocketAddr, path: &str, payload: Vec<u8>) -> Result<Vec<u8>> {
        let token = self.next_token();
        let response = if should_use_block_transfer(&payload, self.inner.config.block_size) {
            self.request_blockwise(peer, path, token, payload).await?
        } else {
            let message_id = self.inner.lock_pool().acquire(peer)?.next_message_id();
            let message = Message::new(Type::Confirmable, Code::POST, message_id, token)
                .with_uri_path(path)
                .with_payload(payload);
            let result = self.exchange(peer, message).await;
            self.inner.lock_pool().release(peer);
            result?
        };
        Self::check_response(response)
    }

    /// Sends a payload as a sequence of block-wise exchanges. Intermediate
    /// blocks are acknowledged with 2.31 Continue; the final block's
    /// acknowledgement carries the actual response.
    async fn request_blockwise(
        &self,
        peer: SocketAddr,
        path: &str,
        token: Vec<u8>,
        payload: Vec<u8>,
    ) -> Result<Message> {
        let blocks = split_into_blocks(&payload, self.inner.config.block_size);
        debug!("sending {} bytes to {peer} in {} blocks", payload.len(), blocks.len());
        let mut response = None;
        for (block, chunk) in blocks {
            let message_id = self.inner.lock_pool().acquire(peer)?.next_message_id();
            let message = Message::new(Type::Confirmable, Code::POST, message_id, token.clone())
                .with_uri_path(path)
                .with_option(OPTION_BLOCK1, block.encode())
                .with_payload(chunk.to_vec());
            match self.exchange(peer, message).await {
                Ok(resp) if block.more && resp.code == Code::CONTINUE => continue,
                Ok(resp) => {
                    // The final response, or an early rejection (e.g. 5.03).
                    response = Some(resp);
                    break;
                }
                Err(err) => {
                    self.inner.lock_pool().release(peer);
                    return Err(err);
                }
            }
        }
        self.inner.lock_pool().release(peer);
        Ok(response.expect("split yields at least one block"))
    }

    /// Performs one confirmable exchange: sends the message and awaits its
    /// acknowledgement, retransmitting with exponential backoff until the
    /// retransmission budget is exhausted.
    async fn exchange(&self, peer: SocketAddr, message: Message) -> Result<Message> {
        let token = message.token.clone();
        let (tx, mut rx) = oneshot::channel();
        self.inner.lock_pending().insert(token.clone(), tx);
        let result = self.exchange_attempts(peer, &message.encode(), &mut rx).await;
        self.inner.lock_pending().remove(&token);
        result
    }

    async fn exchange_attempts(
        &self,
        peer: SocketAddr,
        datagram: &[u8],
        rx: &mut oneshot::Receiver<Message>,
    ) -> Result<Message> {
        for attempt in 0..=self.inner.config.max_retransmit {
            if attempt > 0 {
                debug!("retransmitting to {peer} (attempt {attempt})");
            }
            self.inner.socket.send_to(datagram, peer).await?;
            match timeout(self.retransmit_timeout(attempt), &mut *rx).await {
                Ok(Ok(response)) => return Ok(response),
                Ok(Err(_)) => return Err(Error::Unavailable), // client shut down
                Err(_) => continue,
            }
        }
        Err(Error::Timeout)
    }

    /// Returns the retransmission timeout for an attempt: the ack timeout
    /// with exponential backoff and a randomization factor of 1.0-1.5, per
    /// the CoAP transmission parameters.
    fn retransmit_timeout(&self, attempt: usize) -> Duration {
        let backoff = self.inner.config.backoff_factor.powi(attempt as i32);
        let random = rand::thread_rng().gen_range(1.0..1.5);
        Duration::from_secs_f64(self.inner.config.ack_timeout.as_secs_f64() * backoff * random)
    }

    /// Maps a response message to its payload or a typed error.
    fn check_response(response: Message) -> Result<Vec<u8>> {
        let code = response.code;
        if code.is_success() {
            Ok(response.payload)
        } else if code == Code::SERVICE_UNAVAILABLE {
            Err(Error::Overloaded)
        } else if code.class() == 4 {
            Err(Error::InvalidData(format!("peer rejected request with {code:?}")))
        } else {
            Err(Error::IO(format!("request failed with {code:?}")))
        }
    }

    /// Allocates a unique token.
    fn next_token(&self) -> Vec<u8> {
        self.inner.token_counter.fetch_add(1, Ordering::Relaxed).to_be_bytes().to_vec()
    }

    /// Receives and routes inbound datagrams: acknowledgements and responses
    /// resolve their pending exchange by token, discovery responses feed
    /// their collector. Malformed datagrams are counted and dropped; they
    /// can never take down the loop.
    async fn receive_loop(weak: Weak<ClientInner>, socket: Arc<UdpSocket>) {
        let mut buf = vec![0u8; 65536];
        loop {
            let (len, from) = tokio::select! {
                result = socket.recv_from(&mut buf) => match result {
                    Ok(recv) => recv,
                    Err(err) => {
                        warn!("socket receive failed: {err}");
                        continue;
                    }
                },
                _ = tokio::time::sleep(Duration::from_secs(1)) => {
                    if weak.upgrade().is_none() {
                        return; // client dropped
                    }
                    continue;
                }
            };
            let Some(inner) = weak.upgrade() else { return };
            let message = match Message::decode(&buf[..len]) {
                Ok(message) => message,
                Err(err) => {
                    inner.malformed.fetch_add(1, Ordering::Relaxed);
                    warn!("malformed datagram from {from}: {err}");
                    continue;
                }
            };
            match message.message_type {
                Type::Acknowledgement | Type::NonConfirmable => {
                    if message.code == Code::EMPTY {
                        // A bare ack; keep waiting for the response.
                        continue;
                    }
                    let pending = inner.lock_pending().remove(&message.token);
                    if let Some(tx) = pending {
                        let _ = tx.send(message);
                    } else if let Some(tx) = inner.lock_discoveries().get(&message.token) {
                        let _ = tx.send((from, message));
                    } else {
                        debug!("dropping unmatched response from {from}");
                    }
                }
                Type::Confirmable => {
                    // A separate (non-piggybacked) response: acknowledge it,
                    // then route it like any other response.
                    let ack = Message::ack(message.message_id);
                    let _ = socket.send_to(&ack.encode(), from).await;
                    let pending = inner.lock_pending().remove(&message.token);
                    if let Some(tx) = pending {
                        let _ = tx.send(message);
                    }
                }
                Type::Reset => debug!("received reset from {from}"),
            }
        }
    }

    /// Periodically expires idle sessions and stale cache entries.
    async fn cleanup_loop(weak: Weak<ClientInner>) {
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        loop {
            ticker.tick().await;
            let Some(inner) = weak.upgrade() else { return };
            inner.lock_pool().cleanup_expired();
            inner.lock_cache().cleanup();
        }
    }
}

impl ClientInner {
    fn lock_pool(&self) -> MutexGuard<'_, SessionPool> {
        self.pool.lock().expect("lock poisoned")
    }

    fn lock_cache(&self) -> MutexGuard<'_, SerializationCache<Request>> {
        self.cache.lock().expect("lock poisoned")
    }

    fn lock_pending(&self) -> MutexGuard<'_, HashMap<Vec<u8>, oneshot::Sender<Message>>> {
        self.pending.lock().expect("lock poisoned")
    }

    fn lock_discoveries(
        &self,
    ) -> MutexGuard<'_, HashMap<Vec<u8>, mpsc::UnboundedSender<(SocketAddr, Message)>>> {
        self.discoveries.lock().expect("lock poisoned")
    }
}

#[async_trait]
impl net::Client for CoapClient {
    async fn call(&self, to: NodeID, request: Request) -> Result<Response> {
        let addr = self
            .inner
            .routes
            .lock()
            .expect("lock poisoned")
            .get(&to)
            .copied()
            .ok_or(Error::Unavailable)?;
        let path = resource_path(&request);
        // The same request is often sent to several peers and retried, so
        // the encoding is memoized by content.
        let payload = self.inner.lock_cache().get_or_insert_with(&request, || request.encode());
        let response = self.request(addr, path, payload).await?;
        Response::decode(&response)
    }
}
