//! The CoAP transport server. Receives confirmable RPC requests, reassembles
//! block-wise transfers, dispatches them to the node's handler, and sends
//! the response piggybacked on the acknowledgement.
//!
//! The receive loop is defensive by construction: malformed datagrams are
//! rejected with a Reset and counted, duplicate retransmissions are
//! re-answered idempotently from a response cache, and load beyond the
//! in-flight or reassembly budgets is refused with 5.03 Service Unavailable.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use tokio::net::UdpSocket;

use super::block::Reassembler;
use super::message::{Code, Message, Type, OPTION_BLOCK1};
use super::multicast::{Announce, DISCOVERY_PATH};
use super::{CoapConfig, CoapStatus};
use crate::encoding::Value as _;
use crate::error::{Error, Result};
use crate::net;
use crate::raft::{NodeID, Request};

/// How long processed exchanges are remembered for duplicate detection.
/// Comfortably exceeds the longest client retransmission span.
const EXCHANGE_LIFETIME: Duration = Duration::from_secs(60);

/// A processed or in-progress exchange, for duplicate detection. Duplicates
/// of a completed exchange are re-answered with the recorded response;
/// duplicates of an exchange still being processed are dropped (the client
/// will retransmit again).
struct Exchange {
    response: Option<Vec<u8>>,
    at: Instant,
}

/// A CoAP network server for one node.
pub struct CoapServer {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    socket: Arc<UdpSocket>,
    node_id: NodeID,
    config: CoapConfig,
    handler: Arc<dyn net::Handler>,
    /// Block-wise transfer reassembly state.
    reassembler: Mutex<Reassembler>,
    /// Processed exchanges by (peer, message ID).
    exchanges: Mutex<HashMap<(SocketAddr, u16), Exchange>>,
    /// Requests currently being processed.
    inflight: AtomicUsize,
    /// Requests refused due to overload.
    overloaded: AtomicU64,
    /// Datagrams rejected as malformed.
    malformed: AtomicU64,
}

impl CoapServer {
    /// Creates a server bound to the given address, dispatching requests to
    /// the given handler (typically the Raft node).
    pub async fn new(
        bind: SocketAddr,
        node_id: NodeID,
        handler: Arc<dyn net::Handler>,
        config: CoapConfig,
    ) -> Result<Self> {
        config.validate()?;
        let socket = Arc::new(UdpSocket::bind(bind).await?);
        let reassembler =
            Reassembler::new(config.max_reassembly_bytes, config.reassembly_timeout);
        let inner = Arc::new(ServerInner {
            socket,
            node_id,
            config,
            handler,
            reassembler: Mutex::new(reassembler),
            exchanges: Mutex::new(HashMap::new()),
            inflight: AtomicUsize::new(0),
            overloaded: AtomicU64::new(0),
            malformed: AtomicU64::new(0),
        });
        Ok(Self { inner })
    }

    /// Returns the local socket address.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.inner.socket.local_addr()?)
    }

    /// Returns transport status counters.
    pub fn status(&self) -> CoapStatus {
        let reassembly_bytes = self.inner.lock_reassembler().bytes();
        CoapStatus {
            inflight: self.inner.inflight.load(Ordering::Relaxed),
            reassembly_bytes,
            overloaded: self.inner.overloaded.load(Ordering::Relaxed),
            malformed: self.inner.malformed.load(Ordering::Relaxed),
            ..CoapStatus::default()
        }
    }

    /// Serves requests until the socket fails fatally. Individual malformed
    /// or unprocessable datagrams never terminate the loop.
    pub async fn run(&self) -> Result<()> {
        info!("coap server for node {} listening on {}", self.inner.node_id, self.local_addr()?);
        if self.inner.config.enable_multicast {
            tokio::spawn(Self::multicast_listener(
                self.inner.node_id,
                self.local_addr()?.port(),
                self.inner.config.multicast_group,
                self.inner.config.multicast_port,
            ));
        }
        tokio::spawn(Self::cleanup_loop(Arc::downgrade(&self.inner)));

        let mut buf = vec![0u8; 65536];
        loop {
            let (len, from) = match self.inner.socket.recv_from(&mut buf).await {
                Ok(recv) => recv,
                Err(err) => {
                    // Transient receive errors (e.g. ICMP port unreachable
                    // surfaced on some platforms) don't stop the server.
                    warn!("socket receive failed: {err}");
                    continue;
                }
            };
            self.dispatch(&buf[..len], from);
        }
    }

    /// Dispatches one inbound datagram. Any reply is sent asynchronously.
    fn dispatch(&self, datagram: &[u8], from: SocketAddr) {
        let message = match Message::decode(datagram) {
            Ok(message) => message,
            Err(err) => {
                self.inner.malformed.fetch_add(1, Ordering::Relaxed);
                warn!("rejecting malformed datagram from {from}: {err}");
                // Reset the exchange if the header was readable, so the
                // sender stops retransmitting.
                if datagram.len() >= 4 {
                    let message_id = u16::from_be_bytes([datagram[2], datagram[3]]);
                    self.send(Message::reset(message_id), from);
                }
                return;
            }
        };

        match message.message_type {
            // We never send confirmable messages, so acks and resets aren't
            // expected; drop them.
            Type::Acknowledgement | Type::Reset => (),
            Type::NonConfirmable | Type::Confirmable => self.dispatch_request(message, from),
        }
    }

    /// Dispatches an inbound request after duplicate detection, overload
    /// checks, and block reassembly.
    fn dispatch_request(&self, message: Message, from: SocketAddr) {
        if !message.code.is_request() {
            debug!("dropping non-request {:?} from {from}", message.code);
            return;
        }
        let confirmable = message.message_type == Type::Confirmable;

        // Retransmissions of an already-processed exchange are re-answered
        // idempotently; retransmissions of one still in progress are
        // dropped.
        if confirmable {
            let mut exchanges = self.inner.lock_exchanges();
            if let Some(exchange) = exchanges.get(&(from, message.message_id)) {
                debug!("duplicate message {} from {from}", message.message_id);
                if let Some(response) = &exchange.response {
                    self.send_raw(response.clone(), from);
                }
                return;
            }
            exchanges
                .insert((from, message.message_id), Exchange { response: None, at: Instant::now() });
        }

        // Shed load beyond the in-flight budget with an explicit overloaded
        // response rather than a silent drop.
        if self.inner.inflight.load(Ordering::Relaxed) >= self.inner.config.max_inflight {
            self.inner.overloaded.fetch_add(1, Ordering::Relaxed);
            warn!("overloaded, refusing request from {from}");
            self.respond(&message, from, confirmable, Code::SERVICE_UNAVAILABLE, Vec::new());
            return;
        }

        // Reassemble block-wise requests. Intermediate blocks are
        // acknowledged with 2.31 Continue and not yet dispatched.
        let payload = match message.block1() {
            Ok(None) => message.payload.clone(),
            Ok(Some(block)) => {
                let result =
                    self.inner.lock_reassembler().insert(from, &message.token, block, &message.payload);
                match result {
                    Ok(Some(payload)) => payload,
                    Ok(None) if !block.more => {
                        // The final block arrived but earlier blocks are
                        // missing, e.g. expired by the reassembly timeout.
                        // Fail the transfer explicitly so the sender can
                        // restart it.
                        warn!("incomplete block transfer from {from}");
                        self.respond(
                            &message,
                            from,
                            confirmable,
                            Code::REQUEST_ENTITY_INCOMPLETE,
                            Vec::new(),
                        );
                        return;
                    }
                    Ok(None) => {
                        let reply = Message::new(
                            Type::Acknowledgement,
                            Code::CONTINUE,
                            message.message_id,
                            message.token.clone(),
                        )
                        .with_option(OPTION_BLOCK1, block.encode());
                        self.record_and_send(&message, from, confirmable, reply);
                        return;
                    }
                    Err(Error::Overloaded) => {
                        self.inner.overloaded.fetch_add(1, Ordering::Relaxed);
                        warn!("reassembly memory exhausted, refusing transfer from {from}");
                        self.respond(&message, from, confirmable, Code::SERVICE_UNAVAILABLE, Vec::new());
                        return;
                    }
                    Err(err) => {
                        self.inner.malformed.fetch_add(1, Ordering::Relaxed);
                        warn!("rejecting inconsistent block transfer from {from}: {err}");
                        self.respond(
                            &message,
                            from,
                            confirmable,
                            Code::REQUEST_ENTITY_INCOMPLETE,
                            Vec::new(),
                        );
                        return;
                    }
                }
            }
            Err(err) => {
                self.inner.malformed.fetch_add(1, Ordering::Relaxed);
                warn!("rejecting malformed block option from {from}: {err}");
                self.respond(&message, from, confirmable, Code::BAD_REQUEST, Vec::new());
                return;
            }
        };

        // Process the complete request concurrently with the receive loop.
        self.inner.inflight.fetch_add(1, Ordering::Relaxed);
        let this = Self { inner: self.inner.clone() };
        tokio::spawn(async move {
            let (code, payload) = this.process(&message, payload).await;
            this.respond(&message, from, confirmable, code, payload);
            this.inner.inflight.fetch_sub(1, Ordering::Relaxed);
        });
    }

    /// Decodes and routes a complete request payload to the handler,
    /// returning the response code and payload.
    async fn process(&self, message: &Message, payload: Vec<u8>) -> (Code, Vec<u8>) {
        let path = message.uri_path();
        if !matches!(path.as_str(), "raft/vote" | "raft/append" | "raft/snapshot") {
            debug!("unknown resource {path}");
            return (Code::NOT_FOUND, Vec::new());
        }
        let request = match Request::decode(&payload) {
            Ok(request) => request,
            Err(err) => {
                self.inner.malformed.fetch_add(1, Ordering::Relaxed);
                warn!("rejecting undecodable request payload: {err}");
                return (Code::BAD_REQUEST, Vec::new());
            }
        };
        if super::client::resource_path(&request) != path {
            warn!("request variant does not match resource {path}");
            return (Code::BAD_REQUEST, Vec::new());
        }
        match self.inner.handler.handle(request).await {
            Ok(response) => (Code::CONTENT, response.encode()),
            Err(Error::Overloaded) => (Code::SERVICE_UNAVAILABLE, Vec::new()),
            Err(err) => {
                error!("request handler failed: {err}");
                (Code::INTERNAL_SERVER_ERROR, err.to_string().into_bytes())
            }
        }
    }

    /// Builds a response for a request (an acknowledgement for confirmable
    /// requests), records it for duplicate re-answer, and sends it.
    fn respond(
        &self,
        request: &Message,
        from: SocketAddr,
        confirmable: bool,
        code: Code,
        payload: Vec<u8>,
    ) {
        let message_type =
            if confirmable { Type::Acknowledgement } else { Type::NonConfirmable };
        let reply = Message::new(message_type, code, request.message_id, request.token.clone())
            .with_payload(payload);
        self.record_and_send(request, from, confirmable, reply);
    }

    /// Records the encoded reply against the request's exchange and sends
    /// it.
    fn record_and_send(
        &self,
        request: &Message,
        from: SocketAddr,
        confirmable: bool,
        reply: Message,
    ) {
        let encoded = reply.encode();
        if confirmable {
            let mut exchanges = self.inner.lock_exchanges();
            if let Some(exchange) = exchanges.get_mut(&(from, request.message_id)) {
                exchange.response = Some(encoded.clone());
            }
        }
        self.send_raw(encoded, from);
    }

    /// Sends an encoded message asynchronously.
    fn send_raw(&self, datagram: Vec<u8>, to: SocketAddr) {
        let socket = self.inner.socket.clone();
        tokio::spawn(async move {
            if let Err(err) = socket.send_to(&datagram, to).await {
                debug!("failed to send to {to}: {err}");
            }
        });
    }

    fn send(&self, message: Message, to: SocketAddr) {
        self.send_raw(message.encode(), to);
    }

    /// Periodically expires incomplete block transfers and old exchanges.
    async fn cleanup_loop(weak: std::sync::Weak<ServerInner>) {
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        loop {
            ticker.tick().await;
            let Some(inner) = weak.upgrade() else { return };
            let expired = inner
                .reassembler
                .lock()
                .expect("lock poisoned")
                .cleanup_expired();
            if expired > 0 {
                debug!("expired {expired} incomplete block transfers");
            }
            let cutoff = Instant::now() - EXCHANGE_LIFETIME;
            inner.exchanges.lock().expect("lock poisoned").retain(|_, e| e.at >= cutoff);
        }
    }

    /// Listens on the multicast discovery group and answers probes with an
    /// announcement of this node's ID and unicast RPC port.
    async fn multicast_listener(node_id: NodeID, rpc_port: u16, group: Ipv4Addr, port: u16) {
        let socket = match UdpSocket::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port))).await {
            Ok(socket) => socket,
            Err(err) => {
                error!("failed to bind multicast listener on port {port}: {err}");
                return;
            }
        };
        if let Err(err) = socket.join_multicast_v4(group, Ipv4Addr::UNSPECIFIED) {
            error!("failed to join multicast group {group}: {err}");
            return;
        }
        info!("node {node_id} listening for discovery probes on {group}:{port}");

        let mut buf = vec![0u8; 2048];
        loop {
            let (len, from) = match socket.recv_from(&mut buf).await {
                Ok(recv) => recv,
                Err(err) => {
                    warn!("multicast receive failed: {err}");
                    continue;
                }
            };
            let Ok(message) = Message::decode(&buf[..len]) else {
                debug!("ignoring malformed multicast datagram from {from}");
                continue;
            };
            if message.message_type != Type::NonConfirmable
                || message.code != Code::GET
                || message.uri_path() != DISCOVERY_PATH
            {
                continue;
            }
            debug!("answering discovery probe from {from}");
            let announce = Announce { node_id, port: rpc_port };
            let reply = Message::new(
                Type::NonConfirmable,
                Code::CONTENT,
                message.message_id,
                message.token.clone(),
            )
            .with_payload(announce.encode());
            if let Err(err) = socket.send_to(&reply.encode(), from).await {
                debug!("failed to answer discovery probe from {from}: {err}");
            }
        }
    }
}

impl ServerInner {
    fn lock_reassembler(&self) -> MutexGuard<'_, Reassembler> {
        self.reassembler.lock().expect("lock poisoned")
    }

    fn lock_exchanges(&self) -> MutexGuard<'_, HashMap<(SocketAddr, u16), Exchange>> {
        self.exchanges.lock().expect("lock poisoned")
    }
}
