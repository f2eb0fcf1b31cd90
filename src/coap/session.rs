//! Per-peer transport sessions and the bounded session pool.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use log::debug;
use rand::Rng as _;

use crate::error::{Error, Result};

/// Transport state for one peer: message ID allocation, activity tracking,
/// and in-use accounting. Owned by the session pool.
pub struct Session {
    /// The peer address.
    peer: SocketAddr,
    /// The next message ID. Seeded randomly to avoid collisions with a
    /// previous incarnation's IDs within the duplicate-detection window.
    next_message_id: u16,
    /// The last time the session was used, for idle expiry.
    last_active: Instant,
    /// Whether the session is checked out for an exchange. In-use sessions
    /// are never evicted.
    in_use: bool,
}

impl Session {
    fn new(peer: SocketAddr) -> Self {
        Self {
            peer,
            next_message_id: rand::thread_rng().gen(),
            last_active: Instant::now(),
            in_use: false,
        }
    }

    /// Returns the peer address.
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Allocates the next message ID, wrapping on overflow.
    pub fn next_message_id(&mut self) -> u16 {
        let id = self.next_message_id;
        self.next_message_id = self.next_message_id.wrapping_add(1);
        self.last_active = Instant::now();
        id
    }
}

/// A bounded pool of per-peer sessions. Sessions are created on first use,
/// reused while active, and evicted after an idle timeout. The pool never
/// exceeds its maximum size: once full (and nothing is evictable), new
/// sessions are refused with an overloaded error as backpressure, rather
/// than growing without bound.
pub struct SessionPool {
    sessions: HashMap<SocketAddr, Session>,
    /// Peers known to exist, fed by configuration and multicast discovery.
    known_peers: HashSet<SocketAddr>,
    max_sessions: usize,
    idle_timeout: Duration,
}

impl SessionPool {
    pub fn new(max_sessions: usize, idle_timeout: Duration) -> Self {
        assert!(max_sessions > 0, "pool must hold at least one session");
        Self { sessions: HashMap::new(), known_peers: HashSet::new(), max_sessions, idle_timeout }
    }

    /// Returns the peer's session, creating one if needed, and checks it out
    /// for an exchange. Fails with Overloaded when the pool is full and no
    /// session can be evicted.
    pub fn acquire(&mut self, peer: SocketAddr) -> Result<&mut Session> {
        if !self.sessions.contains_key(&peer) {
            if self.sessions.len() >= self.max_sessions {
                self.cleanup_expired();
            }
            if self.sessions.len() >= self.max_sessions {
                return Err(Error::Overloaded);
            }
            debug!("creating session for peer {peer}");
            self.sessions.insert(peer, Session::new(peer));
        }
        let session = self.sessions.get_mut(&peer).expect("session must exist");
        session.in_use = true;
        session.last_active = Instant::now();
        Ok(session)
    }

    /// Returns a session to the pool after an exchange, making it evictable
    /// again once idle.
    pub fn release(&mut self, peer: SocketAddr) {
        if let Some(session) = self.sessions.get_mut(&peer) {
            session.in_use = false;
            session.last_active = Instant::now();
        }
    }

    /// Evicts sessions that have been idle past the timeout and aren't
    /// checked out. Returns the number evicted.
    pub fn cleanup_expired(&mut self) -> usize {
        let cutoff = Instant::now() - self.idle_timeout;
        let before = self.sessions.len();
        self.sessions.retain(|peer, session| {
            let keep = session.in_use || session.last_active >= cutoff;
            if !keep {
                debug!("evicting idle session for peer {peer}");
            }
            keep
        });
        before - self.sessions.len()
    }

    /// Records a peer as known, e.g. from multicast discovery.
    pub fn add_known_peer(&mut self, peer: SocketAddr) {
        self.known_peers.insert(peer);
    }

    /// Returns the known peers.
    pub fn known_peers(&self) -> &HashSet<SocketAddr> {
        &self.known_peers
    }

    /// Returns the number of pooled sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().expect("invalid address")
    }

    #[test]
    fn reuses_sessions_per_peer() -> Result<()> {
        let mut pool = SessionPool::new(10, Duration::from_secs(30));
        let first = pool.acquire(addr(1))?.next_message_id();
        pool.release(addr(1));
        let second = pool.acquire(addr(1))?.next_message_id();
        // Same session: consecutive message IDs.
        assert_eq!(second, first.wrapping_add(1));
        assert_eq!(pool.len(), 1);
        Ok(())
    }

    #[test]
    fn enforces_capacity_with_overload() -> Result<()> {
        // The pool never exceeds its maximum; excess peers get an explicit
        // overloaded error rather than a silently dropped session.
        let mut pool = SessionPool::new(2, Duration::from_secs(30));
        pool.acquire(addr(1))?;
        pool.acquire(addr(2))?;
        assert_eq!(pool.acquire(addr(3)).err(), Some(Error::Overloaded));
        assert_eq!(pool.len(), 2);
        // Existing sessions are still served.
        pool.acquire(addr(1))?;
        Ok(())
    }

    #[test]
    fn full_pool_evicts_expired_before_refusing() -> Result<()> {
        let mut pool = SessionPool::new(1, Duration::from_millis(0));
        pool.acquire(addr(1))?;
        pool.release(addr(1));
        std::thread::sleep(Duration::from_millis(5));
        // The expired idle session makes room for the new peer.
        pool.acquire(addr(2))?;
        assert_eq!(pool.len(), 1);
        Ok(())
    }

    #[test]
    fn in_use_sessions_are_not_evicted() -> Result<()> {
        let mut pool = SessionPool::new(1, Duration::from_millis(0));
        pool.acquire(addr(1))?; // never released
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(pool.cleanup_expired(), 0);
        assert_eq!(pool.acquire(addr(2)).err(), Some(Error::Overloaded));
        Ok(())
    }

    #[test]
    fn tracks_known_peers() {
        let mut pool = SessionPool::new(2, Duration::from_secs(30));
        pool.add_known_peer(addr(7));
        pool.add_known_peer(addr(7));
        assert_eq!(pool.known_peers().len(), 1);
        assert!(pool.known_peers().contains(&addr(7)));
    }
}
