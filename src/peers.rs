//! Peer liveness tracking.
//!
//! Every datagram source address gets exactly one [`PeerTable`] entry, keyed
//! by address and port. A peer's clock measures seconds since its last
//! datagram; the broker resets it on intake and advances it once per tick.
//! Crossing the TTL removes the peer. A pruned address that sends again
//! later starts over as a brand-new peer.

use std::collections::HashMap;
use std::net::SocketAddr;

#[derive(Debug)]
struct Peer {
    /// Seconds since the last datagram from this address.
    elapsed: f64,
}

/// Tracks every remote endpoint seen on the broker socket.
#[derive(Debug)]
pub struct PeerTable {
    peers: HashMap<SocketAddr, Peer>,
    ttl: f64,
}

impl PeerTable {
    pub fn new(ttl: f64) -> Self {
        Self {
            peers: HashMap::new(),
            ttl,
        }
    }

    /// Resets the peer's clock, creating the entry on first contact.
    /// Returns `true` when the address was previously unseen.
    pub fn refresh(&mut self, addr: SocketAddr) -> bool {
        match self.peers.get_mut(&addr) {
            Some(peer) => {
                peer.elapsed = 0.0;
                false
            }
            None => {
                self.peers.insert(addr, Peer { elapsed: 0.0 });
                true
            }
        }
    }

    pub fn contains(&self, addr: &SocketAddr) -> bool {
        self.peers.contains_key(addr)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Advances every peer's clock by `dt` seconds and removes those past
    /// the TTL, returning the expired addresses so the caller can excise
    /// their subscriptions.
    pub fn sweep(&mut self, dt: f64) -> Vec<SocketAddr> {
        let ttl = self.ttl;
        let mut expired = Vec::new();
        self.peers.retain(|addr, peer| {
            peer.elapsed += dt;
            if peer.elapsed > ttl {
                expired.push(*addr);
                false
            } else {
                true
            }
        });
        expired
    }
}
