use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::time::{Duration, Instant};

use crate::error::TunnelError;

/// A peer stops counting as alive 30 seconds after the last relevant
/// activity: last reception once it has replied, last transmission until
/// then.
pub const PEER_TIMEOUT: Duration = Duration::from_secs(30);

/// Upper bound on tracked peers. Expired records are recycled before the
/// table refuses a new one.
pub const MAX_PEERS: usize = 1024;

/// NAT-traversal status of one remote IPv6 endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerState {
    /// An echo probe carrying `nonce` is in flight; the mapped endpoint
    /// stays unknown until the matching reply arrives.
    Probing { nonce: [u8; 8] },
    /// Restricted Teredo peer being bubbled. The endpoint embedded in
    /// its address is known but not yet verified.
    Bubbling {
        mapped_ipv4: Ipv4Addr,
        mapped_port: u16,
        bubbles_sent: u8,
        window_start: Instant,
    },
    /// The mapped endpoint is verified and usable for direct
    /// transmission.
    Trusted {
        mapped_ipv4: Ipv4Addr,
        mapped_port: u16,
    },
}

#[derive(Debug, Clone)]
pub struct Peer {
    pub state: PeerState,
    /// The peer has sent us at least one packet.
    pub replied: bool,
    pub last_rx: Instant,
    pub last_xmit: Instant,
    queued: Option<Vec<u8>>,
}

impl Peer {
    fn new(state: PeerState, now: Instant) -> Self {
        Peer {
            state,
            replied: false,
            last_rx: now,
            last_xmit: now,
            queued: None,
        }
    }

    /// Commits the verified mapping and marks the peer replied.
    pub fn trust(&mut self, mapped_ipv4: Ipv4Addr, mapped_port: u16, now: Instant) {
        self.state = PeerState::Trusted {
            mapped_ipv4,
            mapped_port,
        };
        self.replied = true;
        self.last_rx = now;
    }

    /// Parks one datagram until the peer becomes reachable. A packet
    /// already waiting is kept; there is never more than one.
    pub fn enqueue(&mut self, packet: &[u8]) {
        if self.queued.is_none() {
            self.queued = Some(packet.to_vec());
        }
    }

    pub fn take_queued(&mut self) -> Option<Vec<u8>> {
        self.queued.take()
    }

    fn expired(&self, now: Instant) -> bool {
        let reference = if self.replied {
            self.last_rx
        } else {
            self.last_xmit
        };
        now.duration_since(reference) > PEER_TIMEOUT
    }
}

/// The peers encountered by the tunnel, keyed by IPv6 address. Expired
/// records are invisible to lookups and linger only until their slot is
/// recycled.
pub struct PeerTable {
    peers: HashMap<Ipv6Addr, Peer>,
    capacity: usize,
}

impl PeerTable {
    pub fn new() -> Self {
        PeerTable::with_capacity(MAX_PEERS)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        PeerTable {
            peers: HashMap::new(),
            capacity,
        }
    }

    pub fn find(&mut self, addr: &Ipv6Addr, now: Instant) -> Option<&mut Peer> {
        self.peers.get_mut(addr).filter(|peer| !peer.expired(now))
    }

    /// Installs a fresh record for `addr`, recycling an expired slot
    /// first so the table only grows when every record is live. Fails
    /// with [`TunnelError::Exhausted`] once `capacity` live records
    /// exist.
    ///
    /// The record starts out with no history and no queued packet; it is
    /// up to the caller to fill it in.
    pub fn insert(
        &mut self,
        addr: Ipv6Addr,
        state: PeerState,
        now: Instant,
    ) -> Result<&mut Peer, TunnelError> {
        if !self.peers.contains_key(&addr) {
            let stale = self
                .peers
                .iter()
                .find(|(_, peer)| peer.expired(now))
                .map(|(stale, _)| *stale);
            match stale {
                Some(stale) => {
                    self.peers.remove(&stale);
                }
                None if self.peers.len() >= self.capacity => {
                    return Err(TunnelError::Exhausted);
                }
                None => {}
            }
        }

        match self.peers.entry(addr) {
            Entry::Occupied(mut entry) => {
                entry.insert(Peer::new(state, now));
                Ok(entry.into_mut())
            }
            Entry::Vacant(entry) => Ok(entry.insert(Peer::new(state, now))),
        }
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

impl Default for PeerTable {
    fn default() -> Self {
        PeerTable::new()
    }
}
