//! Discovered advertisers: who is nearby right now, where to reach them, when they were last heard.
//!
//! Discovered peers are not session peers. Time is counted in host ticks, like heartbeats.

use std::collections::HashMap;
use std::net::SocketAddr;

use tracing::debug;

use crate::event::Event;
use crate::identity::{PeerId, PeerIdentity};

/// Ticks without a beacon before a nearby peer is considered gone.
pub const DEFAULT_PEER_TIMEOUT_TICKS: u64 = 8;

#[derive(Debug, Clone)]
pub struct NearbyPeer {
    pub identity: PeerIdentity,
    /// Where the peer accepts invitations.
    pub addr: SocketAddr,
    last_seen_tick: u64,
}

pub struct NearbyPeers {
    peers: HashMap<PeerId, NearbyPeer>,
    tick_count: u64,
    timeout_ticks: u64,
}

impl NearbyPeers {
    pub fn new(timeout_ticks: u64) -> Self {
        Self {
            peers: HashMap::new(),
            tick_count: 0,
            timeout_ticks: timeout_ticks.max(1),
        }
    }

    /// Record a beacon. Returns `PeerFound` the first time a peer is seen.
    pub fn observe(&mut self, identity: PeerIdentity, addr: SocketAddr) -> Option<Event> {
        let tick = self.tick_count;
        match self.peers.get_mut(&identity.id()) {
            Some(known) => {
                known.identity = identity;
                known.addr = addr;
                known.last_seen_tick = tick;
                None
            }
            None => {
                debug!(peer = %identity, %addr, "peer found");
                self.peers.insert(
                    identity.id(),
                    NearbyPeer {
                        identity: identity.clone(),
                        addr,
                        last_seen_tick: tick,
                    },
                );
                Some(Event::PeerFound { peer: identity })
            }
        }
    }

    /// Advance time; returns `PeerLost` for peers whose beacons stopped.
    pub fn tick(&mut self) -> Vec<Event> {
        self.tick_count = self.tick_count.saturating_add(1);
        let now = self.tick_count;
        let timeout = self.timeout_ticks;
        let lost: Vec<PeerId> = self
            .peers
            .iter()
            .filter(|(_, p)| now.saturating_sub(p.last_seen_tick) > timeout)
            .map(|(id, _)| *id)
            .collect();
        lost.into_iter()
            .filter_map(|id| self.peers.remove(&id))
            .map(|p| {
                debug!(peer = %p.identity, "peer lost");
                Event::PeerLost { peer: p.identity }
            })
            .collect()
    }

    pub fn get(&self, id: &PeerId) -> Option<&NearbyPeer> {
        self.peers.get(id)
    }

    /// Find a nearby peer by display name or ID prefix.
    pub fn resolve(&self, query: &str) -> Result<&NearbyPeer, ResolveError> {
        let identity = resolve(self.peers.values().map(|p| &p.identity), query)?;
        self.peers
            .get(&identity.id())
            .ok_or_else(|| ResolveError::NotFound(query.to_string()))
    }

    /// Identities sorted by name for display.
    pub fn list(&self) -> Vec<PeerIdentity> {
        let mut out: Vec<PeerIdentity> = self.peers.values().map(|p| p.identity.clone()).collect();
        out.sort_by(|a, b| a.display_name().cmp(b.display_name()).then(a.id().cmp(&b.id())));
        out
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Forget everything; used when browsing stops.
    pub fn clear(&mut self) {
        self.peers.clear();
    }
}

impl Default for NearbyPeers {
    fn default() -> Self {
        Self::new(DEFAULT_PEER_TIMEOUT_TICKS)
    }
}

/// Pick one identity by exact display name, falling back to ID hex prefix.
pub fn resolve<'a, I>(candidates: I, query: &str) -> Result<&'a PeerIdentity, ResolveError>
where
    I: IntoIterator<Item = &'a PeerIdentity>,
{
    let query = query.trim();
    let candidates: Vec<&PeerIdentity> = candidates.into_iter().collect();
    let by_name: Vec<&PeerIdentity> = candidates
        .iter()
        .copied()
        .filter(|p| p.display_name() == query)
        .collect();
    let matches = if by_name.is_empty() {
        candidates
            .into_iter()
            .filter(|p| p.id().matches_prefix(query))
            .collect()
    } else {
        by_name
    };
    match matches.as_slice() {
        [] => Err(ResolveError::NotFound(query.to_string())),
        [one] => Ok(*one),
        many => Err(ResolveError::Ambiguous {
            query: query.to_string(),
            count: many.len(),
        }),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolveError {
    #[error("no peer matches {0:?}")]
    NotFound(String),
    #[error("{count} peers match {query:?}; use an id prefix")]
    Ambiguous { query: String, count: usize },
}
