//! Session manager: owns the peer set, drives the per-peer state machine and fans messages out.
//!
//! The host owns exactly one `Session` and feeds it transport events one at a time;
//! mutations are therefore serialized by construction. Links are leased from the host
//! with `Transition::Connecting` and released when the peer is removed.

use std::collections::{HashMap, HashSet};
use std::fmt;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::codec::{self, EncodeError};
use crate::event::Event;
use crate::identity::{PeerId, PeerIdentity};

/// Shown instead of an empty list so "no peers" differs from "peers with empty names".
pub const NO_CONNECTED_PEER: &str = "No connected peer";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerState {
    Connecting,
    Connected,
    Disconnected,
}

impl PeerState {
    /// Legal edges: connecting -> connected, connecting -> disconnected, connected -> disconnected.
    pub fn can_transition_to(self, next: PeerState) -> bool {
        matches!(
            (self, next),
            (PeerState::Connecting, PeerState::Connected)
                | (PeerState::Connecting, PeerState::Disconnected)
                | (PeerState::Connected, PeerState::Disconnected)
        )
    }
}

/// Transport handle for one peer. `send` must not block: it queues the frame or fails.
pub trait Link {
    fn send(&self, frame: &[u8]) -> Result<(), SendError>;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    #[error("link closed")]
    LinkClosed,
    #[error("transport error: {0}")]
    Transport(String),
}

/// State change reported by the transport. Entering `Connecting` hands over the link.
pub enum Transition<L> {
    Connecting(L),
    Connected,
    Disconnected,
}

impl<L> Transition<L> {
    pub fn state(&self) -> PeerState {
        match self {
            Transition::Connecting(_) => PeerState::Connecting,
            Transition::Connected => PeerState::Connected,
            Transition::Disconnected => PeerState::Disconnected,
        }
    }
}

/// One remote peer known to the session. Present only while connecting or connected.
pub struct PeerConnection<L> {
    identity: PeerIdentity,
    state: PeerState,
    link: L,
    /// Order in which peers became connected; drives `list_connected_peers`.
    connected_seq: Option<u64>,
}

impl<L> PeerConnection<L> {
    pub fn identity(&self) -> &PeerIdentity {
        &self.identity
    }

    pub fn state(&self) -> PeerState {
        self.state
    }

    pub fn link(&self) -> &L {
        &self.link
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    /// Accept every inbound invitation without asking the shell.
    pub auto_accept: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self { auto_accept: true }
    }
}

/// What to do with an inbound invitation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvitationDecision {
    Accept,
    Decline,
    /// Ask the shell.
    Defer,
}

/// Outcome of a fan-out send. Both empty when nobody was connected.
#[derive(Debug, Default)]
pub struct SendResult {
    pub succeeded: HashSet<PeerIdentity>,
    pub failed: HashMap<PeerIdentity, SendError>,
}

impl SendResult {
    pub fn is_empty(&self) -> bool {
        self.succeeded.is_empty() && self.failed.is_empty()
    }

    /// Events for the shell: one `MessageSent` plus one `SendFailed` per failed peer.
    pub fn events(&self) -> Vec<Event> {
        let mut delivered: Vec<PeerIdentity> = self.succeeded.iter().cloned().collect();
        delivered.sort_by_key(|p| p.id());
        let mut failed: Vec<(&PeerIdentity, &SendError)> = self.failed.iter().collect();
        failed.sort_by_key(|(p, _)| p.id());
        let mut events = vec![Event::MessageSent { delivered }];
        events.extend(failed.into_iter().map(|(peer, err)| Event::SendFailed {
            peer: peer.clone(),
            reason: err.to_string(),
        }));
        events
    }
}

/// Snapshot of connected peer names, in connection order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct ConnectedPeers(Vec<String>);

impl ConnectedPeers {
    pub fn names(&self) -> &[String] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for ConnectedPeers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            f.write_str(NO_CONNECTED_PEER)
        } else {
            f.write_str(&self.0.join(", "))
        }
    }
}

pub struct Session<L> {
    local: PeerIdentity,
    config: SessionConfig,
    peers: HashMap<PeerId, PeerConnection<L>>,
    /// Peers we have an invitation in flight to.
    outbound_invitations: HashSet<PeerId>,
    advertising: bool,
    browsing: bool,
    next_seq: u64,
}

impl<L: Link> Session<L> {
    pub fn new(local: PeerIdentity, config: SessionConfig) -> Self {
        Self {
            local,
            config,
            peers: HashMap::new(),
            outbound_invitations: HashSet::new(),
            advertising: false,
            browsing: false,
            next_seq: 0,
        }
    }

    pub fn local(&self) -> &PeerIdentity {
        &self.local
    }

    pub fn config(&self) -> SessionConfig {
        self.config
    }

    pub fn is_advertising(&self) -> bool {
        self.advertising
    }

    pub fn set_advertising(&mut self, on: bool) {
        self.advertising = on;
    }

    pub fn is_browsing(&self) -> bool {
        self.browsing
    }

    pub fn set_browsing(&mut self, on: bool) {
        self.browsing = on;
    }

    pub fn peer(&self, id: &PeerId) -> Option<&PeerConnection<L>> {
        self.peers.get(id)
    }

    pub fn contains(&self, id: &PeerId) -> bool {
        self.peers.contains_key(id)
    }

    /// Apply a transport-reported state change. Illegal or duplicate transitions are ignored.
    pub fn on_peer_state_changed(
        &mut self,
        peer: &PeerIdentity,
        transition: Transition<L>,
    ) -> Option<Event> {
        let id = peer.id();
        match transition {
            Transition::Connecting(link) => {
                if id == self.local.id() {
                    warn!(peer = %peer, "ignoring connection to self");
                    return None;
                }
                if let Some(existing) = self.peers.get(&id) {
                    debug!(peer = %peer, state = ?existing.state, "ignoring connecting for known peer");
                    return None;
                }
                self.outbound_invitations.remove(&id);
                info!(peer = %peer, "peer connecting");
                self.peers.insert(
                    id,
                    PeerConnection {
                        identity: peer.clone(),
                        state: PeerState::Connecting,
                        link,
                        connected_seq: None,
                    },
                );
                Some(Event::PeerConnecting { peer: peer.clone() })
            }
            Transition::Connected => {
                let seq = self.next_seq;
                let conn = match self.peers.get_mut(&id) {
                    Some(c) if c.state.can_transition_to(PeerState::Connected) => c,
                    Some(c) => {
                        debug!(peer = %peer, state = ?c.state, "ignoring connected");
                        return None;
                    }
                    None => {
                        debug!(peer = %peer, "ignoring connected for unknown peer");
                        return None;
                    }
                };
                conn.state = PeerState::Connected;
                conn.connected_seq = Some(seq);
                self.next_seq += 1;
                info!(peer = %peer, "peer connected");
                Some(Event::PeerConnected {
                    peer: conn.identity.clone(),
                })
            }
            Transition::Disconnected => match self.peers.remove(&id) {
                Some(conn) => {
                    info!(peer = %conn.identity, from = ?conn.state, "peer disconnected");
                    Some(Event::PeerDisconnected {
                        peer: conn.identity,
                    })
                }
                None => {
                    debug!(peer = %peer, "ignoring disconnected for unknown peer");
                    None
                }
            },
        }
    }

    /// Decode a payload from a session peer. A bad payload is reported, never fatal to the link.
    pub fn on_data_received(&self, from: &PeerId, payload: &[u8]) -> Option<Event> {
        let Some(conn) = self.peers.get(from) else {
            debug!(peer = %from, len = payload.len(), "dropping data from unknown peer");
            return None;
        };
        match codec::decode(payload) {
            Ok(text) => Some(Event::MessageReceived {
                from: conn.identity.clone(),
                text,
            }),
            Err(e) => {
                warn!(peer = %conn.identity, error = %e, "dropping undecodable message");
                Some(Event::DecodeFailed {
                    from: conn.identity.clone(),
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Encode once, then deliver to every connected peer independently. Never retries.
    pub fn send_message(&self, text: &str) -> Result<SendResult, EncodeError> {
        let frame = codec::encode(text)?;
        let targets: Vec<&PeerConnection<L>> = self
            .peers
            .values()
            .filter(|c| c.state == PeerState::Connected)
            .collect();
        let mut result = SendResult::default();
        for conn in targets {
            match conn.link.send(&frame) {
                Ok(()) => {
                    result.succeeded.insert(conn.identity.clone());
                }
                Err(e) => {
                    warn!(peer = %conn.identity, error = %e, "send failed");
                    result.failed.insert(conn.identity.clone(), e);
                }
            }
        }
        debug!(
            delivered = result.succeeded.len(),
            failed = result.failed.len(),
            "fan-out complete"
        );
        Ok(result)
    }

    pub fn list_connected_peers(&self) -> ConnectedPeers {
        let mut connected: Vec<(u64, &PeerConnection<L>)> = self
            .peers
            .values()
            .filter(|c| c.state == PeerState::Connected)
            .filter_map(|c| c.connected_seq.map(|seq| (seq, c)))
            .collect();
        connected.sort_by_key(|(seq, _)| *seq);
        ConnectedPeers(
            connected
                .into_iter()
                .map(|(_, c)| c.identity.display_name().to_string())
                .collect(),
        )
    }

    /// Arbitrate an inbound invitation per the configured policy.
    pub fn on_invitation_received(
        &self,
        from: &PeerIdentity,
        context: Option<&[u8]>,
    ) -> InvitationDecision {
        if from.id() == self.local.id() || self.peers.contains_key(&from.id()) {
            debug!(peer = %from, "declining invitation from self or known peer");
            return InvitationDecision::Decline;
        }
        debug!(
            peer = %from,
            context_len = context.map(<[u8]>::len).unwrap_or(0),
            "invitation received"
        );
        // Crossing invitations: exactly one side accepts, so only one link survives.
        // The lower id declines and keeps its own outbound invitation going.
        if self.is_inviting(&from.id()) {
            if self.local.id() < from.id() {
                debug!(peer = %from, "crossing invitation; declining in favour of ours");
                return InvitationDecision::Decline;
            }
            debug!(peer = %from, "crossing invitation; accepting theirs");
            return InvitationDecision::Accept;
        }
        if self.config.auto_accept {
            InvitationDecision::Accept
        } else {
            InvitationDecision::Defer
        }
    }

    /// Record an outbound invitation. False if the peer is ourselves, in the session, or already invited.
    pub fn begin_invitation(&mut self, peer: &PeerId) -> bool {
        if *peer == self.local.id() || self.peers.contains_key(peer) {
            return false;
        }
        self.outbound_invitations.insert(*peer)
    }

    pub fn finish_invitation(&mut self, peer: &PeerId) {
        self.outbound_invitations.remove(peer);
    }

    pub fn is_inviting(&self, peer: &PeerId) -> bool {
        self.outbound_invitations.contains(peer)
    }

    /// Teardown: release every link. Returns the disconnect notices.
    pub fn close(&mut self) -> Vec<Event> {
        self.advertising = false;
        self.browsing = false;
        self.outbound_invitations.clear();
        self.peers
            .drain()
            .map(|(_, conn)| Event::PeerDisconnected {
                peer: conn.identity,
            })
            .collect()
    }
}
