//! Notifications for the shell. The shell decides how to present them.

use serde::Serialize;

use crate::identity::PeerIdentity;
use crate::namespace::ServiceType;
use crate::session::ConnectedPeers;

/// Background activity that could not acquire the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Advertise,
    Browse,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    AdvertisingStarted {
        service_type: ServiceType,
        port: u16,
    },
    AdvertisingStopped,
    BrowsingStarted {
        service_type: ServiceType,
    },
    BrowsingStopped,
    TransportUnavailable {
        operation: Operation,
        reason: String,
    },
    /// An advertiser showed up under our service type. Not a session peer yet.
    PeerFound {
        peer: PeerIdentity,
    },
    PeerLost {
        peer: PeerIdentity,
    },
    /// Inbound invitation waiting for `accept`/`decline` from the shell.
    InvitationPending {
        from: PeerIdentity,
    },
    /// We accepted an inbound invitation.
    InvitationAccepted {
        from: PeerIdentity,
    },
    /// We turned down an inbound invitation.
    InvitationRejected {
        from: PeerIdentity,
    },
    /// Our invitation was turned down by the remote peer.
    InvitationDeclined {
        peer: PeerIdentity,
    },
    InvitationTimedOut {
        peer: PeerIdentity,
    },
    /// Invitation never reached a decision (connect or handshake error).
    InvitationFailed {
        peer: PeerIdentity,
        reason: String,
    },
    PeerConnecting {
        peer: PeerIdentity,
    },
    PeerConnected {
        peer: PeerIdentity,
    },
    PeerDisconnected {
        peer: PeerIdentity,
    },
    MessageReceived {
        from: PeerIdentity,
        text: String,
    },
    /// A payload from `from` could not be decoded; dropped, link kept.
    DecodeFailed {
        from: PeerIdentity,
        reason: String,
    },
    MessageSent {
        delivered: Vec<PeerIdentity>,
    },
    SendFailed {
        peer: PeerIdentity,
        reason: String,
    },
    ConnectedPeers {
        peers: ConnectedPeers,
        summary: String,
    },
    NearbyPeers {
        peers: Vec<PeerIdentity>,
    },
    CommandRejected {
        reason: String,
    },
}

impl Event {
    pub fn connected_peers(peers: ConnectedPeers) -> Self {
        let summary = peers.to_string();
        Event::ConnectedPeers { peers, summary }
    }
}
