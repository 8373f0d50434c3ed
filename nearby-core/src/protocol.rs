//! Nearby wire protocol: message types and version.

use serde::{Deserialize, Serialize};

use crate::identity::{PeerIdentity, PublicKey};
use crate::namespace::ServiceType;

/// Current protocol version. Used in beacon and handshake.
pub const PROTOCOL_VERSION: u8 = 1;

/// All wire message types. Encoding is bincode; framing is length-prefix (see wire module).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    /// Discovery datagram: advertise presence under a service type and the TCP port taking invitations.
    Beacon {
        protocol_version: u8,
        service_type: ServiceType,
        peer: PeerIdentity,
        public_key: PublicKey,
        listen_port: u16,
    },
    /// First frame on a link, sent in the clear by both sides.
    Hello {
        protocol_version: u8,
        peer: PeerIdentity,
        public_key: PublicKey,
    },
    /// Ask the advertiser to join its session. Optional opaque context from the inviter.
    Invite { context: Option<Vec<u8>> },
    /// Advertiser's decision on an invitation.
    InviteResponse { accepted: bool },
    /// Application message: a codec frame.
    Payload(Vec<u8>),
}
