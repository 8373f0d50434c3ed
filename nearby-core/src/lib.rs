//! Nearby peer session and discovery engine.
//! Host-driven: no I/O; host passes transport events in and performs the sends it is asked for.

pub mod codec;
pub mod event;
pub mod identity;
pub mod namespace;
pub mod nearby;
pub mod protocol;
pub mod session;
pub mod wire;

pub use codec::{DecodeError, EncodeError};
pub use event::{Event, Operation};
pub use identity::{generate_local_identity, Keypair, LocalPeer, PeerId, PeerIdentity, PublicKey};
pub use namespace::{NamespaceError, ServiceType};
pub use nearby::{NearbyPeer, NearbyPeers, ResolveError};
pub use protocol::{Message, PROTOCOL_VERSION};
pub use session::{
    ConnectedPeers, InvitationDecision, Link, PeerState, SendError, SendResult, Session,
    SessionConfig, Transition,
};
pub use wire::{decode_frame, encode_frame, FrameDecodeError, FrameEncodeError};
