//! Transport errors. None of these are fatal to the process; the engine reports them to the shell.

use nearby_core::identity::WireCryptoError;
use nearby_core::{FrameDecodeError, FrameEncodeError};

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The local network interface could not be used (bind, multicast join, first send).
    #[error("network unavailable: {0}")]
    Unavailable(#[source] std::io::Error),
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("link crypto: {0}")]
    Crypto(#[from] WireCryptoError),
    #[error("frame encode: {0}")]
    Encode(#[from] FrameEncodeError),
    #[error("frame decode: {0}")]
    Decode(#[from] FrameDecodeError),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}
