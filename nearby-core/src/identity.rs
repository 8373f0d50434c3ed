//! Peer identity and crypto: keypairs, peer IDs, display names, link keys, wire encryption.

use std::fmt;
use std::hash::{Hash, Hasher};

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use rand::rngs::OsRng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

/// Longest display name (in UTF-8 bytes) announced to other peers.
pub const MAX_DISPLAY_NAME_BYTES: usize = 63;

/// Name used when the device name is empty.
pub const DEFAULT_DISPLAY_NAME: &str = "Unnamed device";

/// X25519 public key as carried in beacons and hellos.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct PublicKey(#[serde(with = "key_bytes")] [u8; 32]);

mod key_bytes {
    use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(key: &[u8; 32], s: S) -> Result<S::Ok, S::Error> {
        key.as_slice().serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 32], D::Error> {
        let raw = Vec::<u8>::deserialize(d)?;
        let len = raw.len();
        raw.try_into()
            .map_err(|_| de::Error::invalid_length(len, &"a 32-byte key"))
    }
}

impl PublicKey {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

/// Opaque peer ID: truncated hash of the public key. Unique per launch since keys are ephemeral.
#[derive(Clone, Copy, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct PeerId([u8; 16]);

impl PeerId {
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        PeerId(bytes)
    }

    /// The id a given public key must present; hellos and beacons are checked against it.
    pub fn from_public_key(public: &[u8; 32]) -> Self {
        let digest = Sha256::digest(public);
        let mut id = [0u8; 16];
        id.copy_from_slice(&digest[..16]);
        PeerId(id)
    }

    /// Lowercase hex form, as shown to the shell.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// True when the hex form starts with `prefix` (case-insensitive).
    pub fn matches_prefix(&self, prefix: &str) -> bool {
        !prefix.is_empty() && self.to_hex().starts_with(&prefix.to_ascii_lowercase())
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.to_hex())
    }
}

// Hex in JSON for the shell, raw bytes on the wire.
impl Serialize for PeerId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            serializer.serialize_str(&self.to_hex())
        } else {
            self.0.as_slice().serialize(serializer)
        }
    }
}

impl<'de> Deserialize<'de> for PeerId {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let buf: Vec<u8> = if d.is_human_readable() {
            let s = String::deserialize(d)?;
            hex::decode(s).map_err(serde::de::Error::custom)?
        } else {
            Deserialize::deserialize(d)?
        };
        let bytes: [u8; 16] = buf
            .try_into()
            .map_err(|_| serde::de::Error::custom("expected 16 bytes"))?;
        Ok(PeerId(bytes))
    }
}

/// A participant: stable ID plus human-readable name. Compared by ID only; names may collide.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerIdentity {
    id: PeerId,
    display_name: String,
}

impl PeerIdentity {
    pub fn new(id: PeerId, display_name: impl Into<String>) -> Self {
        Self {
            id,
            display_name: display_name.into(),
        }
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }
}

impl PartialEq for PeerIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for PeerIdentity {}

impl Hash for PeerIdentity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.display_name, &self.id.to_hex()[..8])
    }
}

/// Per-launch X25519 keypair. The secret never leaves this struct.
pub struct Keypair {
    secret: StaticSecret,
    public_key: PublicKey,
    peer_id: PeerId,
}

impl Keypair {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public_key = PublicKey(X25519PublicKey::from(&secret).to_bytes());
        let peer_id = PeerId::from_public_key(public_key.as_bytes());
        Self {
            secret,
            public_key,
            peer_id,
        }
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// Diffie-Hellman with the remote key; input to `derive_link_keys`.
    pub fn shared_secret(&self, remote: &PublicKey) -> [u8; 32] {
        self.secret
            .diffie_hellman(&X25519PublicKey::from(remote.0))
            .to_bytes()
    }
}

/// The local participant: public identity plus the keypair backing its ID.
pub struct LocalPeer {
    identity: PeerIdentity,
    keypair: Keypair,
}

impl LocalPeer {
    pub fn identity(&self) -> &PeerIdentity {
        &self.identity
    }

    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }

    pub fn into_parts(self) -> (PeerIdentity, Keypair) {
        (self.identity, self.keypair)
    }
}

/// Create the identity for this process. Called once at startup.
pub fn generate_local_identity(device_name: &str) -> LocalPeer {
    let keypair = Keypair::generate();
    let identity = PeerIdentity::new(keypair.peer_id(), normalize_display_name(device_name));
    LocalPeer { identity, keypair }
}

/// Trim and cap a display name at `MAX_DISPLAY_NAME_BYTES` on a char boundary.
pub fn normalize_display_name(name: &str) -> String {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return DEFAULT_DISPLAY_NAME.to_string();
    }
    let mut end = trimmed.len().min(MAX_DISPLAY_NAME_BYTES);
    while !trimmed.is_char_boundary(end) {
        end -= 1;
    }
    trimmed[..end].to_string()
}

/// Which end of a link this side is. Decides which derived key is used for sending.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkRole {
    /// Sent the invitation (browser side).
    Initiator,
    /// Accepted the connection (advertiser side).
    Acceptor,
}

/// Per-direction keys for one link. Each direction has its own key so nonce counters never collide.
#[derive(Clone)]
pub struct LinkKeys {
    pub send: [u8; 32],
    pub recv: [u8; 32],
}

/// Derive the pair of link keys from an X25519 shared secret.
pub fn derive_link_keys(shared_secret: &[u8; 32], role: LinkRole) -> LinkKeys {
    let to_acceptor = direction_key(shared_secret, 0);
    let to_initiator = direction_key(shared_secret, 1);
    match role {
        LinkRole::Initiator => LinkKeys {
            send: to_acceptor,
            recv: to_initiator,
        },
        LinkRole::Acceptor => LinkKeys {
            send: to_initiator,
            recv: to_acceptor,
        },
    }
}

fn direction_key(shared_secret: &[u8; 32], direction: u8) -> [u8; 32] {
    Sha256::new()
        .chain_update(b"nearby-link-v1")
        .chain_update([direction])
        .chain_update(shared_secret)
        .finalize()
        .into()
}

/// Seal one link frame with ChaCha20-Poly1305. `seq` is the sender's frame counter for this key.
pub fn encrypt_wire(key: &[u8; 32], seq: u64, plaintext: &[u8]) -> Result<Vec<u8>, WireCryptoError> {
    link_cipher(key)?
        .encrypt(&frame_nonce(seq), plaintext)
        .map_err(|_| WireCryptoError::Encrypt)
}

/// Open one link frame. Fails on tampering, a wrong key or an out-of-step counter.
pub fn decrypt_wire(key: &[u8; 32], seq: u64, ciphertext: &[u8]) -> Result<Vec<u8>, WireCryptoError> {
    link_cipher(key)?
        .decrypt(&frame_nonce(seq), ciphertext)
        .map_err(|_| WireCryptoError::Decrypt)
}

fn link_cipher(key: &[u8; 32]) -> Result<ChaCha20Poly1305, WireCryptoError> {
    ChaCha20Poly1305::new_from_slice(key).map_err(|_| WireCryptoError::Key)
}

/// 96-bit nonce: four zero bytes, then the counter little-endian.
fn frame_nonce(seq: u64) -> Nonce {
    let mut nonce = Nonce::default();
    nonce[4..].copy_from_slice(&seq.to_le_bytes());
    nonce
}

#[derive(Debug, thiserror::Error)]
pub enum WireCryptoError {
    #[error("bad link key")]
    Key,
    #[error("could not seal frame")]
    Encrypt,
    #[error("frame failed authentication")]
    Decrypt,
}
