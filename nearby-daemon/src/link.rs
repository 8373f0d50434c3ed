//! Links: plaintext hello exchange, then encrypted length-prefixed frames in both directions.

use std::sync::atomic::{AtomicU64, Ordering};

use nearby_core::identity::{decrypt_wire, derive_link_keys, encrypt_wire, LinkKeys, LinkRole};
use nearby_core::wire::{body_len, decode_body, encode_body, encode_frame, frame, LEN_SIZE};
use nearby_core::{
    Link, LocalPeer, Message, PeerId, PeerIdentity, SendError, Transition, PROTOCOL_VERSION,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;
use tracing::{debug, trace};

use crate::engine::EngineEvent;
use crate::error::TransportError;

static NEXT_LINK_ID: AtomicU64 = AtomicU64::new(1);

/// Distinguishes successive links to the same peer, so late events from a dead link are ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LinkId(u64);

impl LinkId {
    fn next() -> Self {
        LinkId(NEXT_LINK_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Transport handle leased to the session. Dropping it closes the link.
pub struct LinkHandle {
    id: LinkId,
    tx: mpsc::UnboundedSender<Vec<u8>>,
    reader: Option<AbortHandle>,
}

impl LinkHandle {
    pub fn id(&self) -> LinkId {
        self.id
    }

    /// A handle with no reader task behind it; frames go straight to `tx`.
    #[cfg(test)]
    pub(crate) fn detached(tx: mpsc::UnboundedSender<Vec<u8>>) -> Self {
        Self {
            id: LinkId::next(),
            tx,
            reader: None,
        }
    }
}

impl Link for LinkHandle {
    fn send(&self, frame: &[u8]) -> Result<(), SendError> {
        self.tx
            .send(frame.to_vec())
            .map_err(|_| SendError::LinkClosed)
    }
}

impl Drop for LinkHandle {
    fn drop(&mut self) {
        if let Some(reader) = &self.reader {
            reader.abort();
        }
    }
}

/// Result of a successful hello exchange.
pub struct Handshake {
    pub peer: PeerIdentity,
    pub keys: LinkKeys,
}

/// Exchange hellos and derive link keys. Both sides send first, then read.
pub async fn handshake<S>(
    stream: &mut S,
    local: &LocalPeer,
    role: LinkRole,
) -> Result<Handshake, TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let hello = Message::Hello {
        protocol_version: PROTOCOL_VERSION,
        peer: local.identity().clone(),
        public_key: local.keypair().public_key().clone(),
    };
    stream.write_all(&encode_frame(&hello)?).await?;
    stream.flush().await?;

    let body = read_chunk(stream).await?;
    match decode_body(&body)? {
        Message::Hello {
            protocol_version,
            peer,
            public_key,
        } => {
            if protocol_version != PROTOCOL_VERSION {
                return Err(TransportError::Handshake(format!(
                    "unsupported protocol version {protocol_version}"
                )));
            }
            if PeerId::from_public_key(public_key.as_bytes()) != peer.id() {
                return Err(TransportError::Handshake(
                    "peer id does not match public key".into(),
                ));
            }
            if peer.id() == local.identity().id() {
                return Err(TransportError::Handshake("connected to self".into()));
            }
            let secret = local.keypair().shared_secret(&public_key);
            Ok(Handshake {
                peer,
                keys: derive_link_keys(&secret, role),
            })
        }
        _ => Err(TransportError::Handshake("expected hello".into())),
    }
}

/// Split a stream into encrypted halves.
pub fn seal<S>(stream: S, keys: LinkKeys) -> (SealedReader<ReadHalf<S>>, SealedWriter<WriteHalf<S>>)
where
    S: AsyncRead + AsyncWrite,
{
    let (r, w) = tokio::io::split(stream);
    (
        SealedReader {
            inner: r,
            key: keys.recv,
            nonce: 0,
        },
        SealedWriter {
            inner: w,
            key: keys.send,
            nonce: 0,
        },
    )
}

pub struct SealedReader<R> {
    inner: R,
    key: [u8; 32],
    nonce: u64,
}

impl<R: AsyncRead + Unpin> SealedReader<R> {
    pub async fn recv(&mut self) -> Result<Message, TransportError> {
        let cipher = read_chunk(&mut self.inner).await?;
        let plain = decrypt_wire(&self.key, self.nonce, &cipher)?;
        self.nonce = self.nonce.saturating_add(1);
        Ok(decode_body(&plain)?)
    }
}

pub struct SealedWriter<W> {
    inner: W,
    key: [u8; 32],
    nonce: u64,
}

impl<W: AsyncWrite + Unpin> SealedWriter<W> {
    pub async fn send(&mut self, msg: &Message) -> Result<(), TransportError> {
        let plain = encode_body(msg)?;
        let cipher = encrypt_wire(&self.key, self.nonce, &plain)?;
        self.nonce = self.nonce.saturating_add(1);
        self.inner.write_all(&frame(&cipher)).await?;
        self.inner.flush().await?;
        Ok(())
    }

    pub async fn close(mut self) {
        let _ = self.inner.shutdown().await;
    }
}

/// Hand an established link to the engine: reports `connecting` then `connected`, then pumps
/// payloads until either side closes, then reports `disconnected`.
pub fn establish<R, W>(
    peer: PeerIdentity,
    mut reader: SealedReader<R>,
    mut writer: SealedWriter<W>,
    events: mpsc::UnboundedSender<EngineEvent>,
) where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let id = LinkId::next();
    let peer_id = peer.id();
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
    // Reader waits until the engine has seen `connecting`, so no payload overtakes it.
    let (go_tx, go_rx) = oneshot::channel::<()>();

    let reader_events = events.clone();
    let reader_peer = peer.clone();
    let reader_task = tokio::spawn(async move {
        if go_rx.await.is_err() {
            return;
        }
        loop {
            match reader.recv().await {
                Ok(Message::Payload(payload)) => {
                    let ev = EngineEvent::Data {
                        peer: peer_id,
                        link: id,
                        payload,
                    };
                    if reader_events.send(ev).is_err() {
                        return;
                    }
                }
                Ok(_) => trace!(peer = %peer_id, "ignoring non-payload frame"),
                Err(e) => {
                    debug!(peer = %peer_id, error = %e, "link read ended");
                    break;
                }
            }
        }
        let _ = reader_events.send(EngineEvent::LinkState {
            peer: reader_peer,
            link: id,
            transition: Transition::Disconnected,
        });
    });

    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if let Err(e) = writer.send(&Message::Payload(frame)).await {
                debug!(peer = %peer_id, error = %e, "link write failed");
                break;
            }
        }
        writer.close().await;
    });

    let handle = LinkHandle {
        id,
        tx,
        reader: Some(reader_task.abort_handle()),
    };
    let _ = events.send(EngineEvent::LinkState {
        peer: peer.clone(),
        link: id,
        transition: Transition::Connecting(handle),
    });
    let _ = events.send(EngineEvent::LinkState {
        peer,
        link: id,
        transition: Transition::Connected,
    });
    let _ = go_tx.send(());
}

/// Read one frame body; the header is checked against the cap before allocating.
async fn read_chunk<R: AsyncRead + Unpin>(r: &mut R) -> Result<Vec<u8>, TransportError> {
    let mut header = [0u8; LEN_SIZE];
    r.read_exact(&mut header).await?;
    let mut body = vec![0u8; body_len(header)?];
    r.read_exact(&mut body).await?;
    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nearby_core::generate_local_identity;

    #[tokio::test]
    async fn handshake_then_sealed_frames() {
        let alice = generate_local_identity("Alice");
        let bob = generate_local_identity("Bob");
        let (mut a, mut b) = tokio::io::duplex(4096);

        let (ha, hb) = tokio::join!(
            handshake(&mut a, &alice, LinkRole::Initiator),
            handshake(&mut b, &bob, LinkRole::Acceptor)
        );
        let (ha, hb) = (ha.unwrap(), hb.unwrap());
        assert_eq!(ha.peer, *bob.identity());
        assert_eq!(hb.peer.display_name(), "Alice");

        let (_ra, mut wa) = seal(a, ha.keys);
        let (mut rb, _wb) = seal(b, hb.keys);
        wa.send(&Message::Payload(b"one".to_vec())).await.unwrap();
        wa.send(&Message::Payload(b"two".to_vec())).await.unwrap();
        assert!(matches!(rb.recv().await.unwrap(), Message::Payload(p) if p == b"one"));
        assert!(matches!(rb.recv().await.unwrap(), Message::Payload(p) if p == b"two"));
    }

    #[tokio::test]
    async fn handshake_rejects_forged_id() {
        let bob = generate_local_identity("Bob");
        let mallory = generate_local_identity("Mallory");
        let (mut a, mut b) = tokio::io::duplex(4096);

        // Claims Bob's id with Mallory's key.
        let forged = Message::Hello {
            protocol_version: PROTOCOL_VERSION,
            peer: bob.identity().clone(),
            public_key: mallory.keypair().public_key().clone(),
        };
        a.write_all(&encode_frame(&forged).unwrap()).await.unwrap();
        let result = handshake(&mut b, &bob, LinkRole::Acceptor).await;
        assert!(matches!(result, Err(TransportError::Handshake(_))));
    }

    #[tokio::test]
    async fn tampered_frame_fails_decrypt() {
        let alice = generate_local_identity("Alice");
        let bob = generate_local_identity("Bob");
        let shared = alice.keypair().shared_secret(bob.keypair().public_key());
        let keys = derive_link_keys(&shared, LinkRole::Initiator);
        let (a, mut b) = tokio::io::duplex(4096);
        let (_r, mut w) = seal(a, keys.clone());
        w.send(&Message::Payload(b"secret".to_vec())).await.unwrap();

        let mut raw = vec![0u8; 4096];
        let n = b.read(&mut raw).await.unwrap();
        raw.truncate(n);
        let last = raw.len() - 1;
        raw[last] ^= 0x01;

        let (c, mut d) = tokio::io::duplex(4096);
        d.write_all(&raw).await.unwrap();
        let peer_keys = derive_link_keys(
            &bob.keypair().shared_secret(alice.keypair().public_key()),
            LinkRole::Acceptor,
        );
        let (mut reader, _w) = seal(c, peer_keys);
        assert!(matches!(reader.recv().await, Err(TransportError::Crypto(_))));
    }

    #[tokio::test]
    async fn established_link_reports_lifecycle() {
        let alice = generate_local_identity("Alice");
        let bob = generate_local_identity("Bob");
        let shared = alice.keypair().shared_secret(bob.keypair().public_key());
        let (a, b) = tokio::io::duplex(4096);
        let (ra, wa) = seal(a, derive_link_keys(&shared, LinkRole::Initiator));
        let (mut rb, mut wb) = seal(b, derive_link_keys(&shared, LinkRole::Acceptor));

        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        establish(bob.identity().clone(), ra, wa, events_tx);

        let handle = match events_rx.recv().await.unwrap() {
            EngineEvent::LinkState {
                transition: Transition::Connecting(handle),
                ..
            } => handle,
            _ => panic!("expected connecting"),
        };
        assert!(matches!(
            events_rx.recv().await.unwrap(),
            EngineEvent::LinkState {
                transition: Transition::Connected,
                ..
            }
        ));

        handle.send(b"out").unwrap();
        assert!(matches!(rb.recv().await.unwrap(), Message::Payload(p) if p == b"out"));

        wb.send(&Message::Payload(b"in".to_vec())).await.unwrap();
        match events_rx.recv().await.unwrap() {
            EngineEvent::Data { payload, link, .. } => {
                assert_eq!(payload, b"in");
                assert_eq!(link, handle.id());
            }
            _ => panic!("expected data"),
        }

        wb.close().await;
        drop(rb);
        assert!(matches!(
            events_rx.recv().await.unwrap(),
            EngineEvent::LinkState {
                transition: Transition::Disconnected,
                ..
            }
        ));
    }
}
