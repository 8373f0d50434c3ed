//! Browser: listen for beacons under the service type and send invitations to nearby advertisers.

use std::future::Future;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use nearby_core::identity::LinkRole;
use nearby_core::wire::decode_frame;
use nearby_core::{LocalPeer, Message, PeerId, PeerIdentity, ServiceType, PROTOCOL_VERSION};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::engine::{EngineEvent, EngineSettings};
use crate::error::TransportError;
use crate::link;
use crate::tasks::TaskSet;

/// How an outbound invitation ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InviteOutcome {
    Accepted,
    Declined,
    TimedOut,
    Failed(String),
}

/// Running browser. Dropping it aborts the receive task.
pub struct BrowseHandle {
    tasks: TaskSet,
}

impl BrowseHandle {
    /// Leave the multicast group; the socket is closed when this returns. Idempotent.
    pub async fn stop(&mut self) {
        self.tasks.shutdown().await;
    }
}

/// Join the discovery group and forward matching beacons to the engine.
pub async fn start(
    settings: &EngineSettings,
    local_id: PeerId,
    events: mpsc::UnboundedSender<EngineEvent>,
) -> Result<BrowseHandle, TransportError> {
    let socket = multicast_socket(settings.multicast_group, settings.discovery_port)
        .map_err(TransportError::Unavailable)?;
    info!(
        group = %settings.multicast_group,
        port = settings.discovery_port,
        service_type = %settings.service_type,
        "browsing"
    );
    let mut tasks = TaskSet::default();
    tasks.spawn(recv_loop(
        socket,
        settings.service_type.clone(),
        local_id,
        events,
    ));
    Ok(BrowseHandle { tasks })
}

fn multicast_socket(group: Ipv4Addr, port: u16) -> std::io::Result<UdpSocket> {
    let std_sock = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port))?;
    std_sock.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)?;
    std_sock.set_multicast_loop_v4(true)?;
    std_sock.set_nonblocking(true)?;
    UdpSocket::from_std(std_sock)
}

async fn recv_loop(
    socket: UdpSocket,
    service_type: ServiceType,
    local_id: PeerId,
    events: mpsc::UnboundedSender<EngineEvent>,
) {
    let mut buf = vec![0u8; 65536];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((n, from)) => {
                let Some((peer, listen_port)) = parse_beacon(&buf[..n], &service_type, local_id)
                else {
                    continue;
                };
                let addr = SocketAddr::new(from.ip(), listen_port);
                if events.send(EngineEvent::Beacon { peer, addr }).is_err() {
                    return;
                }
            }
            Err(e) => {
                warn!(error = %e, "discovery receive failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

/// A beacon worth reporting: current protocol, same service type, not ours, id bound to its key.
pub(crate) fn parse_beacon(
    bytes: &[u8],
    service_type: &ServiceType,
    local_id: PeerId,
) -> Option<(PeerIdentity, u16)> {
    let (msg, _) = decode_frame(bytes).ok()?;
    let Message::Beacon {
        protocol_version,
        service_type: advertised,
        peer,
        public_key,
        listen_port,
    } = msg
    else {
        return None;
    };
    if protocol_version != PROTOCOL_VERSION || advertised != *service_type {
        return None;
    }
    if peer.id() == local_id {
        return None;
    }
    if PeerId::from_public_key(public_key.as_bytes()) != peer.id() {
        trace!(peer = %peer, "beacon id does not match key");
        return None;
    }
    Some((peer, listen_port))
}

/// Invite the advertiser at `addr` and report the outcome to the engine.
pub async fn invite(
    addr: SocketAddr,
    expected: PeerIdentity,
    local: Arc<LocalPeer>,
    context: Option<Vec<u8>>,
    timeout: Duration,
    events: mpsc::UnboundedSender<EngineEvent>,
) {
    let peer = expected.clone();
    let outcome = invite_over(
        TcpStream::connect(addr),
        expected,
        local,
        context,
        timeout,
        events.clone(),
    )
    .await;
    debug!(peer = %peer, %addr, ?outcome, "invitation finished");
    let _ = events.send(EngineEvent::InvitationFinished { peer, outcome });
}

/// Connect, handshake, invite, and wait for the answer, all within `timeout`.
pub(crate) async fn invite_over<F, S>(
    connect: F,
    expected: PeerIdentity,
    local: Arc<LocalPeer>,
    context: Option<Vec<u8>>,
    timeout: Duration,
    events: mpsc::UnboundedSender<EngineEvent>,
) -> InviteOutcome
where
    F: Future<Output = std::io::Result<S>>,
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let attempt = async {
        let mut stream = connect.await?;
        let hs = link::handshake(&mut stream, &local, LinkRole::Initiator).await?;
        if hs.peer.id() != expected.id() {
            return Err(TransportError::Handshake(format!(
                "expected {}, reached {}",
                expected, hs.peer
            )));
        }
        let (mut reader, mut writer) = link::seal(stream, hs.keys);
        writer.send(&Message::Invite { context }).await?;
        match reader.recv().await? {
            Message::InviteResponse { accepted } => {
                Ok::<_, TransportError>((hs.peer, accepted, reader, writer))
            }
            _ => Err(TransportError::Handshake("expected invite response".into())),
        }
    };
    match tokio::time::timeout(timeout, attempt).await {
        Err(_) => InviteOutcome::TimedOut,
        Ok(Err(e)) => InviteOutcome::Failed(e.to_string()),
        Ok(Ok((_, false, _, writer))) => {
            writer.close().await;
            InviteOutcome::Declined
        }
        Ok(Ok((peer, true, reader, writer))) => {
            link::establish(peer, reader, writer, events);
            InviteOutcome::Accepted
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nearby_core::generate_local_identity;
    use nearby_core::wire::encode_frame;

    fn beacon_from(local: &LocalPeer, service_type: &str) -> Vec<u8> {
        encode_frame(&Message::Beacon {
            protocol_version: PROTOCOL_VERSION,
            service_type: ServiceType::new(service_type).unwrap(),
            peer: local.identity().clone(),
            public_key: local.keypair().public_key().clone(),
            listen_port: 4242,
        })
        .unwrap()
    }

    #[test]
    fn beacon_under_same_service_type_is_reported() {
        let me = generate_local_identity("Me");
        let bob = generate_local_identity("Bob");
        let st = ServiceType::new("my-app").unwrap();
        let (peer, port) = parse_beacon(&beacon_from(&bob, "my-app"), &st, me.identity().id())
            .expect("beacon accepted");
        assert_eq!(peer, *bob.identity());
        assert_eq!(port, 4242);
    }

    #[test]
    fn other_service_type_is_ignored() {
        let me = generate_local_identity("Me");
        let bob = generate_local_identity("Bob");
        let st = ServiceType::new("my-app").unwrap();
        assert!(parse_beacon(&beacon_from(&bob, "other-app"), &st, me.identity().id()).is_none());
    }

    #[test]
    fn own_beacon_is_ignored() {
        let me = generate_local_identity("Me");
        let st = ServiceType::new("my-app").unwrap();
        assert!(parse_beacon(&beacon_from(&me, "my-app"), &st, me.identity().id()).is_none());
    }

    #[test]
    fn forged_or_garbled_beacon_is_ignored() {
        let me = generate_local_identity("Me");
        let bob = generate_local_identity("Bob");
        let mallory = generate_local_identity("Mallory");
        let st = ServiceType::new("my-app").unwrap();
        let forged = encode_frame(&Message::Beacon {
            protocol_version: PROTOCOL_VERSION,
            service_type: st.clone(),
            peer: bob.identity().clone(),
            public_key: mallory.keypair().public_key().clone(),
            listen_port: 1,
        })
        .unwrap();
        assert!(parse_beacon(&forged, &st, me.identity().id()).is_none());
        assert!(parse_beacon(b"\x03\x00\x00\x00abc", &st, me.identity().id()).is_none());
    }

    #[tokio::test]
    async fn unreachable_advertiser_fails() {
        let me = Arc::new(generate_local_identity("Me"));
        let bob = generate_local_identity("Bob");
        let (tx, _rx) = mpsc::unbounded_channel();
        let outcome = invite_over(
            async {
                Err::<tokio::io::DuplexStream, _>(std::io::Error::from(
                    std::io::ErrorKind::ConnectionRefused,
                ))
            },
            bob.identity().clone(),
            me,
            None,
            Duration::from_secs(1),
            tx,
        )
        .await;
        assert!(matches!(outcome, InviteOutcome::Failed(_)));
    }
}
