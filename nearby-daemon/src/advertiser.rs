//! Advertiser: multicast beacons under the service type, plus a TCP listener where inbound
//! invitations arrive and are arbitrated by the engine.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use nearby_core::identity::LinkRole;
use nearby_core::{encode_frame, LocalPeer, Message, PROTOCOL_VERSION};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::engine::{EngineEvent, EngineSettings};
use crate::error::TransportError;
use crate::link;
use crate::tasks::TaskSet;

/// Running advertiser. Dropping it aborts the beacon and accept tasks.
pub struct AdvertiseHandle {
    port: u16,
    tasks: TaskSet,
}

impl AdvertiseHandle {
    /// TCP port taking invitations.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Stop beacons and the listener; sockets are closed when this returns. Idempotent.
    pub async fn stop(&mut self) {
        self.tasks.shutdown().await;
    }
}

/// Bind the invitation listener, send the first beacon, then keep both going in the background.
/// Any socket acquired before a failure is dropped on return.
pub async fn start(
    settings: &EngineSettings,
    local: Arc<LocalPeer>,
    events: mpsc::UnboundedSender<EngineEvent>,
) -> Result<AdvertiseHandle, TransportError> {
    let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, settings.transport_port))
        .await
        .map_err(TransportError::Unavailable)?;
    let port = listener
        .local_addr()
        .map_err(TransportError::Unavailable)?
        .port();

    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
        .await
        .map_err(TransportError::Unavailable)?;
    socket
        .set_multicast_ttl_v4(1)
        .map_err(TransportError::Unavailable)?;
    let beacon = encode_frame(&Message::Beacon {
        protocol_version: PROTOCOL_VERSION,
        service_type: settings.service_type.clone(),
        peer: local.identity().clone(),
        public_key: local.keypair().public_key().clone(),
        listen_port: port,
    })?;
    let dest = SocketAddr::V4(SocketAddrV4::new(
        settings.multicast_group,
        settings.discovery_port,
    ));
    socket
        .send_to(&beacon, dest)
        .await
        .map_err(TransportError::Unavailable)?;
    info!(port, service_type = %settings.service_type, "advertising");

    let mut tasks = TaskSet::default();
    tasks.spawn(beacon_loop(socket, beacon, dest, settings.beacon_interval));
    tasks.spawn(accept_loop(
        listener,
        local,
        events,
        settings.answer_timeout,
    ));
    Ok(AdvertiseHandle { port, tasks })
}

async fn beacon_loop(socket: UdpSocket, beacon: Vec<u8>, dest: SocketAddr, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    // First beacon went out in `start`.
    ticker.tick().await;
    loop {
        ticker.tick().await;
        if let Err(e) = socket.send_to(&beacon, dest).await {
            warn!(error = %e, "beacon send failed");
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    local: Arc<LocalPeer>,
    events: mpsc::UnboundedSender<EngineEvent>,
    answer_timeout: Duration,
) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                debug!(%addr, "inbound connection");
                tokio::spawn(handle_inbound(
                    stream,
                    local.clone(),
                    events.clone(),
                    answer_timeout,
                ));
            }
            Err(e) => {
                warn!(error = %e, "accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

/// Handshake, read the invitation, ask the engine, answer, and on accept hand the link over.
/// The whole exchange, the engine's decision included, must finish within `budget`.
pub(crate) async fn handle_inbound<S>(
    stream: S,
    local: Arc<LocalPeer>,
    events: mpsc::UnboundedSender<EngineEvent>,
    budget: Duration,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let deadline = tokio::time::Instant::now() + budget;
    let opened = tokio::time::timeout_at(deadline, async move {
        let mut stream = stream;
        let hs = link::handshake(&mut stream, &local, LinkRole::Acceptor).await?;
        let (mut reader, writer) = link::seal(stream, hs.keys);
        match reader.recv().await? {
            Message::Invite { context } => Ok::<_, TransportError>((hs.peer, context, reader, writer)),
            _ => Err(TransportError::Handshake("expected invite".into())),
        }
    })
    .await;
    let (peer, context, reader, mut writer) = match opened {
        Ok(Ok(opened)) => opened,
        Ok(Err(e)) => {
            debug!(error = %e, "inbound invitation failed");
            return;
        }
        Err(_) => {
            debug!("inbound invitation timed out");
            return;
        }
    };

    let (reply, answer) = oneshot::channel();
    let asked = events.send(EngineEvent::InvitationReceived {
        from: peer.clone(),
        context,
        reply,
    });
    if asked.is_err() {
        return;
    }
    // A dropped reply (engine gone, invitation expired) counts as a decline, and so does
    // running out of budget. Giving up drops `answer`, which the engine sees as closed.
    let accepted = match tokio::time::timeout_at(deadline, answer).await {
        Ok(answer) => answer.unwrap_or(false),
        Err(_) => {
            debug!(peer = %peer, "no answer in time; declining");
            false
        }
    };
    if let Err(e) = writer.send(&Message::InviteResponse { accepted }).await {
        debug!(peer = %peer, error = %e, "could not answer invitation");
        return;
    }
    if accepted {
        link::establish(peer, reader, writer, events);
    } else {
        writer.close().await;
    }
}
