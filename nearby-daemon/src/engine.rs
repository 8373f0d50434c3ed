//! Single-owner dispatch loop. Owns the session; every network task reports here over a channel,
//! so peer-set reads and mutations never race.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use nearby_core::nearby;
use nearby_core::{
    Event, InvitationDecision, LocalPeer, NearbyPeers, Operation, PeerId, PeerIdentity,
    ServiceType, Session, SessionConfig, Transition,
};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::advertiser::{self, AdvertiseHandle};
use crate::browser::{self, BrowseHandle, InviteOutcome};
use crate::config::Config;
use crate::link::{LinkHandle, LinkId};

/// Shell commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    StartAdvertising,
    StopAdvertising,
    StartBrowsing,
    StopBrowsing,
    /// Invite a nearby peer (display name or id prefix).
    Invite(String),
    /// Answer a pending inbound invitation.
    Accept(String),
    Decline(String),
    Send(String),
    ListPeers,
    ListNearby,
    Shutdown,
}

/// Reports from network tasks.
pub enum EngineEvent {
    Beacon {
        peer: PeerIdentity,
        addr: SocketAddr,
    },
    InvitationReceived {
        from: PeerIdentity,
        context: Option<Vec<u8>>,
        reply: oneshot::Sender<bool>,
    },
    InvitationFinished {
        peer: PeerIdentity,
        outcome: InviteOutcome,
    },
    LinkState {
        peer: PeerIdentity,
        link: LinkId,
        transition: Transition<LinkHandle>,
    },
    Data {
        peer: PeerId,
        link: LinkId,
        payload: Vec<u8>,
    },
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub service_type: ServiceType,
    pub multicast_group: Ipv4Addr,
    pub discovery_port: u16,
    /// 0 picks an ephemeral port; the chosen one goes into beacons.
    pub transport_port: u16,
    pub beacon_interval: Duration,
    pub invite_timeout: Duration,
    /// How long an inbound invitation may wait for an answer. Kept below `invite_timeout`,
    /// whose clock started earlier on the inviting side, so the inviter is still listening.
    pub answer_timeout: Duration,
    /// Beacon-interval ticks before a silent nearby peer is dropped.
    pub peer_timeout_ticks: u64,
}

impl From<&Config> for EngineSettings {
    fn from(c: &Config) -> Self {
        let beacon_secs = c.beacon_interval_secs.max(1);
        let invite_timeout = Duration::from_secs(c.invite_timeout_secs.max(1));
        Self {
            service_type: c.service_type.clone(),
            multicast_group: c.multicast_group,
            discovery_port: c.discovery_port,
            transport_port: c.transport_port,
            beacon_interval: Duration::from_secs(beacon_secs),
            invite_timeout,
            answer_timeout: invite_timeout * 3 / 4,
            peer_timeout_ticks: c.peer_timeout_secs.div_ceil(beacon_secs).max(1),
        }
    }
}

/// Inbound invitation waiting on the shell.
struct PendingInvitation {
    from: PeerIdentity,
    reply: oneshot::Sender<bool>,
    deadline: Instant,
}

pub struct Engine {
    settings: EngineSettings,
    local: Arc<LocalPeer>,
    session: Session<LinkHandle>,
    nearby: NearbyPeers,
    advertiser: Option<AdvertiseHandle>,
    browser: Option<BrowseHandle>,
    pending: HashMap<PeerId, PendingInvitation>,
    events_tx: mpsc::UnboundedSender<EngineEvent>,
    events_rx: mpsc::UnboundedReceiver<EngineEvent>,
    shell: mpsc::UnboundedSender<Event>,
}

impl Engine {
    pub fn new(
        settings: EngineSettings,
        local: LocalPeer,
        session_config: SessionConfig,
        shell: mpsc::UnboundedSender<Event>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let session = Session::new(local.identity().clone(), session_config);
        let nearby = NearbyPeers::new(settings.peer_timeout_ticks);
        Self {
            settings,
            local: Arc::new(local),
            session,
            nearby,
            advertiser: None,
            browser: None,
            pending: HashMap::new(),
            events_tx,
            events_rx,
            shell,
        }
    }

    /// Sender for network tasks; the engine keeps one so its receiver never closes.
    #[cfg(test)]
    pub fn event_sender(&self) -> mpsc::UnboundedSender<EngineEvent> {
        self.events_tx.clone()
    }

    /// Run until `Shutdown` or the command channel closes, then tear down.
    pub async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        let mut ticker = tokio::time::interval(self.settings.beacon_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(Command::Shutdown) | None => break,
                    Some(cmd) => self.on_command(cmd).await,
                },
                Some(ev) = self.events_rx.recv() => self.on_engine_event(ev),
                _ = ticker.tick() => self.on_tick(),
            }
        }
        self.shutdown().await;
    }

    async fn on_command(&mut self, cmd: Command) {
        debug!(?cmd, "command");
        match cmd {
            Command::StartAdvertising => self.start_advertising().await,
            Command::StopAdvertising => self.stop_advertising().await,
            Command::StartBrowsing => self.start_browsing().await,
            Command::StopBrowsing => self.stop_browsing().await,
            Command::Invite(query) => self.invite(&query),
            Command::Accept(query) => self.answer_pending(&query, true),
            Command::Decline(query) => self.answer_pending(&query, false),
            Command::Send(text) => match self.session.send_message(&text) {
                Ok(result) => {
                    for ev in result.events() {
                        self.emit(ev);
                    }
                }
                Err(e) => self.reject(e.to_string()),
            },
            Command::ListPeers => {
                let peers = self.session.list_connected_peers();
                self.emit(Event::connected_peers(peers));
            }
            Command::ListNearby => {
                let peers = self.nearby.list();
                self.emit(Event::NearbyPeers { peers });
            }
            Command::Shutdown => {}
        }
    }

    async fn start_advertising(&mut self) {
        if self.advertiser.is_some() {
            self.reject("already advertising".into());
            return;
        }
        match advertiser::start(&self.settings, self.local.clone(), self.events_tx.clone()).await {
            Ok(handle) => {
                let port = handle.port();
                self.advertiser = Some(handle);
                self.session.set_advertising(true);
                self.emit(Event::AdvertisingStarted {
                    service_type: self.settings.service_type.clone(),
                    port,
                });
            }
            Err(e) => {
                warn!(error = %e, "cannot advertise");
                self.emit(Event::TransportUnavailable {
                    operation: Operation::Advertise,
                    reason: e.to_string(),
                });
            }
        }
    }

    async fn stop_advertising(&mut self) {
        let Some(mut handle) = self.advertiser.take() else {
            return;
        };
        handle.stop().await;
        self.session.set_advertising(false);
        self.emit(Event::AdvertisingStopped);
    }

    async fn start_browsing(&mut self) {
        if self.browser.is_some() {
            self.reject("already browsing".into());
            return;
        }
        match browser::start(&self.settings, self.local.identity().id(), self.events_tx.clone())
            .await
        {
            Ok(handle) => {
                self.browser = Some(handle);
                self.session.set_browsing(true);
                self.emit(Event::BrowsingStarted {
                    service_type: self.settings.service_type.clone(),
                });
            }
            Err(e) => {
                warn!(error = %e, "cannot browse");
                self.emit(Event::TransportUnavailable {
                    operation: Operation::Browse,
                    reason: e.to_string(),
                });
            }
        }
    }

    /// In-flight invitations run on their own tasks and are unaffected.
    async fn stop_browsing(&mut self) {
        let Some(mut handle) = self.browser.take() else {
            return;
        };
        handle.stop().await;
        self.nearby.clear();
        self.session.set_browsing(false);
        self.emit(Event::BrowsingStopped);
    }

    fn invite(&mut self, query: &str) {
        let target = match self.nearby.resolve(query) {
            Ok(p) => p.clone(),
            Err(e) => {
                self.reject(e.to_string());
                return;
            }
        };
        if !self.session.begin_invitation(&target.identity.id()) {
            self.reject(format!(
                "{} is already connected or being invited",
                target.identity.display_name()
            ));
            return;
        }
        info!(peer = %target.identity, addr = %target.addr, "inviting");
        tokio::spawn(browser::invite(
            target.addr,
            target.identity,
            self.local.clone(),
            None,
            self.settings.invite_timeout,
            self.events_tx.clone(),
        ));
    }

    fn answer_pending(&mut self, query: &str, accept: bool) {
        let id = match nearby::resolve(self.pending.values().map(|p| &p.from), query) {
            Ok(p) => p.id(),
            Err(e) => {
                self.reject(e.to_string());
                return;
            }
        };
        if let Some(pending) = self.pending.remove(&id) {
            self.reply(pending.from, pending.reply, accept);
        }
    }

    fn reply(&mut self, from: PeerIdentity, reply: oneshot::Sender<bool>, accept: bool) {
        if reply.send(accept).is_err() {
            // Inviter gave up; no link will follow an accept.
            debug!(peer = %from, accept, "inviter no longer waiting");
            if accept {
                return;
            }
        }
        if accept {
            self.emit(Event::InvitationAccepted { from });
        } else {
            self.emit(Event::InvitationRejected { from });
        }
    }

    fn on_engine_event(&mut self, ev: EngineEvent) {
        match ev {
            EngineEvent::Beacon { peer, addr } => {
                if self.browser.is_none() {
                    return;
                }
                if let Some(found) = self.nearby.observe(peer, addr) {
                    self.emit(found);
                }
            }
            EngineEvent::InvitationReceived {
                from,
                context,
                reply,
            } => {
                match self.session.on_invitation_received(&from, context.as_deref()) {
                    InvitationDecision::Accept => self.reply(from, reply, true),
                    InvitationDecision::Decline => self.reply(from, reply, false),
                    InvitationDecision::Defer => {
                        if self.pending.contains_key(&from.id()) {
                            self.reply(from, reply, false);
                            return;
                        }
                        let deadline = Instant::now() + self.settings.answer_timeout;
                        self.pending.insert(
                            from.id(),
                            PendingInvitation {
                                from: from.clone(),
                                reply,
                                deadline,
                            },
                        );
                        self.emit(Event::InvitationPending { from });
                    }
                }
            }
            EngineEvent::InvitationFinished { peer, outcome } => {
                self.session.finish_invitation(&peer.id());
                match outcome {
                    InviteOutcome::Accepted => debug!(peer = %peer, "invitation accepted"),
                    InviteOutcome::Declined => self.emit(Event::InvitationDeclined { peer }),
                    InviteOutcome::TimedOut => self.emit(Event::InvitationTimedOut { peer }),
                    InviteOutcome::Failed(reason) => {
                        self.emit(Event::InvitationFailed { peer, reason })
                    }
                }
            }
            EngineEvent::LinkState {
                peer,
                link,
                transition,
            } => {
                let current = matches!(transition, Transition::Connecting(_))
                    || self.is_current_link(&peer.id(), link);
                if !current {
                    debug!(peer = %peer, ?link, "ignoring event from stale link");
                    return;
                }
                if let Some(ev) = self.session.on_peer_state_changed(&peer, transition) {
                    self.emit(ev);
                }
            }
            EngineEvent::Data {
                peer,
                link,
                payload,
            } => {
                if !self.is_current_link(&peer, link) {
                    debug!(peer = %peer, ?link, "ignoring data from stale link");
                    return;
                }
                if let Some(ev) = self.session.on_data_received(&peer, &payload) {
                    self.emit(ev);
                }
            }
        }
    }

    fn is_current_link(&self, peer: &PeerId, link: LinkId) -> bool {
        self.session
            .peer(peer)
            .map(|c| c.link().id() == link)
            .unwrap_or(false)
    }

    fn on_tick(&mut self) {
        if self.browser.is_some() {
            for ev in self.nearby.tick() {
                self.emit(ev);
            }
        }
        let now = Instant::now();
        let expired: Vec<PeerId> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline <= now || p.reply.is_closed())
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            if let Some(pending) = self.pending.remove(&id) {
                debug!(peer = %pending.from, "pending invitation expired");
                self.reply(pending.from, pending.reply, false);
            }
        }
    }

    async fn shutdown(&mut self) {
        info!("shutting down");
        self.stop_advertising().await;
        self.stop_browsing().await;
        for (_, pending) in self.pending.drain() {
            let _ = pending.reply.send(false);
        }
        for ev in self.session.close() {
            self.emit(ev);
        }
    }

    fn reject(&self, reason: String) {
        debug!(%reason, "command rejected");
        self.emit(Event::CommandRejected { reason });
    }

    fn emit(&self, event: Event) {
        let _ = self.shell.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nearby_core::{codec, generate_local_identity, Keypair};

    struct Harness {
        commands: mpsc::UnboundedSender<Command>,
        events: mpsc::UnboundedSender<EngineEvent>,
        shell: mpsc::UnboundedReceiver<Event>,
    }

    impl Harness {
        fn start(auto_accept: bool) -> Self {
            Self::start_inviting(auto_accept, generate_local_identity("Me"), None)
        }

        /// Engine for `local`, optionally with an outbound invitation to `inviting` in flight.
        fn start_inviting(auto_accept: bool, local: LocalPeer, inviting: Option<PeerId>) -> Self {
            let mut settings = EngineSettings::from(&Config::default());
            settings.beacon_interval = Duration::from_millis(50);
            let (shell_tx, shell) = mpsc::unbounded_channel();
            let mut engine = Engine::new(settings, local, SessionConfig { auto_accept }, shell_tx);
            if let Some(id) = inviting {
                assert!(engine.session.begin_invitation(&id));
            }
            let events = engine.event_sender();
            let (commands, rx) = mpsc::unbounded_channel();
            tokio::spawn(engine.run(rx));
            Self {
                commands,
                events,
                shell,
            }
        }

        async fn next(&mut self) -> Event {
            tokio::time::timeout(Duration::from_secs(5), self.shell.recv())
                .await
                .expect("engine event")
                .expect("engine running")
        }

        /// Connect `peer` over an in-memory link; returns the frames the engine sends it.
        async fn connect(&mut self, peer: &PeerIdentity) -> (LinkId, mpsc::UnboundedReceiver<Vec<u8>>) {
            let (tx, rx) = mpsc::unbounded_channel();
            let handle = LinkHandle::detached(tx);
            let link = handle.id();
            self.link_state(peer, link, Transition::Connecting(handle));
            self.link_state(peer, link, Transition::Connected);
            assert!(matches!(self.next().await, Event::PeerConnecting { .. }));
            assert!(matches!(self.next().await, Event::PeerConnected { .. }));
            (link, rx)
        }

        fn link_state(&self, peer: &PeerIdentity, link: LinkId, transition: Transition<LinkHandle>) {
            let _ = self.events.send(EngineEvent::LinkState {
                peer: peer.clone(),
                link,
                transition,
            });
        }

        async fn connected_names(&mut self) -> (Vec<String>, String) {
            self.commands.send(Command::ListPeers).unwrap();
            match self.next().await {
                Event::ConnectedPeers { peers, summary } => (peers.names().to_vec(), summary),
                other => panic!("expected ConnectedPeers, got {other:?}"),
            }
        }
    }

    fn peer(name: &str) -> PeerIdentity {
        PeerIdentity::new(Keypair::generate().peer_id(), name)
    }

    #[tokio::test]
    async fn auto_accepts_invitation() {
        let mut h = Harness::start(true);
        let (reply, answer) = oneshot::channel();
        let _ = h.events.send(EngineEvent::InvitationReceived {
            from: peer("Bob"),
            context: None,
            reply,
        });
        assert!(answer.await.unwrap());
        assert!(matches!(h.next().await, Event::InvitationAccepted { .. }));
    }

    #[tokio::test]
    async fn deferred_invitation_waits_for_shell() {
        let mut h = Harness::start(false);
        let (reply, mut answer) = oneshot::channel();
        let _ = h.events.send(EngineEvent::InvitationReceived {
            from: peer("Eve"),
            context: Some(b"ctx".to_vec()),
            reply,
        });
        assert!(matches!(h.next().await, Event::InvitationPending { from } if from.display_name() == "Eve"));
        assert!(answer.try_recv().is_err());

        h.commands.send(Command::Accept("Mallory".into())).unwrap();
        assert!(matches!(h.next().await, Event::CommandRejected { .. }));

        h.commands.send(Command::Decline("Eve".into())).unwrap();
        assert!(matches!(h.next().await, Event::InvitationRejected { .. }));
        assert!(!answer.await.unwrap());
    }

    #[tokio::test]
    async fn connect_send_receive_disconnect() {
        let mut h = Harness::start(true);
        let bob = peer("Bob");
        let (link, mut frames) = h.connect(&bob).await;
        assert_eq!(h.connected_names().await.0, ["Bob".to_string()]);

        h.commands.send(Command::Send("hello".into())).unwrap();
        match h.next().await {
            Event::MessageSent { delivered } => assert_eq!(delivered, vec![bob.clone()]),
            other => panic!("expected MessageSent, got {other:?}"),
        }
        assert_eq!(codec::decode(&frames.recv().await.unwrap()).unwrap(), "hello");

        let _ = h.events.send(EngineEvent::Data {
            peer: bob.id(),
            link,
            payload: codec::encode("hi back").unwrap(),
        });
        match h.next().await {
            Event::MessageReceived { from, text } => {
                assert_eq!(from, bob);
                assert_eq!(text, "hi back");
            }
            other => panic!("expected MessageReceived, got {other:?}"),
        }

        let _ = h.events.send(EngineEvent::Data {
            peer: bob.id(),
            link,
            payload: vec![0xff, 0xfe, 0xfd],
        });
        assert!(matches!(h.next().await, Event::DecodeFailed { .. }));
        assert_eq!(h.connected_names().await.0, ["Bob".to_string()]);

        h.link_state(&bob, link, Transition::Disconnected);
        match h.next().await {
            Event::PeerDisconnected { peer } => assert_eq!(peer.display_name(), "Bob"),
            other => panic!("expected PeerDisconnected, got {other:?}"),
        }
        let (names, summary) = h.connected_names().await;
        assert!(names.is_empty());
        assert_eq!(summary, "No connected peer");
    }

    #[tokio::test]
    async fn send_with_no_peers_reports_empty_result() {
        let mut h = Harness::start(true);
        h.commands.send(Command::Send("hi".into())).unwrap();
        match h.next().await {
            Event::MessageSent { delivered } => assert!(delivered.is_empty()),
            other => panic!("expected MessageSent, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn closed_link_reports_send_failure_for_that_peer_only() {
        let mut h = Harness::start(true);
        let (alice, bob) = (peer("Alice"), peer("Bob"));
        let (_, mut alice_frames) = h.connect(&alice).await;
        let (_, bob_frames) = h.connect(&bob).await;
        drop(bob_frames);

        h.commands.send(Command::Send("fan-out".into())).unwrap();
        match h.next().await {
            Event::MessageSent { delivered } => assert_eq!(delivered, vec![alice.clone()]),
            other => panic!("expected MessageSent, got {other:?}"),
        }
        match h.next().await {
            Event::SendFailed { peer, .. } => assert_eq!(peer, bob),
            other => panic!("expected SendFailed, got {other:?}"),
        }
        assert!(alice_frames.recv().await.is_some());
        assert_eq!(h.connected_names().await.0.len(), 2);
    }

    #[tokio::test]
    async fn stale_link_events_are_ignored() {
        let mut h = Harness::start(true);
        let bob = peer("Bob");
        let (old_link, _old) = h.connect(&bob).await;
        h.link_state(&bob, old_link, Transition::Disconnected);
        assert!(matches!(h.next().await, Event::PeerDisconnected { .. }));

        let (_new_link, _new) = h.connect(&bob).await;
        // Late report from the first link must not remove the reconnected peer.
        h.link_state(&bob, old_link, Transition::Disconnected);
        assert_eq!(h.connected_names().await.0, ["Bob".to_string()]);
    }

    #[tokio::test]
    async fn unknown_invite_target_is_rejected() {
        let mut h = Harness::start(true);
        h.commands.send(Command::Invite("Nobody".into())).unwrap();
        assert!(matches!(h.next().await, Event::CommandRejected { .. }));
    }

    #[tokio::test]
    async fn stopping_when_idle_is_silent() {
        let mut h = Harness::start(true);
        h.commands.send(Command::StopAdvertising).unwrap();
        h.commands.send(Command::StopBrowsing).unwrap();
        h.commands.send(Command::StopAdvertising).unwrap();
        h.commands.send(Command::ListNearby).unwrap();
        assert!(matches!(h.next().await, Event::NearbyPeers { peers } if peers.is_empty()));
    }

    /// Deliver an invitation from `from` and wait for the engine's answer.
    async fn invite(h: &Harness, from: &PeerIdentity) -> bool {
        let (reply, answer) = oneshot::channel();
        let _ = h.events.send(EngineEvent::InvitationReceived {
            from: from.clone(),
            context: None,
            reply,
        });
        answer.await.unwrap_or(false)
    }

    #[tokio::test]
    async fn crossing_invitations_accept_exactly_one() {
        let alice = generate_local_identity("Alice");
        let bob = generate_local_identity("Bob");
        let (alice_peer, bob_peer) = (alice.identity().clone(), bob.identity().clone());
        let mut a = Harness::start_inviting(true, alice, Some(bob_peer.id()));
        let mut b = Harness::start_inviting(true, bob, Some(alice_peer.id()));

        let alice_accepts = invite(&a, &bob_peer).await;
        let bob_accepts = invite(&b, &alice_peer).await;
        assert_ne!(alice_accepts, bob_accepts);
        assert_eq!(alice_accepts, alice_peer.id() > bob_peer.id());

        let (winner, loser) = if alice_accepts { (&mut a, &mut b) } else { (&mut b, &mut a) };
        assert!(matches!(winner.next().await, Event::InvitationAccepted { .. }));
        assert!(matches!(loser.next().await, Event::InvitationRejected { .. }));
    }

    #[tokio::test]
    async fn accept_is_not_reported_when_inviter_gave_up() {
        let mut h = Harness::start(true);
        let (reply, answer) = oneshot::channel();
        drop(answer);
        let _ = h.events.send(EngineEvent::InvitationReceived {
            from: peer("Gone"),
            context: None,
            reply,
        });
        let bob = peer("Bob");
        assert!(invite(&h, &bob).await);
        match h.next().await {
            Event::InvitationAccepted { from } => assert_eq!(from, bob),
            other => panic!("expected InvitationAccepted for Bob, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn pending_invitation_dropped_once_inviter_gives_up() {
        let mut h = Harness::start(false);
        let (reply, answer) = oneshot::channel();
        let _ = h.events.send(EngineEvent::InvitationReceived {
            from: peer("Eve"),
            context: None,
            reply,
        });
        assert!(matches!(h.next().await, Event::InvitationPending { .. }));
        drop(answer);
        // Next tick notices the closed reply well before the answer window ends.
        assert!(matches!(h.next().await, Event::InvitationRejected { .. }));

        h.commands.send(Command::Accept("Eve".into())).unwrap();
        assert!(matches!(h.next().await, Event::CommandRejected { .. }));
    }

    #[test]
    fn answer_window_ends_before_inviter_timeout() {
        let settings = EngineSettings::from(&Config::default());
        assert_eq!(settings.invite_timeout, Duration::from_secs(30));
        assert!(settings.answer_timeout < settings.invite_timeout);
    }

    #[tokio::test]
    async fn invitation_outcomes_are_reported() {
        let mut h = Harness::start(true);
        let bob = peer("Bob");
        let _ = h.events.send(EngineEvent::InvitationFinished {
            peer: bob.clone(),
            outcome: InviteOutcome::Declined,
        });
        assert!(matches!(h.next().await, Event::InvitationDeclined { .. }));
        let _ = h.events.send(EngineEvent::InvitationFinished {
            peer: bob,
            outcome: InviteOutcome::TimedOut,
        });
        assert!(matches!(h.next().await, Event::InvitationTimedOut { .. }));
    }
}
