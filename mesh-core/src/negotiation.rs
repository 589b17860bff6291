//! Negotiation engine: one peer link per session, offer/answer/candidate exchange
//! with polite/impolite collision handling and bounded ICE restarts.
//!
//! The host owns the actual peer connection. Every asynchronous operation it is
//! asked to perform carries a [`NegotiationToken`]; completions with a token
//! that is no longer current are ignored. Taking a new token is how an
//! in-flight offer gets discarded.

use crate::config::CoreConfig;
use crate::error::MeshError;
use crate::ids::{ClientId, Role};
use crate::protocol::{IceCandidate, SessionDescription, SignalMessage};

/// Negotiation state of the peer link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerLinkState {
    Idle,
    /// Local offer requested from the host, not yet published.
    MakingOffer,
    /// Local offer published, awaiting the answer.
    OfferSent,
    /// Remote offer being applied and answered.
    Answering,
    Stable,
    /// ICE restart budget exhausted.
    Failed,
}

impl PeerLinkState {
    fn negotiating(self) -> bool {
        matches!(
            self,
            PeerLinkState::MakingOffer | PeerLinkState::OfferSent | PeerLinkState::Answering
        )
    }
}

/// Generation of one offer/answer attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NegotiationToken(u64);

/// Transport-level connectivity as reported by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

/// Work for the host's peer connection, or notifications for the orchestrator.
#[derive(Debug)]
pub enum LinkAction {
    /// Create the peer connection; the offerer also opens the data channel.
    CreatePeerConnection { open_channel: bool },
    /// Create an offer, set it locally, report it via `on_local_description`.
    CreateOffer {
        token: NegotiationToken,
        ice_restart: bool,
    },
    /// Roll back a pending local offer if `rollback`, apply the remote offer,
    /// create and set an answer, report it via `on_local_description`.
    AcceptOffer {
        token: NegotiationToken,
        description: SessionDescription,
        rollback: bool,
    },
    /// Apply the remote answer.
    ApplyAnswer {
        token: NegotiationToken,
        description: SessionDescription,
    },
    AddCandidate(IceCandidate),
    /// Publish through the signaling link.
    Signal(SignalMessage),
    Close,
    ConnectedChanged(bool),
    Report(MeshError),
}

pub struct NegotiationEngine {
    self_id: ClientId,
    role: Role,
    state: PeerLinkState,
    target: Option<ClientId>,
    generation: u64,
    peer_connection: bool,
    remote_description: bool,
    transport_up: bool,
    channel_open: bool,
    connected: bool,
    ever_connected: bool,
    restarts: u32,
    last_restart: Option<u64>,
    restart_pending: bool,
    now: u64,
    cooldown_ticks: u64,
    max_restarts: u32,
}

impl NegotiationEngine {
    pub fn new(self_id: ClientId, role: Role, config: &CoreConfig) -> Self {
        Self {
            self_id,
            role,
            state: PeerLinkState::Idle,
            target: None,
            generation: 0,
            peer_connection: false,
            remote_description: false,
            transport_up: false,
            channel_open: false,
            connected: false,
            ever_connected: false,
            restarts: 0,
            last_restart: None,
            restart_pending: false,
            now: 0,
            cooldown_ticks: config.ice_restart_cooldown_ticks,
            max_restarts: config.max_ice_restarts,
        }
    }

    pub fn state(&self) -> PeerLinkState {
        self.state
    }

    pub fn target(&self) -> Option<&ClientId> {
        self.target.as_ref()
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn restarts(&self) -> u32 {
        self.restarts
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Roster update. Pins the only other peer; the initiator then starts an offer.
    pub fn on_peer_list(&mut self, peers: &[ClientId]) -> Vec<LinkAction> {
        let others: Vec<&ClientId> = peers.iter().filter(|p| **p != self.self_id).collect();
        if self.target.is_none() {
            if let [only] = others.as_slice() {
                tracing::info!(peer = %only, "pinned remote peer");
                self.target = Some((*only).clone());
            }
        }
        let Some(target) = &self.target else {
            return Vec::new();
        };
        if !others.contains(&target) {
            tracing::debug!(peer = %target, "pinned peer missing from roster");
            return Vec::new();
        }
        if self.role == Role::Initiator && self.state == PeerLinkState::Idle {
            return self.begin_offer(false);
        }
        Vec::new()
    }

    /// The host produced the local description requested under `token`.
    pub fn on_local_description(
        &mut self,
        token: NegotiationToken,
        description: SessionDescription,
    ) -> Vec<LinkAction> {
        if !self.is_current(token) {
            tracing::debug!(?token, "stale local description ignored");
            return Vec::new();
        }
        let to = self.target.clone();
        match self.state {
            PeerLinkState::MakingOffer => {
                self.state = PeerLinkState::OfferSent;
                vec![LinkAction::Signal(SignalMessage::SdpOffer {
                    to,
                    from: None,
                    sdp: description,
                })]
            }
            PeerLinkState::Answering => {
                self.state = PeerLinkState::Stable;
                vec![LinkAction::Signal(SignalMessage::SdpAnswer {
                    to,
                    from: None,
                    sdp: description,
                })]
            }
            other => {
                tracing::debug!(state = ?other, "local description outside negotiation");
                Vec::new()
            }
        }
    }

    pub fn on_remote_offer(
        &mut self,
        from: ClientId,
        description: SessionDescription,
    ) -> Vec<LinkAction> {
        match &self.target {
            None => {
                tracing::info!(peer = %from, "pinned remote peer from offer");
                self.target = Some(from);
            }
            Some(t) if *t != from => {
                tracing::warn!(peer = %from, "offer from unexpected peer dropped");
                return Vec::new();
            }
            Some(_) => {}
        }
        if self.state == PeerLinkState::Failed {
            tracing::debug!("link failed, offer ignored");
            return Vec::new();
        }
        let collision = matches!(
            self.state,
            PeerLinkState::MakingOffer | PeerLinkState::OfferSent
        );
        if collision && !self.role.is_polite() {
            tracing::debug!("offer collision, keeping local offer");
            return Vec::new();
        }
        if collision {
            tracing::debug!("offer collision, yielding to remote offer");
        }
        let mut out = self.ensure_peer_connection();
        let token = self.next_token();
        self.state = PeerLinkState::Answering;
        self.remote_description = true;
        out.push(LinkAction::AcceptOffer {
            token,
            description,
            rollback: collision,
        });
        out
    }

    pub fn on_remote_answer(
        &mut self,
        from: ClientId,
        description: SessionDescription,
    ) -> Vec<LinkAction> {
        if self.target.as_ref() != Some(&from) {
            tracing::warn!(peer = %from, "answer from unexpected peer dropped");
            return Vec::new();
        }
        if self.state != PeerLinkState::OfferSent {
            tracing::debug!(state = ?self.state, "answer without outstanding offer dropped");
            return Vec::new();
        }
        self.state = PeerLinkState::Stable;
        self.remote_description = true;
        vec![LinkAction::ApplyAnswer {
            token: NegotiationToken(self.generation),
            description,
        }]
    }

    pub fn on_remote_candidate(&mut self, from: ClientId, candidate: IceCandidate) -> Vec<LinkAction> {
        if self.target.as_ref() != Some(&from) {
            tracing::debug!(peer = %from, "candidate from unexpected peer dropped");
            return Vec::new();
        }
        if !self.remote_description {
            tracing::debug!("candidate before remote description dropped");
            return Vec::new();
        }
        vec![LinkAction::AddCandidate(candidate)]
    }

    pub fn on_local_candidate(&mut self, candidate: IceCandidate) -> Vec<LinkAction> {
        let Some(to) = self.target.clone() else {
            tracing::debug!("local candidate before target pinned dropped");
            return Vec::new();
        };
        vec![LinkAction::Signal(SignalMessage::IceCandidate {
            to: Some(to),
            from: None,
            candidate,
        })]
    }

    /// Host failed to create or apply a description for `token`.
    pub fn on_negotiation_failed(&mut self, token: NegotiationToken, reason: String) -> Vec<LinkAction> {
        if !self.is_current(token) {
            tracing::debug!(?token, "stale negotiation failure ignored");
            return Vec::new();
        }
        tracing::warn!(%reason, state = ?self.state, "negotiation failed");
        // Invalidate whatever the host may still complete for this attempt.
        self.next_token();
        if self.state != PeerLinkState::Failed {
            self.state = PeerLinkState::Idle;
        }
        if !self.ever_connected {
            self.target = None;
            self.remote_description = false;
        }
        vec![LinkAction::Report(MeshError::NegotiationFailed(reason))]
    }

    pub fn on_connectivity(&mut self, state: ConnectivityState) -> Vec<LinkAction> {
        match state {
            ConnectivityState::Connected | ConnectivityState::Completed => {
                self.ever_connected = true;
                self.restart_pending = false;
                self.transport_up = true;
                self.set_connected(true).into_iter().collect()
            }
            ConnectivityState::Disconnected | ConnectivityState::Failed => {
                self.transport_up = false;
                let mut out: Vec<LinkAction> = self.set_connected(false).into_iter().collect();
                out.extend(self.try_restart());
                out
            }
            ConnectivityState::Closed => {
                self.transport_up = false;
                self.set_connected(false).into_iter().collect()
            }
            ConnectivityState::New | ConnectivityState::Checking => Vec::new(),
        }
    }

    pub fn on_channel_open(&mut self) -> Vec<LinkAction> {
        self.channel_open = true;
        self.ever_connected = true;
        self.set_connected(true).into_iter().collect()
    }

    pub fn on_channel_closed(&mut self) -> Vec<LinkAction> {
        self.channel_open = false;
        self.set_connected(false).into_iter().collect()
    }

    /// One tick; retries a restart deferred by the cooldown or by an ongoing negotiation.
    pub fn tick(&mut self) -> Vec<LinkAction> {
        self.now += 1;
        if self.restart_pending && !self.transport_up {
            return self.try_restart();
        }
        Vec::new()
    }

    pub fn close(&mut self) -> Vec<LinkAction> {
        self.next_token();
        self.state = PeerLinkState::Idle;
        self.transport_up = false;
        self.channel_open = false;
        self.restart_pending = false;
        let mut out: Vec<LinkAction> = self.set_connected(false).into_iter().collect();
        if self.peer_connection {
            self.peer_connection = false;
            out.push(LinkAction::Close);
        }
        out
    }

    fn try_restart(&mut self) -> Vec<LinkAction> {
        if self.state == PeerLinkState::Failed || !self.peer_connection {
            return Vec::new();
        }
        if self.restarts >= self.max_restarts {
            self.state = PeerLinkState::Failed;
            self.restart_pending = false;
            tracing::error!(attempts = self.restarts, "ice restart budget exhausted");
            return vec![LinkAction::Report(MeshError::ConnectivityLost {
                attempts: self.restarts,
            })];
        }
        let cooling = self
            .last_restart
            .is_some_and(|t| self.now.saturating_sub(t) < self.cooldown_ticks);
        if cooling || self.state.negotiating() {
            self.restart_pending = true;
            return Vec::new();
        }
        self.restart_pending = false;
        self.restarts += 1;
        self.last_restart = Some(self.now);
        tracing::info!(attempt = self.restarts, "ice restart");
        self.begin_offer(true)
    }

    fn begin_offer(&mut self, ice_restart: bool) -> Vec<LinkAction> {
        let mut out = self.ensure_peer_connection();
        let token = self.next_token();
        self.state = PeerLinkState::MakingOffer;
        out.push(LinkAction::CreateOffer { token, ice_restart });
        out
    }

    fn ensure_peer_connection(&mut self) -> Vec<LinkAction> {
        if self.peer_connection {
            return Vec::new();
        }
        self.peer_connection = true;
        vec![LinkAction::CreatePeerConnection {
            open_channel: self.role == Role::Initiator,
        }]
    }

    fn next_token(&mut self) -> NegotiationToken {
        self.generation += 1;
        NegotiationToken(self.generation)
    }

    fn is_current(&self, token: NegotiationToken) -> bool {
        token.0 == self.generation
    }

    fn set_connected(&mut self, up: bool) -> Option<LinkAction> {
        if self.connected == up {
            return None;
        }
        self.connected = up;
        Some(LinkAction::ConnectedChanged(up))
    }
}
