//! WebRTC transport: one peer connection and one ordered data channel, driven by the core's link actions.
//!
//! All commands run in order on a single task, so an answer is never applied
//! before the offer it answers has been set.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Context;
use bytes::Bytes;
use mesh_core::{
    ChannelMessage, ConnectivityState, IceCandidate, LinkAction, NegotiationToken,
    SessionDescription,
};
use tokio::sync::mpsc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use crate::config::IceServer;
use crate::runtime::HostEvent;

const CHANNEL_LABEL: &str = "easymesh";

/// Work for the peer task.
pub enum PeerCommand {
    Link(LinkAction),
    Send(ChannelMessage),
    CloseChannel,
    /// Channel announced by the remote side.
    Adopt(Arc<RTCDataChannel>),
    Shutdown,
}

/// Handle to the peer task.
#[derive(Clone)]
pub struct PeerHandle {
    tx: mpsc::UnboundedSender<PeerCommand>,
}

impl PeerHandle {
    pub fn submit(&self, cmd: PeerCommand) {
        if self.tx.send(cmd).is_err() {
            tracing::debug!("peer task gone, command dropped");
        }
    }
}

/// Spawn the peer task. Events go to `events`; `buffer_low_threshold` arms the
/// channel's buffered-amount-low callback.
pub fn spawn(
    ice_servers: &[IceServer],
    buffer_low_threshold: u64,
    events: mpsc::UnboundedSender<HostEvent>,
) -> anyhow::Result<PeerHandle> {
    let api = build_api()?;
    let config = RTCConfiguration {
        ice_servers: ice_servers
            .iter()
            .map(|s| RTCIceServer {
                urls: s.urls.clone(),
                username: s.username.clone(),
                credential: s.credential.clone(),
                ..Default::default()
            })
            .collect(),
        ..Default::default()
    };
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut driver = PeerDriver {
        api,
        config,
        buffer_low_threshold,
        events,
        commands: tx.downgrade(),
        pc: None,
        dc: None,
        epoch: Arc::new(AtomicU64::new(0)),
    };
    tokio::spawn(async move {
        while let Some(cmd) = rx.recv().await {
            if matches!(cmd, PeerCommand::Shutdown) {
                driver.close().await;
                break;
            }
            driver.handle(cmd).await;
        }
    });
    Ok(PeerHandle { tx })
}

fn build_api() -> anyhow::Result<API> {
    let mut me = MediaEngine::default();
    let registry = register_default_interceptors(Registry::new(), &mut me)?;
    Ok(APIBuilder::new()
        .with_media_engine(me)
        .with_interceptor_registry(registry)
        .build())
}

/// Maps the WebRTC ICE state onto the core's.
pub fn map_ice_state(state: RTCIceConnectionState) -> Option<ConnectivityState> {
    Some(match state {
        RTCIceConnectionState::New => ConnectivityState::New,
        RTCIceConnectionState::Checking => ConnectivityState::Checking,
        RTCIceConnectionState::Connected => ConnectivityState::Connected,
        RTCIceConnectionState::Completed => ConnectivityState::Completed,
        RTCIceConnectionState::Disconnected => ConnectivityState::Disconnected,
        RTCIceConnectionState::Failed => ConnectivityState::Failed,
        RTCIceConnectionState::Closed => ConnectivityState::Closed,
        _ => return None,
    })
}

pub fn candidate_to_init(c: IceCandidate) -> RTCIceCandidateInit {
    RTCIceCandidateInit {
        candidate: c.candidate,
        sdp_mid: c.sdp_mid,
        sdp_mline_index: c.sdp_mline_index,
        username_fragment: c.username_fragment,
    }
}

pub fn candidate_from_init(c: RTCIceCandidateInit) -> IceCandidate {
    IceCandidate {
        candidate: c.candidate,
        sdp_mid: c.sdp_mid,
        sdp_mline_index: c.sdp_mline_index,
        username_fragment: c.username_fragment,
    }
}

struct PeerDriver {
    api: API,
    config: RTCConfiguration,
    buffer_low_threshold: u64,
    events: mpsc::UnboundedSender<HostEvent>,
    commands: mpsc::WeakUnboundedSender<PeerCommand>,
    pc: Option<Arc<RTCPeerConnection>>,
    dc: Option<Arc<RTCDataChannel>>,
    /// Bumped whenever the peer connection is replaced; callbacks of older connections go quiet.
    epoch: Arc<AtomicU64>,
}

impl PeerDriver {
    async fn handle(&mut self, cmd: PeerCommand) {
        match cmd {
            PeerCommand::Link(action) => self.link(action).await,
            PeerCommand::Send(msg) => self.send(msg).await,
            PeerCommand::CloseChannel => {
                if let Some(dc) = self.dc.take() {
                    if let Err(e) = dc.close().await {
                        tracing::debug!(error = %e, "data channel close failed");
                    }
                }
            }
            PeerCommand::Adopt(dc) => self.dc = Some(dc),
            PeerCommand::Shutdown => self.close().await,
        }
    }

    async fn link(&mut self, action: LinkAction) {
        match action {
            LinkAction::CreatePeerConnection { open_channel } => {
                if let Err(e) = self.create_peer_connection(open_channel).await {
                    tracing::error!(error = %e, "peer connection setup failed");
                    self.emit(HostEvent::Connectivity(ConnectivityState::Failed));
                }
            }
            LinkAction::CreateOffer { token, ice_restart } => {
                let result = self.create_offer(ice_restart).await;
                self.complete(token, result);
            }
            LinkAction::AcceptOffer {
                token,
                description,
                rollback,
            } => {
                let result = self.accept_offer(description, rollback).await;
                self.complete(token, result);
            }
            LinkAction::ApplyAnswer { token, description } => {
                if let Err(e) = self.apply_answer(description).await {
                    self.emit(HostEvent::NegotiationFailed(token, format!("{e:#}")));
                }
            }
            LinkAction::AddCandidate(candidate) => {
                let Some(pc) = &self.pc else { return };
                if let Err(e) = pc.add_ice_candidate(candidate_to_init(candidate)).await {
                    tracing::debug!(error = %e, "remote candidate rejected");
                }
            }
            LinkAction::Close => self.close().await,
            LinkAction::Signal(_) | LinkAction::ConnectedChanged(_) | LinkAction::Report(_) => {}
        }
    }

    fn complete(
        &self,
        token: NegotiationToken,
        result: anyhow::Result<SessionDescription>,
    ) {
        match result {
            Ok(desc) => self.emit(HostEvent::LocalDescription(token, desc)),
            Err(e) => self.emit(HostEvent::NegotiationFailed(token, format!("{e:#}"))),
        }
    }

    fn emit(&self, event: HostEvent) {
        let _ = self.events.send(event);
    }

    async fn create_peer_connection(&mut self, open_channel: bool) -> anyhow::Result<()> {
        self.close().await;
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let pc = Arc::new(
            self.api
                .new_peer_connection(self.config.clone())
                .await
                .context("creating peer connection")?,
        );

        let events = self.events.clone();
        let current = self.epoch.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let events = events.clone();
            let current = current.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else { return };
                if current.load(Ordering::SeqCst) != epoch {
                    return;
                }
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = events.send(HostEvent::LocalCandidate(candidate_from_init(init)));
                    }
                    Err(e) => tracing::debug!(error = %e, "local candidate not serializable"),
                }
            })
        }));

        let events = self.events.clone();
        let current = self.epoch.clone();
        pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
            let events = events.clone();
            let current = current.clone();
            Box::pin(async move {
                if current.load(Ordering::SeqCst) != epoch {
                    return;
                }
                tracing::debug!(%state, "ice connection state");
                if let Some(state) = map_ice_state(state) {
                    let _ = events.send(HostEvent::Connectivity(state));
                }
            })
        }));

        let events = self.events.clone();
        let current = self.epoch.clone();
        let commands = self.commands.clone();
        let threshold = self.buffer_low_threshold;
        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let events = events.clone();
            let current = current.clone();
            let commands = commands.clone();
            Box::pin(async move {
                if current.load(Ordering::SeqCst) != epoch || dc.label() != CHANNEL_LABEL {
                    return;
                }
                let Some(commands) = commands.upgrade() else { return };
                tracing::info!("remote data channel announced");
                // Adopted before any open event can reach the runtime.
                let _ = commands.send(PeerCommand::Adopt(dc.clone()));
                attach_channel(&dc, epoch, current, threshold, events).await;
            })
        }));

        if open_channel {
            let init = RTCDataChannelInit {
                ordered: Some(true),
                ..Default::default()
            };
            let dc = pc
                .create_data_channel(CHANNEL_LABEL, Some(init))
                .await
                .context("creating data channel")?;
            attach_channel(
                &dc,
                epoch,
                self.epoch.clone(),
                self.buffer_low_threshold,
                self.events.clone(),
            )
            .await;
            self.dc = Some(dc);
        }
        self.pc = Some(pc);
        Ok(())
    }

    async fn ensure_peer_connection(&mut self) -> anyhow::Result<Arc<RTCPeerConnection>> {
        if self.pc.is_none() {
            self.create_peer_connection(false).await?;
        }
        self.pc
            .clone()
            .ok_or_else(|| anyhow::anyhow!("no peer connection"))
    }

    async fn create_offer(&mut self, ice_restart: bool) -> anyhow::Result<SessionDescription> {
        let pc = self.ensure_peer_connection().await?;
        let options = RTCOfferOptions {
            ice_restart,
            ..Default::default()
        };
        let offer = pc.create_offer(Some(options)).await.context("create offer")?;
        let sdp = offer.sdp.clone();
        pc.set_local_description(offer)
            .await
            .context("set local offer")?;
        Ok(SessionDescription::offer(sdp))
    }

    async fn accept_offer(
        &mut self,
        description: SessionDescription,
        rollback: bool,
    ) -> anyhow::Result<SessionDescription> {
        let pc = self.ensure_peer_connection().await?;
        if rollback {
            let mut undo = RTCSessionDescription::default();
            undo.sdp_type = RTCSdpType::Rollback;
            if let Err(e) = pc.set_local_description(undo).await {
                tracing::debug!(error = %e, "rollback of local offer failed");
            }
        }
        let offer = RTCSessionDescription::offer(description.sdp).context("parse remote offer")?;
        pc.set_remote_description(offer)
            .await
            .context("set remote offer")?;
        let answer = pc.create_answer(None).await.context("create answer")?;
        let sdp = answer.sdp.clone();
        pc.set_local_description(answer)
            .await
            .context("set local answer")?;
        Ok(SessionDescription::answer(sdp))
    }

    async fn apply_answer(&mut self, description: SessionDescription) -> anyhow::Result<()> {
        let pc = self
            .pc
            .clone()
            .ok_or_else(|| anyhow::anyhow!("answer without a peer connection"))?;
        let answer =
            RTCSessionDescription::answer(description.sdp).context("parse remote answer")?;
        pc.set_remote_description(answer)
            .await
            .context("set remote answer")?;
        Ok(())
    }

    async fn send(&mut self, msg: ChannelMessage) {
        let Some(dc) = &self.dc else {
            tracing::debug!("no data channel, frame dropped");
            return;
        };
        let sent = match msg {
            ChannelMessage::Text(text) => dc.send_text(text).await,
            ChannelMessage::Binary(bytes) => dc.send(&Bytes::from(bytes)).await,
        };
        if let Err(e) = sent {
            tracing::warn!(error = %e, "data channel send failed");
        }
        let buffered = dc.buffered_amount().await as u64;
        self.emit(HostEvent::BufferedAmount(buffered));
    }

    async fn close(&mut self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        if let Some(dc) = self.dc.take() {
            let _ = dc.close().await;
        }
        if let Some(pc) = self.pc.take() {
            if let Err(e) = pc.close().await {
                tracing::debug!(error = %e, "peer connection close failed");
            }
        }
    }
}

/// Wire a data channel's callbacks to host events. `ChannelOpen` is emitted once,
/// either from the open callback or because the channel was already open.
async fn attach_channel(
    dc: &Arc<RTCDataChannel>,
    epoch: u64,
    current: Arc<AtomicU64>,
    threshold: u64,
    events: mpsc::UnboundedSender<HostEvent>,
) {
    let announced = Arc::new(AtomicBool::new(false));
    let live = move |current: &AtomicU64| current.load(Ordering::SeqCst) == epoch;

    {
        let events = events.clone();
        let current = current.clone();
        let announced = announced.clone();
        dc.on_open(Box::new(move || {
            Box::pin(async move {
                if live(&current) && !announced.swap(true, Ordering::SeqCst) {
                    tracing::info!("data channel open");
                    let _ = events.send(HostEvent::ChannelOpen);
                }
            })
        }));
    }
    {
        let events = events.clone();
        let current = current.clone();
        dc.on_close(Box::new(move || {
            let events = events.clone();
            let current = current.clone();
            Box::pin(async move {
                if live(&current) {
                    tracing::info!("data channel closed");
                    let _ = events.send(HostEvent::ChannelClosed);
                }
            })
        }));
    }
    {
        let events = events.clone();
        let current = current.clone();
        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let events = events.clone();
            let current = current.clone();
            Box::pin(async move {
                if !live(&current) {
                    return;
                }
                let message = if msg.is_string {
                    ChannelMessage::Text(String::from_utf8_lossy(&msg.data).into_owned())
                } else {
                    ChannelMessage::Binary(msg.data.to_vec())
                };
                let _ = events.send(HostEvent::ChannelMessage(message));
            })
        }));
    }
    dc.set_buffered_amount_low_threshold(threshold as usize).await;
    {
        let events = events.clone();
        let current = current.clone();
        dc.on_buffered_amount_low(Box::new(move || {
            let events = events.clone();
            let current = current.clone();
            Box::pin(async move {
                if live(&current) {
                    let _ = events.send(HostEvent::BufferDrained);
                }
            })
        }))
        .await;
    }
    if dc.ready_state() == RTCDataChannelState::Open && !announced.swap(true, Ordering::SeqCst) {
        let _ = events.send(HostEvent::ChannelOpen);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ice_states_map_one_to_one() {
        assert_eq!(
            map_ice_state(RTCIceConnectionState::Failed),
            Some(ConnectivityState::Failed)
        );
        assert_eq!(
            map_ice_state(RTCIceConnectionState::Completed),
            Some(ConnectivityState::Completed)
        );
        assert_eq!(map_ice_state(RTCIceConnectionState::Unspecified), None);
    }

    #[test]
    fn candidates_convert_both_ways() {
        let c = IceCandidate {
            candidate: "candidate:1 1 udp 2122260223 192.168.1.4 50000 typ host".into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        };
        assert_eq!(candidate_from_init(candidate_to_init(c.clone())), c);
    }
}
