//! Host-driven API: SessionCore receives events from the host, returns actions.
//!
//! One core per session id. It owns the signaling link, the negotiation engine,
//! the send queue and the reassembler, and keeps the observable state the UI reads
//! through [`SessionCore::snapshot`].

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;

use crate::chunk::{Reassembler, ReceiveError, ReceivedFile};
use crate::config::CoreConfig;
use crate::error::MeshError;
use crate::ids::{ClientId, Role, SessionId, TransferId};
use crate::negotiation::{
    ConnectivityState, LinkAction, NegotiationEngine, NegotiationToken, PeerLinkState,
};
use crate::progress::{ProgressBook, ProgressRecord};
use crate::protocol::{decode_signal, IceCandidate, SessionDescription, SignalMessage, TransferDescriptor};
use crate::queue::SendQueue;
use crate::signaling::{LinkStatus, SignalAction, SignalingLink};
use crate::transfer::{FlowControl, SenderAction};
use crate::wire::{self, ChannelMessage, Frame};

/// Action for the host to perform, in order.
#[derive(Debug)]
pub enum Action {
    Signal(SignalAction),
    /// Peer-connection work (never `Signal`, `ConnectedChanged` or `Report`; those are routed here).
    Link(LinkAction),
    /// Send on the direct channel, then report `on_buffered_amount`.
    Send(ChannelMessage),
    CloseChannel,
    /// Read `len` bytes at `offset` from the source of `transfer_id`; answer with
    /// `on_chunk_read` or `on_read_failed`, echoing `attempt`.
    ReadChunk {
        transfer_id: TransferId,
        attempt: u64,
        offset: u64,
        len: u64,
    },
    /// Drop the data source of a job that will not be read again.
    ReleaseSource(TransferId),
    /// Call `on_dispatch_due` after this delay.
    ScheduleDispatch(Duration),
    /// A file finished arriving; fetch it with `received_file`.
    FileReceived(TransferId),
    /// Chat from the peer, already appended to the log.
    ChatReceived(ChatMessage),
    TransferFinished {
        transfer_id: TransferId,
        result: Result<(), MeshError>,
    },
    ConnectedChanged(bool),
    Report(MeshError),
    CancelTimers,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Author {
    Local,
    Remote,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub id: u64,
    pub author: Author,
    pub text: String,
}

/// Observable state surface.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub session_id: SessionId,
    pub client_id: ClientId,
    pub role: Role,
    pub peers: Vec<ClientId>,
    pub connected: bool,
    pub channel_ready: bool,
    pub signaling: LinkStatus,
    pub link: PeerLinkState,
    pub progress: BTreeMap<TransferId, ProgressRecord>,
    pub received: Vec<TransferDescriptor>,
    pub chat: Vec<ChatMessage>,
    pub queued: usize,
}

/// Main coordinator. Host passes events; core returns actions.
pub struct SessionCore {
    config: CoreConfig,
    session_id: SessionId,
    client_id: ClientId,
    role: Role,
    signaling: SignalingLink,
    negotiation: NegotiationEngine,
    peers: Vec<ClientId>,
    channel_ready: bool,
    queue: SendQueue,
    flow: FlowControl,
    reassembler: Reassembler,
    progress: ProgressBook,
    received: Vec<TransferDescriptor>,
    blobs: HashMap<TransferId, ReceivedFile>,
    chat: Vec<ChatMessage>,
    pending_chat: VecDeque<String>,
    ticks_since_heartbeat: u64,
    dispatch_scheduled: bool,
}

impl SessionCore {
    pub fn new(session_id: SessionId, role: Role, config: CoreConfig) -> Self {
        Self::with_client_id(session_id, ClientId::generate(), role, config)
    }

    pub fn with_client_id(
        session_id: SessionId,
        client_id: ClientId,
        role: Role,
        config: CoreConfig,
    ) -> Self {
        let join = SignalMessage::Join {
            client_id: client_id.clone(),
            role,
        };
        Self {
            signaling: SignalingLink::new(session_id.clone(), join, &config),
            negotiation: NegotiationEngine::new(client_id.clone(), role, &config),
            flow: FlowControl::new(config.buffer_low_threshold),
            config,
            session_id,
            client_id,
            role,
            peers: Vec::new(),
            channel_ready: false,
            queue: SendQueue::new(),
            reassembler: Reassembler::new(),
            progress: ProgressBook::new(),
            received: Vec::new(),
            blobs: HashMap::new(),
            chat: Vec::new(),
            pending_chat: VecDeque::new(),
            ticks_since_heartbeat: 0,
            dispatch_scheduled: false,
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    /// Connect the signaling link.
    pub fn start(&mut self) -> Vec<Action> {
        let mut out = Vec::new();
        let actions = self.signaling.connect();
        self.push_signal(actions, &mut out);
        out
    }

    // ---- signaling socket ----

    pub fn on_signaling_open(&mut self) -> Vec<Action> {
        let mut out = Vec::new();
        let actions = self.signaling.on_open();
        self.push_signal(actions, &mut out);
        out
    }

    pub fn on_signaling_closed(&mut self) -> Vec<Action> {
        let mut out = Vec::new();
        let actions = self.signaling.on_closed();
        self.push_signal(actions, &mut out);
        out
    }

    pub fn on_reconnect_due(&mut self) -> Vec<Action> {
        let mut out = Vec::new();
        let actions = self.signaling.on_reconnect_due();
        self.push_signal(actions, &mut out);
        out
    }

    /// Text message from the relay.
    pub fn on_signaling_text(&mut self, text: &str) -> Vec<Action> {
        let msg = match decode_signal(text) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::warn!(%e, "undecodable signaling message dropped");
                return Vec::new();
            }
        };
        let link = match msg {
            SignalMessage::Peers { peers } => {
                tracing::info!(count = peers.len(), "roster update");
                self.peers = peers;
                self.negotiation.on_peer_list(&self.peers)
            }
            SignalMessage::SdpOffer {
                from: Some(from),
                sdp,
                ..
            } => self.negotiation.on_remote_offer(from, sdp),
            SignalMessage::SdpAnswer {
                from: Some(from),
                sdp,
                ..
            } => self.negotiation.on_remote_answer(from, sdp),
            SignalMessage::IceCandidate {
                from: Some(from),
                candidate,
                ..
            } => self.negotiation.on_remote_candidate(from, candidate),
            SignalMessage::Text { from, data, .. } => {
                if from.as_ref() == Some(&self.client_id) {
                    return Vec::new();
                }
                let msg = self.push_chat(Author::Remote, data);
                return vec![Action::ChatReceived(msg)];
            }
            SignalMessage::SdpOffer { from: None, .. }
            | SignalMessage::SdpAnswer { from: None, .. }
            | SignalMessage::IceCandidate { from: None, .. } => {
                tracing::warn!("relayed negotiation message without sender dropped");
                Vec::new()
            }
            SignalMessage::Join { .. } | SignalMessage::Ping => Vec::new(),
        };
        let mut out = Vec::new();
        self.push_link(link, &mut out);
        out
    }

    // ---- peer connection ----

    pub fn on_local_description(
        &mut self,
        token: NegotiationToken,
        description: SessionDescription,
    ) -> Vec<Action> {
        let actions = self.negotiation.on_local_description(token, description);
        self.link_out(actions)
    }

    pub fn on_negotiation_failed(&mut self, token: NegotiationToken, reason: String) -> Vec<Action> {
        let actions = self.negotiation.on_negotiation_failed(token, reason);
        self.link_out(actions)
    }

    pub fn on_local_candidate(&mut self, candidate: IceCandidate) -> Vec<Action> {
        let actions = self.negotiation.on_local_candidate(candidate);
        self.link_out(actions)
    }

    pub fn on_connectivity_change(&mut self, state: ConnectivityState) -> Vec<Action> {
        let actions = self.negotiation.on_connectivity(state);
        self.link_out(actions)
    }

    // ---- direct channel ----

    /// Channel open: flush queued chat in order, then start the head job.
    pub fn on_channel_open(&mut self) -> Vec<Action> {
        let mut out = Vec::new();
        self.channel_ready = true;
        self.flow.reset();
        self.ticks_since_heartbeat = 0;
        let actions = self.negotiation.on_channel_open();
        self.push_link(actions, &mut out);
        while let Some(text) = self.pending_chat.pop_front() {
            self.send_frame(Frame::Chat(text), &mut out);
        }
        self.dispatch(&mut out);
        out
    }

    /// Channel closed: requeue the active job at the head and mark in-flight progress as failed.
    pub fn on_channel_closed(&mut self) -> Vec<Action> {
        let mut out = Vec::new();
        if !self.channel_ready && self.queue.is_idle() {
            let actions = self.negotiation.on_channel_closed();
            self.push_link(actions, &mut out);
            return out;
        }
        self.channel_ready = false;
        let actions = self.negotiation.on_channel_closed();
        self.push_link(actions, &mut out);
        if let Some(id) = self.queue.requeue_active() {
            tracing::warn!(transfer = %id, "channel closed mid-transfer, requeued");
            out.push(Action::TransferFinished {
                transfer_id: id.clone(),
                result: Err(MeshError::ChannelClosedMidTransfer(id)),
            });
        }
        let flipped = self.progress.fail_in_flight();
        if flipped > 0 {
            tracing::info!(flipped, "in-flight transfers marked as interrupted");
        }
        if let Some(abandoned) = self.reassembler.abort() {
            tracing::debug!(transfer = %abandoned.id, "inbound transfer aborted");
        }
        self.flow.reset();
        out
    }

    pub fn on_channel_message(&mut self, msg: ChannelMessage) -> Vec<Action> {
        let mut out = Vec::new();
        if let Err(e) = self.receive_frame(msg, &mut out) {
            tracing::warn!(error = %e, "frame dropped");
        }
        out
    }

    /// Apply one inbound frame. A frame that breaks the START, CHUNK, END order
    /// or cannot be decoded is reported as a `ProtocolViolation`.
    fn receive_frame(&mut self, msg: ChannelMessage, out: &mut Vec<Action>) -> Result<(), MeshError> {
        let frame = wire::decode_frame(msg)
            .map_err(|e| MeshError::ProtocolViolation(format!("undecodable frame: {e}")))?;
        match frame {
            Frame::Start(descriptor) => {
                if let Some(prev) = self.reassembler.on_start(descriptor.clone()) {
                    tracing::warn!(transfer = %prev.id, "start before end, abandoning receive");
                    self.progress.fail(&prev.id);
                }
                tracing::info!(transfer = %descriptor.id, name = %descriptor.name, size = descriptor.byte_size, "receiving");
                self.progress.start_receiving(&descriptor);
            }
            Frame::Chunk(bytes) => match self.reassembler.on_chunk(bytes) {
                Ok(p) => self.progress.received(&p.id, p.bytes_received),
                Err(e) => return Err(MeshError::ProtocolViolation(e.to_string())),
            },
            Frame::End(descriptor) => match self.reassembler.on_end(&descriptor) {
                Ok(file) => {
                    let id = file.descriptor.id.clone();
                    tracing::info!(transfer = %id, bytes = file.data.len(), "file received");
                    self.progress.received(&id, file.descriptor.byte_size);
                    self.progress.complete(&id);
                    self.received.push(file.descriptor.clone());
                    self.blobs.insert(id.clone(), file);
                    self.send_frame(Frame::Ack(id.clone()), out);
                    out.push(Action::FileReceived(id));
                }
                Err(e) => {
                    if let ReceiveError::SizeMismatch { id, .. } = &e {
                        tracing::warn!(transfer = %id, "incomplete transfer discarded");
                        self.progress.fail(id);
                    }
                    return Err(MeshError::ProtocolViolation(e.to_string()));
                }
            },
            Frame::Ack(id) => {
                let matches = self.queue.active().is_some_and(|t| t.on_ack(&id));
                if matches {
                    tracing::info!(transfer = %id, "transfer acknowledged");
                    self.finish_active(Ok(()), out);
                } else {
                    tracing::debug!(transfer = %id, "ack with no matching job ignored");
                }
            }
            Frame::Heartbeat => {}
            Frame::Chat(text) => {
                let msg = self.push_chat(Author::Remote, text);
                out.push(Action::ChatReceived(msg));
            }
        }
        Ok(())
    }

    /// Host report of the channel's buffered amount, after each send.
    pub fn on_buffered_amount(&mut self, amount: u64) -> Vec<Action> {
        self.flow.on_buffered_amount(amount);
        let mut out = Vec::new();
        self.resume(&mut out);
        out
    }

    /// The channel's buffered amount fell to or below the low threshold.
    pub fn on_buffer_drained(&mut self) -> Vec<Action> {
        let level = self.flow.buffered().min(self.flow.threshold());
        self.flow.on_buffered_amount(level);
        let mut out = Vec::new();
        self.resume(&mut out);
        out
    }

    /// Completion of a `ReadChunk`. Reads from a cancelled, finished or earlier run
    /// of the job are ignored.
    pub fn on_chunk_read(
        &mut self,
        transfer_id: &TransferId,
        attempt: u64,
        offset: u64,
        bytes: Vec<u8>,
    ) -> Vec<Action> {
        let mut out = Vec::new();
        let Some(job) = self
            .queue
            .active_mut()
            .filter(|t| t.id() == transfer_id && t.attempt() == attempt)
        else {
            tracing::debug!(transfer = %transfer_id, attempt, offset, "stale read ignored");
            return out;
        };
        match job.on_chunk_read(offset, bytes, &mut self.flow) {
            Ok(actions) => self.apply_sender(actions, &mut out),
            Err(e) => self.finish_active(Err(e), &mut out),
        }
        out
    }

    pub fn on_read_failed(&mut self, transfer_id: &TransferId, attempt: u64, reason: String) -> Vec<Action> {
        let mut out = Vec::new();
        if self
            .queue
            .active()
            .is_some_and(|t| t.id() == transfer_id && t.attempt() == attempt)
        {
            tracing::warn!(transfer = %transfer_id, %reason, "source read failed");
            let err = MeshError::SourceRead {
                id: transfer_id.clone(),
                reason,
            };
            self.finish_active(Err(err), &mut out);
        }
        out
    }

    // ---- intents ----

    /// Append to the local chat log and send, or queue until the channel opens.
    pub fn send_text(&mut self, text: &str) -> Vec<Action> {
        let mut out = Vec::new();
        let text = text.trim();
        if text.is_empty() {
            return out;
        }
        self.push_chat(Author::Local, text.to_owned());
        if self.channel_ready {
            self.send_frame(Frame::Chat(text.to_owned()), &mut out);
        } else {
            self.pending_chat.push_back(text.to_owned());
        }
        out
    }

    pub fn enqueue_files(&mut self, files: Vec<TransferDescriptor>) -> Vec<Action> {
        for d in files {
            tracing::info!(transfer = %d.id, name = %d.name, size = d.byte_size, "queued");
            self.queue.enqueue(d);
        }
        let mut out = Vec::new();
        self.dispatch(&mut out);
        out
    }

    /// Cancel the active job or a queued one. The channel stays open.
    pub fn cancel(&mut self, transfer_id: &TransferId) -> Vec<Action> {
        let mut out = Vec::new();
        if self.queue.active().is_some_and(|t| t.id() == transfer_id) {
            tracing::info!(transfer = %transfer_id, "cancelling active transfer");
            self.finish_active(Err(MeshError::Cancelled(transfer_id.clone())), &mut out);
        } else if self.queue.cancel_pending(transfer_id).is_some() {
            tracing::info!(transfer = %transfer_id, "cancelled queued transfer");
            out.push(Action::ReleaseSource(transfer_id.clone()));
            out.push(Action::TransferFinished {
                transfer_id: transfer_id.clone(),
                result: Err(MeshError::Cancelled(transfer_id.clone())),
            });
        }
        out
    }

    pub fn on_dispatch_due(&mut self) -> Vec<Action> {
        self.dispatch_scheduled = false;
        let mut out = Vec::new();
        self.dispatch(&mut out);
        out
    }

    /// Periodic tick (once per second): keep-alives, heartbeats, ACK timeout, ICE restart retry.
    pub fn tick(&mut self) -> Vec<Action> {
        let mut out = Vec::new();
        let actions = self.signaling.on_tick();
        self.push_signal(actions, &mut out);
        let actions = self.negotiation.tick();
        self.push_link(actions, &mut out);

        if self.channel_ready {
            self.ticks_since_heartbeat += 1;
            if self.ticks_since_heartbeat >= self.config.channel_heartbeat_ticks {
                self.ticks_since_heartbeat = 0;
                self.send_frame(Frame::Heartbeat, &mut out);
            }
        }

        let mut expired = None;
        if let Some(job) = self.queue.active_mut() {
            if job.tick() {
                expired = Some(job.id().clone());
            }
        }
        if let Some(id) = expired {
            tracing::warn!(transfer = %id, "ack timeout");
            self.finish_active(Err(MeshError::AckTimeout(id)), &mut out);
        }
        out
    }

    /// Cancel timers, close channel and peer connection, then close signaling.
    pub fn teardown(&mut self) -> Vec<Action> {
        let mut out = vec![Action::CancelTimers, Action::CloseChannel];
        self.channel_ready = false;
        if let Some(job) = self.queue.finish_active() {
            out.push(Action::ReleaseSource(job.id().clone()));
        }
        self.progress.fail_in_flight();
        self.reassembler.abort();
        let actions = self.negotiation.close();
        self.push_link(actions, &mut out);
        let actions = self.signaling.close();
        self.push_signal(actions, &mut out);
        out
    }

    // ---- observation ----

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.session_id.clone(),
            client_id: self.client_id.clone(),
            role: self.role,
            peers: self.peers.clone(),
            connected: self.negotiation.is_connected(),
            channel_ready: self.channel_ready,
            signaling: self.signaling.status(),
            link: self.negotiation.state(),
            progress: self.progress.snapshot(),
            received: self.received.clone(),
            chat: self.chat.clone(),
            queued: self.queue.pending_len(),
        }
    }

    pub fn received_file(&self, id: &TransferId) -> Option<&ReceivedFile> {
        self.blobs.get(id)
    }

    /// Hand the payload to the host; the descriptor stays in the received list.
    pub fn take_received_file(&mut self, id: &TransferId) -> Option<ReceivedFile> {
        self.blobs.remove(id)
    }

    // ---- internals ----

    fn dispatch(&mut self, out: &mut Vec<Action>) {
        if !self.channel_ready {
            return;
        }
        let Some(job) = self.queue.dispatch(self.config.chunk_size, self.config.ack_timeout_ticks) else {
            return;
        };
        tracing::info!(transfer = %job.id(), name = %job.descriptor().name, "sending");
        self.progress.start_sending(job.descriptor());
        let actions = job.begin(&mut self.flow);
        self.apply_sender(actions, out);
    }

    fn resume(&mut self, out: &mut Vec<Action>) {
        let Some(job) = self.queue.active_mut() else {
            return;
        };
        let actions = job.on_drain(&mut self.flow);
        self.apply_sender(actions, out);
    }

    fn apply_sender(&mut self, actions: Vec<SenderAction>, out: &mut Vec<Action>) {
        let Some((id, attempt, sent)) = self
            .queue
            .active()
            .map(|t| (t.id().clone(), t.attempt(), t.bytes_sent()))
        else {
            return;
        };
        for action in actions {
            match action {
                SenderAction::Send(frame) => match wire::encode_frame(frame) {
                    Ok(msg) => out.push(Action::Send(msg)),
                    Err(e) => {
                        self.finish_active(Err(e.into()), out);
                        return;
                    }
                },
                SenderAction::Read(range) => out.push(Action::ReadChunk {
                    transfer_id: id.clone(),
                    attempt,
                    offset: range.start,
                    len: range.len(),
                }),
            }
        }
        self.progress.sent(&id, sent);
    }

    /// Clear the active slot with `result` and schedule the next job.
    fn finish_active(&mut self, result: Result<(), MeshError>, out: &mut Vec<Action>) {
        let Some(job) = self.queue.finish_active() else {
            return;
        };
        let id = job.id().clone();
        match &result {
            Ok(()) => self.progress.complete(&id),
            Err(e) => {
                tracing::warn!(transfer = %id, %e, "transfer failed");
                self.progress.fail(&id);
            }
        }
        out.push(Action::ReleaseSource(id.clone()));
        out.push(Action::TransferFinished {
            transfer_id: id,
            result,
        });
        if !self.dispatch_scheduled {
            self.dispatch_scheduled = true;
            out.push(Action::ScheduleDispatch(self.config.dispatch_delay()));
        }
    }

    fn send_frame(&mut self, frame: Frame, out: &mut Vec<Action>) {
        match wire::encode_frame(frame) {
            Ok(msg) => out.push(Action::Send(msg)),
            Err(e) => out.push(Action::Report(e.into())),
        }
    }

    fn push_chat(&mut self, author: Author, text: String) -> ChatMessage {
        let id = self.chat.len() as u64 + 1;
        let msg = ChatMessage { id, author, text };
        self.chat.push(msg.clone());
        msg
    }

    fn link_out(&mut self, actions: Vec<LinkAction>) -> Vec<Action> {
        let mut out = Vec::new();
        self.push_link(actions, &mut out);
        out
    }

    fn push_link(&mut self, actions: Vec<LinkAction>, out: &mut Vec<Action>) {
        for action in actions {
            match action {
                LinkAction::Signal(msg) => {
                    let sent = self.signaling.send(&msg);
                    self.push_signal(sent, out);
                }
                LinkAction::ConnectedChanged(up) => out.push(Action::ConnectedChanged(up)),
                LinkAction::Report(e) => out.push(Action::Report(e)),
                other => out.push(Action::Link(other)),
            }
        }
    }

    fn push_signal(&mut self, actions: Vec<SignalAction>, out: &mut Vec<Action>) {
        for action in actions {
            match action {
                SignalAction::Unavailable { attempts } => {
                    out.push(Action::Report(MeshError::SignalingUnavailable { attempts }));
                }
                other => out.push(Action::Signal(other)),
            }
        }
    }
}
