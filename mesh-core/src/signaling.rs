//! Signaling link: reconnecting, order-preserving pipe to the relay.
//! Host-driven like the rest of the core: socket events in, socket actions out.

use std::collections::VecDeque;
use std::time::Duration;

use crate::config::CoreConfig;
use crate::ids::SessionId;
use crate::protocol::{encode_signal, SignalMessage};

/// Where the link is in its connect / backoff cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    Idle,
    Connecting,
    Open,
    Backoff { attempt: u32 },
    /// Reconnect budget exhausted.
    Unavailable,
    /// Closed locally.
    Closed,
}

/// Socket operations for the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalAction {
    /// Open a socket for this session.
    Open(SessionId),
    Send(String),
    /// Call `on_reconnect_due` after this delay.
    ScheduleReconnect(Duration),
    Close,
    /// Terminal: no further automatic retry.
    Unavailable { attempts: u32 },
}

pub struct SignalingLink {
    session: SessionId,
    join: SignalMessage,
    status: LinkStatus,
    outbox: VecDeque<String>,
    attempts: u32,
    ticks_since_ping: u64,
    keepalive_ticks: u64,
    base: Duration,
    cap: Duration,
    max_attempts: u32,
}

impl SignalingLink {
    /// `join` is sent first on every socket open and is never queued.
    pub fn new(session: SessionId, join: SignalMessage, config: &CoreConfig) -> Self {
        Self {
            session,
            join,
            status: LinkStatus::Idle,
            outbox: VecDeque::new(),
            attempts: 0,
            ticks_since_ping: 0,
            keepalive_ticks: config.keepalive_ticks,
            base: config.reconnect_base(),
            cap: config.reconnect_cap(),
            max_attempts: config.max_reconnect_attempts,
        }
    }

    pub fn session(&self) -> &SessionId {
        &self.session
    }

    pub fn status(&self) -> LinkStatus {
        self.status
    }

    pub fn is_open(&self) -> bool {
        self.status == LinkStatus::Open
    }

    pub fn queued_len(&self) -> usize {
        self.outbox.len()
    }

    pub fn connect(&mut self) -> Vec<SignalAction> {
        match self.status {
            LinkStatus::Idle | LinkStatus::Closed => {
                self.status = LinkStatus::Connecting;
                vec![SignalAction::Open(self.session.clone())]
            }
            _ => Vec::new(),
        }
    }

    /// Socket opened: send `join`, then flush everything queued in order.
    pub fn on_open(&mut self) -> Vec<SignalAction> {
        if self.status == LinkStatus::Closed {
            return vec![SignalAction::Close];
        }
        self.status = LinkStatus::Open;
        self.attempts = 0;
        self.ticks_since_ping = 0;
        let mut out = Vec::with_capacity(self.outbox.len() + 1);
        match encode_signal(&self.join) {
            Ok(text) => out.push(SignalAction::Send(text)),
            Err(e) => tracing::error!(%e, "encoding join"),
        }
        if !self.outbox.is_empty() {
            tracing::debug!(queued = self.outbox.len(), "flushing signaling queue");
        }
        out.extend(self.outbox.drain(..).map(SignalAction::Send));
        out
    }

    /// Send now if open, otherwise queue. Keep-alives are dropped while disconnected.
    pub fn send(&mut self, msg: &SignalMessage) -> Vec<SignalAction> {
        let text = match encode_signal(msg) {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(%e, "dropping unencodable signal");
                return Vec::new();
            }
        };
        if self.is_open() {
            return vec![SignalAction::Send(text)];
        }
        if msg.is_keepalive() {
            return Vec::new();
        }
        match self.status {
            LinkStatus::Unavailable | LinkStatus::Closed => {
                tracing::debug!(status = ?self.status, "signaling down, dropping message");
            }
            _ => self.outbox.push_back(text),
        }
        Vec::new()
    }

    /// Socket closed or failed to open. Schedules a reconnect until the budget runs out.
    pub fn on_closed(&mut self) -> Vec<SignalAction> {
        match self.status {
            LinkStatus::Closed | LinkStatus::Unavailable => return Vec::new(),
            _ => {}
        }
        if self.attempts >= self.max_attempts {
            self.status = LinkStatus::Unavailable;
            self.outbox.clear();
            tracing::error!(attempts = self.attempts, "signaling unavailable");
            return vec![SignalAction::Unavailable {
                attempts: self.attempts,
            }];
        }
        self.attempts += 1;
        let delay = self.backoff(self.attempts);
        self.status = LinkStatus::Backoff {
            attempt: self.attempts,
        };
        tracing::info!(attempt = self.attempts, ?delay, "signaling closed, reconnecting");
        vec![SignalAction::ScheduleReconnect(delay)]
    }

    pub fn on_reconnect_due(&mut self) -> Vec<SignalAction> {
        match self.status {
            LinkStatus::Backoff { .. } => {
                self.status = LinkStatus::Connecting;
                vec![SignalAction::Open(self.session.clone())]
            }
            _ => Vec::new(),
        }
    }

    /// One tick; emits a keep-alive every `keepalive_ticks` while open.
    pub fn on_tick(&mut self) -> Vec<SignalAction> {
        if !self.is_open() {
            return Vec::new();
        }
        self.ticks_since_ping += 1;
        if self.ticks_since_ping < self.keepalive_ticks {
            return Vec::new();
        }
        self.ticks_since_ping = 0;
        self.send(&SignalMessage::Ping)
    }

    pub fn close(&mut self) -> Vec<SignalAction> {
        let was = self.status;
        self.status = LinkStatus::Closed;
        self.outbox.clear();
        match was {
            LinkStatus::Closed | LinkStatus::Idle => Vec::new(),
            _ => vec![SignalAction::Close],
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.cap)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{ClientId, Role};

    fn link() -> SignalingLink {
        let join = SignalMessage::Join {
            client_id: ClientId::from("A"),
            role: Role::Initiator,
        };
        SignalingLink::new(SessionId::from("S1"), join, &CoreConfig::default())
    }

    fn sent(actions: &[SignalAction]) -> Vec<String> {
        actions
            .iter()
            .filter_map(|a| match a {
                SignalAction::Send(s) => Some(s.clone()),
                _ => None,
            })
            .collect()
    }

    fn text(body: &str) -> SignalMessage {
        SignalMessage::Text {
            from: None,
            to: None,
            data: body.into(),
        }
    }

    #[test]
    fn join_first_then_queue_in_order() {
        let mut l = link();
        assert_eq!(l.connect(), vec![SignalAction::Open(SessionId::from("S1"))]);
        assert!(l.send(&text("one")).is_empty());
        assert!(l.send(&text("two")).is_empty());
        assert!(l.send(&SignalMessage::Ping).is_empty());
        assert_eq!(l.queued_len(), 2);

        let out = sent(&l.on_open());
        assert_eq!(out.len(), 3);
        assert!(out[0].contains("\"join\""));
        assert!(out[1].contains("one"));
        assert!(out[2].contains("two"));
        assert_eq!(l.queued_len(), 0);
        assert_eq!(sent(&l.send(&text("three"))).len(), 1);
    }

    #[test]
    fn backoff_doubles_and_gives_up() {
        let mut l = link();
        l.connect();
        l.on_open();
        let mut delays = Vec::new();
        loop {
            let actions = l.on_closed();
            match actions.as_slice() {
                [SignalAction::ScheduleReconnect(d)] => {
                    delays.push(d.as_secs());
                    l.on_reconnect_due();
                }
                [SignalAction::Unavailable { attempts }] => {
                    assert_eq!(*attempts, 5);
                    break;
                }
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(delays, vec![1, 2, 4, 8, 16]);
        assert_eq!(l.status(), LinkStatus::Unavailable);
        assert!(l.on_closed().is_empty());
    }

    #[test]
    fn backoff_is_capped() {
        let mut cfg = CoreConfig::default();
        cfg.max_reconnect_attempts = 10;
        let mut l = SignalingLink::new(SessionId::from("S"), SignalMessage::Ping, &cfg);
        assert_eq!(l.backoff(6), Duration::from_secs(30));
        assert_eq!(l.backoff(40), Duration::from_secs(30));
        l.connect();
        assert_eq!(l.on_closed(), vec![SignalAction::ScheduleReconnect(Duration::from_secs(1))]);
    }

    #[test]
    fn successful_open_resets_attempts() {
        let mut l = link();
        l.connect();
        l.on_closed();
        l.on_reconnect_due();
        l.on_closed();
        l.on_reconnect_due();
        l.on_open();
        assert_eq!(
            l.on_closed(),
            vec![SignalAction::ScheduleReconnect(Duration::from_secs(1))]
        );
    }

    #[test]
    fn keepalive_only_while_open() {
        let mut l = link();
        l.connect();
        for _ in 0..30 {
            assert!(l.on_tick().is_empty());
        }
        l.on_open();
        let pings: usize = (0..50).map(|_| sent(&l.on_tick()).len()).sum();
        assert_eq!(pings, 2);
    }

    #[test]
    fn close_is_final() {
        let mut l = link();
        l.connect();
        l.on_open();
        assert_eq!(l.close(), vec![SignalAction::Close]);
        assert!(l.on_closed().is_empty());
        assert!(l.send(&text("late")).is_empty());
        assert_eq!(l.queued_len(), 0);
    }
}
