//! Relay socket: one WebSocket per connection attempt, events tagged with the attempt's generation.

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};

use crate::runtime::HostEvent;

/// Opens and closes relay sockets on the core's request. The core decides
/// when to reconnect; this type never retries on its own.
pub struct SignalingClient {
    url: String,
    events: mpsc::UnboundedSender<HostEvent>,
    outbound: Option<mpsc::UnboundedSender<Message>>,
    generation: u64,
}

impl SignalingClient {
    pub fn new(url: String, events: mpsc::UnboundedSender<HostEvent>) -> Self {
        Self {
            url,
            events,
            outbound: None,
            generation: 0,
        }
    }

    /// Events from older sockets carry an older generation and are dropped by the runtime.
    pub fn is_current(&self, generation: u64) -> bool {
        generation == self.generation
    }

    /// Start a new connection attempt, abandoning any previous socket.
    pub fn open(&mut self) {
        self.generation += 1;
        let generation = self.generation;
        let (tx, rx) = mpsc::unbounded_channel();
        self.outbound = Some(tx);
        let url = self.url.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            run_socket(url, generation, rx, events).await;
        });
    }

    pub fn send(&self, text: String) {
        match &self.outbound {
            Some(tx) if tx.send(Message::Text(text)).is_ok() => {}
            _ => tracing::debug!("signaling message dropped, socket is down"),
        }
    }

    /// Close the current socket. Dropping the sender ends the writer, which sends a close frame.
    pub fn close(&mut self) {
        self.generation += 1;
        self.outbound = None;
    }
}

async fn run_socket(
    url: String,
    generation: u64,
    mut outbound: mpsc::UnboundedReceiver<Message>,
    events: mpsc::UnboundedSender<HostEvent>,
) {
    tracing::info!(%url, generation, "connecting to relay");
    let (ws, _) = match connect_async(url.as_str()).await {
        Ok(ok) => ok,
        Err(e) => {
            tracing::warn!(%url, error = %e, "relay connect failed");
            let _ = events.send(HostEvent::SignalingClosed { generation });
            return;
        }
    };
    let _ = events.send(HostEvent::SignalingOpen { generation });
    let (mut write, mut read) = ws.split();

    let writer = tokio::spawn(async move {
        while let Some(msg) = outbound.recv().await {
            if write.send(msg).await.is_err() {
                return;
            }
        }
        let _ = write.send(Message::Close(None)).await;
    });

    while let Some(msg) = read.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                let _ = events.send(HostEvent::SignalingText { generation, text });
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(error = %e, "relay socket error");
                break;
            }
        }
    }
    writer.abort();
    tracing::info!(generation, "relay socket closed");
    let _ = events.send(HostEvent::SignalingClosed { generation });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unreachable_relay_reports_closed_for_its_generation() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        // Port 9 (discard) on loopback refuses connections in test environments.
        let mut client = SignalingClient::new("ws://127.0.0.1:9/api/ws/session/X".into(), tx);
        client.open();
        assert!(client.is_current(1));
        match rx.recv().await {
            Some(HostEvent::SignalingClosed { generation }) => assert_eq!(generation, 1),
            _ => panic!("expected SignalingClosed"),
        }
        client.close();
        assert!(!client.is_current(1));
        client.send("dropped".into());
    }
}
