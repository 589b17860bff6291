//! Event loop: feeds relay, transport, file and timer events into the session core and runs its actions.

use std::path::PathBuf;
use std::time::Duration;

use mesh_core::{
    Action, Author, ChannelMessage, ConnectivityState, IceCandidate, NegotiationToken, Role,
    SessionCore, SessionDescription, SessionId, SignalAction, TransferId, TransferStatus,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::Config;
use crate::files::{self, SourceRegistry};
use crate::signaling::SignalingClient;
use crate::transport::{self, PeerCommand, PeerHandle};

const TICK: Duration = Duration::from_secs(1);
/// Time given to close frames before the process exits.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(250);

/// Everything that can wake the core.
pub enum HostEvent {
    SignalingOpen { generation: u64 },
    SignalingText { generation: u64, text: String },
    SignalingClosed { generation: u64 },
    ReconnectDue,
    LocalDescription(NegotiationToken, SessionDescription),
    NegotiationFailed(NegotiationToken, String),
    LocalCandidate(IceCandidate),
    Connectivity(ConnectivityState),
    ChannelOpen,
    ChannelClosed,
    ChannelMessage(ChannelMessage),
    BufferedAmount(u64),
    BufferDrained,
    ChunkRead {
        transfer_id: TransferId,
        attempt: u64,
        offset: u64,
        bytes: Vec<u8>,
    },
    ReadFailed {
        transfer_id: TransferId,
        attempt: u64,
        reason: String,
    },
    DispatchDue,
}

/// One line typed at the prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Chat(String),
    Send(Vec<PathBuf>),
    Cancel(Option<TransferId>),
    Status,
    Quit,
    Empty,
    Invalid(String),
}

pub fn parse_command(line: &str) -> Command {
    let line = line.trim();
    if line.is_empty() {
        return Command::Empty;
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Command::Chat(line.to_string());
    };
    let mut words = rest.split_whitespace();
    let verb = words.next().unwrap_or("");
    match verb {
        "send" => {
            let paths: Vec<PathBuf> = words.map(PathBuf::from).collect();
            if paths.is_empty() {
                Command::Invalid("usage: /send PATH...".into())
            } else {
                Command::Send(paths)
            }
        }
        "cancel" => Command::Cancel(words.next().map(TransferId::from)),
        "status" => Command::Status,
        "quit" | "exit" => Command::Quit,
        other => Command::Invalid(format!("unknown command /{other}")),
    }
}

struct Host {
    core: SessionCore,
    signaling: SignalingClient,
    peer: PeerHandle,
    sources: SourceRegistry,
    download_dir: PathBuf,
    events: mpsc::UnboundedSender<HostEvent>,
    reconnect: Option<JoinHandle<()>>,
    dispatch: Option<JoinHandle<()>>,
}

/// Run one session until `/quit`, Ctrl+C or SIGTERM.
pub async fn run(
    config: Config,
    session_id: SessionId,
    role: Role,
    files: Vec<PathBuf>,
) -> anyhow::Result<()> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let url = config.session_url(session_id.as_str());
    let peer = transport::spawn(
        &config.ice_servers,
        config.transfer.buffer_low_threshold,
        tx.clone(),
    )?;
    let core = SessionCore::new(session_id.clone(), role, config.transfer.clone());
    tracing::info!(session = %session_id, client = %core.client_id(), %role, "starting session");
    if role == Role::Initiator {
        println!("session code: {session_id}");
    }

    let mut host = Host {
        core,
        signaling: SignalingClient::new(url, tx.clone()),
        peer,
        sources: SourceRegistry::default(),
        download_dir: config.download_dir.clone(),
        events: tx,
        reconnect: None,
        dispatch: None,
    };
    let actions = host.core.start();
    host.apply(actions);
    if !files.is_empty() {
        host.send_files(files).await;
    }

    let mut ticker = tokio::time::interval(TICK);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            Some(event) = rx.recv() => host.on_event(event),
            _ = ticker.tick() => {
                let actions = host.core.tick();
                host.apply(actions);
            }
            line = stdin.next_line(), if stdin_open => match line {
                Ok(Some(line)) => {
                    if !host.on_command(parse_command(&line)).await {
                        break;
                    }
                }
                Ok(None) | Err(_) => stdin_open = false,
            },
            res = &mut shutdown => {
                if let Err(e) = res {
                    tracing::warn!(error = %e, "signal handler failed");
                }
                break;
            }
        }
    }

    tracing::info!("tearing down session");
    let actions = host.core.teardown();
    host.apply(actions);
    host.peer.submit(PeerCommand::Shutdown);
    tokio::time::sleep(SHUTDOWN_GRACE).await;
    Ok(())
}

/// Wait for Ctrl+C or, on Unix, SIGTERM.
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => res?,
            _ = sigterm.recv() => tracing::info!("received SIGTERM"),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}

impl Host {
    fn on_event(&mut self, event: HostEvent) {
        let actions = match event {
            HostEvent::SignalingOpen { generation } => {
                if !self.signaling.is_current(generation) {
                    return;
                }
                self.core.on_signaling_open()
            }
            HostEvent::SignalingText { generation, text } => {
                if !self.signaling.is_current(generation) {
                    return;
                }
                self.core.on_signaling_text(&text)
            }
            HostEvent::SignalingClosed { generation } => {
                if !self.signaling.is_current(generation) {
                    return;
                }
                self.core.on_signaling_closed()
            }
            HostEvent::ReconnectDue => {
                self.reconnect = None;
                self.core.on_reconnect_due()
            }
            HostEvent::LocalDescription(token, desc) => self.core.on_local_description(token, desc),
            HostEvent::NegotiationFailed(token, reason) => {
                self.core.on_negotiation_failed(token, reason)
            }
            HostEvent::LocalCandidate(c) => self.core.on_local_candidate(c),
            HostEvent::Connectivity(state) => self.core.on_connectivity_change(state),
            HostEvent::ChannelOpen => self.core.on_channel_open(),
            HostEvent::ChannelClosed => self.core.on_channel_closed(),
            HostEvent::ChannelMessage(msg) => self.core.on_channel_message(msg),
            HostEvent::BufferedAmount(n) => self.core.on_buffered_amount(n),
            HostEvent::BufferDrained => self.core.on_buffer_drained(),
            HostEvent::ChunkRead {
                transfer_id,
                attempt,
                offset,
                bytes,
            } => self.core.on_chunk_read(&transfer_id, attempt, offset, bytes),
            HostEvent::ReadFailed {
                transfer_id,
                attempt,
                reason,
            } => self.core.on_read_failed(&transfer_id, attempt, reason),
            HostEvent::DispatchDue => {
                self.dispatch = None;
                self.core.on_dispatch_due()
            }
        };
        self.apply(actions);
    }

    /// Returns false when the session should end.
    async fn on_command(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::Chat(text) => {
                let actions = self.core.send_text(&text);
                self.apply(actions);
            }
            Command::Send(paths) => self.send_files(paths).await,
            Command::Cancel(id) => {
                let id = id.or_else(|| {
                    self.core
                        .snapshot()
                        .progress
                        .into_iter()
                        .find(|(_, r)| r.status == TransferStatus::Sending)
                        .map(|(id, _)| id)
                });
                match id {
                    Some(id) => {
                        let actions = self.core.cancel(&id);
                        self.apply(actions);
                    }
                    None => println!("nothing to cancel"),
                }
            }
            Command::Status => self.print_status(),
            Command::Quit => return false,
            Command::Empty => {}
            Command::Invalid(msg) => println!("{msg}"),
        }
        true
    }

    async fn send_files(&mut self, paths: Vec<PathBuf>) {
        let mut descriptors = Vec::new();
        for path in paths {
            match files::describe(&path).await {
                Ok(d) => {
                    println!("queued {} ({} bytes) as {}", d.name, d.byte_size, d.id);
                    self.sources.insert(d.id.clone(), path);
                    descriptors.push(d);
                }
                Err(e) => println!("cannot send: {e:#}"),
            }
        }
        if !descriptors.is_empty() {
            let actions = self.core.enqueue_files(descriptors);
            self.apply(actions);
        }
    }

    fn apply(&mut self, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::Signal(signal) => self.signal(signal),
                Action::Link(link) => self.peer.submit(PeerCommand::Link(link)),
                Action::Send(msg) => self.peer.submit(PeerCommand::Send(msg)),
                Action::CloseChannel => self.peer.submit(PeerCommand::CloseChannel),
                Action::ReadChunk {
                    transfer_id,
                    attempt,
                    offset,
                    len,
                } => self.read_chunk(transfer_id, attempt, offset, len),
                Action::ReleaseSource(id) => {
                    self.sources.release(&id);
                }
                Action::ScheduleDispatch(delay) => {
                    let handle = self.after(delay, HostEvent::DispatchDue);
                    if let Some(old) = self.dispatch.replace(handle) {
                        old.abort();
                    }
                }
                Action::FileReceived(id) => self.save_received(&id),
                Action::ChatReceived(msg) => {
                    if msg.author == Author::Remote {
                        println!("peer: {}", msg.text);
                    }
                }
                Action::TransferFinished {
                    transfer_id,
                    result,
                } => match result {
                    Ok(()) => println!("sent {transfer_id}"),
                    Err(e) if e.requeues() => println!("{e}; it will be resent"),
                    Err(e) => println!("{e}"),
                },
                Action::ConnectedChanged(true) => println!("peer connected"),
                Action::ConnectedChanged(false) => println!("peer disconnected"),
                Action::Report(e) => {
                    tracing::error!(error = %e, "session error");
                    println!("error: {e}");
                }
                Action::CancelTimers => {
                    for handle in [self.reconnect.take(), self.dispatch.take()]
                        .into_iter()
                        .flatten()
                    {
                        handle.abort();
                    }
                }
            }
        }
    }

    fn signal(&mut self, action: SignalAction) {
        match action {
            SignalAction::Open(_) => self.signaling.open(),
            SignalAction::Send(text) => self.signaling.send(text),
            SignalAction::ScheduleReconnect(delay) => {
                tracing::info!(?delay, "relay reconnect scheduled");
                let handle = self.after(delay, HostEvent::ReconnectDue);
                if let Some(old) = self.reconnect.replace(handle) {
                    old.abort();
                }
            }
            SignalAction::Close => self.signaling.close(),
            SignalAction::Unavailable { attempts } => {
                tracing::warn!(attempts, "relay unavailable");
            }
        }
    }

    fn after(&self, delay: Duration, event: HostEvent) -> JoinHandle<()> {
        let events = self.events.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(event);
        })
    }

    fn read_chunk(&self, transfer_id: TransferId, attempt: u64, offset: u64, len: u64) {
        let events = self.events.clone();
        let Some(path) = self.sources.get(&transfer_id).cloned() else {
            let _ = events.send(HostEvent::ReadFailed {
                transfer_id,
                attempt,
                reason: "source no longer registered".into(),
            });
            return;
        };
        tokio::spawn(async move {
            let event = match files::read_chunk(&path, offset, len).await {
                Ok(bytes) => HostEvent::ChunkRead {
                    transfer_id,
                    attempt,
                    offset,
                    bytes,
                },
                Err(e) => HostEvent::ReadFailed {
                    transfer_id,
                    attempt,
                    reason: e.to_string(),
                },
            };
            let _ = events.send(event);
        });
    }

    fn save_received(&mut self, id: &TransferId) {
        let Some(file) = self.core.take_received_file(id) else {
            return;
        };
        let dir = self.download_dir.clone();
        tokio::spawn(async move {
            match files::save(&dir, &file.descriptor.name, &file.data).await {
                Ok(path) => println!("received {} -> {}", file.descriptor.name, path.display()),
                Err(e) => {
                    tracing::error!(error = %e, name = %file.descriptor.name, "saving received file failed");
                    println!("could not save {}: {e:#}", file.descriptor.name);
                }
            }
        });
    }

    fn print_status(&self) {
        let s = self.core.snapshot();
        println!(
            "session {} as {} ({}), peers: {}",
            s.session_id,
            s.client_id,
            s.role,
            s.peers.len()
        );
        println!(
            "relay: {:?}, link: {:?}, connected: {}, channel: {}",
            s.signaling, s.link, s.connected, s.channel_ready
        );
        println!("queued: {}, sources held: {}", s.queued, self.sources.len());
        for (id, r) in &s.progress {
            let done = r.bytes_sent.max(r.bytes_received);
            println!("  {id} {} {:?} {}/{}", r.name, r.status, done, r.total);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[tokio::test]
    async fn sigterm_ends_the_session_loop() {
        let wait = shutdown_signal();
        tokio::pin!(wait);
        // First poll installs the handlers.
        assert!(tokio::time::timeout(Duration::from_millis(50), &mut wait)
            .await
            .is_err());
        let status = std::process::Command::new("kill")
            .arg("-TERM")
            .arg(std::process::id().to_string())
            .status()
            .unwrap();
        assert!(status.success());
        let res = tokio::time::timeout(Duration::from_secs(5), wait).await;
        assert!(matches!(res, Ok(Ok(()))));
    }

    #[test]
    fn plain_lines_are_chat() {
        assert_eq!(parse_command("  hello there "), Command::Chat("hello there".into()));
        assert_eq!(parse_command("   "), Command::Empty);
    }

    #[test]
    fn slash_commands() {
        assert_eq!(
            parse_command("/send a.txt /tmp/b.bin"),
            Command::Send(vec![PathBuf::from("a.txt"), PathBuf::from("/tmp/b.bin")])
        );
        assert!(matches!(parse_command("/send"), Command::Invalid(_)));
        assert_eq!(parse_command("/cancel"), Command::Cancel(None));
        assert_eq!(
            parse_command("/cancel 1234"),
            Command::Cancel(Some(TransferId::from("1234")))
        );
        assert_eq!(parse_command("/status"), Command::Status);
        assert_eq!(parse_command("/quit"), Command::Quit);
        assert!(matches!(parse_command("/frobnicate"), Command::Invalid(_)));
    }
}
