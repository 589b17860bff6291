//! EasyMesh session core: relay signaling, peer negotiation and chunked file transfer.
//! Host-driven: no I/O; host passes events and receives actions.

pub mod chunk;
pub mod config;
pub mod error;
pub mod ids;
pub mod negotiation;
pub mod progress;
pub mod protocol;
pub mod queue;
pub mod session;
pub mod signaling;
pub mod transfer;
pub mod wire;

pub use config::CoreConfig;
pub use error::MeshError;
pub use ids::{ClientId, Role, SessionId, TransferId};
pub use negotiation::{ConnectivityState, LinkAction, NegotiationToken, PeerLinkState};
pub use progress::{ProgressRecord, TransferStatus};
pub use protocol::{IceCandidate, SdpKind, SessionDescription, SignalMessage, TransferDescriptor};
pub use session::{Action, Author, ChatMessage, SessionCore, SessionSnapshot};
pub use signaling::{LinkStatus, SignalAction};
pub use wire::{decode_frame, encode_frame, ChannelMessage, Frame, FrameDecodeError, FrameEncodeError};
