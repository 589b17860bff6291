//! Error taxonomy surfaced to the host.

use crate::ids::TransferId;
use crate::wire::FrameEncodeError;

#[derive(Debug, thiserror::Error)]
pub enum MeshError {
    /// Reconnect budget exhausted; no further automatic retry.
    #[error("signaling unavailable after {attempts} reconnect attempts")]
    SignalingUnavailable { attempts: u32 },
    #[error("negotiation failed: {0}")]
    NegotiationFailed(String),
    /// ICE restart budget exhausted; the link stays disconnected.
    #[error("connectivity lost after {attempts} ice restarts")]
    ConnectivityLost { attempts: u32 },
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("no ack for transfer {0}")]
    AckTimeout(TransferId),
    #[error("transfer {0} cancelled")]
    Cancelled(TransferId),
    #[error("channel closed while sending {0}")]
    ChannelClosedMidTransfer(TransferId),
    #[error("reading source of {id}: {reason}")]
    SourceRead { id: TransferId, reason: String },
    #[error(transparent)]
    FrameEncode(#[from] FrameEncodeError),
}

impl MeshError {
    /// Whether the failed job goes back to the head of the send queue.
    pub fn requeues(&self) -> bool {
        matches!(self, MeshError::ChannelClosedMidTransfer(_))
    }

    /// Transfer the error belongs to, for per-job failures.
    pub fn transfer_id(&self) -> Option<&TransferId> {
        match self {
            MeshError::AckTimeout(id)
            | MeshError::Cancelled(id)
            | MeshError::ChannelClosedMidTransfer(id)
            | MeshError::SourceRead { id, .. } => Some(id),
            _ => None,
        }
    }
}
