//! Outbound side of the transfer protocol: START, chunks under backpressure,
//! END, then wait for the receiver's ACK.

use crate::chunk::{self, ChunkRange};
use crate::error::MeshError;
use crate::ids::TransferId;
use crate::protocol::TransferDescriptor;
use crate::wire::Frame;

/// Sender-side estimate of bytes queued in the channel but not yet on the network.
#[derive(Debug, Clone)]
pub struct FlowControl {
    buffered: u64,
    threshold: u64,
}

impl FlowControl {
    pub fn new(threshold: u64) -> Self {
        Self {
            buffered: 0,
            threshold,
        }
    }

    /// Chunk emission is suspended while this holds.
    pub fn must_wait(&self) -> bool {
        self.buffered > self.threshold
    }

    pub fn record_sent(&mut self, len: u64) {
        self.buffered = self.buffered.saturating_add(len);
    }

    /// Host report of the channel's actual buffered amount.
    pub fn on_buffered_amount(&mut self, amount: u64) {
        self.buffered = amount;
    }

    pub fn buffered(&self) -> u64 {
        self.buffered
    }

    pub fn threshold(&self) -> u64 {
        self.threshold
    }

    pub fn reset(&mut self) {
        self.buffered = 0;
    }
}

/// What the sender needs from the host next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SenderAction {
    Send(Frame),
    /// Read this range of the source and hand it back via `on_chunk_read`.
    Read(ChunkRange),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Phase {
    NotStarted,
    Reading(ChunkRange),
    /// Buffer above threshold; a chunk already read may be held back.
    WaitingDrain { held: Option<Vec<u8>> },
    AwaitingAck { waited: u64 },
}

/// One in-flight outbound job.
#[derive(Debug)]
pub struct OutboundTransfer {
    descriptor: TransferDescriptor,
    chunk_size: u64,
    ack_timeout_ticks: u64,
    attempt: u64,
    next_offset: u64,
    bytes_sent: u64,
    phase: Phase,
}

impl OutboundTransfer {
    pub fn new(descriptor: TransferDescriptor, chunk_size: u64, ack_timeout_ticks: u64) -> Self {
        Self {
            descriptor,
            chunk_size,
            ack_timeout_ticks,
            attempt: 0,
            next_offset: 0,
            bytes_sent: 0,
            phase: Phase::NotStarted,
        }
    }

    /// Tag this run of the job. Reads issued by an earlier run carry an older value.
    pub fn with_attempt(mut self, attempt: u64) -> Self {
        self.attempt = attempt;
        self
    }

    pub fn attempt(&self) -> u64 {
        self.attempt
    }

    pub fn id(&self) -> &TransferId {
        &self.descriptor.id
    }

    pub fn descriptor(&self) -> &TransferDescriptor {
        &self.descriptor
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    pub fn is_awaiting_ack(&self) -> bool {
        matches!(self.phase, Phase::AwaitingAck { .. })
    }

    pub fn is_waiting_drain(&self) -> bool {
        matches!(self.phase, Phase::WaitingDrain { .. })
    }

    /// Emit START and request the first chunk (or END for an empty payload).
    pub fn begin(&mut self, flow: &mut FlowControl) -> Vec<SenderAction> {
        if self.phase != Phase::NotStarted {
            return Vec::new();
        }
        let mut out = vec![SenderAction::Send(Frame::Start(self.descriptor.clone()))];
        self.advance(flow, &mut out);
        out
    }

    /// Bytes for the range last requested. A short or misplaced read fails the job.
    pub fn on_chunk_read(
        &mut self,
        offset: u64,
        bytes: Vec<u8>,
        flow: &mut FlowControl,
    ) -> Result<Vec<SenderAction>, MeshError> {
        let Phase::Reading(range) = self.phase else {
            return Err(self.read_error(format!("unexpected read at offset {offset}")));
        };
        if range.start != offset || range.len() != bytes.len() as u64 {
            return Err(self.read_error(format!(
                "expected {} bytes at {}, got {} at {}",
                range.len(),
                range.start,
                bytes.len(),
                offset
            )));
        }
        self.next_offset = range.end;
        let mut out = Vec::new();
        if flow.must_wait() {
            self.phase = Phase::WaitingDrain { held: Some(bytes) };
            return Ok(out);
        }
        self.emit_chunk(bytes, flow, &mut out);
        self.advance(flow, &mut out);
        Ok(out)
    }

    /// The channel drained below threshold. Resumes from the next unsent chunk.
    pub fn on_drain(&mut self, flow: &mut FlowControl) -> Vec<SenderAction> {
        let mut out = Vec::new();
        if flow.must_wait() {
            return out;
        }
        let held = match &mut self.phase {
            Phase::WaitingDrain { held } => held.take(),
            _ => return out,
        };
        if let Some(bytes) = held {
            self.emit_chunk(bytes, flow, &mut out);
        }
        self.advance(flow, &mut out);
        out
    }

    /// True when `id` is the ACK this job is waiting for.
    pub fn on_ack(&self, id: &TransferId) -> bool {
        self.is_awaiting_ack() && &self.descriptor.id == id
    }

    /// Advance the ACK wait by one tick; true once the wait has run out.
    pub fn tick(&mut self) -> bool {
        if let Phase::AwaitingAck { waited } = &mut self.phase {
            *waited += 1;
            return *waited >= self.ack_timeout_ticks;
        }
        false
    }

    fn emit_chunk(&mut self, bytes: Vec<u8>, flow: &mut FlowControl, out: &mut Vec<SenderAction>) {
        let len = bytes.len() as u64;
        self.bytes_sent += len;
        flow.record_sent(len);
        out.push(SenderAction::Send(Frame::Chunk(bytes)));
    }

    fn advance(&mut self, flow: &FlowControl, out: &mut Vec<SenderAction>) {
        match chunk::next_chunk(self.next_offset, self.descriptor.byte_size, self.chunk_size) {
            None => {
                out.push(SenderAction::Send(Frame::End(self.descriptor.clone())));
                self.phase = Phase::AwaitingAck { waited: 0 };
            }
            Some(_) if flow.must_wait() => {
                self.phase = Phase::WaitingDrain { held: None };
            }
            Some(range) => {
                self.phase = Phase::Reading(range);
                out.push(SenderAction::Read(range));
            }
        }
    }

    fn read_error(&self, reason: String) -> MeshError {
        MeshError::SourceRead {
            id: self.descriptor.id.clone(),
            reason,
        }
    }
}
