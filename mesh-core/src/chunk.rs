//! Chunk planning for outbound payloads and sequential reassembly of inbound ones.

use crate::ids::TransferId;
use crate::protocol::TransferDescriptor;

/// Default chunk size in bytes.
pub const DEFAULT_CHUNK_SIZE: u64 = 16 * 1024 * 1024; // 16 MiB

/// Byte range `[start, end)` of one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkRange {
    pub start: u64,
    pub end: u64,
}

impl ChunkRange {
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// Split a payload into contiguous fixed-size chunks. A zero chunk size falls back to the default.
pub fn split_into_chunks(total_len: u64, chunk_size: u64) -> Vec<ChunkRange> {
    let mut out = Vec::new();
    let mut offset = 0u64;
    while let Some(range) = next_chunk(offset, total_len, chunk_size) {
        offset = range.end;
        out.push(range);
    }
    out
}

/// The chunk starting at `offset`, or `None` once the payload is exhausted.
pub fn next_chunk(offset: u64, total_len: u64, chunk_size: u64) -> Option<ChunkRange> {
    if offset >= total_len {
        return None;
    }
    let size = if chunk_size == 0 {
        DEFAULT_CHUNK_SIZE
    } else {
        chunk_size
    };
    Some(ChunkRange {
        start: offset,
        end: offset.saturating_add(size).min(total_len),
    })
}

/// State of the one inbound transfer currently between START and END.
#[derive(Debug)]
pub struct InboundReceive {
    pub descriptor: TransferDescriptor,
    pub bytes_received: u64,
    chunks: Vec<Vec<u8>>,
}

/// A fully received payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFile {
    pub descriptor: TransferDescriptor,
    pub data: Vec<u8>,
}

/// Progress after a chunk was accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkProgress {
    pub id: TransferId,
    pub bytes_received: u64,
    pub total: u64,
}

/// Inbound side of the transfer protocol. Transfers are strictly sequential.
#[derive(Debug, Default)]
pub struct Reassembler {
    active: Option<InboundReceive>,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Begin a receive. A receive still in progress is abandoned and its descriptor returned.
    pub fn on_start(&mut self, descriptor: TransferDescriptor) -> Option<TransferDescriptor> {
        let abandoned = self.active.take().map(|r| r.descriptor);
        self.active = Some(InboundReceive {
            descriptor,
            bytes_received: 0,
            chunks: Vec::new(),
        });
        abandoned
    }

    /// Append the next chunk. A chunk that would overrun the declared size is dropped.
    pub fn on_chunk(&mut self, bytes: Vec<u8>) -> Result<ChunkProgress, ReceiveError> {
        let recv = self.active.as_mut().ok_or(ReceiveError::NoActiveTransfer)?;
        let after = recv.bytes_received + bytes.len() as u64;
        if after > recv.descriptor.byte_size {
            return Err(ReceiveError::Overflow {
                id: recv.descriptor.id.clone(),
                declared: recv.descriptor.byte_size,
                received: after,
            });
        }
        recv.bytes_received = after;
        recv.chunks.push(bytes);
        Ok(ChunkProgress {
            id: recv.descriptor.id.clone(),
            bytes_received: after,
            total: recv.descriptor.byte_size,
        })
    }

    /// Finalize the active receive. On a size mismatch the receive is aborted.
    pub fn on_end(&mut self, descriptor: &TransferDescriptor) -> Result<ReceivedFile, ReceiveError> {
        let recv = self.active.as_ref().ok_or(ReceiveError::NoActiveTransfer)?;
        if recv.descriptor.id != descriptor.id {
            return Err(ReceiveError::IdMismatch {
                expected: recv.descriptor.id.clone(),
                got: descriptor.id.clone(),
            });
        }
        let Some(recv) = self.active.take() else {
            return Err(ReceiveError::NoActiveTransfer);
        };
        if recv.bytes_received != recv.descriptor.byte_size {
            return Err(ReceiveError::SizeMismatch {
                id: recv.descriptor.id,
                declared: recv.descriptor.byte_size,
                received: recv.bytes_received,
            });
        }
        let mut data = Vec::with_capacity(recv.bytes_received as usize);
        for chunk in recv.chunks {
            data.extend_from_slice(&chunk);
        }
        Ok(ReceivedFile {
            descriptor: recv.descriptor,
            data,
        })
    }

    /// Drop the active receive, if any.
    pub fn abort(&mut self) -> Option<TransferDescriptor> {
        self.active.take().map(|r| r.descriptor)
    }

    pub fn active(&self) -> Option<&InboundReceive> {
        self.active.as_ref()
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ReceiveError {
    #[error("no active inbound transfer")]
    NoActiveTransfer,
    #[error("chunk overruns transfer {id}: declared {declared} bytes, would have {received}")]
    Overflow {
        id: TransferId,
        declared: u64,
        received: u64,
    },
    #[error("end for {got} while receiving {expected}")]
    IdMismatch { expected: TransferId, got: TransferId },
    #[error("transfer {id} ended with {received} of {declared} bytes")]
    SizeMismatch {
        id: TransferId,
        declared: u64,
        received: u64,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn descriptor(id: &str, size: u64) -> TransferDescriptor {
        TransferDescriptor {
            id: TransferId::from(id),
            name: format!("{id}.bin"),
            byte_size: size,
            mime_type: "application/octet-stream".into(),
            last_modified: 0,
        }
    }

    #[test]
    fn split_chunks() {
        let chunks = split_into_chunks(100, 30);
        assert_eq!(chunks.len(), 4);
        assert_eq!(chunks[0], ChunkRange { start: 0, end: 30 });
        assert_eq!(chunks[3], ChunkRange { start: 90, end: 100 });
    }

    #[test]
    fn split_exact_multiple_and_zero_length() {
        assert_eq!(split_into_chunks(90, 30).len(), 3);
        assert!(split_into_chunks(0, 30).is_empty());
    }

    #[test]
    fn forty_mib_in_sixteen_mib_chunks_is_three() {
        let mib = 1024 * 1024;
        let chunks = split_into_chunks(40 * mib, DEFAULT_CHUNK_SIZE);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[2].len(), 8 * mib);
    }

    #[test]
    fn split_zero_chunk_size_uses_default() {
        assert_eq!(split_into_chunks(DEFAULT_CHUNK_SIZE * 2, 0).len(), 2);
    }

    #[test]
    fn reassemble_in_order() {
        let mut r = Reassembler::new();
        assert!(r.on_start(descriptor("a", 5)).is_none());
        let p = r.on_chunk(vec![1, 2, 3]).unwrap();
        assert_eq!(p.bytes_received, 3);
        assert_eq!(r.on_chunk(vec![4, 5]).unwrap().bytes_received, 5);
        let file = r.on_end(&descriptor("a", 5)).unwrap();
        assert_eq!(file.data, vec![1, 2, 3, 4, 5]);
        assert!(r.active().is_none());
    }

    #[test]
    fn empty_payload_completes() {
        let mut r = Reassembler::new();
        r.on_start(descriptor("empty", 0));
        let file = r.on_end(&descriptor("empty", 0)).unwrap();
        assert!(file.data.is_empty());
    }

    #[test]
    fn chunk_or_end_without_start_is_violation() {
        let mut r = Reassembler::new();
        assert_eq!(r.on_chunk(vec![1]), Err(ReceiveError::NoActiveTransfer));
        assert_eq!(
            r.on_end(&descriptor("a", 1)),
            Err(ReceiveError::NoActiveTransfer)
        );
    }

    #[test]
    fn second_start_abandons_first() {
        let mut r = Reassembler::new();
        r.on_start(descriptor("a", 10));
        r.on_chunk(vec![0; 4]).unwrap();
        let abandoned = r.on_start(descriptor("b", 2));
        assert_eq!(abandoned.map(|d| d.id), Some(TransferId::from("a")));
        assert_eq!(r.active().map(|a| a.bytes_received), Some(0));
    }

    #[test]
    fn overflowing_chunk_dropped() {
        let mut r = Reassembler::new();
        r.on_start(descriptor("a", 3));
        r.on_chunk(vec![1, 2]).unwrap();
        assert!(matches!(
            r.on_chunk(vec![3, 4]),
            Err(ReceiveError::Overflow { .. })
        ));
        assert_eq!(r.active().map(|a| a.bytes_received), Some(2));
    }

    #[test]
    fn end_with_other_id_leaves_state() {
        let mut r = Reassembler::new();
        r.on_start(descriptor("a", 1));
        assert!(matches!(
            r.on_end(&descriptor("b", 1)),
            Err(ReceiveError::IdMismatch { .. })
        ));
        assert!(r.active().is_some());
    }

    #[test]
    fn short_end_aborts() {
        let mut r = Reassembler::new();
        r.on_start(descriptor("a", 4));
        r.on_chunk(vec![1]).unwrap();
        assert!(matches!(
            r.on_end(&descriptor("a", 4)),
            Err(ReceiveError::SizeMismatch { received: 1, .. })
        ));
        assert!(r.active().is_none());
    }

    proptest! {
        #[test]
        fn reassembles_any_split(
            data in proptest::collection::vec(any::<u8>(), 0..2048),
            chunk_size in 1u64..300,
        ) {
            let d = descriptor("p", data.len() as u64);
            let mut r = Reassembler::new();
            prop_assert!(r.on_start(d.clone()).is_none());
            for range in split_into_chunks(data.len() as u64, chunk_size) {
                prop_assert!(range.len() <= chunk_size);
                r.on_chunk(data[range.start as usize..range.end as usize].to_vec()).unwrap();
            }
            let file = r.on_end(&d).unwrap();
            prop_assert_eq!(file.descriptor, d);
            prop_assert_eq!(file.data, data);
            prop_assert!(r.active().is_none());
        }
    }
}
