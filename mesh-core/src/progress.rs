//! Per-transfer progress records, as shown to the user.

use std::collections::BTreeMap;

use crate::ids::TransferId;
use crate::protocol::TransferDescriptor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Sending,
    Receiving,
    Completed,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressRecord {
    pub name: String,
    pub total: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub status: TransferStatus,
}

impl ProgressRecord {
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self.status,
            TransferStatus::Sending | TransferStatus::Receiving
        )
    }
}

/// Progress keyed by transfer id. Updates to a record in a terminal status are ignored,
/// except that a new send attempt starts the record over.
#[derive(Debug, Default, Clone)]
pub struct ProgressBook {
    records: BTreeMap<TransferId, ProgressRecord>,
}

impl ProgressBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// New send attempt for `descriptor` (first try or after a requeue).
    pub fn start_sending(&mut self, descriptor: &TransferDescriptor) {
        self.records.insert(
            descriptor.id.clone(),
            ProgressRecord {
                name: descriptor.name.clone(),
                total: descriptor.byte_size,
                bytes_sent: 0,
                bytes_received: 0,
                status: TransferStatus::Sending,
            },
        );
    }

    pub fn start_receiving(&mut self, descriptor: &TransferDescriptor) {
        self.records.insert(
            descriptor.id.clone(),
            ProgressRecord {
                name: descriptor.name.clone(),
                total: descriptor.byte_size,
                bytes_sent: 0,
                bytes_received: 0,
                status: TransferStatus::Receiving,
            },
        );
    }

    pub fn sent(&mut self, id: &TransferId, bytes_sent: u64) {
        if let Some(r) = self.records.get_mut(id).filter(|r| r.is_in_flight()) {
            r.bytes_sent = bytes_sent;
        }
    }

    pub fn received(&mut self, id: &TransferId, bytes_received: u64) {
        if let Some(r) = self.records.get_mut(id).filter(|r| r.is_in_flight()) {
            r.bytes_received = bytes_received;
        }
    }

    pub fn complete(&mut self, id: &TransferId) {
        if let Some(r) = self.records.get_mut(id).filter(|r| r.is_in_flight()) {
            r.status = TransferStatus::Completed;
        }
    }

    /// `error` is terminal from any status.
    pub fn fail(&mut self, id: &TransferId) {
        if let Some(r) = self.records.get_mut(id) {
            r.status = TransferStatus::Error;
        }
    }

    /// Flip every sending or receiving record to `error`. Returns how many changed.
    pub fn fail_in_flight(&mut self) -> usize {
        let mut n = 0;
        for r in self.records.values_mut().filter(|r| r.is_in_flight()) {
            r.status = TransferStatus::Error;
            n += 1;
        }
        n
    }

    pub fn get(&self, id: &TransferId) -> Option<&ProgressRecord> {
        self.records.get(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&TransferId, &ProgressRecord)> {
        self.records.iter()
    }

    pub fn snapshot(&self) -> BTreeMap<TransferId, ProgressRecord> {
        self.records.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(id: &str) -> TransferDescriptor {
        TransferDescriptor {
            id: TransferId::from(id),
            name: format!("{id}.txt"),
            byte_size: 10,
            mime_type: "text/plain".into(),
            last_modified: 0,
        }
    }

    #[test]
    fn completed_is_not_reopened_by_late_updates() {
        let mut book = ProgressBook::new();
        book.start_receiving(&d("a"));
        book.received(&"a".into(), 10);
        book.complete(&"a".into());
        book.received(&"a".into(), 3);
        let r = book.get(&"a".into()).unwrap();
        assert_eq!(r.status, TransferStatus::Completed);
        assert_eq!(r.bytes_received, 10);
        assert_eq!(book.fail_in_flight(), 0);
    }

    #[test]
    fn error_is_terminal() {
        let mut book = ProgressBook::new();
        book.start_sending(&d("a"));
        book.fail(&"a".into());
        book.complete(&"a".into());
        assert_eq!(book.get(&"a".into()).unwrap().status, TransferStatus::Error);
    }

    #[test]
    fn interruption_flips_only_in_flight() {
        let mut book = ProgressBook::new();
        book.start_sending(&d("a"));
        book.start_receiving(&d("b"));
        book.start_sending(&d("c"));
        book.complete(&"c".into());
        assert_eq!(book.fail_in_flight(), 2);
        assert_eq!(book.get(&"c".into()).unwrap().status, TransferStatus::Completed);

        // Requeued send starts over.
        book.start_sending(&d("a"));
        let r = book.get(&"a".into()).unwrap();
        assert_eq!((r.status, r.bytes_sent), (TransferStatus::Sending, 0));
    }
}
