//! Send queue: FIFO of outbound jobs with at most one active at a time.

use std::collections::VecDeque;

use crate::ids::TransferId;
use crate::protocol::TransferDescriptor;
use crate::transfer::OutboundTransfer;

#[derive(Debug, Default)]
pub struct SendQueue {
    pending: VecDeque<TransferDescriptor>,
    active: Option<OutboundTransfer>,
    attempts: u64,
}

impl SendQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, descriptor: TransferDescriptor) {
        self.pending.push_back(descriptor);
    }

    /// Promote the head job if nothing is active. Returns the newly active job.
    /// Every promotion gets a fresh attempt number, including a requeued job's retry.
    pub fn dispatch(
        &mut self,
        chunk_size: u64,
        ack_timeout_ticks: u64,
    ) -> Option<&mut OutboundTransfer> {
        if self.active.is_some() {
            return None;
        }
        let descriptor = self.pending.pop_front()?;
        self.attempts += 1;
        self.active = Some(
            OutboundTransfer::new(descriptor, chunk_size, ack_timeout_ticks).with_attempt(self.attempts),
        );
        self.active.as_mut()
    }

    pub fn active(&self) -> Option<&OutboundTransfer> {
        self.active.as_ref()
    }

    pub fn active_mut(&mut self) -> Option<&mut OutboundTransfer> {
        self.active.as_mut()
    }

    /// Clear the active slot (completion or terminal failure).
    pub fn finish_active(&mut self) -> Option<OutboundTransfer> {
        self.active.take()
    }

    /// Put the active job back at the head. It restarts from offset zero.
    pub fn requeue_active(&mut self) -> Option<TransferId> {
        let job = self.active.take()?;
        let id = job.id().clone();
        self.pending.push_front(job.descriptor().clone());
        Some(id)
    }

    /// Remove a job that has not started yet.
    pub fn cancel_pending(&mut self, id: &TransferId) -> Option<TransferDescriptor> {
        let pos = self.pending.iter().position(|d| &d.id == id)?;
        self.pending.remove(pos)
    }

    pub fn is_idle(&self) -> bool {
        self.active.is_none()
    }

    pub fn pending(&self) -> impl Iterator<Item = &TransferDescriptor> {
        self.pending.iter()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn descriptor(id: &str) -> TransferDescriptor {
        TransferDescriptor {
            id: TransferId::from(id),
            name: id.into(),
            byte_size: 1,
            mime_type: String::new(),
            last_modified: 0,
        }
    }

    #[test]
    fn dispatch_is_single_flight() {
        let mut q = SendQueue::new();
        q.enqueue(descriptor("a"));
        q.enqueue(descriptor("b"));
        assert_eq!(q.dispatch(10, 30).map(|t| t.id().clone()), Some("a".into()));
        assert!(q.dispatch(10, 30).is_none());
        q.finish_active();
        assert_eq!(q.dispatch(10, 30).map(|t| t.id().clone()), Some("b".into()));
    }

    #[test]
    fn requeue_puts_job_at_head() {
        let mut q = SendQueue::new();
        q.enqueue(descriptor("a"));
        q.enqueue(descriptor("b"));
        q.dispatch(10, 30);
        assert_eq!(q.requeue_active(), Some(TransferId::from("a")));
        assert!(q.is_idle());
        let order: Vec<_> = q.pending().map(|d| d.id.as_str().to_owned()).collect();
        assert_eq!(order, vec!["a", "b"]);
    }

    #[test]
    fn redispatch_after_requeue_gets_new_attempt() {
        let mut q = SendQueue::new();
        q.enqueue(descriptor("a"));
        let first = q.dispatch(10, 30).map(|t| t.attempt());
        q.requeue_active();
        let second = q.dispatch(10, 30).map(|t| (t.id().clone(), t.attempt()));
        assert_eq!(second.as_ref().map(|(id, _)| id.as_str()), Some("a"));
        assert_ne!(first, second.map(|(_, n)| n));
    }

    #[test]
    fn cancel_pending_removes_only_that_job() {
        let mut q = SendQueue::new();
        for id in ["a", "b", "c"] {
            q.enqueue(descriptor(id));
        }
        assert!(q.cancel_pending(&"b".into()).is_some());
        assert!(q.cancel_pending(&"zz".into()).is_none());
        assert_eq!(q.pending_len(), 2);
    }

    proptest! {
        #[test]
        fn processes_jobs_fifo(count in 0usize..40, requeue_at in proptest::option::of(0usize..40)) {
            let mut q = SendQueue::new();
            let ids: Vec<String> = (0..count).map(|i| format!("job-{i}")).collect();
            for id in &ids {
                q.enqueue(descriptor(id));
            }
            let mut done = Vec::new();
            let mut step = 0usize;
            let mut requeued = false;
            while let Some(job) = q.dispatch(1, 30) {
                let id = job.id().as_str().to_owned();
                prop_assert!(q.dispatch(1, 30).is_none());
                if !requeued && Some(step) == requeue_at {
                    requeued = true;
                    q.requeue_active();
                } else {
                    q.finish_active();
                    done.push(id);
                }
                step += 1;
            }
            prop_assert_eq!(done, ids);
        }
    }
}
