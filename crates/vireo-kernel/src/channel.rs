//! Synchronous, bidirectional message-passing endpoints with move-semantics
//! handle transfer.
//!
//! A channel owns two embedded endpoints at fixed indices 0 and 1. Sending
//! on endpoint `id` appends to the peer's (`1 - id`) inbound queue; the two
//! endpoints share one [`ChannelInner`] so Rust's own `Rc` drop glue frees
//! the channel exactly when both sides have closed, matching invariant 4.

use crate::error::{KernelError, KernelResult};
use crate::object::Object;
use crate::rights::Rights;
use crate::thread::wait::WaitQueue;
use crate::thread::ThreadManager;
use crate::types::Tid;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::sync::Arc;

pub const MAX_QUEUE: usize = 64;
pub const MAX_MSG_SIZE: usize = 4096;
pub const MAX_MSG_HANDLES: usize = 16;

/// One queued message: an optional byte payload plus any transferred
/// capabilities, each carrying the rights they held at send time.
pub struct Entry {
    pub data: Option<Vec<u8>>,
    pub handles: Vec<(Arc<Object>, Rights)>,
}

struct ChannelInner {
    queues: [VecDeque<Entry>; 2],
    closed: [bool; 2],
    /// Threads parked in a blocking recv on each endpoint, woken FIFO by
    /// the peer's next send.
    waiters: [WaitQueue; 2],
}

impl ChannelInner {
    fn peer(id: usize) -> usize {
        1 - id
    }
}

/// The `CHANNEL_ENDPOINT` object kind. `id` is this endpoint's index (0 or
/// 1) into the shared [`ChannelInner`].
pub struct ChannelEndpointObject {
    id: usize,
    inner: Rc<RefCell<ChannelInner>>,
}

// A ChannelEndpointObject is only ever touched from the single kernel
// thread driving this simulation; the Rc/RefCell sharing never crosses a
// real OS thread boundary.
unsafe impl Send for ChannelEndpointObject {}
unsafe impl Sync for ChannelEndpointObject {}

impl ChannelEndpointObject {
    /// Create a channel, returning its two endpoint objects (indices 0 and
    /// 1 respectively) ready to be granted as handles.
    pub fn create_pair() -> (ChannelEndpointObject, ChannelEndpointObject) {
        let inner = Rc::new(RefCell::new(ChannelInner {
            queues: [VecDeque::new(), VecDeque::new()],
            closed: [false, false],
            waiters: [WaitQueue::new(), WaitQueue::new()],
        }));
        (
            ChannelEndpointObject { id: 0, inner: inner.clone() },
            ChannelEndpointObject { id: 1, inner },
        )
    }

    pub fn peer_closed(&self) -> bool {
        self.inner.borrow().closed[ChannelInner::peer(self.id)]
    }

    pub fn queue_len(&self) -> usize {
        self.inner.borrow().queues[self.id].len()
    }

    pub fn peer_queue_len(&self) -> usize {
        self.inner.borrow().queues[ChannelInner::peer(self.id)].len()
    }

    /// Non-blocking send: validate fully, move handles only on success, and
    /// enqueue at the tail of the peer's FIFO, waking one sleeper blocked in
    /// a recv on that peer. `handles` are resolved by the caller (the
    /// kernel, against the sending process's handle table) into
    /// `(object, rights)` pairs that already carry a fresh reference; this
    /// function only validates sizes and performs the enqueue.
    pub fn send(
        &self,
        data: Option<Vec<u8>>,
        handles: Vec<(Arc<Object>, Rights)>,
        threads: &mut ThreadManager,
    ) -> KernelResult<Option<Tid>> {
        if let Some(d) = &data {
            if d.len() > MAX_MSG_SIZE {
                return Err(KernelError::MessageTooLarge);
            }
        }
        if handles.len() > MAX_MSG_HANDLES {
            return Err(KernelError::TooManyHandles);
        }

        let mut inner = self.inner.borrow_mut();
        let peer = ChannelInner::peer(self.id);
        if inner.closed[peer] {
            return Err(KernelError::PeerClosed);
        }
        if inner.queues[peer].len() >= MAX_QUEUE {
            return Err(KernelError::QueueFull);
        }

        inner.queues[peer].push_back(Entry { data, handles });
        Ok(threads.thread_wake_one(&mut inner.waiters[peer]))
    }

    /// Non-blocking receive: dequeue the head of this endpoint's own
    /// inbound queue. `WouldBlock` if empty and the peer is still open,
    /// `PeerClosed` if empty and the peer has closed.
    pub fn try_recv(&self) -> KernelResult<Entry> {
        let mut inner = self.inner.borrow_mut();
        if let Some(entry) = inner.queues[self.id].pop_front() {
            return Ok(entry);
        }
        if inner.closed[ChannelInner::peer(self.id)] {
            Err(KernelError::PeerClosed)
        } else {
            Err(KernelError::WouldBlock)
        }
    }

    /// Block the current thread on this endpoint's recv wait queue. The
    /// caller must re-check `try_recv` in a loop after waking (spurious
    /// wakes are permitted, per §4.5).
    pub fn block_current_recv(&self, threads: &mut ThreadManager) -> KernelResult<Tid> {
        let mut inner = self.inner.borrow_mut();
        threads.thread_sleep(&mut inner.waiters[self.id])
    }

    /// Mark this endpoint closed, discarding any messages still queued in
    /// its own inbound queue (and, transitively, the object references and
    /// buffers they hold). Matches the "discard" resolution of the open
    /// question on close-with-pending-messages.
    pub fn close(&self) {
        let mut inner = self.inner.borrow_mut();
        inner.closed[self.id] = true;
        inner.queues[self.id].clear();
    }
}

impl Drop for ChannelEndpointObject {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{Object, ObjectKind};
    use crate::types::Pid;

    fn vmo_object() -> Arc<Object> {
        Arc::new(Object::new(ObjectKind::Vmo(std::sync::Mutex::new(
            crate::vmo::VmoObject::new(64, crate::vmo::VmoFlags::empty()),
        ))))
    }

    fn threads() -> ThreadManager {
        ThreadManager::new(Pid::KERNEL)
    }

    #[test]
    fn send_then_recv_delivers_data_and_handles() {
        let (ep0, ep1) = ChannelEndpointObject::create_pair();
        let vmo = vmo_object();
        let mut tm = threads();
        ep0.send(Some(vec![b'X']), vec![(vmo.clone(), Rights::READ)], &mut tm).unwrap();

        let entry = ep1.try_recv().unwrap();
        assert_eq!(entry.data.as_deref(), Some(&[b'X'][..]));
        assert_eq!(entry.handles.len(), 1);
        assert!(Arc::ptr_eq(&entry.handles[0].0, &vmo));
    }

    #[test]
    fn recv_on_empty_open_channel_would_block() {
        let (ep0, _ep1) = ChannelEndpointObject::create_pair();
        assert_eq!(ep0.try_recv().unwrap_err(), KernelError::WouldBlock);
    }

    #[test]
    fn peer_closed_surfaces_on_send_and_empty_recv() {
        let (ep0, ep1) = ChannelEndpointObject::create_pair();
        drop(ep1);
        let mut tm = threads();
        assert_eq!(ep0.send(None, vec![], &mut tm).unwrap_err(), KernelError::PeerClosed);
        assert_eq!(ep0.try_recv().unwrap_err(), KernelError::PeerClosed);
    }

    #[test]
    fn oversized_message_rejected() {
        let (ep0, _ep1) = ChannelEndpointObject::create_pair();
        let mut tm = threads();
        let big = vec![0u8; MAX_MSG_SIZE + 1];
        assert_eq!(ep0.send(Some(big), vec![], &mut tm).unwrap_err(), KernelError::MessageTooLarge);
        let exact = vec![0u8; MAX_MSG_SIZE];
        assert!(ep0.send(Some(exact), vec![], &mut tm).is_ok());
    }

    #[test]
    fn too_many_handles_rejected() {
        let (ep0, _ep1) = ChannelEndpointObject::create_pair();
        let mut tm = threads();
        let handles = (0..MAX_MSG_HANDLES + 1)
            .map(|_| (vmo_object(), Rights::READ))
            .collect();
        assert_eq!(ep0.send(None, handles, &mut tm).unwrap_err(), KernelError::TooManyHandles);
    }

    #[test]
    fn close_discards_pending_messages() {
        let (ep0, ep1) = ChannelEndpointObject::create_pair();
        let mut tm = threads();
        ep0.send(Some(vec![1, 2, 3]), vec![], &mut tm).unwrap();
        assert_eq!(ep1.queue_len(), 1);
        ep1.close();
        assert_eq!(ep1.queue_len(), 0);
    }

    #[test]
    fn blocking_recv_wakes_on_send() {
        let (ep0, ep1) = ChannelEndpointObject::create_pair();
        let mut tm = threads();
        let waiter = tm.create_thread(Pid::KERNEL, crate::thread::tcb::Entry::Kernel { label: "waiter" });
        tm.schedule();
        assert_eq!(tm.current(), Some(waiter));

        assert_eq!(ep1.try_recv().unwrap_err(), KernelError::WouldBlock);
        ep1.block_current_recv(&mut tm).unwrap();
        assert_eq!(tm.get(waiter).unwrap().state, crate::thread::tcb::ThreadState::Blocked);

        let woken = ep0.send(Some(vec![9]), vec![], &mut tm).unwrap();
        assert_eq!(woken, Some(waiter));
        assert_eq!(tm.get(waiter).unwrap().state, crate::thread::tcb::ThreadState::Ready);
    }
}
