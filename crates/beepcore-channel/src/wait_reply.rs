//! Synchronous send-and-wait support.
//!
//! A [`WaitReply`] is registered on a channel when a message is sent with
//! [`Channel::send_msg_and_wait`](crate::Channel::send_msg_and_wait). When a
//! RPY or ERR for that message number arrives, the reader hands the frame to
//! the waiter directly instead of dispatching it through the worker pool.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use beepcore_frame::Frame;
use beepcore_pool::sync::lock;
use beepcore_pool::BlockingQueue;

/// A pending synchronous reply.
pub struct WaitReply {
    msgno: Mutex<Option<u32>>,
    replies: BlockingQueue<Frame>,
}

impl WaitReply {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            msgno: Mutex::new(None),
            replies: BlockingQueue::new(),
        })
    }

    /// Message number whose reply is awaited, once the message was sent.
    pub fn msgno(&self) -> Option<u32> {
        *lock(&self.msgno)
    }

    pub(crate) fn set_msgno(&self, msgno: u32) {
        *lock(&self.msgno) = Some(msgno);
    }

    /// Hand a reply to the waiter.
    pub fn push(&self, frame: Frame) {
        self.replies.push(frame);
    }

    /// True when a reply is queued and not yet taken.
    pub fn has_reply(&self) -> bool {
        !self.replies.is_empty()
    }

    pub(crate) fn pop_timeout(&self, timeout: Duration) -> Option<Frame> {
        self.replies.pop_timeout(timeout)
    }
}

impl fmt::Debug for WaitReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaitReply")
            .field("msgno", &self.msgno())
            .field("queued", &self.replies.len())
            .finish()
    }
}

/// Waiters of one channel in message order.
#[derive(Default)]
pub(crate) struct WaitRegistry {
    waiting: Mutex<VecDeque<Arc<WaitReply>>>,
}

impl WaitRegistry {
    pub(crate) fn register(&self, wait: Arc<WaitReply>) {
        lock(&self.waiting).push_back(wait);
    }

    /// Give `frame` to the oldest waiter if it expects this message number,
    /// otherwise hand the frame back.
    ///
    /// The frame is queued before the registry lock is released, so a
    /// waiter that [`cancel`](Self::cancel)s and finds itself gone is sure
    /// to find the reply in its queue.
    pub(crate) fn deliver(&self, frame: Frame) -> Result<(), Frame> {
        let mut waiting = lock(&self.waiting);
        let matches = waiting
            .front()
            .is_some_and(|wait| wait.msgno() == Some(frame.msgno));
        if !matches {
            return Err(frame);
        }
        if let Some(wait) = waiting.pop_front() {
            wait.push(frame);
        }
        Ok(())
    }

    /// Forget a waiter that gave up. Returns false when it was no longer
    /// registered, either because a reply was handed to it or because it
    /// never was.
    pub(crate) fn cancel(&self, wait: &Arc<WaitReply>) -> bool {
        let mut waiting = lock(&self.waiting);
        let before = waiting.len();
        waiting.retain(|entry| !Arc::ptr_eq(entry, wait));
        waiting.len() != before
    }

    pub(crate) fn len(&self) -> usize {
        lock(&self.waiting).len()
    }

    pub(crate) fn clear(&self) {
        lock(&self.waiting).clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beepcore_frame::FrameType;

    fn rpy(msgno: u32) -> Frame {
        Frame::new(FrameType::Rpy, 1, msgno, &b"done"[..])
    }

    #[test]
    fn test_deliver_matches_head_only() {
        let registry = WaitRegistry::default();
        let first = WaitReply::new();
        first.set_msgno(4);
        let second = WaitReply::new();
        second.set_msgno(5);
        registry.register(Arc::clone(&first));
        registry.register(Arc::clone(&second));

        let unmatched = registry.deliver(rpy(5)).unwrap_err();
        assert_eq!(unmatched.msgno, 5);
        assert!(!second.has_reply());

        registry.deliver(rpy(4)).unwrap();
        registry.deliver(rpy(5)).unwrap();
        assert_eq!(first.pop_timeout(Duration::ZERO).unwrap().msgno, 4);
        assert_eq!(second.pop_timeout(Duration::ZERO).unwrap().msgno, 5);
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn test_cancel_unblocks_followers() {
        let registry = WaitRegistry::default();
        let stale = WaitReply::new();
        stale.set_msgno(1);
        let live = WaitReply::new();
        live.set_msgno(2);
        registry.register(Arc::clone(&stale));
        registry.register(Arc::clone(&live));

        assert!(registry.cancel(&stale));
        registry.deliver(rpy(2)).unwrap();
        assert!(live.has_reply());
        assert!(stale.pop_timeout(Duration::from_millis(5)).is_none());
    }

    #[test]
    fn test_cancel_after_delivery_reports_the_reply() {
        let registry = WaitRegistry::default();
        let wait = WaitReply::new();
        wait.set_msgno(3);
        registry.register(Arc::clone(&wait));

        registry.deliver(rpy(3)).unwrap();
        assert!(!registry.cancel(&wait));
        assert_eq!(wait.pop_timeout(Duration::ZERO).unwrap().msgno, 3);

        // once cancelled, a late reply is handed back for normal dispatch
        let late = WaitReply::new();
        late.set_msgno(4);
        registry.register(Arc::clone(&late));
        assert!(registry.cancel(&late));
        assert_eq!(registry.deliver(rpy(4)).unwrap_err().msgno, 4);
        assert!(!late.has_reply());
    }
}
