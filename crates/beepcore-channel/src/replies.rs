//! Replies accepted ahead of their turn.
//!
//! BEEP requires replies on a channel to leave in the order the messages
//! arrived. A reply for a later message is parked here until every earlier
//! message has been answered.

use std::collections::{BTreeMap, VecDeque};

use beepcore_frame::FrameType;
use bytes::Bytes;

/// A reply waiting for its turn. `payload` already carries MIME headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PendingReply {
    pub(crate) kind: FrameType,
    pub(crate) msgno: u32,
    pub(crate) payload: Bytes,
}

/// Parked replies keyed by message number, in submission order per message.
#[derive(Debug, Default)]
pub(crate) struct StoredReplies {
    parked: BTreeMap<u32, VecDeque<PendingReply>>,
}

impl StoredReplies {
    pub(crate) fn park(&mut self, reply: PendingReply) {
        self.parked.entry(reply.msgno).or_default().push_back(reply);
    }

    /// True when a reply completing `msgno` (RPY, ERR or NUL) is parked.
    pub(crate) fn has_final(&self, msgno: u32) -> bool {
        self.parked
            .get(&msgno)
            .is_some_and(|queue| queue.iter().any(|reply| reply.kind.completes_reply()))
    }

    /// Oldest parked reply for `msgno`.
    pub(crate) fn take_next(&mut self, msgno: u32) -> Option<PendingReply> {
        let queue = self.parked.get_mut(&msgno)?;
        let reply = queue.pop_front();
        if queue.is_empty() {
            self.parked.remove(&msgno);
        }
        reply
    }

    pub(crate) fn len(&self) -> usize {
        self.parked.values().map(VecDeque::len).sum()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.parked.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply(kind: FrameType, msgno: u32) -> PendingReply {
        PendingReply {
            kind,
            msgno,
            payload: Bytes::from_static(b"\r\nbody"),
        }
    }

    #[test]
    fn test_answers_keep_submission_order() {
        let mut stored = StoredReplies::default();
        stored.park(reply(FrameType::Ans, 3));
        stored.park(reply(FrameType::Ans, 3));
        stored.park(reply(FrameType::Nul, 3));
        assert!(stored.has_final(3));
        assert_eq!(stored.len(), 3);

        assert_eq!(stored.take_next(3).unwrap().kind, FrameType::Ans);
        assert_eq!(stored.take_next(3).unwrap().kind, FrameType::Ans);
        assert_eq!(stored.take_next(3).unwrap().kind, FrameType::Nul);
        assert!(stored.take_next(3).is_none());
        assert!(stored.is_empty());
    }

    #[test]
    fn test_answers_alone_are_not_final() {
        let mut stored = StoredReplies::default();
        stored.park(reply(FrameType::Ans, 1));
        assert!(!stored.has_final(1));
        assert!(!stored.has_final(2));
    }
}
