//! Strict in-order delivery for channels with serialization enabled.
//!
//! Frames are handed to application callbacks on pool workers, so two
//! frames read in order may reach their callbacks in any order. Each frame
//! class keeps an [`OrderedTrack`]: a frame whose index is not the next one
//! is parked, and every completed delivery releases the parked successor.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

use beepcore_frame::{Frame, FrameType};
use beepcore_pool::sync::lock;
use tracing::debug;

/// Ordering key of a frame within its track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Slot {
    Index(u32),
    /// NUL frames carry no number of their own. The channel stamps them with
    /// the count of answers they terminate (in `ansno`), and they become
    /// deliverable once that many answers went out.
    Nul,
}

fn by_msgno(frame: &Frame) -> Slot {
    Slot::Index(frame.msgno)
}

fn by_ansno(frame: &Frame) -> Slot {
    match frame.kind {
        FrameType::Nul => Slot::Nul,
        _ => Slot::Index(frame.ansno),
    }
}

#[derive(Debug)]
struct TrackState {
    next: u32,
    /// Parked frames per slot; several when fragments are delivered
    /// individually.
    pending: HashMap<Slot, VecDeque<Frame>>,
    skipped: HashSet<u32>,
}

impl TrackState {
    fn is_ready(&self, slot: Slot, frame: &Frame) -> bool {
        match slot {
            Slot::Index(index) => index == self.next,
            Slot::Nul => frame.ansno == self.next,
        }
    }

    fn step(&mut self) {
        self.next = self.next.wrapping_add(1);
        while self.skipped.remove(&self.next) {
            self.next = self.next.wrapping_add(1);
        }
    }

    fn park(&mut self, slot: Slot, frame: Frame) {
        self.pending.entry(slot).or_default().push_back(frame);
    }

    fn take(&mut self, slot: Slot) -> Option<Frame> {
        let parked = self.pending.get_mut(&slot)?;
        let frame = parked.pop_front();
        if parked.is_empty() {
            self.pending.remove(&slot);
        }
        frame
    }

    fn release(&mut self) -> Option<Frame> {
        if let Some(frame) = self.take(Slot::Index(self.next)) {
            return Some(frame);
        }
        let nul_ready = self
            .pending
            .get(&Slot::Nul)
            .and_then(VecDeque::front)
            .is_some_and(|nul| nul.ansno == self.next);
        if nul_ready {
            return self.take(Slot::Nul);
        }
        None
    }
}

/// One ordering track, generic over how a frame is indexed.
#[derive(Debug)]
pub struct OrderedTrack {
    index_of: fn(&Frame) -> Slot,
    state: Mutex<TrackState>,
}

impl OrderedTrack {
    pub fn new(index_of: fn(&Frame) -> Slot, first: u32) -> Self {
        Self {
            index_of,
            state: Mutex::new(TrackState {
                next: first,
                pending: HashMap::new(),
                skipped: HashSet::new(),
            }),
        }
    }

    /// Index expected next.
    pub fn next_index(&self) -> u32 {
        lock(&self.state).next
    }

    pub fn pending(&self) -> usize {
        lock(&self.state).pending.values().map(VecDeque::len).sum()
    }

    /// Returns the frame when it may be delivered now, otherwise parks it.
    pub fn admit(&self, frame: Frame) -> Option<Frame> {
        let slot = (self.index_of)(&frame);
        let mut state = lock(&self.state);
        if state.is_ready(slot, &frame) {
            return Some(frame);
        }
        debug!(
            channel = frame.channel,
            frame = %frame,
            expected = state.next,
            "frame parked until its predecessor is delivered"
        );
        state.park(slot, frame);
        None
    }

    /// Record that `frame` was delivered and return a parked frame that
    /// became deliverable, if any. After a non-final fragment that is the
    /// next parked fragment of the same message.
    pub fn complete(&self, frame: &Frame) -> Option<Frame> {
        let mut state = lock(&self.state);
        if frame.more {
            return state.release();
        }
        match (self.index_of)(frame) {
            Slot::Nul => state.next = 0,
            Slot::Index(_) => state.step(),
        }
        state.release()
    }

    /// Mark `index` as never arriving on this track.
    ///
    /// Messages answered with ANS/NUL never show up on the RPY/ERR track.
    pub fn skip(&self, index: u32) -> Option<Frame> {
        let mut state = lock(&self.state);
        if index != state.next {
            state.skipped.insert(index);
            return None;
        }
        state.step();
        state.release()
    }
}

/// The three per-class tracks of a channel.
#[derive(Debug)]
pub struct DeliverySerializer {
    msg: OrderedTrack,
    reply: OrderedTrack,
    answer: OrderedTrack,
}

impl DeliverySerializer {
    /// `first_msgno` is the number of the first MSG received and
    /// `first_reply` the message number the first reply answers.
    pub fn new(first_msgno: u32, first_reply: u32) -> Self {
        Self {
            msg: OrderedTrack::new(by_msgno, first_msgno),
            reply: OrderedTrack::new(by_msgno, first_reply),
            answer: OrderedTrack::new(by_ansno, 0),
        }
    }

    pub fn track_for(&self, kind: FrameType) -> &OrderedTrack {
        match kind {
            FrameType::Msg => &self.msg,
            FrameType::Rpy | FrameType::Err => &self.reply,
            FrameType::Ans | FrameType::Nul => &self.answer,
        }
    }

    /// Frames parked across all tracks.
    pub fn pending(&self) -> usize {
        self.msg.pending() + self.reply.pending() + self.answer.pending()
    }

    /// Deliver `frame` through `handler` in order, together with every
    /// parked frame it unblocks.
    pub fn deliver(&self, frame: Frame, handler: &mut dyn FnMut(&Frame)) {
        let track = self.track_for(frame.kind);
        let mut next = track.admit(frame);
        while let Some(frame) = next {
            handler(&frame);
            next = track.complete(&frame);
            if frame.kind == FrameType::Nul && !frame.more {
                self.skip_reply(frame.msgno, handler);
            }
        }
    }

    /// The reply to `msgno` bypassed the RPY/ERR track; deliver whatever
    /// was parked behind it.
    pub fn skip_reply(&self, msgno: u32, handler: &mut dyn FnMut(&Frame)) {
        let mut resumed = self.reply.skip(msgno);
        while let Some(reply) = resumed {
            handler(&reply);
            resumed = self.reply.complete(&reply);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn rpy(msgno: u32) -> Frame {
        Frame::new(FrameType::Rpy, 1, msgno, Vec::new())
    }

    fn ans(msgno: u32, ansno: u32) -> Frame {
        Frame::new(FrameType::Ans, 1, msgno, Vec::new()).with_ansno(ansno)
    }

    fn nul(msgno: u32, answers: u32) -> Frame {
        Frame::new(FrameType::Nul, 1, msgno, Vec::new()).with_ansno(answers)
    }

    fn collect(serializer: &DeliverySerializer, frames: Vec<Frame>) -> Vec<Frame> {
        let mut delivered = Vec::new();
        for frame in frames {
            serializer.deliver(frame, &mut |frame| delivered.push(frame.clone()));
        }
        delivered
    }

    #[test]
    fn test_out_of_order_replies_cascade() {
        let serializer = DeliverySerializer::new(0, 0);
        let delivered = collect(&serializer, vec![rpy(2), rpy(1), rpy(0)]);
        let order: Vec<u32> = delivered.iter().map(|frame| frame.msgno).collect();
        assert_eq!(order, vec![0, 1, 2]);
        assert_eq!(serializer.pending(), 0);
    }

    #[test]
    fn test_nul_waits_for_answers() {
        let serializer = DeliverySerializer::new(0, 0);
        let delivered = collect(&serializer, vec![nul(0, 2), ans(0, 1), ans(0, 0)]);
        let kinds: Vec<(FrameType, u32)> =
            delivered.iter().map(|frame| (frame.kind, frame.ansno)).collect();
        assert_eq!(
            kinds,
            vec![(FrameType::Ans, 0), (FrameType::Ans, 1), (FrameType::Nul, 2)]
        );
        assert_eq!(serializer.track_for(FrameType::Ans).next_index(), 0);
    }

    #[test]
    fn test_answered_message_does_not_block_replies() {
        let serializer = DeliverySerializer::new(0, 0);
        let delivered = collect(&serializer, vec![rpy(1), ans(0, 0), nul(0, 1)]);
        let order: Vec<(FrameType, u32)> =
            delivered.iter().map(|frame| (frame.kind, frame.msgno)).collect();
        assert_eq!(
            order,
            vec![(FrameType::Ans, 0), (FrameType::Nul, 0), (FrameType::Rpy, 1)]
        );
    }

    #[test]
    fn test_parked_fragments_of_one_message_are_all_kept() {
        let serializer = DeliverySerializer::new(0, 0);
        let fragment = |msgno, body: &'static str, more| {
            Frame::new(FrameType::Msg, 1, msgno, body).with_more(more)
        };
        let delivered = collect(
            &serializer,
            vec![
                fragment(1, "he", true),
                fragment(1, "llo", false),
                fragment(0, "first", false),
            ],
        );
        let bodies: Vec<(u32, &[u8])> = delivered
            .iter()
            .map(|frame| (frame.msgno, &frame.payload[..]))
            .collect();
        assert_eq!(
            bodies,
            vec![(0, &b"first"[..]), (1, &b"he"[..]), (1, &b"llo"[..])]
        );
        assert_eq!(serializer.pending(), 0);
        assert_eq!(serializer.track_for(FrameType::Msg).next_index(), 2);
    }

    #[test]
    fn test_skip_ahead_is_remembered() {
        let track = OrderedTrack::new(by_msgno, 0);
        assert!(track.skip(1).is_none());
        assert!(track.admit(rpy(2)).is_none());
        let first = track.admit(rpy(0)).unwrap();
        let released = track.complete(&first).unwrap();
        assert_eq!(released.msgno, 2);
    }

    #[test]
    fn test_channel_zero_numbering() {
        let serializer = DeliverySerializer::new(1, 0);
        let msg = Frame::new(FrameType::Msg, 0, 1, Vec::new());
        assert!(serializer.track_for(FrameType::Msg).admit(msg).is_some());
        let greeting = Frame::new(FrameType::Rpy, 0, 0, Vec::new());
        assert!(serializer.track_for(FrameType::Rpy).admit(greeting).is_some());
    }

    proptest! {
        #[test]
        fn test_any_arrival_order_delivers_ascending(
            order in Just((0u32..24).collect::<Vec<_>>()).prop_shuffle()
        ) {
            let serializer = DeliverySerializer::new(0, 0);
            let frames = order.into_iter().map(rpy).collect();
            let delivered: Vec<u32> = collect(&serializer, frames)
                .iter()
                .map(|frame| frame.msgno)
                .collect();
            prop_assert_eq!(delivered, (0u32..24).collect::<Vec<_>>());
        }
    }
}
