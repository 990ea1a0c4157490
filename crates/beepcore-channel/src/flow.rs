//! RFC 3081 flow control.
//!
//! Each channel tracks two windows: the highest sequence number the peer may
//! send us (`max_seq_no_accepted`, advanced by the SEQ frames we emit) and
//! the highest one we may send (`max_seq_no_remote_accepted`, advanced by
//! SEQ frames the peer emits).

use std::cmp::min;

use beepcore_frame::seq::{advance, distance, is_after, is_at_or_after};
use beepcore_frame::{
    Frame, FrameType, SeqFrame, DEFAULT_MAX_SEQ_ACCEPTED, DEFAULT_WINDOW_SIZE, MAX_FRAME_SIZE,
};
use tracing::debug;

use crate::channel::Channel;

/// Decides how many octets the next outgoing frame may carry.
///
/// Handlers are consulted channel first, then connection, then context;
/// `None` defers to the next level and finally to [`default_frame_size`].
pub trait FrameSizeHandler: Send + Sync {
    fn next_frame_size(
        &self,
        channel: &Channel,
        next_seq_no: u32,
        message_size: usize,
        max_seq_no: u32,
    ) -> Option<usize>;
}

impl<F> FrameSizeHandler for F
where
    F: Fn(&Channel, u32, usize, u32) -> Option<usize> + Send + Sync,
{
    fn next_frame_size(
        &self,
        channel: &Channel,
        next_seq_no: u32,
        message_size: usize,
        max_seq_no: u32,
    ) -> Option<usize> {
        self(channel, next_seq_no, message_size, max_seq_no)
    }
}

/// Built-in frame size policy.
///
/// Frames never exceed the channel window nor [`MAX_FRAME_SIZE`]; when the
/// remote window is smaller than the message, only what fits is sent.
/// Returns 0 when the remote window is exhausted.
pub fn default_frame_size(
    window_size: u32,
    next_seq_no: u32,
    message_size: usize,
    max_seq_no: u32,
) -> usize {
    let cap = min(window_size as usize, MAX_FRAME_SIZE);
    let remaining = if is_at_or_after(max_seq_no, next_seq_no) {
        distance(next_seq_no, max_seq_no) as usize + 1
    } else {
        0
    };

    if remaining < message_size {
        min(remaining, cap)
    } else {
        min(message_size, cap)
    }
}

/// Remote announced a window end at or below the one already known.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("SEQ announcement {announced} does not advance remote window end {current}")]
pub struct SeqRegression {
    pub announced: u32,
    pub current: u32,
}

/// Window state of one channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowControl {
    window_size: u32,
    desired_window_size: u32,
    max_seq_no_accepted: u32,
    max_seq_no_remote_accepted: u32,
}

impl Default for FlowControl {
    fn default() -> Self {
        Self {
            window_size: DEFAULT_WINDOW_SIZE,
            desired_window_size: DEFAULT_WINDOW_SIZE,
            max_seq_no_accepted: DEFAULT_MAX_SEQ_ACCEPTED,
            max_seq_no_remote_accepted: DEFAULT_MAX_SEQ_ACCEPTED,
        }
    }
}

impl FlowControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn window_size(&self) -> u32 {
        self.window_size
    }

    pub fn desired_window_size(&self) -> u32 {
        self.desired_window_size
    }

    pub fn max_seq_no_accepted(&self) -> u32 {
        self.max_seq_no_accepted
    }

    pub fn max_seq_no_remote_accepted(&self) -> u32 {
        self.max_seq_no_remote_accepted
    }

    /// Request a new receive window; it takes effect with the next SEQ
    /// frame. Zero is refused.
    pub fn set_desired_window_size(&mut self, size: u32) -> bool {
        if size == 0 {
            return false;
        }
        self.desired_window_size = size;
        true
    }

    /// True when `size` octets starting at `seqno` fit in the window we
    /// advertised.
    pub fn admits(&self, seqno: u32, size: usize) -> bool {
        if size == 0 {
            return true;
        }
        let last = advance(seqno, size - 1);
        is_at_or_after(self.max_seq_no_accepted, last)
    }

    /// Account for a received frame and decide whether to announce a new
    /// window. Returns `(ackno, window)` for the SEQ frame to send.
    ///
    /// `admin_closing` suppresses announcements while channel 0 closes.
    pub fn update_incoming(&mut self, frame: &Frame, admin_closing: bool) -> Option<(u32, u32)> {
        if admin_closing {
            return None;
        }

        let consumed = advance(frame.seqno, frame.size());
        let forced = frame.kind == FrameType::Nul;

        if !forced {
            // octets consumed since the start of the advertised window
            let window_start = self.max_seq_no_accepted.wrapping_sub(self.window_size);
            if distance(window_start, consumed) < self.window_size / 2 {
                return None;
            }
        }

        let new_max = consumed.wrapping_add(self.window_size).wrapping_sub(1);
        if !forced && !is_after(new_max, self.max_seq_no_accepted) {
            return None;
        }

        let window = self.desired_window_size;
        let new_max = consumed.wrapping_add(window).wrapping_sub(1);
        // a NUL that leaves the window end in place sends no SEQ: the peer
        // rejects an announcement that does not move it
        if !is_after(new_max, self.max_seq_no_accepted) {
            return None;
        }
        if self.window_size != window {
            debug!(from = self.window_size, to = window, "window size changed");
            self.window_size = window;
        }
        self.max_seq_no_accepted = new_max;
        Some((consumed, window))
    }

    /// Apply a SEQ frame from the peer. Returns the new remote window end.
    pub fn update_remote(&mut self, seq: &SeqFrame) -> Result<u32, SeqRegression> {
        let announced = seq.max_seq_no();
        if !is_after(announced, self.max_seq_no_remote_accepted) {
            return Err(SeqRegression {
                announced,
                current: self.max_seq_no_remote_accepted,
            });
        }
        self.max_seq_no_remote_accepted = announced;
        Ok(announced)
    }
}
