//! Pull-style reception on top of the receive handler.

use std::sync::Arc;
use std::time::Duration;

use beepcore_frame::Frame;
use beepcore_pool::BlockingQueue;

use crate::channel::Channel;
use crate::handlers::FrameReceivedHandler;

/// Collects every frame delivered to a channel so a caller can block on
/// the next one instead of reacting in a callback.
///
/// ```ignore
/// let queue = ReplyQueue::new();
/// channel.set_received_handler({
///     let handler = queue.handler();
///     move |channel, frame| handler(channel, frame)
/// });
/// let first = queue.get_reply(&channel, Duration::from_secs(5));
/// ```
#[derive(Debug, Clone, Default)]
pub struct ReplyQueue {
    frames: Arc<BlockingQueue<Frame>>,
}

impl ReplyQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Receive handler feeding this queue.
    pub fn handler(&self) -> FrameReceivedHandler {
        let frames = Arc::clone(&self.frames);
        Arc::new(move |_channel: &Arc<Channel>, frame: &Frame| frames.push(frame.clone()))
    }

    /// Next frame for `channel`: its start reply piggyback first, then
    /// delivered frames in arrival order. `None` after `timeout`.
    pub fn get_reply(&self, channel: &Channel, timeout: Duration) -> Option<Frame> {
        if let Some(piggyback) = channel.take_piggyback() {
            return Some(piggyback);
        }
        self.frames.pop_timeout(timeout)
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}
