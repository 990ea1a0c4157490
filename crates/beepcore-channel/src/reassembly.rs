//! Joining continuation frames into one logical message.

use bytes::{BufMut, BytesMut};

use beepcore_frame::Frame;

/// Errors raised while collecting fragments.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReassemblyError {
    /// A fragment does not belong to the message being collected.
    #[error("fragment {got} does not continue {expected}")]
    Mismatch { expected: String, got: String },

    /// Fragments were left behind after a join.
    #[error("{0} fragments left after join")]
    Leftover(usize),
}

/// Ordered fragments of the message currently arriving on a channel.
#[derive(Debug, Default)]
pub struct FragmentBuffer {
    fragments: Vec<Frame>,
}

impl FragmentBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }

    pub fn len(&self) -> usize {
        self.fragments.len()
    }

    /// Octets held across all pending fragments.
    pub fn pending_bytes(&self) -> usize {
        self.fragments.iter().map(Frame::size).sum()
    }

    /// Add a fragment. Returns the complete message once the final fragment
    /// (`more == false`) arrives.
    pub fn push(&mut self, frame: Frame) -> Result<Option<Frame>, ReassemblyError> {
        if let Some(first) = self.fragments.first() {
            if first.kind != frame.kind || first.msgno != frame.msgno {
                return Err(ReassemblyError::Mismatch {
                    expected: first.to_string(),
                    got: frame.to_string(),
                });
            }
        }

        if frame.more {
            self.fragments.push(frame);
            return Ok(None);
        }

        if self.fragments.is_empty() {
            return Ok(Some(frame));
        }

        self.fragments.push(frame);
        self.join().map(Some)
    }

    fn join(&mut self) -> Result<Frame, ReassemblyError> {
        let total = self.pending_bytes();
        let mut payload = BytesMut::with_capacity(total);
        let mut fragments = self.fragments.drain(..);

        let Some(mut joined) = fragments.next() else {
            return Err(ReassemblyError::Leftover(0));
        };
        payload.put_slice(&joined.payload);
        for fragment in fragments {
            payload.put_slice(&fragment.payload);
        }

        if !self.fragments.is_empty() {
            return Err(ReassemblyError::Leftover(self.fragments.len()));
        }

        joined.more = false;
        joined.payload = payload.freeze();
        Ok(joined)
    }

    pub fn clear(&mut self) {
        self.fragments.clear();
    }
}
