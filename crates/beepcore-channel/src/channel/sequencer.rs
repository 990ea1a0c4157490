//! Cutting queued messages into frames that fit the remote window.

use std::cmp::min;
use std::sync::atomic::Ordering;

use beepcore_frame::seq::{advance, distance, is_at_or_after};
use beepcore_frame::{Frame, FrameType};
use beepcore_pool::sync::{lock, read};
use bytes::Bytes;
use tracing::debug;

use super::Channel;
use crate::connection::Connection;
use crate::error::{ChannelError, Result};
use crate::flow::default_frame_size;

/// One outbound message or reply on its way to the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequencerData {
    pub kind: FrameType,
    pub channel: u32,
    pub msgno: u32,
    pub ansno: u32,
    /// Sequence number of the first payload octet.
    pub first_seq_no: u32,
    /// Complete payload, MIME headers included.
    pub payload: Bytes,
    /// Octets already framed.
    pub sent: usize,
}

impl SequencerData {
    pub fn new(
        kind: FrameType,
        channel: u32,
        msgno: u32,
        ansno: u32,
        first_seq_no: u32,
        payload: Bytes,
    ) -> Self {
        Self {
            kind,
            channel,
            msgno,
            ansno,
            first_seq_no,
            payload,
            sent: 0,
        }
    }

    pub fn remaining(&self) -> usize {
        self.payload.len() - self.sent
    }

    pub fn next_seq_no(&self) -> u32 {
        advance(self.first_seq_no, self.sent)
    }
}

impl Channel {
    /// Frame `data` as far as the remote window allows. Whatever does not
    /// fit waits in the stalled queue, behind anything already waiting.
    pub(crate) fn queue_outgoing(&self, mut data: SequencerData) -> Result<()> {
        let connection = self.live_connection()?;
        let mut stalled = lock(&self.stalled);
        if !stalled.is_empty() {
            debug!(
                channel = self.number,
                msgno = data.msgno,
                queued = stalled.len(),
                "channel stalled, data queued"
            );
            stalled.push_back(data);
            return Ok(());
        }

        self.being_sending.store(true, Ordering::Release);
        let pumped = self.pump(connection.as_ref(), &mut data);
        self.being_sending.store(false, Ordering::Release);

        if pumped? {
            self.sequenced(&data);
        } else {
            debug!(
                channel = self.number,
                msgno = data.msgno,
                remaining = data.remaining(),
                "remote window exhausted, data stalled"
            );
            stalled.push_back(data);
        }
        Ok(())
    }

    /// Continue stalled data after the remote window grew.
    pub(crate) fn resume_stalled(&self) -> Result<()> {
        let mut stalled = lock(&self.stalled);
        if stalled.is_empty() {
            return Ok(());
        }
        let connection = self.connection().ok_or(ChannelError::NotConnected)?;

        self.being_sending.store(true, Ordering::Release);
        let result = loop {
            let Some(front) = stalled.front_mut() else {
                break Ok(());
            };
            match self.pump(connection.as_ref(), front) {
                Ok(true) => {
                    if let Some(done) = stalled.pop_front() {
                        self.sequenced(&done);
                    }
                }
                Ok(false) => break Ok(()),
                Err(err) => break Err(err),
            }
        };
        self.being_sending.store(false, Ordering::Release);
        result
    }

    /// Transmit frames until `data` is done (`true`) or the window closes
    /// (`false`). An empty payload still produces one frame.
    fn pump(&self, connection: &dyn Connection, data: &mut SequencerData) -> Result<bool> {
        loop {
            let remaining = data.remaining();
            let next_seq_no = data.next_seq_no();

            let size = if remaining == 0 {
                0
            } else {
                let max_seq_no = lock(&self.flow).max_seq_no_remote_accepted();
                let room = if is_at_or_after(max_seq_no, next_seq_no) {
                    distance(next_seq_no, max_seq_no) as usize + 1
                } else {
                    0
                };
                let size = self.next_frame_size(next_seq_no, remaining, max_seq_no);
                min(min(size, remaining), room)
            };
            if remaining > 0 && size == 0 {
                return Ok(false);
            }

            let end = data.sent + size;
            let frame = Frame::new(data.kind, data.channel, data.msgno, data.payload.slice(data.sent..end))
                .with_seqno(next_seq_no)
                .with_ansno(data.ansno)
                .with_more(end < data.payload.len());
            connection.transmit(frame)?;
            data.sent = end;

            if data.sent == data.payload.len() {
                return Ok(true);
            }
        }
    }

    /// Size of the next frame: channel handler, then connection, then
    /// context, then the built-in policy.
    ///
    /// Handlers run with the send path of this channel locked and must not
    /// send on it.
    pub fn next_frame_size(&self, next_seq_no: u32, message_size: usize, max_seq_no: u32) -> usize {
        let handler = read(&self.frame_size).clone();
        if let Some(size) = handler
            .and_then(|handler| handler.next_frame_size(self, next_seq_no, message_size, max_seq_no))
        {
            return size;
        }

        if let Some(size) = self.connection().and_then(|connection| {
            connection.next_frame_size(self, next_seq_no, message_size, max_seq_no)
        }) {
            return size;
        }

        if let Some(size) = self
            .context
            .frame_size_handler()
            .and_then(|handler| handler.next_frame_size(self, next_seq_no, message_size, max_seq_no))
        {
            return size;
        }

        let window_size = lock(&self.flow).window_size();
        default_frame_size(window_size, next_seq_no, message_size, max_seq_no)
    }

    fn sequenced(&self, data: &SequencerData) {
        if data.kind.completes_reply() {
            self.mark_reply_written(data.msgno);
        }
    }
}
