//! The connection collaborator.
//!
//! The channel core does not own sockets. A transport implements
//! [`Connection`] to store channels, write frames and report liveness, and
//! feeds decoded frames back through [`dispatch_inbound`].

use std::sync::Arc;

use beepcore_frame::{Frame, SeqFrame};
use tracing::warn;

use crate::channel::Channel;
use crate::error::{ChannelError, Result};

/// Services a BEEP session provides to its channels.
pub trait Connection: Send + Sync {
    /// Identifier used in log fields.
    fn id(&self) -> u64;

    fn is_ok(&self) -> bool;

    /// Drop the session. Called on protocol violations and after a
    /// successful channel 0 close.
    fn set_not_connected(&self, reason: &str);

    /// True while channel 0 is closing, so the reader does not treat the
    /// coming disconnection as a failure.
    fn is_being_closed(&self) -> bool;

    fn set_being_closed(&self, closing: bool);

    /// Write one data frame.
    fn transmit(&self, frame: Frame) -> Result<()>;

    /// Write one window announcement.
    fn transmit_seq(&self, seq: SeqFrame) -> Result<()>;

    fn channel(&self, number: u32) -> Option<Arc<Channel>>;

    fn add_channel(&self, channel: Arc<Channel>);

    fn remove_channel(&self, number: u32) -> Option<Arc<Channel>>;

    /// Next free channel number for locally initiated channels.
    fn next_channel_number(&self) -> Option<u32>;

    fn channel_exists(&self, number: u32) -> bool {
        self.channel(number).is_some()
    }

    /// Record the `serverName` of the first accepted `<start>`.
    fn set_server_name(&self, _name: &str) {}

    fn server_name(&self) -> Option<String> {
        None
    }

    /// Whether the remote greeting advertised `uri`.
    fn is_profile_supported(&self, _uri: &str) -> bool {
        true
    }

    /// Record the profiles advertised by the remote greeting.
    fn set_remote_profiles(&self, _uris: Vec<String>) {}

    /// Whether a local filter hides `uri` from this peer.
    fn is_profile_filtered(&self, _number: u32, _uri: &str, _server_name: Option<&str>) -> bool {
        false
    }

    /// Connection-wide frame size override; `None` defers to the next level.
    fn next_frame_size(
        &self,
        _channel: &Channel,
        _next_seq_no: u32,
        _message_size: usize,
        _max_seq_no: u32,
    ) -> Option<usize> {
        None
    }

    /// Record an `<error>` received while opening a channel.
    fn push_channel_error(&self, _code: u16, _message: &str) {}
}

/// A decoded item read from the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Frame(Frame),
    Seq(SeqFrame),
}

impl Inbound {
    pub fn channel(&self) -> u32 {
        match self {
            Inbound::Frame(frame) => frame.channel,
            Inbound::Seq(seq) => seq.channel,
        }
    }
}

impl From<Frame> for Inbound {
    fn from(frame: Frame) -> Self {
        Inbound::Frame(frame)
    }
}

impl From<SeqFrame> for Inbound {
    fn from(seq: SeqFrame) -> Self {
        Inbound::Seq(seq)
    }
}

/// Route one inbound item to its channel.
pub fn dispatch_inbound(connection: &Arc<dyn Connection>, inbound: Inbound) -> Result<()> {
    let number = inbound.channel();
    let Some(channel) = connection.channel(number) else {
        warn!(
            connection = connection.id(),
            channel = number,
            "frame received for unknown channel, dropped"
        );
        return Err(ChannelError::UnknownChannel(number));
    };

    match inbound {
        Inbound::Frame(frame) => channel.deliver_inbound_frame(frame),
        Inbound::Seq(seq) => channel.update_remote_incoming_buffer(&seq),
    }
}
