//! BEEP (RFC 3080/3081) channel protocol engine core.
//!
//! beepcore multiplexes flow-controlled message/reply exchanges over one
//! transport connection. It owns everything between decoded frames and
//! application callbacks and leaves sockets to the embedding transport.
//!
//! # Crate Structure
//!
//! - [`frame`]: frame model, MIME headers and sequence arithmetic
//! - [`pool`]: worker pool running asynchronous deliveries
//! - [`channel`]: channel state machine, flow control, close negotiation
//!   and the channel 0 management protocol
//! - [`logging`]: `tracing` subscriber setup and [`Settings`], which reads
//!   channel and logging configuration from one document (behind the
//!   `logging` feature)

/// Re-export frame types.
pub mod frame {
    pub use beepcore_frame::*;
}

/// Re-export worker pool types.
pub mod pool {
    pub use beepcore_pool::*;
}

/// Re-export channel types.
pub mod channel {
    pub use beepcore_channel::*;
}

#[cfg(feature = "logging")]
pub mod logging;
#[cfg(feature = "logging")]
mod settings;

#[cfg(feature = "logging")]
pub use settings::Settings;

pub use beepcore_channel::{
    dispatch_inbound, open_channel, open_channel_with, Channel, ChannelConfig, ChannelError,
    ChannelRequest, Connection, Context, Inbound, ProfileHandlers, ReplyQueue, StartDecision,
    WaitReply,
};
pub use beepcore_frame::{Frame, FrameType, MimeHeaders, SeqFrame};
