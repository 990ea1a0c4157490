//! BEEP channel protocol core.
//!
//! Per-channel message and reply numbering, RFC 3081 flow control,
//! reassembly of continuation frames, ordered delivery to application
//! handlers on a worker pool, synchronous waits for replies and the channel
//! 0 management protocol that starts and closes channels.
//!
//! The core does not touch sockets. A transport implements [`Connection`],
//! feeds decoded frames through [`dispatch_inbound`] and writes whatever
//! the channels hand to [`Connection::transmit`].

pub mod admin;
pub mod channel;
pub mod config;
pub mod connection;
pub mod context;
pub mod control;
pub mod error;
pub mod flow;
pub mod handlers;
pub mod profiles;
pub mod reassembly;
mod replies;
pub mod reply_queue;
pub mod serialize;
pub mod start;
pub mod wait_reply;

pub use admin::{
    greeting_message, AdminError, AdminKind, AdminMessage, AdminParser, CloseMessage, ErrorMessage,
    GreetingMessage, ManagementParser, ProfileEncoding, ProfileMessage, StartMessage,
    GREETING_MSGNO, OK_MESSAGE,
};
pub use channel::{Channel, ChannelStatus, SequencerData, CLOSE_DENIED_CODE, CLOSE_DENIED_MESSAGE};
pub use config::ChannelConfig;
pub use connection::{dispatch_inbound, Connection, Inbound};
pub use context::Context;
pub use control::{handle_admin_frame, send_greeting};
pub use error::{ChannelError, Result};
pub use flow::{default_frame_size, FlowControl, FrameSizeHandler};
pub use handlers::{
    CloseHandler, CloseNotifyHandler, ClosedHandler, FrameReceivedHandler, ReceivedHandler,
};
pub use profiles::{ProfileHandlers, ProfileRegistry, StartDecision, StartHandler, StartRequest};
pub use reassembly::{FragmentBuffer, ReassemblyError};
pub use reply_queue::ReplyQueue;
pub use serialize::{DeliverySerializer, OrderedTrack, Slot};
pub use start::{open_channel, open_channel_with, ChannelRequest};
pub use wait_reply::WaitReply;
