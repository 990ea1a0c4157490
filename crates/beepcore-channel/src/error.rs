use std::time::Duration;

use crate::admin::AdminError;
use crate::reassembly::ReassemblyError;

/// Errors that can occur in channel operations.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// Frame-level error.
    #[error("frame error: {0}")]
    Frame(#[from] beepcore_frame::FrameError),

    /// Worker pool error.
    #[error("worker pool error: {0}")]
    Pool(#[from] beepcore_pool::PoolError),

    /// Channel management message could not be parsed.
    #[error("management message error: {0}")]
    Admin(#[from] AdminError),

    /// Fragments could not be joined.
    #[error("reassembly error: {0}")]
    Reassembly(#[from] ReassemblyError),

    /// The channel has not completed negotiation or was already closed.
    #[error("channel {0} is not opened")]
    NotOpened(u32),

    /// New messages are refused while a close is in progress.
    #[error("channel {0} is being closed")]
    BeingClosed(u32),

    /// A second close was requested while the first is still running.
    #[error("channel {0} is already being closed")]
    AlreadyClosing(u32),

    /// The underlying connection is no longer usable.
    #[error("connection is not connected")]
    NotConnected,

    /// The connection collaborator failed to transmit.
    #[error("transmission failed: {0}")]
    Disconnected(String),

    /// A final reply for this message number was already sent or queued.
    #[error("message {msgno} on channel {channel} was already replied")]
    AlreadyReplied { channel: u32, msgno: u32 },

    /// The message number space of the channel is exhausted.
    #[error("channel {0} ran out of message numbers")]
    MsgNoExhausted(u32),

    /// No reply arrived in time.
    #[error("no reply after {0:?}")]
    Timeout(Duration),

    /// The peer refused the request with an `<error>` reply.
    #[error("peer denied request: {code} {message}")]
    Denied { code: u16, message: String },

    /// Channel number already in use on the connection.
    #[error("channel {0} already exists")]
    ChannelExists(u32),

    /// No channel with that number on the connection.
    #[error("channel {0} does not exist")]
    UnknownChannel(u32),

    /// The connection could not hand out a channel number.
    #[error("no channel number available")]
    NoChannelNumber,

    /// The remote peer did not advertise the profile.
    #[error("profile '{0}' is not supported by the remote peer")]
    ProfileNotSupported(String),

    /// The start reply confirmed a profile other than the requested one.
    #[error("requested profile '{requested}' but peer confirmed '{received}'")]
    UnexpectedProfile { requested: String, received: String },

    /// The peer broke the protocol; the connection has been dropped.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// `notify_start` was called on a channel without a deferred start.
    #[error("channel {0} has no deferred start request")]
    NoDeferredStart(u32),

    /// Configuration could not be parsed.
    #[error("invalid channel configuration: {0}")]
    Config(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ChannelError>;
