//! Application callbacks attached to channels.
//!
//! Handlers are closures; user data is whatever they capture.

use std::fmt;
use std::sync::Arc;

use beepcore_frame::Frame;

use crate::channel::Channel;

/// Called for every delivered frame.
pub type FrameReceivedHandler = Arc<dyn Fn(&Arc<Channel>, &Frame) + Send + Sync>;

/// Asked whether a peer close request is accepted.
pub type CloseHandler = Arc<dyn Fn(&Arc<Channel>) -> bool + Send + Sync>;

/// Called once after the channel is detached from its connection.
pub type ClosedHandler = Arc<dyn Fn(&Arc<Channel>) + Send + Sync>;

/// Receives a peer close request whose answer is given later through
/// [`Channel::notify_close`].
pub type CloseNotifyHandler = Arc<dyn Fn(&Arc<Channel>, u32) + Send + Sync>;

/// Who receives frames for a channel.
#[derive(Clone, Default)]
pub enum ReceivedHandler {
    /// Fall back to the profile's handler, if any.
    #[default]
    ProfileDefault,
    /// Channel 0 management protocol.
    Admin,
    User(FrameReceivedHandler),
}

impl fmt::Debug for ReceivedHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReceivedHandler::ProfileDefault => f.write_str("ProfileDefault"),
            ReceivedHandler::Admin => f.write_str("Admin"),
            ReceivedHandler::User(_) => f.write_str("User(..)"),
        }
    }
}

#[derive(Default)]
pub(crate) struct Handlers {
    pub(crate) received: ReceivedHandler,
    pub(crate) close: Option<CloseHandler>,
    pub(crate) closed: Option<ClosedHandler>,
    pub(crate) close_notify: Option<CloseNotifyHandler>,
}
