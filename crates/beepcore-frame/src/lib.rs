//! BEEP (RFC 3080/3081) frame model.
//!
//! Typed frames as the channel core sees them once the wire header has been
//! decoded by the transport reader:
//! - [`Frame`] for MSG, RPY, ERR, ANS and NUL
//! - [`SeqFrame`] for RFC 3081 window announcements
//! - [`MimeHeaders`] for the entity headers carried in front of each message
//!
//! Sequence numbers live in a 2^32 space; [`seq`] holds the serial arithmetic
//! used to compare and advance them.

pub mod channel;
pub mod error;
pub mod frame;
pub mod mime;
pub mod seq;

pub use channel::{
    ADMIN_CHANNEL, DEFAULT_MAX_SEQ_ACCEPTED, DEFAULT_WINDOW_SIZE, MAX_CHANNEL_NO, MAX_FRAME_SIZE,
    MAX_MSG_NO, MAX_SEQ_MOD,
};
pub use error::{FrameError, Result};
pub use frame::{Frame, FrameType};
pub use mime::MimeHeaders;
pub use seq::SeqFrame;
