//! Channel numbering and window limits.
//!
//! Channel 0 carries channel management for the whole session.
//! Channels 1..=MAX_CHANNEL_NO are created by `<start>` negotiation.

/// Channel management (start, close, ok, error).
pub const ADMIN_CHANNEL: u32 = 0;

/// Highest channel number a peer may request.
pub const MAX_CHANNEL_NO: u32 = 2_147_483_647;

/// Highest message number on any channel.
pub const MAX_MSG_NO: u32 = 2_147_483_647;

/// Sequence number modulus.
pub const MAX_SEQ_MOD: u64 = 1 << 32;

/// Initial receive window advertised for a channel.
pub const DEFAULT_WINDOW_SIZE: u32 = 4096;

/// Highest sequence number accepted before the first SEQ frame.
pub const DEFAULT_MAX_SEQ_ACCEPTED: u32 = DEFAULT_WINDOW_SIZE - 1;

/// Upper bound applied to a single outgoing frame payload.
pub const MAX_FRAME_SIZE: usize = 4096;

/// Returns a human-readable role for a channel number.
pub fn channel_name(number: u32) -> &'static str {
    match number {
        ADMIN_CHANNEL => "ADMIN",
        1..=MAX_CHANNEL_NO => "PROFILE",
        _ => "INVALID",
    }
}

/// Returns true for the session management channel.
pub fn is_admin(number: u32) -> bool {
    number == ADMIN_CHANNEL
}

/// Returns true if `number` may be used for a profile channel.
pub fn is_valid_number(number: u32) -> bool {
    number <= MAX_CHANNEL_NO
}
