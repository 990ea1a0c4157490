//! RFC 3081 window announcements and sequence number arithmetic.
//!
//! Sequence numbers wrap at 2^32. Comparisons use serial-number arithmetic
//! (RFC 1982): `a` is after `b` when the forward distance from `b` to `a` is
//! non-zero and below 2^31.

use std::fmt;

use crate::channel::MAX_SEQ_MOD;

const HALF_SEQ_SPACE: u32 = (MAX_SEQ_MOD / 2) as u32;

/// `SEQ channel ackno window`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeqFrame {
    pub channel: u32,
    /// First octet the sender has not yet consumed.
    pub ackno: u32,
    /// Octets the sender is willing to accept from `ackno` on.
    pub window: u32,
}

impl SeqFrame {
    pub fn new(channel: u32, ackno: u32, window: u32) -> Self {
        Self {
            channel,
            ackno,
            window,
        }
    }

    /// Highest sequence number this announcement allows, inclusive.
    pub fn max_seq_no(&self) -> u32 {
        self.ackno.wrapping_add(self.window).wrapping_sub(1)
    }
}

impl fmt::Display for SeqFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SEQ {} {} {}", self.channel, self.ackno, self.window)
    }
}

/// Advance `seqno` by `size` octets modulo 2^32.
pub fn advance(seqno: u32, size: usize) -> u32 {
    ((u64::from(seqno) + size as u64) % MAX_SEQ_MOD) as u32
}

/// Forward distance from `from` to `to`.
pub fn distance(from: u32, to: u32) -> u32 {
    to.wrapping_sub(from)
}

/// True when `a` comes strictly after `b`.
pub fn is_after(a: u32, b: u32) -> bool {
    let delta = distance(b, a);
    delta != 0 && delta < HALF_SEQ_SPACE
}

/// True when `a` equals or comes after `b`.
pub fn is_at_or_after(a: u32, b: u32) -> bool {
    a == b || is_after(a, b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seq_max() {
        assert_eq!(SeqFrame::new(1, 0, 4096).max_seq_no(), 4095);
        assert_eq!(SeqFrame::new(1, u32::MAX, 2).max_seq_no(), 0);
        assert_eq!(SeqFrame::new(3, 10, 20).to_string(), "SEQ 3 10 20");
    }

    #[test]
    fn test_serial_comparison_wraps() {
        assert!(is_after(5, 4));
        assert!(!is_after(4, 4));
        assert!(is_after(2, u32::MAX - 3));
        assert!(!is_after(u32::MAX - 3, 2));
        assert!(is_at_or_after(7, 7));
        assert_eq!(advance(u32::MAX, 2), 1);
        assert!(is_after(HALF_SEQ_SPACE - 1, 0));
        assert!(!is_after(HALF_SEQ_SPACE, 0));
        assert!(!is_after(0, HALF_SEQ_SPACE));
        assert_eq!(distance(u32::MAX, 1), 2);
    }
}
