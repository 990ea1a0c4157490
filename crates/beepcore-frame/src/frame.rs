use std::fmt;
use std::str::FromStr;

use bytes::Bytes;

use crate::error::{FrameError, Result};
use crate::mime::MimeHeaders;

/// BEEP data frame keyword.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameType {
    /// Request.
    Msg,
    /// Positive reply.
    Rpy,
    /// Negative reply.
    Err,
    /// One answer of a one-to-many reply.
    Ans,
    /// Terminates an ANS series.
    Nul,
}

impl FrameType {
    pub fn as_str(self) -> &'static str {
        match self {
            FrameType::Msg => "MSG",
            FrameType::Rpy => "RPY",
            FrameType::Err => "ERR",
            FrameType::Ans => "ANS",
            FrameType::Nul => "NUL",
        }
    }

    /// True for every frame type that answers a MSG.
    pub fn is_reply(self) -> bool {
        !matches!(self, FrameType::Msg)
    }

    /// True for RPY, ERR and NUL: the frame types that complete a reply.
    pub fn completes_reply(self) -> bool {
        matches!(self, FrameType::Rpy | FrameType::Err | FrameType::Nul)
    }
}

impl fmt::Display for FrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FrameType {
    type Err = FrameError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "MSG" => Ok(FrameType::Msg),
            "RPY" => Ok(FrameType::Rpy),
            "ERR" => Ok(FrameType::Err),
            "ANS" => Ok(FrameType::Ans),
            "NUL" => Ok(FrameType::Nul),
            other => Err(FrameError::UnknownFrameType(other.to_string())),
        }
    }
}

/// A decoded BEEP frame.
///
/// `payload` holds the frame content without MIME headers once the channel
/// has processed them; `mime` carries what was found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameType,
    pub channel: u32,
    pub msgno: u32,
    /// Continuation indicator (`*` on the wire).
    pub more: bool,
    pub seqno: u32,
    /// Only meaningful for ANS frames.
    pub ansno: u32,
    pub mime: MimeHeaders,
    pub payload: Bytes,
}

impl Frame {
    /// Create a complete frame with sequence and answer numbers at zero.
    pub fn new(kind: FrameType, channel: u32, msgno: u32, payload: impl Into<Bytes>) -> Self {
        Self {
            kind,
            channel,
            msgno,
            more: false,
            seqno: 0,
            ansno: 0,
            mime: MimeHeaders::default(),
            payload: payload.into(),
        }
    }

    pub fn with_seqno(mut self, seqno: u32) -> Self {
        self.seqno = seqno;
        self
    }

    pub fn with_ansno(mut self, ansno: u32) -> Self {
        self.ansno = ansno;
        self
    }

    pub fn with_more(mut self, more: bool) -> Self {
        self.more = more;
        self
    }

    pub fn with_mime(mut self, mime: MimeHeaders) -> Self {
        self.mime = mime;
        self
    }

    /// Content size as carried in the header `size` field.
    pub fn size(&self) -> usize {
        self.payload.len()
    }

    /// Content size checked against the 32-bit header field.
    pub fn wire_size(&self) -> Result<u32> {
        u32::try_from(self.payload.len()).map_err(|_| FrameError::PayloadTooLarge {
            size: self.payload.len(),
            max: u32::MAX as usize,
        })
    }

    /// Payload as UTF-8 text, if it is valid.
    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }
}

/// Renders the RFC 3080 header line, e.g. `ANS 1 3 . 120 12 2`.
impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {} {} {}",
            self.kind,
            self.channel,
            self.msgno,
            if self.more { '*' } else { '.' },
            self.seqno,
            self.payload.len()
        )?;
        if self.kind == FrameType::Ans {
            write!(f, " {}", self.ansno)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_type_parse() {
        assert_eq!("RPY".parse::<FrameType>().unwrap(), FrameType::Rpy);
        assert!(matches!(
            "SEQ".parse::<FrameType>(),
            Err(FrameError::UnknownFrameType(kind)) if kind == "SEQ"
        ));
    }

    #[test]
    fn test_reply_classification() {
        assert!(!FrameType::Msg.is_reply());
        assert!(FrameType::Ans.is_reply());
        assert!(!FrameType::Ans.completes_reply());
        assert!(FrameType::Nul.completes_reply());
    }

    #[test]
    fn test_header_line() {
        let frame = Frame::new(FrameType::Ans, 1, 3, &b"hello world!"[..])
            .with_seqno(120)
            .with_ansno(2);
        assert_eq!(frame.to_string(), "ANS 1 3 . 120 12 2");

        let frame = Frame::new(FrameType::Msg, 0, 1, &b"x"[..]).with_more(true);
        assert_eq!(frame.to_string(), "MSG 0 1 * 0 1");
    }
}
