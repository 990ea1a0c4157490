//! MIME entity headers carried in front of every BEEP message.
//!
//! Headers equal to the RFC 3080 defaults are omitted on the wire; the
//! terminating CRLF is always present.

use bytes::{BufMut, Bytes, BytesMut};

/// Content type assumed when none is sent.
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Transfer encoding assumed when none is sent.
pub const DEFAULT_TRANSFER_ENCODING: &str = "binary";

/// Content type used on channel 0.
pub const ADMIN_CONTENT_TYPE: &str = "application/beep+xml";

const CONTENT_TYPE: &str = "Content-Type";
const TRANSFER_ENCODING: &str = "Content-Transfer-Encoding";

/// Per-channel (or per-profile) MIME configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MimeHeaders {
    pub content_type: Option<String>,
    pub transfer_encoding: Option<String>,
}

impl MimeHeaders {
    pub fn new(content_type: Option<&str>, transfer_encoding: Option<&str>) -> Self {
        Self {
            content_type: content_type.map(str::to_string),
            transfer_encoding: transfer_encoding.map(str::to_string),
        }
    }

    /// Headers used by channel 0.
    pub fn admin() -> Self {
        Self::new(Some(ADMIN_CONTENT_TYPE), Some(DEFAULT_TRANSFER_ENCODING))
    }

    fn emitted_content_type(&self) -> Option<&str> {
        self.content_type
            .as_deref()
            .filter(|value| *value != DEFAULT_CONTENT_TYPE)
    }

    fn emitted_transfer_encoding(&self) -> Option<&str> {
        self.transfer_encoding
            .as_deref()
            .filter(|value| *value != DEFAULT_TRANSFER_ENCODING)
    }

    /// True when at least one header differs from the defaults.
    pub fn is_configured(&self) -> bool {
        self.emitted_content_type().is_some() || self.emitted_transfer_encoding().is_some()
    }

    /// Octets the rendered header block adds to a message.
    pub fn headers_size(&self) -> usize {
        let mut size = 2;
        if let Some(value) = self.emitted_content_type() {
            // "Content-Type: " + value + CRLF
            size += 16 + value.len();
        }
        if let Some(value) = self.emitted_transfer_encoding() {
            // "Content-Transfer-Encoding: " + value + CRLF
            size += 29 + value.len();
        }
        size
    }

    /// Append the header block, terminating CRLF included.
    pub fn render(&self, dst: &mut BytesMut) {
        dst.reserve(self.headers_size());
        if let Some(value) = self.emitted_content_type() {
            put_header(dst, CONTENT_TYPE, value);
        }
        if let Some(value) = self.emitted_transfer_encoding() {
            put_header(dst, TRANSFER_ENCODING, value);
        }
        dst.put_slice(b"\r\n");
    }

    /// Prefix `body` with the rendered header block.
    pub fn encapsulate(&self, body: &[u8]) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.headers_size() + body.len());
        self.render(&mut buf);
        buf.put_slice(body);
        buf.freeze()
    }

    /// Split a message into its header block and body.
    ///
    /// Returns `None` when `message` does not start with a well-formed header
    /// block; callers then treat the whole message as body.
    pub fn split(message: &Bytes) -> Option<(MimeHeaders, Bytes)> {
        if message.starts_with(b"\r\n") {
            return Some((MimeHeaders::default(), message.slice(2..)));
        }

        let end = message.windows(4).position(|window| window == b"\r\n\r\n")?;
        let block = std::str::from_utf8(&message[..end]).ok()?;

        let mut headers = MimeHeaders::default();
        for line in block.split("\r\n") {
            let (name, value) = line.split_once(':')?;
            let name = name.trim();
            if name.is_empty() || name.contains(' ') {
                return None;
            }
            let value = value.trim().to_string();
            if name.eq_ignore_ascii_case(CONTENT_TYPE) {
                headers.content_type = Some(value);
            } else if name.eq_ignore_ascii_case(TRANSFER_ENCODING) {
                headers.transfer_encoding = Some(value);
            }
        }

        Some((headers, message.slice(end + 4..)))
    }
}

fn put_header(dst: &mut BytesMut, name: &str, value: &str) {
    dst.put_slice(name.as_bytes());
    dst.put_slice(b": ");
    dst.put_slice(value.as_bytes());
    dst.put_slice(b"\r\n");
}
