//! Channel 0 management messages (RFC 3080 section 2.3.1).
//!
//! Builders produce the XML sent on channel 0. Parsing goes through the
//! [`AdminParser`] trait; [`ManagementParser`] handles the small, fixed
//! grammar of `<greeting>`, `<start>`, `<profile>`, `<close>`, `<ok>` and
//! `<error>` and validates the required attributes of each element.

use beepcore_frame::MAX_CHANNEL_NO;

/// Reply confirming a close.
pub const OK_MESSAGE: &str = "<ok />\r\n";

/// Reply code carried by a regular close request.
pub const CLOSE_CODE_OK: u16 = 200;

/// Message number answered by the greeting on channel 0.
pub const GREETING_MSGNO: u32 = 0;

/// Deepest element nesting accepted in a management message.
const MAX_DEPTH: usize = 4;

/// Errors produced while parsing a management message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdminError {
    /// Not well-formed XML.
    #[error("general syntax error: {0}")]
    Syntax(String),

    /// Well-formed but not a valid management message.
    #[error("syntax error in parameters: {0}")]
    Invalid(String),
}

impl AdminError {
    /// BEEP reply code reported to the peer.
    pub fn code(&self) -> u16 {
        match self {
            AdminError::Syntax(_) => 500,
            AdminError::Invalid(_) => 501,
        }
    }
}

/// Encoding of piggybacked profile content.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ProfileEncoding {
    #[default]
    None,
    Base64,
}

impl ProfileEncoding {
    fn parse(value: &str) -> Result<Self, AdminError> {
        match value {
            "none" => Ok(ProfileEncoding::None),
            "base64" => Ok(ProfileEncoding::Base64),
            other => Err(AdminError::Invalid(format!("unknown encoding '{other}'"))),
        }
    }
}

/// `<profile uri='...'>content</profile>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileMessage {
    pub uri: String,
    pub encoding: ProfileEncoding,
    pub content: Option<String>,
}

/// `<greeting>` listing the profiles a peer offers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GreetingMessage {
    pub profiles: Vec<String>,
    pub features: Option<String>,
    pub localize: Option<String>,
}

/// `<start number='N' serverName='S'>` with one or more profiles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartMessage {
    pub number: u32,
    pub server_name: Option<String>,
    pub profiles: Vec<ProfileMessage>,
}

/// `<close number='N' code='C'>diagnostic</close>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseMessage {
    pub number: u32,
    pub code: u16,
    pub message: Option<String>,
}

/// `<error code='C'>message</error>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorMessage {
    pub code: u16,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdminMessage {
    Greeting(GreetingMessage),
    Start(StartMessage),
    Profile(ProfileMessage),
    Close(CloseMessage),
    Ok,
    Error(ErrorMessage),
}

/// Root element guessed from the first bytes of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminKind {
    Greeting,
    Start,
    Close,
    Ok,
    Error,
    Unknown,
}

/// Cheap classification before a full parse.
pub fn identify(payload: &[u8]) -> AdminKind {
    let start = payload
        .iter()
        .position(|byte| !byte.is_ascii_whitespace())
        .unwrap_or(payload.len());
    let payload = &payload[start..];
    if payload.starts_with(b"<greeting") {
        AdminKind::Greeting
    } else if payload.starts_with(b"<start") {
        AdminKind::Start
    } else if payload.starts_with(b"<close") {
        AdminKind::Close
    } else if payload.starts_with(b"<error") {
        AdminKind::Error
    } else if payload.starts_with(b"<ok") {
        AdminKind::Ok
    } else {
        AdminKind::Unknown
    }
}

/// True for the exact `<ok />` reply, ignoring surrounding whitespace.
pub fn is_ok_message(payload: &[u8]) -> bool {
    matches!(payload.trim_ascii(), b"<ok />" | b"<ok/>")
}

/// Parser used for channel 0 payloads.
pub trait AdminParser: Send + Sync {
    fn parse(&self, payload: &[u8]) -> Result<AdminMessage, AdminError>;
}

/// Built-in parser for the management grammar.
#[derive(Debug, Clone, Copy, Default)]
pub struct ManagementParser;

impl AdminParser for ManagementParser {
    fn parse(&self, payload: &[u8]) -> Result<AdminMessage, AdminError> {
        let text = std::str::from_utf8(payload)
            .map_err(|_| AdminError::Syntax("payload is not UTF-8".to_string()))?;
        let root = xml::parse_document(text)?;
        validate(&root)
    }
}

fn validate(root: &xml::Element) -> Result<AdminMessage, AdminError> {
    match root.name.as_str() {
        "greeting" => {
            let profiles = root
                .children
                .iter()
                .map(|child| {
                    if child.name != "profile" {
                        return Err(AdminError::Invalid(format!(
                            "unexpected element '{}' inside greeting",
                            child.name
                        )));
                    }
                    Ok(validate_profile(child)?.uri)
                })
                .collect::<Result<Vec<_>, _>>()?;
            Ok(AdminMessage::Greeting(GreetingMessage {
                profiles,
                features: root.attr("features").map(str::to_string),
                localize: root.attr("localize").map(str::to_string),
            }))
        }
        "start" => {
            let number = parse_channel_number(root.required("number")?)?;
            let fallback = root
                .attr("encoding")
                .map(ProfileEncoding::parse)
                .transpose()?;
            if root.children.is_empty() {
                return Err(AdminError::Invalid(
                    "start requires at least one profile".to_string(),
                ));
            }
            let profiles = root
                .children
                .iter()
                .map(|child| {
                    if child.name != "profile" {
                        return Err(AdminError::Invalid(format!(
                            "unexpected element '{}' inside start",
                            child.name
                        )));
                    }
                    let mut profile = validate_profile(child)?;
                    if child.attr("encoding").is_none() {
                        profile.encoding = fallback.unwrap_or_default();
                    }
                    Ok(profile)
                })
                .collect::<Result<Vec<_>, _>>()?;
            Ok(AdminMessage::Start(StartMessage {
                number,
                server_name: root.attr("serverName").map(str::to_string),
                profiles,
            }))
        }
        "profile" => Ok(AdminMessage::Profile(validate_profile(root)?)),
        "close" => {
            root.no_children()?;
            Ok(AdminMessage::Close(CloseMessage {
                number: parse_channel_number(root.required("number")?)?,
                code: parse_code(root.required("code")?)?,
                message: root.text_opt(),
            }))
        }
        "ok" => {
            root.no_children()?;
            Ok(AdminMessage::Ok)
        }
        "error" => {
            root.no_children()?;
            Ok(AdminMessage::Error(ErrorMessage {
                code: parse_code(root.required("code")?)?,
                message: root.text.trim().to_string(),
            }))
        }
        other => Err(AdminError::Invalid(format!(
            "unknown management element '{other}'"
        ))),
    }
}

fn validate_profile(element: &xml::Element) -> Result<ProfileMessage, AdminError> {
    element.no_children()?;
    Ok(ProfileMessage {
        uri: element.required("uri")?.to_string(),
        encoding: element
            .attr("encoding")
            .map(ProfileEncoding::parse)
            .transpose()?
            .unwrap_or_default(),
        content: element.text_opt(),
    })
}

fn parse_channel_number(value: &str) -> Result<u32, AdminError> {
    value
        .parse::<u32>()
        .ok()
        .filter(|number| *number <= MAX_CHANNEL_NO)
        .ok_or_else(|| AdminError::Invalid(format!("invalid channel number '{value}'")))
}

fn parse_code(value: &str) -> Result<u16, AdminError> {
    value
        .parse::<u16>()
        .ok()
        .filter(|code| (100..=999).contains(code))
        .ok_or_else(|| AdminError::Invalid(format!("invalid reply code '{value}'")))
}

/// `<greeting>` advertising `profiles`.
pub fn greeting_message(profiles: &[String]) -> String {
    if profiles.is_empty() {
        return "<greeting />\r\n".to_string();
    }
    let mut out = String::from("<greeting>\r\n");
    for uri in profiles {
        out.push_str("   ");
        out.push_str(&profile_element(uri, ProfileEncoding::None, None));
        out.push_str("\r\n");
    }
    out.push_str("</greeting>\r\n");
    out
}

/// `<start>` for `profile`, optionally piggybacking `content`.
pub fn start_message(
    number: u32,
    server_name: Option<&str>,
    profile: &str,
    encoding: ProfileEncoding,
    content: Option<&str>,
) -> String {
    let mut out = format!("<start number='{number}'");
    if let Some(name) = server_name {
        out.push_str(&format!(" serverName='{}'", escape(name)));
    }
    out.push_str(">\r\n   ");
    out.push_str(&profile_element(profile, encoding, content));
    out.push_str("\r\n</start>\r\n");
    out
}

/// `<profile>` confirming a start, optionally with piggybacked content.
pub fn profile_message(uri: &str, content: Option<&str>) -> String {
    let mut out = profile_element(uri, ProfileEncoding::None, content);
    out.push_str("\r\n");
    out
}

fn profile_element(uri: &str, encoding: ProfileEncoding, content: Option<&str>) -> String {
    let mut out = format!("<profile uri='{}'", escape(uri));
    if encoding == ProfileEncoding::Base64 {
        out.push_str(" encoding='base64'");
    }
    match content {
        Some(content) if !content.is_empty() => {
            out.push('>');
            out.push_str(&escape(content));
            out.push_str("</profile>");
        }
        _ => out.push_str(" />"),
    }
    out
}

pub fn close_message(number: u32, code: u16) -> String {
    format!("<close number='{number}' code='{code}' />\r\n")
}

pub fn error_message(code: u16, message: &str) -> String {
    format!("<error code='{code}'>{}</error>\r\n", escape(message))
}

fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\'' => out.push_str("&apos;"),
            '"' => out.push_str("&quot;"),
            c => out.push(c),
        }
    }
    out
}

mod xml {
    use super::{AdminError, MAX_DEPTH};

    #[derive(Debug, Default)]
    pub(super) struct Element {
        pub(super) name: String,
        pub(super) attrs: Vec<(String, String)>,
        pub(super) children: Vec<Element>,
        pub(super) text: String,
    }

    impl Element {
        pub(super) fn attr(&self, name: &str) -> Option<&str> {
            self.attrs
                .iter()
                .find(|(key, _)| key == name)
                .map(|(_, value)| value.as_str())
        }

        pub(super) fn required(&self, name: &str) -> Result<&str, AdminError> {
            self.attr(name).ok_or_else(|| {
                AdminError::Invalid(format!("<{}> requires attribute '{name}'", self.name))
            })
        }

        pub(super) fn no_children(&self) -> Result<(), AdminError> {
            match self.children.first() {
                Some(child) => Err(AdminError::Invalid(format!(
                    "<{}> does not accept <{}>",
                    self.name, child.name
                ))),
                None => Ok(()),
            }
        }

        pub(super) fn text_opt(&self) -> Option<String> {
            let text = self.text.trim();
            (!text.is_empty()).then(|| text.to_string())
        }
    }

    struct Cursor<'a> {
        input: &'a str,
        pos: usize,
    }

    pub(super) fn parse_document(input: &str) -> Result<Element, AdminError> {
        let mut cursor = Cursor { input, pos: 0 };
        cursor.skip_misc()?;
        let root = cursor.element(1)?;
        cursor.skip_misc()?;
        if !cursor.rest().is_empty() {
            return Err(cursor.error("content after root element"));
        }
        Ok(root)
    }

    impl<'a> Cursor<'a> {
        fn rest(&self) -> &'a str {
            &self.input[self.pos..]
        }

        fn error(&self, what: &str) -> AdminError {
            AdminError::Syntax(format!("{what} at offset {}", self.pos))
        }

        fn skip_ws(&mut self) {
            let rest = self.rest();
            self.pos += rest.len() - rest.trim_start().len();
        }

        fn eat(&mut self, token: &str) -> bool {
            if self.rest().starts_with(token) {
                self.pos += token.len();
                true
            } else {
                false
            }
        }

        fn skip_until(&mut self, token: &str) -> Result<&'a str, AdminError> {
            let rest = self.rest();
            let end = rest
                .find(token)
                .ok_or_else(|| self.error(&format!("missing '{token}'")))?;
            self.pos += end + token.len();
            Ok(&rest[..end])
        }

        /// Whitespace, XML declaration and comments outside the root.
        fn skip_misc(&mut self) -> Result<(), AdminError> {
            loop {
                self.skip_ws();
                if self.eat("<?") {
                    self.skip_until("?>")?;
                } else if self.eat("<!--") {
                    self.skip_until("-->")?;
                } else {
                    return Ok(());
                }
            }
        }

        fn name(&mut self) -> Result<String, AdminError> {
            let rest = self.rest();
            let len = rest
                .find(|c: char| c.is_whitespace() || c == '/' || c == '>' || c == '=')
                .unwrap_or(rest.len());
            if len == 0 {
                return Err(self.error("expected a name"));
            }
            self.pos += len;
            Ok(rest[..len].to_string())
        }

        fn element(&mut self, depth: usize) -> Result<Element, AdminError> {
            if depth > MAX_DEPTH {
                return Err(self.error("elements nested too deeply"));
            }
            if !self.eat("<") {
                return Err(self.error("expected '<'"));
            }
            let mut element = Element {
                name: self.name()?,
                ..Element::default()
            };

            loop {
                self.skip_ws();
                if self.eat("/>") {
                    return Ok(element);
                }
                if self.eat(">") {
                    break;
                }
                let key = self.name()?;
                self.skip_ws();
                if !self.eat("=") {
                    return Err(self.error("expected '=' after attribute name"));
                }
                self.skip_ws();
                let quote = if self.eat("'") {
                    "'"
                } else if self.eat("\"") {
                    "\""
                } else {
                    return Err(self.error("expected quoted attribute value"));
                };
                let raw = self.skip_until(quote)?;
                if element.attr(&key).is_some() {
                    return Err(self.error(&format!("duplicate attribute '{key}'")));
                }
                element.attrs.push((key, unescape(raw).map_err(|e| self.error(&e))?));
            }

            loop {
                if self.rest().is_empty() {
                    return Err(self.error(&format!("unterminated <{}>", element.name)));
                }
                if self.eat("</") {
                    let closing = self.name()?;
                    self.skip_ws();
                    if closing != element.name || !self.eat(">") {
                        return Err(self.error(&format!("mismatched </{closing}>")));
                    }
                    return Ok(element);
                }
                if self.eat("<![CDATA[") {
                    let data = self.skip_until("]]>")?;
                    element.text.push_str(data);
                } else if self.eat("<!--") {
                    self.skip_until("-->")?;
                } else if self.rest().starts_with('<') {
                    element.children.push(self.element(depth + 1)?);
                } else {
                    let rest = self.rest();
                    let len = rest.find('<').unwrap_or(rest.len());
                    self.pos += len;
                    let text = unescape(&rest[..len]).map_err(|e| self.error(&e))?;
                    element.text.push_str(&text);
                }
            }
        }
    }

    fn unescape(raw: &str) -> Result<String, String> {
        let mut out = String::with_capacity(raw.len());
        let mut rest = raw;
        while let Some(amp) = rest.find('&') {
            out.push_str(&rest[..amp]);
            rest = &rest[amp + 1..];
            let semi = rest
                .find(';')
                .ok_or_else(|| "unterminated entity".to_string())?;
            let entity = &rest[..semi];
            match entity {
                "amp" => out.push('&'),
                "lt" => out.push('<'),
                "gt" => out.push('>'),
                "apos" => out.push('\''),
                "quot" => out.push('"'),
                _ => {
                    let code = entity
                        .strip_prefix("#x")
                        .map(|hex| u32::from_str_radix(hex, 16))
                        .or_else(|| entity.strip_prefix('#').map(str::parse::<u32>))
                        .and_then(Result::ok)
                        .and_then(char::from_u32)
                        .ok_or_else(|| format!("unknown entity '&{entity};'"))?;
                    out.push(code);
                }
            }
            rest = &rest[semi + 1..];
        }
        out.push_str(rest);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> Result<AdminMessage, AdminError> {
        ManagementParser.parse(text.as_bytes())
    }

    #[test]
    fn test_identify_fast_path() {
        assert_eq!(identify(b"  <start number='1'>"), AdminKind::Start);
        assert_eq!(identify(b"<close number='1' code='200'/>"), AdminKind::Close);
        assert_eq!(identify(b"<error code='550'>x</error>"), AdminKind::Error);
        assert_eq!(identify(OK_MESSAGE.as_bytes()), AdminKind::Ok);
        assert_eq!(identify(b"<greeting />"), AdminKind::Greeting);
        assert_eq!(identify(b"<features />"), AdminKind::Unknown);
        assert!(is_ok_message(b" <ok/>\r\n"));
        assert!(!is_ok_message(b"<ok ></ok>"));
    }

    #[test]
    fn test_start_with_piggyback() {
        let text = start_message(
            3,
            Some("example.org"),
            "http://iana.org/beep/TLS",
            ProfileEncoding::None,
            Some("<ready />"),
        );
        let AdminMessage::Start(start) = parse(&text).unwrap() else {
            panic!("expected start");
        };
        assert_eq!(start.number, 3);
        assert_eq!(start.server_name.as_deref(), Some("example.org"));
        assert_eq!(start.profiles.len(), 1);
        assert_eq!(start.profiles[0].uri, "http://iana.org/beep/TLS");
        assert_eq!(start.profiles[0].content.as_deref(), Some("<ready />"));
    }

    #[test]
    fn test_start_rfc_example_with_cdata_and_fallback_encoding() {
        let text = "<start number='1' encoding='base64'>\r\n\
                    <profile uri='http://iana.org/beep/SASL/OTP' />\r\n\
                    <profile uri='urn:b'><![CDATA[a<b]]></profile>\r\n\
                    </start>";
        let AdminMessage::Start(start) = parse(text).unwrap() else {
            panic!("expected start");
        };
        assert_eq!(start.profiles.len(), 2);
        assert_eq!(start.profiles[0].encoding, ProfileEncoding::Base64);
        assert_eq!(start.profiles[1].content.as_deref(), Some("a<b"));
    }

    #[test]
    fn test_close_ok_error() {
        assert_eq!(
            parse(&close_message(5, CLOSE_CODE_OK)).unwrap(),
            AdminMessage::Close(CloseMessage {
                number: 5,
                code: 200,
                message: None
            })
        );
        assert_eq!(parse(OK_MESSAGE).unwrap(), AdminMessage::Ok);
        assert_eq!(
            parse(&error_message(550, "still working & busy")).unwrap(),
            AdminMessage::Error(ErrorMessage {
                code: 550,
                message: "still working & busy".to_string()
            })
        );
    }

    #[test]
    fn test_greeting() {
        let profiles = vec!["urn:a".to_string(), "urn:b".to_string()];
        assert_eq!(
            parse(&greeting_message(&profiles)).unwrap(),
            AdminMessage::Greeting(GreetingMessage {
                profiles,
                ..GreetingMessage::default()
            })
        );
        assert_eq!(
            parse("<greeting features='x-debug' />").unwrap(),
            AdminMessage::Greeting(GreetingMessage {
                features: Some("x-debug".to_string()),
                ..GreetingMessage::default()
            })
        );
        assert_eq!(
            parse(&greeting_message(&[])).unwrap(),
            AdminMessage::Greeting(GreetingMessage::default())
        );
    }

    #[test]
    fn test_deep_nesting_is_a_syntax_error() {
        let text = format!("<start number='1'>{}", "<a>".repeat(20_000));
        let err = parse(&text).unwrap_err();
        assert_eq!(err.code(), 500);
        assert!(err.to_string().contains("nested too deeply"), "{err}");

        // the deepest legal message still parses
        let nested = "<start number='1'><profile uri='u'><![CDATA[x]]></profile></start>";
        assert!(parse(nested).is_ok());
    }

    #[test]
    fn test_profile_reply() {
        assert_eq!(
            parse(&profile_message("urn:echo", None)).unwrap(),
            AdminMessage::Profile(ProfileMessage {
                uri: "urn:echo".to_string(),
                encoding: ProfileEncoding::None,
                content: None
            })
        );
    }

    #[test]
    fn test_syntax_errors() {
        for text in [
            "<start number='1'>",
            "<close number='1' code='200'>",
            "<ok></error>",
            "<error code=550/>",
            "<ok/><ok/>",
            "plain text",
        ] {
            let err = parse(text).unwrap_err();
            assert_eq!(err.code(), 500, "{text}");
        }
    }

    #[test]
    fn test_invalid_messages() {
        for text in [
            "<start number='1' />",
            "<start number='x'><profile uri='u'/></start>",
            "<start number='1'><nope/></start>",
            "<close number='1' />",
            "<close number='1' code='42' />",
            "<error>missing code</error>",
            "<profile />",
            "<profile uri='u' encoding='rot13' />",
            "<greeting><start number='1' /></greeting>",
        ] {
            let err = parse(text).unwrap_err();
            assert_eq!(err.code(), 501, "{text}");
        }
    }
}
