//! Profiles a context can run, with their default handlers.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use beepcore_frame::{Frame, MimeHeaders};
use beepcore_pool::sync::{read, write};
use tracing::debug;

use crate::admin::ProfileEncoding;
use crate::channel::Channel;
use crate::handlers::{CloseHandler, FrameReceivedHandler};

/// Error code sent when a start handler denies without giving one.
pub const START_DENIED_CODE: u16 = 421;

/// Error text sent when a start handler denies without giving one.
pub const START_DENIED_MESSAGE: &str =
    "service not available: channel can not be created, start handler denied";

/// A `<start>` request as seen by the accepting side.
pub struct StartRequest<'a> {
    /// The channel being created; not yet opened.
    pub channel: &'a Arc<Channel>,
    pub profile: &'a str,
    pub server_name: Option<&'a str>,
    /// Piggybacked profile content, still encoded as announced.
    pub content: Option<&'a str>,
    pub encoding: ProfileEncoding,
}

/// Outcome of a start handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartDecision {
    /// Open the channel, optionally piggybacking `reply` in the `<profile>`.
    Accept { reply: Option<String> },
    /// Refuse with an `<error>`.
    Deny { code: u16, message: String },
    /// Answer later through [`Channel::notify_start`].
    Defer,
}

impl StartDecision {
    pub fn accept() -> Self {
        StartDecision::Accept { reply: None }
    }

    pub fn accept_with(reply: impl Into<String>) -> Self {
        StartDecision::Accept {
            reply: Some(reply.into()),
        }
    }

    pub fn deny() -> Self {
        StartDecision::Deny {
            code: START_DENIED_CODE,
            message: START_DENIED_MESSAGE.to_string(),
        }
    }
}

pub type StartHandler = Arc<dyn Fn(&StartRequest<'_>) -> StartDecision + Send + Sync>;

/// Handlers and MIME defaults registered for one profile uri.
#[derive(Clone, Default)]
pub struct ProfileHandlers {
    pub start: Option<StartHandler>,
    pub close: Option<CloseHandler>,
    pub received: Option<FrameReceivedHandler>,
    pub mime: MimeHeaders,
}

impl ProfileHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_start<F>(mut self, handler: F) -> Self
    where
        F: Fn(&StartRequest<'_>) -> StartDecision + Send + Sync + 'static,
    {
        self.start = Some(Arc::new(handler));
        self
    }

    pub fn on_close<F>(mut self, handler: F) -> Self
    where
        F: Fn(&Arc<Channel>) -> bool + Send + Sync + 'static,
    {
        self.close = Some(Arc::new(handler));
        self
    }

    pub fn on_frame<F>(mut self, handler: F) -> Self
    where
        F: Fn(&Arc<Channel>, &Frame) + Send + Sync + 'static,
    {
        self.received = Some(Arc::new(handler));
        self
    }

    pub fn with_mime(mut self, mime: MimeHeaders) -> Self {
        self.mime = mime;
        self
    }
}

impl fmt::Debug for ProfileHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProfileHandlers")
            .field("start", &self.start.is_some())
            .field("close", &self.close.is_some())
            .field("received", &self.received.is_some())
            .field("mime", &self.mime)
            .finish()
    }
}

/// Registered profiles keyed by uri.
#[derive(Default)]
pub struct ProfileRegistry {
    profiles: RwLock<HashMap<String, ProfileHandlers>>,
}

impl ProfileRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace the handlers for `uri`.
    pub fn register(&self, uri: &str, handlers: ProfileHandlers) {
        debug!(profile = uri, ?handlers, "profile registered");
        write(&self.profiles).insert(uri.to_string(), handlers);
    }

    /// Register `uri` with default handlers unless it is already known.
    pub fn register_if_missing(&self, uri: &str) {
        write(&self.profiles)
            .entry(uri.to_string())
            .or_insert_with(ProfileHandlers::default);
    }

    pub fn unregister(&self, uri: &str) -> bool {
        write(&self.profiles).remove(uri).is_some()
    }

    pub fn is_registered(&self, uri: &str) -> bool {
        read(&self.profiles).contains_key(uri)
    }

    pub fn get(&self, uri: &str) -> Option<ProfileHandlers> {
        read(&self.profiles).get(uri).cloned()
    }

    pub fn uris(&self) -> Vec<String> {
        let mut uris: Vec<String> = read(&self.profiles).keys().cloned().collect();
        uris.sort();
        uris
    }

    pub fn mime(&self, uri: &str) -> MimeHeaders {
        read(&self.profiles)
            .get(uri)
            .map(|profile| profile.mime.clone())
            .unwrap_or_default()
    }

    pub fn received_handler(&self, uri: &str) -> Option<FrameReceivedHandler> {
        read(&self.profiles)
            .get(uri)
            .and_then(|profile| profile.received.clone())
    }

    pub fn close_handler(&self, uri: &str) -> Option<CloseHandler> {
        read(&self.profiles)
            .get(uri)
            .and_then(|profile| profile.close.clone())
    }
}

impl fmt::Debug for ProfileRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProfileRegistry")
            .field("uris", &self.uris())
            .finish()
    }
}
