//! Channel creation through `<start>`.
//!
//! The requesting side sends `<start>` on channel 0 and waits for the
//! confirming `<profile>` or an `<error>`. The accepting side picks the
//! first profile it runs, asks the profile's start handler and answers now
//! or later through [`Channel::notify_start`].

use std::fmt;
use std::sync::Arc;

use beepcore_frame::{Frame, FrameType, ADMIN_CHANNEL};
use tracing::{debug, warn};

use crate::admin::{
    error_message, profile_message, start_message, AdminMessage, ProfileEncoding, StartMessage,
};
use crate::channel::{Channel, DeferredStart};
use crate::connection::Connection;
use crate::context::Context;
use crate::control::TRANSACTION_FAILED_CODE;
use crate::error::{ChannelError, Result};
use crate::handlers::{CloseHandler, FrameReceivedHandler, ReceivedHandler};
use crate::profiles::{StartDecision, StartRequest};
use crate::wait_reply::WaitReply;

/// Parameters of a locally initiated channel.
#[derive(Clone)]
pub struct ChannelRequest {
    /// Channel number to request; picked by the connection when unset.
    pub number: Option<u32>,
    pub profile: String,
    pub server_name: Option<String>,
    /// Content piggybacked in the `<profile>` element.
    pub content: Option<String>,
    pub encoding: ProfileEncoding,
    pub on_frame: Option<FrameReceivedHandler>,
    pub on_close: Option<CloseHandler>,
    /// Overrides the configured serialize flag.
    pub serialize: Option<bool>,
}

impl ChannelRequest {
    pub fn new(profile: impl Into<String>) -> Self {
        Self {
            number: None,
            profile: profile.into(),
            server_name: None,
            content: None,
            encoding: ProfileEncoding::None,
            on_frame: None,
            on_close: None,
            serialize: None,
        }
    }

    pub fn number(mut self, number: u32) -> Self {
        self.number = Some(number);
        self
    }

    pub fn server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }

    pub fn content(mut self, content: impl Into<String>, encoding: ProfileEncoding) -> Self {
        self.content = Some(content.into());
        self.encoding = encoding;
        self
    }

    pub fn on_frame<F>(mut self, handler: F) -> Self
    where
        F: Fn(&Arc<Channel>, &Frame) + Send + Sync + 'static,
    {
        self.on_frame = Some(Arc::new(handler));
        self
    }

    pub fn on_close<F>(mut self, handler: F) -> Self
    where
        F: Fn(&Arc<Channel>) -> bool + Send + Sync + 'static,
    {
        self.on_close = Some(Arc::new(handler));
        self
    }

    pub fn serialize(mut self, serialize: bool) -> Self {
        self.serialize = Some(serialize);
        self
    }
}

impl fmt::Debug for ChannelRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelRequest")
            .field("number", &self.number)
            .field("profile", &self.profile)
            .field("server_name", &self.server_name)
            .field("content", &self.content)
            .field("encoding", &self.encoding)
            .field("serialize", &self.serialize)
            .finish_non_exhaustive()
    }
}

/// Start a channel and block until the peer confirms or refuses it.
///
/// Piggybacked content of the confirmation is kept as an RPY frame with
/// message number 0, see [`Channel::take_piggyback`].
pub fn open_channel(
    connection: &Arc<dyn Connection>,
    context: &Arc<Context>,
    request: ChannelRequest,
) -> Result<Arc<Channel>> {
    if !connection.is_ok() {
        return Err(ChannelError::NotConnected);
    }
    if context.config().enforce_profile_support && !connection.is_profile_supported(&request.profile) {
        warn!(profile = %request.profile, "profile not advertised by peer");
        return Err(ChannelError::ProfileNotSupported(request.profile));
    }

    let number = match request.number {
        Some(number) => number,
        None => connection
            .next_channel_number()
            .ok_or(ChannelError::NoChannelNumber)?,
    };
    if connection.channel_exists(number) {
        return Err(ChannelError::ChannelExists(number));
    }
    let admin = connection
        .channel(ADMIN_CHANNEL)
        .ok_or(ChannelError::NotConnected)?;

    context.profiles().register_if_missing(&request.profile);
    let channel = Channel::create_empty(number, &request.profile, connection, context);
    if let Some(handler) = request.on_frame.clone() {
        channel.set_received(ReceivedHandler::User(handler));
    }
    if let Some(handler) = request.on_close.clone() {
        channel.set_close_handler(move |channel| handler(channel));
    }
    if let Some(serialize) = request.serialize {
        channel.set_serialize(serialize);
    }
    channel.set_server_name(request.server_name.clone());
    connection.add_channel(Arc::clone(&channel));

    let result = negotiate(connection, &admin, &channel, &request);
    if let Err(err) = result {
        connection.remove_channel(number);
        return Err(err);
    }

    channel.set_opened(true);
    debug!(channel = number, profile = %request.profile, "channel opened");
    Ok(channel)
}

/// Start a channel on a worker thread and report through `on_created`.
/// Piggybacked content is then delivered to the channel's receive handler.
pub fn open_channel_with<F>(
    connection: &Arc<dyn Connection>,
    context: &Arc<Context>,
    request: ChannelRequest,
    on_created: F,
) where
    F: FnOnce(Result<Arc<Channel>>) + Send + 'static,
{
    let connection = Arc::clone(connection);
    let task_context = Arc::clone(context);
    context.submit_or_run(move || {
        let result = open_channel(&connection, &task_context, request);
        let piggyback = result
            .as_ref()
            .ok()
            .and_then(|channel| channel.take_piggyback().map(|frame| (Arc::clone(channel), frame)));
        on_created(result);
        if let Some((channel, frame)) = piggyback {
            channel.call_received(&frame);
        }
    });
}

fn negotiate(
    connection: &Arc<dyn Connection>,
    admin: &Arc<Channel>,
    channel: &Arc<Channel>,
    request: &ChannelRequest,
) -> Result<()> {
    let number = channel.number();
    let wait = WaitReply::new();
    let message = start_message(
        number,
        request.server_name.as_deref(),
        &request.profile,
        request.encoding,
        request.content.as_deref(),
    );
    let msgno = admin.send_msg_and_wait(message, &wait)?;
    debug!(channel = number, msgno, profile = %request.profile, "start requested");

    let reply = admin.wait_reply(&wait)?;
    let parsed = channel.context().parser().parse(&reply.payload);
    match (reply.kind, parsed) {
        (FrameType::Err, Ok(AdminMessage::Error(error))) => {
            warn!(channel = number, code = error.code, message = %error.message, "start denied by peer");
            connection.push_channel_error(error.code, &error.message);
            Err(ChannelError::Denied {
                code: error.code,
                message: error.message,
            })
        }
        (FrameType::Rpy, Ok(AdminMessage::Profile(profile))) => {
            if profile.uri != request.profile {
                return Err(ChannelError::UnexpectedProfile {
                    requested: request.profile.clone(),
                    received: profile.uri,
                });
            }
            if let Some(content) = profile.content {
                debug!(channel = number, size = content.len(), "start reply piggyback stored");
                channel.set_piggyback(Frame::new(FrameType::Rpy, number, 0, content));
            }
            Ok(())
        }
        (kind, parsed) => Err(admin.violation(
            connection.as_ref(),
            format!("unexpected {kind} reply to start of channel {number}: {parsed:?}"),
        )),
    }
}

/// Handle a `<start>` received as message `msgno` on channel 0.
pub(crate) fn on_start(
    admin: &Arc<Channel>,
    connection: &Arc<dyn Connection>,
    msgno: u32,
    request: StartMessage,
) -> Result<()> {
    let number = request.number;
    debug!(channel = number, msgno, profiles = request.profiles.len(), "start requested by peer");

    if number == ADMIN_CHANNEL || connection.channel_exists(number) {
        return admin.send_err(
            msgno,
            error_message(
                TRANSACTION_FAILED_CODE,
                "transaction failed: channel requested already exists",
            ),
        );
    }

    let context = admin.context();
    let server_name = request.server_name.as_deref();
    let mut filtered = false;
    let chosen = request.profiles.iter().find(|profile| {
        if !context.profiles().is_registered(&profile.uri) {
            return false;
        }
        if connection.is_profile_filtered(number, &profile.uri, server_name) {
            filtered = true;
            return false;
        }
        true
    });

    let Some(chosen) = chosen else {
        let reason = if filtered {
            "transaction failed: requested profile is not available on the connection"
        } else {
            "transaction failed: channel profile requested not supported"
        };
        debug!(channel = number, reason, "start refused");
        return admin.send_err(msgno, error_message(TRANSACTION_FAILED_CODE, reason));
    };

    let channel = Channel::create_empty(number, &chosen.uri, connection, context);
    connection.add_channel(Arc::clone(&channel));
    channel.defer_start(DeferredStart {
        msgno,
        server_name: request.server_name.clone(),
    });

    let decision = match context.profiles().get(&chosen.uri).and_then(|profile| profile.start) {
        Some(handler) => handler(&StartRequest {
            channel: &channel,
            profile: &chosen.uri,
            server_name,
            content: chosen.content.as_deref(),
            encoding: chosen.encoding,
        }),
        None => StartDecision::accept(),
    };
    channel.notify_start(decision)
}

impl Channel {
    /// Answer the `<start>` that created this channel. A start handler that
    /// returned [`StartDecision::Defer`] must call this exactly once.
    pub fn notify_start(self: &Arc<Self>, decision: StartDecision) -> Result<()> {
        let start = self
            .take_deferred_start()
            .ok_or(ChannelError::NoDeferredStart(self.number()))?;
        if decision == StartDecision::Defer {
            debug!(channel = self.number(), msgno = start.msgno, "start answer deferred");
            self.defer_start(start);
            return Ok(());
        }

        let connection = self.live_connection()?;
        let admin = self.admin_channel(&connection)?;
        match decision {
            StartDecision::Deny { code, message } => {
                debug!(channel = self.number(), code, "start denied");
                connection.remove_channel(self.number());
                admin.send_err(start.msgno, error_message(code, &message))
            }
            StartDecision::Accept { reply } => {
                if let Some(name) = start.server_name.as_deref() {
                    self.set_server_name(Some(name.to_string()));
                    if connection.server_name().is_none() {
                        connection.set_server_name(name);
                    }
                }
                self.set_opened(true);
                debug!(channel = self.number(), profile = self.profile(), "channel accepted");
                admin.send_rpy(start.msgno, profile_message(self.profile(), reply.as_deref()))
            }
            StartDecision::Defer => Ok(()),
        }
    }
}
