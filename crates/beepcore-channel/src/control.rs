//! Channel 0 request handling.
//!
//! Requests arrive as MSG frames on channel 0 and are answered with RPY or
//! ERR on the same channel. Replies to requests this side sent are normally
//! taken by waiters before they get here. The exception is the peer's
//! greeting, the reply to the implicit message 0 of the session.

use std::sync::Arc;

use beepcore_frame::{Frame, FrameType, ADMIN_CHANNEL};
use tracing::{debug, warn};

use crate::admin::{
    error_message, greeting_message, identify, AdminKind, AdminMessage, CloseMessage,
    GREETING_MSGNO, OK_MESSAGE,
};
use crate::channel::{Channel, CLOSE_DENIED_CODE, CLOSE_DENIED_MESSAGE};
use crate::connection::Connection;
use crate::error::Result;
use crate::start;

/// Reply code for requests naming a channel in the wrong state.
pub const TRANSACTION_FAILED_CODE: u16 = 554;

/// Reply code for requests that are not management messages.
pub const SYNTAX_ERROR_CODE: u16 = 500;

/// Reply code for management messages that are not requests.
pub const PARAMETER_ERROR_CODE: u16 = 501;

/// Send this side's greeting on channel 0, advertising every profile
/// registered in the channel's context.
pub fn send_greeting(admin: &Arc<Channel>) -> Result<()> {
    let profiles = admin.context().profiles().uris();
    debug!(profiles = profiles.len(), "sending greeting");
    admin.send_rpy(GREETING_MSGNO, greeting_message(&profiles))
}

/// Process one frame received on channel 0.
pub fn handle_admin_frame(admin: &Arc<Channel>, frame: &Frame) {
    let Some(connection) = admin.connection() else {
        return;
    };
    match frame.kind {
        FrameType::Msg => {
            if let Err(err) = handle_request(admin, &connection, frame) {
                debug!(msgno = frame.msgno, error = %err, "channel 0 request failed");
            }
        }
        FrameType::Rpy | FrameType::Err if frame.msgno == GREETING_MSGNO => {
            on_greeting(admin, &connection, frame);
        }
        _ => debug!(frame = %frame, "unsolicited reply on channel 0, dropped"),
    }
}

fn on_greeting(admin: &Arc<Channel>, connection: &Arc<dyn Connection>, frame: &Frame) {
    if frame.kind == FrameType::Err {
        warn!(connection = connection.id(), "peer refused the session");
        connection.set_not_connected("session refused by remote peer");
        return;
    }
    match admin.context().parser().parse(&frame.payload) {
        Ok(AdminMessage::Greeting(greeting)) => {
            debug!(
                connection = connection.id(),
                profiles = greeting.profiles.len(),
                "greeting received"
            );
            connection.set_remote_profiles(greeting.profiles);
        }
        Ok(other) => {
            admin.violation(connection.as_ref(), format!("expected a greeting, got {other:?}"));
        }
        Err(err) => {
            admin.violation(connection.as_ref(), format!("malformed greeting: {err}"));
        }
    }
}

fn handle_request(
    admin: &Arc<Channel>,
    connection: &Arc<dyn Connection>,
    frame: &Frame,
) -> Result<()> {
    let msgno = frame.msgno;
    if identify(&frame.payload) == AdminKind::Unknown {
        admin.send_err(
            msgno,
            error_message(SYNTAX_ERROR_CODE, "unable to parse management message"),
        )?;
        return Err(admin.violation(
            connection.as_ref(),
            format!("unknown management message {frame}"),
        ));
    }

    let message = match admin.context().parser().parse(&frame.payload) {
        Ok(message) => message,
        Err(err) => {
            admin.send_err(msgno, error_message(err.code(), &err.to_string()))?;
            return Err(admin.violation(
                connection.as_ref(),
                format!("malformed management message: {err}"),
            ));
        }
    };

    match message {
        AdminMessage::Start(request) => start::on_start(admin, connection, msgno, request),
        AdminMessage::Close(request) => on_close(admin, connection, msgno, &request),
        other => {
            admin.send_err(
                msgno,
                error_message(PARAMETER_ERROR_CODE, "management message is not a request"),
            )?;
            Err(admin.violation(
                connection.as_ref(),
                format!("unexpected management request {other:?}"),
            ))
        }
    }
}

fn on_close(
    admin: &Arc<Channel>,
    connection: &Arc<dyn Connection>,
    msgno: u32,
    request: &CloseMessage,
) -> Result<()> {
    debug!(
        channel = request.number,
        msgno,
        code = request.code,
        "close requested by peer"
    );

    let Some(channel) = connection.channel(request.number) else {
        return admin.send_err(
            msgno,
            error_message(
                TRANSACTION_FAILED_CODE,
                "transaction failed: channel requested to close doesn't exists",
            ),
        );
    };

    if channel.is_being_closed() {
        let Some(wait) = channel.close_in_transit() else {
            warn!(channel = request.number, "close requested twice");
            return admin.send_err(
                msgno,
                error_message(
                    TRANSACTION_FAILED_CODE,
                    "transaction failed: channel is already being closed",
                ),
            );
        };

        // both sides asked: take theirs as the answer to ours and confirm it
        debug!(channel = request.number, msgno, "close in transit");
        let answered = wait.msgno().unwrap_or(msgno);
        wait.push(Frame::new(FrameType::Rpy, ADMIN_CHANNEL, answered, OK_MESSAGE));
        return admin.send_rpy(msgno, OK_MESSAGE);
    }

    if let Some(notify) = channel.close_notify_handler() {
        debug!(channel = request.number, msgno, "close answer deferred");
        notify(&channel, msgno);
        return Ok(());
    }

    if channel.ask_close_handler() {
        channel.accept_close(connection, admin, msgno)
    } else {
        debug!(channel = request.number, msgno, "close refused by handler");
        admin.send_err(msgno, error_message(CLOSE_DENIED_CODE, CLOSE_DENIED_MESSAGE))
    }
}
