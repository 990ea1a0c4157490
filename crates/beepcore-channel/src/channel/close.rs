//! Close negotiation.
//!
//! A local close waits until every message sent on the channel has its
//! reply, sends `<close>` on channel 0, waits until every reply owed to the
//! peer is written and then waits for `<ok />` or `<error>`. When the peer
//! asks to close the same channel meanwhile, its request is answered with
//! `<ok />` and taken as the answer to ours.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use beepcore_frame::{Frame, FrameType, ADMIN_CHANNEL};
use beepcore_pool::sync::{lock, read, wait_timeout};
use tracing::{debug, warn};

use super::Channel;
use crate::admin::{
    close_message, error_message, is_ok_message, AdminMessage, CLOSE_CODE_OK, OK_MESSAGE,
};
use crate::connection::Connection;
use crate::error::{ChannelError, Result};
use crate::handlers::CloseNotifyHandler;
use crate::wait_reply::WaitReply;

/// Reply code refusing a close while the channel is in use.
pub const CLOSE_DENIED_CODE: u16 = 550;

/// Reply text refusing a close while the channel is in use.
pub const CLOSE_DENIED_MESSAGE: &str = "still working";

impl Channel {
    /// Close the channel, blocking until the peer answers.
    ///
    /// Calling this from inside the channel's own close handler is a no-op,
    /// as is closing a channel that already completed its close.
    pub fn close(self: &Arc<Self>) -> Result<()> {
        match self.begin_close()? {
            Some(wait) => self.run_close(wait),
            None => Ok(()),
        }
    }

    /// Close the channel on a worker thread and report through `on_closed`.
    pub fn close_with<F>(self: &Arc<Self>, on_closed: F)
    where
        F: FnOnce(u32, Result<()>) + Send + 'static,
    {
        let number = self.number;
        let wait = match self.begin_close() {
            Ok(Some(wait)) => wait,
            Ok(None) => return on_closed(number, Ok(())),
            Err(err) => return on_closed(number, Err(err)),
        };

        let channel = Arc::clone(self);
        self.context.submit_or_run(move || {
            let result = channel.run_close(wait);
            on_closed(number, result);
        });
    }

    fn begin_close(&self) -> Result<Option<Arc<WaitReply>>> {
        if self.close_handler_running.load(Ordering::Acquire) {
            debug!(channel = self.number, "close requested from its close handler, ignored");
            return Ok(None);
        }
        if !self.is_opened() {
            if self.closed_notified.load(Ordering::Acquire) {
                return Ok(None);
            }
            return Err(ChannelError::NotOpened(self.number));
        }

        let mut close = lock(&self.close);
        if self.being_closed.swap(true, Ordering::AcqRel) {
            debug!(channel = self.number, "close already in progress");
            return Err(ChannelError::AlreadyClosing(self.number));
        }
        let wait = WaitReply::new();
        close.close_wait = Some(Arc::clone(&wait));
        Ok(Some(wait))
    }

    fn run_close(self: &Arc<Self>, wait: Arc<WaitReply>) -> Result<()> {
        let Some(connection) = self.live_connection().ok() else {
            debug!(channel = self.number, "connection already gone, channel detached");
            self.finish_close();
            return Ok(());
        };

        if let Err(err) = self.block_until_replies_are_received(connection.as_ref()) {
            self.finish_close();
            return Err(err);
        }

        if self.number == ADMIN_CHANNEL {
            connection.set_being_closed(true);
        }

        let result = self.negotiate_close(&connection, &wait);
        if result.is_err() && self.is_opened() {
            self.abort_close(connection.as_ref());
        }
        result
    }

    fn negotiate_close(
        self: &Arc<Self>,
        connection: &Arc<dyn Connection>,
        wait: &Arc<WaitReply>,
    ) -> Result<()> {
        let admin = self.admin_channel(connection)?;

        if wait.has_reply() {
            debug!(channel = self.number, "close in transit, request not sent");
        } else {
            let msgno = admin.send_msg_and_wait(close_message(self.number, CLOSE_CODE_OK), wait)?;
            debug!(channel = self.number, msgno, "close requested");
        }

        let timeout = self.context.config().reply_timeout;
        self.block_until_replies_are_sent(connection.as_ref(), timeout, 0)?;

        let reply = admin.wait_reply(wait)?;
        // a close answered in transit leaves the real reply still expected
        admin.waiters.cancel(wait);
        self.handle_close_reply(connection, &reply)
    }

    fn handle_close_reply(self: &Arc<Self>, connection: &Arc<dyn Connection>, reply: &Frame) -> Result<()> {
        let parsed = || self.context.parser().parse(&reply.payload);
        match reply.kind {
            FrameType::Err => {
                let (code, message) = match parsed() {
                    Ok(AdminMessage::Error(error)) => (error.code, error.message),
                    _ => {
                        return Err(self.violation(
                            connection.as_ref(),
                            format!("malformed error reply to close of channel {}", self.number),
                        ))
                    }
                };
                warn!(channel = self.number, code, message = %message, "close denied by peer");
                self.abort_close(connection.as_ref());
                Err(ChannelError::Denied { code, message })
            }
            FrameType::Rpy if is_ok_message(&reply.payload) || matches!(parsed(), Ok(AdminMessage::Ok)) => {
                self.finish_close();
                if self.number == ADMIN_CHANNEL {
                    connection.set_not_connected("session closed");
                }
                Ok(())
            }
            _ => Err(self.violation(
                connection.as_ref(),
                format!("unexpected reply {} to close of channel {}", reply, self.number),
            )),
        }
    }

    /// Leave the channel usable after a failed close.
    fn abort_close(&self, connection: &dyn Connection) {
        lock(&self.close).close_wait = None;
        self.being_closed.store(false, Ordering::Release);
        if self.number == ADMIN_CHANNEL {
            connection.set_being_closed(false);
        }
    }

    /// Mark the channel closed, detach it from its connection and run the
    /// closed handler. Only the first call has any effect.
    pub(crate) fn finish_close(self: &Arc<Self>) {
        if self.closed_notified.swap(true, Ordering::AcqRel) {
            return;
        }
        self.set_opened(false);
        lock(&self.close).close_wait = None;
        self.waiters.clear();

        if let Some(connection) = self.connection() {
            connection.remove_channel(self.number);
        }
        debug!(channel = self.number, "channel closed");

        let closed = read(&self.handlers).closed.clone();
        if let Some(closed) = closed {
            closed(self);
        }
    }

    /// Wait until every message sent has its reply. Only a dead
    /// connection ends the wait early.
    fn block_until_replies_are_received(&self, connection: &dyn Connection) -> Result<()> {
        let slice = self.context.config().close_poll_interval;
        let mut close = lock(&self.close);
        while !self.is_up_to_date() {
            if !connection.is_ok() {
                return Err(ChannelError::NotConnected);
            }
            debug!(
                channel = self.number,
                sent = self.next_msgno_out.load(Ordering::Acquire),
                replied = self.next_reply_in.load(Ordering::Acquire),
                "close waiting for replies"
            );
            close = wait_timeout(&self.close_signal, close, slice).0;
        }
        Ok(())
    }

    /// Wait until every reply owed to the peer, except the last `keep`
    /// messages, has been written.
    pub(crate) fn block_until_replies_are_sent(
        &self,
        connection: &dyn Connection,
        timeout: Duration,
        keep: u32,
    ) -> Result<()> {
        let slice = self.context.config().close_poll_interval;
        let deadline = Instant::now() + timeout;
        let mut written = lock(&self.written);
        loop {
            let owed = self.next_msgno_in.load(Ordering::Acquire).wrapping_sub(keep);
            if *written == owed {
                return Ok(());
            }
            if !connection.is_ok() {
                return Err(ChannelError::NotConnected);
            }
            let now = Instant::now();
            if now >= deadline {
                warn!(channel = self.number, owed, written = *written, "replies not flushed in time");
                return Err(ChannelError::Timeout(timeout));
            }
            written = wait_timeout(&self.flushed, written, slice.min(deadline - now)).0;
        }
    }

    /// Wake a close blocked on outstanding replies.
    pub(crate) fn signal_on_close_blocked(&self) {
        let _close = lock(&self.close);
        self.close_signal.notify_all();
    }

    /// Reply slot of the local close request while one runs.
    pub(crate) fn close_in_transit(&self) -> Option<Arc<WaitReply>> {
        if !self.is_being_closed() {
            return None;
        }
        lock(&self.close).close_wait.clone()
    }

    pub(crate) fn close_notify_handler(&self) -> Option<CloseNotifyHandler> {
        read(&self.handlers).close_notify.clone()
    }

    /// Ask the channel, then its profile, whether a peer close request is
    /// accepted. Without any handler the request is accepted.
    pub(crate) fn ask_close_handler(self: &Arc<Self>) -> bool {
        let handler = read(&self.handlers)
            .close
            .clone()
            .or_else(|| self.context.profiles().close_handler(&self.profile));
        let Some(handler) = handler else {
            return true;
        };

        self.close_handler_running.store(true, Ordering::Release);
        let accepted = handler(self);
        self.close_handler_running.store(false, Ordering::Release);
        accepted
    }

    /// Answer a peer close request received as message `msgno` on
    /// channel 0, after a close-notify handler deferred it.
    pub fn notify_close(self: &Arc<Self>, msgno: u32, accept: bool) -> Result<()> {
        let connection = self.live_connection()?;
        let admin = self.admin_channel(&connection)?;
        if !accept {
            debug!(channel = self.number, msgno, "close request refused");
            return admin.send_err(msgno, error_message(CLOSE_DENIED_CODE, CLOSE_DENIED_MESSAGE));
        }
        self.accept_close(&connection, &admin, msgno)
    }

    /// Confirm a peer close request: flush owed replies, send `<ok />` and
    /// detach. For channel 0 the session ends once the reply is written.
    pub(crate) fn accept_close(
        self: &Arc<Self>,
        connection: &Arc<dyn Connection>,
        admin: &Arc<Channel>,
        msgno: u32,
    ) -> Result<()> {
        if self.closed_notified.load(Ordering::Acquire) {
            debug!(channel = self.number, msgno, "channel already closed, confirming");
            return admin.send_rpy(msgno, OK_MESSAGE);
        }

        let admin_close = self.number == ADMIN_CHANNEL;
        self.being_closed.store(true, Ordering::Release);
        let timeout = self.context.config().reply_timeout;
        // channel 0 still owes the reply to this very request
        let keep = u32::from(admin_close);
        if let Err(err) = self.block_until_replies_are_sent(connection.as_ref(), timeout, keep) {
            self.being_closed.store(false, Ordering::Release);
            if matches!(err, ChannelError::Timeout(_)) {
                admin.send_err(msgno, error_message(CLOSE_DENIED_CODE, CLOSE_DENIED_MESSAGE))?;
            }
            return Err(err);
        }

        if admin_close {
            connection.set_being_closed(true);
            let flushed = admin.install_waiter(msgno);
            admin.send_rpy(msgno, OK_MESSAGE)?;
            if !admin.wait_until_sent(&flushed, timeout) {
                warn!(msgno, "close confirmation not written in time");
            }
            self.finish_close();
            connection.set_not_connected("session closed by remote peer");
            return Ok(());
        }

        admin.send_rpy(msgno, OK_MESSAGE)?;
        // no send may be in flight once the channel is detached
        drop(lock(&self.send));
        self.finish_close();
        Ok(())
    }
}
