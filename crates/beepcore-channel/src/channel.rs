//! The channel state machine.
//!
//! A [`Channel`] owns the numbering, flow control, reassembly and delivery
//! state of one BEEP channel. Channels are shared through `Arc`; the owning
//! connection keeps one reference while the channel is addressable by
//! number and channels only hold a `Weak` back to it.

mod close;
mod sequencer;

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock, Weak};
use std::time::{Duration, Instant};

use beepcore_frame::seq::advance;
use beepcore_frame::{
    Frame, FrameType, MimeHeaders, SeqFrame, ADMIN_CHANNEL, MAX_FRAME_SIZE, MAX_MSG_NO,
};
use beepcore_pool::sync::{lock, read, write};
use beepcore_pool::BlockingQueue;
use bytes::Bytes;
use tracing::{debug, error, warn};

use crate::connection::Connection;
use crate::context::Context;
use crate::control;
use crate::error::{ChannelError, Result};
use crate::flow::{FlowControl, FrameSizeHandler};
use crate::handlers::{Handlers, ReceivedHandler};
use crate::reassembly::{FragmentBuffer, ReassemblyError};
use crate::replies::{PendingReply, StoredReplies};
use crate::serialize::DeliverySerializer;
use crate::wait_reply::{WaitRegistry, WaitReply};

pub use close::{CLOSE_DENIED_CODE, CLOSE_DENIED_MESSAGE};
pub use sequencer::SequencerData;

/// Outbound numbering, guarded by the send lock.
#[derive(Debug)]
struct SendState {
    /// Message number the next reply must answer.
    next_reply: u32,
    next_seqno: u32,
    next_ansno: u32,
    stored: StoredReplies,
}

/// Inbound numbering and reassembly, guarded by the receive lock.
#[derive(Debug)]
struct InboundState {
    next_seqno: u32,
    fragments: FragmentBuffer,
    /// A message has started but its final frame has not arrived.
    in_message: bool,
    /// Complete ANS frames received since the last NUL.
    answers: u32,
}

#[derive(Debug, Default)]
struct CloseState {
    /// Reply slot of the local close request, present while it runs.
    close_wait: Option<Arc<WaitReply>>,
}

/// A `<start>` accepted for processing but not answered yet.
#[derive(Debug, Clone)]
pub(crate) struct DeferredStart {
    pub(crate) msgno: u32,
    pub(crate) server_name: Option<String>,
}

/// Counters and window state of a channel at one instant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelStatus {
    pub number: u32,
    pub opened: bool,
    pub being_closed: bool,
    pub next_msgno_out: u32,
    pub next_msgno_in: u32,
    pub next_reply_out: u32,
    pub next_reply_in: u32,
    pub replies_written: u32,
    pub next_seqno_out: u32,
    pub next_seqno_in: u32,
    pub next_ansno_out: u32,
    pub window_size: u32,
    pub max_seq_no_accepted: u32,
    pub max_seq_no_remote_accepted: u32,
    pub stalled: usize,
    pub stored_replies: usize,
    pub waiting_replies: usize,
}

/// One BEEP channel.
pub struct Channel {
    number: u32,
    profile: String,
    connection: Weak<dyn Connection>,
    context: Arc<Context>,
    mime: RwLock<MimeHeaders>,

    opened: AtomicBool,
    being_closed: AtomicBool,
    being_sending: AtomicBool,
    serialize: AtomicBool,
    complete_frames: AtomicBool,
    reply_processed: AtomicBool,
    close_handler_running: AtomicBool,
    closed_notified: AtomicBool,

    next_msgno_out: AtomicU32,
    next_reply_in: AtomicU32,
    next_msgno_in: AtomicU32,

    send: Mutex<SendState>,
    inbound: Mutex<InboundState>,
    flow: Mutex<FlowControl>,
    stalled: Mutex<VecDeque<SequencerData>>,
    written: Mutex<u32>,
    flushed: Condvar,
    close: Mutex<CloseState>,
    close_signal: Condvar,

    waiters: WaitRegistry,
    flush_waiters: Mutex<HashMap<u32, Arc<BlockingQueue<()>>>>,
    serializer: DeliverySerializer,
    handlers: RwLock<Handlers>,
    frame_size: RwLock<Option<Arc<dyn FrameSizeHandler>>>,
    piggyback: Mutex<Option<Frame>>,
    deferred_start: Mutex<Option<DeferredStart>>,
    server_name: RwLock<Option<String>>,
}

impl Channel {
    /// Create a channel in its initial state. Nothing is sent and the
    /// channel is not added to the connection.
    ///
    /// Channel 0 comes out opened, with management MIME defaults and the
    /// management protocol as receive handler. Message 0 of channel 0 is
    /// implicit: each side answers it with its greeting, so messages start
    /// at 1 while replies start at 0.
    pub fn create_empty(
        number: u32,
        profile: &str,
        connection: &Arc<dyn Connection>,
        context: &Arc<Context>,
    ) -> Arc<Self> {
        let admin = number == ADMIN_CHANNEL;
        let first_msgno = u32::from(admin);
        let config = context.config();

        let (mime, received) = if admin {
            (MimeHeaders::admin(), ReceivedHandler::Admin)
        } else {
            (context.profiles().mime(profile), ReceivedHandler::ProfileDefault)
        };

        let mut flow = FlowControl::new();
        if !flow.set_desired_window_size(config.desired_window_size) {
            warn!(channel = number, "desired window size 0 ignored");
        }

        debug!(
            connection = connection.id(),
            channel = number,
            profile,
            "channel created"
        );

        Arc::new(Self {
            number,
            profile: profile.to_string(),
            connection: Arc::downgrade(connection),
            context: Arc::clone(context),
            mime: RwLock::new(mime),

            opened: AtomicBool::new(admin),
            being_closed: AtomicBool::new(false),
            being_sending: AtomicBool::new(false),
            serialize: AtomicBool::new(!admin && config.serialize),
            complete_frames: AtomicBool::new(config.complete_frames),
            reply_processed: AtomicBool::new(true),
            close_handler_running: AtomicBool::new(false),
            closed_notified: AtomicBool::new(false),

            next_msgno_out: AtomicU32::new(first_msgno),
            next_reply_in: AtomicU32::new(0),
            next_msgno_in: AtomicU32::new(first_msgno),

            send: Mutex::new(SendState {
                next_reply: 0,
                next_seqno: 0,
                next_ansno: 0,
                stored: StoredReplies::default(),
            }),
            inbound: Mutex::new(InboundState {
                next_seqno: 0,
                fragments: FragmentBuffer::new(),
                in_message: false,
                answers: 0,
            }),
            flow: Mutex::new(flow),
            stalled: Mutex::new(VecDeque::new()),
            written: Mutex::new(0),
            flushed: Condvar::new(),
            close: Mutex::new(CloseState::default()),
            close_signal: Condvar::new(),

            waiters: WaitRegistry::default(),
            flush_waiters: Mutex::new(HashMap::new()),
            serializer: DeliverySerializer::new(first_msgno, 0),
            handlers: RwLock::new(Handlers {
                received,
                ..Handlers::default()
            }),
            frame_size: RwLock::new(None),
            piggyback: Mutex::new(None),
            deferred_start: Mutex::new(None),
            server_name: RwLock::new(None),
        })
    }

    /// Channel 0 of `connection`.
    pub fn admin(connection: &Arc<dyn Connection>, context: &Arc<Context>) -> Arc<Self> {
        Self::create_empty(ADMIN_CHANNEL, "", connection, context)
    }

    pub fn number(&self) -> u32 {
        self.number
    }

    pub fn profile(&self) -> &str {
        &self.profile
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.context
    }

    /// The owning connection, while it exists.
    pub fn connection(&self) -> Option<Arc<dyn Connection>> {
        self.connection.upgrade()
    }

    pub(crate) fn live_connection(&self) -> Result<Arc<dyn Connection>> {
        self.connection()
            .filter(|connection| connection.is_ok())
            .ok_or(ChannelError::NotConnected)
    }

    /// Channel 0 of the owning connection.
    pub(crate) fn admin_channel(
        self: &Arc<Self>,
        connection: &Arc<dyn Connection>,
    ) -> Result<Arc<Channel>> {
        if self.number == ADMIN_CHANNEL {
            return Ok(Arc::clone(self));
        }
        connection
            .channel(ADMIN_CHANNEL)
            .ok_or(ChannelError::NotConnected)
    }

    /// Strong references currently held, for diagnostics.
    pub fn ref_count(self: &Arc<Self>) -> usize {
        Arc::strong_count(self)
    }

    pub fn is_opened(&self) -> bool {
        self.opened.load(Ordering::Acquire)
    }

    pub(crate) fn set_opened(&self, opened: bool) {
        self.opened.store(opened, Ordering::Release);
    }

    pub fn is_being_closed(&self) -> bool {
        self.being_closed.load(Ordering::Acquire)
    }

    /// True while outbound data is being cut into frames or waits for the
    /// remote window.
    pub fn is_being_sending(&self) -> bool {
        self.being_sending.load(Ordering::Acquire) || !lock(&self.stalled).is_empty()
    }

    /// Every message sent so far has received its reply. On channel 0 this
    /// includes the peer's greeting.
    pub fn is_up_to_date(&self) -> bool {
        self.next_msgno_out.load(Ordering::Acquire) == self.next_reply_in.load(Ordering::Acquire)
    }

    /// Opened, not closing, no reply outstanding and nothing stalled.
    pub fn is_ready(&self) -> bool {
        self.is_opened()
            && !self.is_being_closed()
            && self.is_up_to_date()
            && lock(&self.stalled).is_empty()
    }

    /// False while a caller is blocked in [`wait_reply`](Self::wait_reply).
    pub fn is_reply_processed(&self) -> bool {
        self.reply_processed.load(Ordering::Acquire)
    }

    pub fn status(&self) -> ChannelStatus {
        let (next_reply_out, next_seqno_out, next_ansno_out, stored_replies) = {
            let send = lock(&self.send);
            (send.next_reply, send.next_seqno, send.next_ansno, send.stored.len())
        };
        let next_seqno_in = lock(&self.inbound).next_seqno;
        let flow = lock(&self.flow).clone();
        ChannelStatus {
            number: self.number,
            opened: self.is_opened(),
            being_closed: self.is_being_closed(),
            next_msgno_out: self.next_msgno_out.load(Ordering::Acquire),
            next_msgno_in: self.next_msgno_in.load(Ordering::Acquire),
            next_reply_out,
            next_reply_in: self.next_reply_in.load(Ordering::Acquire),
            replies_written: *lock(&self.written),
            next_seqno_out,
            next_seqno_in,
            next_ansno_out,
            window_size: flow.window_size(),
            max_seq_no_accepted: flow.max_seq_no_accepted(),
            max_seq_no_remote_accepted: flow.max_seq_no_remote_accepted(),
            stalled: lock(&self.stalled).len(),
            stored_replies,
            waiting_replies: self.waiters.len(),
        }
    }

    pub fn mime(&self) -> MimeHeaders {
        read(&self.mime).clone()
    }

    /// Override the MIME headers prefixed to outgoing messages.
    pub fn set_mime(&self, mime: MimeHeaders) {
        *write(&self.mime) = mime;
    }

    /// Largest payload that fits one default-sized frame together with the
    /// header block of this channel.
    pub fn effective_transfer_size(&self) -> usize {
        if read(&self.mime).is_configured() {
            MAX_FRAME_SIZE
        } else {
            MAX_FRAME_SIZE - 2
        }
    }

    pub fn is_serialized(&self) -> bool {
        self.serialize.load(Ordering::Acquire)
    }

    /// Deliver frames of each class in numbering order.
    pub fn set_serialize(&self, serialize: bool) {
        self.serialize.store(serialize, Ordering::Release);
    }

    /// When off, continuation frames are delivered one by one.
    pub fn set_complete_flag(&self, complete: bool) {
        self.complete_frames.store(complete, Ordering::Release);
    }

    pub fn complete_flag(&self) -> bool {
        self.complete_frames.load(Ordering::Acquire)
    }

    /// Request a receive window; announced with the next SEQ frame.
    pub fn set_window_size(&self, size: u32) -> bool {
        lock(&self.flow).set_desired_window_size(size)
    }

    pub fn window_size(&self) -> u32 {
        lock(&self.flow).window_size()
    }

    pub fn server_name(&self) -> Option<String> {
        read(&self.server_name).clone()
    }

    pub(crate) fn set_server_name(&self, name: Option<String>) {
        *write(&self.server_name) = name;
    }

    pub fn set_received_handler<F>(&self, handler: F)
    where
        F: Fn(&Arc<Channel>, &Frame) + Send + Sync + 'static,
    {
        write(&self.handlers).received = ReceivedHandler::User(Arc::new(handler));
    }

    pub(crate) fn set_received(&self, received: ReceivedHandler) {
        write(&self.handlers).received = received;
    }

    pub fn received_handler(&self) -> ReceivedHandler {
        read(&self.handlers).received.clone()
    }

    /// Decides whether a peer close request is accepted.
    pub fn set_close_handler<F>(&self, handler: F)
    where
        F: Fn(&Arc<Channel>) -> bool + Send + Sync + 'static,
    {
        write(&self.handlers).close = Some(Arc::new(handler));
    }

    /// Called once the channel is detached from its connection.
    pub fn set_closed_handler<F>(&self, handler: F)
    where
        F: Fn(&Arc<Channel>) + Send + Sync + 'static,
    {
        write(&self.handlers).closed = Some(Arc::new(handler));
    }

    /// Receives peer close requests to be answered later through
    /// [`notify_close`](Self::notify_close). Takes precedence over the
    /// close handler.
    pub fn set_close_notify_handler<F>(&self, handler: F)
    where
        F: Fn(&Arc<Channel>, u32) + Send + Sync + 'static,
    {
        write(&self.handlers).close_notify = Some(Arc::new(handler));
    }

    pub fn set_frame_size_handler(&self, handler: Option<Arc<dyn FrameSizeHandler>>) {
        *write(&self.frame_size) = handler;
    }

    /// Piggybacked start reply, taken at most once.
    pub fn take_piggyback(&self) -> Option<Frame> {
        lock(&self.piggyback).take()
    }

    pub fn has_piggyback(&self) -> bool {
        lock(&self.piggyback).is_some()
    }

    pub(crate) fn set_piggyback(&self, frame: Frame) {
        *lock(&self.piggyback) = Some(frame);
    }

    pub(crate) fn defer_start(&self, start: DeferredStart) {
        *lock(&self.deferred_start) = Some(start);
    }

    pub(crate) fn take_deferred_start(&self) -> Option<DeferredStart> {
        lock(&self.deferred_start).take()
    }

    /// Send a MSG. Returns its message number.
    pub fn send_msg(&self, payload: impl AsRef<[u8]>) -> Result<u32> {
        self.send_message(payload.as_ref(), None)
    }

    /// Send a MSG whose RPY or ERR is handed to `wait` instead of the
    /// receive handler. Collect it with [`wait_reply`](Self::wait_reply).
    pub fn send_msg_and_wait(&self, payload: impl AsRef<[u8]>, wait: &Arc<WaitReply>) -> Result<u32> {
        self.send_message(payload.as_ref(), Some(wait))
    }

    fn send_message(&self, body: &[u8], wait: Option<&Arc<WaitReply>>) -> Result<u32> {
        if !self.is_opened() {
            return Err(ChannelError::NotOpened(self.number));
        }
        if self.number != ADMIN_CHANNEL && self.is_being_closed() {
            return Err(ChannelError::BeingClosed(self.number));
        }
        self.live_connection()?;

        let payload = read(&self.mime).encapsulate(body);

        let mut send = lock(&self.send);
        let msgno = self.next_msgno_out.load(Ordering::Acquire);
        if msgno > MAX_MSG_NO {
            warn!(channel = self.number, "message numbers exhausted");
            return Err(ChannelError::MsgNoExhausted(self.number));
        }
        if let Some(wait) = wait {
            wait.set_msgno(msgno);
            self.waiters.register(Arc::clone(wait));
        }

        let seqno = send.next_seqno;
        send.next_seqno = advance(seqno, payload.len());
        self.next_msgno_out.store(msgno + 1, Ordering::Release);
        debug!(
            channel = self.number,
            msgno,
            seqno,
            size = payload.len(),
            "MSG queued"
        );

        let data = SequencerData::new(FrameType::Msg, self.number, msgno, 0, seqno, payload);
        let queued = self.queue_outgoing(data);
        drop(send);

        if let Err(err) = queued {
            if let Some(wait) = wait {
                self.waiters.cancel(wait);
            }
            return Err(err);
        }
        Ok(msgno)
    }

    /// Positive reply to `msgno`.
    pub fn send_rpy(&self, msgno: u32, payload: impl AsRef<[u8]>) -> Result<()> {
        self.send_reply(FrameType::Rpy, msgno, payload.as_ref())
    }

    /// Negative reply to `msgno`.
    pub fn send_err(&self, msgno: u32, payload: impl AsRef<[u8]>) -> Result<()> {
        self.send_reply(FrameType::Err, msgno, payload.as_ref())
    }

    /// One answer of a one-to-many reply to `msgno`.
    pub fn send_ans(&self, msgno: u32, payload: impl AsRef<[u8]>) -> Result<()> {
        self.send_reply(FrameType::Ans, msgno, payload.as_ref())
    }

    /// Terminate the ANS series answering `msgno` with a NUL frame.
    pub fn finalize_ans(&self, msgno: u32) -> Result<()> {
        self.send_reply(FrameType::Nul, msgno, &[])
    }

    fn send_reply(&self, kind: FrameType, msgno: u32, body: &[u8]) -> Result<()> {
        self.live_connection()?;

        let payload = match kind {
            FrameType::Nul => Bytes::new(),
            _ => read(&self.mime).encapsulate(body),
        };

        let mut send = lock(&self.send);
        if msgno < send.next_reply || send.stored.has_final(msgno) {
            warn!(channel = self.number, msgno, kind = %kind, "message already replied");
            return Err(ChannelError::AlreadyReplied {
                channel: self.number,
                msgno,
            });
        }

        if msgno != send.next_reply {
            debug!(
                channel = self.number,
                msgno,
                kind = %kind,
                next = send.next_reply,
                "reply stored until earlier messages are answered"
            );
            send.stored.park(PendingReply {
                kind,
                msgno,
                payload,
            });
            return Ok(());
        }

        self.transmit_reply(&mut send, kind, msgno, payload)?;
        loop {
            let next = send.next_reply;
            let Some(reply) = send.stored.take_next(next) else {
                break;
            };
            debug!(channel = self.number, msgno = reply.msgno, "stored reply released");
            self.transmit_reply(&mut send, reply.kind, reply.msgno, reply.payload)?;
        }
        Ok(())
    }

    fn transmit_reply(
        &self,
        send: &mut SendState,
        kind: FrameType,
        msgno: u32,
        payload: Bytes,
    ) -> Result<()> {
        let ansno = match kind {
            FrameType::Ans => {
                let ansno = send.next_ansno;
                send.next_ansno = ansno.wrapping_add(1);
                ansno
            }
            FrameType::Nul => {
                send.next_ansno = 0;
                0
            }
            _ => 0,
        };
        let seqno = send.next_seqno;
        send.next_seqno = advance(seqno, payload.len());
        if kind.completes_reply() {
            send.next_reply = send.next_reply.wrapping_add(1);
        }
        debug!(channel = self.number, msgno, kind = %kind, seqno, "reply queued");
        self.queue_outgoing(SequencerData::new(kind, self.number, msgno, ansno, seqno, payload))
    }

    /// Block until the reply registered in `wait` arrives, for at most the
    /// configured reply timeout.
    pub fn wait_reply(&self, wait: &Arc<WaitReply>) -> Result<Frame> {
        self.wait_reply_timeout(wait, self.context.config().reply_timeout)
    }

    /// Block until the reply registered in `wait` arrives. Fails early when
    /// the connection dies.
    pub fn wait_reply_timeout(&self, wait: &Arc<WaitReply>, timeout: Duration) -> Result<Frame> {
        let slice = self.context.config().close_poll_interval;
        let deadline = Instant::now() + timeout;
        self.reply_processed.store(false, Ordering::Release);

        let result = loop {
            let now = Instant::now();
            if now >= deadline {
                warn!(channel = self.number, msgno = ?wait.msgno(), ?timeout, "reply timed out");
                break Err(ChannelError::Timeout(timeout));
            }
            if let Some(frame) = wait.pop_timeout(slice.min(deadline - now)) {
                break Ok(frame);
            }
            if self.live_connection().is_err() {
                break Err(ChannelError::NotConnected);
            }
        };

        let result = match result {
            Err(err) if !self.waiters.cancel(wait) => match wait.pop_timeout(Duration::ZERO) {
                Some(frame) => {
                    debug!(
                        channel = self.number,
                        msgno = frame.msgno,
                        "reply arrived as the wait ended"
                    );
                    Ok(frame)
                }
                None => Err(err),
            },
            other => other,
        };
        self.reply_processed.store(true, Ordering::Release);
        result
    }

    /// Process one frame read from the transport.
    ///
    /// Checks sequence continuity and the advertised window, announces a
    /// new window when due, joins continuation frames and hands the result
    /// to a waiter or to the receive handler. Violations drop the
    /// connection.
    pub fn deliver_inbound_frame(self: &Arc<Self>, mut frame: Frame) -> Result<()> {
        let connection = self.connection().ok_or(ChannelError::NotConnected)?;

        let mut inbound = lock(&self.inbound);
        if frame.seqno != inbound.next_seqno {
            return Err(self.violation(
                connection.as_ref(),
                format!(
                    "channel {} expected seqno {} but received {}",
                    self.number, inbound.next_seqno, frame
                ),
            ));
        }
        if !lock(&self.flow).admits(frame.seqno, frame.size()) {
            return Err(self.violation(
                connection.as_ref(),
                format!("channel {} frame {} overruns the advertised window", self.number, frame),
            ));
        }

        let starts_message = !inbound.in_message;
        match frame.kind {
            FrameType::Msg if starts_message => {
                let expected = self.next_msgno_in.load(Ordering::Acquire);
                if frame.msgno != expected {
                    return Err(self.violation(
                        connection.as_ref(),
                        format!(
                            "channel {} expected msgno {} but received {}",
                            self.number, expected, frame
                        ),
                    ));
                }
            }
            FrameType::Msg => {}
            _ => {
                if frame.msgno >= self.next_msgno_out.load(Ordering::Acquire) {
                    return Err(self.violation(
                        connection.as_ref(),
                        format!("channel {} reply {} to a message never sent", self.number, frame),
                    ));
                }
            }
        }

        inbound.next_seqno = advance(frame.seqno, frame.size());
        inbound.in_message = frame.more;
        if !frame.more {
            match frame.kind {
                FrameType::Msg => {
                    self.next_msgno_in.fetch_add(1, Ordering::AcqRel);
                }
                FrameType::Rpy | FrameType::Err => {
                    self.next_reply_in.fetch_add(1, Ordering::AcqRel);
                }
                FrameType::Ans => inbound.answers += 1,
                FrameType::Nul => {
                    frame.ansno = inbound.answers;
                    inbound.answers = 0;
                    self.next_reply_in.fetch_add(1, Ordering::AcqRel);
                }
            }
        }

        let admin_closing = self.number == ADMIN_CHANNEL && connection.is_being_closed();
        let announce = lock(&self.flow).update_incoming(&frame, admin_closing);
        if let Some((ackno, window)) = announce {
            debug!(channel = self.number, ackno, window, "announcing window");
            connection.transmit_seq(SeqFrame::new(self.number, ackno, window))?;
        }

        let complete = self.complete_flag();
        let ready = if complete {
            match inbound.fragments.push(frame) {
                Ok(ready) => ready,
                Err(err @ ReassemblyError::Mismatch { .. }) => {
                    return Err(self.violation(connection.as_ref(), err.to_string()));
                }
                Err(err) => {
                    error!(channel = self.number, error = %err, "fragment buffer inconsistent");
                    inbound.fragments.clear();
                    return Err(err.into());
                }
            }
        } else {
            Some(frame)
        };
        drop(inbound);

        let Some(mut frame) = ready else {
            return Ok(());
        };
        if complete || starts_message {
            if let Some((mime, body)) = MimeHeaders::split(&frame.payload) {
                frame.mime = mime;
                frame.payload = body;
            }
        }

        self.invoke_received_handler(frame);
        Ok(())
    }

    /// Hand a complete frame to its consumer: a blocked waiter for RPY and
    /// ERR frames, the receive handler on a pool worker otherwise.
    fn invoke_received_handler(self: &Arc<Self>, frame: Frame) {
        let frame = if matches!(frame.kind, FrameType::Rpy | FrameType::Err) && !frame.more {
            let msgno = frame.msgno;
            match self.waiters.deliver(frame) {
                Ok(()) => {
                    debug!(channel = self.number, msgno, "reply handed to waiter");
                    self.signal_on_close_blocked();
                    if self.is_serialized() {
                        let channel = Arc::clone(self);
                        self.context.submit(move || {
                            channel
                                .serializer
                                .skip_reply(msgno, &mut |frame| channel.call_received(frame));
                        });
                    }
                    return;
                }
                Err(frame) => frame,
            }
        } else {
            frame
        };

        let channel = Arc::clone(self);
        if !self.context.submit(move || channel.run_received_handler(frame)) {
            debug!(channel = self.number, "worker pool stopping, frame dropped");
        }
    }

    fn run_received_handler(self: &Arc<Self>, frame: Frame) {
        let Some(connection) = self.connection().filter(|connection| connection.is_ok()) else {
            debug!(channel = self.number, "connection gone before delivery");
            return;
        };

        if self.is_serialized() {
            self.serializer
                .deliver(frame, &mut |frame| self.call_received(frame));
        } else {
            self.call_received(&frame);
        }

        if connection.channel_exists(self.number) {
            self.signal_on_close_blocked();
        }
    }

    /// Invoke the receive handler for `frame` on the calling thread.
    pub(crate) fn call_received(self: &Arc<Self>, frame: &Frame) {
        match self.received_handler() {
            ReceivedHandler::Admin => control::handle_admin_frame(self, frame),
            ReceivedHandler::User(handler) => handler(self, frame),
            ReceivedHandler::ProfileDefault => {
                match self.context.profiles().received_handler(&self.profile) {
                    Some(handler) => handler(self, frame),
                    None => warn!(
                        channel = self.number,
                        frame = %frame,
                        "no receive handler, frame dropped"
                    ),
                }
            }
        }
    }

    /// Apply a SEQ frame from the peer and resume stalled output.
    pub fn update_remote_incoming_buffer(&self, seq: &SeqFrame) -> Result<()> {
        let connection = self.connection().ok_or(ChannelError::NotConnected)?;
        let updated = lock(&self.flow).update_remote(seq);
        match updated {
            Ok(max_seq_no) => {
                debug!(channel = self.number, seq = %seq, max_seq_no, "remote window updated");
                self.resume_stalled()
            }
            Err(err) => Err(self.violation(connection.as_ref(), err.to_string())),
        }
    }

    /// Account for a received frame in the local window. Returns the
    /// `(ackno, window)` to announce, if any.
    pub fn update_incoming_buffer(&self, frame: &Frame) -> Option<(u32, u32)> {
        let admin_closing = self.number == ADMIN_CHANNEL
            && self
                .connection()
                .is_some_and(|connection| connection.is_being_closed());
        lock(&self.flow).update_incoming(frame, admin_closing)
    }

    /// Drop the connection over a protocol violation.
    pub(crate) fn violation(&self, connection: &dyn Connection, reason: String) -> ChannelError {
        warn!(
            connection = connection.id(),
            channel = self.number,
            reason = %reason,
            "protocol violation, dropping connection"
        );
        connection.set_not_connected(&reason);
        ChannelError::ProtocolViolation(reason)
    }

    /// Queue that receives a unit once the reply to `msgno` is written.
    /// Install it before sending the reply.
    pub fn install_waiter(&self, msgno: u32) -> Arc<BlockingQueue<()>> {
        let queue = Arc::new(BlockingQueue::new());
        lock(&self.flush_waiters).insert(msgno, Arc::clone(&queue));
        queue
    }

    /// Block until `flushed` is signalled. Returns false on timeout.
    pub fn wait_until_sent(&self, flushed: &BlockingQueue<()>, timeout: Duration) -> bool {
        flushed.pop_timeout(timeout).is_some()
    }

    fn mark_reply_written(&self, msgno: u32) {
        {
            let mut written = lock(&self.written);
            *written = written.wrapping_add(1);
        }
        self.flushed.notify_all();

        let waiter = lock(&self.flush_waiters).remove(&msgno);
        if let Some(waiter) = waiter {
            waiter.push(());
        }
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("number", &self.number)
            .field("profile", &self.profile)
            .field("opened", &self.is_opened())
            .field("being_closed", &self.is_being_closed())
            .finish()
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        debug!(channel = self.number, "channel released");
    }
}
