//! In-memory connections for driving beepcore channels in tests.
//!
//! [`LoopbackConnection`] implements [`Connection`] without a socket. A
//! standalone connection only records what its channels transmit, so a test
//! can inject frames with [`Channel::deliver_inbound_frame`] and inspect the
//! output. [`connect_pair`] wires two connections back to back: a pump
//! thread per direction hands every transmitted frame to the peer through
//! [`dispatch_inbound`], in order, as a transport reader would. Both ends
//! exchange greetings before [`connect_pair`] returns.
//!
//! ```ignore
//! let pair = connect_pair(&context(), &context());
//! let channel = open_channel(&pair.initiator.handle(), &ctx, ChannelRequest::new(ECHO))?;
//! ```

mod logging;

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use beepcore_channel::{
    dispatch_inbound, greeting_message, send_greeting, Channel, ChannelConfig, ChannelError,
    Connection, Context, Inbound, Result, GREETING_MSGNO,
};
use beepcore_frame::{Frame, FrameType, MimeHeaders, SeqFrame, ADMIN_CHANNEL};
use beepcore_pool::sync::{lock, read, write};
use beepcore_pool::{BlockingQueue, PoolConfig};
use rstest::fixture;
use tracing::debug;

pub use logging::init_tracing;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

enum Outbound {
    Item(Inbound),
    Shutdown,
}

/// A [`Connection`] kept entirely in memory.
pub struct LoopbackConnection {
    id: u64,
    initiator: bool,
    channels: RwLock<HashMap<u32, Arc<Channel>>>,
    connected: AtomicBool,
    closing: AtomicBool,
    next_number: Mutex<u32>,
    outbound: Option<Arc<BlockingQueue<Outbound>>>,
    sent: Mutex<Vec<Inbound>>,
    errors: Mutex<Vec<(u16, String)>>,
    reason: Mutex<Option<String>>,
    server_name: Mutex<Option<String>>,
    advertised: RwLock<Option<Vec<String>>>,
    greeted: AtomicBool,
    filtered: RwLock<Vec<String>>,
}

impl LoopbackConnection {
    fn build(
        context: &Arc<Context>,
        initiator: bool,
        outbound: Option<Arc<BlockingQueue<Outbound>>>,
    ) -> Arc<Self> {
        let connection = Arc::new(Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            initiator,
            channels: RwLock::new(HashMap::new()),
            connected: AtomicBool::new(true),
            closing: AtomicBool::new(false),
            next_number: Mutex::new(if initiator { 1 } else { 2 }),
            outbound,
            sent: Mutex::new(Vec::new()),
            errors: Mutex::new(Vec::new()),
            reason: Mutex::new(None),
            server_name: Mutex::new(None),
            advertised: RwLock::new(None),
            greeted: AtomicBool::new(false),
            filtered: RwLock::new(Vec::new()),
        });
        let handle = connection.handle();
        connection.add_channel(Channel::admin(&handle, context));
        connection
    }

    /// A connection without a peer: transmitted frames are only recorded.
    pub fn standalone(context: &Arc<Context>) -> Arc<Self> {
        Self::build(context, true, None)
    }

    /// A standalone connection past the greeting exchange: ours was sent
    /// and an empty one was received. The recorded output starts empty.
    pub fn greeted(context: &Arc<Context>) -> Arc<Self> {
        let connection = Self::standalone(context);
        let Some(admin) = connection.admin() else {
            panic!("standalone connection lost channel 0");
        };
        if let Err(err) = send_greeting(&admin) {
            panic!("failed to send greeting: {err}");
        }
        let body = greeting_message(&[]);
        let greeting = Frame::new(
            FrameType::Rpy,
            ADMIN_CHANNEL,
            GREETING_MSGNO,
            MimeHeaders::admin().encapsulate(body.as_bytes()),
        );
        if let Err(err) = admin.deliver_inbound_frame(greeting) {
            panic!("failed to receive greeting: {err}");
        }
        connection.clear_sent();
        connection
    }

    /// The connection as the channel core sees it.
    pub fn handle(self: &Arc<Self>) -> Arc<dyn Connection> {
        Arc::clone(self) as Arc<dyn Connection>
    }

    /// The remote greeting has been processed.
    pub fn is_greeted(&self) -> bool {
        self.greeted.load(Ordering::Acquire)
    }

    pub fn is_initiator(&self) -> bool {
        self.initiator
    }

    /// Channel 0.
    pub fn admin(&self) -> Option<Arc<Channel>> {
        self.channel(ADMIN_CHANNEL)
    }

    /// Everything transmitted so far, frames and SEQ announcements.
    pub fn sent(&self) -> Vec<Inbound> {
        lock(&self.sent).clone()
    }

    /// Data frames transmitted on `channel`.
    pub fn sent_frames(&self, channel: u32) -> Vec<Frame> {
        lock(&self.sent)
            .iter()
            .filter_map(|item| match item {
                Inbound::Frame(frame) if frame.channel == channel => Some(frame.clone()),
                _ => None,
            })
            .collect()
    }

    /// SEQ frames transmitted for `channel`.
    pub fn sent_seqs(&self, channel: u32) -> Vec<SeqFrame> {
        lock(&self.sent)
            .iter()
            .filter_map(|item| match item {
                Inbound::Seq(seq) if seq.channel == channel => Some(*seq),
                _ => None,
            })
            .collect()
    }

    pub fn clear_sent(&self) {
        lock(&self.sent).clear();
    }

    /// Reason given when the connection was dropped.
    pub fn reason(&self) -> Option<String> {
        lock(&self.reason).clone()
    }

    /// `<error>` replies received while starting channels.
    pub fn channel_errors(&self) -> Vec<(u16, String)> {
        lock(&self.errors).clone()
    }

    /// Profiles the remote greeting advertised. `None` accepts any.
    pub fn set_advertised_profiles(&self, uris: Option<Vec<String>>) {
        *write(&self.advertised) = uris;
    }

    /// Hide `uri` from the peer's start requests.
    pub fn filter_profile(&self, uri: &str) {
        write(&self.filtered).push(uri.to_string());
    }

    pub fn channel_numbers(&self) -> Vec<u32> {
        let mut numbers: Vec<u32> = read(&self.channels).keys().copied().collect();
        numbers.sort_unstable();
        numbers
    }

    fn record(&self, item: Inbound) -> Result<()> {
        if !self.is_ok() {
            return Err(ChannelError::NotConnected);
        }
        lock(&self.sent).push(item.clone());
        if let Some(outbound) = &self.outbound {
            outbound.push(Outbound::Item(item));
        }
        Ok(())
    }
}

impl Connection for LoopbackConnection {
    fn id(&self) -> u64 {
        self.id
    }

    fn is_ok(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn set_not_connected(&self, reason: &str) {
        if !self.connected.swap(false, Ordering::AcqRel) {
            return;
        }
        debug!(connection = self.id, reason, "connection dropped");
        *lock(&self.reason) = Some(reason.to_string());
        if let Some(outbound) = &self.outbound {
            outbound.push(Outbound::Shutdown);
        }
    }

    fn is_being_closed(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    fn set_being_closed(&self, closing: bool) {
        self.closing.store(closing, Ordering::Release);
    }

    fn transmit(&self, frame: Frame) -> Result<()> {
        self.record(Inbound::Frame(frame))
    }

    fn transmit_seq(&self, seq: SeqFrame) -> Result<()> {
        self.record(Inbound::Seq(seq))
    }

    fn channel(&self, number: u32) -> Option<Arc<Channel>> {
        read(&self.channels).get(&number).cloned()
    }

    fn add_channel(&self, channel: Arc<Channel>) {
        write(&self.channels).insert(channel.number(), channel);
    }

    fn remove_channel(&self, number: u32) -> Option<Arc<Channel>> {
        write(&self.channels).remove(&number)
    }

    fn next_channel_number(&self) -> Option<u32> {
        let mut next = lock(&self.next_number);
        let channels = read(&self.channels);
        while channels.contains_key(&*next) {
            *next = next.checked_add(2)?;
        }
        let number = *next;
        *next = next.checked_add(2)?;
        Some(number)
    }

    fn set_server_name(&self, name: &str) {
        *lock(&self.server_name) = Some(name.to_string());
    }

    fn server_name(&self) -> Option<String> {
        lock(&self.server_name).clone()
    }

    fn set_remote_profiles(&self, uris: Vec<String>) {
        *write(&self.advertised) = Some(uris);
        self.greeted.store(true, Ordering::Release);
    }

    fn is_profile_supported(&self, uri: &str) -> bool {
        read(&self.advertised)
            .as_ref()
            .is_none_or(|uris| uris.iter().any(|known| known == uri))
    }

    fn is_profile_filtered(&self, _number: u32, uri: &str, _server_name: Option<&str>) -> bool {
        read(&self.filtered).iter().any(|filtered| filtered == uri)
    }

    fn push_channel_error(&self, code: u16, message: &str) {
        lock(&self.errors).push((code, message.to_string()));
    }
}

impl fmt::Debug for LoopbackConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopbackConnection")
            .field("id", &self.id)
            .field("initiator", &self.initiator)
            .field("connected", &self.is_ok())
            .field("channels", &self.channel_numbers())
            .finish()
    }
}

/// Two loopback connections wired to each other.
pub struct LoopbackPair {
    pub initiator: Arc<LoopbackConnection>,
    pub listener: Arc<LoopbackConnection>,
    queues: Vec<Arc<BlockingQueue<Outbound>>>,
    pumps: Vec<JoinHandle<()>>,
}

impl LoopbackPair {
    /// Drop both ends, as a transport failure would.
    pub fn disconnect(&self) {
        self.initiator.set_not_connected("loopback disconnected");
        self.listener.set_not_connected("loopback disconnected");
    }
}

impl fmt::Debug for LoopbackPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopbackPair")
            .field("initiator", &self.initiator)
            .field("listener", &self.listener)
            .finish()
    }
}

impl Drop for LoopbackPair {
    fn drop(&mut self) {
        self.disconnect();
        for queue in &self.queues {
            queue.push(Outbound::Shutdown);
        }
        for pump in self.pumps.drain(..) {
            let _ = pump.join();
        }
    }
}

/// Connect an initiator using `initiator_context` to a listener using
/// `listener_context`. Both sides start with channel 0 opened and the
/// greetings exchanged. The greeting frames are not kept in the record.
pub fn connect_pair(initiator_context: &Arc<Context>, listener_context: &Arc<Context>) -> LoopbackPair {
    let to_listener = Arc::new(BlockingQueue::new());
    let to_initiator = Arc::new(BlockingQueue::new());
    let initiator = LoopbackConnection::build(initiator_context, true, Some(Arc::clone(&to_listener)));
    let listener = LoopbackConnection::build(listener_context, false, Some(Arc::clone(&to_initiator)));

    let pumps = vec![
        spawn_pump("beepcore-loopback-i2l", Arc::clone(&to_listener), Arc::clone(&listener)),
        spawn_pump("beepcore-loopback-l2i", Arc::clone(&to_initiator), Arc::clone(&initiator)),
    ];

    let pair = LoopbackPair {
        initiator,
        listener,
        queues: vec![to_listener, to_initiator],
        pumps,
    };
    for side in [&pair.initiator, &pair.listener] {
        let sent = side.admin().map(|admin| send_greeting(&admin));
        if let Some(Err(err)) = sent {
            panic!("failed to send greeting: {err}");
        }
    }
    if !eventually(Duration::from_secs(5), || {
        pair.initiator.is_greeted() && pair.listener.is_greeted()
    }) {
        panic!("loopback greetings were not exchanged");
    }
    pair.initiator.clear_sent();
    pair.listener.clear_sent();
    pair
}

fn spawn_pump(
    name: &str,
    queue: Arc<BlockingQueue<Outbound>>,
    peer: Arc<LoopbackConnection>,
) -> JoinHandle<()> {
    let run = move || {
        let handle = peer.handle();
        loop {
            match queue.pop() {
                Outbound::Item(item) => {
                    if let Err(err) = dispatch_inbound(&handle, item) {
                        debug!(connection = peer.id, error = %err, "loopback delivery failed");
                    }
                }
                Outbound::Shutdown => {
                    peer.set_not_connected("connection closed by remote peer");
                    return;
                }
            }
        }
    };
    match std::thread::Builder::new().name(name.to_string()).spawn(run) {
        Ok(handle) => handle,
        Err(err) => panic!("failed to spawn loopback pump: {err}"),
    }
}

/// Configuration with short waits, suited to tests.
pub fn test_config() -> ChannelConfig {
    ChannelConfig {
        reply_timeout: Duration::from_secs(5),
        close_poll_interval: Duration::from_millis(10),
        pool: PoolConfig::default().with_threads(3),
        ..ChannelConfig::default()
    }
}

/// A context built from [`test_config`].
#[fixture]
pub fn context() -> Arc<Context> {
    init_tracing();
    match Context::new(test_config()) {
        Ok(context) => context,
        Err(err) => panic!("failed to build test context: {err}"),
    }
}

/// Poll `condition` until it holds or `timeout` passes.
pub fn eventually(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}
