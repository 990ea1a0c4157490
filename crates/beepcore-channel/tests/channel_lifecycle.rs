use std::sync::{Arc, Mutex};
use std::time::Duration;

use beepcore_channel::{
    open_channel, open_channel_with, Channel, ChannelConfig, ChannelError, ChannelRequest,
    Connection, Context, ProfileEncoding, ProfileHandlers, ReplyQueue, StartDecision, WaitReply,
};
use beepcore_frame::{Frame, FrameType};
use beepcore_pool::BlockingQueue;
use beepcore_testing::{connect_pair, context, eventually, test_config, LoopbackPair};

const ECHO: &str = "http://beepcore.dev/profiles/echo";
const WAIT: Duration = Duration::from_secs(5);

fn echo(channel: &Arc<Channel>, frame: &Frame) {
    if frame.kind == FrameType::Msg {
        channel
            .send_rpy(frame.msgno, &frame.payload)
            .expect("echo reply should be accepted");
    }
}

fn echo_pair() -> (LoopbackPair, Arc<Context>) {
    let client = context();
    let server = context();
    server
        .profiles()
        .register(ECHO, ProfileHandlers::new().on_frame(echo));
    (connect_pair(&client, &server), client)
}

#[test]
fn open_send_and_wait_for_echo() {
    let (pair, client) = echo_pair();
    let channel = open_channel(&pair.initiator.handle(), &client, ChannelRequest::new(ECHO))
        .expect("echo channel should open");

    assert_eq!(channel.number(), 1);
    assert!(channel.is_opened());
    assert!(eventually(WAIT, || pair
        .listener
        .channel(1)
        .is_some_and(|peer| peer.is_opened())));

    let wait = WaitReply::new();
    let msgno = channel
        .send_msg_and_wait("hello", &wait)
        .expect("message should be sent");
    assert_eq!(msgno, 0);

    let reply = channel.wait_reply(&wait).expect("echo should answer");
    assert_eq!(reply.kind, FrameType::Rpy);
    assert_eq!(reply.msgno, 0);
    assert_eq!(&reply.payload[..], b"hello");
    assert!(channel.is_up_to_date());
    assert!(channel.is_ready());
    assert_eq!(channel.status().waiting_replies, 0);
}

#[test]
fn greetings_precede_start_and_session_close() {
    let (pair, client) = echo_pair();
    for side in [&pair.initiator, &pair.listener] {
        let admin = side.admin().expect("channel 0 should exist");
        let status = admin.status();
        assert_eq!((status.next_reply_in, status.replies_written), (1, 1));
        assert_eq!(status.next_msgno_out, 1);
        assert!(admin.is_up_to_date());
    }
    // the listener advertised the echo profile, the client nothing
    assert!(pair.initiator.is_profile_supported(ECHO));
    assert!(!pair.listener.is_profile_supported(ECHO));

    let channel = open_channel(&pair.initiator.handle(), &client, ChannelRequest::new(ECHO))
        .expect("channel should open after the greetings");
    let start = pair.initiator.sent_frames(0);
    assert_eq!((start[0].kind, start[0].msgno), (FrameType::Msg, 1));
    let admin = pair.initiator.admin().expect("channel 0 should exist");
    assert!(eventually(WAIT, || admin.is_up_to_date()));
    let peer_admin = pair.listener.admin().expect("peer channel 0 should exist");
    assert!(eventually(WAIT, || peer_admin.status().replies_written == 2));

    channel.close().expect("channel close should be accepted");
    admin.close().expect("session close should be accepted");
    assert!(!pair.initiator.is_ok());
    assert!(eventually(WAIT, || !pair.listener.is_ok()));
}

#[test]
fn channel_numbers_follow_the_initiator_parity() {
    let (pair, client) = echo_pair();
    let first = open_channel(&pair.initiator.handle(), &client, ChannelRequest::new(ECHO))
        .expect("first channel should open");
    let second = open_channel(&pair.initiator.handle(), &client, ChannelRequest::new(ECHO))
        .expect("second channel should open");
    assert_eq!((first.number(), second.number()), (1, 3));

    let taken = open_channel(
        &pair.initiator.handle(),
        &client,
        ChannelRequest::new(ECHO).number(3),
    );
    assert!(matches!(taken, Err(ChannelError::ChannelExists(3))));
}

#[test]
fn unknown_profile_is_refused_with_554() {
    let (pair, client) = echo_pair();
    let result = open_channel(
        &pair.initiator.handle(),
        &client,
        ChannelRequest::new("urn:beepcore:missing"),
    );

    match result {
        Err(ChannelError::Denied { code, .. }) => assert_eq!(code, 554),
        other => panic!("expected denial, got {other:?}"),
    }
    assert!(!pair.initiator.channel_exists(1));
    assert_eq!(pair.initiator.channel_errors().len(), 1);
}

#[test]
fn start_handler_denial_reaches_the_requester() {
    let client = context();
    let server = context();
    server.profiles().register(
        ECHO,
        ProfileHandlers::new().on_start(|_| StartDecision::deny()),
    );
    let pair = connect_pair(&client, &server);

    let result = open_channel(&pair.initiator.handle(), &client, ChannelRequest::new(ECHO));
    match result {
        Err(ChannelError::Denied { code, message }) => {
            assert_eq!(code, 421);
            assert!(message.contains("start handler denied"));
        }
        other => panic!("expected denial, got {other:?}"),
    }
    assert!(eventually(WAIT, || !pair.listener.channel_exists(1)));
    assert_eq!(pair.initiator.channel_errors()[0].0, 421);
}

#[test]
fn piggyback_travels_both_ways() {
    let client = context();
    let server = context();
    let seen = Arc::new(Mutex::new(None));
    let recorded = Arc::clone(&seen);
    server.profiles().register(
        ECHO,
        ProfileHandlers::new().on_start(move |request| {
            *recorded.lock().unwrap() = request.content.map(str::to_string);
            StartDecision::accept_with("<ready />")
        }),
    );
    let pair = connect_pair(&client, &server);

    let queue = ReplyQueue::new();
    let handler = queue.handler();
    let request = ChannelRequest::new(ECHO)
        .content("<hello />", ProfileEncoding::None)
        .on_frame(move |channel, frame| handler(channel, frame));
    let channel = open_channel(&pair.initiator.handle(), &client, request)
        .expect("channel should open");

    assert_eq!(seen.lock().unwrap().as_deref(), Some("<hello />"));
    assert!(channel.has_piggyback());

    let piggyback = queue
        .get_reply(&channel, WAIT)
        .expect("piggyback should be delivered first");
    assert_eq!(piggyback.kind, FrameType::Rpy);
    assert_eq!(piggyback.msgno, 0);
    assert_eq!(&piggyback.payload[..], b"<ready />");
    assert!(!channel.has_piggyback());
    assert!(queue.get_reply(&channel, Duration::from_millis(20)).is_none());
}

#[test]
fn deferred_start_is_answered_later() {
    let client = context();
    let server = context();
    let pending: Arc<BlockingQueue<Arc<Channel>>> = Arc::new(BlockingQueue::new());
    let parked = Arc::clone(&pending);
    server.profiles().register(
        ECHO,
        ProfileHandlers::new().on_start(move |request| {
            parked.push(Arc::clone(request.channel));
            StartDecision::Defer
        }),
    );
    let pair = connect_pair(&client, &server);

    let created = Arc::new(BlockingQueue::new());
    let report = Arc::clone(&created);
    open_channel_with(
        &pair.initiator.handle(),
        &client,
        ChannelRequest::new(ECHO).server_name("beep.example.org"),
        move |result| report.push(result.map(|channel| channel.number())),
    );

    let server_channel = pending
        .pop_timeout(WAIT)
        .expect("start handler should run");
    assert!(!server_channel.is_opened());
    assert!(created.pop_timeout(Duration::from_millis(50)).is_none());

    server_channel
        .notify_start(StartDecision::accept())
        .expect("deferred start should be answered");
    let number = created
        .pop_timeout(WAIT)
        .expect("creation should be reported")
        .expect("channel should open");
    assert_eq!(number, 1);
    assert!(server_channel.is_opened());
    assert_eq!(server_channel.server_name().as_deref(), Some("beep.example.org"));
    assert_eq!(pair.listener.server_name().as_deref(), Some("beep.example.org"));

    assert!(matches!(
        server_channel.notify_start(StartDecision::accept()),
        Err(ChannelError::NoDeferredStart(1))
    ));
}

#[test]
fn unadvertised_profile_is_refused_locally() {
    let client = Context::new(ChannelConfig {
        enforce_profile_support: true,
        ..test_config()
    })
    .expect("context should build");
    let server = context();
    let pair = connect_pair(&client, &server);
    pair.initiator
        .set_advertised_profiles(Some(vec!["urn:beepcore:other".to_string()]));

    let result = open_channel(&pair.initiator.handle(), &client, ChannelRequest::new(ECHO));
    assert!(matches!(result, Err(ChannelError::ProfileNotSupported(_))));
    assert!(pair.initiator.sent().is_empty());
}

#[test]
fn serialized_channel_delivers_messages_in_order() {
    let client = context();
    let server = Context::new(ChannelConfig {
        serialize: true,
        ..test_config()
    })
    .expect("context should build");
    let order = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&order);
    server.profiles().register(
        ECHO,
        ProfileHandlers::new().on_frame(move |channel, frame| {
            seen.lock().unwrap().push(frame.msgno);
            echo(channel, frame);
        }),
    );
    let pair = connect_pair(&client, &server);
    let channel = open_channel(&pair.initiator.handle(), &client, ChannelRequest::new(ECHO))
        .expect("channel should open");

    for n in 0..40u32 {
        channel
            .send_msg(format!("message {n}"))
            .expect("message should be sent");
    }

    assert!(eventually(WAIT, || order.lock().unwrap().len() == 40));
    assert_eq!(*order.lock().unwrap(), (0..40).collect::<Vec<u32>>());
    assert!(eventually(WAIT, || channel.is_up_to_date()));
}

#[test]
fn reply_wait_times_out_and_unregisters() {
    let client = context();
    let server = context();
    server
        .profiles()
        .register(ECHO, ProfileHandlers::new().on_frame(|_, _| {}));
    let pair = connect_pair(&client, &server);
    let channel = open_channel(&pair.initiator.handle(), &client, ChannelRequest::new(ECHO))
        .expect("channel should open");

    let wait = WaitReply::new();
    channel
        .send_msg_and_wait("ignored", &wait)
        .expect("message should be sent");
    let result = channel.wait_reply_timeout(&wait, Duration::from_millis(50));

    assert!(matches!(result, Err(ChannelError::Timeout(_))));
    assert_eq!(channel.status().waiting_replies, 0);
    assert!(channel.is_reply_processed());
    assert!(!channel.is_up_to_date());
}

#[test]
fn sending_after_disconnect_fails() {
    let (pair, client) = echo_pair();
    let channel = open_channel(&pair.initiator.handle(), &client, ChannelRequest::new(ECHO))
        .expect("channel should open");

    pair.disconnect();
    assert!(matches!(channel.send_msg("late"), Err(ChannelError::NotConnected)));

    let wait = WaitReply::new();
    let result = channel.send_msg_and_wait("late", &wait);
    assert!(result.is_err());
    assert_eq!(channel.status().waiting_replies, 0);
}
