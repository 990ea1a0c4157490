use std::sync::Arc;
use std::time::Duration;

use beepcore_channel::{
    dispatch_inbound, open_channel, Channel, ChannelConfig, ChannelError, ChannelRequest,
    Connection, Context, FrameSizeHandler, Inbound, ProfileHandlers, WaitReply,
};
use beepcore_frame::{Frame, FrameType, MimeHeaders, SeqFrame, MAX_FRAME_SIZE};
use beepcore_testing::{connect_pair, context, eventually, test_config, LoopbackConnection};

const ECHO: &str = "http://beepcore.dev/profiles/echo";
const WAIT: Duration = Duration::from_secs(5);

fn echo(channel: &Arc<Channel>, frame: &Frame) {
    if frame.kind == FrameType::Msg {
        channel
            .send_rpy(frame.msgno, &frame.payload)
            .expect("echo reply should be accepted");
    }
}

fn standalone() -> (Arc<LoopbackConnection>, Arc<Channel>) {
    let connection = LoopbackConnection::standalone(&context());
    let admin = connection.admin().expect("channel 0 should exist");
    (connection, admin)
}

/// Channel 0 after both greetings, with nothing recorded yet.
fn greeted() -> (Arc<LoopbackConnection>, Arc<Channel>) {
    let connection = LoopbackConnection::greeted(&context());
    let admin = connection.admin().expect("channel 0 should exist");
    (connection, admin)
}

fn assert_dropped(connection: &LoopbackConnection, result: beepcore_channel::Result<()>) {
    assert!(
        matches!(result, Err(ChannelError::ProtocolViolation(_))),
        "{result:?}"
    );
    assert!(!connection.is_ok());
    assert!(connection.reason().is_some());
}

#[test]
fn seq_that_does_not_advance_the_window_drops_the_connection() {
    let (connection, _admin) = standalone();
    let result = dispatch_inbound(&connection.handle(), Inbound::Seq(SeqFrame::new(0, 0, 4096)));
    assert_dropped(&connection, result);
}

#[test]
fn sequence_gap_drops_the_connection() {
    let (connection, admin) = standalone();
    let frame = Frame::new(FrameType::Msg, 0, 1, "\r\n<ok />").with_seqno(10);
    assert_dropped(&connection, admin.deliver_inbound_frame(frame));
}

#[test]
fn out_of_order_message_number_drops_the_connection() {
    let (connection, admin) = standalone();
    let frame = Frame::new(FrameType::Msg, 0, 5, "\r\n<ok />").with_seqno(0);
    assert_dropped(&connection, admin.deliver_inbound_frame(frame));
}

#[test]
fn frame_beyond_the_advertised_window_drops_the_connection() {
    let (connection, admin) = standalone();
    let frame = Frame::new(FrameType::Msg, 0, 1, vec![b'x'; 5000]).with_seqno(0);
    assert_dropped(&connection, admin.deliver_inbound_frame(frame));
}

#[test]
fn reply_to_a_message_never_sent_drops_the_connection() {
    let (connection, admin) = standalone();
    let frame = Frame::new(FrameType::Rpy, 0, 1, "\r\n<ok />").with_seqno(0);
    assert_dropped(&connection, admin.deliver_inbound_frame(frame));
}

#[test]
fn output_stalls_until_the_peer_opens_the_window() {
    let (connection, admin) = standalone();
    let headers = MimeHeaders::admin().headers_size();

    admin.send_msg(vec![b'x'; 5000]).expect("message should be queued");
    let frames = connection.sent_frames(0);
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].payload.len(), 4096);
    assert!(frames[0].more);
    assert_eq!(admin.status().stalled, 1);
    assert!(admin.is_being_sending());

    // a later message queues behind the stalled one
    admin.send_msg(vec![b'y'; 10]).expect("message should be queued");
    assert_eq!(admin.status().stalled, 2);
    assert_eq!(connection.sent_frames(0).len(), 1);

    dispatch_inbound(&connection.handle(), Inbound::Seq(SeqFrame::new(0, 4096, 4096)))
        .expect("window update should be accepted");

    let frames = connection.sent_frames(0);
    assert_eq!(frames.len(), 3);
    assert_eq!(frames[1].msgno, 1);
    assert_eq!(frames[1].seqno, 4096);
    assert!(!frames[1].more);
    assert_eq!(frames[0].payload.len() + frames[1].payload.len(), headers + 5000);
    assert_eq!(frames[2].msgno, 2);
    assert_eq!(frames[2].seqno, 4096 + frames[1].payload.len() as u32);
    assert_eq!(frames[2].payload.len(), headers + 10);
    assert_eq!(admin.status().stalled, 0);
    assert!(!admin.is_being_sending());
}

#[test]
fn replies_leave_in_message_order() {
    let (connection, admin) = greeted();
    assert_eq!(admin.status().replies_written, 1);

    admin.send_err(2, "<error code='550'>no</error>").expect("reply should be parked");
    assert!(connection.sent_frames(0).is_empty());
    assert_eq!(admin.status().stored_replies, 1);

    admin.send_rpy(1, "<ok />").expect("reply should be sent");
    let kinds: Vec<(FrameType, u32)> = connection
        .sent_frames(0)
        .iter()
        .map(|frame| (frame.kind, frame.msgno))
        .collect();
    assert_eq!(kinds, vec![(FrameType::Rpy, 1), (FrameType::Err, 2)]);
    assert_eq!(admin.status().stored_replies, 0);
    assert_eq!(admin.status().replies_written, 3);

    for msgno in [1, 2] {
        assert!(matches!(
            admin.send_rpy(msgno, "<ok />"),
            Err(ChannelError::AlreadyReplied { channel: 0, .. })
        ));
    }
}

#[test]
fn answers_are_numbered_and_terminated_by_nul() {
    let (connection, admin) = greeted();

    admin.send_ans(1, "first").expect("answer should be sent");
    admin.send_ans(1, "second").expect("answer should be sent");
    admin.finalize_ans(1).expect("series should be terminated");

    let frames = connection.sent_frames(0);
    let numbered: Vec<(FrameType, u32)> = frames.iter().map(|frame| (frame.kind, frame.ansno)).collect();
    assert_eq!(
        numbered,
        vec![(FrameType::Ans, 0), (FrameType::Ans, 1), (FrameType::Nul, 0)]
    );
    assert!(frames[2].payload.is_empty());
    assert!(matches!(
        admin.finalize_ans(1),
        Err(ChannelError::AlreadyReplied { .. })
    ));
}

#[test]
fn inbound_nul_completes_the_reply_and_announces_the_window() {
    let (connection, admin) = greeted();
    let base = admin.status().next_seqno_in;
    let msgno = admin.send_msg("<query />").expect("message should be sent");
    assert!(!admin.is_up_to_date());

    let answers = [
        Frame::new(FrameType::Ans, 0, msgno, "\r\na").with_seqno(base).with_ansno(0),
        Frame::new(FrameType::Ans, 0, msgno, "\r\nb").with_seqno(base + 3).with_ansno(1),
    ];
    for frame in answers {
        admin.deliver_inbound_frame(frame).expect("answer should be accepted");
    }
    assert!(!admin.is_up_to_date());
    assert!(connection.sent_seqs(0).is_empty());

    let nul = Frame::new(FrameType::Nul, 0, msgno, Vec::new()).with_seqno(base + 6);
    admin.deliver_inbound_frame(nul).expect("NUL should be accepted");

    assert!(admin.is_up_to_date());
    assert_eq!(connection.sent_seqs(0), vec![SeqFrame::new(0, base + 6, 4096)]);
    assert_eq!(admin.status().max_seq_no_accepted, base + 6 + 4095);
    assert!(connection.is_ok());
}

#[test]
fn large_message_crosses_the_window_in_several_frames() {
    let client = context();
    let server = context();
    server
        .profiles()
        .register(ECHO, ProfileHandlers::new().on_frame(echo));
    let pair = connect_pair(&client, &server);
    let channel = open_channel(&pair.initiator.handle(), &client, ChannelRequest::new(ECHO))
        .expect("channel should open");

    let body: Vec<u8> = (0..20_000u32).map(|n| (n % 251) as u8).collect();
    let wait = WaitReply::new();
    channel
        .send_msg_and_wait(&body, &wait)
        .expect("message should be sent");
    let reply = channel.wait_reply(&wait).expect("echo should answer");
    assert_eq!(&reply.payload[..], &body[..]);

    let frames = pair.initiator.sent_frames(channel.number());
    assert!(frames.len() >= 5);
    assert!(frames.iter().all(|frame| frame.payload.len() <= MAX_FRAME_SIZE));
    assert!(frames[..frames.len() - 1].iter().all(|frame| frame.more));
    assert!(!pair.listener.sent_seqs(channel.number()).is_empty());
    assert!(!pair.initiator.sent_seqs(channel.number()).is_empty());
    assert!(eventually(WAIT, || channel.is_ready()));
}

#[test]
fn desired_window_is_announced_by_the_receiver() {
    let client = context();
    let server = Context::new(ChannelConfig {
        desired_window_size: 16_384,
        ..test_config()
    })
    .expect("context should build");
    server
        .profiles()
        .register(ECHO, ProfileHandlers::new().on_frame(echo));
    let pair = connect_pair(&client, &server);
    let channel = open_channel(&pair.initiator.handle(), &client, ChannelRequest::new(ECHO))
        .expect("channel should open");

    let wait = WaitReply::new();
    channel
        .send_msg_and_wait(vec![b'w'; 12_000], &wait)
        .expect("message should be sent");
    channel.wait_reply(&wait).expect("echo should answer");

    let seqs = pair.listener.sent_seqs(channel.number());
    assert!(!seqs.is_empty());
    assert!(seqs.iter().all(|seq| seq.window == 16_384));
    let peer = pair
        .listener
        .channel(channel.number())
        .expect("peer channel should exist");
    assert_eq!(peer.window_size(), 16_384);
}

#[test]
fn frame_size_handler_limits_outgoing_frames() {
    let client = context();
    let server = context();
    server
        .profiles()
        .register(ECHO, ProfileHandlers::new().on_frame(echo));
    let pair = connect_pair(&client, &server);
    let channel = open_channel(&pair.initiator.handle(), &client, ChannelRequest::new(ECHO))
        .expect("channel should open");

    let handler: Arc<dyn FrameSizeHandler> =
        Arc::new(|_channel: &Channel, _next: u32, size: usize, _max: u32| Some(size.min(1000)));
    channel.set_frame_size_handler(Some(handler));

    let wait = WaitReply::new();
    channel
        .send_msg_and_wait(vec![b'z'; 3000], &wait)
        .expect("message should be sent");
    let reply = channel.wait_reply(&wait).expect("echo should answer");
    assert_eq!(reply.payload.len(), 3000);

    let sizes: Vec<usize> = pair
        .initiator
        .sent_frames(channel.number())
        .iter()
        .map(|frame| frame.payload.len())
        .collect();
    // the profile sends an empty header block in front of the body
    assert_eq!(sizes, vec![1000, 1000, 1000, 2]);
}
