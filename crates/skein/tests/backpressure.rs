mod helpers;

use bytes::Bytes;
use helpers::{Harness, MemoryTransport};
use pretty_assertions::assert_eq;
use skein::{
    skein_h2::{H2Frame, KnownErrorCode},
    H2Config, StreamError,
};

fn with_buffer_limit(max: usize) -> H2Config {
    H2Config {
        max_buffered_control_frame_bytes: max,
        ..Default::default()
    }
}

fn written_len(h: &Harness) -> usize {
    h.conn.transport().written.len()
}

#[test]
fn control_frames_buffered_while_paused_trip_the_limit() {
    let mut h = Harness::new(with_buffer_limit(100));
    h.handshake();
    let req = h.client.get(1);
    h.send(&req);
    h.conn.pause_producing();
    let before = written_len(&h);

    // each SETTINGS gets a 9-byte ACK
    let settings = h.client.settings(&[]);
    for _ in 0..11 {
        h.send(&settings);
    }
    assert_eq!(h.conn.buffered_control_frame_bytes(), 99);
    assert!(!h.conn.transport().disconnected);
    assert_eq!(written_len(&h), before);

    h.send(&settings);
    assert!(h.conn.transport().disconnected);
    assert!(h.conn.is_closed());
    assert_eq!(h.conn.buffered_control_frame_bytes(), 0);
    assert_eq!(written_len(&h), before);
    assert_eq!(h.outcome(0), Some(Err(StreamError::ExcessiveBuffering)));

    // anything after that is ignored, and nothing gets written
    let ping = h.client.ping(*b"whatever");
    h.send(&ping);
    h.conn.resume_producing();
    assert_eq!(written_len(&h), before);
}

#[test]
fn buffered_control_frames_are_flushed_in_order_on_resume() {
    let mut h = Harness::new(H2Config::default());
    h.handshake();
    h.conn.pause_producing();

    let settings = h.client.settings(&[]);
    for _ in 0..100 {
        h.send(&settings);
    }
    let ping = h.client.ping(*b"12345678");
    h.send(&ping);
    assert_eq!(h.frame_count(), 2);
    assert_eq!(h.conn.buffered_control_frame_bytes(), 100 * 9 + 17);

    h.conn.resume_producing();
    assert!(!h.conn.is_paused());
    assert_eq!(h.conn.buffered_control_frame_bytes(), 0);

    let frames = h.frames();
    assert_eq!(frames.len(), 2 + 100 + 1);
    assert!(frames[2..102]
        .iter()
        .all(|f| matches!(f, H2Frame::Settings { ack: true, .. })));
    assert_eq!(
        frames[102],
        H2Frame::Ping {
            ack: true,
            payload: *b"12345678"
        }
    );
}

#[test]
fn response_waits_for_the_transport() {
    let mut h = Harness::new(H2Config::default());
    h.handshake();
    h.conn.pause_producing();

    let req = h.client.get(1);
    h.send(&req);
    let handle = h.handle(0);
    handle.write("hello");
    handle.finish();
    h.conn.send_prioritised_data();
    assert_eq!(h.frame_count(), 2);

    h.conn.resume_producing();
    let names: Vec<_> = h.frames().iter().map(|f| f.name()).collect();
    assert_eq!(names, vec!["SETTINGS", "SETTINGS", "HEADERS", "DATA", "DATA"]);
    assert_eq!(h.outcome(0), Some(Ok(helpers::sid(1))));
}

#[test]
fn each_resume_sends_until_the_transport_pushes_back() {
    let mut h = Harness::with_transport(MemoryTransport::auto_pausing(), H2Config::default());
    // our SETTINGS filled the transport already
    assert!(h.conn.is_paused());

    h.handshake();
    assert_eq!(h.frame_count(), 1);
    assert_eq!(h.conn.buffered_control_frame_bytes(), 9);

    h.conn.resume_producing();
    assert_eq!(h.frame_count(), 2);
    assert!(h.conn.is_paused());

    let req = h.client.get(1);
    h.send(&req);
    let handle = h.handle(0);
    handle.write("hello");
    handle.finish();

    let mut resumes = 0;
    while h.outcome(0).is_none() {
        h.conn.resume_producing();
        resumes += 1;
        assert!(resumes < 10, "response never completed");
    }
    // HEADERS, DATA, then the empty DATA that ends the stream
    assert_eq!(resumes, 3);
    assert_eq!(
        h.data_frames(1),
        vec![Bytes::from_static(b"hello"), Bytes::new()]
    );
}

#[test]
fn resume_and_pause_are_idempotent() {
    let mut h = Harness::new(H2Config::default());
    h.handshake();
    let count = h.frame_count();

    h.conn.resume_producing();
    assert!(!h.conn.is_paused());
    assert_eq!(h.frame_count(), count);

    h.conn.pause_producing();
    h.conn.pause_producing();
    assert!(h.conn.is_paused());
    let ping = h.client.ping(*b"pingpong");
    h.send(&ping);

    h.conn.resume_producing();
    h.conn.resume_producing();
    assert_eq!(h.frame_count(), count + 1);
}

/// A connection with a GET open on stream 1, paused, that tolerates no
/// buffered control frames at all.
fn paused_without_buffer() -> Harness {
    let mut h = Harness::new(with_buffer_limit(0));
    h.handshake();
    let req = h.client.get(1);
    h.send(&req);
    h.conn.pause_producing();
    h
}

#[test]
fn bad_request_response_while_paused_can_abort() {
    let mut h = paused_without_buffer();
    let before = written_len(&h);

    h.handle(0).respond_bad_request();
    h.conn.handle_events();

    assert!(h.conn.transport().disconnected);
    assert_eq!(written_len(&h), before);
    assert_eq!(h.outcome(0), Some(Err(StreamError::ExcessiveBuffering)));
}

#[test]
fn stream_abort_while_paused_can_abort() {
    let mut h = paused_without_buffer();
    let before = written_len(&h);

    h.handle(0).abort();
    h.conn.handle_events();

    assert!(h.conn.transport().disconnected);
    assert_eq!(written_len(&h), before);
    assert_eq!(h.outcome(0), Some(Err(StreamError::ExcessiveBuffering)));
}

#[test]
fn connection_error_while_paused_can_abort() {
    let mut h = paused_without_buffer();
    let before = written_len(&h);

    let data = h.client.data(0xF1, b"hello", false);
    h.send(&data);

    let transport = h.conn.transport();
    assert!(transport.disconnected);
    assert_eq!(written_len(&h), before);
    assert_eq!(h.outcome(0), Some(Err(StreamError::ExcessiveBuffering)));
}

#[test]
fn stream_reset_while_paused_is_sent_on_resume() {
    let mut h = Harness::new(H2Config::default());
    h.handshake();
    let req = h.client.get(1);
    h.send(&req);
    h.conn.pause_producing();

    h.handle(0).abort();
    h.conn.handle_events();
    assert_eq!(h.frame_count(), 2);
    assert_eq!(
        h.outcome(0),
        Some(Err(StreamError::ResetLocally(KnownErrorCode::Cancel.into())))
    );

    h.conn.resume_producing();
    assert_eq!(
        helpers::as_rst(helpers::last_frame(&h.frames())),
        (helpers::sid(1), helpers::code(KnownErrorCode::Cancel))
    );
}
