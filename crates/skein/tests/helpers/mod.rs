#![allow(dead_code)]

use std::{cell::RefCell, net::SocketAddr, rc::Rc};

use bytes::{Bytes, BytesMut};
use skein::{
    skein_h2::{
        ErrorCode, FrameDecoder, GoAway, H2Frame, KnownErrorCode, PrioritySpec, Setting,
        StreamId, PREFACE,
    },
    Backpressure, H2Config, H2Connection, HeaderList, Request, RequestFactory, StreamError,
    StreamHandle, StreamOutcome, Transport,
};
use tokio::sync::oneshot;

pub(crate) mod tracing_common;

/// Keeps everything the connection writes, and how it asked to be closed.
#[derive(Default)]
pub(crate) struct MemoryTransport {
    pub(crate) written: BytesMut,
    pub(crate) disconnecting: bool,
    pub(crate) disconnected: bool,
    /// Report backpressure after every single write
    pub(crate) auto_pause: bool,
    pub(crate) peer: Option<SocketAddr>,
}

impl MemoryTransport {
    pub(crate) fn auto_pausing() -> Self {
        Self {
            auto_pause: true,
            ..Default::default()
        }
    }
}

impl Transport for MemoryTransport {
    fn write(&mut self, data: Bytes) -> Backpressure {
        assert!(!self.disconnected, "write after abort");
        self.written.extend_from_slice(&data);
        if self.auto_pause {
            Backpressure::Full
        } else {
            Backpressure::Ready
        }
    }

    fn lose_connection(&mut self) {
        self.disconnecting = true;
    }

    fn abort_connection(&mut self) {
        self.disconnecting = true;
        self.disconnected = true;
    }

    fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }
}

/// What a [RecordingRequest] was told, in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Seen {
    Headers(Vec<(String, String)>),
    Data(Bytes),
    Trailers(Vec<(String, String)>),
    Complete,
    Lost(StreamError),
    PauseProducing,
    ResumeProducing,
}

pub(crate) struct RecordingRequest {
    log: Rc<RefCell<Vec<Seen>>>,
}

impl Request for RecordingRequest {
    fn headers_received(&mut self, headers: HeaderList) {
        self.log.borrow_mut().push(Seen::Headers(stringify(&headers)));
    }

    fn data_received(&mut self, data: Bytes) {
        self.log.borrow_mut().push(Seen::Data(data));
    }

    fn trailers_received(&mut self, trailers: HeaderList) {
        self.log.borrow_mut().push(Seen::Trailers(stringify(&trailers)));
    }

    fn request_complete(&mut self) {
        self.log.borrow_mut().push(Seen::Complete);
    }

    fn connection_lost(&mut self, reason: &StreamError) {
        self.log.borrow_mut().push(Seen::Lost(reason.clone()));
    }

    fn pause_producing(&mut self) {
        self.log.borrow_mut().push(Seen::PauseProducing);
    }

    fn resume_producing(&mut self) {
        self.log.borrow_mut().push(Seen::ResumeProducing);
    }
}

fn stringify(headers: &HeaderList) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|(k, v)| {
            (
                String::from_utf8_lossy(k).into_owned(),
                String::from_utf8_lossy(v).into_owned(),
            )
        })
        .collect()
}

pub(crate) struct Opened {
    pub(crate) handle: StreamHandle,
    pub(crate) log: Rc<RefCell<Vec<Seen>>>,
    pub(crate) cleanup: oneshot::Receiver<StreamOutcome>,
}

#[derive(Clone, Default)]
pub(crate) struct RecordingFactory {
    pub(crate) opened: Rc<RefCell<Vec<Opened>>>,
}

impl RequestFactory for RecordingFactory {
    type Request = RecordingRequest;

    fn make_request(
        &mut self,
        handle: StreamHandle,
        cleanup: oneshot::Receiver<StreamOutcome>,
    ) -> RecordingRequest {
        let log: Rc<RefCell<Vec<Seen>>> = Default::default();
        self.opened.borrow_mut().push(Opened {
            handle,
            log: log.clone(),
            cleanup,
        });
        RecordingRequest { log }
    }
}

/// Builds client-side frames, HPACK-encoding header blocks as it goes.
pub(crate) struct Client {
    encoder: loona_hpack::Encoder<'static>,
}

impl Client {
    pub(crate) fn new() -> Self {
        Self {
            encoder: loona_hpack::Encoder::new(),
        }
    }

    /// Connection preface followed by the client's SETTINGS
    pub(crate) fn preface(&self, settings: &[(Setting, u32)]) -> Bytes {
        let mut out = BytesMut::from(PREFACE);
        out.extend_from_slice(&self.settings(settings));
        out.freeze()
    }

    pub(crate) fn settings(&self, settings: &[(Setting, u32)]) -> Bytes {
        H2Frame::Settings {
            ack: false,
            settings: settings.to_vec(),
        }
        .to_bytes()
    }

    pub(crate) fn header_block(&mut self, headers: &[(&str, &str)]) -> Bytes {
        let pairs: Vec<(&[u8], &[u8])> = headers
            .iter()
            .map(|(k, v)| (k.as_bytes(), v.as_bytes()))
            .collect();
        let mut block = Vec::new();
        self.encoder.encode_into(pairs, &mut block).unwrap();
        block.into()
    }

    pub(crate) fn headers(
        &mut self,
        stream_id: u32,
        headers: &[(&str, &str)],
        end_stream: bool,
    ) -> Bytes {
        self.headers_with_priority(stream_id, headers, end_stream, None)
    }

    pub(crate) fn headers_with_priority(
        &mut self,
        stream_id: u32,
        headers: &[(&str, &str)],
        end_stream: bool,
        priority: Option<PrioritySpec>,
    ) -> Bytes {
        H2Frame::Headers {
            stream_id: StreamId(stream_id),
            end_stream,
            end_headers: true,
            priority,
            fragment: self.header_block(headers),
            padding: None,
        }
        .to_bytes()
    }

    pub(crate) fn get(&mut self, stream_id: u32) -> Bytes {
        self.headers(stream_id, &request_headers("GET"), true)
    }

    /// Request headers for a request with a body
    pub(crate) fn post(&mut self, stream_id: u32) -> Bytes {
        self.headers(stream_id, &request_headers("POST"), false)
    }

    pub(crate) fn data(&self, stream_id: u32, data: &[u8], end_stream: bool) -> Bytes {
        H2Frame::Data {
            stream_id: StreamId(stream_id),
            end_stream,
            data: Bytes::copy_from_slice(data),
            padding: None,
        }
        .to_bytes()
    }

    pub(crate) fn rst_stream(&self, stream_id: u32, code: KnownErrorCode) -> Bytes {
        H2Frame::RstStream {
            stream_id: StreamId(stream_id),
            error_code: code.into(),
        }
        .to_bytes()
    }

    pub(crate) fn window_update(&self, stream_id: u32, increment: u32) -> Bytes {
        H2Frame::WindowUpdate {
            stream_id: StreamId(stream_id),
            increment,
        }
        .to_bytes()
    }

    pub(crate) fn priority(&self, stream_id: u32, spec: PrioritySpec) -> Bytes {
        H2Frame::Priority {
            stream_id: StreamId(stream_id),
            spec,
        }
        .to_bytes()
    }

    pub(crate) fn ping(&self, payload: [u8; 8]) -> Bytes {
        H2Frame::Ping {
            ack: false,
            payload,
        }
        .to_bytes()
    }

    pub(crate) fn goaway(&self, last_stream_id: u32, code: KnownErrorCode) -> Bytes {
        H2Frame::GoAway(GoAway {
            last_stream_id: StreamId(last_stream_id),
            error_code: code.into(),
            additional_debug_data: Bytes::new(),
        })
        .to_bytes()
    }
}

pub(crate) fn request_headers(method: &'static str) -> Vec<(&'static str, &'static str)> {
    vec![
        (":method", method),
        (":scheme", "https"),
        (":path", "/"),
        (":authority", "example.com"),
    ]
}

pub(crate) fn spec(depends_on: u32, weight: u8, exclusive: bool) -> PrioritySpec {
    PrioritySpec {
        exclusive,
        stream_dependency: StreamId(depends_on),
        weight,
    }
}

pub(crate) fn code(code: KnownErrorCode) -> ErrorCode {
    code.into()
}

/// Decodes everything a server wrote, as a client would.
pub(crate) fn parse_frames(data: &[u8]) -> Vec<H2Frame> {
    let mut decoder = FrameDecoder::client();
    decoder.set_max_frame_size(1 << 24);
    decoder.feed(data);

    let mut frames = vec![];
    while let Some(frame) = decoder.decode().unwrap() {
        frames.push(frame);
    }
    assert_eq!(decoder.buffered(), 0, "server wrote a partial frame");
    frames
}

/// A connection wired to a [MemoryTransport] and a [RecordingFactory]
pub(crate) struct Harness {
    pub(crate) conn: H2Connection<MemoryTransport, RecordingFactory>,
    pub(crate) client: Client,
    pub(crate) opened: Rc<RefCell<Vec<Opened>>>,
}

impl Harness {
    pub(crate) fn new(config: H2Config) -> Self {
        Self::with_transport(MemoryTransport::default(), config)
    }

    pub(crate) fn with_transport(transport: MemoryTransport, config: H2Config) -> Self {
        tracing_common::setup_tracing();

        let factory = RecordingFactory::default();
        let opened = factory.opened.clone();
        let mut conn = H2Connection::new(transport, factory, config);
        conn.connection_made();

        Self {
            conn,
            client: Client::new(),
            opened,
        }
    }

    /// Sends the preface and an empty SETTINGS frame
    pub(crate) fn handshake(&mut self) {
        self.handshake_with(&[]);
    }

    pub(crate) fn handshake_with(&mut self, settings: &[(Setting, u32)]) {
        let preface = self.client.preface(settings);
        self.conn.data_received(&preface);
    }

    pub(crate) fn send(&mut self, data: &[u8]) {
        self.conn.data_received(data);
    }

    pub(crate) fn frames(&self) -> Vec<H2Frame> {
        parse_frames(&self.conn.transport().written)
    }

    pub(crate) fn frame_count(&self) -> usize {
        self.frames().len()
    }

    /// Payloads of every DATA frame written for `stream_id`
    pub(crate) fn data_frames(&self, stream_id: u32) -> Vec<Bytes> {
        self.frames()
            .into_iter()
            .filter_map(|f| match f {
                H2Frame::Data {
                    stream_id: id,
                    data,
                    ..
                } if id == StreamId(stream_id) => Some(data),
                _ => None,
            })
            .collect()
    }

    /// Every response header block, decoded in the order it was written
    pub(crate) fn response_headers(&self) -> Vec<(StreamId, Vec<(String, String)>)> {
        let mut decoder = loona_hpack::Decoder::new();
        let mut blocks = vec![];
        let mut pending: Option<(StreamId, BytesMut)> = None;

        for frame in self.frames() {
            match frame {
                H2Frame::Headers {
                    stream_id,
                    end_headers,
                    fragment,
                    ..
                } => {
                    pending = Some((stream_id, BytesMut::from(&fragment[..])));
                    if !end_headers {
                        continue;
                    }
                }
                H2Frame::Continuation {
                    end_headers,
                    fragment,
                    ..
                } => {
                    pending.as_mut().unwrap().1.extend_from_slice(&fragment);
                    if !end_headers {
                        continue;
                    }
                }
                _ => continue,
            }

            let (stream_id, block) = pending.take().unwrap();
            let pairs = decoder
                .decode(&block)
                .unwrap()
                .into_iter()
                .map(|(k, v)| {
                    (
                        String::from_utf8(k).unwrap(),
                        String::from_utf8(v).unwrap(),
                    )
                })
                .collect();
            blocks.push((stream_id, pairs));
        }
        blocks
    }

    pub(crate) fn request_count(&self) -> usize {
        self.opened.borrow().len()
    }

    pub(crate) fn handle(&self, idx: usize) -> StreamHandle {
        self.opened.borrow()[idx].handle.clone()
    }

    pub(crate) fn log(&self, idx: usize) -> Vec<Seen> {
        self.opened.borrow()[idx].log.borrow().clone()
    }

    /// How the stream ended, if it has
    pub(crate) fn outcome(&self, idx: usize) -> Option<StreamOutcome> {
        self.opened.borrow_mut()[idx].cleanup.try_recv().ok()
    }

    pub(crate) fn clear_log(&self, idx: usize) {
        self.opened.borrow()[idx].log.borrow_mut().clear();
    }
}

pub(crate) fn last_frame(frames: &[H2Frame]) -> &H2Frame {
    frames.last().expect("no frames written")
}

/// Extracts the GOAWAY's last stream id and code, panicking on anything else
pub(crate) fn as_goaway(frame: &H2Frame) -> (StreamId, ErrorCode) {
    match frame {
        H2Frame::GoAway(g) => (g.last_stream_id, g.error_code),
        other => panic!("expected GOAWAY, got {other:?}"),
    }
}

/// Extracts the RST_STREAM's stream id and code, panicking on anything else
pub(crate) fn as_rst(frame: &H2Frame) -> (StreamId, ErrorCode) {
    match frame {
        H2Frame::RstStream {
            stream_id,
            error_code,
        } => (*stream_id, *error_code),
        other => panic!("expected RST_STREAM, got {other:?}"),
    }
}

pub(crate) fn sid(id: u32) -> StreamId {
    StreamId(id)
}
