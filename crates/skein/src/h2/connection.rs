use std::{
    collections::{HashMap, HashSet, VecDeque},
    net::SocketAddr,
};

use bytes::{Bytes, BytesMut};
use http::{header, HeaderMap, HeaderName, StatusCode};
use skein_h2::{
    ErrorCode, FrameDecoder, GoAway, H2Frame, KnownErrorCode, PrioritySpec, Setting, Settings,
    StreamId,
};
use tokio::{
    sync::{mpsc, oneshot},
    time::Instant,
};
use tracing::{debug, info, trace, warn};

use super::{
    flow::{FlowControlWindow, ReceiveWindow},
    handle::StreamHandle,
    headers::{HeaderChecker, HeadersOrTrailers},
    priority::{PriorityError, PriorityTree, DEFAULT_WEIGHT},
    stream::{H2Stream, IngestState, OutboundChunk, ProducerState, StreamEvent, StreamState},
    types::{
        H2ConnectionError, H2ErrorLevel, H2Event, H2EventPayload, H2StreamError, StreamError,
    },
    Backpressure, H2Config, Request, RequestFactory, Transport,
};

/// A header block that spans several frames, cf. RFC 9113 section 6.10
struct PendingHeaderBlock {
    stream_id: StreamId,
    end_stream: bool,
    priority: Option<PrioritySpec>,
    fragments: BytesMut,
}

/// One HTTP/2 connection, server side, sans I/O: bytes come in through
/// [Self::data_received], go out through the [Transport], and whoever owns
/// the connection is responsible for calling [Self::send_prioritised_data]
/// and [Self::handle_timeout] at the right times (see [crate::serve]).
pub struct H2Connection<T: Transport, F: RequestFactory> {
    transport: T,
    factory: F,
    config: H2Config,

    decoder: FrameDecoder,
    hpack_dec: loona_hpack::Decoder<'static>,
    hpack_enc: loona_hpack::Encoder<'static>,

    self_settings: Settings,
    peer_settings: Settings,

    streams: HashMap<StreamId, H2Stream<F::Request>>,
    priority: PriorityTree,
    last_stream_id: StreamId,
    pending_headers: Option<PendingHeaderBlock>,

    /// What we may still send on the connection as a whole
    outbound_window: FlowControlWindow,
    /// What the peer may still send on the connection as a whole
    inbound_window: ReceiveWindow,

    ev_tx: mpsc::UnboundedSender<H2Event>,
    ev_rx: mpsc::UnboundedReceiver<H2Event>,

    still_producing: bool,
    paused: bool,
    closed: bool,

    /// Control frames generated since the last flush
    control_out: BytesMut,
    /// Control frames held back while the transport is paused, in order
    buffered_control_frames: VecDeque<Bytes>,
    buffered_control_frame_bytes: usize,

    idle_deadline: Option<Instant>,
    abort_deadline: Option<Instant>,
}

impl<T, F> H2Connection<T, F>
where
    T: Transport,
    F: RequestFactory,
{
    pub fn new(transport: T, factory: F, config: H2Config) -> Self {
        let self_settings = Settings {
            enable_push: false,
            max_concurrent_streams: config.max_streams,
            initial_window_size: config.initial_window_size,
            max_frame_size: config.max_frame_size,
            max_header_list_size: Some(config.max_header_list_size),
            ..Default::default()
        };

        let mut decoder = FrameDecoder::server();
        decoder.set_max_frame_size(self_settings.max_frame_size);

        let mut hpack_dec = loona_hpack::Decoder::new();
        hpack_dec.set_max_allowed_table_size(self_settings.header_table_size as usize);

        let (ev_tx, ev_rx) = mpsc::unbounded_channel();
        let connection_window = Settings::default().initial_window_size;

        Self {
            transport,
            factory,
            config,
            decoder,
            hpack_dec,
            hpack_enc: loona_hpack::Encoder::new(),
            self_settings,
            peer_settings: Settings::default(),
            streams: Default::default(),
            priority: PriorityTree::new(),
            last_stream_id: StreamId::CONNECTION,
            pending_headers: None,
            outbound_window: FlowControlWindow::new(connection_window),
            inbound_window: ReceiveWindow::new(connection_window),
            ev_tx,
            ev_rx,
            still_producing: true,
            paused: false,
            closed: false,
            control_out: BytesMut::new(),
            buffered_control_frames: Default::default(),
            buffered_control_frame_bytes: 0,
            idle_deadline: None,
            abort_deadline: None,
        }
    }

    /// Sends our SETTINGS and starts the idle timer.
    pub fn connection_made(&mut self) {
        debug!(peer = ?self.transport.peer(), "connection made, sending initial settings");

        let s = &self.self_settings;
        let mut settings = vec![
            (Setting::EnablePush, 0),
            (Setting::HeaderTableSize, s.header_table_size),
            (Setting::InitialWindowSize, s.initial_window_size),
            (Setting::MaxFrameSize, s.max_frame_size),
        ];
        if let Some(max) = s.max_concurrent_streams {
            settings.push((Setting::MaxConcurrentStreams, max));
        }
        if let Some(max) = s.max_header_list_size {
            settings.push((Setting::MaxHeaderListSize, max));
        }

        let frame = H2Frame::Settings {
            ack: false,
            settings,
        };
        self.write_to_transport(frame.to_bytes());
        self.reset_idle_timer();
    }

    /// Feeds bytes read from the transport. Frames are dispatched in wire
    /// order; any DATA they make ready waits for the next
    /// [Self::send_prioritised_data].
    pub fn data_received(&mut self, data: &[u8]) {
        if self.closed {
            trace!(len = data.len(), "connection is closed, ignoring incoming bytes");
            return;
        }

        self.decoder.feed(data);

        let mut frames = Vec::new();
        let mut fatal = None;
        loop {
            match self.decoder.decode() {
                Ok(Some(frame)) => frames.push(Ok(frame)),
                Ok(None) => break,
                Err(e) => match e.stream_scoped() {
                    Some(stream_id) => frames.push(Err((stream_id, e))),
                    None => {
                        fatal = Some(e);
                        break;
                    }
                },
            }
        }

        // DATA for a stream that gets reset later in the same batch is never
        // handed over, nor acknowledged on the stream.
        let reset_in_batch: HashSet<StreamId> = frames
            .iter()
            .filter_map(|f| match f {
                Ok(H2Frame::RstStream { stream_id, .. }) => Some(*stream_id),
                _ => None,
            })
            .collect();

        let mut conn_err: Option<H2ConnectionError> = None;
        for frame in frames {
            let res = match frame {
                Ok(frame) => self.process_frame(frame, &reset_in_batch),
                Err((stream_id, e)) => Err(H2ErrorLevel::Stream(
                    stream_id,
                    H2StreamError::InvalidFrame(e),
                )),
            };

            match res {
                Ok(()) => {}
                Err(H2ErrorLevel::Stream(stream_id, e)) => self.reset_stream(stream_id, e),
                Err(H2ErrorLevel::Connection(e)) => {
                    conn_err = Some(e);
                    break;
                }
            }

            if self.closed {
                break;
            }
            self.handle_events();
            if self.closed {
                break;
            }
        }

        if conn_err.is_none() && !self.closed {
            conn_err = fatal.map(H2ConnectionError::from);
        }

        if let Some(e) = conn_err {
            if !self.closed {
                self.connection_error(e);
            }
            return;
        }

        if self.closed {
            return;
        }
        self.reset_idle_timer();
        self.try_to_write_control_data();
    }

    /// Drains what the [StreamHandle]s asked for since the last call.
    pub fn handle_events(&mut self) {
        while let Ok(ev) = self.ev_rx.try_recv() {
            if self.closed {
                trace!(?ev, "connection is closed, dropping event");
                continue;
            }
            self.handle_event(ev);
        }
    }

    /// Waits until a [StreamHandle] asks for something, then handles
    /// everything queued so far. Cancel-safe.
    pub async fn process_events(&mut self) {
        // never closed: we hold a sender ourselves
        if let Some(ev) = self.ev_rx.recv().await {
            if !self.closed {
                self.handle_event(ev);
            }
        }
        self.handle_events();
    }

    /// Sends queued DATA, one frame at a time, in priority order, until
    /// every stream is blocked or the transport pushes back.
    pub fn send_prioritised_data(&mut self) {
        loop {
            if !self.still_producing || self.paused {
                return;
            }
            self.handle_events();
            if !self.still_producing || self.paused {
                return;
            }

            let stream_id = match self.priority.next() {
                Ok(id) => id,
                Err(_) => {
                    trace!("all streams are blocked, nothing to send");
                    return;
                }
            };
            self.reset_idle_timer();

            let Some(stream) = self.streams.get_mut(&stream_id) else {
                // a placeholder created by a PRIORITY frame
                self.priority.block(stream_id);
                continue;
            };

            let Some(chunk) = stream.queue.pop_front() else {
                self.priority.block(stream_id);
                continue;
            };

            match chunk {
                OutboundChunk::End => {
                    debug!(%stream_id, "response done, sending END_STREAM");
                    let frame = H2Frame::Data {
                        stream_id,
                        end_stream: true,
                        data: Bytes::new(),
                        padding: None,
                    };
                    self.write_to_transport(frame.to_bytes());
                    self.request_done(stream_id);
                }
                OutboundChunk::Data(mut data) => {
                    let max_len = self.outbound_window.reserve(
                        stream
                            .outbound
                            .reserve(self.peer_settings.max_frame_size as usize),
                    );

                    if data.len() > max_len {
                        let excess = data.split_off(max_len);
                        stream.queue.push_front(OutboundChunk::Data(excess));
                    }

                    let mut frame = None;
                    if !data.is_empty() {
                        stream.outbound.consume(data.len());
                        self.outbound_window.consume(data.len());
                        trace!(%stream_id, len = data.len(), "sending DATA");
                        frame = Some(H2Frame::Data {
                            stream_id,
                            end_stream: false,
                            data,
                            padding: None,
                        });
                    }

                    if stream.queue.is_empty() {
                        self.priority.block(stream_id);
                    }
                    if remaining_outbound_window(&self.outbound_window, stream) <= 0 {
                        stream.flow_control_blocked();
                    }
                    let window =
                        self.outbound_window.available().min(stream.outbound.available());
                    if window <= 0 && matches!(stream.queue.front(), Some(OutboundChunk::Data(_))) {
                        // until a WINDOW_UPDATE comes in
                        self.priority.block(stream_id);
                    }

                    if let Some(frame) = frame {
                        self.write_to_transport(frame.to_bytes());
                    }
                }
            }
        }
    }

    /// The transport's buffer is full: stop writing until resumed.
    pub fn pause_producing(&mut self) {
        if !self.paused {
            trace!("transport pushed back, pausing");
            self.paused = true;
        }
    }

    /// Flushes held-back control frames, oldest first, then restarts the
    /// sending loop. A no-op if not paused.
    pub fn resume_producing(&mut self) {
        if !self.paused {
            return;
        }
        trace!(
            buffered = self.buffered_control_frame_bytes,
            "transport has room again, resuming"
        );
        self.paused = false;

        while !self.paused {
            let Some(chunk) = self.buffered_control_frames.pop_front() else {
                break;
            };
            self.buffered_control_frame_bytes -= chunk.len();
            self.write_to_transport(chunk);
        }

        self.send_prioritised_data();
    }

    /// The transport won't take any more data, ever.
    pub fn stop_producing(&mut self) {
        debug!("transport stopped consuming");
        self.lose(StreamError::ConnectionLost, true);
    }

    /// The transport is gone. Fails every stream with `reason` and cancels
    /// all timers.
    pub fn connection_lost(&mut self, reason: StreamError) {
        self.lose(reason, true);
    }

    /// The earliest instant [Self::handle_timeout] has something to do.
    pub fn next_timeout(&self) -> Option<Instant> {
        [self.idle_deadline, self.abort_deadline]
            .into_iter()
            .flatten()
            .min()
    }

    /// Fires whichever timers are due.
    pub fn handle_timeout(&mut self) {
        let now = Instant::now();

        if self.idle_deadline.is_some_and(|d| d <= now) {
            self.idle_deadline = None;
            self.timeout_connection(now);
        }

        if self.abort_deadline.is_some_and(|d| d <= now) {
            self.abort_deadline = None;
            info!(peer = ?self.transport.peer(), "forcibly closing timed out connection");
            self.transport.abort_connection();
        }
    }

    pub fn host(&self) -> Option<SocketAddr> {
        self.transport.host()
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.transport.peer()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Whether the connection has stopped processing input, after a
    /// connection error, a GOAWAY from the peer, a timeout or a loss.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn buffered_control_frame_bytes(&self) -> usize {
        self.buffered_control_frame_bytes
    }

    pub fn has_stream(&self, stream_id: StreamId) -> bool {
        self.streams.contains_key(&stream_id)
    }

    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    /// Highest stream id the peer has opened so far.
    pub fn last_stream_id(&self) -> StreamId {
        self.last_stream_id
    }

    fn process_frame(
        &mut self,
        frame: H2Frame,
        reset_in_batch: &HashSet<StreamId>,
    ) -> Result<(), H2ErrorLevel> {
        trace!(frame_type = frame.name(), stream_id = %frame.stream_id(), "<");

        if let Some(pending) = &self.pending_headers {
            let continues = matches!(
                &frame,
                H2Frame::Continuation { stream_id, .. } if *stream_id == pending.stream_id
            );
            if !continues {
                return Err(H2ConnectionError::ExpectedContinuationFrame {
                    stream_id: pending.stream_id,
                    frame_type: frame.name(),
                }
                .into());
            }
        }

        let flow_len = frame.flow_controlled_len();
        match frame {
            H2Frame::Data {
                stream_id,
                end_stream,
                data,
                ..
            } => self.process_data(stream_id, end_stream, data, flow_len, reset_in_batch),
            H2Frame::Headers {
                stream_id,
                end_stream,
                end_headers,
                priority,
                fragment,
                ..
            } => {
                if end_headers {
                    self.process_header_block(stream_id, end_stream, priority, &fragment)
                } else {
                    self.pending_headers = Some(PendingHeaderBlock {
                        stream_id,
                        end_stream,
                        priority,
                        fragments: BytesMut::from(&fragment[..]),
                    });
                    Ok(())
                }
            }
            H2Frame::Continuation {
                stream_id,
                end_headers,
                fragment,
            } => {
                let Some(mut pending) = self.pending_headers.take() else {
                    return Err(H2ConnectionError::UnexpectedContinuationFrame { stream_id }.into());
                };
                pending.fragments.extend_from_slice(&fragment);
                if end_headers {
                    self.process_header_block(
                        pending.stream_id,
                        pending.end_stream,
                        pending.priority,
                        &pending.fragments,
                    )
                } else {
                    self.pending_headers = Some(pending);
                    Ok(())
                }
            }
            H2Frame::Priority { stream_id, spec } => self.process_priority(stream_id, spec),
            H2Frame::RstStream {
                stream_id,
                error_code,
            } => {
                self.check_not_idle(stream_id, "RST_STREAM")?;
                if self.streams.contains_key(&stream_id) {
                    debug!(%stream_id, ?error_code, "stream reset by peer");
                }
                self.remove_failed_stream(
                    stream_id,
                    StreamEvent::RecvReset,
                    StreamError::ResetByPeer(error_code),
                );
                Ok(())
            }
            H2Frame::Settings { ack, settings } => {
                if ack {
                    debug!("peer acknowledged our settings");
                    return Ok(());
                }
                self.process_settings(&settings)
            }
            H2Frame::PushPromise { .. } => Err(H2ConnectionError::ClientSentPushPromise.into()),
            H2Frame::Ping { ack, payload } => {
                if !ack {
                    trace!("answering PING");
                    self.queue_control(H2Frame::Ping { ack: true, payload });
                }
                Ok(())
            }
            H2Frame::GoAway(goaway) => {
                debug!(
                    last_stream_id = %goaway.last_stream_id,
                    error_code = ?goaway.error_code,
                    "peer sent GOAWAY"
                );
                self.transport.lose_connection();
                self.lose(StreamError::GoAway(goaway.error_code), false);
                Ok(())
            }
            H2Frame::WindowUpdate {
                stream_id,
                increment,
            } => self.process_window_update(stream_id, increment),
            H2Frame::Unknown { ty, .. } => {
                trace!(%ty, "ignoring frame of unknown type");
                Ok(())
            }
        }
    }

    fn process_data(
        &mut self,
        stream_id: StreamId,
        end_stream: bool,
        data: Bytes,
        flow_len: u32,
        reset_in_batch: &HashSet<StreamId>,
    ) -> Result<(), H2ErrorLevel> {
        self.check_not_idle(stream_id, "DATA")?;

        if let Err(e) = self.inbound_window.consumed(flow_len) {
            debug!(%stream_id, %e, "peer overran the connection window");
            return Err(H2ConnectionError::WindowUnderflow.into());
        }

        let deliverable =
            !reset_in_batch.contains(&stream_id) && self.streams.contains_key(&stream_id);
        let Some(stream) = self.streams.get_mut(&stream_id).filter(|_| deliverable) else {
            trace!(%stream_id, %flow_len, "discarding DATA for a finished stream");
            self.ack_connection_window(flow_len);
            return Ok(());
        };

        if !stream.state.can_receive() {
            self.ack_connection_window(flow_len);
            return Err(H2ErrorLevel::Stream(stream_id, H2StreamError::StreamClosed));
        }
        if stream.inbound.consumed(flow_len).is_err() {
            self.ack_connection_window(flow_len);
            return Err(H2ErrorLevel::Stream(stream_id, H2StreamError::WindowUnderflow));
        }
        if let Err(e) = stream.count_body_bytes(data.len(), end_stream) {
            self.ack_connection_window(flow_len);
            return Err(H2ErrorLevel::Stream(stream_id, e));
        }

        let ack = stream.receive_data_chunk(data, flow_len);
        if end_stream {
            stream
                .apply(StreamEvent::RecvEndStream)
                .map_err(|_| H2ErrorLevel::Stream(stream_id, H2StreamError::StreamClosed))?;
            stream.request_complete();
        }

        self.acknowledge_received_data(stream_id, ack);
        if end_stream {
            self.finish_if_closed(stream_id);
        }
        Ok(())
    }

    fn process_header_block(
        &mut self,
        stream_id: StreamId,
        end_stream: bool,
        priority: Option<PrioritySpec>,
        block: &[u8],
    ) -> Result<(), H2ErrorLevel> {
        let kind = if self.streams.contains_key(&stream_id) {
            HeadersOrTrailers::Trailers
        } else {
            HeadersOrTrailers::Headers
        };

        // decoding always runs to completion, to keep the hpack table in sync
        let mut checker = HeaderChecker::new(kind);
        self.hpack_dec
            .decode_with_cb(block, |key, value| checker.on_header_pair(&key, &value))
            .map_err(H2ConnectionError::HpackDecodingError)?;

        if kind == HeadersOrTrailers::Trailers {
            return self.process_trailers(stream_id, end_stream, checker);
        }

        if stream_id.is_server_initiated() {
            return Err(H2ConnectionError::ClientSidShouldBeOdd { stream_id }.into());
        }
        if stream_id <= self.last_stream_id {
            // a stream we're already done with
            return Err(H2ErrorLevel::Stream(stream_id, H2StreamError::StreamClosed));
        }
        self.last_stream_id = stream_id;

        if let Some(max) = self.config.max_streams {
            if self.streams.len() >= max as usize {
                debug!(%stream_id, %max, "refusing stream, too many open");
                return Err(H2ErrorLevel::Stream(stream_id, H2StreamError::RefusedStream));
            }
        }
        if priority.is_some_and(|p| p.stream_dependency == stream_id) {
            return Err(H2ErrorLevel::Stream(stream_id, H2StreamError::DependsOnItself));
        }

        let checked = checker
            .finish()
            .map_err(|e| H2ErrorLevel::Stream(stream_id, e))?;
        if let Some(content_length) = checked.content_length {
            if end_stream && content_length != 0 {
                return Err(H2ErrorLevel::Stream(
                    stream_id,
                    H2StreamError::DataLengthDoesNotMatchContentLength {
                        data_length: 0,
                        content_length,
                    },
                ));
            }
        }

        let (cleanup_tx, cleanup_rx) = oneshot::channel();
        let handle = StreamHandle::new(
            stream_id,
            self.ev_tx.clone(),
            self.transport.host(),
            self.transport.peer(),
        );
        let request = self.factory.make_request(handle, cleanup_rx);
        let mut stream = H2Stream::new(
            stream_id,
            request,
            cleanup_tx,
            self.peer_settings.initial_window_size,
            self.self_settings.initial_window_size,
        );
        stream.content_length = checked.content_length;
        stream
            .apply(StreamEvent::RecvHeaders)
            .map_err(|_| H2ErrorLevel::Stream(stream_id, H2StreamError::StreamClosed))?;

        // a PRIORITY frame may have put it in the tree already
        match self
            .priority
            .insert(stream_id, None, DEFAULT_WEIGHT, false)
        {
            Ok(()) | Err(PriorityError::DuplicateStream(_)) => {}
            Err(e) => debug!(%stream_id, %e, "could not add stream to the priority tree"),
        }
        self.priority.block(stream_id);
        if let Some(spec) = priority {
            self.apply_priority(stream_id, spec);
        }

        debug!(%stream_id, %end_stream, "stream opened");
        self.streams.insert(stream_id, stream);

        if checked.expect_continue && !end_stream {
            debug!(%stream_id, "sending 100-continue");
            let block = self.encode_headers(StatusCode::CONTINUE, &HeaderMap::new());
            self.queue_header_frames(stream_id, block, false);
            self.try_to_write_control_data();
        }

        let Some(stream) = self.streams.get_mut(&stream_id) else {
            return Ok(());
        };
        stream.request.headers_received(checked.list);
        if end_stream {
            stream
                .apply(StreamEvent::RecvEndStream)
                .map_err(|_| H2ErrorLevel::Stream(stream_id, H2StreamError::StreamClosed))?;
            stream.request_complete();
        }
        Ok(())
    }

    fn process_trailers(
        &mut self,
        stream_id: StreamId,
        end_stream: bool,
        checker: HeaderChecker,
    ) -> Result<(), H2ErrorLevel> {
        let Some(stream) = self.streams.get_mut(&stream_id) else {
            return Ok(());
        };
        if !stream.state.can_receive() {
            return Err(H2ErrorLevel::Stream(stream_id, H2StreamError::StreamClosed));
        }
        if !end_stream {
            return Err(H2ErrorLevel::Stream(
                stream_id,
                H2StreamError::TrailersNotEndStream,
            ));
        }

        let checked = checker
            .finish()
            .map_err(|e| H2ErrorLevel::Stream(stream_id, e))?;
        stream
            .count_body_bytes(0, true)
            .map_err(|e| H2ErrorLevel::Stream(stream_id, e))?;
        stream
            .apply(StreamEvent::RecvEndStream)
            .map_err(|_| H2ErrorLevel::Stream(stream_id, H2StreamError::StreamClosed))?;

        debug!(%stream_id, "received trailers");
        stream.receive_trailers(checked.list);
        stream.request_complete();
        self.finish_if_closed(stream_id);
        Ok(())
    }

    fn process_priority(
        &mut self,
        stream_id: StreamId,
        spec: PrioritySpec,
    ) -> Result<(), H2ErrorLevel> {
        if spec.stream_dependency == stream_id {
            return Err(H2ErrorLevel::Stream(stream_id, H2StreamError::DependsOnItself));
        }
        if stream_id <= self.last_stream_id && !self.streams.contains_key(&stream_id) {
            trace!(%stream_id, "ignoring PRIORITY for a finished stream");
            return Ok(());
        }
        self.apply_priority(stream_id, spec);
        Ok(())
    }

    fn apply_priority(&mut self, stream_id: StreamId, spec: PrioritySpec) {
        let depends_on = Some(spec.stream_dependency);
        let weight = spec.effective_weight();
        debug!(%stream_id, ?depends_on, %weight, exclusive = spec.exclusive, "reprioritizing");

        match self
            .priority
            .reprioritize(stream_id, depends_on, weight, spec.exclusive)
        {
            Ok(()) => {}
            Err(PriorityError::MissingStream(_)) => {
                // not opened yet: remember where it goes, it has nothing to send
                match self
                    .priority
                    .insert(stream_id, depends_on, weight, spec.exclusive)
                {
                    Ok(()) => self.priority.block(stream_id),
                    Err(e) => debug!(%stream_id, %e, "could not add stream to the priority tree"),
                }
            }
            Err(e) => debug!(%stream_id, %e, "could not reprioritize stream"),
        }
    }

    fn process_settings(&mut self, settings: &[(Setting, u32)]) -> Result<(), H2ErrorLevel> {
        for &(setting, value) in settings {
            debug!(?setting, %value, "applying peer setting");
            self.peer_settings
                .apply(setting, value)
                .map_err(H2ConnectionError::BadSettingValue)?;

            match setting {
                Setting::InitialWindowSize => self.apply_initial_window_size(value)?,
                Setting::HeaderTableSize => self.hpack_enc.set_max_table_size(value as usize),
                _ => {}
            }
        }

        self.queue_control(H2Frame::Settings {
            ack: true,
            settings: vec![],
        });
        Ok(())
    }

    /// cf. https://httpwg.org/specs/rfc9113.html#InitialWindowSize
    fn apply_initial_window_size(&mut self, value: u32) -> Result<(), H2ErrorLevel> {
        for (stream_id, stream) in self.streams.iter_mut() {
            stream.outbound.apply_initial_delta(value).map_err(|_| {
                H2ConnectionError::StreamWindowSizeOverflowDueToSettings {
                    stream_id: *stream_id,
                }
            })?;
        }

        for (stream_id, stream) in self.streams.iter_mut() {
            if stream.outbound.available() > 0 && !stream.queue.is_empty() {
                self.priority.unblock(*stream_id);
            }
            stream.window_updated(remaining_outbound_window(&self.outbound_window, stream));
        }
        Ok(())
    }

    fn process_window_update(
        &mut self,
        stream_id: StreamId,
        increment: u32,
    ) -> Result<(), H2ErrorLevel> {
        if stream_id.is_connection() {
            if increment == 0 {
                return Err(H2ConnectionError::WindowUpdateZeroIncrement.into());
            }
            self.outbound_window
                .increment(increment)
                .map_err(|_| H2ConnectionError::WindowUpdateOverflow)?;
            trace!(%increment, available = self.outbound_window.available(), "connection window updated");

            for (id, stream) in self.streams.iter_mut() {
                if !stream.queue.is_empty() {
                    self.priority.unblock(*id);
                }
                stream.window_updated(remaining_outbound_window(&self.outbound_window, stream));
            }
            return Ok(());
        }

        self.check_not_idle(stream_id, "WINDOW_UPDATE")?;
        let Some(stream) = self.streams.get_mut(&stream_id) else {
            trace!(%stream_id, "ignoring WINDOW_UPDATE for a finished stream");
            return Ok(());
        };
        if increment == 0 {
            return Err(H2ErrorLevel::Stream(
                stream_id,
                H2StreamError::WindowUpdateZeroIncrement,
            ));
        }
        stream
            .outbound
            .increment(increment)
            .map_err(|_| H2ErrorLevel::Stream(stream_id, H2StreamError::WindowUpdateOverflow))?;
        trace!(%stream_id, %increment, available = stream.outbound.available(), "stream window updated");

        if !stream.queue.is_empty() {
            self.priority.unblock(stream_id);
        }
        stream.window_updated(remaining_outbound_window(&self.outbound_window, stream));
        Ok(())
    }

    fn check_not_idle(
        &self,
        stream_id: StreamId,
        frame_type: &'static str,
    ) -> Result<(), H2ErrorLevel> {
        if stream_id > self.last_stream_id {
            return Err(H2ConnectionError::FrameForIdleStream {
                frame_type,
                stream_id,
            }
            .into());
        }
        Ok(())
    }

    fn handle_event(&mut self, ev: H2Event) {
        let stream_id = ev.stream_id;
        if !self.streams.contains_key(&stream_id) {
            trace!(%stream_id, ev = ?ev.payload, "ignoring event for a finished stream");
            return;
        }
        trace!(%stream_id, ev = ?ev.payload, "handling event");

        match ev.payload {
            H2EventPayload::Headers { status, headers } => {
                self.write_headers(stream_id, status, &headers)
            }
            H2EventPayload::BodyChunk(chunk) => {
                self.ensure_headers_sent(stream_id);
                self.write_data(stream_id, chunk);
            }
            H2EventPayload::BodyEnd => {
                self.ensure_headers_sent(stream_id);
                self.end_response(stream_id);
            }
            H2EventPayload::Abort => {
                let reason = StreamError::ResetLocally(KnownErrorCode::Cancel.into());
                self.abort_request(stream_id, reason)
            }
            H2EventPayload::BadRequest => self.respond_bad_request(stream_id),
            H2EventPayload::RegisterProducer => {
                if let Some(stream) = self.streams.get_mut(&stream_id) {
                    stream.producer = ProducerState::Producing;
                }
            }
            H2EventPayload::UnregisterProducer => {
                if let Some(stream) = self.streams.get_mut(&stream_id) {
                    stream.producer = ProducerState::None;
                }
            }
            H2EventPayload::PauseIngest => {
                if let Some(stream) = self.streams.get_mut(&stream_id) {
                    if stream.ingest == IngestState::Producing {
                        stream.ingest = IngestState::Paused;
                    }
                }
            }
            H2EventPayload::ResumeIngest => self.resume_ingest(stream_id),
            H2EventPayload::StopIngest => {
                if let Some(stream) = self.streams.get_mut(&stream_id) {
                    stream.ingest = IngestState::Stopped;
                }
                self.abort_request(stream_id, StreamError::ProducingStopped);
            }
        }
    }

    fn write_headers(&mut self, stream_id: StreamId, status: StatusCode, headers: &HeaderMap) {
        let Some(stream) = self.streams.get_mut(&stream_id) else {
            return;
        };
        if stream.headers_sent || !stream.state.can_send() {
            debug!(%stream_id, "response headers already sent, ignoring");
            return;
        }
        stream.headers_sent = true;

        debug!(%stream_id, %status, "sending response headers");
        let block = self.encode_headers(status, headers);
        self.queue_header_frames(stream_id, block, false);
        self.try_to_write_control_data();
    }

    fn ensure_headers_sent(&mut self, stream_id: StreamId) {
        if self.streams.get(&stream_id).is_some_and(|s| !s.headers_sent) {
            self.write_headers(stream_id, StatusCode::OK, &HeaderMap::new());
        }
    }

    fn write_data(&mut self, stream_id: StreamId, chunk: Bytes) {
        let Some(stream) = self.streams.get_mut(&stream_id) else {
            return;
        };
        if stream.has_end_queued() || !stream.state.can_send() {
            debug!(%stream_id, "response body written after finish, ignoring");
            return;
        }

        stream.queue.push_back(OutboundChunk::Data(chunk));
        if self.outbound_window.available().min(stream.outbound.available()) > 0 {
            self.priority.unblock(stream_id);
        }
        if remaining_outbound_window(&self.outbound_window, stream) <= 0 {
            stream.flow_control_blocked();
        }
    }

    fn end_response(&mut self, stream_id: StreamId) {
        let Some(stream) = self.streams.get_mut(&stream_id) else {
            return;
        };
        if stream.has_end_queued() || !stream.state.can_send() {
            return;
        }
        stream.queue.push_back(OutboundChunk::End);
        self.priority.unblock(stream_id);
    }

    /// Resets the stream with CANCEL, unless the control frame buffer is
    /// already full, in which case the whole connection goes.
    fn abort_request(&mut self, stream_id: StreamId, reason: StreamError) {
        debug!(%stream_id, ?reason, "aborting stream");
        self.queue_control(H2Frame::RstStream {
            stream_id,
            error_code: KnownErrorCode::Cancel.into(),
        });
        if self.try_to_write_control_data() {
            self.remove_failed_stream(stream_id, StreamEvent::SendReset, reason);
            self.try_to_write_control_data();
        }
    }

    fn respond_bad_request(&mut self, stream_id: StreamId) {
        let Some(stream) = self.streams.get_mut(&stream_id) else {
            return;
        };
        if stream.headers_sent {
            self.abort_request(stream_id, StreamError::BadRequest);
            return;
        }
        stream.headers_sent = true;

        debug!(%stream_id, "responding with 400 and closing stream");
        let block = self.encode_headers(StatusCode::BAD_REQUEST, &HeaderMap::new());
        self.queue_header_frames(stream_id, block, true);
        if self.try_to_write_control_data() {
            self.remove_failed_stream(
                stream_id,
                StreamEvent::SendEndStream,
                StreamError::BadRequest,
            );
            self.try_to_write_control_data();
        }
    }

    fn resume_ingest(&mut self, stream_id: StreamId) {
        let Some(stream) = self.streams.get_mut(&stream_id) else {
            return;
        };
        if stream.ingest != IngestState::Paused {
            return;
        }
        stream.ingest = IngestState::Producing;

        let mut consumed = 0u32;
        loop {
            let Some(stream) = self.streams.get_mut(&stream_id) else {
                break;
            };
            let Some(n) = stream.deliver_buffered() else {
                break;
            };
            consumed += n;
            // the collaborator may pause again from inside the callback
            self.handle_events();
        }

        trace!(%stream_id, %consumed, "resumed ingest");
        self.acknowledge_received_data(stream_id, consumed);
        self.finish_if_closed(stream_id);
        self.try_to_write_control_data();
    }

    /// END_STREAM went out. The stream stays around if the peer is still
    /// sending its request body.
    fn request_done(&mut self, stream_id: StreamId) {
        let _ = self.priority.remove(stream_id);
        let Some(stream) = self.streams.get_mut(&stream_id) else {
            return;
        };
        let _ = stream.apply(StreamEvent::SendEndStream);
        if stream.state == StreamState::HalfClosedLocal {
            debug!(%stream_id, "response done, request body still incoming");
            stream.producer = ProducerState::None;
            return;
        }

        if let Some(mut stream) = self.streams.remove(&stream_id) {
            // ingest may still be paused on the tail of the request
            let discarded = stream.discard_inbound();
            stream.finish(Ok(stream_id));
            if discarded > 0 {
                self.ack_connection_window(discarded);
                self.try_to_write_control_data();
            }
        }
    }

    /// Drops a stream once both sides are done and the collaborator has
    /// seen everything.
    fn finish_if_closed(&mut self, stream_id: StreamId) {
        let done = self.streams.get(&stream_id).is_some_and(|s| {
            s.state == StreamState::Closed && s.inbound_buffer.is_empty()
        });
        if !done {
            return;
        }
        if let Some(mut stream) = self.streams.remove(&stream_id) {
            debug!(%stream_id, "stream closed");
            stream.finish(Ok(stream_id));
        }
        let _ = self.priority.remove(stream_id);
    }

    /// Removes a stream that ended badly. Request body it never delivered
    /// still counts against the connection window, so it's acknowledged
    /// there.
    fn remove_failed_stream(&mut self, stream_id: StreamId, event: StreamEvent, error: StreamError) {
        if let Some(mut stream) = self.streams.remove(&stream_id) {
            let _ = stream.apply(event);
            let discarded = stream.fail(error);
            if discarded > 0 {
                trace!(%stream_id, %discarded, "acknowledging undelivered request body");
                self.ack_connection_window(discarded);
            }
        }
        let _ = self.priority.remove(stream_id);
    }

    fn reset_stream(&mut self, stream_id: StreamId, e: H2StreamError) {
        let error_code: ErrorCode = e.as_known_error_code().into();
        debug!(%stream_id, %e, ?error_code, "stream error, sending RST_STREAM");

        self.queue_control(H2Frame::RstStream {
            stream_id,
            error_code,
        });
        self.remove_failed_stream(
            stream_id,
            StreamEvent::SendReset,
            StreamError::ResetLocally(error_code),
        );
    }

    fn connection_error(&mut self, e: H2ConnectionError) {
        let error_code: ErrorCode = e.as_known_error_code().into();
        debug!(%e, ?error_code, last_stream_id = %self.last_stream_id, "connection error, sending GOAWAY");

        self.queue_control(H2Frame::GoAway(GoAway {
            last_stream_id: self.last_stream_id,
            error_code,
            additional_debug_data: e.to_string().into(),
        }));
        if self.try_to_write_control_data() {
            self.transport.lose_connection();
            self.lose(StreamError::ProtocolError(error_code), false);
        }
    }

    fn timeout_connection(&mut self, now: Instant) {
        let error_code: ErrorCode = if self.streams.is_empty() {
            KnownErrorCode::NoError.into()
        } else {
            KnownErrorCode::ProtocolError.into()
        };
        info!(peer = ?self.transport.peer(), ?error_code, "timing out client");

        let goaway = H2Frame::GoAway(GoAway {
            last_stream_id: self.last_stream_id,
            error_code,
            additional_debug_data: Bytes::new(),
        });
        // we're closing anyway, backpressure doesn't matter anymore
        let _ = self.transport.write(goaway.to_bytes());

        self.lose(StreamError::IdleTimeout, false);
        self.abort_deadline = self.config.abort_timeout.map(|d| now + d);
        self.transport.lose_connection();
    }

    fn lose(&mut self, reason: StreamError, cancel_timeouts: bool) {
        debug!(?reason, %cancel_timeouts, streams = self.streams.len(), "connection lost");
        self.still_producing = false;
        self.closed = true;

        let mut ids: Vec<_> = self.streams.keys().copied().collect();
        ids.sort();
        for stream_id in ids {
            if let Some(mut stream) = self.streams.remove(&stream_id) {
                stream.fail(reason.clone());
            }
        }
        self.priority = PriorityTree::new();
        self.pending_headers = None;

        if cancel_timeouts {
            self.idle_deadline = None;
            self.abort_deadline = None;
        }
    }

    /// Acknowledges bytes the collaborator has consumed, on the connection
    /// and on the stream.
    fn acknowledge_received_data(&mut self, stream_id: StreamId, n: u32) {
        if n == 0 {
            return;
        }
        self.ack_connection_window(n);

        let Some(stream) = self.streams.get_mut(&stream_id) else {
            return;
        };
        if !stream.state.can_receive() {
            return;
        }
        if let Some(increment) = stream.inbound.process_bytes(n) {
            trace!(%stream_id, %increment, "opening stream window");
            self.queue_control(H2Frame::WindowUpdate {
                stream_id,
                increment,
            });
        }
    }

    fn ack_connection_window(&mut self, n: u32) {
        if let Some(increment) = self.inbound_window.process_bytes(n) {
            trace!(%increment, "opening connection window");
            self.queue_control(H2Frame::WindowUpdate {
                stream_id: StreamId::CONNECTION,
                increment,
            });
        }
    }

    fn encode_headers(&mut self, status: StatusCode, headers: &HeaderMap) -> Bytes {
        let mut pairs: Vec<(&[u8], &[u8])> = Vec::with_capacity(headers.len() + 1);
        pairs.push((b":status", status.as_str().as_bytes()));
        for (name, value) in headers.iter() {
            if is_connection_specific(name) {
                continue;
            }
            pairs.push((name.as_str().as_bytes(), value.as_bytes()));
        }

        let mut block = Vec::new();
        if let Err(e) = self.hpack_enc.encode_into(pairs, &mut block) {
            warn!(%e, "could not encode response headers");
        }
        block.into()
    }

    /// Queues a header block on the control path, split into CONTINUATION
    /// frames if it's larger than the peer's max frame size.
    fn queue_header_frames(&mut self, stream_id: StreamId, mut block: Bytes, end_stream: bool) {
        let max = self.peer_settings.max_frame_size as usize;

        let rest = block.split_off(block.len().min(max));
        self.queue_control(H2Frame::Headers {
            stream_id,
            end_stream,
            end_headers: rest.is_empty(),
            priority: None,
            fragment: block,
            padding: None,
        });

        let mut rest = rest;
        while !rest.is_empty() {
            let fragment = rest.split_to(rest.len().min(max));
            self.queue_control(H2Frame::Continuation {
                stream_id,
                end_headers: rest.is_empty(),
                fragment,
            });
        }
    }

    fn queue_control(&mut self, frame: H2Frame) {
        trace!(frame_type = frame.name(), stream_id = %frame.stream_id(), "> (control)");
        frame.encode(&mut self.control_out);
    }

    /// Writes pending control frames, or holds them back while the
    /// transport is paused. Returns false if that tripped the buffering
    /// limit and the connection was aborted.
    fn try_to_write_control_data(&mut self) -> bool {
        if self.closed {
            self.control_out.clear();
            return false;
        }
        if self.control_out.is_empty() {
            return true;
        }

        let data = self.control_out.split().freeze();
        if !self.paused && self.buffered_control_frames.is_empty() {
            self.write_to_transport(data);
            return true;
        }

        self.buffered_control_frame_bytes += data.len();
        self.buffered_control_frames.push_back(data);
        if self.buffered_control_frame_bytes >= self.config.max_buffered_control_frame_bytes {
            warn!(
                peer = ?self.transport.peer(),
                buffered = self.buffered_control_frame_bytes,
                max = self.config.max_buffered_control_frame_bytes,
                "too many control frames buffered while paused, aborting connection"
            );
            self.buffered_control_frames.clear();
            self.buffered_control_frame_bytes = 0;
            self.transport.abort_connection();
            self.lose(StreamError::ExcessiveBuffering, true);
            return false;
        }
        true
    }

    fn write_to_transport(&mut self, data: Bytes) {
        trace!(len = data.len(), ">");
        if self.transport.write(data) == Backpressure::Full {
            self.pause_producing();
        }
    }

    fn reset_idle_timer(&mut self) {
        if self.closed {
            return;
        }
        self.idle_deadline = self.config.timeout.map(|t| Instant::now() + t);
    }
}

/// Room left in the stream's outbound window (bounded by the connection's)
/// once everything already queued goes out.
fn remaining_outbound_window<R: Request>(
    connection: &FlowControlWindow,
    stream: &H2Stream<R>,
) -> i64 {
    let window = connection.available().min(stream.outbound.available());
    window - stream.queued_bytes() as i64
}

/// cf. RFC 9113 section 8.2.2
fn is_connection_specific(name: &HeaderName) -> bool {
    name == header::TRANSFER_ENCODING
        || name == header::CONNECTION
        || name == header::UPGRADE
        || matches!(name.as_str(), "keep-alive" | "proxy-connection")
}
