use std::net::SocketAddr;

use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use skein_h2::StreamId;
use tokio::sync::mpsc;
use tracing::trace;

use super::types::{H2Event, H2EventPayload};

/// A [crate::Request]'s way back into its connection. Every call queues an
/// event that the connection applies on its next turn, in order. Calls made
/// after the stream is gone are ignored.
#[derive(Clone)]
pub struct StreamHandle {
    stream_id: StreamId,
    tx: mpsc::UnboundedSender<H2Event>,
    host: Option<SocketAddr>,
    peer: Option<SocketAddr>,
}

impl std::fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamHandle")
            .field("stream_id", &self.stream_id)
            .finish()
    }
}

impl StreamHandle {
    pub(crate) fn new(
        stream_id: StreamId,
        tx: mpsc::UnboundedSender<H2Event>,
        host: Option<SocketAddr>,
        peer: Option<SocketAddr>,
    ) -> Self {
        Self {
            stream_id,
            tx,
            host,
            peer,
        }
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    /// Sends the response headers. Writing a body chunk first sends a bare
    /// 200 instead.
    pub fn write_headers(&self, status: StatusCode, headers: HeaderMap) {
        self.send(H2EventPayload::Headers { status, headers });
    }

    /// Queues a chunk of response body. It goes out as flow control and
    /// stream priorities allow.
    pub fn write(&self, chunk: impl Into<Bytes>) {
        self.send(H2EventPayload::BodyChunk(chunk.into()));
    }

    /// No more body: END_STREAM goes out after everything queued so far.
    pub fn finish(&self) {
        self.send(H2EventPayload::BodyEnd);
    }

    /// Resets the stream with CANCEL.
    pub fn abort(&self) {
        self.send(H2EventPayload::Abort);
    }

    /// Answers with a bare 400 and ends the stream.
    pub fn respond_bad_request(&self) {
        self.send(H2EventPayload::BadRequest);
    }

    /// Asks to be paused (through [crate::Request::pause_producing]) whenever
    /// the outbound window runs out, and resumed when it opens again.
    pub fn register_producer(&self) {
        self.send(H2EventPayload::RegisterProducer);
    }

    pub fn unregister_producer(&self) {
        self.send(H2EventPayload::UnregisterProducer);
    }

    /// Holds back request body (and its window acknowledgements) until
    /// [Self::resume_ingest].
    pub fn pause_ingest(&self) {
        self.send(H2EventPayload::PauseIngest);
    }

    pub fn resume_ingest(&self) {
        self.send(H2EventPayload::ResumeIngest);
    }

    /// Not interested in the request body anymore: resets the stream.
    pub fn stop_ingest(&self) {
        self.send(H2EventPayload::StopIngest);
    }

    pub fn host(&self) -> Option<SocketAddr> {
        self.host
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    fn send(&self, payload: H2EventPayload) {
        let ev = H2Event {
            stream_id: self.stream_id,
            payload,
        };
        if let Err(e) = self.tx.send(ev) {
            trace!(stream_id = %self.stream_id, ev = ?e.0, "connection is gone, dropping event");
        }
    }
}
