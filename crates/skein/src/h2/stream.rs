use std::collections::VecDeque;

use bytes::Bytes;
use skein_h2::StreamId;
use tokio::sync::oneshot;
use tracing::debug;

use super::{
    flow::{FlowControlWindow, ReceiveWindow},
    types::{H2StreamError, HeaderList, StreamError, StreamOutcome},
    Request,
};

// cf. RFC 9113, 5.1 Stream States:
//
//                          +--------+
//                          |        |
//                          |  idle  |
//                          |        |
//                          +--------+
//                              |
//                              | recv H
//                              v
//                          +--------+
//                  recv ES |        | send ES
//                  ,-------+  open  +-------.
//                 /        |        |        \
//                v         +---+----+         v
//         +----------+         |          +----------+
//         |   half-  |         |          |   half-  |
//         |  closed  |         | send R / |  closed  |
//         | (remote) |         | recv R   | (local)  |
//         +----+-----+         |          +-----+----+
//              | send ES /     v      recv ES / |
//              `---------->+--------+<----------'
//                          | closed |
//                          +--------+
//
// Push isn't supported, so the reserved states never happen. A reset is
// tracked apart from a clean close so late frames can be told apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Idle,
    Open,
    HalfClosedLocal,
    HalfClosedRemote,
    Closed,
    Reset,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEvent {
    RecvHeaders,
    RecvEndStream,
    SendEndStream,
    RecvReset,
    SendReset,
}

#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
#[error("invalid stream transition: {event:?} in state {state:?}")]
pub struct InvalidTransition {
    pub state: StreamState,
    pub event: StreamEvent,
}

impl StreamState {
    pub fn is_terminal(self) -> bool {
        matches!(self, StreamState::Closed | StreamState::Reset)
    }

    /// Whether the peer may still send DATA
    pub fn can_receive(self) -> bool {
        matches!(self, StreamState::Open | StreamState::HalfClosedLocal)
    }

    /// Whether we may still send HEADERS or DATA
    pub fn can_send(self) -> bool {
        matches!(self, StreamState::Open | StreamState::HalfClosedRemote)
    }

    pub fn transition(self, event: StreamEvent) -> Result<StreamState, InvalidTransition> {
        use StreamEvent as E;
        use StreamState as S;

        let next = match (self, event) {
            (S::Idle, E::RecvHeaders) => S::Open,
            (S::Open, E::RecvEndStream) => S::HalfClosedRemote,
            (S::Open, E::SendEndStream) => S::HalfClosedLocal,
            (S::HalfClosedLocal, E::RecvEndStream) => S::Closed,
            (S::HalfClosedRemote, E::SendEndStream) => S::Closed,
            (S::Idle | S::Open | S::HalfClosedLocal | S::HalfClosedRemote, E::RecvReset | E::SendReset) => {
                S::Reset
            }
            (state, event) => return Err(InvalidTransition { state, event }),
        };
        Ok(next)
    }
}

/// A chunk of response queued for the sending loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum OutboundChunk {
    Data(Bytes),
    End,
}

/// A chunk of request body held back while ingest is paused
#[derive(Debug)]
pub(crate) enum InboundChunk {
    Data { data: Bytes, flow_len: u32 },
    Trailers(HeaderList),
    End,
}

/// Whether the collaborator wants request body delivered right now
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum IngestState {
    Producing,
    Paused,
    Stopped,
}

/// Response producer registration, as far as flow control is concerned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ProducerState {
    None,
    Producing,
    Paused,
}

pub(crate) struct H2Stream<R> {
    pub(crate) id: StreamId,
    pub(crate) state: StreamState,
    pub(crate) request: R,

    /// What we may still send to the peer on this stream
    pub(crate) outbound: FlowControlWindow,
    /// What the peer may still send us on this stream
    pub(crate) inbound: ReceiveWindow,

    pub(crate) queue: VecDeque<OutboundChunk>,
    pub(crate) producer: ProducerState,

    pub(crate) ingest: IngestState,
    pub(crate) inbound_buffer: VecDeque<InboundChunk>,

    pub(crate) content_length: Option<u64>,
    pub(crate) received_len: u64,
    pub(crate) headers_sent: bool,

    cleanup: Option<oneshot::Sender<StreamOutcome>>,
}

impl<R: Request> H2Stream<R> {
    pub(crate) fn new(
        id: StreamId,
        request: R,
        cleanup: oneshot::Sender<StreamOutcome>,
        outbound_window: u32,
        inbound_window: u32,
    ) -> Self {
        Self {
            id,
            state: StreamState::Idle,
            request,
            outbound: FlowControlWindow::new(outbound_window),
            inbound: ReceiveWindow::new(inbound_window),
            queue: Default::default(),
            producer: ProducerState::None,
            ingest: IngestState::Producing,
            inbound_buffer: Default::default(),
            content_length: None,
            received_len: 0,
            headers_sent: false,
            cleanup: Some(cleanup),
        }
    }

    pub(crate) fn apply(&mut self, event: StreamEvent) -> Result<(), InvalidTransition> {
        let next = self.state.transition(event)?;
        debug!(stream_id = %self.id, from = ?self.state, to = ?next, "stream transition");
        self.state = next;
        Ok(())
    }

    /// Bytes of DATA queued but not sent yet
    pub(crate) fn queued_bytes(&self) -> usize {
        self.queue
            .iter()
            .map(|c| match c {
                OutboundChunk::Data(d) => d.len(),
                OutboundChunk::End => 0,
            })
            .sum()
    }

    pub(crate) fn has_end_queued(&self) -> bool {
        self.queue.iter().any(|c| *c == OutboundChunk::End)
    }

    /// Tracks received body length against the announced content-length.
    pub(crate) fn count_body_bytes(&mut self, n: usize, end_stream: bool) -> Result<(), H2StreamError> {
        self.received_len += n as u64;
        if let Some(content_length) = self.content_length {
            if self.received_len > content_length
                || (end_stream && self.received_len != content_length)
            {
                return Err(H2StreamError::DataLengthDoesNotMatchContentLength {
                    data_length: self.received_len,
                    content_length,
                });
            }
        }
        Ok(())
    }

    /// Hands a body chunk to the collaborator, or buffers it while ingest is
    /// paused. Returns the number of bytes that can be acknowledged now.
    pub(crate) fn receive_data_chunk(&mut self, data: Bytes, flow_len: u32) -> u32 {
        match self.ingest {
            IngestState::Producing => {
                self.request.data_received(data);
                flow_len
            }
            IngestState::Paused => {
                self.inbound_buffer.push_back(InboundChunk::Data { data, flow_len });
                0
            }
            IngestState::Stopped => 0,
        }
    }

    pub(crate) fn receive_trailers(&mut self, trailers: HeaderList) {
        match self.ingest {
            IngestState::Producing => self.request.trailers_received(trailers),
            IngestState::Paused => self.inbound_buffer.push_back(InboundChunk::Trailers(trailers)),
            IngestState::Stopped => {}
        }
    }

    /// The peer has sent everything.
    pub(crate) fn request_complete(&mut self) {
        match self.ingest {
            IngestState::Producing => self.request.request_complete(),
            IngestState::Paused => self.inbound_buffer.push_back(InboundChunk::End),
            IngestState::Stopped => {}
        }
    }

    /// Delivers one buffered chunk if ingest is producing. Returns `None`
    /// when nothing was delivered, otherwise the bytes to acknowledge.
    pub(crate) fn deliver_buffered(&mut self) -> Option<u32> {
        if self.ingest != IngestState::Producing {
            return None;
        }
        match self.inbound_buffer.pop_front()? {
            InboundChunk::Data { data, flow_len } => {
                self.request.data_received(data);
                Some(flow_len)
            }
            InboundChunk::Trailers(trailers) => {
                self.request.trailers_received(trailers);
                Some(0)
            }
            InboundChunk::End => {
                self.request.request_complete();
                Some(0)
            }
        }
    }

    /// The outbound window is exhausted: ask a registered producer to pause.
    pub(crate) fn flow_control_blocked(&mut self) {
        if self.producer == ProducerState::Producing {
            self.producer = ProducerState::Paused;
            self.request.pause_producing();
        }
    }

    /// The outbound window opened: resume a paused producer if there's room.
    pub(crate) fn window_updated(&mut self, remaining: i64) {
        if self.producer == ProducerState::Paused && remaining > 0 {
            self.producer = ProducerState::Producing;
            self.request.resume_producing();
        }
    }

    /// Fires the cleanup notification. Only the first call has any effect.
    pub(crate) fn finish(&mut self, outcome: StreamOutcome) {
        let Some(cleanup) = self.cleanup.take() else {
            return;
        };
        if let Err(e) = &outcome {
            self.request.connection_lost(e);
        }
        // the collaborator may have stopped listening, which is fine
        let _ = cleanup.send(outcome);
    }

    /// Drops request body held back by paused ingest. Returns its flow
    /// controlled length, which was never acknowledged.
    pub(crate) fn discard_inbound(&mut self) -> u32 {
        self.inbound_buffer
            .drain(..)
            .map(|chunk| match chunk {
                InboundChunk::Data { flow_len, .. } => flow_len,
                InboundChunk::Trailers(_) | InboundChunk::End => 0,
            })
            .sum()
    }

    /// Fails the stream: resets its state, drops queued output and notifies
    /// the collaborator. Returns the unacknowledged length of any request
    /// body that was dropped.
    pub(crate) fn fail(&mut self, error: StreamError) -> u32 {
        if !self.state.is_terminal() {
            self.state = StreamState::Reset;
        }
        self.queue.clear();
        let discarded = self.discard_inbound();
        self.finish(Err(error));
        discarded
    }
}
