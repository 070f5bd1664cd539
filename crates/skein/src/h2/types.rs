use std::fmt;

use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use loona_hpack::decoder::DecoderError;
use skein_h2::{ErrorCode, FrameError, KnownErrorCode, SettingsError, StreamId};

/// A decoded header block: ordered name/value pairs, pseudo-headers included.
pub type HeaderList = Vec<(Bytes, Bytes)>;

/// How a stream's life ended, as delivered on its cleanup channel.
pub type StreamOutcome = Result<StreamId, StreamError>;

/// Why a stream ended without completing normally. Collaborators get
/// exactly one of these (or a clean finish) per stream.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    #[error("stream reset by peer with code {0:?}")]
    ResetByPeer(ErrorCode),

    #[error("stream reset locally with code {0:?}")]
    ResetLocally(ErrorCode),

    #[error("peer sent GOAWAY with code {0:?}")]
    GoAway(ErrorCode),

    #[error("connection timed out")]
    IdleTimeout,

    #[error("connection lost")]
    ConnectionLost,

    #[error("connection closed due to a protocol error: {0:?}")]
    ProtocolError(ErrorCode),

    #[error("too many control frames buffered, connection aborted")]
    ExcessiveBuffering,

    #[error("stream stopped producing")]
    ProducingStopped,

    #[error("invalid request")]
    BadRequest,
}

/// An error that either tears down the whole connection or just one stream.
#[derive(Debug, thiserror::Error)]
pub enum H2ErrorLevel {
    #[error("connection error: {0}")]
    Connection(#[from] H2ConnectionError),

    #[error("stream {0} error: {1}")]
    Stream(StreamId, H2StreamError),
}

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum H2ConnectionError {
    #[error("error decoding frame: {0}")]
    Frame(#[from] FrameError),

    #[error("hpack decoding error: {0:?}")]
    HpackDecodingError(DecoderError),

    #[error("on stream {stream_id}, expected continuation frame, but got {frame_type}")]
    ExpectedContinuationFrame {
        stream_id: StreamId,
        frame_type: &'static str,
    },

    #[error("received unexpected continuation frame on stream {stream_id}")]
    UnexpectedContinuationFrame { stream_id: StreamId },

    #[error("client sent a push promise frame, clients aren't allowed to do that, cf. RFC9113 section 8.4")]
    ClientSentPushPromise,

    #[error("client tried to initiate an even-numbered stream {stream_id}")]
    ClientSidShouldBeOdd { stream_id: StreamId },

    #[error("received {frame_type} frame for idle stream {stream_id}")]
    FrameForIdleStream {
        frame_type: &'static str,
        stream_id: StreamId,
    },

    #[error("zero increment in connection window update frame")]
    WindowUpdateZeroIncrement,

    #[error("received connection window update that made the window size overflow")]
    WindowUpdateOverflow,

    #[error("received more data than the connection window allows")]
    WindowUnderflow,

    #[error("initial window size settings update made the window of stream {stream_id} overflow")]
    StreamWindowSizeOverflowDueToSettings { stream_id: StreamId },

    #[error("bad setting value: {0}")]
    BadSettingValue(SettingsError),
}

impl H2ConnectionError {
    pub fn as_known_error_code(&self) -> KnownErrorCode {
        match self {
            H2ConnectionError::Frame(e) => e.as_known_error_code(),
            // compression errors
            H2ConnectionError::HpackDecodingError(_) => KnownErrorCode::CompressionError,
            // flow control errors
            H2ConnectionError::WindowUpdateOverflow => KnownErrorCode::FlowControlError,
            H2ConnectionError::WindowUnderflow => KnownErrorCode::FlowControlError,
            H2ConnectionError::StreamWindowSizeOverflowDueToSettings { .. } => {
                KnownErrorCode::FlowControlError
            }
            H2ConnectionError::BadSettingValue(e) => e.as_known_error_code(),
            _ => KnownErrorCode::ProtocolError,
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum H2StreamError {
    #[error("received {data_length} bytes in data frames but content-length announced {content_length} bytes")]
    DataLengthDoesNotMatchContentLength {
        data_length: u64,
        content_length: u64,
    },

    #[error("refused stream (would exceed max concurrent streams)")]
    RefusedStream,

    #[error("trailers must have EndStream flag set")]
    TrailersNotEndStream,

    #[error("invalid frame: {0}")]
    InvalidFrame(FrameError),

    #[error("stream closed")]
    StreamClosed,

    #[error("received WINDOW_UPDATE that made the window size overflow")]
    WindowUpdateOverflow,

    #[error("zero increment in stream window update frame")]
    WindowUpdateZeroIncrement,

    #[error("received more data than the stream window allows")]
    WindowUnderflow,

    #[error("stream depends on itself")]
    DependsOnItself,

    #[error("bad request: {0}")]
    BadRequest(&'static str),

    #[error("stream reset")]
    Cancel,
}

impl H2StreamError {
    pub fn as_known_error_code(&self) -> KnownErrorCode {
        use H2StreamError::*;
        use KnownErrorCode as Code;

        match self {
            Cancel => Code::Cancel,
            // stream closed error
            StreamClosed => Code::StreamClosed,
            // stream refused error
            RefusedStream => Code::RefusedStream,
            InvalidFrame(e) => e.as_known_error_code(),
            // flow control errors
            WindowUpdateOverflow => Code::FlowControlError,
            WindowUnderflow => Code::FlowControlError,
            _ => Code::ProtocolError,
        }
    }
}

/// Something a [crate::StreamHandle] asked the connection to do.
#[derive(Debug)]
pub(crate) struct H2Event {
    pub(crate) stream_id: StreamId,
    pub(crate) payload: H2EventPayload,
}

pub(crate) enum H2EventPayload {
    Headers {
        status: StatusCode,
        headers: HeaderMap,
    },
    BodyChunk(Bytes),
    BodyEnd,
    Abort,
    BadRequest,
    RegisterProducer,
    UnregisterProducer,
    PauseIngest,
    ResumeIngest,
    StopIngest,
}

impl fmt::Debug for H2EventPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Headers { status, .. } => f.debug_tuple("Headers").field(status).finish(),
            Self::BodyChunk(chunk) => f.debug_tuple("BodyChunk").field(&chunk.len()).finish(),
            Self::BodyEnd => write!(f, "BodyEnd"),
            Self::Abort => write!(f, "Abort"),
            Self::BadRequest => write!(f, "BadRequest"),
            Self::RegisterProducer => write!(f, "RegisterProducer"),
            Self::UnregisterProducer => write!(f, "UnregisterProducer"),
            Self::PauseIngest => write!(f, "PauseIngest"),
            Self::ResumeIngest => write!(f, "ResumeIngest"),
            Self::StopIngest => write!(f, "StopIngest"),
        }
    }
}
