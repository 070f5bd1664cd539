use bytes::{Buf, Bytes, BytesMut};
use tracing::trace;

use crate::{
    DataFlags, FrameHeader, FrameType, GoAway, H2Frame, HeadersFlags, KnownErrorCode, PingFlags,
    PrioritySpec, PushPromiseFlags, RstStream, Settings, SettingsFlags, StreamId, WindowUpdate,
    ContinuationFlags, FRAME_HEADER_LEN, PREFACE,
};

/// Something went wrong while decoding a frame. Unless [FrameError::stream_scoped]
/// returns a stream, the error is fatal to the connection.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("client did not send a valid connection preface")]
    InvalidPreface,

    #[error("{frame_type} frame of {len} bytes exceeds max frame size {max}")]
    FrameTooLarge {
        frame_type: &'static str,
        len: u32,
        max: u32,
    },

    #[error("{frame_type} frame on stream {stream_id} has invalid length {len}")]
    InvalidLength {
        frame_type: &'static str,
        stream_id: StreamId,
        len: u32,
    },

    #[error("{frame_type} frame must not be sent on stream 0")]
    StreamIdZero { frame_type: &'static str },

    #[error("{frame_type} frame must be sent on stream 0, got stream {stream_id}")]
    StreamIdNonZero {
        frame_type: &'static str,
        stream_id: StreamId,
    },

    #[error("{frame_type} frame has padding length {padding} but payload is only {len} bytes")]
    PaddingTooLarge {
        frame_type: &'static str,
        padding: u8,
        len: u32,
    },

    #[error("SETTINGS frame with ACK flag has a payload of {len} bytes")]
    SettingsAckWithPayload { len: u32 },
}

impl FrameError {
    pub fn as_known_error_code(&self) -> KnownErrorCode {
        match self {
            FrameError::InvalidPreface => KnownErrorCode::ProtocolError,
            FrameError::FrameTooLarge { .. } => KnownErrorCode::FrameSizeError,
            FrameError::InvalidLength { .. } => KnownErrorCode::FrameSizeError,
            FrameError::StreamIdZero { .. } => KnownErrorCode::ProtocolError,
            FrameError::StreamIdNonZero { .. } => KnownErrorCode::ProtocolError,
            FrameError::PaddingTooLarge { .. } => KnownErrorCode::ProtocolError,
            FrameError::SettingsAckWithPayload { .. } => KnownErrorCode::FrameSizeError,
        }
    }

    /// Returns the stream this error is confined to, if it doesn't need to
    /// tear down the whole connection.
    pub fn stream_scoped(&self) -> Option<StreamId> {
        match self {
            // cf. https://httpwg.org/specs/rfc9113.html#PRIORITY
            FrameError::InvalidLength {
                frame_type: "PRIORITY",
                stream_id,
                ..
            } => Some(*stream_id),
            _ => None,
        }
    }
}

/// Incremental frame decoder: feed it bytes as they arrive, then pull
/// complete frames out of it.
pub struct FrameDecoder {
    buf: BytesMut,

    /// Number of preface bytes still expected
    preface_remaining: usize,

    /// Largest frame payload we accept
    max_frame_size: u32,
}

impl FrameDecoder {
    /// A decoder that expects the client connection preface before any frame.
    pub fn server() -> Self {
        Self {
            buf: Default::default(),
            preface_remaining: PREFACE.len(),
            max_frame_size: Settings::default().max_frame_size,
        }
    }

    /// A decoder that reads frames straight away (no preface).
    pub fn client() -> Self {
        Self {
            preface_remaining: 0,
            ..Self::server()
        }
    }

    pub fn set_max_frame_size(&mut self, max_frame_size: u32) {
        self.max_frame_size = max_frame_size;
    }

    pub fn max_frame_size(&self) -> u32 {
        self.max_frame_size
    }

    /// Appends bytes to the decode buffer.
    pub fn feed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Number of buffered bytes that haven't been decoded yet.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Decodes the next complete frame, if any. The bytes of a rejected
    /// frame are consumed before its error is returned.
    pub fn decode(&mut self) -> Result<Option<H2Frame>, FrameError> {
        if self.preface_remaining > 0 {
            let offset = PREFACE.len() - self.preface_remaining;
            let n = self.buf.len().min(self.preface_remaining);
            if self.buf[..n] != PREFACE[offset..offset + n] {
                self.buf.clear();
                return Err(FrameError::InvalidPreface);
            }
            self.buf.advance(n);
            self.preface_remaining -= n;
            if self.preface_remaining > 0 {
                return Ok(None);
            }
            trace!("read connection preface");
        }

        // the header parser only ever fails with `Incomplete`
        let Ok((_, header)) = FrameHeader::parse(&self.buf[..]) else {
            return Ok(None);
        };

        if header.len > self.max_frame_size {
            self.buf.clear();
            return Err(FrameError::FrameTooLarge {
                frame_type: header.frame_type.name(),
                len: header.len,
                max: self.max_frame_size,
            });
        }

        let total = FRAME_HEADER_LEN + header.len as usize;
        if self.buf.len() < total {
            return Ok(None);
        }

        let mut payload = self.buf.split_to(total).freeze();
        payload.advance(FRAME_HEADER_LEN);
        trace!(?header, "decoded frame header");

        parse_frame(header, payload).map(Some)
    }
}

fn parse_frame(header: FrameHeader, payload: Bytes) -> Result<H2Frame, FrameError> {
    let name = header.frame_type.name();
    let stream_id = header.stream_id;
    let len = header.len;

    let invalid_length = || FrameError::InvalidLength {
        frame_type: name,
        stream_id,
        len,
    };
    let require_stream = || {
        if stream_id.is_connection() {
            Err(FrameError::StreamIdZero { frame_type: name })
        } else {
            Ok(())
        }
    };
    let require_connection = || {
        if stream_id.is_connection() {
            Ok(())
        } else {
            Err(FrameError::StreamIdNonZero {
                frame_type: name,
                stream_id,
            })
        }
    };

    let frame = match header.frame_type {
        FrameType::Data(flags) => {
            require_stream()?;
            let (data, padding) = strip_padding(name, payload, flags.contains(DataFlags::Padded))?;
            H2Frame::Data {
                stream_id,
                end_stream: flags.contains(DataFlags::EndStream),
                data,
                padding,
            }
        }
        FrameType::Headers(flags) => {
            require_stream()?;
            let (mut fragment, padding) =
                strip_padding(name, payload, flags.contains(HeadersFlags::Padded))?;
            let priority = if flags.contains(HeadersFlags::Priority) {
                let Ok((_, spec)) = PrioritySpec::parse(&fragment[..]) else {
                    return Err(invalid_length());
                };
                fragment.advance(PrioritySpec::WIRE_LEN);
                Some(spec)
            } else {
                None
            };
            H2Frame::Headers {
                stream_id,
                end_stream: flags.contains(HeadersFlags::EndStream),
                end_headers: flags.contains(HeadersFlags::EndHeaders),
                priority,
                fragment,
                padding,
            }
        }
        FrameType::Priority => {
            require_stream()?;
            if payload.len() != PrioritySpec::WIRE_LEN {
                return Err(invalid_length());
            }
            let Ok((_, spec)) = PrioritySpec::parse(&payload[..]) else {
                return Err(invalid_length());
            };
            H2Frame::Priority { stream_id, spec }
        }
        FrameType::RstStream => {
            require_stream()?;
            if payload.len() != 4 {
                return Err(invalid_length());
            }
            let Ok((_, rst)) = RstStream::parse(&payload[..]) else {
                return Err(invalid_length());
            };
            H2Frame::RstStream {
                stream_id,
                error_code: rst.error_code,
            }
        }
        FrameType::Settings(flags) => {
            require_connection()?;
            let ack = flags.contains(SettingsFlags::Ack);
            if ack && !payload.is_empty() {
                return Err(FrameError::SettingsAckWithPayload { len });
            }
            if payload.len() % 6 != 0 {
                return Err(invalid_length());
            }
            let mut settings = Vec::with_capacity(payload.len() / 6);
            Settings::parse::<()>(&payload[..], |id, value| {
                settings.push((id, value));
                Ok(())
            })
            .map_err(|_| invalid_length())?;
            H2Frame::Settings { ack, settings }
        }
        FrameType::PushPromise(flags) => {
            require_stream()?;
            let (mut fragment, _padding) =
                strip_padding(name, payload, flags.contains(PushPromiseFlags::Padded))?;
            if fragment.len() < 4 {
                return Err(invalid_length());
            }
            let promised = fragment.get_u32() & 0x7FFF_FFFF;
            H2Frame::PushPromise {
                stream_id,
                promised_stream_id: StreamId(promised),
                end_headers: flags.contains(PushPromiseFlags::EndHeaders),
                fragment,
            }
        }
        FrameType::Ping(flags) => {
            require_connection()?;
            let Ok(payload) = <[u8; 8]>::try_from(&payload[..]) else {
                return Err(invalid_length());
            };
            H2Frame::Ping {
                ack: flags.contains(PingFlags::Ack),
                payload,
            }
        }
        FrameType::GoAway => {
            require_connection()?;
            if payload.len() < 8 {
                return Err(invalid_length());
            }
            let Ok((_, goaway)) = GoAway::parse(&payload[..]) else {
                return Err(invalid_length());
            };
            H2Frame::GoAway(goaway)
        }
        FrameType::WindowUpdate => {
            if payload.len() != 4 {
                return Err(invalid_length());
            }
            let Ok((_, update)) = WindowUpdate::parse(&payload[..]) else {
                return Err(invalid_length());
            };
            H2Frame::WindowUpdate {
                stream_id,
                increment: update.increment,
            }
        }
        FrameType::Continuation(flags) => {
            require_stream()?;
            H2Frame::Continuation {
                stream_id,
                end_headers: flags.contains(ContinuationFlags::EndHeaders),
                fragment: payload,
            }
        }
        FrameType::Unknown(ft) => H2Frame::Unknown {
            stream_id,
            ty: ft.ty,
            payload,
        },
    };

    Ok(frame)
}

/// Removes the padding from a PADDED frame payload.
/// cf. https://httpwg.org/specs/rfc9113.html#DATA
fn strip_padding(
    frame_type: &'static str,
    mut payload: Bytes,
    padded: bool,
) -> Result<(Bytes, Option<u8>), FrameError> {
    if !padded {
        return Ok((payload, None));
    }

    let len = payload.len() as u32;
    if payload.is_empty() {
        return Err(FrameError::PaddingTooLarge {
            frame_type,
            padding: 0,
            len,
        });
    }

    let padding = payload.get_u8();
    if padding as usize > payload.len() {
        return Err(FrameError::PaddingTooLarge {
            frame_type,
            padding,
            len,
        });
    }
    payload.truncate(payload.len() - padding as usize);
    Ok((payload, Some(padding)))
}
