use bytes::{BufMut, Bytes, BytesMut};
use enumflags2::BitFlags;

use crate::{
    write_setting_pairs, ContinuationFlags, DataFlags, ErrorCode, FrameHeader, FrameType, GoAway,
    HeadersFlags, PingFlags, PrioritySpec, PushPromiseFlags, RstStream, Setting, SettingsFlags,
    StreamId, WindowUpdate, FRAME_HEADER_LEN,
};

/// A fully-received HTTP/2 frame, with its payload parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum H2Frame {
    Data {
        stream_id: StreamId,
        end_stream: bool,
        data: Bytes,
        /// Length of the padding, if the PADDED flag was set. The padding
        /// length octet itself counts as one more byte of flow-controlled
        /// payload.
        padding: Option<u8>,
    },
    Headers {
        stream_id: StreamId,
        end_stream: bool,
        end_headers: bool,
        priority: Option<PrioritySpec>,
        fragment: Bytes,
        padding: Option<u8>,
    },
    Priority {
        stream_id: StreamId,
        spec: PrioritySpec,
    },
    RstStream {
        stream_id: StreamId,
        error_code: ErrorCode,
    },
    Settings {
        ack: bool,
        settings: Vec<(Setting, u32)>,
    },
    PushPromise {
        stream_id: StreamId,
        promised_stream_id: StreamId,
        end_headers: bool,
        fragment: Bytes,
    },
    Ping {
        ack: bool,
        payload: [u8; 8],
    },
    GoAway(GoAway),
    WindowUpdate {
        stream_id: StreamId,
        increment: u32,
    },
    Continuation {
        stream_id: StreamId,
        end_headers: bool,
        fragment: Bytes,
    },
    /// Frames of an unknown type are surfaced so they can be ignored
    /// explicitly.
    Unknown {
        stream_id: StreamId,
        ty: u8,
        payload: Bytes,
    },
}

impl H2Frame {
    pub fn stream_id(&self) -> StreamId {
        match self {
            H2Frame::Data { stream_id, .. }
            | H2Frame::Headers { stream_id, .. }
            | H2Frame::Priority { stream_id, .. }
            | H2Frame::RstStream { stream_id, .. }
            | H2Frame::PushPromise { stream_id, .. }
            | H2Frame::WindowUpdate { stream_id, .. }
            | H2Frame::Continuation { stream_id, .. }
            | H2Frame::Unknown { stream_id, .. } => *stream_id,
            H2Frame::Settings { .. } | H2Frame::Ping { .. } | H2Frame::GoAway(_) => {
                StreamId::CONNECTION
            }
        }
    }

    /// Number of payload bytes counted against flow control. Only DATA
    /// frames are flow-controlled.
    pub fn flow_controlled_len(&self) -> u32 {
        match self {
            H2Frame::Data { data, padding, .. } => {
                let padding = padding.map(|p| p as u32 + 1).unwrap_or_default();
                data.len() as u32 + padding
            }
            _ => 0,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            H2Frame::Data { .. } => "DATA",
            H2Frame::Headers { .. } => "HEADERS",
            H2Frame::Priority { .. } => "PRIORITY",
            H2Frame::RstStream { .. } => "RST_STREAM",
            H2Frame::Settings { .. } => "SETTINGS",
            H2Frame::PushPromise { .. } => "PUSH_PROMISE",
            H2Frame::Ping { .. } => "PING",
            H2Frame::GoAway(_) => "GOAWAY",
            H2Frame::WindowUpdate { .. } => "WINDOW_UPDATE",
            H2Frame::Continuation { .. } => "CONTINUATION",
            H2Frame::Unknown { .. } => "UNKNOWN",
        }
    }

    /// Serializes this frame (header and payload) at the end of `out`.
    pub fn encode(&self, out: &mut BytesMut) {
        let mut payload = Vec::new();
        let frame_type = self.encode_payload(&mut payload);

        let header = FrameHeader::new(frame_type, self.stream_id()).with_len(payload.len() as u32);
        let mut header_buf = [0u8; FRAME_HEADER_LEN];
        // writing into a fixed-size slice of the exact length cannot fail
        let _ = header.write_into(&mut header_buf[..]);

        out.reserve(FRAME_HEADER_LEN + payload.len());
        out.extend_from_slice(&header_buf);
        out.extend_from_slice(&payload);
    }

    /// Serializes this frame into its own buffer.
    pub fn to_bytes(&self) -> Bytes {
        let mut out = BytesMut::new();
        self.encode(&mut out);
        out.freeze()
    }

    fn encode_payload(&self, payload: &mut Vec<u8>) -> FrameType {
        match self {
            H2Frame::Data {
                end_stream,
                data,
                padding,
                ..
            } => {
                let mut flags = BitFlags::<DataFlags>::default();
                if *end_stream {
                    flags |= DataFlags::EndStream;
                }
                if let Some(pad) = padding {
                    flags |= DataFlags::Padded;
                    payload.put_u8(*pad);
                }
                payload.extend_from_slice(data);
                if let Some(pad) = padding {
                    payload.put_bytes(0, *pad as usize);
                }
                FrameType::Data(flags)
            }
            H2Frame::Headers {
                end_stream,
                end_headers,
                priority,
                fragment,
                padding,
                ..
            } => {
                let mut flags = BitFlags::<HeadersFlags>::default();
                if *end_stream {
                    flags |= HeadersFlags::EndStream;
                }
                if *end_headers {
                    flags |= HeadersFlags::EndHeaders;
                }
                if let Some(pad) = padding {
                    flags |= HeadersFlags::Padded;
                    payload.put_u8(*pad);
                }
                if let Some(spec) = priority {
                    flags |= HeadersFlags::Priority;
                    let _ = spec.write_into(&mut *payload);
                }
                payload.extend_from_slice(fragment);
                if let Some(pad) = padding {
                    payload.put_bytes(0, *pad as usize);
                }
                FrameType::Headers(flags)
            }
            H2Frame::Priority { spec, .. } => {
                let _ = spec.write_into(&mut *payload);
                FrameType::Priority
            }
            H2Frame::RstStream { error_code, .. } => {
                let _ = RstStream {
                    error_code: *error_code,
                }
                .write_into(&mut *payload);
                FrameType::RstStream
            }
            H2Frame::Settings { ack, settings } => {
                let _ = write_setting_pairs(settings, &mut *payload);
                FrameType::Settings(if *ack {
                    SettingsFlags::Ack.into()
                } else {
                    Default::default()
                })
            }
            H2Frame::PushPromise {
                promised_stream_id,
                end_headers,
                fragment,
                ..
            } => {
                payload.extend_from_slice(&crate::pack_bit_and_u31(0, promised_stream_id.0));
                payload.extend_from_slice(fragment);
                FrameType::PushPromise(if *end_headers {
                    PushPromiseFlags::EndHeaders.into()
                } else {
                    Default::default()
                })
            }
            H2Frame::Ping { ack, payload: data } => {
                payload.extend_from_slice(&data[..]);
                FrameType::Ping(if *ack {
                    PingFlags::Ack.into()
                } else {
                    Default::default()
                })
            }
            H2Frame::GoAway(goaway) => {
                let _ = goaway.write_into(&mut *payload);
                FrameType::GoAway
            }
            H2Frame::WindowUpdate { increment, .. } => {
                let _ = WindowUpdate {
                    reserved: 0,
                    increment: *increment,
                }
                .write_into(&mut *payload);
                FrameType::WindowUpdate
            }
            H2Frame::Continuation {
                end_headers,
                fragment,
                ..
            } => {
                payload.extend_from_slice(fragment);
                FrameType::Continuation(if *end_headers {
                    ContinuationFlags::EndHeaders.into()
                } else {
                    Default::default()
                })
            }
            H2Frame::Unknown { ty, payload: p, .. } => {
                payload.extend_from_slice(p);
                FrameType::Unknown(crate::EncodedFrameType { ty: *ty, flags: 0 })
            }
        }
    }
}
