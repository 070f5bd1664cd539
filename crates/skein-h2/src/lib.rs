//! HTTP/2 frame codec
//!
//! HTTP/2 <https://httpwg.org/specs/rfc9113.html>
//! HTTP semantics <https://httpwg.org/specs/rfc9110.html>

use std::{fmt, io::Write, ops::RangeInclusive};

use byteorder::{BigEndian, WriteBytesExt};

pub use enumflags2;
use enumflags2::{bitflags, BitFlags};

pub use nom;

use nom::{
    combinator::map,
    number::streaming::{be_u24, be_u32, be_u8},
    sequence::tuple,
    IResult,
};

mod decode;
pub use decode::*;

mod frame;
pub use frame::*;

/// This is sent by h2 clients after negotiating over ALPN, or when doing h2c.
pub const PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// Every frame starts with a fixed-size header
pub const FRAME_HEADER_LEN: usize = 9;

pub fn preface(i: &[u8]) -> IResult<&[u8], ()> {
    let (i, _) = nom::bytes::streaming::tag(PREFACE)(i)?;
    Ok((i, ()))
}

/// See https://httpwg.org/specs/rfc9113.html#FrameTypes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RawFrameType {
    Data = 0x00,
    Headers = 0x01,
    Priority = 0x02,
    RstStream = 0x03,
    Settings = 0x04,
    PushPromise = 0x05,
    Ping = 0x06,
    GoAway = 0x07,
    WindowUpdate = 0x08,
    Continuation = 0x09,
}

impl RawFrameType {
    pub fn repr(self) -> u8 {
        self as u8
    }

    pub fn from_repr(ty: u8) -> Option<Self> {
        let ty = match ty {
            0x00 => Self::Data,
            0x01 => Self::Headers,
            0x02 => Self::Priority,
            0x03 => Self::RstStream,
            0x04 => Self::Settings,
            0x05 => Self::PushPromise,
            0x06 => Self::Ping,
            0x07 => Self::GoAway,
            0x08 => Self::WindowUpdate,
            0x09 => Self::Continuation,
            _ => return None,
        };
        Some(ty)
    }
}

/// Typed flags for various frame types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Data(BitFlags<DataFlags>),
    Headers(BitFlags<HeadersFlags>),
    Priority,
    RstStream,
    Settings(BitFlags<SettingsFlags>),
    PushPromise(BitFlags<PushPromiseFlags>),
    Ping(BitFlags<PingFlags>),
    GoAway,
    WindowUpdate,
    Continuation(BitFlags<ContinuationFlags>),
    Unknown(EncodedFrameType),
}

/// See https://httpwg.org/specs/rfc9113.html#DATA
#[bitflags]
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DataFlags {
    Padded = 0x08,
    EndStream = 0x01,
}

/// See https://httpwg.org/specs/rfc9113.html#rfc.section.6.2
#[bitflags]
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum HeadersFlags {
    Priority = 0x20,
    Padded = 0x08,
    EndHeaders = 0x04,
    EndStream = 0x01,
}

/// See https://httpwg.org/specs/rfc9113.html#SETTINGS
#[bitflags]
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SettingsFlags {
    Ack = 0x01,
}

/// See https://httpwg.org/specs/rfc9113.html#PUSH_PROMISE
#[bitflags]
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PushPromiseFlags {
    Padded = 0x08,
    EndHeaders = 0x04,
}

/// See https://httpwg.org/specs/rfc9113.html#PING
#[bitflags]
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PingFlags {
    Ack = 0x01,
}

/// See https://httpwg.org/specs/rfc9113.html#CONTINUATION
#[bitflags]
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ContinuationFlags {
    EndHeaders = 0x04,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodedFrameType {
    pub ty: u8,
    pub flags: u8,
}

impl EncodedFrameType {
    fn parse(i: &[u8]) -> IResult<&[u8], Self> {
        let (i, (ty, flags)) = tuple((be_u8, be_u8))(i)?;
        Ok((i, Self { ty, flags }))
    }
}

impl From<(RawFrameType, u8)> for EncodedFrameType {
    fn from((ty, flags): (RawFrameType, u8)) -> Self {
        Self {
            ty: ty.repr(),
            flags,
        }
    }
}

impl FrameType {
    pub(crate) fn encode(self) -> EncodedFrameType {
        match self {
            FrameType::Data(f) => (RawFrameType::Data, f.bits()).into(),
            FrameType::Headers(f) => (RawFrameType::Headers, f.bits()).into(),
            FrameType::Priority => (RawFrameType::Priority, 0).into(),
            FrameType::RstStream => (RawFrameType::RstStream, 0).into(),
            FrameType::Settings(f) => (RawFrameType::Settings, f.bits()).into(),
            FrameType::PushPromise(f) => (RawFrameType::PushPromise, f.bits()).into(),
            FrameType::Ping(f) => (RawFrameType::Ping, f.bits()).into(),
            FrameType::GoAway => (RawFrameType::GoAway, 0).into(),
            FrameType::WindowUpdate => (RawFrameType::WindowUpdate, 0).into(),
            FrameType::Continuation(f) => (RawFrameType::Continuation, f.bits()).into(),
            FrameType::Unknown(ft) => ft,
        }
    }

    fn decode(ft: EncodedFrameType) -> Self {
        match RawFrameType::from_repr(ft.ty) {
            Some(ty) => match ty {
                RawFrameType::Data => FrameType::Data(BitFlags::from_bits_truncate(ft.flags)),
                RawFrameType::Headers => {
                    FrameType::Headers(BitFlags::from_bits_truncate(ft.flags))
                }
                RawFrameType::Priority => FrameType::Priority,
                RawFrameType::RstStream => FrameType::RstStream,
                RawFrameType::Settings => {
                    FrameType::Settings(BitFlags::from_bits_truncate(ft.flags))
                }
                RawFrameType::PushPromise => {
                    FrameType::PushPromise(BitFlags::from_bits_truncate(ft.flags))
                }
                RawFrameType::Ping => FrameType::Ping(BitFlags::from_bits_truncate(ft.flags)),
                RawFrameType::GoAway => FrameType::GoAway,
                RawFrameType::WindowUpdate => FrameType::WindowUpdate,
                RawFrameType::Continuation => {
                    FrameType::Continuation(BitFlags::from_bits_truncate(ft.flags))
                }
            },
            None => FrameType::Unknown(ft),
        }
    }

    /// Name of the frame type, as used in logs and errors
    pub fn name(&self) -> &'static str {
        match self {
            FrameType::Data(_) => "DATA",
            FrameType::Headers(_) => "HEADERS",
            FrameType::Priority => "PRIORITY",
            FrameType::RstStream => "RST_STREAM",
            FrameType::Settings(_) => "SETTINGS",
            FrameType::PushPromise(_) => "PUSH_PROMISE",
            FrameType::Ping(_) => "PING",
            FrameType::GoAway => "GOAWAY",
            FrameType::WindowUpdate => "WINDOW_UPDATE",
            FrameType::Continuation(_) => "CONTINUATION",
            FrameType::Unknown(_) => "UNKNOWN",
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct StreamId(pub u32);

impl StreamId {
    /// Stream ID used for connection control frames
    pub const CONNECTION: Self = Self(0);

    /// Server-initiated streams have even IDs
    pub fn is_server_initiated(&self) -> bool {
        self.0 % 2 == 0
    }

    pub fn is_connection(&self) -> bool {
        self.0 == 0
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid stream id: {0}")]
pub struct StreamIdOutOfRange(u32);

impl TryFrom<u32> for StreamId {
    type Error = StreamIdOutOfRange;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        if value & 0x8000_0000 != 0 {
            Err(StreamIdOutOfRange(value))
        } else {
            Ok(Self(value))
        }
    }
}

impl fmt::Debug for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// See https://httpwg.org/specs/rfc9113.html#FrameHeader
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub frame_type: FrameType,
    pub reserved: u8,
    pub stream_id: StreamId,
    pub len: u32,
}

impl fmt::Debug for FrameHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.stream_id.is_connection() {
            write!(f, "Conn:")?;
        } else {
            write!(f, "#{}:", self.stream_id.0)?;
        }

        if let FrameType::Unknown(EncodedFrameType { ty, flags }) = self.frame_type {
            return write!(f, "UnknownFrame({:#x}, {:#x}, len={})", ty, flags, self.len);
        }
        let mut s = f.debug_struct(self.frame_type.name());

        if self.reserved != 0 {
            s.field("reserved", &self.reserved);
        }
        if self.len > 0 {
            s.field("len", &self.len);
        }

        struct DisplayDebug<'a, D: fmt::Display>(&'a D);
        impl<'a, D: fmt::Display> fmt::Debug for DisplayDebug<'a, D> {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(self.0, f)
            }
        }

        match &self.frame_type {
            FrameType::Data(flags) if !flags.is_empty() => {
                s.field("flags", &DisplayDebug(flags));
            }
            FrameType::Headers(flags) if !flags.is_empty() => {
                s.field("flags", &DisplayDebug(flags));
            }
            FrameType::Settings(flags) if !flags.is_empty() => {
                s.field("flags", &DisplayDebug(flags));
            }
            FrameType::PushPromise(flags) if !flags.is_empty() => {
                s.field("flags", &DisplayDebug(flags));
            }
            FrameType::Ping(flags) if !flags.is_empty() => {
                s.field("flags", &DisplayDebug(flags));
            }
            FrameType::Continuation(flags) if !flags.is_empty() => {
                s.field("flags", &DisplayDebug(flags));
            }
            _ => {}
        }

        s.finish()
    }
}

impl FrameHeader {
    /// Create a new frame header with the given type and stream ID.
    pub fn new(frame_type: FrameType, stream_id: StreamId) -> Self {
        Self {
            frame_type,
            reserved: 0,
            stream_id,
            len: 0,
        }
    }

    /// Set the frame's payload length.
    pub fn with_len(mut self, len: u32) -> Self {
        self.len = len;
        self
    }

    /// Parse a frame header. Yields `Incomplete` until all 9 bytes are there.
    pub fn parse(i: &[u8]) -> IResult<&[u8], Self> {
        let (i, (len, frame_type, (reserved, stream_id))) = tuple((
            be_u24,
            EncodedFrameType::parse,
            parse_reserved_and_stream_id,
        ))(i)?;

        let header = FrameHeader {
            frame_type: FrameType::decode(frame_type),
            reserved,
            stream_id,
            len,
        };
        Ok((i, header))
    }

    pub fn write_into(self, mut w: impl std::io::Write) -> std::io::Result<()> {
        w.write_u24::<BigEndian>(self.len as _)?;
        let ft = self.frame_type.encode();
        w.write_u8(ft.ty)?;
        w.write_u8(ft.flags)?;
        w.write_all(&pack_reserved_and_stream_id(self.reserved, self.stream_id))?;

        Ok(())
    }
}

/// See https://httpwg.org/specs/rfc9113.html#FrameHeader - the first bit
/// is reserved, and the rest is a 31-bit stream id
pub fn parse_bit_and_u31(i: &[u8]) -> IResult<&[u8], (u8, u32)> {
    let (i, x) = be_u32(i)?;

    let bit = (x >> 31) as u8;
    let val = x & 0x7FFF_FFFF;

    Ok((i, (bit, val)))
}

fn parse_reserved_and_stream_id(i: &[u8]) -> IResult<&[u8], (u8, StreamId)> {
    parse_bit_and_u31(i).map(|(i, (reserved, stream_id))| (i, (reserved, StreamId(stream_id))))
}

/// Pack a bit and a u31 into a 4-byte array (big-endian). Bits above the
/// 31st are dropped.
pub fn pack_bit_and_u31(bit: u8, val: u32) -> [u8; 4] {
    let mut bytes = (val & 0x7FFF_FFFF).to_be_bytes();
    if bit & 0x1 != 0 {
        bytes[0] |= 0x80;
    }

    bytes
}

pub fn pack_reserved_and_stream_id(reserved: u8, stream_id: StreamId) -> [u8; 4] {
    pack_bit_and_u31(reserved, stream_id.0)
}

// cf. https://httpwg.org/specs/rfc9113.html#HEADERS
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrioritySpec {
    pub exclusive: bool,
    pub stream_dependency: StreamId,
    // 0-255 => 1-256
    pub weight: u8,
}

impl PrioritySpec {
    pub const WIRE_LEN: usize = 5;

    pub fn parse(i: &[u8]) -> IResult<&[u8], Self> {
        map(
            tuple((parse_reserved_and_stream_id, be_u8)),
            |((exclusive, stream_dependency), weight)| Self {
                exclusive: exclusive != 0,
                stream_dependency,
                weight,
            },
        )(i)
    }

    /// The effective weight, between 1 and 256
    pub fn effective_weight(&self) -> u16 {
        self.weight as u16 + 1
    }

    pub fn write_into(&self, mut w: impl std::io::Write) -> std::io::Result<()> {
        w.write_all(&pack_reserved_and_stream_id(
            self.exclusive as u8,
            self.stream_dependency,
        ))?;
        w.write_u8(self.weight)?;
        Ok(())
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ErrorCode(pub u32);

impl ErrorCode {
    /// Returns the underlying u32
    pub fn as_repr(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match KnownErrorCode::from_repr(self.0) {
            Some(e) => fmt::Debug::fmt(&e, f),
            None => write!(f, "ErrorCode(0x{:02x})", self.0),
        }
    }
}

impl From<KnownErrorCode> for ErrorCode {
    fn from(e: KnownErrorCode) -> Self {
        Self(e as u32)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum KnownErrorCode {
    /// The associated condition is not a result of an error. For example, a
    /// GOAWAY might include this code to indicate graceful shutdown of a
    /// connection.
    NoError = 0x00,

    /// The endpoint detected an unspecific protocol error.
    ProtocolError = 0x01,

    /// The endpoint encountered an unexpected internal error.
    InternalError = 0x02,

    /// The endpoint detected that its peer violated the flow-control protocol.
    FlowControlError = 0x03,

    /// The endpoint sent a SETTINGS frame but did not receive a response in a
    /// timely manner.
    SettingsTimeout = 0x04,

    /// The endpoint received a frame after a stream was half-closed.
    StreamClosed = 0x05,

    /// The endpoint received a frame with an invalid size.
    FrameSizeError = 0x06,

    /// The endpoint refused the stream prior to performing any application
    /// processing.
    RefusedStream = 0x07,

    /// The endpoint uses this error code to indicate that the stream is no
    /// longer needed.
    Cancel = 0x08,

    /// The endpoint is unable to maintain the field section compression context
    /// for the connection.
    CompressionError = 0x09,

    /// The connection established in response to a CONNECT request was reset
    /// or abnormally closed.
    ConnectError = 0x0a,

    /// The endpoint detected that its peer is exhibiting a behavior that might
    /// be generating excessive load.
    EnhanceYourCalm = 0x0b,

    /// The underlying transport has properties that do not meet minimum
    /// security requirements.
    InadequateSecurity = 0x0c,

    /// The endpoint requires that HTTP/1.1 be used instead of HTTP/2.
    Http1_1Required = 0x0d,
}

impl KnownErrorCode {
    pub fn from_repr(code: u32) -> Option<Self> {
        use KnownErrorCode::*;

        let code = match code {
            0x00 => NoError,
            0x01 => ProtocolError,
            0x02 => InternalError,
            0x03 => FlowControlError,
            0x04 => SettingsTimeout,
            0x05 => StreamClosed,
            0x06 => FrameSizeError,
            0x07 => RefusedStream,
            0x08 => Cancel,
            0x09 => CompressionError,
            0x0a => ConnectError,
            0x0b => EnhanceYourCalm,
            0x0c => InadequateSecurity,
            0x0d => Http1_1Required,
            _ => return None,
        };
        Some(code)
    }
}

impl TryFrom<ErrorCode> for KnownErrorCode {
    type Error = ();

    fn try_from(e: ErrorCode) -> Result<Self, Self::Error> {
        KnownErrorCode::from_repr(e.0).ok_or(())
    }
}

/// cf. https://httpwg.org/specs/rfc9113.html#SettingValues
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Settings {
    /// Maximum size of the compression table used to decode field blocks.
    pub header_table_size: u32,

    /// Whether server push is allowed. Servers never push, this is only
    /// recorded.
    pub enable_push: bool,

    /// Maximum number of concurrent streams the sender will allow. `None`
    /// means unlimited.
    pub max_concurrent_streams: Option<u32>,

    /// Initial window size (in octets) for stream-level flow control.
    pub initial_window_size: u32,

    /// Size of the largest frame payload the sender is willing to receive.
    pub max_frame_size: u32,

    /// Advisory maximum field section size. `None` means unlimited.
    pub max_header_list_size: Option<u32>,
}

impl Default for Settings {
    fn default() -> Self {
        // cf. https://httpwg.org/specs/rfc9113.html#SettingValues
        Self {
            header_table_size: 4096,
            enable_push: true,
            max_concurrent_streams: None,
            initial_window_size: (1 << 16) - 1,
            max_frame_size: (1 << 14),
            max_header_list_size: None,
        }
    }
}

impl Settings {
    pub const MAX_INITIAL_WINDOW_SIZE: u32 = (1 << 31) - 1;
    pub const MAX_FRAME_SIZE_ALLOWED_RANGE: RangeInclusive<u32> = (1 << 14)..=((1 << 24) - 1);

    /// Apply a setting to the current settings, returning an error if the
    /// setting is invalid.
    pub fn apply(&mut self, code: Setting, value: u32) -> Result<(), SettingsError> {
        match code {
            Setting::HeaderTableSize => {
                self.header_table_size = value;
            }
            Setting::EnablePush => match value {
                0 => self.enable_push = false,
                1 => self.enable_push = true,
                _ => return Err(SettingsError::InvalidEnablePushValue { actual: value }),
            },
            Setting::MaxConcurrentStreams => {
                self.max_concurrent_streams = Some(value);
            }
            Setting::InitialWindowSize => {
                if value > Self::MAX_INITIAL_WINDOW_SIZE {
                    return Err(SettingsError::InitialWindowSizeTooLarge { actual: value });
                }
                self.initial_window_size = value;
            }
            Setting::MaxFrameSize => {
                if !Self::MAX_FRAME_SIZE_ALLOWED_RANGE.contains(&value) {
                    return Err(SettingsError::SettingsMaxFrameSizeInvalid { actual: value });
                }
                self.max_frame_size = value;
            }
            Setting::MaxHeaderListSize => {
                self.max_header_list_size = Some(value);
            }
        }

        Ok(())
    }

    /// Parse a series of settings from a SETTINGS payload, calling the
    /// callback for each known setting found. Unknown settings are ignored.
    ///
    /// The caller checks that the payload is a multiple of 6 bytes; any
    /// trailing partial entry is ignored.
    pub fn parse<E>(
        buf: &[u8],
        mut callback: impl FnMut(Setting, u32) -> Result<(), E>,
    ) -> Result<(), E> {
        for chunk in buf.chunks_exact(6) {
            let id = u16::from_be_bytes([chunk[0], chunk[1]]);
            let value = u32::from_be_bytes([chunk[2], chunk[3], chunk[4], chunk[5]]);
            if let Some(id) = Setting::from_repr(id) {
                callback(id, value)?;
            }
        }

        Ok(())
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum SettingsError {
    #[error("ENABLE_PUSH setting is supposed to be either 0 or 1, got {actual}")]
    InvalidEnablePushValue { actual: u32 },

    #[error("bad INITIAL_WINDOW_SIZE value {actual}, should be less than or equal to 2^31-1")]
    InitialWindowSizeTooLarge { actual: u32 },

    #[error(
        "bad SETTINGS_MAX_FRAME_SIZE value {actual}, should be between 2^14 and 2^24-1 inclusive"
    )]
    SettingsMaxFrameSizeInvalid { actual: u32 },
}

impl SettingsError {
    pub fn as_known_error_code(&self) -> KnownErrorCode {
        match self {
            SettingsError::InitialWindowSizeTooLarge { .. } => KnownErrorCode::FlowControlError,
            _ => KnownErrorCode::ProtocolError,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Setting {
    HeaderTableSize = 0x01,
    EnablePush = 0x02,
    MaxConcurrentStreams = 0x03,
    InitialWindowSize = 0x04,
    MaxFrameSize = 0x05,
    MaxHeaderListSize = 0x06,
}

impl Setting {
    pub fn from_repr(id: u16) -> Option<Self> {
        let setting = match id {
            0x01 => Self::HeaderTableSize,
            0x02 => Self::EnablePush,
            0x03 => Self::MaxConcurrentStreams,
            0x04 => Self::InitialWindowSize,
            0x05 => Self::MaxFrameSize,
            0x06 => Self::MaxHeaderListSize,
            _ => return None,
        };
        Some(setting)
    }
}

/// Writes `(id, value)` pairs as a SETTINGS payload
pub fn write_setting_pairs(
    pairs: &[(Setting, u32)],
    mut w: impl std::io::Write,
) -> std::io::Result<()> {
    for (id, value) in pairs {
        w.write_u16::<BigEndian>(*id as u16)?;
        w.write_u32::<BigEndian>(*value)?;
    }
    Ok(())
}

/// Payload for a GOAWAY frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GoAway {
    pub last_stream_id: StreamId,
    pub error_code: ErrorCode,
    pub additional_debug_data: bytes::Bytes,
}

impl GoAway {
    pub fn parse(i: &[u8]) -> IResult<&[u8], Self> {
        let (rest, ((_, last_stream_id), error_code)) =
            tuple((parse_bit_and_u31, be_u32))(i)?;

        Ok((
            &rest[rest.len()..],
            Self {
                last_stream_id: StreamId(last_stream_id),
                error_code: ErrorCode(error_code),
                additional_debug_data: bytes::Bytes::copy_from_slice(rest),
            },
        ))
    }

    pub fn write_into(&self, mut w: impl std::io::Write) -> std::io::Result<()> {
        w.write_all(&pack_bit_and_u31(0, self.last_stream_id.0))?;
        w.write_u32::<BigEndian>(self.error_code.0)?;
        w.write_all(&self.additional_debug_data[..])?;
        Ok(())
    }
}

/// Payload for a RST_STREAM frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RstStream {
    pub error_code: ErrorCode,
}

impl RstStream {
    pub fn parse(i: &[u8]) -> IResult<&[u8], Self> {
        let (rest, error_code) = be_u32(i)?;
        Ok((
            rest,
            Self {
                error_code: ErrorCode(error_code),
            },
        ))
    }

    pub fn write_into(&self, mut w: impl std::io::Write) -> std::io::Result<()> {
        w.write_u32::<BigEndian>(self.error_code.0)
    }
}

/// Payload for a WINDOW_UPDATE frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowUpdate {
    pub reserved: u8,
    pub increment: u32,
}

impl WindowUpdate {
    pub fn parse(i: &[u8]) -> IResult<&[u8], Self> {
        let (rest, (reserved, increment)) = parse_bit_and_u31(i)?;
        Ok((
            rest,
            Self {
                reserved,
                increment,
            },
        ))
    }

    pub fn write_into(&self, mut w: impl std::io::Write) -> std::io::Result<()> {
        w.write_all(&pack_bit_and_u31(self.reserved, self.increment))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_and_parse_bit_and_u31() {
        let test_cases = [
            (0, 0),
            (1, 0),
            (0, 1),
            (1, 1),
            (0, 0x7FFF_FFFF),
            (1, 0x7FFF_FFFF),
        ];

        for &(bit, number) in &test_cases {
            let packed = pack_bit_and_u31(bit, number);
            let (rest, (parsed_bit, parsed_number)) = parse_bit_and_u31(&packed[..]).unwrap();
            assert!(rest.is_empty());
            assert_eq!(bit, parsed_bit);
            assert_eq!(number, parsed_number);
        }
    }

    #[test]
    fn pack_drops_the_high_bit_of_the_value() {
        assert_eq!(pack_bit_and_u31(0, 0xFFFF_FFFF), [0x7f, 0xff, 0xff, 0xff]);
    }

    #[test]
    fn frame_header_needs_nine_bytes() {
        let mut buf = Vec::new();
        FrameHeader::new(FrameType::WindowUpdate, StreamId(3))
            .with_len(4)
            .write_into(&mut buf)
            .unwrap();
        assert_eq!(buf.len(), FRAME_HEADER_LEN);

        for cut in 0..FRAME_HEADER_LEN {
            assert!(matches!(
                FrameHeader::parse(&buf[..cut]),
                Err(nom::Err::Incomplete(_))
            ));
        }

        let (rest, header) = FrameHeader::parse(&buf[..]).unwrap();
        assert!(rest.is_empty());
        assert_eq!(header.stream_id, StreamId(3));
        assert_eq!(header.len, 4);
        assert_eq!(header.frame_type, FrameType::WindowUpdate);
    }

    #[test]
    fn unknown_frame_types_survive_decoding() {
        let ft = FrameType::decode(EncodedFrameType { ty: 0xfa, flags: 0x3 });
        assert_eq!(ft, FrameType::Unknown(EncodedFrameType { ty: 0xfa, flags: 0x3 }));
        assert_eq!(ft.encode(), EncodedFrameType { ty: 0xfa, flags: 0x3 });
    }

    #[test]
    fn settings_apply_validates_values() {
        let mut s = Settings::default();
        assert_eq!(
            s.apply(Setting::EnablePush, 2),
            Err(SettingsError::InvalidEnablePushValue { actual: 2 })
        );
        assert_eq!(
            s.apply(Setting::InitialWindowSize, 1 << 31)
                .unwrap_err()
                .as_known_error_code(),
            KnownErrorCode::FlowControlError
        );
        assert!(s.apply(Setting::MaxFrameSize, 1024).is_err());
        s.apply(Setting::MaxFrameSize, 1 << 20).unwrap();
        assert_eq!(s.max_frame_size, 1 << 20);
    }

    #[test]
    fn settings_parse_skips_unknown_ids() {
        let payload = [
            0x00, 0x04, 0x00, 0x00, 0x00, 0x05, // INITIAL_WINDOW_SIZE = 5
            0x00, 0xaa, 0x00, 0x00, 0x00, 0x01, // unknown
        ];
        let mut seen = vec![];
        Settings::parse::<()>(&payload, |id, value| {
            seen.push((id, value));
            Ok(())
        })
        .unwrap();
        assert_eq!(seen, vec![(Setting::InitialWindowSize, 5)]);
    }

    #[test]
    fn error_code_debug_names_known_codes() {
        assert_eq!(format!("{:?}", ErrorCode(0x8)), "Cancel");
        assert_eq!(format!("{:?}", ErrorCode(0xbeef)), "ErrorCode(0xbeef)");
    }
}
