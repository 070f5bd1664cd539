use std::time::Duration;

/// HTTP/2 connection configuration
#[derive(Debug, Clone)]
pub struct H2Config {
    /// How long the connection may stay idle (nothing received, no DATA
    /// sent) before it's closed with a GOAWAY. `None` disables the timer.
    pub timeout: Option<Duration>,

    /// After an idle timeout, how long to wait for the transport to close
    /// before aborting it. `None` waits forever.
    pub abort_timeout: Option<Duration>,

    /// How many bytes of control frames (SETTINGS ACKs, WINDOW_UPDATEs,
    /// RST_STREAMs...) may pile up while the transport is paused before the
    /// connection is dropped.
    pub max_buffered_control_frame_bytes: usize,

    /// Advertised as SETTINGS_MAX_CONCURRENT_STREAMS. Streams beyond it are
    /// refused.
    pub max_streams: Option<u32>,

    /// Advertised as SETTINGS_INITIAL_WINDOW_SIZE: how much request body
    /// each stream may send before we acknowledge it.
    pub initial_window_size: u32,

    /// Advertised as SETTINGS_MAX_FRAME_SIZE, enforced on inbound frames.
    pub max_frame_size: u32,

    /// Advertised as SETTINGS_MAX_HEADER_LIST_SIZE.
    pub max_header_list_size: u32,
}

impl Default for H2Config {
    fn default() -> Self {
        Self {
            timeout: Some(Duration::from_secs(60)),
            abort_timeout: Some(Duration::from_secs(15)),
            max_buffered_control_frame_bytes: 17 * 1024,
            max_streams: Some(100),
            initial_window_size: (1 << 16) - 1,
            max_frame_size: 1 << 14,
            max_header_list_size: 1 << 16,
        }
    }
}
