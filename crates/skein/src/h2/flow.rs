//! Flow-control bookkeeping, cf. https://httpwg.org/specs/rfc9113.html#FlowControl

use skein_h2::Settings;

/// Largest value a flow-control window may legally reach
pub(crate) const MAX_WINDOW_SIZE: i64 = Settings::MAX_INITIAL_WINDOW_SIZE as i64;

#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
#[error("flow-control window would reach {0}, above 2^31-1")]
pub struct WindowOverflow(pub i64);

#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
#[error("peer sent {received} bytes but only {available} were allowed")]
pub struct WindowUnderflow {
    pub received: u32,
    pub available: i64,
}

/// How many bytes we may still send to the peer, for one stream or for the
/// whole connection. Only ever touched from the connection's event handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowControlWindow {
    available: i64,
    initial: i64,
}

impl FlowControlWindow {
    pub fn new(initial: u32) -> Self {
        Self {
            available: initial as i64,
            initial: initial as i64,
        }
    }

    pub fn available(&self) -> i64 {
        self.available
    }

    /// How much of `n` may be sent right now. Never more than `available`,
    /// and 0 when the window is exhausted (or negative after a settings
    /// change).
    pub fn reserve(&self, n: usize) -> usize {
        if self.available <= 0 {
            0
        } else {
            n.min(self.available as usize)
        }
    }

    /// Records that `n` bytes (previously granted by [Self::reserve]) went
    /// out on the wire.
    pub fn consume(&mut self, n: usize) {
        debug_assert!(n as i64 <= self.available, "consumed more than reserved");
        self.available -= n as i64;
    }

    /// Applies a WINDOW_UPDATE increment.
    pub fn increment(&mut self, n: u32) -> Result<(), WindowOverflow> {
        let next = self.available + n as i64;
        if next > MAX_WINDOW_SIZE {
            return Err(WindowOverflow(next));
        }
        self.available = next;
        Ok(())
    }

    pub fn is_blocked(&self) -> bool {
        self.available <= 0
    }

    /// Applies a change of SETTINGS_INITIAL_WINDOW_SIZE retroactively: the
    /// difference is added to (or removed from) the available capacity,
    /// which may leave the window negative.
    /// cf. https://httpwg.org/specs/rfc9113.html#InitialWindowSize
    pub fn apply_initial_delta(&mut self, new_initial: u32) -> Result<(), WindowOverflow> {
        let delta = new_initial as i64 - self.initial;
        let next = self.available + delta;
        if next > MAX_WINDOW_SIZE {
            return Err(WindowOverflow(next));
        }
        self.available = next;
        self.initial = new_initial as i64;
        Ok(())
    }
}

/// Our side of an inbound window: charges received DATA and decides when
/// acknowledging processed bytes is worth a WINDOW_UPDATE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiveWindow {
    max: u32,
    current: i64,
    processed: u32,
}

impl ReceiveWindow {
    pub fn new(max: u32) -> Self {
        Self {
            max,
            current: max as i64,
            processed: 0,
        }
    }

    /// Remaining bytes the peer may send before we acknowledge anything.
    pub fn current(&self) -> i64 {
        self.current
    }

    /// Charges `n` received bytes (padding included) against the window.
    pub fn consumed(&mut self, n: u32) -> Result<(), WindowUnderflow> {
        if n as i64 > self.current {
            return Err(WindowUnderflow {
                received: n,
                available: self.current,
            });
        }
        self.current -= n as i64;
        Ok(())
    }

    /// Marks `n` bytes as processed by the application. Returns the
    /// increment to advertise in a WINDOW_UPDATE, if one is due: once half
    /// the window has been processed, or once the window is exhausted and
    /// more than `min(1024, max / 4)` bytes are waiting to be acknowledged.
    pub fn process_bytes(&mut self, n: u32) -> Option<u32> {
        self.processed = self.processed.saturating_add(n);
        if self.processed == 0 {
            return None;
        }

        let max_increment = (self.max as i64 - self.current).max(0) as u32;
        let exhausted = self.current == 0 && self.processed > (self.max / 4).min(1024);
        if !exhausted && self.processed < self.max / 2 {
            return None;
        }

        let increment = self.processed.min(max_increment);
        self.processed = 0;
        self.current += increment as i64;
        (increment > 0).then_some(increment)
    }
}
