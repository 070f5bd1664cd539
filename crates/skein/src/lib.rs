//! Server side of HTTP/2 connections: multiplexes requests over streams,
//! with flow control, stream priorities and transport backpressure.
//!
//! [H2Connection] is sans-I/O and can be driven by hand (tests do). [serve]
//! drives one over any tokio byte stream.

pub mod h2;
pub use h2::*;

pub mod error;

/// re-exported so consumers can use whatever version we use
pub use http;

pub use skein_h2;
