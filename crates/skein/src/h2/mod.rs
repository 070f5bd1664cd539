//! HTTP/2 <https://httpwg.org/specs/rfc9113.html>
//! HTTP semantics <https://httpwg.org/specs/rfc9110.html>

mod connection;
pub use connection::*;

mod server;
pub use server::*;

mod config;
pub use config::*;

mod handle;
pub use handle::*;

mod request;
pub use request::*;

mod transport;
pub use transport::*;

pub mod flow;
pub mod priority;
pub mod stream;

mod headers;
pub(crate) mod types;
pub use types::{
    H2ConnectionError, H2ErrorLevel, H2StreamError, HeaderList, StreamError, StreamOutcome,
};
