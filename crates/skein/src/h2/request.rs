use bytes::Bytes;
use tokio::sync::oneshot;

use super::{
    handle::StreamHandle,
    types::{HeaderList, StreamError, StreamOutcome},
};

/// The per-stream collaborator: receives the request as it comes off the
/// wire. Responses go back through the [StreamHandle] it was created with.
///
/// Every method is called from inside the connection's event handling, so
/// implementations must not block.
pub trait Request {
    /// The opening header block, validated, pseudo-headers first.
    fn headers_received(&mut self, headers: HeaderList);

    /// A chunk of request body, padding stripped.
    fn data_received(&mut self, data: Bytes);

    fn trailers_received(&mut self, trailers: HeaderList) {
        let _ = trailers;
    }

    /// The peer won't send anything else on this stream.
    fn request_complete(&mut self);

    /// The stream ended without completing. Called at most once, right
    /// before the cleanup channel resolves with the same reason.
    fn connection_lost(&mut self, reason: &StreamError) {
        let _ = reason;
    }

    /// Only called while registered as a producer: the outbound window is
    /// exhausted, stop writing.
    fn pause_producing(&mut self) {}

    /// Only called while registered as a producer: there is room again.
    fn resume_producing(&mut self) {}
}

/// Creates one [Request] per stream opened by the peer.
pub trait RequestFactory {
    type Request: Request;

    /// `cleanup` resolves exactly once, when the stream is done with, either
    /// cleanly or with the reason it failed.
    fn make_request(
        &mut self,
        handle: StreamHandle,
        cleanup: oneshot::Receiver<StreamOutcome>,
    ) -> Self::Request;
}
