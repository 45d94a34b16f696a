use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use bytes::{Bytes, BytesMut};
use hmux_common::protocol::error::{HmuxError, Result};
use hmux_common::protocol::{RequestAttributes, ResponseSink};
use tokio::io::{AsyncRead, ReadBuf};
use tracing::{debug, warn};

use crate::pool::PooledConnection;

/// Relays one request over a leased connection and hands the lease back.
///
/// The lease is released on every path. When the relay fails with a
/// transport error or timeout the backend is marked failed first, so the
/// release closes the connection instead of reviving the backend. Protocol
/// errors close the connection and leave the backend state alone.
///
/// A recycled connection the backend already closed fails before any
/// response frame arrives. That case is retried once on a freshly opened
/// connection, replaying whatever part of the body was already read, and
/// only a failure of the retry counts against the backend.
///
/// # Arguments
///
/// * `lease` - Connection acquired from a backend or load balancer
/// * `request` - Attributes written ahead of the body
/// * `body` - Optional request body, streamed as DATA frames
/// * `sink` - Receives status, headers and body of the response
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use hmux_client::{relay, Backend, BackendConfig};
/// use hmux_common::{RequestAttributes, Response};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let backend = Arc::new(Backend::new(BackendConfig::new("127.0.0.1:6802"))?);
/// let lease = backend.acquire().await?;
///
/// let mut response = Response::default();
/// relay(lease, &RequestAttributes::new("GET", "/"), None, &mut response).await?;
/// println!("{}", response.status);
/// # Ok(())
/// # }
/// ```
pub async fn relay(
    mut lease: PooledConnection,
    request: &RequestAttributes,
    body: Option<&mut (dyn AsyncRead + Unpin + Send)>,
    sink: &mut dyn ResponseSink,
) -> Result<()> {
    let backend = lease.backend().clone();
    let mut body = body.map(|inner| ReplayBody::new(inner, backend.config().ack_size));

    let mut result = lease.relay(request, as_reader(&mut body), sink).await;

    let stale = matches!(result, Err(HmuxError::Transport(_)))
        && lease.is_recycled()
        && !lease.response_started()
        && body.as_ref().map_or(true, ReplayBody::is_replayable);
    if stale {
        if let Err(e) = &result {
            debug!(
                "hmux[{}] pooled connection to {} was stale ({}), retrying on a new one",
                lease.trace_id(),
                backend.address(),
                e
            );
        }
        backend.release(lease).await;
        lease = backend.acquire_new().await?;
        if let Some(body) = body.as_mut() {
            body.rewind();
        }
        result = lease.relay(request, as_reader(&mut body), sink).await;
    }

    let trace_id = lease.trace_id();
    match &result {
        Ok(()) => debug!("hmux[{}] relayed {} {}", trace_id, request.method, request.uri),
        Err(e) if e.is_backend_failure() => {
            warn!("hmux[{}] {} failed: {}", trace_id, backend.address(), e);
            backend.mark_failed().await;
        }
        Err(e) => debug!("hmux[{}] request failed: {}", trace_id, e),
    }

    backend.release(lease).await;
    result
}

fn as_reader<'b>(
    body: &'b mut Option<ReplayBody<'_>>,
) -> Option<&'b mut (dyn AsyncRead + Unpin + Send)> {
    body.as_mut()
        .map(|body| body as &mut (dyn AsyncRead + Unpin + Send))
}

/// Request body reader that keeps a copy of the first `limit` bytes so a
/// retry can send them again.
struct ReplayBody<'a> {
    inner: &'a mut (dyn AsyncRead + Unpin + Send),
    recorded: BytesMut,
    replay: Bytes,
    limit: usize,
    recording: bool,
}

impl<'a> ReplayBody<'a> {
    fn new(inner: &'a mut (dyn AsyncRead + Unpin + Send), limit: usize) -> Self {
        Self {
            inner,
            recorded: BytesMut::new(),
            replay: Bytes::new(),
            limit,
            recording: true,
        }
    }

    /// False once more than `limit` bytes were read.
    fn is_replayable(&self) -> bool {
        self.recording
    }

    /// Serves the recorded bytes again before reading on.
    fn rewind(&mut self) {
        self.replay = self.recorded.split().freeze();
        self.recording = false;
    }
}

impl AsyncRead for ReplayBody<'_> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;

        if !this.replay.is_empty() {
            let n = this.replay.len().min(buf.remaining());
            buf.put_slice(&this.replay.split_to(n));
            return Poll::Ready(Ok(()));
        }

        let before = buf.filled().len();
        ready!(Pin::new(&mut *this.inner).poll_read(cx, buf))?;

        if this.recording {
            let read = &buf.filled()[before..];
            if this.recorded.len() + read.len() <= this.limit {
                this.recorded.extend_from_slice(read);
            } else {
                this.recording = false;
                this.recorded.clear();
            }
        }
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncReadExt;

    use super::*;

    #[tokio::test]
    async fn test_replay_body_serves_recorded_bytes_again() {
        let mut source: &[u8] = b"hello world";
        let mut body = ReplayBody::new(&mut source, 64);

        let mut first = [0u8; 5];
        body.read_exact(&mut first).await.unwrap();
        assert_eq!(&first, b"hello");
        assert!(body.is_replayable());

        body.rewind();
        let mut all = Vec::new();
        body.read_to_end(&mut all).await.unwrap();
        assert_eq!(all, b"hello world");
    }

    #[tokio::test]
    async fn test_replay_body_stops_recording_past_limit() {
        let mut source: &[u8] = &[1u8; 100];
        let mut body = ReplayBody::new(&mut source, 10);

        let mut all = Vec::new();
        body.read_to_end(&mut all).await.unwrap();
        assert_eq!(all.len(), 100);
        assert!(!body.is_replayable());
    }
}
