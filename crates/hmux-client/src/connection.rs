use std::time::{Duration, Instant};

use bytes::BytesMut;
use hmux_common::protocol::error::{HmuxError, Result};
use hmux_common::protocol::{Opcode, RequestAttributes, ResponseSink};
use hmux_common::transport::{TcpTransport, WireCodec};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::TcpStream;
use tracing::{debug, trace};

/// Largest DATA frame written for a request body.
pub const BODY_CHUNK_SIZE: usize = 32 * 1024;

/// Body bytes sent between two yield/ack handshakes unless configured
/// otherwise.
pub const DEFAULT_ACK_SIZE: usize = 64 * 1024;

/// Channel id the connector opens for every request.
const REQUEST_CHANNEL: u16 = 1;

/// One live socket to one backend.
///
/// A connection is either held by exactly one caller (active) or parked in
/// its backend's idle ring with an idle-start timestamp. It remembers whether
/// the last exchange left it fit for reuse: any relay error marks it broken,
/// and a backend `X` (exit) means the backend is about to close its end.
pub struct Connection {
    codec: WireCodec<TcpStream>,
    address: String,
    trace_id: u64,
    idle_start: Option<Instant>,
    ack_size: usize,
    response_started: bool,
    broken: bool,
    keepalive: bool,
    closed: bool,
}

/// Frame that stopped a response read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResponseEnd {
    Ack,
    Quit,
    Exit,
}

impl Connection {
    /// Connects to `address` within the transport's connect timeout.
    ///
    /// # Arguments
    ///
    /// * `transport` - Connect helper carrying the connect timeout
    /// * `address` - Backend address (e.g., "127.0.0.1:6802")
    /// * `trace_id` - Id tagging this connection's log lines
    /// * `socket_timeout` - Bound on every read and flush
    ///
    /// # Errors
    ///
    /// Returns [`HmuxError::Connect`] on refusal, resolution failure or
    /// timeout.
    pub async fn open(
        transport: &TcpTransport,
        address: &str,
        trace_id: u64,
        socket_timeout: Duration,
    ) -> Result<Self> {
        let stream = transport.connect(address).await?;
        debug!("hmux[{}] connected to {}", trace_id, address);

        Ok(Self {
            codec: WireCodec::new(stream)
                .with_timeout(socket_timeout)
                .with_trace_id(trace_id),
            address: address.to_string(),
            trace_id,
            idle_start: None,
            ack_size: DEFAULT_ACK_SIZE,
            response_started: false,
            broken: false,
            keepalive: true,
            closed: false,
        })
    }

    /// Sets how many body bytes go out before the connection yields and
    /// waits for the backend's ack. Zero is treated as one.
    pub fn with_ack_size(mut self, ack_size: usize) -> Self {
        self.ack_size = ack_size.max(1);
        self
    }

    pub fn ack_size(&self) -> usize {
        self.ack_size
    }

    pub fn trace_id(&self) -> u64 {
        self.trace_id
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Writes the channel-open frame that starts a request.
    pub fn begin_request(&mut self) {
        self.codec.write_channel_open(REQUEST_CHANNEL);
    }

    /// Runs one full request/response cycle.
    ///
    /// Writes the channel open and every request attribute, streams the body
    /// as DATA frames of at most [`BODY_CHUNK_SIZE`] bytes, ends the request
    /// with quit and then dispatches the backend's response frames to `sink`
    /// until quit or exit.
    ///
    /// Every `ack_size` body bytes the connection writes a yield and reads
    /// response frames until the backend acks, so a backend that answers
    /// while the upload is still running is drained as it goes. If the
    /// backend finishes its response before the body is fully sent, the rest
    /// of the body is dropped and the connection is not reused.
    ///
    /// Any error leaves the connection broken; it must not be reused.
    pub async fn relay(
        &mut self,
        request: &RequestAttributes,
        body: Option<&mut (dyn AsyncRead + Unpin + Send)>,
        sink: &mut dyn ResponseSink,
    ) -> Result<()> {
        let result = self.relay_cycle(request, body, sink).await;
        if result.is_err() {
            self.broken = true;
        }
        result
    }

    async fn relay_cycle(
        &mut self,
        request: &RequestAttributes,
        body: Option<&mut (dyn AsyncRead + Unpin + Send)>,
        sink: &mut dyn ResponseSink,
    ) -> Result<()> {
        if self.closed {
            return Err(HmuxError::Transport(format!(
                "hmux[{}] connection already closed",
                self.trace_id
            )));
        }

        trace!("hmux[{}] U-w uri={} method={}", self.trace_id, request.uri, request.method);
        self.response_started = false;
        self.begin_request();
        for frame in request.to_frames() {
            self.codec.write_frame(&frame)?;
        }

        if let Some(body) = body {
            if !self.write_body(body, sink).await? {
                return Ok(());
            }
        }

        self.codec.write_opcode(Opcode::Quit);
        self.codec.flush().await?;

        match self.read_response(sink, false).await? {
            ResponseEnd::Exit => self.keepalive = false,
            ResponseEnd::Ack | ResponseEnd::Quit => {}
        }
        Ok(())
    }

    /// Streams the body. Returns false when the backend ended the response
    /// during an ack wait.
    async fn write_body(
        &mut self,
        body: &mut (dyn AsyncRead + Unpin + Send),
        sink: &mut dyn ResponseSink,
    ) -> Result<bool> {
        let mut chunk = BytesMut::zeroed(BODY_CHUNK_SIZE);
        let mut unacked = 0;
        loop {
            // A yield goes out after exactly `ack_size` bytes.
            let want = chunk.len().min(self.ack_size - unacked);
            let n = body
                .read(&mut chunk[..want])
                .await
                .map_err(|e| HmuxError::Protocol(format!("reading request body: {}", e)))?;
            if n == 0 {
                return Ok(true);
            }
            self.codec.write_attribute(Opcode::Data, &chunk[..n])?;
            unacked += n;

            if unacked >= self.ack_size {
                unacked = 0;
                self.codec.write_opcode(Opcode::Yield);
                self.codec.flush().await?;

                let end = self.read_response(sink, true).await?;
                if end != ResponseEnd::Ack {
                    debug!(
                        "hmux[{}] backend ended the response during the upload",
                        self.trace_id
                    );
                    self.keepalive = false;
                    return Ok(false);
                }
            } else {
                self.codec.flush().await?;
            }
        }
    }

    /// Dispatches response frames to `sink` until quit or exit, or until an
    /// ack when `until_ack` is set.
    async fn read_response(
        &mut self,
        sink: &mut dyn ResponseSink,
        until_ack: bool,
    ) -> Result<ResponseEnd> {
        // Header and meta-header names wait here for their `S` value frame.
        let mut pending: Option<(Opcode, String)> = None;

        loop {
            let frame = self.codec.read_frame().await?.ok_or_else(|| {
                HmuxError::Transport(format!(
                    "hmux[{}] backend closed the connection mid-response",
                    self.trace_id
                ))
            })?;
            self.response_started = true;

            if let Some((op, name)) = pending.take() {
                if frame.opcode != Opcode::String {
                    return Err(HmuxError::Protocol(format!(
                        "expected value for '{}' got '{}'",
                        name, frame.opcode
                    )));
                }
                let value = frame.payload_str();
                if op == Opcode::Header {
                    sink.header(&name, &value);
                } else {
                    debug!("hmux[{}] meta-header {}: {}", self.trace_id, name, value);
                }
                continue;
            }

            match frame.opcode {
                Opcode::Ack if until_ack => return Ok(ResponseEnd::Ack),
                Opcode::Channel | Opcode::Ack | Opcode::Yield => {}
                Opcode::Status => sink.status(&frame.payload_str()),
                Opcode::Header | Opcode::MetaHeader => {
                    pending = Some((frame.opcode, frame.payload_str()));
                }
                Opcode::SendHeader => sink.headers_complete(),
                Opcode::Data => sink.data(frame.payload),
                Opcode::Flush => sink.flush(),
                Opcode::Error => {
                    return Err(HmuxError::Protocol(format!(
                        "backend error: {}",
                        frame.payload_str()
                    )));
                }
                Opcode::Quit => return Ok(ResponseEnd::Quit),
                Opcode::Exit => return Ok(ResponseEnd::Exit),
                other => {
                    debug!("hmux[{}] ignoring '{}' in response", self.trace_id, other);
                }
            }
        }
    }

    /// True once the current cycle has read any frame from the backend.
    pub fn response_started(&self) -> bool {
        self.response_started
    }

    /// Stamps the start of an idle period.
    pub fn mark_idle(&mut self, now: Instant) {
        self.idle_start = Some(now);
    }

    pub fn clear_idle(&mut self) {
        self.idle_start = None;
    }

    pub fn idle_start(&self) -> Option<Instant> {
        self.idle_start
    }

    /// True when the connection has been idle for at least `idle_timeout`.
    /// An active connection never expires.
    pub fn is_expired(&self, now: Instant, idle_timeout: Duration) -> bool {
        match self.idle_start {
            Some(start) => now >= start + idle_timeout,
            None => false,
        }
    }

    pub fn mark_broken(&mut self) {
        self.broken = true;
    }

    /// True while the connection may go back into the idle ring.
    pub fn is_reusable(&self) -> bool {
        !self.broken && self.keepalive && !self.closed
    }

    /// Shuts the socket down. Calling it again does nothing.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.idle_start = None;
        self.codec.shutdown().await;
        debug!("hmux[{}] closed connection to {}", self.trace_id, self.address);
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("address", &self.address)
            .field("trace_id", &self.trace_id)
            .field("idle", &self.idle_start.is_some())
            .field("reusable", &self.is_reusable())
            .finish()
    }
}
