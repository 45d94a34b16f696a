use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures::stream::{self, Stream};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use crate::protocol::error::{map_io_error, HmuxError, Result};
use crate::protocol::{Frame, FrameShape, Opcode, MAX_PAYLOAD_LEN};

const INITIAL_BUFFER_SIZE: usize = 1024;

/// Buffered HMUX frame codec over a byte transport.
///
/// Writes accumulate in an internal buffer and only reach the transport on
/// [`flush`](Self::flush). Reads pull whatever the transport has into a
/// second buffer and cut complete frames out of it, waiting for more bytes
/// when a frame is split across reads.
///
/// # Wire Format
///
/// ```text
/// Y | Q | X                      bare opcode
/// C [id: u16 BE]                 channel open
/// <op> [len: u16 BE] [len bytes] everything else
/// ```
///
/// # Example
///
/// ```no_run
/// use hmux_common::protocol::Opcode;
/// use hmux_common::transport::WireCodec;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let stream = tokio::net::TcpStream::connect("127.0.0.1:6802").await?;
/// let mut codec = WireCodec::new(stream);
///
/// codec.write_channel_open(1);
/// codec.write_attribute(Opcode::Uri, b"/index.jsp")?;
/// codec.write_attribute(Opcode::Method, b"GET")?;
/// codec.write_opcode(Opcode::Quit);
/// codec.flush().await?;
///
/// while let Some(frame) = codec.read_frame().await? {
///     if frame.opcode.is_terminal() {
///         break;
///     }
/// }
/// # Ok(())
/// # }
/// ```
pub struct WireCodec<S> {
    stream: S,
    write_buf: BytesMut,
    read_buf: BytesMut,
    io_timeout: Option<Duration>,
    trace_id: u64,
}

impl<S> WireCodec<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            write_buf: BytesMut::with_capacity(INITIAL_BUFFER_SIZE),
            read_buf: BytesMut::with_capacity(INITIAL_BUFFER_SIZE),
            io_timeout: None,
            trace_id: 0,
        }
    }

    /// Bounds every read and every flush by `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout = Some(timeout);
        self
    }

    /// Id used to tag this codec's trace output.
    pub fn with_trace_id(mut self, trace_id: u64) -> Self {
        self.trace_id = trace_id;
        self
    }

    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    pub fn into_inner(self) -> S {
        self.stream
    }

    /// Bytes written but not yet flushed.
    pub fn pending(&self) -> &[u8] {
        &self.write_buf
    }

    /// Writes a payload-less opcode.
    ///
    /// Length-carrying control codes (ack, error, flush, send-header) are
    /// written with a zero length so the frame stays decodable.
    pub fn write_opcode(&mut self, op: Opcode) {
        trace!("hmux[{}] {}-w", self.trace_id, op);
        self.write_buf.put_u8(op.as_u8());
        match op.shape() {
            FrameShape::Bare => {}
            FrameShape::Channel | FrameShape::Length => self.write_buf.put_u16(0),
        }
    }

    /// Writes opcode, 2-byte big-endian length, then the payload.
    ///
    /// Nothing is written when the payload is longer than 65535 bytes.
    pub fn write_attribute(&mut self, op: Opcode, payload: &[u8]) -> Result<()> {
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(HmuxError::Protocol(format!(
                "'{}' payload of {} bytes exceeds the {} byte frame limit",
                op,
                payload.len(),
                MAX_PAYLOAD_LEN
            )));
        }
        if op.shape() != FrameShape::Length {
            return Err(HmuxError::Protocol(format!(
                "'{}' does not carry a length-prefixed payload",
                op
            )));
        }

        trace!("hmux[{}] {}-w ({} bytes)", self.trace_id, op, payload.len());
        self.write_buf.reserve(3 + payload.len());
        self.write_buf.put_u8(op.as_u8());
        self.write_buf.put_u16(payload.len() as u16);
        self.write_buf.put_slice(payload);
        Ok(())
    }

    pub fn write_channel_open(&mut self, channel_id: u16) {
        trace!("hmux[{}] C-w channel={}", self.trace_id, channel_id);
        self.write_buf.put_u8(Opcode::Channel.as_u8());
        self.write_buf.put_u16(channel_id);
    }

    /// Writes any frame in its wire shape.
    pub fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        match frame.opcode.shape() {
            FrameShape::Bare => {
                self.write_opcode(frame.opcode);
                Ok(())
            }
            FrameShape::Channel => {
                let id = frame.channel_id().ok_or_else(|| {
                    HmuxError::Protocol("channel frame needs a 2-byte id".to_string())
                })?;
                self.write_channel_open(id);
                Ok(())
            }
            FrameShape::Length => self.write_attribute(frame.opcode, &frame.payload),
        }
    }

    /// Sends everything buffered. Partial writes are retried until the whole
    /// buffer is out or the transport fails.
    pub async fn flush(&mut self) -> Result<()> {
        if self.write_buf.is_empty() {
            return Ok(());
        }

        let len = self.write_buf.len();
        let timeout_ms = self.timeout_ms();
        let io_timeout = self.io_timeout;
        let stream = &mut self.stream;
        let buf = &self.write_buf[..];

        let write = async move {
            stream.write_all(buf).await?;
            stream.flush().await
        };

        let result = match io_timeout {
            Some(limit) => tokio::time::timeout(limit, write)
                .await
                .map_err(|_| HmuxError::Timeout(timeout_ms))?,
            None => write.await,
        };
        result.map_err(|e| map_io_error(e, "flushing frames", timeout_ms))?;

        trace!("hmux[{}] flushed {} bytes", self.trace_id, len);
        self.write_buf.clear();
        Ok(())
    }

    /// Reads the next frame.
    ///
    /// Returns `Ok(None)` when the transport closes cleanly between frames.
    /// Closing in the middle of a frame is a transport error; an opcode byte
    /// outside the table is a protocol error.
    pub async fn read_frame(&mut self) -> Result<Option<Frame>> {
        loop {
            if let Some(frame) = decode_frame(&mut self.read_buf)? {
                trace!(
                    "hmux[{}] {}-r ({} bytes)",
                    self.trace_id,
                    frame.opcode,
                    frame.payload.len()
                );
                return Ok(Some(frame));
            }

            if self.fill_read_buf().await? == 0 {
                if self.read_buf.is_empty() {
                    return Ok(None);
                }
                return Err(HmuxError::Transport(format!(
                    "connection closed with {} bytes of a partial frame",
                    self.read_buf.len()
                )));
            }
        }
    }

    /// Lazily yields frames until quit/exit (inclusive), transport closure, or
    /// the first error. Each call starts a fresh sequence from the current
    /// read position.
    pub fn frames(&mut self) -> impl Stream<Item = Result<Frame>> + '_ {
        stream::unfold((self, false), |(codec, done)| async move {
            if done {
                return None;
            }
            match codec.read_frame().await {
                Ok(Some(frame)) => {
                    let finished = frame.opcode.is_terminal();
                    Some((Ok(frame), (codec, finished)))
                }
                Ok(None) => None,
                Err(e) => Some((Err(e), (codec, true))),
            }
        })
    }

    /// Shuts the write half down, ignoring errors from an already-dead peer.
    pub async fn shutdown(&mut self) {
        let _ = self.stream.shutdown().await;
    }

    async fn fill_read_buf(&mut self) -> Result<usize> {
        let timeout_ms = self.timeout_ms();
        self.read_buf.reserve(INITIAL_BUFFER_SIZE);

        let read = self.stream.read_buf(&mut self.read_buf);
        let result = match self.io_timeout {
            Some(limit) => tokio::time::timeout(limit, read)
                .await
                .map_err(|_| HmuxError::Timeout(timeout_ms))?,
            None => read.await,
        };
        result.map_err(|e| map_io_error(e, "reading frame", timeout_ms))
    }

    fn timeout_ms(&self) -> u64 {
        self.io_timeout.map(|t| t.as_millis() as u64).unwrap_or(0)
    }
}

/// Cuts one complete frame off the front of `buf`, or returns `Ok(None)` if
/// more bytes are needed. `buf` is left untouched in that case.
pub fn decode_frame(buf: &mut BytesMut) -> Result<Option<Frame>> {
    let Some(&code) = buf.first() else {
        return Ok(None);
    };
    let opcode = Opcode::from_u8(code)
        .ok_or_else(|| HmuxError::Protocol(format!("unknown opcode 0x{:02x}", code)))?;

    match opcode.shape() {
        FrameShape::Bare => {
            buf.advance(1);
            Ok(Some(Frame::bare(opcode)))
        }
        FrameShape::Channel => {
            if buf.len() < 3 {
                return Ok(None);
            }
            buf.advance(1);
            let id = buf.split_to(2).freeze();
            Ok(Some(Frame::new(opcode, id)))
        }
        FrameShape::Length => {
            if buf.len() < 3 {
                return Ok(None);
            }
            let len = u16::from_be_bytes([buf[1], buf[2]]) as usize;
            if buf.len() < 3 + len {
                return Ok(None);
            }
            buf.advance(3);
            let payload: Bytes = buf.split_to(len).freeze();
            Ok(Some(Frame::new(opcode, payload)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_waits_for_full_payload() {
        let mut buf = BytesMut::from(&b"U\x00\x05/ind"[..]);
        assert_eq!(decode_frame(&mut buf).unwrap(), None);
        assert_eq!(buf.len(), 7);

        buf.extend_from_slice(b"ex");
        let frame = decode_frame(&mut buf).unwrap().unwrap();
        assert_eq!(frame, Frame::new(Opcode::Uri, &b"/inde"[..]));
        assert_eq!(&buf[..], b"x");
    }

    #[test]
    fn test_decode_waits_for_length_bytes() {
        let mut buf = BytesMut::from(&b"S\x00"[..]);
        assert_eq!(decode_frame(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_decode_bare_and_channel() {
        let mut buf = BytesMut::from(&b"C\x00\x02QY"[..]);
        let channel = decode_frame(&mut buf).unwrap().unwrap();
        assert_eq!(channel.channel_id(), Some(2));
        assert_eq!(decode_frame(&mut buf).unwrap(), Some(Frame::bare(Opcode::Quit)));
        assert_eq!(decode_frame(&mut buf).unwrap(), Some(Frame::bare(Opcode::Yield)));
        assert_eq!(decode_frame(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_decode_unknown_opcode() {
        let mut buf = BytesMut::from(&b"Z\x00\x00"[..]);
        assert!(matches!(decode_frame(&mut buf), Err(HmuxError::Protocol(_))));
    }

    #[test]
    fn test_decode_empty_payload() {
        let mut buf = BytesMut::from(&b"G\x00\x00"[..]);
        let frame = decode_frame(&mut buf).unwrap().unwrap();
        assert_eq!(frame.opcode, Opcode::SendHeader);
        assert!(frame.payload.is_empty());
    }

    #[tokio::test]
    async fn test_write_buffers_until_flush() {
        let (client, mut server) = tokio::io::duplex(64);
        let mut codec = WireCodec::new(client);

        codec.write_channel_open(1);
        codec.write_attribute(Opcode::Method, b"GET").unwrap();
        codec.write_opcode(Opcode::Quit);
        assert_eq!(codec.pending(), b"C\x00\x01m\x00\x03GETQ");

        codec.flush().await.unwrap();
        assert!(codec.pending().is_empty());

        let mut received = [0u8; 10];
        server.read_exact(&mut received).await.unwrap();
        assert_eq!(&received, b"C\x00\x01m\x00\x03GETQ");
    }

    #[tokio::test]
    async fn test_length_carrying_controls_get_zero_length() {
        let (client, _server) = tokio::io::duplex(64);
        let mut codec = WireCodec::new(client);
        codec.write_opcode(Opcode::Flush);
        codec.write_opcode(Opcode::Exit);
        assert_eq!(codec.pending(), b"f\x00\x00X");
    }

    #[tokio::test]
    async fn test_write_attribute_rejects_non_length_opcode() {
        let (client, _server) = tokio::io::duplex(64);
        let mut codec = WireCodec::new(client);
        assert!(codec.write_attribute(Opcode::Quit, b"").is_err());
        assert!(codec.pending().is_empty());
    }
}
