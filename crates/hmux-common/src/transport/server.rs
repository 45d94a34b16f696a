use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, warn};

use crate::protocol::error::{HmuxError, Result};
use crate::protocol::{Opcode, RequestAttributes, Response};
use crate::transport::codec::WireCodec;

/// Largest DATA frame the server writes.
pub const RESPONSE_CHUNK_SIZE: usize = 32 * 1024;

/// Channel id a backend answers on.
const RESPONSE_CHANNEL: u16 = 2;

/// Async HMUX backend server.
///
/// Accepts connections and serves channel sessions on each one until the
/// peer closes it or sends exit. Every session is decoded into
/// [`RequestAttributes`] plus the request body and handed to the handler; the
/// returned [`Response`] is written back as status, headers, send-header,
/// DATA chunks and quit. A yield from the connector is answered with an ack
/// right away.
pub struct HmuxServer {
    listener: TcpListener,
    accepted: Arc<AtomicUsize>,
}

impl HmuxServer {
    /// Creates a new server bound to the specified address.
    ///
    /// # Arguments
    /// * `bind_addr` - The address to bind to (e.g., "0.0.0.0:6802")
    pub async fn new(bind_addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|e| HmuxError::Transport(format!("Failed to bind to {}: {}", bind_addr, e)))?;

        Ok(Self {
            listener,
            accepted: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Gets the actual bound address.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .map_err(|e| HmuxError::Transport(format!("Failed to get local addr: {}", e)))
    }

    /// Shared count of accepted connections.
    pub fn accept_counter(&self) -> Arc<AtomicUsize> {
        self.accepted.clone()
    }

    /// Runs the server with the given request handler.
    ///
    /// Accepts connections in a loop and spawns a task for each. Each
    /// connection serves sessions back to back (keepalive).
    ///
    /// # Arguments
    /// * `handler` - Function building the response for a request and its body
    pub async fn run_with_handler<F, Fut>(&self, handler: F) -> Result<()>
    where
        F: Fn(RequestAttributes, Bytes) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Response> + Send + 'static,
    {
        let handler = Arc::new(handler);

        loop {
            let (stream, peer_addr) = self.listener.accept().await.map_err(|e| {
                HmuxError::Transport(format!("Failed to accept connection: {}", e))
            })?;
            let id = self.accepted.fetch_add(1, Ordering::SeqCst) as u64;
            debug!("Connection {} established from {}", id, peer_addr);

            let handler = handler.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, id, handler).await {
                    warn!("Connection {} error: {}", id, e);
                }
            });
        }
    }
}

/// Serves channel sessions on one connection until EOF or exit.
async fn handle_connection<F, Fut>(stream: TcpStream, id: u64, handler: Arc<F>) -> Result<()>
where
    F: Fn(RequestAttributes, Bytes) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Response> + Send + 'static,
{
    let mut codec = WireCodec::new(stream).with_trace_id(id);

    loop {
        let Some((request, body, exit)) = read_session(&mut codec).await? else {
            debug!("Connection {} closed by peer", id);
            return Ok(());
        };

        let response = handler(request, body).await;
        write_response(&mut codec, &response, exit)?;
        codec.flush().await?;

        if exit {
            codec.shutdown().await;
            return Ok(());
        }
    }
}

/// Reads one channel session. Returns `None` on a clean close before the
/// channel-open frame; the flag is true when the session ended with exit.
async fn read_session(
    codec: &mut WireCodec<TcpStream>,
) -> Result<Option<(RequestAttributes, Bytes, bool)>> {
    let Some(first) = codec.read_frame().await? else {
        return Ok(None);
    };
    if first.opcode != Opcode::Channel {
        return Err(HmuxError::Protocol(format!(
            "session must start with channel open, got '{}'",
            first.opcode
        )));
    }

    let mut request = RequestAttributes::default();
    let mut pending_header = None;
    let mut body = BytesMut::new();

    loop {
        let frame = codec.read_frame().await?.ok_or_else(|| {
            HmuxError::Transport("connection closed inside a channel session".to_string())
        })?;

        match frame.opcode {
            Opcode::Data => body.extend_from_slice(&frame.payload),
            Opcode::Quit => return Ok(Some((request, body.freeze(), false))),
            Opcode::Exit => return Ok(Some((request, body.freeze(), true))),
            Opcode::Yield => {
                // The connector waits for this before sending more body.
                codec.write_opcode(Opcode::Ack);
                codec.flush().await?;
            }
            Opcode::Flush | Opcode::Ack => {}
            _ => request.apply_frame(&frame, &mut pending_header)?,
        }
    }
}

fn write_response(
    codec: &mut WireCodec<TcpStream>,
    response: &Response,
    exit: bool,
) -> Result<()> {
    codec.write_channel_open(RESPONSE_CHANNEL);
    codec.write_attribute(Opcode::Status, response.status.as_bytes())?;
    for (name, value) in &response.headers {
        codec.write_attribute(Opcode::Header, name.as_bytes())?;
        codec.write_attribute(Opcode::String, value.as_bytes())?;
    }
    codec.write_opcode(Opcode::SendHeader);

    for chunk in response.body.chunks(RESPONSE_CHUNK_SIZE) {
        codec.write_attribute(Opcode::Data, chunk)?;
    }

    codec.write_opcode(if exit { Opcode::Exit } else { Opcode::Quit });
    Ok(())
}
