use bytes::{Bytes, BytesMut};
use tokio::sync::mpsc;

/// Receives the pieces of a backend response as the relay decodes them.
///
/// Implementations must not block: the relay calls them between socket
/// reads.
pub trait ResponseSink: Send {
    /// Status line, e.g. `200 OK`.
    fn status(&mut self, status: &str);

    fn header(&mut self, name: &str, value: &str);

    /// The backend has sent every header.
    fn headers_complete(&mut self) {}

    fn data(&mut self, chunk: Bytes);

    /// The backend asked for buffered output to be pushed downstream.
    fn flush(&mut self) {}
}

/// A complete response, either collected from a relay or built by a backend
/// handler.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Response {
    pub status: String,
    pub headers: Vec<(String, String)>,
    pub body: BytesMut,
}

impl Response {
    pub fn new(status: impl Into<String>) -> Self {
        Self {
            status: status.into(),
            ..Default::default()
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl AsRef<[u8]>) -> Self {
        self.body.extend_from_slice(body.as_ref());
        self
    }

    /// Numeric status code parsed from the leading digits of the status line.
    pub fn status_code(&self) -> Option<u16> {
        self.status.split_whitespace().next()?.parse().ok()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Character set named by the `Content-Type` header, if any.
    pub fn charset(&self) -> Option<&str> {
        let content_type = self.header("Content-Type")?;
        content_type.split(';').skip(1).find_map(|param| {
            let (key, value) = param.split_once('=')?;
            if key.trim().eq_ignore_ascii_case("charset") {
                Some(value.trim().trim_matches('"'))
            } else {
                None
            }
        })
    }
}

impl ResponseSink for Response {
    fn status(&mut self, status: &str) {
        self.status = status.to_string();
    }

    fn header(&mut self, name: &str, value: &str) {
        self.headers.push((name.to_string(), value.to_string()));
    }

    fn data(&mut self, chunk: Bytes) {
        self.body.extend_from_slice(&chunk);
    }
}

/// One piece of a streamed response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseEvent {
    Status(String),
    Header(String, String),
    HeadersComplete,
    Data(Bytes),
    Flush,
}

/// Streams the response to a consumer task. Events sent after the receiver
/// is gone are dropped.
impl ResponseSink for mpsc::UnboundedSender<ResponseEvent> {
    fn status(&mut self, status: &str) {
        let _ = self.send(ResponseEvent::Status(status.to_string()));
    }

    fn header(&mut self, name: &str, value: &str) {
        let _ = self.send(ResponseEvent::Header(name.to_string(), value.to_string()));
    }

    fn headers_complete(&mut self) {
        let _ = self.send(ResponseEvent::HeadersComplete);
    }

    fn data(&mut self, chunk: Bytes) {
        let _ = self.send(ResponseEvent::Data(chunk));
    }

    fn flush(&mut self) {
        let _ = self.send(ResponseEvent::Flush);
    }
}
