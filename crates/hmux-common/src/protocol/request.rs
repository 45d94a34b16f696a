use bytes::Bytes;

use super::error::{HmuxError, Result};
use super::frame::Frame;
use super::opcode::Opcode;

/// The request attributes relayed to a backend ahead of the body.
///
/// Unset optional attributes are simply not written. Headers keep their
/// insertion order and may repeat.
///
/// # Example
///
/// ```
/// use hmux_common::protocol::RequestAttributes;
///
/// let request = RequestAttributes::new("GET", "/index.jsp")
///     .with_query_string("a=1")
///     .with_header("Accept", "text/html")
///     .with_remote_addr("10.0.0.7");
///
/// assert_eq!(request.header("accept"), Some("text/html"));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestAttributes {
    pub uri: String,
    pub method: String,
    pub query_string: Option<String>,
    pub path_info: Option<String>,
    pub script_filename: Option<String>,
    pub real_path: Option<String>,
    pub content_type: Option<String>,
    pub content_length: Option<u64>,
    pub remote_user: Option<String>,
    pub auth_type: Option<String>,
    pub headers: Vec<(String, String)>,
    pub remote_addr: Option<String>,
    pub remote_host: Option<String>,
    pub remote_port: Option<u16>,
    pub server_name: Option<String>,
    pub server_port: Option<u16>,
    pub server_type: Option<String>,
    pub protocol: Option<String>,
    pub is_secure: bool,
    pub client_cert: Option<Bytes>,
}

impl RequestAttributes {
    pub fn new(method: impl Into<String>, uri: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            uri: uri.into(),
            ..Default::default()
        }
    }

    pub fn with_query_string(mut self, query: impl Into<String>) -> Self {
        self.query_string = Some(query.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_content_length(mut self, len: u64) -> Self {
        self.content_length = Some(len);
        self
    }

    pub fn with_remote_addr(mut self, addr: impl Into<String>) -> Self {
        self.remote_addr = Some(addr.into());
        self
    }

    pub fn with_remote_port(mut self, port: u16) -> Self {
        self.remote_port = Some(port);
        self
    }

    pub fn with_server(mut self, name: impl Into<String>, port: u16) -> Self {
        self.server_name = Some(name.into());
        self.server_port = Some(port);
        self
    }

    pub fn with_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = Some(protocol.into());
        self
    }

    pub fn with_secure(mut self, client_cert: Option<Bytes>) -> Self {
        self.is_secure = true;
        self.client_cert = client_cert;
        self
    }

    /// First header with the given name, compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Flattens the attributes into frames in the order backends expect them.
    ///
    /// Headers become `H` name / `S` value pairs. The remote host defaults to
    /// the remote address when only the latter is known.
    pub fn to_frames(&self) -> Vec<Frame> {
        let mut frames = Vec::with_capacity(16 + self.headers.len() * 2);
        let mut text = |op: Opcode, value: &str| {
            frames.push(Frame::new(op, Bytes::copy_from_slice(value.as_bytes())));
        };

        text(Opcode::Uri, &self.uri);
        text(Opcode::Method, &self.method);

        let optional = [
            (Opcode::QueryString, &self.query_string),
            (Opcode::PathInfo, &self.path_info),
            (Opcode::ScriptFilename, &self.script_filename),
            (Opcode::RealPath, &self.real_path),
            (Opcode::ContentType, &self.content_type),
        ];
        for (op, value) in optional {
            if let Some(value) = value {
                text(op, value);
            }
        }
        if let Some(len) = self.content_length {
            text(Opcode::ContentLength, &len.to_string());
        }
        if let Some(user) = &self.remote_user {
            text(Opcode::RemoteUser, user);
        }
        if let Some(auth) = &self.auth_type {
            text(Opcode::AuthType, auth);
        }

        for (name, value) in &self.headers {
            text(Opcode::Header, name);
            text(Opcode::String, value);
        }

        if let Some(addr) = &self.remote_addr {
            text(Opcode::RemoteAddr, addr);
        }
        if let Some(host) = self.remote_host.as_ref().or(self.remote_addr.as_ref()) {
            text(Opcode::RemoteHost, host);
        }
        if let Some(port) = self.remote_port {
            text(Opcode::RemotePort, &port.to_string());
        }
        if let Some(name) = &self.server_name {
            text(Opcode::ServerName, name);
        }
        if let Some(port) = self.server_port {
            text(Opcode::ServerPort, &port.to_string());
        }
        if let Some(server_type) = &self.server_type {
            text(Opcode::ServerType, server_type);
        }
        if let Some(protocol) = &self.protocol {
            text(Opcode::HttpProtocol, protocol);
        }
        if self.is_secure {
            text(Opcode::IsSecure, "");
        }

        if let Some(cert) = &self.client_cert {
            frames.push(Frame::new(Opcode::ClientCert, cert.clone()));
        }

        frames
    }

    /// Applies one decoded frame, the inverse of [`to_frames`](Self::to_frames).
    ///
    /// `pending_header` carries a header name between its `H` frame and the
    /// following `S` value frame.
    pub fn apply_frame(&mut self, frame: &Frame, pending_header: &mut Option<String>) -> Result<()> {
        if let Some(name) = pending_header.take() {
            if frame.opcode != Opcode::String {
                return Err(HmuxError::Protocol(format!(
                    "expected header value after '{}', got '{}'",
                    name, frame.opcode
                )));
            }
            self.headers.push((name, frame.payload_str()));
            return Ok(());
        }

        let text = frame.payload_str();
        match frame.opcode {
            Opcode::Uri | Opcode::CseUri => self.uri = text,
            Opcode::Method => self.method = text,
            Opcode::QueryString => self.query_string = Some(text),
            Opcode::PathInfo => self.path_info = Some(text),
            Opcode::ScriptFilename => self.script_filename = Some(text),
            Opcode::RealPath => self.real_path = Some(text),
            Opcode::ContentType => self.content_type = Some(text),
            Opcode::ContentLength => self.content_length = Some(parse_number(&text, "content length")?),
            Opcode::RemoteUser => self.remote_user = Some(text),
            Opcode::AuthType => self.auth_type = Some(text),
            Opcode::Header => *pending_header = Some(text),
            Opcode::RemoteAddr => self.remote_addr = Some(text),
            Opcode::RemoteHost => self.remote_host = Some(text),
            Opcode::RemotePort => self.remote_port = Some(parse_number(&text, "remote port")?),
            Opcode::ServerName => self.server_name = Some(text),
            Opcode::ServerPort => self.server_port = Some(parse_number(&text, "server port")?),
            Opcode::ServerType => self.server_type = Some(text),
            Opcode::HttpProtocol => self.protocol = Some(text),
            Opcode::IsSecure => self.is_secure = true,
            Opcode::ClientCert => self.client_cert = Some(frame.payload.clone()),
            other => {
                return Err(HmuxError::Protocol(format!(
                    "unexpected '{}' frame in request attributes",
                    other
                )))
            }
        }
        Ok(())
    }
}

fn parse_number<T: std::str::FromStr>(text: &str, what: &str) -> Result<T> {
    text.trim()
        .parse()
        .map_err(|_| HmuxError::Protocol(format!("invalid {}: '{}'", what, text)))
}
