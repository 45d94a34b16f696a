// Copyright 2025 HMUX Connector Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! # HMUX CLI
//!
//! Helpers behind the `hmux` binary: argument validation, request building
//! and response rendering.
//!
//! ## Key Commands
//!
//! - `hmux call`: relay one request through the load balancer and print the
//!   response
//! - `hmux serve`: run a demo backend that echoes requests back

use anyhow::{anyhow, bail, Result};
use bytes::Bytes;
use hmux_balancer::{
    session_id, HashAffinity, RoundRobin, SelectionPolicy, SessionIndex, SingleBackend,
    DEFAULT_SESSION_COOKIE, DEFAULT_SESSION_URL_PREFIX,
};
use hmux_common::{RequestAttributes, Response};

/// Validates a backend address of the form `host:port`.
///
/// # Errors
///
/// Returns an error if the host is empty or the port is not a non-zero
/// 16-bit number.
pub fn validate_backend_addr(addr: &str) -> Result<()> {
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("Invalid backend address '{}': expected host:port", addr))?;

    if host.is_empty() {
        bail!("Invalid backend address '{}': missing host", addr);
    }
    match port.parse::<u16>() {
        Ok(0) | Err(_) => bail!("Invalid backend address '{}': bad port '{}'", addr, port),
        Ok(_) => Ok(()),
    }
}

/// Parses a `Name: value` header argument.
pub fn parse_header(raw: &str) -> Result<(String, String)> {
    let (name, value) = raw
        .split_once(':')
        .ok_or_else(|| anyhow!("Invalid header '{}': expected 'Name: value'", raw))?;

    let name = name.trim();
    if name.is_empty() || name.contains(char::is_whitespace) {
        bail!("Invalid header name in '{}'", raw);
    }
    Ok((name.to_string(), value.trim().to_string()))
}

/// Maps a `--policy` value to a selection policy.
pub fn policy_from_name(name: &str) -> Result<Box<dyn SelectionPolicy>> {
    match name {
        "single" => Ok(Box::new(SingleBackend)),
        "round-robin" => Ok(Box::new(RoundRobin::new())),
        "hash" => Ok(Box::new(HashAffinity::new())),
        "session" => Ok(Box::new(SessionIndex::new())),
        other => bail!(
            "Unknown policy '{}': expected single, round-robin, hash or session",
            other
        ),
    }
}

/// Routing hint for a request: the explicit `--hint` if given, otherwise
/// the session id from the `JSESSIONID` cookie or a `;jsessionid=` URI
/// parameter.
pub fn routing_hint<'a>(explicit: Option<&'a str>, request: &'a RequestAttributes) -> Option<&'a str> {
    explicit.or_else(|| session_id(request, DEFAULT_SESSION_COOKIE, DEFAULT_SESSION_URL_PREFIX))
}

/// Builds the request attributes for a call. A `?` in `uri` splits off the
/// query string; a body sets the content length.
pub fn build_request(
    method: &str,
    uri: &str,
    headers: &[(String, String)],
    body: Option<&str>,
) -> RequestAttributes {
    let (path, query) = match uri.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (uri, None),
    };

    let mut request = RequestAttributes::new(method.to_uppercase(), path).with_protocol("HTTP/1.1");
    if let Some(query) = query {
        request = request.with_query_string(query);
    }
    for (name, value) in headers {
        if name.eq_ignore_ascii_case("content-type") {
            request = request.with_content_type(value.clone());
        }
        request = request.with_header(name.clone(), value.clone());
    }
    if let Some(body) = body {
        request = request.with_content_length(body.len() as u64);
    }
    request
}

/// Status line and headers, one per line, followed by a blank line.
pub fn render_head(response: &Response) -> String {
    let mut out = String::new();
    out.push_str(&response.status);
    out.push('\n');
    for (name, value) in &response.headers {
        out.push_str(name);
        out.push_str(": ");
        out.push_str(value);
        out.push('\n');
    }
    out.push('\n');
    out
}

/// Response of the demo backend: the request line, its headers and the body,
/// as plain text.
pub fn echo_response(request: &RequestAttributes, body: &Bytes) -> Response {
    let mut text = format!("{} {}", request.method, request.uri);
    if let Some(query) = &request.query_string {
        text.push('?');
        text.push_str(query);
    }
    text.push('\n');
    for (name, value) in &request.headers {
        text.push_str(&format!("{}: {}\n", name, value));
    }
    text.push('\n');

    Response::new("200 OK")
        .with_header("Content-Type", "text/plain; charset=utf-8")
        .with_header("X-Echo-Length", body.len().to_string())
        .with_body(text)
        .with_body(body)
}

#[cfg(test)]
mod tests;
