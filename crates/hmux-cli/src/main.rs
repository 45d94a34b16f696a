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

//! # HMUX CLI Entry Point
//!
//! ## Usage
//!
//! ```bash
//! # Run a demo backend
//! hmux serve -b 127.0.0.1:6802
//!
//! # Relay a request through two backends, with a backup
//! hmux call -b 127.0.0.1:6802 -b 127.0.0.1:6803 --backup 127.0.0.1:6804 /index.jsp
//!
//! # Route a session back to the backend that owns it
//! hmux call -b 127.0.0.1:6802 -b 127.0.0.1:6803 --policy session \
//!     -H 'Cookie: JSESSIONID=bXr81' /cart
//!
//! # POST with a header, pinned to a backend by session id
//! hmux call -b 127.0.0.1:6802 --policy hash --hint abc123 \
//!     -X POST -H 'Content-Type: application/json' -d '{"n":1}' /orders
//! ```

use std::io::Write;
use std::time::Duration;

use anyhow::{bail, Result};
use argh::FromArgs;
use bytes::Bytes;
use hmux_balancer::LoadBalancer;
use hmux_cli::{
    build_request, echo_response, parse_header, policy_from_name, render_head, routing_hint,
    validate_backend_addr,
};
use hmux_client::BackendConfig;
use hmux_common::transport::HmuxServer;
use hmux_common::{RequestAttributes, Response};
use tokio::io::AsyncRead;

#[derive(FromArgs)]
/// HMUX load-balancing connector
struct Cli {
    #[argh(subcommand)]
    command: Commands,
}

/// Available CLI subcommands.
///
/// - **Call**: relay one request and print the response
/// - **Serve**: run the echo backend
#[derive(FromArgs)]
#[argh(subcommand)]
enum Commands {
    Call(CallArgs),
    Serve(ServeArgs),
}

#[derive(FromArgs)]
#[argh(subcommand, name = "call")]
/// relay one request through the load balancer
struct CallArgs {
    /// backend address as host:port; repeat for several backends
    #[argh(option, short = 'b', long = "backend")]
    backends: Vec<String>,

    /// backup backend address, used only when no primary is available;
    /// repeatable
    #[argh(option, long = "backup")]
    backups: Vec<String>,

    /// backend selection policy: single, round-robin, hash or session
    #[argh(option, long = "policy", default = "\"round-robin\".into()")]
    policy: String,

    /// routing hint, e.g. a session id; defaults to the request's session id
    #[argh(option, long = "hint")]
    hint: Option<String>,

    /// request method
    #[argh(option, short = 'X', long = "method", default = "\"GET\".into()")]
    method: String,

    /// request header as 'Name: value'; repeatable
    #[argh(option, short = 'H', long = "header")]
    headers: Vec<String>,

    /// request body
    #[argh(option, short = 'd', long = "data")]
    data: Option<String>,

    /// maximum connections per backend
    #[argh(option, long = "max-connections", default = "256")]
    max_connections: usize,

    /// connect timeout in milliseconds
    #[argh(option, long = "connect-timeout", default = "5000")]
    connect_timeout_ms: u64,

    /// socket read/write timeout in milliseconds
    #[argh(option, long = "socket-timeout", default = "30000")]
    socket_timeout_ms: u64,

    /// print backend statistics as JSON after the response
    #[argh(switch, long = "stats")]
    stats: bool,

    /// request URI, optionally with a query string
    #[argh(positional)]
    uri: String,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "serve")]
/// run a demo HMUX backend that echoes requests
struct ServeArgs {
    /// address to bind the backend to
    #[argh(option, short = 'b', default = "\"127.0.0.1:6802\".into()")]
    bind: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli: Cli = argh::from_env();

    // `call` writes the response to stdout, so only warnings reach stderr
    // unless RUST_LOG says otherwise.
    let default_level = match cli.command {
        Commands::Call(_) => "warn",
        Commands::Serve(_) => "info",
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Call(args) => run_call(args).await,
        Commands::Serve(args) => run_serve(args).await,
    }
}

/// Executes the `call` subcommand.
///
/// # Errors
///
/// Returns an error if:
/// - No backend is given or an address or header is malformed
/// - The policy name is unknown
/// - The request cannot be relayed
async fn run_call(args: CallArgs) -> Result<()> {
    if args.backends.is_empty() {
        bail!("At least one backend is required (-b host:port)");
    }
    for addr in args.backends.iter().chain(&args.backups) {
        validate_backend_addr(addr)?;
    }
    let headers = args
        .headers
        .iter()
        .map(|raw| parse_header(raw))
        .collect::<Result<Vec<_>>>()?;
    let policy = policy_from_name(&args.policy)?;

    let primaries = args.backends.iter().map(|addr| (addr, false));
    let backups = args.backups.iter().map(|addr| (addr, true));
    let configs = primaries
        .chain(backups)
        .map(|(addr, backup)| {
            BackendConfig::new(addr.as_str())
                .with_backup(backup)
                .with_max_connections(args.max_connections)
                .with_connect_timeout(Duration::from_millis(args.connect_timeout_ms))
                .with_socket_timeout(Duration::from_millis(args.socket_timeout_ms))
        })
        .collect();
    let lb = LoadBalancer::new(configs, policy)?;

    let request = build_request(&args.method, &args.uri, &headers, args.data.as_deref());
    tracing::debug!("Relaying {} {} via {} policy", request.method, request.uri, lb.policy_name());

    let mut body = args.data.as_deref().map(str::as_bytes);
    let body_reader = body
        .as_mut()
        .map(|reader| reader as &mut (dyn AsyncRead + Unpin + Send));

    let mut response = Response::default();
    let result = lb
        .relay(routing_hint(args.hint.as_deref(), &request), &request, body_reader, &mut response)
        .await;

    if args.stats {
        eprintln!("{}", serde_json::to_string_pretty(&lb.stats())?);
    }
    lb.shutdown().await;
    result?;

    let mut stdout = std::io::stdout().lock();
    stdout.write_all(render_head(&response).as_bytes())?;
    stdout.write_all(&response.body)?;
    stdout.flush()?;

    Ok(())
}

/// Executes the `serve` subcommand. Runs until the process is killed.
async fn run_serve(args: ServeArgs) -> Result<()> {
    let server = HmuxServer::new(&args.bind).await?;
    tracing::info!("HMUX echo backend listening on {}", server.local_addr()?);

    server
        .run_with_handler(|request: RequestAttributes, body: Bytes| async move {
            echo_response(&request, &body)
        })
        .await?;

    Ok(())
}
