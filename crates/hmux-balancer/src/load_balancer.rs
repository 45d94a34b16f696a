use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use futures::future::join_all;
use hmux_client::{relay, Backend, BackendConfig, BackendStats, PooledConnection};
use hmux_common::protocol::error::{HmuxError, Result};
use hmux_common::protocol::{RequestAttributes, ResponseSink};
use tokio::io::AsyncRead;
use tracing::{debug, info};

use crate::policy::{RoundRobin, SelectionPolicy};

/// Spreads requests over a fixed, ordered set of backends.
///
/// The injected [`SelectionPolicy`] picks the starting primary; from there
/// [`acquire`](Self::acquire) walks the primaries once, passing over backends
/// that are shut down or still inside their fail-recover window and moving on
/// when a backend's pool is exhausted or its connect fails. Backups (see
/// [`BackendConfig::with_backup`]) are tried in configured order only after
/// every primary.
///
/// # Example
///
/// ```rust,no_run
/// use hmux_balancer::{LoadBalancer, RoundRobin};
/// use hmux_client::BackendConfig;
/// use hmux_common::{RequestAttributes, Response};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let lb = LoadBalancer::new(
///     vec![BackendConfig::new("10.0.0.1:6802"), BackendConfig::new("10.0.0.2:6802")],
///     Box::new(RoundRobin::new()),
/// )?;
///
/// let mut response = Response::default();
/// lb.relay(None, &RequestAttributes::new("GET", "/"), None, &mut response).await?;
/// # Ok(())
/// # }
/// ```
pub struct LoadBalancer {
    /// Primaries first, then backups, each in configured order
    backends: Vec<Arc<Backend>>,
    primary_count: usize,
    policy: Box<dyn SelectionPolicy>,
}

impl LoadBalancer {
    /// Creates a balancer over the given backends.
    ///
    /// # Errors
    ///
    /// Returns [`HmuxError::InvalidConfig`] if there is no primary backend,
    /// an address appears twice or a backend configuration does not
    /// validate.
    pub fn new(configs: Vec<BackendConfig>, policy: Box<dyn SelectionPolicy>) -> Result<Self> {
        let (primaries, backups): (Vec<_>, Vec<_>) =
            configs.into_iter().partition(|config| !config.backup);
        if primaries.is_empty() {
            return Err(HmuxError::InvalidConfig(
                "load balancer needs at least one primary backend".to_string(),
            ));
        }
        let primary_count = primaries.len();

        let mut seen = HashSet::new();
        let mut backends = Vec::with_capacity(primary_count + backups.len());
        for config in primaries.into_iter().chain(backups) {
            if !seen.insert(config.address.clone()) {
                return Err(HmuxError::InvalidConfig(format!(
                    "backend {} listed twice",
                    config.address
                )));
            }
            backends.push(Arc::new(Backend::new(config)?));
        }

        info!(
            "Load balancer over {} backends, {} backup ({} policy)",
            backends.len(),
            backends.len() - primary_count,
            policy.name()
        );
        Ok(Self {
            backends,
            primary_count,
            policy,
        })
    }

    /// Round-robin balancer, the usual setup.
    pub fn with_round_robin(configs: Vec<BackendConfig>) -> Result<Self> {
        Self::new(configs, Box::new(RoundRobin::new()))
    }

    /// The primary the policy picks for `hint`.
    pub fn select_backend(&self, hint: Option<&str>) -> &Arc<Backend> {
        &self.backends[self.select_index(hint)]
    }

    fn select_index(&self, hint: Option<&str>) -> usize {
        self.policy.select(hint, self.primary_count) % self.primary_count
    }

    /// Acquires a connection, failing over across backends.
    ///
    /// Starting at the selected primary, every primary is tried at most once,
    /// then every backup in order. Shut-down backends are skipped, as are
    /// Inactive backends still inside their fail-recover window unless the
    /// balancer has only one backend. Pool exhaustion and connect failures
    /// move on to the next backend.
    ///
    /// # Errors
    ///
    /// - With a single backend, that backend's `PoolExhausted` or `Connect`
    ///   error
    /// - Otherwise [`HmuxError::NoBackendAvailable`] when no backend yields a
    ///   connection
    pub async fn acquire(&self, hint: Option<&str>) -> Result<PooledConnection> {
        let count = self.backends.len();
        let primaries = &self.backends[..self.primary_count];
        let start = self.select_index(hint);
        let order = (0..primaries.len())
            .map(|offset| &primaries[(start + offset) % primaries.len()])
            .chain(&self.backends[self.primary_count..]);
        let now = Instant::now();
        let mut last_err = None;

        for backend in order {
            if backend.is_closed() {
                debug!("{}: skipping shut-down backend", backend.address());
                continue;
            }
            if count > 1 && !backend.is_available(now) {
                debug!("{}: skipping inactive backend", backend.address());
                continue;
            }

            if backend.is_backup() {
                debug!("{}: no primary available, trying backup", backend.address());
            }
            match backend.acquire().await {
                Ok(lease) => return Ok(lease),
                Err(e) if e.is_retryable() => {
                    debug!("{}: {}, trying next backend", backend.address(), e);
                    last_err = Some(e);
                }
                Err(HmuxError::NoBackendAvailable) => continue,
                Err(e) => return Err(e),
            }
        }

        match last_err {
            Some(e) if count == 1 => Err(e),
            _ => Err(HmuxError::NoBackendAvailable),
        }
    }

    /// Acquires a connection and relays one request over it.
    pub async fn relay(
        &self,
        hint: Option<&str>,
        request: &RequestAttributes,
        body: Option<&mut (dyn AsyncRead + Unpin + Send)>,
        sink: &mut dyn ResponseSink,
    ) -> Result<()> {
        let lease = self.acquire(hint).await?;
        relay(lease, request, body, sink).await
    }

    /// Shuts every backend down concurrently.
    pub async fn shutdown(&self) {
        join_all(self.backends.iter().map(|backend| backend.shutdown())).await;
        info!("Load balancer shut down");
    }

    /// Puts every backend back in service after a shutdown.
    pub fn start(&self) {
        for backend in &self.backends {
            backend.start();
        }
    }

    pub fn stats(&self) -> Vec<BackendStats> {
        self.backends.iter().map(|backend| backend.stats()).collect()
    }

    /// Looks a backend up by address.
    pub fn backend(&self, address: &str) -> Option<&Arc<Backend>> {
        self.backends.iter().find(|backend| backend.address() == address)
    }

    pub fn backends(&self) -> &[Arc<Backend>] {
        &self.backends
    }

    pub fn backend_count(&self) -> usize {
        self.backends.len()
    }

    pub fn primary_count(&self) -> usize {
        self.primary_count
    }

    pub fn policy_name(&self) -> &'static str {
        self.policy.name()
    }
}
