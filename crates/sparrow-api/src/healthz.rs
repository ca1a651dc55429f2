//! The agent probes its own API and folds the sweep into a readiness flag
//! the `/healthz` route serves, so orchestrators get a single answer
//! covering every live check route.

use std::net::SocketAddr;
use std::sync::atomic::{
    AtomicBool,
    Ordering,
};
use std::sync::Arc;
use std::time::Duration;

use sparrow_commons::CheckKind;
use tracing::{
    debug,
    warn,
};

use crate::error::ApiError;

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared readiness flag: the self-healthz loop writes it after every
/// sweep, the `/healthz` route reads it. Starts healthy so a freshly bound
/// server is ready before the first sweep completes.
#[derive(Clone, Debug)]
pub struct HealthState {
    healthy: Arc<AtomicBool>,
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthState {
    pub fn new() -> Self {
        Self {
            healthy: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }
}

pub struct HealthzProber {
    base_url: String,
    client: reqwest::Client,
}

impl HealthzProber {
    pub fn new(address: SocketAddr, tls_enabled: bool) -> Result<Self, ApiError> {
        let scheme = if tls_enabled { "https" } else { "http" };
        let client = reqwest::Client::builder()
            .timeout(PROBE_TIMEOUT)
            .danger_accept_invalid_certs(tls_enabled)
            .build()
            .map_err(|e| ApiError::Config(e.to_string()))?;
        Ok(Self {
            base_url: format!("{scheme}://{address}"),
            client,
        })
    }

    /// GET `/metrics` plus every live check's result route; any non-200
    /// makes the agent report unhealthy overall.
    pub async fn probe(&self, kinds: &[CheckKind]) -> bool {
        let mut paths = vec!["/metrics".to_string()];
        paths.extend(kinds.iter().map(|kind| format!("/v1/metrics/{kind}")));

        for path in paths {
            let url = format!("{}{path}", self.base_url);
            match self.client.get(&url).send().await {
                Ok(response) if response.status() == reqwest::StatusCode::OK => {
                    debug!(%url, "healthz probe ok");
                }
                Ok(response) => {
                    warn!(%url, status = %response.status(), "healthz probe failed");
                    return false;
                }
                Err(e) => {
                    warn!(%url, error = %e, "healthz probe unreachable");
                    return false;
                }
            }
        }
        true
    }
}
