//! Path-discovery probe: walk TTLs 1..=maxHops toward each target in
//! parallel and record which router expired each probe.

pub mod ttl;

use std::collections::BTreeMap;
use std::net::{
    IpAddr,
    SocketAddr,
};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::stream::{
    FuturesUnordered,
    StreamExt,
};
use prometheus::core::Collector;
use prometheus::{
    HistogramOpts,
    HistogramVec,
    IntGaugeVec,
    Opts,
};
use schemars::schema::RootSchema;
use sparrow_commons::{
    CheckConfig,
    CheckKind,
    Hop,
    ResultEnvelope,
    RetryConfig,
    TracerouteConfig,
    TracerouteData,
    TracerouteResult,
    TracerouteTarget,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{
    debug,
    warn,
};

use crate::base::{
    run_interval_loop,
    Check,
    CheckBase,
};
use crate::dns::{
    HickoryProvider,
    LookupProvider,
};
use crate::error::CheckError;
use crate::metrics::{
    log_series_delete,
    DURATION_SEC_BUCKETS,
};
use crate::traceroute::ttl::{
    hop_blocking,
    ProbeSpec,
    TtlError,
};

/// One hop probe. Production walks real sockets on the blocking pool;
/// tests script the path.
#[async_trait]
pub(crate) trait TtlWalker: Send + Sync {
    async fn hop(&self, spec: ProbeSpec, ttl: u8) -> Result<Hop, TtlError>;
}

pub(crate) struct SocketWalker;

#[async_trait]
impl TtlWalker for SocketWalker {
    async fn hop(&self, spec: ProbeSpec, ttl: u8) -> Result<Hop, TtlError> {
        let mut hop = tokio::task::spawn_blocking(move || hop_blocking(&spec, ttl))
            .await
            .map_err(|e| TtlError::Join(e.to_string()))??;

        if hop.name.is_empty() && !hop.addr.ip.is_empty() {
            if let Ok(ip) = hop.addr.ip.parse::<IpAddr>() {
                let provider = HickoryProvider::new(spec.timeout);
                hop.name = tokio::time::timeout(spec.timeout, provider.reverse(ip))
                    .await
                    .ok()
                    .and_then(Result::ok)
                    .and_then(|names| names.into_iter().next())
                    .unwrap_or_default();
            }
        }
        Ok(hop)
    }
}

pub struct TracerouteCheck {
    base: CheckBase<TracerouteConfig>,
    metrics: TracerouteMetrics,
    walker: Arc<dyn TtlWalker>,
}

#[derive(Clone)]
struct TracerouteMetrics {
    min_hops: IntGaugeVec,
    duration: HistogramVec,
}

impl TracerouteCheck {
    pub fn new(config: TracerouteConfig) -> Result<Self, CheckError> {
        Self::with_walker(config, Arc::new(SocketWalker))
    }

    pub(crate) fn with_walker(
        config: TracerouteConfig, walker: Arc<dyn TtlWalker>,
    ) -> Result<Self, CheckError> {
        let min_hops = IntGaugeVec::new(
            Opts::new(
                "sparrow_traceroute_minhops",
                "Smallest TTL that reached the target in the last walk",
            ),
            &["target"],
        )?;
        let duration = HistogramVec::new(
            HistogramOpts::new(
                "sparrow_traceroute_duration_seconds",
                "Distribution of whole-walk durations per target",
            )
            .buckets(DURATION_SEC_BUCKETS.to_vec()),
            &["target"],
        )?;
        Ok(Self {
            base: CheckBase::new(config),
            metrics: TracerouteMetrics { min_hops, duration },
            walker,
        })
    }
}

pub fn data_schema() -> RootSchema {
    schemars::schema_for!(TracerouteData)
}

#[async_trait]
impl Check for TracerouteCheck {
    async fn run(
        &self, ctx: CancellationToken, sink: mpsc::Sender<ResultEnvelope>,
    ) -> Result<(), CheckError> {
        let metrics = self.metrics.clone();
        let walker = self.walker.clone();
        let probe_ctx = ctx.clone();
        run_interval_loop(
            &self.base,
            ctx,
            sink,
            CheckKind::Traceroute,
            |c| c.interval,
            move |config: TracerouteConfig| {
                let metrics = metrics.clone();
                let walker = walker.clone();
                let ctx = probe_ctx.clone();
                async move { check_traceroute(&ctx, &config, &metrics, walker).await }
            },
        )
        .await
    }

    async fn update_config(&self, config: CheckConfig) -> Result<(), CheckError> {
        match config {
            CheckConfig::Traceroute(c) => {
                self.base.set_config(c).await;
                Ok(())
            }
            other => Err(CheckError::ConfigMismatch {
                expected: CheckKind::Traceroute,
                got: other.kind(),
            }),
        }
    }

    async fn get_config(&self) -> CheckConfig {
        CheckConfig::Traceroute(self.base.config().await)
    }

    fn name(&self) -> CheckKind {
        CheckKind::Traceroute
    }

    fn schema(&self) -> RootSchema {
        data_schema()
    }

    fn metric_collectors(&self) -> Vec<Box<dyn Collector>> {
        vec![
            Box::new(self.metrics.min_hops.clone()),
            Box::new(self.metrics.duration.clone()),
        ]
    }

    fn remove_labelled_metrics(&self, target: &str) {
        let labels = &[target];
        log_series_delete(
            self.metrics.min_hops.remove_label_values(labels),
            "sparrow_traceroute_minhops",
            target,
        );
        log_series_delete(
            self.metrics.duration.remove_label_values(labels),
            "sparrow_traceroute_duration_seconds",
            target,
        );
    }

    fn shutdown(&self) {
        self.base.shutdown();
    }
}

async fn check_traceroute(
    ctx: &CancellationToken, config: &TracerouteConfig, metrics: &TracerouteMetrics,
    walker: Arc<dyn TtlWalker>,
) -> serde_json::Value {
    let mut data = TracerouteData::new();

    let mut walks: FuturesUnordered<_> = config
        .targets
        .iter()
        .cloned()
        .map(|target| {
            let walker = walker.clone();
            let config = config.clone();
            let ctx = ctx.clone();
            async move {
                let label = target.label();
                let started = Instant::now();
                let result = walk_target(&ctx, walker, &target, &config).await;
                (label, result, started.elapsed().as_secs_f64())
            }
        })
        .collect();

    while let Some((label, result, elapsed)) = walks.next().await {
        metrics
            .min_hops
            .with_label_values(&[&label])
            .set(i64::from(result.min_hops));
        metrics
            .duration
            .with_label_values(&[&label])
            .observe(elapsed);
        data.insert(label, result);
    }

    serde_json::json!(data)
}

async fn walk_target(
    ctx: &CancellationToken, walker: Arc<dyn TtlWalker>, target: &TracerouteTarget,
    config: &TracerouteConfig,
) -> TracerouteResult {
    let dest = match resolve_target(target).await {
        Ok(dest) => dest,
        Err(e) => {
            warn!(target = %target.label(), error = %e, "failed to resolve traceroute target");
            return TracerouteResult {
                min_hops: config.max_hops,
                hops: BTreeMap::new(),
            };
        }
    };

    let spec = ProbeSpec {
        dest,
        protocol: config.protocol,
        timeout: config.timeout,
    };

    let mut walks: FuturesUnordered<_> = (1..=config.max_hops)
        .map(|ttl| {
            let walker = walker.clone();
            let retry = config.retry;
            let ctx = ctx.clone();
            async move { walk_ttl(&ctx, walker, spec, ttl, retry).await }
        })
        .collect();

    let mut hops: BTreeMap<u8, Vec<Hop>> = BTreeMap::new();
    while let Some((ttl, attempts)) = walks.next().await {
        if !attempts.is_empty() {
            hops.insert(ttl, attempts);
        }
    }

    let min_hops = hops
        .iter()
        .filter(|(_, attempts)| attempts.iter().any(|hop| hop.reached))
        .map(|(ttl, _)| *ttl)
        .min()
        .unwrap_or(config.max_hops);

    TracerouteResult { min_hops, hops }
}

/// Probe one TTL within the retry budget. Every produced hop is recorded in
/// arrival order; a reached hop ends the budget early.
async fn walk_ttl(
    ctx: &CancellationToken, walker: Arc<dyn TtlWalker>, spec: ProbeSpec, ttl: u8,
    retry: RetryConfig,
) -> (u8, Vec<Hop>) {
    let mut attempts = Vec::new();

    for run in 0..=retry.count {
        if run > 0 && !retry.delay.is_zero() {
            tokio::select! {
                _ = ctx.cancelled() => break,
                _ = tokio::time::sleep(retry.delay) => {}
            }
        }
        if ctx.is_cancelled() {
            break;
        }

        match walker.hop(spec, ttl).await {
            Ok(hop) => {
                let reached = hop.reached;
                attempts.push(hop);
                if reached {
                    break;
                }
            }
            Err(e) => {
                debug!(ttl, error = %e, "hop attempt failed");
            }
        }
    }

    (ttl, attempts)
}

async fn resolve_target(target: &TracerouteTarget) -> Result<SocketAddr, String> {
    if let Ok(ip) = target.addr.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, target.port));
    }
    tokio::net::lookup_host((target.addr.as_str(), target.port))
        .await
        .map_err(|e| e.to_string())?
        .next()
        .ok_or_else(|| format!("no addresses for {}", target.addr))
}
