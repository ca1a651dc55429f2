//! Name-resolution probe. IP-literal targets get a reverse lookup, anything
//! else a forward lookup, through a resolver whose own timeout follows the
//! check config.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::{
    Duration,
    Instant,
};

use async_trait::async_trait;
use futures::stream::{
    FuturesUnordered,
    StreamExt,
};
use hickory_resolver::config::ResolverConfig;
use hickory_resolver::name_server::TokioConnectionProvider;
use hickory_resolver::{
    Resolver,
    TokioResolver,
};
use prometheus::core::Collector;
use prometheus::{
    GaugeVec,
    HistogramOpts,
    HistogramVec,
    IntCounterVec,
    IntGaugeVec,
    Opts,
};
use schemars::schema::RootSchema;
use sparrow_commons::{
    CheckConfig,
    CheckKind,
    DnsConfig,
    DnsData,
    DnsResult,
    ResultEnvelope,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::base::{
    run_interval_loop,
    Check,
    CheckBase,
};
use crate::error::CheckError;
use crate::metrics::{
    log_series_delete,
    DURATION_SEC_BUCKETS,
};
use crate::retry::{
    retry,
    RetryError,
};

/// The lookup seam. Production goes through hickory; tests script answers.
#[async_trait]
pub(crate) trait LookupProvider: Send + Sync {
    async fn forward(&self, host: &str) -> Result<Vec<String>, String>;
    async fn reverse(&self, ip: IpAddr) -> Result<Vec<String>, String>;
}

pub(crate) struct HickoryProvider {
    resolver: TokioResolver,
}

impl HickoryProvider {
    pub(crate) fn new(timeout: Duration) -> Self {
        let mut builder = Resolver::builder_with_config(
            ResolverConfig::default(),
            TokioConnectionProvider::default(),
        );
        builder.options_mut().timeout = timeout;
        Self {
            resolver: builder.build(),
        }
    }
}

#[async_trait]
impl LookupProvider for HickoryProvider {
    async fn forward(&self, host: &str) -> Result<Vec<String>, String> {
        let lookup = self
            .resolver
            .lookup_ip(host)
            .await
            .map_err(|e| e.to_string())?;
        let mut ips: Vec<String> = lookup.iter().map(|ip| ip.to_string()).collect();
        ips.sort();
        Ok(ips)
    }

    async fn reverse(&self, ip: IpAddr) -> Result<Vec<String>, String> {
        let lookup = self
            .resolver
            .reverse_lookup(ip)
            .await
            .map_err(|e| e.to_string())?;
        let mut names: Vec<String> = lookup
            .iter()
            .map(|ptr| ptr.to_string().trim_end_matches('.').to_string())
            .collect();
        names.sort();
        Ok(names)
    }
}

type ProviderFactory = Arc<dyn Fn(Duration) -> Arc<dyn LookupProvider> + Send + Sync>;

pub struct DnsCheck {
    base: CheckBase<DnsConfig>,
    metrics: DnsMetrics,
    provider_factory: ProviderFactory,
}

#[derive(Clone)]
struct DnsMetrics {
    status: IntGaugeVec,
    duration: GaugeVec,
    count: IntCounterVec,
    histogram: HistogramVec,
}

impl DnsCheck {
    pub fn new(config: DnsConfig) -> Result<Self, CheckError> {
        Self::with_provider_factory(
            config,
            Arc::new(|timeout| Arc::new(HickoryProvider::new(timeout)) as Arc<dyn LookupProvider>),
        )
    }

    pub(crate) fn with_provider_factory(
        config: DnsConfig, provider_factory: ProviderFactory,
    ) -> Result<Self, CheckError> {
        let status = IntGaugeVec::new(
            Opts::new(
                "sparrow_dns_status",
                "1 when the last lookup for the target succeeded, 0 otherwise",
            ),
            &["target"],
        )?;
        let duration = GaugeVec::new(
            Opts::new(
                "sparrow_dns_duration",
                "Seconds the last lookup for the target took",
            ),
            &["target"],
        )?;
        let count = IntCounterVec::new(
            Opts::new("sparrow_dns_check_count", "DNS lookups issued per target"),
            &["target"],
        )?;
        let histogram = HistogramVec::new(
            HistogramOpts::new(
                "sparrow_dns_duration_seconds",
                "Distribution of lookup durations",
            )
            .buckets(DURATION_SEC_BUCKETS.to_vec()),
            &["target"],
        )?;
        Ok(Self {
            base: CheckBase::new(config),
            metrics: DnsMetrics {
                status,
                duration,
                count,
                histogram,
            },
            provider_factory,
        })
    }
}

pub fn data_schema() -> RootSchema {
    schemars::schema_for!(DnsData)
}

#[async_trait]
impl Check for DnsCheck {
    async fn run(
        &self, ctx: CancellationToken, sink: mpsc::Sender<ResultEnvelope>,
    ) -> Result<(), CheckError> {
        let metrics = self.metrics.clone();
        let factory = self.provider_factory.clone();
        let probe_ctx = ctx.clone();
        run_interval_loop(
            &self.base,
            ctx,
            sink,
            CheckKind::Dns,
            |c| c.interval,
            move |config: DnsConfig| {
                let metrics = metrics.clone();
                let provider = factory(config.timeout);
                let ctx = probe_ctx.clone();
                async move { check_dns(&ctx, &config, &metrics, provider).await }
            },
        )
        .await
    }

    async fn update_config(&self, config: CheckConfig) -> Result<(), CheckError> {
        match config {
            CheckConfig::Dns(c) => {
                self.base.set_config(c).await;
                Ok(())
            }
            other => Err(CheckError::ConfigMismatch {
                expected: CheckKind::Dns,
                got: other.kind(),
            }),
        }
    }

    async fn get_config(&self) -> CheckConfig {
        CheckConfig::Dns(self.base.config().await)
    }

    fn name(&self) -> CheckKind {
        CheckKind::Dns
    }

    fn schema(&self) -> RootSchema {
        data_schema()
    }

    fn metric_collectors(&self) -> Vec<Box<dyn Collector>> {
        vec![
            Box::new(self.metrics.status.clone()),
            Box::new(self.metrics.duration.clone()),
            Box::new(self.metrics.count.clone()),
            Box::new(self.metrics.histogram.clone()),
        ]
    }

    fn remove_labelled_metrics(&self, target: &str) {
        let labels = &[target];
        log_series_delete(
            self.metrics.status.remove_label_values(labels),
            "sparrow_dns_status",
            target,
        );
        log_series_delete(
            self.metrics.duration.remove_label_values(labels),
            "sparrow_dns_duration",
            target,
        );
        log_series_delete(
            self.metrics.count.remove_label_values(labels),
            "sparrow_dns_check_count",
            target,
        );
        log_series_delete(
            self.metrics.histogram.remove_label_values(labels),
            "sparrow_dns_duration_seconds",
            target,
        );
    }

    fn shutdown(&self) {
        self.base.shutdown();
    }
}

async fn check_dns(
    ctx: &CancellationToken, config: &DnsConfig, metrics: &DnsMetrics,
    provider: Arc<dyn LookupProvider>,
) -> serde_json::Value {
    let mut data = DnsData::new();

    let mut probes: FuturesUnordered<_> = config
        .targets
        .iter()
        .cloned()
        .map(|target| {
            let provider = provider.clone();
            let retry_config = config.retry;
            let timeout = config.timeout;
            let ctx = ctx.clone();
            async move {
                let outcome = retry(&ctx, retry_config, || {
                    probe_target(provider.as_ref(), &target, timeout)
                })
                .await;
                let result = match outcome {
                    Ok(result) => result,
                    Err(RetryError::Exhausted(e)) => DnsResult {
                        resolved: vec![],
                        error: Some(e),
                        total: 0.0,
                    },
                    Err(RetryError::Cancelled) => DnsResult {
                        resolved: vec![],
                        error: Some("cancelled".to_string()),
                        total: 0.0,
                    },
                };
                (target, result)
            }
        })
        .collect();

    while let Some((target, result)) = probes.next().await {
        let status = i64::from(result.error.is_none());
        metrics.status.with_label_values(&[&target]).set(status);
        metrics
            .duration
            .with_label_values(&[&target])
            .set(result.total);
        metrics.count.with_label_values(&[&target]).inc();
        metrics
            .histogram
            .with_label_values(&[&target])
            .observe(result.total);
        data.insert(target, result);
    }

    serde_json::json!(data)
}

async fn probe_target(
    provider: &dyn LookupProvider, target: &str, timeout: Duration,
) -> Result<DnsResult, String> {
    let started = Instant::now();

    let lookup = async {
        match target.parse::<IpAddr>() {
            Ok(ip) => provider.reverse(ip).await,
            Err(_) => provider.forward(target).await,
        }
    };

    let resolved = tokio::time::timeout(timeout, lookup)
        .await
        .map_err(|_| format!("lookup timed out after {timeout:?}"))??;

    Ok(DnsResult {
        resolved,
        error: None,
        total: started.elapsed().as_secs_f64(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StubProvider;

    #[async_trait]
    impl LookupProvider for StubProvider {
        async fn forward(&self, host: &str) -> Result<Vec<String>, String> {
            match host {
                "localhost" => Ok(vec!["127.0.0.1".to_string()]),
                other => Err(format!("no such host: {other}")),
            }
        }

        async fn reverse(&self, ip: IpAddr) -> Result<Vec<String>, String> {
            match ip.to_string().as_str() {
                "127.0.0.1" => Ok(vec!["localhost".to_string()]),
                other => Err(format!("no PTR record for {other}")),
            }
        }
    }

    fn check_with_stub(targets: Vec<String>) -> DnsCheck {
        let config = DnsConfig {
            targets,
            interval: Duration::from_secs(1),
            timeout: Duration::from_secs(1),
            retry: sparrow_commons::RetryConfig {
                count: 0,
                delay: Duration::ZERO,
            },
        };
        DnsCheck::with_provider_factory(config, Arc::new(|_| Arc::new(StubProvider)))
            .expect("build check")
    }

    #[tokio::test]
    async fn test_forward_then_reverse() {
        let check = check_with_stub(vec!["localhost".to_string(), "127.0.0.1".to_string()]);
        let snapshot = check.base.config().await;
        let provider = (check.provider_factory)(snapshot.timeout);
        let data = check_dns(&CancellationToken::new(), &snapshot, &check.metrics, provider).await;

        assert_eq!(
            data["localhost"]["resolved"],
            serde_json::json!(["127.0.0.1"])
        );
        assert_eq!(
            data["127.0.0.1"]["resolved"],
            serde_json::json!(["localhost"])
        );
        assert!(data["localhost"]["error"].is_null());
    }

    #[tokio::test]
    async fn test_failed_lookup_sets_error_and_status() {
        let check = check_with_stub(vec!["missing.invalid".to_string()]);
        let snapshot = check.base.config().await;
        let provider = (check.provider_factory)(snapshot.timeout);
        let data = check_dns(&CancellationToken::new(), &snapshot, &check.metrics, provider).await;

        assert_eq!(data["missing.invalid"]["resolved"], serde_json::json!([]));
        assert!(!data["missing.invalid"]["error"].is_null());
        assert_eq!(
            check
                .metrics
                .status
                .with_label_values(&["missing.invalid"])
                .get(),
            0
        );
    }

    #[tokio::test]
    async fn test_success_sets_status_gauge() {
        let check = check_with_stub(vec!["localhost".to_string()]);
        let snapshot = check.base.config().await;
        let provider = (check.provider_factory)(snapshot.timeout);
        check_dns(&CancellationToken::new(), &snapshot, &check.metrics, provider).await;

        assert_eq!(
            check.metrics.status.with_label_values(&["localhost"]).get(),
            1
        );
        assert_eq!(
            check
                .metrics
                .count
                .with_label_values(&["localhost"])
                .get(),
            1
        );
    }
}
