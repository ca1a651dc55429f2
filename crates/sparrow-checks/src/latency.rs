//! Latency probe: wall-clock seconds from request start to body close,
//! plus the status code the target answered with.

use std::time::Instant;

use async_trait::async_trait;
use futures::stream::{
    FuturesUnordered,
    StreamExt,
};
use prometheus::core::Collector;
use prometheus::{
    GaugeVec,
    HistogramOpts,
    HistogramVec,
    IntCounterVec,
    Opts,
};
use schemars::schema::RootSchema;
use sparrow_commons::{
    CheckConfig,
    CheckKind,
    LatencyConfig,
    LatencyData,
    LatencyResult,
    ResultEnvelope,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::error;

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

pub struct LatencyCheck {
    base: CheckBase<LatencyConfig>,
    metrics: LatencyMetrics,
}

#[derive(Clone)]
struct LatencyMetrics {
    seconds: GaugeVec,
    count: IntCounterVec,
    duration: HistogramVec,
}

impl LatencyCheck {
    pub fn new(config: LatencyConfig) -> Result<Self, CheckError> {
        let seconds = GaugeVec::new(
            Opts::new(
                "sparrow_latency_seconds",
                "Seconds the target took to answer the last probe",
            ),
            &["target"],
        )?;
        let count = IntCounterVec::new(
            Opts::new("sparrow_latency_count", "Latency probes issued per target"),
            &["target"],
        )?;
        let duration = HistogramVec::new(
            HistogramOpts::new(
                "sparrow_latency_duration_seconds",
                "Distribution of probe round-trip times",
            )
            .buckets(DURATION_SEC_BUCKETS.to_vec()),
            &["target"],
        )?;
        Ok(Self {
            base: CheckBase::new(config),
            metrics: LatencyMetrics {
                seconds,
                count,
                duration,
            },
        })
    }
}

pub fn data_schema() -> RootSchema {
    schemars::schema_for!(LatencyData)
}

#[async_trait]
impl Check for LatencyCheck {
    async fn run(
        &self, ctx: CancellationToken, sink: mpsc::Sender<ResultEnvelope>,
    ) -> Result<(), CheckError> {
        let metrics = self.metrics.clone();
        let probe_ctx = ctx.clone();
        run_interval_loop(
            &self.base,
            ctx,
            sink,
            CheckKind::Latency,
            |c| c.interval,
            move |config: LatencyConfig| {
                let metrics = metrics.clone();
                let ctx = probe_ctx.clone();
                async move { check_latency(&ctx, &config, &metrics).await }
            },
        )
        .await
    }

    async fn update_config(&self, config: CheckConfig) -> Result<(), CheckError> {
        match config {
            CheckConfig::Latency(c) => {
                self.base.set_config(c).await;
                Ok(())
            }
            other => Err(CheckError::ConfigMismatch {
                expected: CheckKind::Latency,
                got: other.kind(),
            }),
        }
    }

    async fn get_config(&self) -> CheckConfig {
        CheckConfig::Latency(self.base.config().await)
    }

    fn name(&self) -> CheckKind {
        CheckKind::Latency
    }

    fn schema(&self) -> RootSchema {
        data_schema()
    }

    fn metric_collectors(&self) -> Vec<Box<dyn Collector>> {
        vec![
            Box::new(self.metrics.seconds.clone()),
            Box::new(self.metrics.count.clone()),
            Box::new(self.metrics.duration.clone()),
        ]
    }

    fn remove_labelled_metrics(&self, target: &str) {
        let labels = &[target];
        log_series_delete(
            self.metrics.seconds.remove_label_values(labels),
            "sparrow_latency_seconds",
            target,
        );
        log_series_delete(
            self.metrics.count.remove_label_values(labels),
            "sparrow_latency_count",
            target,
        );
        log_series_delete(
            self.metrics.duration.remove_label_values(labels),
            "sparrow_latency_duration_seconds",
            target,
        );
    }

    fn shutdown(&self) {
        self.base.shutdown();
    }
}

async fn check_latency(
    ctx: &CancellationToken, config: &LatencyConfig, metrics: &LatencyMetrics,
) -> serde_json::Value {
    let mut data = LatencyData::new();

    let client = match reqwest::Client::builder().timeout(config.timeout).build() {
        Ok(client) => client,
        Err(e) => {
            error!(error = %e, "failed to build HTTP client");
            for target in &config.targets {
                data.insert(
                    target.clone(),
                    LatencyResult {
                        code: 0,
                        error: Some(e.to_string()),
                        total: 0.0,
                    },
                );
            }
            return serde_json::json!(data);
        }
    };

    let mut probes: FuturesUnordered<_> = config
        .targets
        .iter()
        .cloned()
        .map(|target| {
            let client = client.clone();
            let retry_config = config.retry;
            let ctx = ctx.clone();
            async move {
                let outcome = retry(&ctx, retry_config, || probe_target(&client, &target)).await;
                let result = match outcome {
                    Ok(result) => result,
                    Err(RetryError::Exhausted(e)) => LatencyResult {
                        code: 0,
                        error: Some(e),
                        total: 0.0,
                    },
                    Err(RetryError::Cancelled) => LatencyResult {
                        code: 0,
                        error: Some("cancelled".to_string()),
                        total: 0.0,
                    },
                };
                (target, result)
            }
        })
        .collect();

    while let Some((target, result)) = probes.next().await {
        metrics
            .seconds
            .with_label_values(&[&target])
            .set(result.total);
        metrics.count.with_label_values(&[&target]).inc();
        metrics
            .duration
            .with_label_values(&[&target])
            .observe(result.total);
        data.insert(target, result);
    }

    serde_json::json!(data)
}

async fn probe_target(client: &reqwest::Client, target: &str) -> Result<LatencyResult, String> {
    let started = Instant::now();
    match client.get(target).send().await {
        Ok(response) => {
            let code = response.status().as_u16();
            // Drain the body so `total` covers the full exchange.
            let _ = response.bytes().await;
            Ok(LatencyResult {
                code,
                error: None,
                total: started.elapsed().as_secs_f64(),
            })
        }
        Err(e) => Err(e.to_string()),
    }
}
