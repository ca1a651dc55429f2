//! Reachability probe: a target is healthy when it answers a GET with 200
//! within the timeout and retry budget.

use async_trait::async_trait;
use futures::stream::{
    FuturesUnordered,
    StreamExt,
};
use prometheus::core::Collector;
use prometheus::{
    IntGaugeVec,
    Opts,
};
use schemars::schema::RootSchema;
use sparrow_commons::{
    CheckConfig,
    CheckKind,
    HealthConfig,
    HealthData,
    HealthStatus,
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
use crate::metrics::log_series_delete;
use crate::retry::retry;

pub struct HealthCheck {
    base: CheckBase<HealthConfig>,
    metrics: HealthMetrics,
}

#[derive(Clone)]
struct HealthMetrics {
    up: IntGaugeVec,
}

impl HealthCheck {
    pub fn new(config: HealthConfig) -> Result<Self, CheckError> {
        let up = IntGaugeVec::new(
            Opts::new(
                "sparrow_health_up",
                "1 when the target answered 200 within the retry budget, 0 otherwise",
            ),
            &["target"],
        )?;
        Ok(Self {
            base: CheckBase::new(config),
            metrics: HealthMetrics { up },
        })
    }
}

pub fn data_schema() -> RootSchema {
    schemars::schema_for!(HealthData)
}

#[async_trait]
impl Check for HealthCheck {
    async fn run(
        &self, ctx: CancellationToken, sink: mpsc::Sender<ResultEnvelope>,
    ) -> Result<(), CheckError> {
        let metrics = self.metrics.clone();
        let probe_ctx = ctx.clone();
        run_interval_loop(
            &self.base,
            ctx,
            sink,
            CheckKind::Health,
            |c| c.interval,
            move |config: HealthConfig| {
                let metrics = metrics.clone();
                let ctx = probe_ctx.clone();
                async move { check_health(&ctx, &config, &metrics).await }
            },
        )
        .await
    }

    async fn update_config(&self, config: CheckConfig) -> Result<(), CheckError> {
        match config {
            CheckConfig::Health(c) => {
                self.base.set_config(c).await;
                Ok(())
            }
            other => Err(CheckError::ConfigMismatch {
                expected: CheckKind::Health,
                got: other.kind(),
            }),
        }
    }

    async fn get_config(&self) -> CheckConfig {
        CheckConfig::Health(self.base.config().await)
    }

    fn name(&self) -> CheckKind {
        CheckKind::Health
    }

    fn schema(&self) -> RootSchema {
        data_schema()
    }

    fn metric_collectors(&self) -> Vec<Box<dyn Collector>> {
        vec![Box::new(self.metrics.up.clone())]
    }

    fn remove_labelled_metrics(&self, target: &str) {
        log_series_delete(
            self.metrics.up.remove_label_values(&[target]),
            "sparrow_health_up",
            target,
        );
    }

    fn shutdown(&self) {
        self.base.shutdown();
    }
}

async fn check_health(
    ctx: &CancellationToken, config: &HealthConfig, metrics: &HealthMetrics,
) -> serde_json::Value {
    let mut data = HealthData::new();

    let client = match reqwest::Client::builder().timeout(config.timeout).build() {
        Ok(client) => client,
        Err(e) => {
            error!(error = %e, "failed to build HTTP client, marking all targets unhealthy");
            for target in &config.targets {
                metrics.up.with_label_values(&[target]).set(0);
                data.insert(target.clone(), HealthStatus::Unhealthy);
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
                let status = match outcome {
                    Ok(()) => HealthStatus::Healthy,
                    Err(_) => HealthStatus::Unhealthy,
                };
                (target, status)
            }
        })
        .collect();

    while let Some((target, status)) = probes.next().await {
        let value = match status {
            HealthStatus::Healthy => 1,
            HealthStatus::Unhealthy => 0,
        };
        metrics.up.with_label_values(&[&target]).set(value);
        data.insert(target, status);
    }

    serde_json::json!(data)
}

async fn probe_target(client: &reqwest::Client, target: &str) -> Result<(), String> {
    match client.get(target).send().await {
        Ok(response) if response.status() == reqwest::StatusCode::OK => Ok(()),
        Ok(response) => Err(format!("unexpected status {}", response.status())),
        Err(e) => Err(e.to_string()),
    }
}
