//! Shared scaffolding every check is built on: the capability surface the
//! engine talks to, and the interval loop driving kind-specific probes.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use prometheus::core::Collector;
use schemars::schema::RootSchema;
use sparrow_commons::{
    CheckConfig,
    CheckKind,
    CheckResult,
    ResultEnvelope,
};
use tokio::sync::{
    mpsc,
    Mutex,
    Notify,
};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::CheckError;

/// The closed capability set the engine needs from a check. Implementations
/// stay kind-specific; the engine stays kind-agnostic.
#[async_trait]
pub trait Check: Send + Sync + 'static {
    /// Drive the check until the context is cancelled or `shutdown` is
    /// called. An `Err` return is terminal: the engine removes the check
    /// and does not restart it.
    async fn run(
        &self, ctx: CancellationToken, sink: mpsc::Sender<ResultEnvelope>,
    ) -> Result<(), CheckError>;

    /// Install a new config of the same kind and re-arm the interval timer.
    async fn update_config(&self, config: CheckConfig) -> Result<(), CheckError>;

    async fn get_config(&self) -> CheckConfig;

    fn name(&self) -> CheckKind;

    /// JSON schema of this check's result `data` payload.
    fn schema(&self) -> RootSchema;

    fn metric_collectors(&self) -> Vec<Box<dyn Collector>>;

    /// Drop every metric series labelled with `target`.
    fn remove_labelled_metrics(&self, target: &str);

    /// Signal the run loop to stop. Idempotent; never panics.
    fn shutdown(&self);
}

/// Config storage plus the two signals the run loop selects on.
pub struct CheckBase<C> {
    config: Mutex<C>,
    update: Notify,
    done: CancellationToken,
}

impl<C: Clone + Send> CheckBase<C> {
    pub fn new(config: C) -> Self {
        Self {
            config: Mutex::new(config),
            update: Notify::new(),
            done: CancellationToken::new(),
        }
    }

    /// Snapshot the current config. Callers probe with the snapshot so the
    /// lock is never held across I/O.
    pub async fn config(&self) -> C {
        self.config.lock().await.clone()
    }

    pub async fn set_config(&self, config: C) {
        *self.config.lock().await = config;
        self.update.notify_one();
    }

    pub fn shutdown(&self) {
        self.done.cancel();
    }

    pub fn is_shut_down(&self) -> bool {
        self.done.is_cancelled()
    }
}

/// The interval loop shared by every check kind.
///
/// Selects over engine cancellation, the instance's done signal, config
/// updates and the tick timer. The first tick fires immediately; an update
/// re-arms the timer with the new interval without firing a tick. Each tick
/// snapshots the config, runs the probe and sends the wrapped result; the
/// send blocks on the capacity-1 channel until the engine drains it.
pub(crate) async fn run_interval_loop<C, F, Fut>(
    base: &CheckBase<C>, ctx: CancellationToken, sink: mpsc::Sender<ResultEnvelope>,
    kind: CheckKind, interval_of: impl Fn(&C) -> Duration, mut tick: F,
) -> Result<(), CheckError>
where
    C: Clone + Send,
    F: FnMut(C) -> Fut + Send,
    Fut: Future<Output = serde_json::Value> + Send,
{
    let mut timer = tokio::time::interval(interval_of(&base.config().await));
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ctx.cancelled() => {
                debug!(check = %kind, "context cancelled, stopping");
                return Ok(());
            }
            _ = base.done.cancelled() => {
                debug!(check = %kind, "shutdown requested, stopping");
                return Ok(());
            }
            _ = base.update.notified() => {
                let interval = interval_of(&base.config().await);
                debug!(check = %kind, ?interval, "config updated, re-arming timer");
                timer = tokio::time::interval_at(
                    tokio::time::Instant::now() + interval,
                    interval,
                );
                timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            }
            _ = timer.tick() => {
                let config = base.config().await;
                let data = tick(config).await;
                let envelope = ResultEnvelope {
                    name: kind,
                    result: CheckResult::new(data),
                };
                // The send blocks until the engine drains; shutdown must
                // still be observed while it does.
                tokio::select! {
                    _ = ctx.cancelled() => return Ok(()),
                    _ = base.done.cancelled() => return Ok(()),
                    sent = sink.send(envelope) => {
                        if sent.is_err() {
                            debug!(check = %kind, "result channel closed, stopping");
                            return Ok(());
                        }
                    }
                }
            }
        }
    }
}
