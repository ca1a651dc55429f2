//! The check engine: owns the live set of checks, reconciles it against
//! runtime config, and fans results out to the metrics registry and the
//! latest-result cache the HTTP layer reads.

use std::collections::HashMap;
use std::sync::atomic::{
    AtomicU64,
    Ordering,
};
use std::sync::Arc;

use prometheus::Registry;
use sparrow_commons::{
    CheckConfig,
    CheckKind,
    CheckResult,
    ResultEnvelope,
    RuntimeConfig,
};
use tokio::sync::{
    mpsc,
    Mutex,
    RwLock,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{
    debug,
    error,
    info,
    warn,
};

use crate::base::Check;
use crate::dns::DnsCheck;
use crate::error::CheckError;
use crate::health::HealthCheck;
use crate::latency::LatencyCheck;
use crate::traceroute::TracerouteCheck;

/// Builds a check instance from its (already validated) config.
pub type CheckFactory =
    Box<dyn Fn(CheckConfig) -> Result<Arc<dyn Check>, CheckError> + Send + Sync>;

/// Checks block on the send until the fan-out task drains; one slot keeps a
/// slow reader from ever stacking results.
const RESULT_CHANNEL_CAPACITY: usize = 1;

pub struct Engine {
    ctx: CancellationToken,
    registry: Registry,
    factories: HashMap<CheckKind, CheckFactory>,
    running: Arc<Mutex<HashMap<CheckKind, RunningCheck>>>,
    latest: Arc<RwLock<HashMap<CheckKind, CheckResult>>>,
    /// Serialises reconcile runs without ever covering an await into a check.
    reconcile_gate: Mutex<()>,
    result_tx: mpsc::Sender<ResultEnvelope>,
    result_rx: Mutex<Option<mpsc::Receiver<ResultEnvelope>>>,
    next_id: AtomicU64,
}

struct RunningCheck {
    /// Generation tag so a terminally failed run never evicts a replacement
    /// instance of the same kind.
    id: u64,
    check: Arc<dyn Check>,
    handle: JoinHandle<()>,
}

impl Engine {
    pub fn new(ctx: CancellationToken) -> Self {
        let (result_tx, result_rx) = mpsc::channel(RESULT_CHANNEL_CAPACITY);
        Self {
            ctx,
            registry: Registry::new(),
            factories: default_factories(),
            running: Arc::new(Mutex::new(HashMap::new())),
            latest: Arc::new(RwLock::new(HashMap::new())),
            reconcile_gate: Mutex::new(()),
            result_tx,
            result_rx: Mutex::new(Some(result_rx)),
            next_id: AtomicU64::new(0),
        }
    }

    /// Replace the factory for one kind. Must happen before the kind first
    /// appears in a reconciled config.
    pub fn register(&mut self, kind: CheckKind, factory: CheckFactory) {
        self.factories.insert(kind, factory);
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub async fn latest_result(&self, kind: CheckKind) -> Option<CheckResult> {
        self.latest.read().await.get(&kind).cloned()
    }

    pub async fn running_kinds(&self) -> Vec<CheckKind> {
        let running = self.running.lock().await;
        let mut kinds: Vec<CheckKind> = running.keys().copied().collect();
        kinds.sort();
        kinds
    }

    /// Start the single consumer draining the result channel into the
    /// latest-result cache. Call once; later calls return `None`.
    pub async fn spawn_fanout(&self) -> Option<JoinHandle<()>> {
        let mut rx = self.result_rx.lock().await.take()?;
        let latest = self.latest.clone();
        let ctx = self.ctx.clone();

        Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = ctx.cancelled() => break,
                    envelope = rx.recv() => {
                        let Some(envelope) = envelope else { break };
                        debug!(check = %envelope.name, "result received");
                        latest.write().await.insert(envelope.name, envelope.result);
                    }
                }
            }
        }))
    }

    /// Make the live set match `config`: additions first, then updates, then
    /// removals, so a kind moving through the config never has zero
    /// instances mid-reconcile. Failures are per kind; the rest proceed.
    pub async fn reconcile(&self, config: RuntimeConfig) {
        let _gate = self.reconcile_gate.lock().await;

        let live: Vec<CheckKind> = {
            let running = self.running.lock().await;
            running.keys().copied().collect()
        };

        for kind in config.kinds() {
            if !live.contains(&kind) {
                if let Some(check_config) = config.get(kind) {
                    self.start_check(kind, check_config).await;
                }
            }
        }

        for kind in config.kinds() {
            if live.contains(&kind) {
                if let Some(check_config) = config.get(kind) {
                    self.update_check(kind, check_config).await;
                }
            }
        }

        for kind in live {
            if config.get(kind).is_none() {
                self.stop_check(kind).await;
            }
        }
    }

    /// Stop every running check. Safe to call repeatedly.
    pub async fn shutdown(&self) {
        let _gate = self.reconcile_gate.lock().await;
        let kinds: Vec<CheckKind> = {
            let running = self.running.lock().await;
            running.keys().copied().collect()
        };
        for kind in kinds {
            self.stop_check(kind).await;
        }
    }

    async fn start_check(&self, kind: CheckKind, config: CheckConfig) {
        if let Err(e) = config.validate() {
            warn!(check = %kind, error = %e, "invalid config, skipping check");
            return;
        }

        let Some(factory) = self.factories.get(&kind) else {
            warn!(check = %kind, "no factory registered, skipping check");
            return;
        };

        let check = match factory(config) {
            Ok(check) => check,
            Err(e) => {
                warn!(check = %kind, error = %e, "factory failed, skipping check");
                return;
            }
        };

        for collector in check.metric_collectors() {
            if let Err(e) = self.registry.register(collector) {
                warn!(check = %kind, error = %e, "failed to register collector");
            }
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut running = self.running.lock().await;

        let handle = tokio::spawn({
            let check = check.clone();
            let ctx = self.ctx.child_token();
            let sink = self.result_tx.clone();
            let running = self.running.clone();
            let latest = self.latest.clone();
            let registry = self.registry.clone();
            async move {
                if let Err(e) = check.run(ctx, sink).await {
                    error!(check = %kind, error = %e, "check failed terminally, removing");
                    let removed = {
                        let mut running = running.lock().await;
                        match running.get(&kind) {
                            Some(current) if current.id == id => running.remove(&kind),
                            _ => None,
                        }
                    };
                    if let Some(removed) = removed {
                        unregister_collectors(&registry, removed.check.as_ref());
                        latest.write().await.remove(&kind);
                    }
                }
            }
        });

        info!(check = %kind, "check started");
        running.insert(kind, RunningCheck { id, check, handle });
    }

    async fn update_check(&self, kind: CheckKind, config: CheckConfig) {
        let check = {
            let running = self.running.lock().await;
            running.get(&kind).map(|rc| rc.check.clone())
        };
        let Some(check) = check else {
            return;
        };

        let current = check.get_config().await;
        if current == config {
            debug!(check = %kind, "config unchanged");
            return;
        }

        if let Err(e) = config.validate() {
            warn!(check = %kind, error = %e, "invalid config, keeping previous");
            return;
        }

        let new_targets = config.target_labels();
        let removed_targets: Vec<String> = current
            .target_labels()
            .into_iter()
            .filter(|target| !new_targets.contains(target))
            .collect();

        match check.update_config(config).await {
            Ok(()) => {
                for target in &removed_targets {
                    check.remove_labelled_metrics(target);
                }
                info!(check = %kind, removed_targets = removed_targets.len(), "config updated");
            }
            Err(e) => {
                warn!(check = %kind, error = %e, "config update rejected");
            }
        }
    }

    async fn stop_check(&self, kind: CheckKind) {
        let removed = {
            let mut running = self.running.lock().await;
            running.remove(&kind)
        };
        let Some(removed) = removed else {
            return;
        };

        removed.check.shutdown();
        if let Err(e) = removed.handle.await {
            if e.is_panic() {
                warn!(check = %kind, "check task panicked during shutdown");
            }
        }

        unregister_collectors(&self.registry, removed.check.as_ref());
        self.latest.write().await.remove(&kind);
        info!(check = %kind, "check stopped");
    }
}

fn unregister_collectors(registry: &Registry, check: &dyn Check) {
    for collector in check.metric_collectors() {
        if let Err(e) = registry.unregister(collector) {
            debug!(error = %e, "collector was not registered");
        }
    }
}

fn default_factories() -> HashMap<CheckKind, CheckFactory> {
    let mut factories: HashMap<CheckKind, CheckFactory> = HashMap::new();
    factories.insert(
        CheckKind::Health,
        Box::new(|config| match config {
            CheckConfig::Health(c) => Ok(Arc::new(HealthCheck::new(c)?) as Arc<dyn Check>),
            other => Err(CheckError::ConfigMismatch {
                expected: CheckKind::Health,
                got: other.kind(),
            }),
        }),
    );
    factories.insert(
        CheckKind::Latency,
        Box::new(|config| match config {
            CheckConfig::Latency(c) => Ok(Arc::new(LatencyCheck::new(c)?) as Arc<dyn Check>),
            other => Err(CheckError::ConfigMismatch {
                expected: CheckKind::Latency,
                got: other.kind(),
            }),
        }),
    );
    factories.insert(
        CheckKind::Dns,
        Box::new(|config| match config {
            CheckConfig::Dns(c) => Ok(Arc::new(DnsCheck::new(c)?) as Arc<dyn Check>),
            other => Err(CheckError::ConfigMismatch {
                expected: CheckKind::Dns,
                got: other.kind(),
            }),
        }),
    );
    factories.insert(
        CheckKind::Traceroute,
        Box::new(|config| match config {
            CheckConfig::Traceroute(c) => {
                Ok(Arc::new(TracerouteCheck::new(c)?) as Arc<dyn Check>)
            }
            other => Err(CheckError::ConfigMismatch {
                expected: CheckKind::Traceroute,
                got: other.kind(),
            }),
        }),
    );
    factories
}
