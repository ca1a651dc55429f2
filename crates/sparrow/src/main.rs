mod cli;
mod config;
mod loader;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use sparrow_api::{
    run_server,
    CheckReader,
    HealthState,
    HealthzProber,
};
use sparrow_checks::Engine;
use sparrow_commons::utils::logging;
use tokio::signal;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{
    error,
    info,
    warn,
};

use crate::cli::{
    Cli,
    Command,
    GenDocsArgs,
    RunArgs,
};
use crate::config::StartupConfig;
use crate::loader::run_loader;

const HEALTHZ_INTERVAL: Duration = Duration::from_secs(30);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(35);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run(args) => run(args).await,
        Command::GenDocs(args) => gen_docs(&args),
    }
}

async fn run(args: RunArgs) -> anyhow::Result<()> {
    let mut config = StartupConfig::load(args.config.as_deref())?;
    config.apply_env();
    config.apply_flags(&args);

    logging::init(&config.log);
    config.api.validate().context("invalid api config")?;

    info!(version = env!("CARGO_PKG_VERSION"), "starting sparrow");

    let root = CancellationToken::new();
    let engine = Arc::new(Engine::new(root.child_token()));
    let fanout = engine.spawn_fanout().await;

    let (config_tx, mut config_rx) = mpsc::channel(1);
    let loader_handle = tokio::spawn(run_loader(
        config.loader.clone(),
        config_tx,
        root.child_token(),
    ));

    let reconcile_handle = tokio::spawn({
        let engine = engine.clone();
        async move {
            while let Some(runtime) = config_rx.recv().await {
                engine.reconcile(runtime).await;
            }
        }
    });

    let health = HealthState::new();
    let server_handle = tokio::spawn(run_server(
        config.api.clone(),
        engine.clone() as Arc<dyn CheckReader>,
        health.clone(),
        root.child_token(),
    ));

    let healthz_handle = tokio::spawn(self_healthz_loop(
        config.clone(),
        engine.clone(),
        health,
        root.child_token(),
    ));

    wait_for_shutdown_signal().await;
    info!("shutdown signal received");

    engine.shutdown().await;
    root.cancel();

    match tokio::time::timeout(SHUTDOWN_GRACE, server_handle).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => error!(error = %e, "api server failed"),
        Ok(Err(e)) => error!(error = %e, "api server task panicked"),
        Err(_) => warn!("api server did not stop within the grace period"),
    }

    if let Ok(Err(e)) = loader_handle.await {
        error!(error = %e, "loader failed");
    }
    let _ = reconcile_handle.await;
    let _ = healthz_handle.await;
    if let Some(fanout) = fanout {
        let _ = fanout.await;
    }

    info!("shutdown complete");
    Ok(())
}

/// Periodically probe our own API routes and fold the outcome into the
/// readiness flag `/healthz` serves to orchestrators.
async fn self_healthz_loop(
    config: StartupConfig, engine: Arc<Engine>, health: HealthState, ctx: CancellationToken,
) {
    let prober = match HealthzProber::new(config.api.address, config.api.tls.enabled) {
        Ok(prober) => prober,
        Err(e) => {
            error!(error = %e, "failed to build healthz prober");
            return;
        }
    };

    // The server may still be binding at startup; first probe one interval in.
    let mut timer = tokio::time::interval_at(
        tokio::time::Instant::now() + HEALTHZ_INTERVAL,
        HEALTHZ_INTERVAL,
    );
    loop {
        tokio::select! {
            _ = ctx.cancelled() => break,
            _ = timer.tick() => {
                let kinds = engine.running_kinds().await;
                let healthy = prober.probe(&kinds).await;
                health.set_healthy(healthy);
                if healthy {
                    info!(checks = kinds.len(), "self-check healthy");
                } else {
                    warn!("self-check reported unhealthy");
                }
            }
        }
    }
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        let mut sigterm = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                let _ = signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = signal::ctrl_c() => info!("received Ctrl+C"),
            _ = sigterm.recv() => info!("received SIGTERM"),
        }
    }

    #[cfg(not(unix))]
    {
        let _ = signal::ctrl_c().await;
        info!("received Ctrl+C");
    }
}

fn gen_docs(args: &GenDocsArgs) -> anyhow::Result<()> {
    let document = sparrow_api::openapi::build_document().context("failed to build document")?;
    std::fs::write(&args.output, document)
        .with_context(|| format!("failed to write {}", args.output.display()))?;
    println!("wrote {}", args.output.display());
    Ok(())
}
