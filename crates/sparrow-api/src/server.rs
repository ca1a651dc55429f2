//! The agent's HTTP surface: liveness, Prometheus exposition, the per-check
//! result routes and the OpenAPI document.

use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use http::header::CONTENT_TYPE;
use http::{
    Method,
    Request,
    Response,
    StatusCode,
};
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::{
    TokioIo,
    TokioTimer,
};
use prometheus::{
    Encoder,
    Registry,
    TextEncoder,
};
use serde::{
    Deserialize,
    Serialize,
};
use sparrow_checks::Engine;
use sparrow_commons::{
    CheckKind,
    CheckResult,
};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{
    debug,
    error,
    info,
    warn,
};

use crate::error::ApiError;
use crate::healthz::HealthState;
use crate::openapi;

const READ_HEADER_TIMEOUT: Duration = Duration::from_secs(5);
const SHUTDOWN_BUDGET: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiConfig {
    #[serde(default = "default_address")]
    pub address: SocketAddr,
    #[serde(default)]
    pub tls: TlsConfig,
}

fn default_address() -> SocketAddr {
    ([0, 0, 0, 0], 8080).into()
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            tls: TlsConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TlsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub cert_path: String,
    #[serde(default)]
    pub key_path: String,
}

impl ApiConfig {
    pub fn validate(&self) -> Result<(), ApiError> {
        if self.tls.enabled {
            if self.tls.cert_path.is_empty() {
                return Err(ApiError::Config(
                    "tls.certPath must be set when tls is enabled".to_string(),
                ));
            }
            if self.tls.key_path.is_empty() {
                return Err(ApiError::Config(
                    "tls.keyPath must be set when tls is enabled".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// The read side the routes need. The engine implements it; tests stub it.
#[async_trait]
pub trait CheckReader: Send + Sync + 'static {
    async fn latest_result(&self, kind: CheckKind) -> Option<CheckResult>;
    fn metrics_registry(&self) -> Registry;
}

#[async_trait]
impl CheckReader for Engine {
    async fn latest_result(&self, kind: CheckKind) -> Option<CheckResult> {
        Engine::latest_result(self, kind).await
    }

    fn metrics_registry(&self) -> Registry {
        self.registry().clone()
    }
}

/// Serve until `ctx` is cancelled, then drain connections within the
/// shutdown budget. `health` is the readiness flag the self-healthz loop
/// maintains; `/healthz` answers 503 while it is down.
pub async fn run_server(
    config: ApiConfig, reader: Arc<dyn CheckReader>, health: HealthState, ctx: CancellationToken,
) -> Result<(), ApiError> {
    config.validate()?;

    let acceptor = if config.tls.enabled {
        Some(build_tls_acceptor(&config.tls)?)
    } else {
        None
    };

    let listener = TcpListener::bind(config.address).await?;
    info!(address = %config.address, tls = config.tls.enabled, "api server listening");

    let tracker = TaskTracker::new();

    loop {
        tokio::select! {
            _ = ctx.cancelled() => break,
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        error!(error = %e, "failed to accept connection");
                        continue;
                    }
                };
                debug!(%peer, "connection accepted");

                let reader = reader.clone();
                let health = health.clone();
                let acceptor = acceptor.clone();
                let conn_ctx = ctx.clone();
                tracker.spawn(async move {
                    match acceptor {
                        Some(acceptor) => match acceptor.accept(stream).await {
                            Ok(stream) => serve_connection(stream, reader, health, conn_ctx).await,
                            Err(e) => debug!(%peer, error = %e, "tls handshake failed"),
                        },
                        None => serve_connection(stream, reader, health, conn_ctx).await,
                    }
                });
            }
        }
    }

    tracker.close();
    info!("api server draining connections");
    tokio::select! {
        _ = tracker.wait() => info!("api server stopped"),
        _ = tokio::time::sleep(SHUTDOWN_BUDGET) => {
            warn!(budget = ?SHUTDOWN_BUDGET, "shutdown budget exceeded, dropping connections");
        }
    }

    Ok(())
}

async fn serve_connection<S>(
    stream: S, reader: Arc<dyn CheckReader>, health: HealthState, ctx: CancellationToken,
) where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let service = service_fn(move |req| {
        let reader = reader.clone();
        let health = health.clone();
        async move {
            Ok::<_, std::convert::Infallible>(handle(req, reader.as_ref(), &health).await)
        }
    });

    let mut conn = pin!(http1::Builder::new()
        .timer(TokioTimer::new())
        .header_read_timeout(READ_HEADER_TIMEOUT)
        .serve_connection(TokioIo::new(stream), service));

    tokio::select! {
        result = conn.as_mut() => {
            if let Err(e) = result {
                debug!(error = %e, "connection error");
            }
        }
        _ = ctx.cancelled() => {
            conn.as_mut().graceful_shutdown();
            let _ = conn.as_mut().await;
        }
    }
}

pub(crate) async fn handle<B>(
    req: Request<B>, reader: &dyn CheckReader, health: &HealthState,
) -> Response<Full<Bytes>> {
    if req.method() != Method::GET {
        return text(StatusCode::METHOD_NOT_ALLOWED, "method not allowed");
    }

    match req.uri().path() {
        "/" => text(StatusCode::OK, "ok"),
        "/healthz" => healthz_response(health),
        "/metrics" => metrics_response(reader),
        "/openapi" => openapi_response(),
        path => match path.strip_prefix("/v1/metrics/") {
            Some(kind) => check_result_response(reader, kind).await,
            None => text(StatusCode::NOT_FOUND, "not found"),
        },
    }
}

fn healthz_response(health: &HealthState) -> Response<Full<Bytes>> {
    if health.is_healthy() {
        text(StatusCode::OK, "healthy")
    } else {
        text(StatusCode::SERVICE_UNAVAILABLE, "unhealthy")
    }
}

async fn check_result_response(reader: &dyn CheckReader, kind: &str) -> Response<Full<Bytes>> {
    let Ok(kind) = kind.parse::<CheckKind>() else {
        return text(StatusCode::NOT_FOUND, "unknown check kind");
    };

    match reader.latest_result(kind).await {
        Some(result) => match serde_json::to_vec(&result) {
            Ok(body) => respond(StatusCode::OK, "application/json", Bytes::from(body)),
            Err(e) => {
                error!(check = %kind, error = %e, "failed to serialise result");
                text(StatusCode::INTERNAL_SERVER_ERROR, "serialisation failure")
            }
        },
        None => text(StatusCode::NOT_FOUND, "no result available"),
    }
}

fn metrics_response(reader: &dyn CheckReader) -> Response<Full<Bytes>> {
    let families = reader.metrics_registry().gather();
    let encoder = TextEncoder::new();
    let mut buf = Vec::new();
    match encoder.encode(&families, &mut buf) {
        Ok(()) => respond(
            StatusCode::OK,
            "text/plain; version=0.0.4; charset=utf-8",
            Bytes::from(buf),
        ),
        Err(e) => {
            error!(error = %e, "failed to encode metrics");
            text(StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding failure")
        }
    }
}

fn openapi_response() -> Response<Full<Bytes>> {
    match openapi::build_document() {
        Ok(doc) => respond(StatusCode::OK, "application/yaml", Bytes::from(doc)),
        Err(e) => {
            error!(error = %e, "failed to build openapi document");
            text(StatusCode::INTERNAL_SERVER_ERROR, "schema assembly failure")
        }
    }
}

fn text(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    respond(status, "text/plain; charset=utf-8", Bytes::from_static(body.as_bytes()))
}

fn respond(status: StatusCode, content_type: &str, body: Bytes) -> Response<Full<Bytes>> {
    match Response::builder()
        .status(status)
        .header(CONTENT_TYPE, content_type)
        .body(Full::new(body))
    {
        Ok(response) => response,
        Err(_) => {
            let mut response = Response::new(Full::new(Bytes::from_static(b"internal error")));
            *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            response
        }
    }
}

fn build_tls_acceptor(tls: &TlsConfig) -> Result<TlsAcceptor, ApiError> {
    let certs = rustls_pemfile::certs(&mut BufReader::new(File::open(&tls.cert_path)?))
        .collect::<Result<Vec<_>, _>>()?;
    let key = rustls_pemfile::private_key(&mut BufReader::new(File::open(&tls.key_path)?))?
        .ok_or_else(|| ApiError::Config(format!("no private key in {}", tls.key_path)))?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}
