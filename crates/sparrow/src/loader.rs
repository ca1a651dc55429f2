//! Runtime-config loaders. Both poll a source, parse the
//! `apiVersion/kind/checks` document, drop check configs that fail
//! validation, and push changed configurations into the reconcile channel.

use std::path::PathBuf;
use std::time::Duration;

use serde::{
    Deserialize,
    Serialize,
};
use sparrow_commons::models::runtime::DocumentError;
use sparrow_commons::utils::duration;
use sparrow_commons::{
    ConfigDocument,
    RetryConfig,
    RuntimeConfig,
};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{
    debug,
    info,
    warn,
};

#[derive(Debug, Error)]
pub enum LoaderError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to fetch config: {0}")]
    Http(#[from] reqwest::Error),

    #[error("config endpoint answered {0}")]
    HttpStatus(reqwest::StatusCode),

    #[error(transparent)]
    Document(#[from] DocumentError),

    #[error("loader gave up: {0}")]
    Exhausted(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoaderKind {
    #[default]
    File,
    Http,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoaderConfig {
    #[serde(default, rename = "type")]
    pub kind: LoaderKind,
    /// Zero means load once and keep running with that configuration.
    #[serde(default = "default_interval", with = "duration")]
    pub interval: Duration,
    #[serde(default)]
    pub file: FileLoaderConfig,
    #[serde(default)]
    pub http: HttpLoaderConfig,
}

fn default_interval() -> Duration {
    Duration::from_secs(90)
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            kind: LoaderKind::default(),
            interval: default_interval(),
            file: FileLoaderConfig::default(),
            http: HttpLoaderConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileLoaderConfig {
    #[serde(default = "default_file_path")]
    pub path: PathBuf,
}

fn default_file_path() -> PathBuf {
    PathBuf::from("config.yaml")
}

impl Default for FileLoaderConfig {
    fn default() -> Self {
        Self {
            path: default_file_path(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpLoaderConfig {
    #[serde(default)]
    pub url: String,
    /// Sent as a bearer token when set.
    #[serde(default)]
    pub token: String,
    #[serde(default = "default_http_timeout", with = "duration")]
    pub timeout: Duration,
    #[serde(default)]
    pub retry: RetryConfig,
}

fn default_http_timeout() -> Duration {
    Duration::from_secs(30)
}

impl Default for HttpLoaderConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            token: String::new(),
            timeout: default_http_timeout(),
            retry: RetryConfig::default(),
        }
    }
}

/// Poll the configured source until cancelled, pushing each changed
/// `RuntimeConfig` into `sink`.
pub async fn run_loader(
    config: LoaderConfig, sink: mpsc::Sender<RuntimeConfig>, ctx: CancellationToken,
) -> Result<(), LoaderError> {
    let mut last: Option<RuntimeConfig> = None;

    loop {
        match load_once(&config, &ctx).await {
            Ok(runtime) => {
                if last.as_ref() == Some(&runtime) {
                    debug!("runtime configuration unchanged");
                } else {
                    info!(checks = runtime.size(), "runtime configuration loaded");
                    if sink.send(runtime.clone()).await.is_err() {
                        return Ok(());
                    }
                    last = Some(runtime);
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to load runtime configuration");
            }
        }

        if config.interval.is_zero() {
            ctx.cancelled().await;
            return Ok(());
        }
        tokio::select! {
            _ = ctx.cancelled() => return Ok(()),
            _ = tokio::time::sleep(config.interval) => {}
        }
    }
}

async fn load_once(
    config: &LoaderConfig, ctx: &CancellationToken,
) -> Result<RuntimeConfig, LoaderError> {
    let bytes = match config.kind {
        LoaderKind::File => tokio::fs::read(&config.file.path).await?,
        LoaderKind::Http => fetch_http(&config.http, ctx).await?,
    };
    let document = ConfigDocument::from_slice(&bytes)?;
    Ok(sanitize(document.checks))
}

async fn fetch_http(
    config: &HttpLoaderConfig, ctx: &CancellationToken,
) -> Result<Vec<u8>, LoaderError> {
    let client = reqwest::Client::builder()
        .timeout(config.timeout)
        .build()?;

    let attempt = || async {
        let mut request = client.get(&config.url);
        if !config.token.is_empty() {
            request = request.bearer_auth(&config.token);
        }
        let response = request.send().await.map_err(LoaderError::Http)?;
        if response.status() != reqwest::StatusCode::OK {
            return Err(LoaderError::HttpStatus(response.status()));
        }
        Ok(response.bytes().await.map_err(LoaderError::Http)?.to_vec())
    };

    match sparrow_checks::retry(ctx, config.retry, attempt).await {
        Ok(bytes) => Ok(bytes),
        Err(sparrow_checks::RetryError::Exhausted(e)) => Err(e),
        Err(sparrow_checks::RetryError::Cancelled) => {
            Err(LoaderError::Exhausted("cancelled".to_string()))
        }
    }
}

/// Drop check configs that fail validation so one bad section never blocks
/// the rest of the document.
fn sanitize(mut runtime: RuntimeConfig) -> RuntimeConfig {
    for kind in runtime.kinds() {
        if let Some(check_config) = runtime.get(kind) {
            if let Err(e) = check_config.validate() {
                warn!(check = %kind, error = %e, "dropping invalid check config");
                runtime.remove(kind);
            }
        }
    }
    runtime
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tokio::io::{
        AsyncReadExt,
        AsyncWriteExt,
    };
    use tokio::net::TcpListener;

    use super::*;

    const SAMPLE: &str = "\
apiVersion: 0.0.1
kind: Config
checks:
  health:
    targets:
      - https://example.com/
    interval: 1s
    timeout: 500ms
";

    fn file_loader(path: PathBuf, interval: Duration) -> LoaderConfig {
        LoaderConfig {
            kind: LoaderKind::File,
            interval,
            file: FileLoaderConfig { path },
            http: HttpLoaderConfig::default(),
        }
    }

    #[tokio::test]
    async fn test_file_loader_pushes_config_once() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let (tx, mut rx) = mpsc::channel(1);
        let ctx = CancellationToken::new();
        let handle = tokio::spawn(run_loader(
            file_loader(file.path().to_path_buf(), Duration::ZERO),
            tx,
            ctx.clone(),
        ));

        let runtime = rx.recv().await.expect("config pushed");
        assert!(runtime.health.is_some());
        assert_eq!(runtime.size(), 1);

        ctx.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_unchanged_config_is_not_repushed() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let (tx, mut rx) = mpsc::channel(4);
        let ctx = CancellationToken::new();
        let handle = tokio::spawn(run_loader(
            file_loader(file.path().to_path_buf(), Duration::from_millis(50)),
            tx,
            ctx.clone(),
        ));

        let _ = rx.recv().await.expect("first push");
        let second = tokio::time::timeout(Duration::from_millis(300), rx.recv()).await;
        assert!(second.is_err(), "unchanged config must not be re-pushed");

        ctx.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_invalid_check_is_dropped() {
        let bad = SAMPLE.replace("interval: 1s", "interval: 10ms");
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(bad.as_bytes()).unwrap();

        let (tx, mut rx) = mpsc::channel(1);
        let ctx = CancellationToken::new();
        let handle = tokio::spawn(run_loader(
            file_loader(file.path().to_path_buf(), Duration::ZERO),
            tx,
            ctx.clone(),
        ));

        let runtime = rx.recv().await.expect("config pushed");
        assert!(runtime.is_empty());

        ctx.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_missing_file_keeps_polling() {
        let (tx, mut rx) = mpsc::channel(1);
        let ctx = CancellationToken::new();
        let handle = tokio::spawn(run_loader(
            file_loader(PathBuf::from("/nonexistent/sparrow.yaml"), Duration::from_millis(50)),
            tx,
            ctx.clone(),
        ));

        let pushed = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await;
        assert!(pushed.is_err(), "nothing must be pushed for a missing file");

        ctx.cancel();
        handle.await.unwrap().unwrap();
    }

    async fn yaml_server(body: &'static str, expect_auth: Option<&'static str>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 4096];
                    let n = stream.read(&mut buf).await.unwrap_or(0);
                    let request = String::from_utf8_lossy(&buf[..n]);

                    let authorized = expect_auth
                        .map(|token| request.contains(&format!("Bearer {token}")))
                        .unwrap_or(true);

                    let response = if authorized {
                        format!(
                            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n{}",
                            body.len(),
                            body
                        )
                    } else {
                        "HTTP/1.1 401 Unauthorized\r\nContent-Length: 0\r\n\r\n".to_string()
                    };
                    let _ = stream.write_all(response.as_bytes()).await;
                    let _ = stream.shutdown().await;
                });
            }
        });
        format!("http://{addr}/config")
    }

    #[tokio::test]
    async fn test_http_loader_fetches_with_token() {
        let url = yaml_server(SAMPLE, Some("sesame")).await;
        let config = LoaderConfig {
            kind: LoaderKind::Http,
            interval: Duration::ZERO,
            file: FileLoaderConfig::default(),
            http: HttpLoaderConfig {
                url,
                token: "sesame".to_string(),
                timeout: Duration::from_secs(1),
                retry: RetryConfig {
                    count: 0,
                    delay: Duration::ZERO,
                },
            },
        };

        let (tx, mut rx) = mpsc::channel(1);
        let ctx = CancellationToken::new();
        let handle = tokio::spawn(run_loader(config, tx, ctx.clone()));

        let runtime = rx.recv().await.expect("config pushed");
        assert!(runtime.health.is_some());

        ctx.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_http_loader_rejected_without_token() {
        let url = yaml_server(SAMPLE, Some("sesame")).await;
        let config = LoaderConfig {
            kind: LoaderKind::Http,
            interval: Duration::ZERO,
            file: FileLoaderConfig::default(),
            http: HttpLoaderConfig {
                url,
                token: String::new(),
                timeout: Duration::from_secs(1),
                retry: RetryConfig {
                    count: 0,
                    delay: Duration::ZERO,
                },
            },
        };

        let (tx, mut rx) = mpsc::channel(1);
        let ctx = CancellationToken::new();
        let handle = tokio::spawn(run_loader(config, tx, ctx.clone()));

        let pushed = tokio::time::timeout(Duration::from_millis(300), rx.recv()).await;
        assert!(pushed.is_err());

        ctx.cancel();
        handle.await.unwrap().unwrap();
    }

    #[test]
    fn test_loader_config_from_yaml() {
        let config: LoaderConfig = serde_yaml::from_str(
            "type: http\ninterval: 5m\nhttp:\n  url: https://config.example.com/sparrow.yaml\n  token: abc\n",
        )
        .unwrap();
        assert_eq!(config.kind, LoaderKind::Http);
        assert_eq!(config.interval, Duration::from_secs(300));
        assert_eq!(config.http.token, "abc");
    }
}
