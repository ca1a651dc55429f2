//! End-to-end flow: a reconciled engine feeding the HTTP API, queried over
//! a real socket.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use sparrow_api::{
    run_server,
    ApiConfig,
    CheckReader,
    HealthState,
};
use sparrow_checks::Engine;
use sparrow_commons::{
    CheckKind,
    HealthConfig,
    RetryConfig,
    RuntimeConfig,
};
use tokio::io::{
    AsyncReadExt,
    AsyncWriteExt,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

async fn target_server(response: &'static str) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                let _ = stream.read(&mut buf).await;
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.shutdown().await;
            });
        }
    });
    format!("http://{addr}/")
}

async fn free_address() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    drop(listener);
    addr
}

async fn wait_for(client: &reqwest::Client, url: &str, want: reqwest::StatusCode) -> bool {
    for _ in 0..50 {
        if let Ok(response) = client.get(url).send().await {
            if response.status() == want {
                return true;
            }
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    false
}

#[tokio::test]
async fn test_health_check_served_over_api_and_retired() {
    let ok_target = target_server("HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n").await;
    let bad_target =
        target_server("HTTP/1.1 500 Internal Server Error\r\nContent-Length: 0\r\n\r\n").await;

    let root = CancellationToken::new();
    let engine = Arc::new(Engine::new(root.child_token()));
    let _fanout = engine.spawn_fanout().await.expect("fanout");

    let api_address = free_address().await;
    let health = HealthState::new();
    let _server = tokio::spawn(run_server(
        ApiConfig {
            address: api_address,
            ..ApiConfig::default()
        },
        engine.clone() as Arc<dyn CheckReader>,
        health.clone(),
        root.child_token(),
    ));

    let client = reqwest::Client::new();
    let base = format!("http://{api_address}");
    assert!(
        wait_for(&client, &format!("{base}/"), reqwest::StatusCode::OK).await,
        "api server did not come up"
    );

    // Nothing is configured yet.
    let response = client
        .get(format!("{base}/v1/metrics/health"))
        .send()
        .await
        .expect("request");
    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);

    // Readiness follows the self-healthz flag.
    let response = client
        .get(format!("{base}/healthz"))
        .send()
        .await
        .expect("request");
    assert_eq!(response.status(), reqwest::StatusCode::OK);

    health.set_healthy(false);
    let response = client
        .get(format!("{base}/healthz"))
        .send()
        .await
        .expect("request");
    assert_eq!(response.status(), reqwest::StatusCode::SERVICE_UNAVAILABLE);
    health.set_healthy(true);

    engine
        .reconcile(RuntimeConfig {
            health: Some(HealthConfig {
                targets: vec![ok_target.clone(), bad_target.clone()],
                interval: Duration::from_millis(200),
                timeout: Duration::from_secs(1),
                retry: RetryConfig {
                    count: 0,
                    delay: Duration::ZERO,
                },
            }),
            ..RuntimeConfig::default()
        })
        .await;

    assert!(
        wait_for(
            &client,
            &format!("{base}/v1/metrics/health"),
            reqwest::StatusCode::OK,
        )
        .await,
        "health check never emitted a result"
    );

    let body: serde_json::Value = client
        .get(format!("{base}/v1/metrics/health"))
        .send()
        .await
        .expect("request")
        .json()
        .await
        .expect("json body");
    assert_eq!(body["data"][&ok_target], "healthy");
    assert_eq!(body["data"][&bad_target], "unhealthy");
    assert!(body["timestamp"].is_string());

    let exposition = client
        .get(format!("{base}/metrics"))
        .send()
        .await
        .expect("request")
        .text()
        .await
        .expect("text body");
    assert!(exposition.contains(&format!("sparrow_health_up{{target=\"{ok_target}\"}} 1")));
    assert!(exposition.contains(&format!("sparrow_health_up{{target=\"{bad_target}\"}} 0")));

    // Retiring the kind empties the route and the gauge in one reconcile.
    engine.reconcile(RuntimeConfig::default()).await;

    let response = client
        .get(format!("{base}/v1/metrics/health"))
        .send()
        .await
        .expect("request");
    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);

    let exposition = client
        .get(format!("{base}/metrics"))
        .send()
        .await
        .expect("request")
        .text()
        .await
        .expect("text body");
    assert!(!exposition.contains("sparrow_health_up"));

    root.cancel();
}

#[tokio::test]
async fn test_openapi_document_served() {
    let root = CancellationToken::new();
    let engine = Arc::new(Engine::new(root.child_token()));

    let api_address = free_address().await;
    let _server = tokio::spawn(run_server(
        ApiConfig {
            address: api_address,
            ..ApiConfig::default()
        },
        engine as Arc<dyn CheckReader>,
        HealthState::new(),
        root.child_token(),
    ));

    let client = reqwest::Client::new();
    let base = format!("http://{api_address}");
    assert!(wait_for(&client, &format!("{base}/"), reqwest::StatusCode::OK).await);

    let document = client
        .get(format!("{base}/openapi"))
        .send()
        .await
        .expect("request")
        .text()
        .await
        .expect("text body");
    let parsed: serde_yaml::Value = serde_yaml::from_str(&document).expect("valid yaml");
    assert!(parsed["paths"]["/v1/metrics/traceroute"]["get"].is_mapping());

    for kind in CheckKind::ALL {
        let response = client
            .get(format!("{base}/v1/metrics/{kind}"))
            .send()
            .await
            .expect("request");
        assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);
    }

    root.cancel();
}
