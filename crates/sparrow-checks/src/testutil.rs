//! Minimal TCP-backed HTTP fixtures for probe tests.

use std::time::Duration;

use tokio::io::{
    AsyncReadExt,
    AsyncWriteExt,
};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

pub(crate) struct TestServer {
    pub url: String,
    handle: JoinHandle<()>,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Serve `response` verbatim to every connection.
pub(crate) async fn http_server(response: &'static str) -> TestServer {
    http_server_with_delay(response, Duration::ZERO).await
}

/// Serve `response` after sleeping `delay`, to exercise client timeouts.
pub(crate) async fn http_server_with_delay(response: &'static str, delay: Duration) -> TestServer {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind test server");
    let addr = listener.local_addr().expect("local addr");

    let handle = tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                let _ = stream.read(&mut buf).await;
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.shutdown().await;
            });
        }
    });

    TestServer {
        url: format!("http://{addr}/"),
        handle,
    }
}
