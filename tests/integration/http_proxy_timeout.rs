use std::time::{Duration, Instant};

use burrow::{ApplicationConfig, entrypoint};
use clap::Parser;
use serde_json::json;

use crate::common::{BrokerHandle, TestClient, http_get, wait_for_broker};

/// This test ensures that a public request fails with 504 when the client never opens
/// the requested proxy connection, without affecting its control connection.
#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn http_proxy_timeout() {
    // 1. Initialize the broker
    let config = ApplicationConfig::parse_from([
        "burrow",
        "--domain=foobar.tld",
        "--listen-address=127.0.0.1",
        "--http-port=18180",
        "--control-port=18181",
        "--tcp-port-range-start=28180",
        "--tcp-port-range-end=28189",
        "--proxy-request-timeout=500ms",
    ]);
    let _broker_handle = BrokerHandle(tokio::spawn(async move { entrypoint(config).await }));
    wait_for_broker(18181).await;

    // 2. Bind a subdomain, but never answer proxy requests
    let mut client = TestClient::connect(18181).await;
    let messages = client
        .authenticate(json!({"type": "http", "subdomain": "unresponsive"}))
        .await;
    assert_eq!(messages.last().unwrap()["event"], "authenticated");

    // 3. The public request times out
    let start = Instant::now();
    let (status, _) = http_get(18180, "unresponsive.foobar.tld", "/").await;
    assert_eq!(status, 504);
    assert!(start.elapsed() >= Duration::from_millis(500));

    // 4. The client was asked for a proxy connection and is still connected
    let message = client.recv().await.expect("control connection closed");
    assert_eq!(message["event"], "createProxy");
    assert!(message["data"]["request_id"].is_string());
    let (status, _) = http_get(18180, "unresponsive.foobar.tld", "/").await;
    assert_eq!(status, 504);
    let second_message = client.recv().await.expect("control connection closed");
    assert_eq!(second_message["event"], "createProxy");
    assert_ne!(message["data"]["request_id"], second_message["data"]["request_id"]);
}
