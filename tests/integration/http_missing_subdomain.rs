use std::time::Duration;

use burrow::{ApplicationConfig, entrypoint};
use clap::Parser;
use serde_json::json;
use tokio::time::timeout;

use crate::common::{
    BrokerHandle, TestClient, http_get, start_hello_world_server, wait_for_broker,
};

/// This test ensures that requests for hosts without a binding return 404,
/// without ever asking a client for a proxy connection.
#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn http_missing_subdomain() {
    // 1. Initialize the broker
    let config = ApplicationConfig::parse_from([
        "burrow",
        "--domain=foobar.tld",
        "--listen-address=127.0.0.1",
        "--http-port=18110",
        "--control-port=18111",
        "--tcp-port-range-start=28110",
        "--tcp-port-range-end=28119",
    ]);
    let _broker_handle = BrokerHandle(tokio::spawn(async move { entrypoint(config).await }));
    wait_for_broker(18111).await;

    // 2. Bind an unrelated subdomain
    let (local_address, _local_handle) = start_hello_world_server().await;
    let mut client = TestClient::connect(18111).await;
    let messages = client
        .authenticate(json!({"type": "http", "subdomain": "present"}))
        .await;
    assert_eq!(messages.last().unwrap()["event"], "authenticated");

    // 3. Unbound subdomains, unknown hostnames, and the root domain are not found
    let (status, _) = http_get(18110, "missing.foobar.tld", "/").await;
    assert_eq!(status, 404);
    let (status, _) = http_get(18110, "unknown.example", "/").await;
    assert_eq!(status, 404);
    let (status, _) = http_get(18110, "foobar.tld", "/").await;
    assert_eq!(status, 404);

    // 4. No proxy connection was requested from the client
    assert!(
        timeout(Duration::from_millis(300), client.recv())
            .await
            .is_err(),
        "client shouldn't receive any proxy requests"
    );
    let _client_handle = client.serve(local_address);
    let (status, body) = http_get(18110, "present.foobar.tld", "/").await;
    assert_eq!(status, 200);
    assert_eq!(body, "Hello World!");
}
