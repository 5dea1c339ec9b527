use std::time::Duration;

use burrow::{ApplicationConfig, entrypoint};
use clap::Parser;
use serde_json::json;
use tokio::time::{sleep, timeout};

use crate::common::{
    BrokerHandle, TestClient, http_get, start_hello_world_server, wait_for_broker,
};

/// This test ensures that closing a control connection removes its bindings,
/// which may then be bound by another client.
#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn connection_close_removes_bindings() {
    // 1. Initialize the broker
    let config = ApplicationConfig::parse_from([
        "burrow",
        "--domain=foobar.tld",
        "--listen-address=127.0.0.1",
        "--http-port=18170",
        "--control-port=18171",
        "--tcp-port-range-start=28170",
        "--tcp-port-range-end=28179",
    ]);
    let _broker_handle = BrokerHandle(tokio::spawn(async move { entrypoint(config).await }));
    wait_for_broker(18171).await;

    // 2. Bind and serve a subdomain
    let (local_address, _local_handle) = start_hello_world_server().await;
    let mut client = TestClient::connect(18171).await;
    let messages = client
        .authenticate(json!({"type": "http", "subdomain": "ephemeral"}))
        .await;
    assert_eq!(messages.last().unwrap()["event"], "authenticated");
    let client_handle = client.serve(local_address);
    let (status, body) = http_get(18170, "ephemeral.foobar.tld", "/").await;
    assert_eq!(status, 200);
    assert_eq!(body, "Hello World!");

    // 3. Disconnect the client
    drop(client_handle);
    if timeout(Duration::from_secs(5), async {
        while http_get(18170, "ephemeral.foobar.tld", "/").await.0 != 404 {
            sleep(Duration::from_millis(100)).await;
        }
    })
    .await
    .is_err()
    {
        panic!("Timeout waiting for binding to be removed.")
    };

    // 4. The subdomain is free again
    let mut client = TestClient::connect(18171).await;
    let messages = client
        .authenticate(json!({"type": "http", "subdomain": "ephemeral"}))
        .await;
    let authenticated = messages.last().unwrap();
    assert_eq!(authenticated["event"], "authenticated");
    assert_eq!(authenticated["data"]["subdomain"], "ephemeral");
}
