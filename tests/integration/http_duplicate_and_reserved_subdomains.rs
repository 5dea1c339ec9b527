use burrow::{ApplicationConfig, entrypoint};
use clap::Parser;
use serde_json::json;

use crate::common::{
    BrokerHandle, TestClient, http_get, start_hello_world_server, wait_for_broker,
};

/// This test ensures that a subdomain can only be bound once, and that reserved
/// subdomains are kept for their owners.
#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn http_duplicate_and_reserved_subdomains() {
    // 1. Initialize the broker
    let config = ApplicationConfig::parse_from([
        "burrow",
        "--domain=foobar.tld",
        "--listen-address=127.0.0.1",
        "--http-port=18160",
        "--control-port=18161",
        "--tcp-port-range-start=28160",
        "--tcp-port-range-end=28169",
        "--validate-auth-tokens",
        "--users-file",
        concat!(env!("CARGO_MANIFEST_DIR"), "/tests/data/users.json"),
    ]);
    let _broker_handle = BrokerHandle(tokio::spawn(async move { entrypoint(config).await }));
    wait_for_broker(18161).await;

    // 2. Bind a subdomain
    let (local_address, _local_handle) = start_hello_world_server().await;
    let mut first = TestClient::connect(18161).await;
    let messages = first
        .authenticate(json!({
            "type": "http",
            "subdomain": "shared",
            "auth_token": "full-token",
        }))
        .await;
    assert_eq!(messages.last().unwrap()["event"], "authenticated");
    let _first_handle = first.serve(local_address);

    // 3. Try to bind the same subdomain from a second connection
    let mut second = TestClient::connect(18161).await;
    let messages = second
        .authenticate(json!({
            "type": "http",
            "subdomain": "Shared",
            "auth_token": "full-token",
        }))
        .await;
    let rejection = messages.last().unwrap();
    assert_eq!(rejection["event"], "subdomainTaken");
    assert_eq!(
        rejection["data"]["message"],
        "The chosen subdomain shared is already taken. Please choose a different subdomain."
    );
    assert!(
        second.recv().await.is_none(),
        "connection should be closed after rejection"
    );

    // 4. The first binding is unaffected
    let (status, body) = http_get(18160, "shared.foobar.tld", "/").await;
    assert_eq!(status, 200);
    assert_eq!(body, "Hello World!");

    // 5. The administrative subdomain can never be bound
    let mut admin = TestClient::connect(18161).await;
    let messages = admin
        .authenticate(json!({
            "type": "http",
            "subdomain": "admin",
            "auth_token": "full-token",
        }))
        .await;
    assert_eq!(messages.last().unwrap()["event"], "subdomainTaken");

    // 6. A reserved subdomain is only available to its owner
    let mut other = TestClient::connect(18161).await;
    let messages = other
        .authenticate(json!({
            "type": "http",
            "subdomain": "reserved",
            "auth_token": "other-token",
        }))
        .await;
    let rejection = messages.last().unwrap();
    assert_eq!(rejection["event"], "subdomainTaken");
    assert_eq!(
        rejection["data"]["message"],
        "The chosen subdomain reserved is reserved for a different user."
    );
    let mut owner = TestClient::connect(18161).await;
    let messages = owner
        .authenticate(json!({
            "type": "http",
            "subdomain": "reserved",
            "auth_token": "full-token",
        }))
        .await;
    let authenticated = messages.last().unwrap();
    assert_eq!(authenticated["event"], "authenticated");
    assert_eq!(authenticated["data"]["subdomain"], "reserved");
}
