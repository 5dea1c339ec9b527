use burrow::{ApplicationConfig, entrypoint};
use clap::Parser;
use serde_json::json;

use crate::common::{BrokerHandle, TestClient, wait_for_broker};

/// This test ensures that, when tokens are validated, unknown tokens and
/// unauthorized TCP tunnels are rejected with an explanation before disconnecting.
#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn auth_prevent_unauthorized_actions() {
    // 1. Initialize the broker
    let config = ApplicationConfig::parse_from([
        "burrow",
        "--domain=foobar.tld",
        "--listen-address=127.0.0.1",
        "--http-port=18150",
        "--control-port=18151",
        "--tcp-port-range-start=28150",
        "--tcp-port-range-end=28159",
        "--validate-auth-tokens",
        "--users-file",
        concat!(env!("CARGO_MANIFEST_DIR"), "/tests/data/users.json"),
        "--message-of-the-day=Welcome!",
    ]);
    let _broker_handle = BrokerHandle(tokio::spawn(async move { entrypoint(config).await }));
    wait_for_broker(18151).await;

    // 2. An unknown token is rejected
    let mut client = TestClient::connect(18151).await;
    let messages = client
        .authenticate(json!({"type": "http", "auth_token": "invalid-token"}))
        .await;
    let rejection = messages.last().unwrap();
    assert_eq!(rejection["event"], "authenticationFailed");
    assert_eq!(
        rejection["data"]["message"],
        "Authentication failed. Please check your authentication token and try again."
    );
    assert!(client.recv().await.is_none(), "connection should be closed");

    // 3. A missing token is rejected
    let mut client = TestClient::connect(18151).await;
    let messages = client.authenticate(json!({"type": "http"})).await;
    assert_eq!(messages.last().unwrap()["event"], "authenticationFailed");

    // 4. A user without permission to share TCP ports is rejected
    let mut client = TestClient::connect(18151).await;
    let messages = client
        .authenticate(json!({"type": "tcp", "auth_token": "limited-token"}))
        .await;
    let rejection = messages.last().unwrap();
    assert_eq!(rejection["event"], "authenticationFailed");
    assert_eq!(
        rejection["data"]["message"],
        "You are not allowed to share TCP ports."
    );

    // 5. Malformed and unknown messages are ignored before authentication
    let mut client = TestClient::connect(18151).await;
    client.send(json!({"event": "unknown"})).await;
    client.send(json!({"nothing": "here"})).await;
    let messages = client
        .authenticate(json!({"type": "tcp", "auth_token": "full-token"}))
        .await;
    let authenticated = messages.last().unwrap();
    assert_eq!(authenticated["event"], "authenticated");
    assert_eq!(authenticated["data"]["message"], "Welcome!");
    assert!(authenticated["data"]["port"].is_u64());
}
