use burrow::{ApplicationConfig, entrypoint};
use clap::Parser;
use serde_json::json;

use crate::common::{
    BrokerHandle, TestClient, http_get, start_hello_world_server, wait_for_broker,
};

/// This test ensures that custom hostnames can only be bound when they match one of
/// the user's reservations, including wildcard reservations.
#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn http_hostname_reservations() {
    // 1. Initialize the broker
    let config = ApplicationConfig::parse_from([
        "burrow",
        "--domain=foobar.tld",
        "--listen-address=127.0.0.1",
        "--http-port=18130",
        "--control-port=18131",
        "--tcp-port-range-start=28130",
        "--tcp-port-range-end=28139",
        "--validate-auth-tokens",
        "--users-file",
        concat!(env!("CARGO_MANIFEST_DIR"), "/tests/data/users.json"),
    ]);
    let _broker_handle = BrokerHandle(tokio::spawn(async move { entrypoint(config).await }));
    wait_for_broker(18131).await;

    // 2. A hostname without a reservation is refused
    let mut client = TestClient::connect(18131).await;
    let messages = client
        .authenticate(json!({
            "type": "http",
            "hostname": "unreserved.example",
            "auth_token": "full-token",
        }))
        .await;
    let rejection = messages.last().unwrap();
    assert_eq!(rejection["event"], "hostnameTaken");
    assert_eq!(
        rejection["data"]["message"],
        "The chosen hostname unreserved.example is not registered for your account."
    );
    assert!(client.recv().await.is_none());
    let (status, _) = http_get(18130, "unreserved.example", "/").await;
    assert_eq!(status, 404);

    // 3. A user without permission to pick hostnames is refused
    let mut client = TestClient::connect(18131).await;
    let messages = client
        .authenticate(json!({
            "type": "http",
            "hostname": "app.full.example",
            "auth_token": "limited-token",
        }))
        .await;
    let rejection = messages.last().unwrap();
    assert_eq!(rejection["event"], "hostnameTaken");
    assert_eq!(
        rejection["data"]["message"],
        "You are not allowed to specify custom hostnames."
    );

    // 4. Reservations of other users don't apply
    let mut client = TestClient::connect(18131).await;
    let messages = client
        .authenticate(json!({
            "type": "http",
            "hostname": "app.full.example",
            "auth_token": "other-token",
        }))
        .await;
    assert_eq!(messages.last().unwrap()["event"], "hostnameTaken");

    // 5. A wildcard hostname matching a reservation is bound and serves every host it covers
    let (local_address, _local_handle) = start_hello_world_server().await;
    let mut client = TestClient::connect(18131).await;
    let messages = client
        .authenticate(json!({
            "type": "http",
            "hostname": "*.full.example",
            "auth_token": "full-token",
        }))
        .await;
    let authenticated = messages.last().unwrap();
    assert_eq!(authenticated["event"], "authenticated");
    assert_eq!(authenticated["data"]["hostname"], "*.full.example");
    let _client_handle = client.serve(local_address);
    let (status, body) = http_get(18130, "api.full.example", "/").await;
    assert_eq!(status, 200);
    assert_eq!(body, "Hello World!");
    let (status, body) = http_get(18130, "deep.api.FULL.example:18130", "/").await;
    assert_eq!(status, 200);
    assert_eq!(body, "Hello World!");
    let (status, _) = http_get(18130, "full.example", "/").await;
    assert_eq!(status, 404);

    // 6. Hostnames covered by the live wildcard can't be bound by anyone else
    for hostname in ["app.full.example", "*.full.example"] {
        let mut client = TestClient::connect(18131).await;
        let messages = client
            .authenticate(json!({
                "type": "http",
                "hostname": hostname,
                "auth_token": "full-token",
            }))
            .await;
        let rejection = messages.last().unwrap();
        assert_eq!(rejection["event"], "hostnameTaken");
        assert_eq!(
            rejection["data"]["message"],
            format!("The chosen hostname {hostname} is already taken.")
        );
    }

    // 7. The wildcard owner still receives the traffic
    let (status, body) = http_get(18130, "app.full.example", "/").await;
    assert_eq!(status, 200);
    assert_eq!(body, "Hello World!");
}
