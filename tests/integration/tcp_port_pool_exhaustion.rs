use std::time::Duration;

use burrow::{ApplicationConfig, entrypoint};
use clap::Parser;
use serde_json::json;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    time::{sleep, timeout},
};

use crate::common::{BrokerHandle, TestClient, start_echo_server, wait_for_broker};

/// This test ensures that TCP tunnels lease ports from the configured pool, that an
/// exhausted pool rejects new tunnels, and that ports are returned once their
/// control connection closes.
#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn tcp_port_pool_exhaustion() {
    // 1. Initialize the broker with a single TCP port
    let config = ApplicationConfig::parse_from([
        "burrow",
        "--domain=foobar.tld",
        "--listen-address=127.0.0.1",
        "--http-port=18140",
        "--control-port=18141",
        "--tcp-port-range-start=28140",
        "--tcp-port-range-end=28140",
    ]);
    let _broker_handle = BrokerHandle(tokio::spawn(async move { entrypoint(config).await }));
    wait_for_broker(18141).await;

    // 2. Share a local TCP service
    let (local_address, _local_handle) = start_echo_server().await;
    let mut first = TestClient::connect(18141).await;
    let messages = first
        .authenticate(json!({
            "type": "tcp",
            "host": local_address.to_string(),
            "port": local_address.port(),
        }))
        .await;
    let authenticated = messages.last().unwrap();
    assert_eq!(authenticated["event"], "authenticated");
    assert_eq!(authenticated["data"]["port"], 28140);
    assert_eq!(authenticated["data"]["shared_port"], local_address.port());
    let first_handle = first.serve(local_address);

    // 3. Bytes go through the leased port
    let mut stream = TcpStream::connect("127.0.0.1:28140")
        .await
        .expect("TCP connection failed");
    stream.write_all(b"Hello TCP!").await.unwrap();
    let mut buf = [0u8; 10];
    timeout(Duration::from_secs(5), stream.read_exact(&mut buf))
        .await
        .expect("Timeout waiting for echo")
        .unwrap();
    assert_eq!(&buf, b"Hello TCP!");
    drop(stream);

    // 4. The pool is exhausted while the first tunnel is alive
    let mut second = TestClient::connect(18141).await;
    let messages = second.authenticate(json!({"type": "tcp"})).await;
    let rejection = messages.last().unwrap();
    assert_eq!(rejection["event"], "authenticationFailed");
    assert_eq!(
        rejection["data"]["message"],
        "There are no free TCP ports available on this server. Please try again later."
    );

    // 5. Closing the first tunnel releases its port
    drop(first_handle);
    let authenticated = timeout(Duration::from_secs(5), async {
        loop {
            let mut third = TestClient::connect(18141).await;
            let messages = third.authenticate(json!({"type": "tcp"})).await;
            let last = messages.last().cloned().unwrap();
            if last["event"] == "authenticated" {
                break last;
            }
            sleep(Duration::from_millis(100)).await;
        }
    })
    .await
    .expect("Timeout waiting for the port to be released");
    assert_eq!(authenticated["data"]["port"], 28140);
}
