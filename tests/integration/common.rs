use std::{net::SocketAddr, time::Duration};

use axum::{Router, routing::get};
use futures_util::{SinkExt, StreamExt};
use http_body_util::{BodyExt, Empty};
use hyper::{Request, StatusCode, body::Bytes};
use hyper_util::rt::TokioIo;
use serde_json::{Value, json};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt, copy_bidirectional},
    net::{TcpListener, TcpStream},
    task::JoinHandle,
    time::{sleep, timeout},
};
use tokio_util::codec::{Framed, LinesCodec};

pub(crate) struct BrokerHandle(pub(crate) JoinHandle<color_eyre::Result<()>>);

impl Drop for BrokerHandle {
    fn drop(&mut self) {
        self.0.abort();
    }
}

// Handle to a helper task that is aborted once it goes out of scope.
pub(crate) struct TaskHandle(pub(crate) JoinHandle<()>);

impl Drop for TaskHandle {
    fn drop(&mut self) {
        self.0.abort();
    }
}

pub(crate) async fn wait_for_broker(control_port: u16) {
    if timeout(Duration::from_secs(5), async {
        while TcpStream::connect(("127.0.0.1", control_port)).await.is_err() {
            sleep(Duration::from_millis(100)).await;
        }
    })
    .await
    .is_err()
    {
        panic!("Timeout waiting for broker to start.")
    };
}

// Local HTTP service that will be exposed through a tunnel.
pub(crate) async fn start_hello_world_server() -> (SocketAddr, TaskHandle) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind local HTTP service");
    let address = listener.local_addr().unwrap();
    let router = Router::new().route("/", get(|| async move { "Hello World!" }));
    let jh = tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    (address, TaskHandle(jh))
}

// Local TCP service that echoes everything back.
pub(crate) async fn start_echo_server() -> (SocketAddr, TaskHandle) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind local TCP service");
    let address = listener.local_addr().unwrap();
    let jh = tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });
    (address, TaskHandle(jh))
}

// Send a GET request to the public HTTP port with the given Host header.
pub(crate) async fn http_get(http_port: u16, host: &str, path: &str) -> (StatusCode, String) {
    let tcp_stream = TcpStream::connect(("127.0.0.1", http_port))
        .await
        .expect("TCP connection failed");
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(tcp_stream))
        .await
        .expect("HTTP handshake failed");
    let jh = tokio::spawn(async move {
        let _ = conn.await;
    });
    let request = Request::builder()
        .method("GET")
        .uri(path)
        .header("host", host)
        .body(Empty::<Bytes>::new())
        .unwrap();
    let response = timeout(Duration::from_secs(10), sender.send_request(request))
        .await
        .expect("Timeout waiting for response")
        .expect("Error sending HTTP request");
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    jh.abort();
    (status, String::from_utf8_lossy(&body).into_owned())
}

// Minimal tunnel client speaking the line-delimited JSON control protocol.
pub(crate) struct TestClient {
    control_port: u16,
    framed: Framed<TcpStream, LinesCodec>,
}

impl TestClient {
    pub(crate) async fn connect(control_port: u16) -> Self {
        let stream = TcpStream::connect(("127.0.0.1", control_port))
            .await
            .expect("Failed to connect to control port");
        TestClient {
            control_port,
            framed: Framed::new(stream, LinesCodec::new()),
        }
    }

    pub(crate) async fn send(&mut self, message: Value) {
        self.framed
            .send(message.to_string())
            .await
            .expect("Failed to send message");
    }

    pub(crate) async fn recv(&mut self) -> Option<Value> {
        match timeout(Duration::from_secs(5), self.framed.next())
            .await
            .expect("Timeout waiting for message")
        {
            Some(Ok(line)) => Some(serde_json::from_str(&line).expect("Invalid JSON message")),
            _ => None,
        }
    }

    // Authenticate and return every message received until the handshake outcome (inclusive).
    pub(crate) async fn authenticate(&mut self, data: Value) -> Vec<Value> {
        self.send(json!({"event": "authenticate", "data": data}))
            .await;
        let mut messages = Vec::new();
        while let Some(message) = self.recv().await {
            let done = message["event"] != "info";
            messages.push(message);
            if done {
                break;
            }
        }
        messages
    }

    // Answer every proxy request by pairing a new proxy connection with the local service.
    pub(crate) fn serve(mut self, local_address: SocketAddr) -> TaskHandle {
        TaskHandle(tokio::spawn(async move {
            while let Some(Ok(line)) = self.framed.next().await {
                let Ok(message) = serde_json::from_str::<Value>(&line) else {
                    continue;
                };
                let registration = match message["event"].as_str() {
                    Some("createProxy") => json!({
                        "event": "registerProxy",
                        "data": {
                            "request_id": message["data"]["request_id"],
                            "client_id": message["data"]["client_id"],
                        }
                    }),
                    Some("createProxyForTcp") => json!({
                        "event": "registerTcpProxy",
                        "data": {
                            "client_id": message["data"]["client_id"],
                            "tcp_request_id": message["data"]["tcp_request_id"],
                        }
                    }),
                    _ => continue,
                };
                let control_port = self.control_port;
                tokio::spawn(async move {
                    let mut proxy = TcpStream::connect(("127.0.0.1", control_port))
                        .await
                        .expect("Failed to open proxy connection");
                    proxy
                        .write_all(format!("{registration}\n").as_bytes())
                        .await
                        .expect("Failed to register proxy connection");
                    let mut local = TcpStream::connect(local_address)
                        .await
                        .expect("Failed to connect to local service");
                    let _ = copy_bidirectional(&mut proxy, &mut local).await;
                });
            }
        }))
    }
}
