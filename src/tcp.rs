use std::{
    collections::HashSet,
    net::{IpAddr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use crate::{
    connection_handler::ConnectionHandler,
    connections::ConnectionRegistry,
    droppable_handle::DroppableHandle,
    proxy_stream::ProxyStream,
    reactor::TcpReactor,
    telemetry::{TELEMETRY_COUNTER_TCP_CONNECTIONS_TOTAL, TELEMETRY_KEY_PORT},
};
use ahash::RandomState;
use async_trait::async_trait;
use bon::Builder;
use color_eyre::eyre::Context;
use dashmap::DashMap;
use metrics::counter;
#[cfg(test)]
use mockall::automock;
use tokio::{
    io::{AsyncRead, AsyncWrite, copy_bidirectional_with_sizes},
    net::{TcpListener, TcpStream},
    time::{sleep, timeout},
};
#[cfg(not(coverage_nightly))]
use tracing::{debug, error, info, warn};

// Pause before accepting again after a failed accept.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

// Service that handles the public TCP sockets of leased ports.
#[derive(Builder)]
pub(crate) struct TcpHandler {
    // Address to listen to when creating sockets.
    listen_address: IpAddr,
    // Map containing the listening task of each socket.
    #[builder(skip = DashMap::default())]
    sockets: DashMap<u16, DroppableHandle<()>, RandomState>,
    // Registry to find the control connection behind each port.
    conn_manager: Arc<ConnectionRegistry<TcpReactor>>,
    // Buffer size for bidirectional copying.
    buffer_size: usize,
    // Optional duration to time out TCP connections.
    tcp_connection_timeout: Option<Duration>,
}

#[cfg_attr(test, automock)]
#[async_trait]
pub(crate) trait PortHandler {
    async fn create_port_listener(&self, port: u16) -> color_eyre::Result<()>;
    fn update_ports(&self, ports: Vec<u16>);
}

#[async_trait]
impl PortHandler for TcpHandler {
    // Create a TCP listener on the given port.
    async fn create_port_listener(&self, port: u16) -> color_eyre::Result<()> {
        if self
            .sockets
            .get(&port)
            .is_some_and(|handle| !handle.is_finished())
        {
            return Ok(());
        }
        let listener = TcpListener::bind((self.listen_address, port))
            .await
            .with_context(|| format!("Error listening on TCP port {port}"))?;
        let conn_manager = Arc::clone(&self.conn_manager);
        let buffer_size = self.buffer_size;
        let tcp_connection_timeout = self.tcp_connection_timeout;
        // Start task that will listen to incoming connections.
        let join_handle = DroppableHandle(tokio::spawn(async move {
            loop {
                let (stream, address) = accept_with_backoff(port, || listener.accept()).await;
                if let Err(error) = stream.set_nodelay(true) {
                    #[cfg(not(coverage_nightly))]
                    warn!(%address, %error, "Error setting nodelay.");
                }
                let Some(handler) = conn_manager.lookup_by_port(port) else {
                    #[cfg(not(coverage_nightly))]
                    debug!(%address, %port, "No tunnel bound to TCP port.");
                    continue;
                };
                counter!(TELEMETRY_COUNTER_TCP_CONNECTIONS_TOTAL, TELEMETRY_KEY_PORT => port.to_string())
                    .increment(1);
                tokio::spawn(tunnel_connection::<_, ProxyStream>(
                    stream,
                    address,
                    port,
                    handler,
                    buffer_size,
                    tcp_connection_timeout,
                ));
            }
        }));
        self.sockets.insert(port, join_handle);
        #[cfg(not(coverage_nightly))]
        info!(%port, "Listening on TCP port.");
        Ok(())
    }

    // Stop the listeners of ports that are no longer bound.
    // A port missing from the list may have been bound since it was taken, so the registry has the final say.
    fn update_ports(&self, ports: Vec<u16>) {
        let ports: HashSet<u16> = ports.into_iter().collect();
        self.sockets
            .retain(|port, _| ports.contains(port) || self.conn_manager.is_port_bound(*port));
    }
}

// Wait for the next connection, pausing after each failed accept (e.g. out of file descriptors).
async fn accept_with_backoff<T, F, Fut>(port: u16, mut accept: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::io::Result<T>>,
{
    loop {
        match accept().await {
            Ok(connection) => return connection,
            Err(error) => {
                #[cfg(not(coverage_nightly))]
                error!(%port, %error, "Error listening on TCP port.");
                sleep(ACCEPT_ERROR_BACKOFF).await;
            }
        }
    }
}

// Pipe one public connection through a proxy channel until either side closes,
// the timeout elapses, or the control connection goes away.
async fn tunnel_connection<H, T>(
    mut stream: TcpStream,
    address: SocketAddr,
    port: u16,
    handler: Arc<H>,
    buffer_size: usize,
    tcp_connection_timeout: Option<Duration>,
) where
    H: ConnectionHandler<T> + ?Sized,
    T: AsyncRead + AsyncWrite + Unpin + Send + Sync + 'static,
{
    let cancellation_token = handler.cancellation_token();
    let mut channel = match handler.tcp_channel(port).await {
        Ok(channel) => channel,
        Err(error) => {
            #[cfg(not(coverage_nightly))]
            info!(%address, %port, %error, "Unable to open TCP proxy connection.");
            return;
        }
    };
    let copy = async {
        match tcp_connection_timeout {
            Some(duration) => {
                let _ = timeout(
                    duration,
                    copy_bidirectional_with_sizes(&mut stream, &mut channel, buffer_size, buffer_size),
                )
                .await;
            }
            None => {
                let _ = copy_bidirectional_with_sizes(
                    &mut stream,
                    &mut channel,
                    buffer_size,
                    buffer_size,
                )
                .await;
            }
        }
    };
    tokio::select! {
        _ = copy => {}
        _ = cancellation_token.cancelled() => {
            #[cfg(not(coverage_nightly))]
            debug!(%address, %port, "Control connection closed, ending TCP connection.");
        }
    }
}
