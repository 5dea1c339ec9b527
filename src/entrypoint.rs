use std::{sync::Arc, time::Duration};

use color_eyre::eyre::Context;
use hyper::{Request, body::Incoming, server::conn::http1, service::service_fn};
use hyper_util::rt::TokioIo;
use tokio::{net::TcpListener, pin, time::sleep};
use tracing::{debug, error, info, warn};

use crate::{
    addressing::RandomSubdomains,
    authorization::IdentityAuthorizer,
    config::ApplicationConfig,
    connection_handler::ControlHandle,
    connections::ConnectionRegistry,
    control::ControlProtocol,
    droppable_handle::DroppableHandle,
    http::{ProxyData, proxy_handler},
    ports::PortAllocator,
    proxy_stream::ProxyStream,
    reactor::TcpReactor,
    repository::MemoryRepository,
    tcp::TcpHandler,
    telemetry::describe_metrics,
};

// How often to log a summary of the live bindings.
const STATE_LOG_INTERVAL: Duration = Duration::from_secs(60);

#[doc(hidden)]
// Main entrypoint of the application.
pub async fn entrypoint(config: ApplicationConfig) -> color_eyre::Result<()> {
    info!("Starting burrow...");
    let proxy_request_timeout: Duration = config.proxy_request_timeout.into();
    let idle_connection_timeout: Duration = config.idle_connection_timeout.into();
    let http_request_timeout: Option<Duration> = config.http_request_timeout.map(Into::into);
    let tcp_connection_timeout: Option<Duration> = config.tcp_connection_timeout.map(Into::into);
    let maximum_connection_length: Option<Duration> =
        config.maximum_connection_length.map(Into::into);
    describe_metrics();

    // Initialize modules
    let ports = Arc::new(
        PortAllocator::new(config.tcp_port_range_start..=config.tcp_port_range_end)
            .with_context(|| "Error setting up TCP port range")?,
    );
    let repository = Arc::new(match config.users_file.as_deref() {
        Some(path) => MemoryRepository::from_file(path).await?,
        None => {
            if config.validate_auth_tokens {
                warn!("No users file provided; every authentication token will be rejected.");
            }
            MemoryRepository::default()
        }
    });
    let registry: Arc<ConnectionRegistry<TcpReactor>> = Arc::new(ConnectionRegistry::new(
        config.domain.clone(),
        config.admin_subdomain.clone(),
        ports,
        None,
    ));
    let tcp_handler = Arc::new(
        TcpHandler::builder()
            .listen_address(config.listen_address)
            .conn_manager(Arc::clone(&registry))
            .buffer_size(config.buffer_size)
            .maybe_tcp_connection_timeout(tcp_connection_timeout)
            .build(),
    );
    // Add TCP handler service as a listener for TCP port updates.
    registry.update_reactor(Some(TcpReactor {
        handler: Arc::clone(&tcp_handler),
    }));
    let authorizer = Arc::new(
        IdentityAuthorizer::builder()
            .users(repository.clone())
            .subdomains(repository.clone())
            .hostnames(repository)
            .bindings(registry.clone())
            .messages(Arc::new(config.messages))
            .validate_auth_tokens(config.validate_auth_tokens)
            .admin_subdomain(config.admin_subdomain)
            .build(),
    );
    let control = Arc::new(
        ControlProtocol::builder()
            .registry(Arc::clone(&registry))
            .authorizer(authorizer)
            .port_handler(tcp_handler)
            .random_subdomains(RandomSubdomains::new(config.random_subdomain_length.into()))
            .idle_connection_timeout(idle_connection_timeout)
            .proxy_request_timeout(proxy_request_timeout)
            .maybe_maximum_connection_length(maximum_connection_length)
            .build(),
    );

    // Periodically log the state of the registry.
    let registry_clone = Arc::clone(&registry);
    let _state_log_handle = DroppableHandle(tokio::spawn(async move {
        loop {
            sleep(STATE_LOG_INTERVAL).await;
            debug!(
                control_connections = registry_clone.control_count(),
                tcp_ports_in_use = registry_clone.tcp_ports().len(),
                tcp_port_capacity = registry_clone.port_capacity(),
                bindings = ?registry_clone.data(),
                "Broker state."
            );
        }
    }));

    // HTTP handler
    let http_listener = TcpListener::bind((config.listen_address, config.http_port))
        .await
        .with_context(|| "Error listening to HTTP port")?;
    info!(
        "Listening for HTTP connections on port {}.",
        config.http_port
    );
    let http_proxy_data: Arc<ProxyData<_, ControlHandle, ProxyStream>> = Arc::new(
        ProxyData::builder()
            .conn_manager(Arc::clone(&registry))
            .http_port(config.http_port)
            .buffer_size(config.buffer_size)
            .maybe_http_request_timeout(http_request_timeout)
            .maybe_websocket_timeout(tcp_connection_timeout)
            .build(),
    );
    let mut join_handle_http = DroppableHandle(tokio::spawn(async move {
        loop {
            let proxy_data = Arc::clone(&http_proxy_data);
            let (stream, address) = match http_listener.accept().await {
                Ok((stream, address)) => (stream, address),
                Err(error) => {
                    error!(%error, "Unable to accept HTTP connection.");
                    break;
                }
            };
            if let Err(error) = stream.set_nodelay(true) {
                warn!(%error, %address, "Error setting nodelay.");
            }
            // Create a Hyper service and serve over the accepted TCP connection.
            let service = service_fn(move |req: Request<Incoming>| {
                proxy_handler(req, address, Arc::clone(&proxy_data))
            });
            let io = TokioIo::new(stream);
            tokio::spawn(async move {
                let conn = http1::Builder::new()
                    .serve_connection(io, service)
                    .with_upgrades();
                if let Err(error) = conn.await {
                    debug!(%error, %address, "HTTP connection ended with error.");
                }
            });
        }
    }));

    // Control handler
    let control_listener = TcpListener::bind((config.listen_address, config.control_port))
        .await
        .with_context(|| "Error listening to control port")?;
    info!(
        "Listening for control connections on port {}.",
        config.control_port
    );
    info!("burrow is now running.");
    // Add OS signal handlers for termination.
    let signal_handler = wait_for_signal();
    pin!(signal_handler);
    loop {
        tokio::select! {
            conn = control_listener.accept() => {
                let (stream, address) = match conn {
                    Ok((stream, address)) => (stream, address),
                    Err(error) => {
                        error!(%error, "Unable to accept control connection.");
                        break;
                    },
                };
                let control = Arc::clone(&control);
                tokio::spawn(async move {
                    control.handle_connection(stream, address).await;
                });
            }
            _ = &mut signal_handler => {
                break;
            }
            _ = &mut join_handle_http.0 => {
                break;
            }
        }
    }
    info!("burrow is shutting down.");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let (Ok(mut signal_terminate), Ok(mut signal_interrupt)) = (
        signal(SignalKind::terminate()),
        signal(SignalKind::interrupt()),
    ) else {
        error!("Unable to install signal handlers.");
        return std::future::pending().await;
    };

    tokio::select! {
        _ = signal_terminate.recv() => debug!("Received SIGTERM."),
        _ = signal_interrupt.recv() => debug!("Received SIGINT."),
    };
}

#[cfg(windows)]
async fn wait_for_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => debug!("Received CTRL_C."),
        Err(error) => {
            error!(%error, "Unable to install signal handler.");
            std::future::pending().await
        }
    }
}
