use std::{net::SocketAddr, sync::Arc, time::Duration};

use bon::Builder;
use futures_util::{SinkExt, StreamExt};
use metrics::counter;
use tokio::{
    net::TcpStream,
    sync::mpsc,
    time::{Instant, timeout_at},
};
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
#[cfg(not(coverage_nightly))]
use tracing::{debug, info, warn};

use crate::{
    addressing::RandomSubdomains,
    authorization::{AuthorizedSubdomain, IdentityAuthorizer, Rejection},
    connection_handler::ControlHandle,
    connections::ConnectionRegistry,
    error::ServerError,
    pending::ProxyKind,
    protocol::{
        AuthenticateData, ClientId, ClientMessage, MAX_MESSAGE_LENGTH, RequestId, ServerMessage,
        TunnelType,
    },
    proxy_stream::ProxyStream,
    reactor::ConnectionMapReactor,
    repository::User,
    tcp::PortHandler,
    telemetry::TELEMETRY_COUNTER_ORPHAN_PROXIES_TOTAL,
};

// How many random subdomains to try before giving up on a client.
const RANDOM_SUBDOMAIN_ATTEMPTS: usize = 32;

type LineFramed = Framed<TcpStream, LinesCodec>;

// Session handling for every connection accepted on the control port.
// A connection either authenticates and becomes a control connection,
// or registers itself as the proxy connection of a pending request.
#[derive(Builder)]
pub(crate) struct ControlProtocol<R>
where
    R: ConnectionMapReactor<u16> + Send + Sync + 'static,
{
    registry: Arc<ConnectionRegistry<R>>,
    authorizer: Arc<IdentityAuthorizer>,
    // Service that opens public listeners for leased ports.
    port_handler: Arc<dyn PortHandler + Send + Sync>,
    random_subdomains: RandomSubdomains,
    // Time for a new connection to send its first message.
    idle_connection_timeout: Duration,
    // Time for a client to answer a proxy request.
    proxy_request_timeout: Duration,
    maximum_connection_length: Option<Duration>,
}

impl<R> ControlProtocol<R>
where
    R: ConnectionMapReactor<u16> + Send + Sync + 'static,
{
    pub(crate) async fn handle_connection(&self, stream: TcpStream, peer: SocketAddr) {
        if let Err(error) = stream.set_nodelay(true) {
            #[cfg(not(coverage_nightly))]
            warn!(%peer, %error, "Error setting nodelay.");
        }
        let mut framed = Framed::new(stream, LinesCodec::new_with_max_length(MAX_MESSAGE_LENGTH));
        let deadline = Instant::now() + self.idle_connection_timeout;
        // Wait for the first recognized message, which decides what this connection is.
        let message = loop {
            match timeout_at(deadline, framed.next()).await {
                Err(_) => {
                    #[cfg(not(coverage_nightly))]
                    debug!(%peer, "Dropping idle connection.");
                    return;
                }
                Ok(None) => return,
                Ok(Some(Err(LinesCodecError::MaxLineLengthExceeded))) => {
                    #[cfg(not(coverage_nightly))]
                    debug!(%peer, "Ignoring message over maximum length.");
                }
                Ok(Some(Err(LinesCodecError::Io(error)))) => {
                    #[cfg(not(coverage_nightly))]
                    debug!(%peer, %error, "Error reading from connection.");
                    return;
                }
                Ok(Some(Ok(line))) => match ClientMessage::decode(&line) {
                    Ok(Some(message)) => break message,
                    Ok(None) => {
                        #[cfg(not(coverage_nightly))]
                        debug!(%peer, "Ignoring unknown event.");
                    }
                    Err(error) => {
                        #[cfg(not(coverage_nightly))]
                        debug!(%peer, %error, "Ignoring malformed message.");
                    }
                },
            }
        };
        match message {
            ClientMessage::Authenticate(data) => self.authenticate(framed, peer, data).await,
            ClientMessage::RegisterProxy {
                request_id,
                client_id,
            } => self.register_proxy(framed, peer, request_id, client_id, ProxyKind::Http),
            ClientMessage::RegisterTcpProxy {
                client_id,
                tcp_request_id,
            } => self.register_proxy(framed, peer, tcp_request_id, client_id, ProxyKind::Tcp),
        }
    }

    // Hand the connection over to the public connection waiting for it.
    fn register_proxy(
        &self,
        framed: LineFramed,
        peer: SocketAddr,
        request_id: RequestId,
        client_id: ClientId,
        kind: ProxyKind,
    ) {
        let stream = ProxyStream::from_framed(framed);
        match self
            .registry
            .resolve_pending_proxy_request(&request_id, &client_id, kind, stream)
        {
            Ok(()) => {
                #[cfg(not(coverage_nightly))]
                debug!(%peer, %request_id, %client_id, "Proxy connection registered.");
            }
            Err(error) => {
                counter!(TELEMETRY_COUNTER_ORPHAN_PROXIES_TOTAL).increment(1);
                #[cfg(not(coverage_nightly))]
                info!(%peer, %request_id, %client_id, %error, "Closing orphan proxy connection.");
            }
        }
    }

    async fn authenticate(&self, mut framed: LineFramed, peer: SocketAddr, data: AuthenticateData) {
        let (tx, rx) = mpsc::unbounded_channel();
        match self.handshake(peer, data, tx).await {
            Ok(handle) => self.run_control_connection(framed, handle, rx).await,
            Err(rejection) => {
                #[cfg(not(coverage_nightly))]
                info!(%peer, kind = ?rejection.kind, message = %rejection.message, "Rejecting client.");
                if let Err(error) = framed.send(rejection.into_message().encode()).await {
                    #[cfg(not(coverage_nightly))]
                    debug!(%peer, %error, "Error sending rejection.");
                }
            }
        }
    }

    // Authorize the client and install its binding. Messages for the client are queued on `tx`.
    async fn handshake(
        &self,
        peer: SocketAddr,
        data: AuthenticateData,
        tx: mpsc::UnboundedSender<ServerMessage>,
    ) -> Result<Arc<ControlHandle>, Rejection> {
        let messages = self.authorizer.messages();
        let user = self
            .authorizer
            .authenticate(data.auth_token.as_deref())
            .await?;
        let AuthenticateData {
            tunnel_type,
            host,
            subdomain,
            hostname,
            port: shared_port,
            ..
        } = data;
        let (handle, hostname, subdomain, port) = match tunnel_type {
            TunnelType::Http => match hostname.filter(|hostname| !hostname.is_empty()) {
                Some(hostname) => {
                    let hostname = self
                        .authorizer
                        .authorize_hostname(&hostname, user.as_ref())
                        .await?;
                    let handle = self.register(peer, user, host, tx);
                    if self
                        .registry
                        .bind_hostname(handle.client_id(), &hostname)
                        .is_err()
                    {
                        self.registry.remove_control_connection(handle.client_id());
                        return Err(Rejection::hostname_taken(&messages.hostname_taken, &hostname));
                    }
                    (handle, Some(hostname), None, None)
                }
                None => {
                    let AuthorizedSubdomain { subdomain, notice } = self
                        .authorizer
                        .authorize_subdomain(subdomain.as_deref(), user.as_ref())
                        .await?;
                    let handle = self.register(peer, user, host, tx);
                    if let Some(message) = notice {
                        handle.send(ServerMessage::Info { message });
                    }
                    let result = match subdomain {
                        Some(subdomain) => self
                            .registry
                            .bind_subdomain(handle.client_id(), &subdomain)
                            .map(|_| subdomain.clone())
                            .map_err(|_| {
                                Rejection::subdomain_taken(&messages.subdomain_taken, &subdomain)
                            }),
                        None => self.bind_random_subdomain(handle.client_id()).await,
                    };
                    match result {
                        Ok(subdomain) => (handle, None, Some(subdomain), None),
                        Err(rejection) => {
                            self.registry.remove_control_connection(handle.client_id());
                            return Err(rejection);
                        }
                    }
                }
            },
            TunnelType::Tcp => {
                if !self.authorizer.authorize_tcp_sharing(user.as_ref()) {
                    return Err(Rejection::authentication_failed(
                        &messages.tcp_sharing_unauthorized,
                    ));
                }
                let handle = self.register(peer, user, host, tx);
                match self.open_tcp_port(handle.client_id()).await {
                    Ok(port) => (handle, None, None, Some(port)),
                    Err(error) => {
                        #[cfg(not(coverage_nightly))]
                        warn!(%peer, %error, "Unable to lease TCP port.");
                        self.registry.remove_control_connection(handle.client_id());
                        return Err(Rejection::authentication_failed(
                            &messages.no_free_tcp_port_available,
                        ));
                    }
                }
            }
        };
        if let Some(max_length) = self.maximum_connection_length {
            self.registry.limit_connection_lifetime(
                handle.client_id(),
                max_length,
                messages.maximum_connection_length_reached.clone(),
            );
        }
        #[cfg(not(coverage_nightly))]
        info!(
            %peer,
            client_id = %handle.client_id(),
            user = handle.user().map(|user| user.name.as_str()),
            host = handle.shared_host(),
            subdomain = subdomain.as_deref(),
            hostname = hostname.as_deref(),
            port,
            "Client authenticated."
        );
        handle.send(ServerMessage::Authenticated {
            message: messages.message_of_the_day.clone(),
            subdomain,
            hostname,
            port,
            shared_port: port.and(shared_port),
            client_id: handle.client_id().clone(),
        });
        Ok(handle)
    }

    fn register(
        &self,
        peer: SocketAddr,
        user: Option<User>,
        shared_host: Option<String>,
        tx: mpsc::UnboundedSender<ServerMessage>,
    ) -> Arc<ControlHandle> {
        let pending = Arc::clone(self.registry.pending());
        let proxy_request_timeout = self.proxy_request_timeout;
        self.registry.register_control_connection(|client_id| {
            ControlHandle::builder()
                .client_id(client_id)
                .maybe_user(user)
                .maybe_shared_host(shared_host)
                .peer(peer)
                .tx(tx)
                .pending(pending)
                .proxy_request_timeout(proxy_request_timeout)
                .build()
        })
    }

    // Bind a fresh random subdomain, skipping names that are reserved or already bound.
    async fn bind_random_subdomain(&self, client_id: &ClientId) -> Result<String, Rejection> {
        let mut subdomain = String::new();
        for _ in 0..RANDOM_SUBDOMAIN_ATTEMPTS {
            subdomain = self.random_subdomains.generate();
            if self.authorizer.is_subdomain_reserved(&subdomain).await {
                continue;
            }
            match self.registry.bind_subdomain(client_id, &subdomain) {
                Ok(_) => return Ok(subdomain),
                Err(ServerError::BindingConflict) => continue,
                Err(_) => break,
            }
        }
        Err(Rejection::subdomain_taken(
            &self.authorizer.messages().subdomain_taken,
            &subdomain,
        ))
    }

    // Lease a port and open its public listener, moving on to another port if the OS refuses it.
    async fn open_tcp_port(&self, client_id: &ClientId) -> Result<u16, ServerError> {
        for _ in 0..self.registry.port_capacity() {
            let binding = self.registry.bind_tcp_port(client_id)?;
            let Some(port) = binding.port() else {
                continue;
            };
            match self.port_handler.create_port_listener(port).await {
                Ok(()) => return Ok(port),
                Err(error) => {
                    #[cfg(not(coverage_nightly))]
                    warn!(%port, error = %error, "Unable to listen on leased port.");
                    self.registry.unbind_tcp_port(port);
                }
            }
        }
        Err(ServerError::NoFreePortAvailable)
    }

    // Relay queued messages to the client and watch for the connection closing,
    // then remove the connection with everything it owns.
    async fn run_control_connection(
        &self,
        framed: LineFramed,
        handle: Arc<ControlHandle>,
        mut rx: mpsc::UnboundedReceiver<ServerMessage>,
    ) {
        let client_id = handle.client_id().clone();
        let (mut sink, mut stream) = framed.split();
        loop {
            tokio::select! {
                biased;
                message = rx.recv() => {
                    let Some(message) = message else {
                        break;
                    };
                    if let Err(error) = sink.send(message.encode()).await {
                        #[cfg(not(coverage_nightly))]
                        debug!(%client_id, %error, "Error writing to control connection.");
                        break;
                    }
                }
                _ = handle.closed() => break,
                line = stream.next() => match line {
                    Some(Ok(line)) => handle_control_message(&client_id, &line),
                    Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                        #[cfg(not(coverage_nightly))]
                        debug!(%client_id, "Ignoring message over maximum length.");
                    }
                    Some(Err(LinesCodecError::Io(error))) => {
                        #[cfg(not(coverage_nightly))]
                        debug!(%client_id, %error, "Error reading from control connection.");
                        break;
                    }
                    None => break,
                },
            }
        }
        self.registry.remove_control_connection(&client_id);
    }
}

// Messages on an authenticated control connection have no effect besides logging.
fn handle_control_message(client_id: &ClientId, line: &str) {
    match ClientMessage::decode(line) {
        Ok(Some(ClientMessage::Authenticate(_))) => {
            #[cfg(not(coverage_nightly))]
            warn!(%client_id, "Ignoring repeated authentication.");
        }
        Ok(Some(ClientMessage::RegisterProxy { .. } | ClientMessage::RegisterTcpProxy { .. })) => {
            #[cfg(not(coverage_nightly))]
            warn!(%client_id, "Ignoring proxy registration on control connection.");
        }
        Ok(None) => {
            #[cfg(not(coverage_nightly))]
            debug!(%client_id, "Ignoring unknown event.");
        }
        Err(error) => {
            #[cfg(not(coverage_nightly))]
            debug!(%client_id, %error, "Ignoring malformed message.");
        }
    }
}
