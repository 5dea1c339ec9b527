use std::{net::SocketAddr, sync::Arc, time::Duration};

use async_trait::async_trait;
use bon::Builder;
use chrono::{DateTime, Utc};
use metrics::counter;
#[cfg(test)]
use mockall::automock;
use tokio::{sync::mpsc, time::timeout};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    error::ServerError,
    pending::{PendingRequests, ProxyKind},
    protocol::{ClientId, RequestId, ServerMessage},
    proxy_stream::ProxyStream,
    repository::User,
    telemetry::TELEMETRY_COUNTER_PROXY_TIMEOUTS_TOTAL,
};

// Trait for creating proxy channels through a client's control connection.
#[cfg_attr(test, automock)]
#[async_trait]
pub(crate) trait ConnectionHandler<T: Send + Sync + 'static> {
    // Token that is cancelled once the control connection closes.
    fn cancellation_token(&self) -> CancellationToken;

    // Return a proxy channel for one public HTTP request.
    async fn tunneling_channel(&self) -> Result<T, ServerError>;

    // Return a proxy channel for one public connection on the given TCP port.
    async fn tcp_channel(&self, port: u16) -> Result<T, ServerError>;
}

// Handle to an authenticated control connection.
#[derive(Builder)]
pub(crate) struct ControlHandle {
    client_id: ClientId,
    user: Option<User>,
    // Local host announced by the client.
    shared_host: Option<String>,
    peer: SocketAddr,
    // Messages queued for the control connection's writer.
    tx: mpsc::UnboundedSender<ServerMessage>,
    #[builder(default)]
    cancellation_token: CancellationToken,
    pending: Arc<PendingRequests>,
    // How long to wait for the client to open a proxy connection.
    proxy_request_timeout: Duration,
    #[builder(skip = Utc::now())]
    created_at: DateTime<Utc>,
}

// Removes a pending request that is no longer being waited on.
struct PendingRequestGuard<'a> {
    pending: &'a PendingRequests,
    request_id: RequestId,
}

impl Drop for PendingRequestGuard<'_> {
    fn drop(&mut self) {
        self.pending.expire(&self.request_id);
    }
}

impl ControlHandle {
    pub(crate) fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    pub(crate) fn user(&self) -> Option<&User> {
        self.user.as_ref()
    }

    pub(crate) fn shared_host(&self) -> Option<&str> {
        self.shared_host.as_deref()
    }

    pub(crate) fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub(crate) fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    // Queue a message for the client. Returns false if the connection is gone.
    pub(crate) fn send(&self, message: ServerMessage) -> bool {
        self.tx.send(message).is_ok()
    }

    pub(crate) fn close(&self) {
        self.cancellation_token.cancel();
    }

    // Resolves once the control connection is closed.
    pub(crate) async fn closed(&self) {
        self.cancellation_token.cancelled().await
    }

    #[cfg(test)]
    pub(crate) fn is_closed(&self) -> bool {
        self.cancellation_token.is_cancelled()
    }

    async fn request_proxy(
        &self,
        kind: ProxyKind,
        message: impl FnOnce(RequestId) -> ServerMessage,
    ) -> Result<ProxyStream, ServerError> {
        let request_id = RequestId::random();
        let receiver =
            self.pending
                .register(request_id.clone(), self.client_id.clone(), kind)?;
        let guard = PendingRequestGuard {
            pending: &self.pending,
            request_id: request_id.clone(),
        };
        if !self.send(message(request_id)) {
            return Err(ServerError::ProxyConnectionClosed);
        }
        tokio::select! {
            result = timeout(self.proxy_request_timeout, receiver) => match result {
                Ok(Ok(stream)) => Ok(stream),
                // The sender was dropped, meaning that the request was removed with its client.
                Ok(Err(_)) => Err(ServerError::ProxyConnectionClosed),
                Err(_) => {
                    debug!(
                        client_id = %self.client_id,
                        request_id = %guard.request_id,
                        "Timed out waiting for proxy connection."
                    );
                    counter!(TELEMETRY_COUNTER_PROXY_TIMEOUTS_TOTAL).increment(1);
                    Err(ServerError::ProxyTimeout)
                }
            },
            _ = self.cancellation_token.cancelled() => Err(ServerError::ProxyConnectionClosed),
        }
    }
}

#[async_trait]
impl ConnectionHandler<ProxyStream> for ControlHandle {
    fn cancellation_token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }

    async fn tunneling_channel(&self) -> Result<ProxyStream, ServerError> {
        self.request_proxy(ProxyKind::Http, |request_id| ServerMessage::CreateProxy {
            request_id,
            client_id: self.client_id.clone(),
        })
        .await
    }

    async fn tcp_channel(&self, port: u16) -> Result<ProxyStream, ServerError> {
        self.request_proxy(ProxyKind::Tcp, |tcp_request_id| {
            ServerMessage::CreateProxyForTcp {
                client_id: self.client_id.clone(),
                tcp_request_id,
                port,
            }
        })
        .await
    }
}
