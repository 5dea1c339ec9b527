use std::time::Instant;

use ahash::RandomState;
use dashmap::{DashMap, mapref::entry::Entry};
use tokio::sync::oneshot;
use tracing::debug;

use crate::{
    error::ServerError,
    protocol::{ClientId, RequestId},
    proxy_stream::ProxyStream,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ProxyKind {
    Http,
    Tcp,
}

// A public connection waiting for its client to open a proxy connection.
pub(crate) struct PendingProxyRequest {
    client_id: ClientId,
    kind: ProxyKind,
    created_at: Instant,
    waiter: oneshot::Sender<ProxyStream>,
}

// Map of single-use signals, each resolved by at most one proxy connection.
#[derive(Default)]
pub(crate) struct PendingRequests {
    map: DashMap<RequestId, PendingProxyRequest, RandomState>,
}

impl PendingRequests {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    // Register a new request, returning the receiving end of its signal.
    pub(crate) fn register(
        &self,
        request_id: RequestId,
        client_id: ClientId,
        kind: ProxyKind,
    ) -> Result<oneshot::Receiver<ProxyStream>, ServerError> {
        let (waiter, receiver) = oneshot::channel();
        match self.map.entry(request_id) {
            Entry::Occupied(_) => Err(ServerError::DuplicateRequestId),
            Entry::Vacant(entry) => {
                entry.insert(PendingProxyRequest {
                    client_id,
                    kind,
                    created_at: Instant::now(),
                    waiter,
                });
                Ok(receiver)
            }
        }
    }

    // Hand the proxy stream over to the waiting public connection.
    // The entry is removed before sending, so each request is resolved at most once.
    pub(crate) fn resolve(
        &self,
        request_id: &RequestId,
        client_id: &ClientId,
        kind: ProxyKind,
        stream: ProxyStream,
    ) -> Result<(), ServerError> {
        let (_, request) = self
            .map
            .remove_if(request_id, |_, request| {
                &request.client_id == client_id && request.kind == kind
            })
            .ok_or(ServerError::PendingRequestNotFound)?;
        debug!(
            %request_id,
            %client_id,
            elapsed = ?request.created_at.elapsed(),
            "Resolving pending proxy request."
        );
        request
            .waiter
            .send(stream)
            .map_err(|_| ServerError::PendingRequestNotFound)
    }

    // Remove a request that won't be fulfilled. Returns whether it was still pending.
    pub(crate) fn expire(&self, request_id: &RequestId) -> bool {
        self.map.remove(request_id).is_some()
    }

    // Remove every request waiting on the given client, waking their waiters with an error.
    pub(crate) fn remove_for_client(&self, client_id: &ClientId) -> usize {
        let len = self.map.len();
        self.map.retain(|_, request| &request.client_id != client_id);
        len.saturating_sub(self.map.len())
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, request_id: &RequestId) -> bool {
        self.map.contains_key(request_id)
    }

    pub(crate) fn len(&self) -> usize {
        self.map.len()
    }
}
