use std::{
    collections::BTreeMap,
    fmt::Display,
    sync::{Arc, Mutex, RwLock},
    time::Duration,
};

use ahash::RandomState;
use chrono::{DateTime, Utc};
use dashmap::{DashMap, mapref::entry::Entry};
use metrics::gauge;
#[cfg(test)]
use mockall::automock;
use tokio::time::sleep;
use tracing::{debug, info};

use crate::{
    addressing::{RequestedHost, hostname_matches, hostnames_overlap, parse_host},
    connection_handler::ControlHandle,
    error::ServerError,
    pending::{PendingRequests, ProxyKind},
    ports::{PortAllocator, PortLease},
    protocol::{ClientId, RequestId, ServerMessage},
    proxy_stream::ProxyStream,
    reactor::{ConnectionMapReactor, DummyConnectionMapReactor},
    telemetry::TELEMETRY_GAUGE_CONTROL_CONNECTIONS,
};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) enum BindingKey {
    Subdomain(String),
    Hostname(String),
    Port(u16),
}

impl Display for BindingKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BindingKey::Subdomain(subdomain) => write!(f, "subdomain:{subdomain}"),
            BindingKey::Hostname(hostname) => write!(f, "hostname:{hostname}"),
            BindingKey::Port(port) => write!(f, "port:{port}"),
        }
    }
}

// Published identity of a tunnel, owned by a single control connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct TunnelBinding {
    pub(crate) key: BindingKey,
    pub(crate) client_id: ClientId,
    pub(crate) created_at: DateTime<Utc>,
    // Deadline after which the owning connection is forcefully closed.
    pub(crate) expires_at: Option<DateTime<Utc>>,
}

impl TunnelBinding {
    pub(crate) fn port(&self) -> Option<u16> {
        match self.key {
            BindingKey::Port(port) => Some(port),
            _ => None,
        }
    }

    fn new(key: BindingKey, client_id: ClientId) -> Self {
        TunnelBinding {
            key,
            client_id,
            created_at: Utc::now(),
            expires_at: None,
        }
    }
}

struct TcpBinding {
    binding: TunnelBinding,
    // Released back into the pool once the binding is dropped.
    _lease: PortLease,
}

// Lookup of the control connection responsible for the Host of a public HTTP request.
#[cfg_attr(test, automock)]
pub(crate) trait ConnectionGetByHttpHost<H> {
    fn get_by_http_host(&self, host: &str) -> Option<H>;
}

// Whether a subdomain or hostname is currently bound by any client.
#[cfg_attr(test, automock)]
pub(crate) trait LiveBindings {
    fn is_subdomain_bound(&self, subdomain: &str) -> bool;
    fn is_hostname_bound(&self, hostname: &str) -> bool;
}

// Authoritative state of live control connections and their bindings.
pub(crate) struct ConnectionRegistry<R = DummyConnectionMapReactor> {
    // Root domain that subdomains are served under.
    domain: String,
    // Subdomain that cannot be bound by any tunnel.
    admin_subdomain: String,
    ports: Arc<PortAllocator>,
    pending: Arc<PendingRequests>,
    controls: DashMap<ClientId, Arc<ControlHandle>, RandomState>,
    subdomains: DashMap<String, TunnelBinding, RandomState>,
    hostnames: DashMap<String, TunnelBinding, RandomState>,
    // Held while checking a hostname for overlaps and inserting it.
    hostname_bind_lock: Mutex<()>,
    tcp: DashMap<u16, TcpBinding, RandomState>,
    // Notified with the list of bound ports whenever it changes.
    reactor: RwLock<Option<R>>,
}

impl<R> ConnectionRegistry<R>
where
    R: ConnectionMapReactor<u16> + Send + Sync + 'static,
{
    pub(crate) fn new(
        domain: impl Into<String>,
        admin_subdomain: impl Into<String>,
        ports: Arc<PortAllocator>,
        reactor: Option<R>,
    ) -> Self {
        ConnectionRegistry {
            domain: domain.into(),
            admin_subdomain: admin_subdomain.into().to_ascii_lowercase(),
            ports,
            pending: Arc::new(PendingRequests::new()),
            controls: DashMap::default(),
            subdomains: DashMap::default(),
            hostnames: DashMap::default(),
            hostname_bind_lock: Mutex::new(()),
            tcp: DashMap::default(),
            reactor: RwLock::new(reactor),
        }
    }

    pub(crate) fn pending(&self) -> &Arc<PendingRequests> {
        &self.pending
    }

    // Store a new control connection under a freshly assigned client ID.
    pub(crate) fn register_control_connection(
        &self,
        build: impl FnOnce(ClientId) -> ControlHandle,
    ) -> Arc<ControlHandle> {
        let mut client_id = ClientId::random();
        let entry = loop {
            match self.controls.entry(client_id) {
                Entry::Vacant(entry) => break entry,
                Entry::Occupied(_) => client_id = ClientId::random(),
            }
        };
        let handle = Arc::new(build(entry.key().clone()));
        entry.insert(Arc::clone(&handle));
        gauge!(TELEMETRY_GAUGE_CONTROL_CONNECTIONS).set(self.controls.len() as f64);
        handle
    }

    pub(crate) fn bind_subdomain(
        &self,
        client_id: &ClientId,
        subdomain: &str,
    ) -> Result<TunnelBinding, ServerError> {
        let subdomain = subdomain.to_ascii_lowercase();
        if subdomain == self.admin_subdomain {
            return Err(ServerError::BindingConflict);
        }
        self.ensure_client(client_id)?;
        match self.subdomains.entry(subdomain.clone()) {
            Entry::Occupied(_) => Err(ServerError::BindingConflict),
            Entry::Vacant(entry) => {
                let binding = TunnelBinding::new(BindingKey::Subdomain(subdomain), client_id.clone());
                entry.insert(binding.clone());
                Ok(binding)
            }
        }
    }

    pub(crate) fn bind_hostname(
        &self,
        client_id: &ClientId,
        hostname: &str,
    ) -> Result<TunnelBinding, ServerError> {
        let hostname = hostname.to_ascii_lowercase();
        self.ensure_client(client_id)?;
        let _guard = self.hostname_bind_lock.lock().expect("not poisoned");
        if self.is_hostname_bound(&hostname) {
            return Err(ServerError::BindingConflict);
        }
        let binding = TunnelBinding::new(BindingKey::Hostname(hostname.clone()), client_id.clone());
        self.hostnames.insert(hostname, binding.clone());
        Ok(binding)
    }

    // Lease a port from the pool and bind it to the client.
    pub(crate) fn bind_tcp_port(&self, client_id: &ClientId) -> Result<TunnelBinding, ServerError> {
        self.ensure_client(client_id)?;
        let lease = self.ports.lease()?;
        let port = lease.port();
        let binding = TunnelBinding::new(BindingKey::Port(port), client_id.clone());
        self.tcp.insert(
            port,
            TcpBinding {
                binding: binding.clone(),
                _lease: lease,
            },
        );
        self.notify_reactor();
        Ok(binding)
    }

    // Remove a TCP binding, releasing its port. Returns whether it existed.
    pub(crate) fn unbind_tcp_port(&self, port: u16) -> bool {
        let removed = self.tcp.remove(&port).is_some();
        if removed {
            self.notify_reactor();
        }
        removed
    }

    pub(crate) fn lookup_by_subdomain(&self, subdomain: &str) -> Option<Arc<ControlHandle>> {
        let client_id = self
            .subdomains
            .get(&subdomain.to_ascii_lowercase())
            .map(|binding| binding.client_id.clone())?;
        self.get_control(&client_id)
    }

    // Exact hostname first, then the first bound pattern matching the host.
    pub(crate) fn lookup_by_hostname(&self, hostname: &str) -> Option<Arc<ControlHandle>> {
        let hostname = hostname.to_ascii_lowercase();
        let client_id = match self.hostnames.get(&hostname) {
            Some(binding) => binding.client_id.clone(),
            None => self
                .hostnames
                .iter()
                .find(|entry| hostname_matches(entry.key(), &hostname))
                .map(|entry| entry.client_id.clone())?,
        };
        self.get_control(&client_id)
    }

    pub(crate) fn lookup_by_port(&self, port: u16) -> Option<Arc<ControlHandle>> {
        let client_id = self
            .tcp
            .get(&port)
            .map(|entry| entry.binding.client_id.clone())?;
        self.get_control(&client_id)
    }

    // Remove a control connection and everything it owns.
    pub(crate) fn remove_control_connection(
        &self,
        client_id: &ClientId,
    ) -> Option<Arc<ControlHandle>> {
        let (_, handle) = self.controls.remove(client_id)?;
        let removed = self.bindings(client_id);
        self.subdomains
            .retain(|_, binding| &binding.client_id != client_id);
        self.hostnames
            .retain(|_, binding| &binding.client_id != client_id);
        let tcp_len = self.tcp.len();
        self.tcp
            .retain(|_, entry| &entry.binding.client_id != client_id);
        for binding in &removed {
            debug!(
                %client_id,
                binding = %binding.key,
                created_at = %binding.created_at,
                expires_at = ?binding.expires_at,
                "Removing binding."
            );
        }
        let pending = self.pending.remove_for_client(client_id);
        handle.close();
        if self.tcp.len() < tcp_len {
            self.notify_reactor();
        }
        gauge!(TELEMETRY_GAUGE_CONTROL_CONNECTIONS).set(self.controls.len() as f64);
        info!(
            %client_id,
            peer = %handle.peer(),
            user = handle.user().map(|user| user.name.as_str()),
            host = handle.shared_host(),
            connected_for = ?(Utc::now() - handle.created_at()).to_std().unwrap_or_default(),
            bindings = ?removed.iter().map(|binding| binding.key.to_string()).collect::<Vec<_>>(),
            pending,
            "Control connection removed."
        );
        Some(handle)
    }

    pub(crate) fn resolve_pending_proxy_request(
        &self,
        request_id: &RequestId,
        client_id: &ClientId,
        kind: ProxyKind,
        stream: ProxyStream,
    ) -> Result<(), ServerError> {
        self.ensure_client(client_id)?;
        self.pending.resolve(request_id, client_id, kind, stream)
    }

    // Forcefully close the client's connection after the given duration.
    // Returns whether a limit was scheduled; zero means unlimited.
    pub(crate) fn limit_connection_lifetime(
        &self,
        client_id: &ClientId,
        max_length: Duration,
        notice: String,
    ) -> bool {
        if max_length.is_zero() {
            return false;
        }
        let Some(handle) = self.get_control(client_id) else {
            return false;
        };
        let expires_at = chrono::Duration::from_std(max_length)
            .ok()
            .and_then(|duration| Utc::now().checked_add_signed(duration));
        for mut binding in self.subdomains.iter_mut() {
            if &binding.client_id == client_id {
                binding.expires_at = expires_at;
            }
        }
        for mut binding in self.hostnames.iter_mut() {
            if &binding.client_id == client_id {
                binding.expires_at = expires_at;
            }
        }
        for mut entry in self.tcp.iter_mut() {
            if &entry.binding.client_id == client_id {
                entry.binding.expires_at = expires_at;
            }
        }
        tokio::spawn(async move {
            tokio::select! {
                _ = sleep(max_length) => {
                    debug!(client_id = %handle.client_id(), "Maximum connection length reached.");
                    handle.send(ServerMessage::Info { message: notice });
                    handle.close();
                }
                _ = handle.closed() => {}
            }
        });
        true
    }

    // Every binding owned by the client.
    pub(crate) fn bindings(&self, client_id: &ClientId) -> Vec<TunnelBinding> {
        self.subdomains
            .iter()
            .map(|entry| entry.value().clone())
            .chain(self.hostnames.iter().map(|entry| entry.value().clone()))
            .chain(self.tcp.iter().map(|entry| entry.binding.clone()))
            .filter(|binding| &binding.client_id == client_id)
            .collect()
    }

    // Number of ports in the TCP pool.
    pub(crate) fn port_capacity(&self) -> usize {
        self.ports.capacity()
    }

    pub(crate) fn control_count(&self) -> usize {
        self.controls.len()
    }

    pub(crate) fn is_port_bound(&self, port: u16) -> bool {
        self.tcp.contains_key(&port)
    }

    pub(crate) fn tcp_ports(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self.tcp.iter().map(|entry| *entry.key()).collect();
        ports.sort_unstable();
        ports
    }

    // Snapshot of all bindings, keyed by their display form.
    pub(crate) fn data(&self) -> BTreeMap<String, ClientId> {
        self.subdomains
            .iter()
            .map(|entry| (entry.key.to_string(), entry.client_id.clone()))
            .chain(
                self.hostnames
                    .iter()
                    .map(|entry| (entry.key.to_string(), entry.client_id.clone())),
            )
            .chain(self.tcp.iter().map(|entry| {
                (
                    entry.binding.key.to_string(),
                    entry.binding.client_id.clone(),
                )
            }))
            .collect()
    }

    pub(crate) fn update_reactor(&self, reactor: Option<R>) {
        if let Ok(mut guard) = self.reactor.write() {
            *guard = reactor;
        }
    }

    fn get_control(&self, client_id: &ClientId) -> Option<Arc<ControlHandle>> {
        self.controls
            .get(client_id)
            .map(|handle| Arc::clone(handle.value()))
    }

    fn ensure_client(&self, client_id: &ClientId) -> Result<(), ServerError> {
        if self.controls.contains_key(client_id) {
            Ok(())
        } else {
            Err(ServerError::UnknownClient)
        }
    }

    fn notify_reactor(&self) {
        let Ok(reactor) = self.reactor.read() else {
            return;
        };
        if let Some(reactor) = reactor.as_ref() {
            reactor.call(self.tcp_ports());
        }
    }
}

impl<R> ConnectionGetByHttpHost<Arc<ControlHandle>> for Arc<ConnectionRegistry<R>>
where
    R: ConnectionMapReactor<u16> + Send + Sync + 'static,
{
    fn get_by_http_host(&self, host: &str) -> Option<Arc<ControlHandle>> {
        match parse_host(host, &self.domain) {
            RequestedHost::Subdomain(subdomain) => self.lookup_by_subdomain(subdomain),
            RequestedHost::Hostname(hostname) => self.lookup_by_hostname(hostname),
        }
    }
}

impl<R> LiveBindings for ConnectionRegistry<R>
where
    R: ConnectionMapReactor<u16> + Send + Sync + 'static,
{
    fn is_subdomain_bound(&self, subdomain: &str) -> bool {
        self.subdomains
            .contains_key(&subdomain.to_ascii_lowercase())
    }

    // A bound pattern matching the hostname, or a bound hostname the requested pattern covers.
    fn is_hostname_bound(&self, hostname: &str) -> bool {
        self.hostnames
            .iter()
            .any(|entry| hostnames_overlap(entry.key(), hostname))
    }
}
