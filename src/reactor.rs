use std::sync::Arc;

use metrics::gauge;
#[cfg(test)]
use mockall::automock;

use crate::{
    tcp::{PortHandler, TcpHandler},
    telemetry::TELEMETRY_GAUGE_TCP_PORTS,
};

#[cfg_attr(test, automock)]
pub(crate) trait ConnectionMapReactor<K> {
    fn call(&self, identifiers: Vec<K>);
}

pub(crate) struct DummyConnectionMapReactor;

impl<K> ConnectionMapReactor<K> for DummyConnectionMapReactor {
    fn call(&self, _: Vec<K>) {}
}

// When the set of bound TCP ports changes, listeners of released ports must be stopped.
pub(crate) struct TcpReactor {
    pub(crate) handler: Arc<TcpHandler>,
}

impl ConnectionMapReactor<u16> for TcpReactor {
    fn call(&self, identifiers: Vec<u16>) {
        gauge!(TELEMETRY_GAUGE_TCP_PORTS).set(identifiers.len() as f64);
        self.handler.update_ports(identifiers);
    }
}
