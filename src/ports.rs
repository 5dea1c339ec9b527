use std::{
    collections::BTreeSet,
    ops::RangeInclusive,
    sync::{Arc, Mutex},
};

use crate::error::ServerError;

// Pool of TCP ports that can be leased to tunnels.
// A port stays leased until its PortLease is dropped.
#[derive(Debug)]
pub(crate) struct PortAllocator {
    range: RangeInclusive<u16>,
    state: Mutex<AllocatorState>,
}

#[derive(Debug)]
struct AllocatorState {
    leased: BTreeSet<u16>,
    // Where the next search starts, so that recently released ports are picked last.
    cursor: u16,
}

impl PortAllocator {
    pub(crate) fn new(range: RangeInclusive<u16>) -> color_eyre::Result<Self> {
        if range.is_empty() {
            return Err(ServerError::InvalidConfig(format!(
                "TCP port range {}-{} is empty",
                range.start(),
                range.end()
            ))
            .into());
        }
        let cursor = *range.start();
        Ok(PortAllocator {
            range,
            state: Mutex::new(AllocatorState {
                leased: BTreeSet::new(),
                cursor,
            }),
        })
    }

    // Lease the next free port, or fail immediately if every port is in use.
    pub(crate) fn lease(self: &Arc<Self>) -> Result<PortLease, ServerError> {
        let mut state = self.state.lock().expect("not poisoned");
        let (start, end) = (*self.range.start(), *self.range.end());
        let cursor = state.cursor;
        let port = (cursor..=end)
            .chain(start..cursor)
            .find(|port| !state.leased.contains(port))
            .ok_or(ServerError::NoFreePortAvailable)?;
        state.leased.insert(port);
        state.cursor = if port == end { start } else { port + 1 };
        Ok(PortLease {
            port,
            allocator: Arc::clone(self),
        })
    }

    #[cfg(test)]
    pub(crate) fn is_leased(&self, port: u16) -> bool {
        self.state.lock().expect("not poisoned").leased.contains(&port)
    }

    pub(crate) fn capacity(&self) -> usize {
        self.range.len()
    }

    fn release(&self, port: u16) {
        self.state.lock().expect("not poisoned").leased.remove(&port);
    }
}

// Token indicating that a port is in use. Dropping it returns the port to the pool.
#[derive(Debug)]
pub(crate) struct PortLease {
    port: u16,
    allocator: Arc<PortAllocator>,
}

impl PortLease {
    pub(crate) fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        self.allocator.release(self.port);
    }
}
