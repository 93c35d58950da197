//! Transport and Access Collaborators
//!
//! The core hands sequence-stamped runs to a [`TransportSink`] and asks an
//! [`AccessGate`] before every hand-off. Neither is implemented here beyond
//! the permissive gate, a deny list, and a recording sink.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use thiserror::Error;
use tracing::trace;

use crate::dix::event::{LogicalEvent, WireEvent};
use crate::dix::resource::{ClientId, WindowId};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("connection to client {0:?} is gone")]
    Gone(ClientId),
}

/// Output side of client connections. A run is written contiguously or not
/// at all.
pub trait TransportSink: Send {
    fn send(&mut self, client: ClientId, run: &[WireEvent]) -> Result<(), TransportError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Allow,
    Deny,
}

/// Security hook consulted once per candidate recipient.
pub trait AccessGate: Send {
    fn check_delivery(&self, client: ClientId, window: WindowId, event: &LogicalEvent) -> Access;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl AccessGate for AllowAll {
    fn check_delivery(&self, _: ClientId, _: WindowId, _: &LogicalEvent) -> Access {
        Access::Allow
    }
}

/// Denies every delivery to the listed clients.
#[derive(Debug, Default, Clone)]
pub struct DenyList {
    denied: HashSet<ClientId>,
}

impl DenyList {
    pub fn new(clients: impl IntoIterator<Item = ClientId>) -> Self {
        Self {
            denied: clients.into_iter().collect(),
        }
    }
}

impl AccessGate for DenyList {
    fn check_delivery(&self, client: ClientId, _: WindowId, _: &LogicalEvent) -> Access {
        if self.denied.contains(&client) {
            Access::Deny
        } else {
            Access::Allow
        }
    }
}

#[derive(Debug, Default)]
struct Recorded {
    sent: HashMap<ClientId, Vec<WireEvent>>,
    failing: HashSet<ClientId>,
}

/// Sink that keeps every transmitted item per client. Clones share the same
/// record, so a handle kept outside the server can inspect it.
#[derive(Debug, Default, Clone)]
pub struct RecordingSink {
    inner: Arc<Mutex<Recorded>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Recorded> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Make every later send to `client` fail.
    pub fn fail_client(&self, client: ClientId) {
        self.lock().failing.insert(client);
    }

    pub fn sent(&self, client: ClientId) -> Vec<WireEvent> {
        self.lock().sent.get(&client).cloned().unwrap_or_default()
    }

    /// Logical events received by `client`, errors left out.
    pub fn events(&self, client: ClientId) -> Vec<LogicalEvent> {
        self.sent(client)
            .iter()
            .filter_map(|w| w.event().cloned())
            .collect()
    }

    pub fn count(&self, client: ClientId) -> usize {
        self.lock().sent.get(&client).map_or(0, Vec::len)
    }

    /// Items sent per client, ordered by client id.
    pub fn summary(&self) -> Vec<(ClientId, usize)> {
        let mut summary: Vec<_> = self
            .lock()
            .sent
            .iter()
            .map(|(client, items)| (*client, items.len()))
            .collect();
        summary.sort();
        summary
    }

    pub fn clear(&self) {
        self.lock().sent.clear();
    }
}

impl TransportSink for RecordingSink {
    fn send(&mut self, client: ClientId, run: &[WireEvent]) -> Result<(), TransportError> {
        let mut recorded = self.lock();
        if recorded.failing.contains(&client) {
            return Err(TransportError::Gone(client));
        }
        for item in run {
            trace!(client = ?client, sequence = item.sequence, kind = item.response_type(), "transmit");
        }
        recorded.sent.entry(client).or_default().extend_from_slice(run);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dix::client::ByteOrder;
    use crate::dix::event::{EventKind, WireBody};
    use crate::dix::resource::Xid;

    fn wire(client: ClientId, sequence: u16) -> WireEvent {
        WireEvent {
            client,
            sequence,
            byte_order: ByteOrder::native(),
            body: WireBody::Event(LogicalEvent::new(Xid(1), EventKind::Motion)),
        }
    }

    #[test]
    fn failing_client_records_nothing() {
        let mut sink = RecordingSink::new();
        let handle = sink.clone();
        handle.fail_client(ClientId(2));
        assert!(sink.send(ClientId(1), &[wire(ClientId(1), 1), wire(ClientId(1), 2)]).is_ok());
        assert_eq!(
            sink.send(ClientId(2), &[wire(ClientId(2), 1)]),
            Err(TransportError::Gone(ClientId(2)))
        );
        assert_eq!(handle.summary(), vec![(ClientId(1), 2)]);
    }

    #[test]
    fn deny_list_only_blocks_listed_clients() {
        let gate = DenyList::new([ClientId(3)]);
        let event = LogicalEvent::new(Xid(1), EventKind::Motion);
        assert_eq!(gate.check_delivery(ClientId(3), Xid(1), &event), Access::Deny);
        assert_eq!(gate.check_delivery(ClientId(4), Xid(1), &event), Access::Allow);
    }
}
