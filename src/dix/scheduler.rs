//! Client Scheduler
//!
//! Cooperative suspension of a client's request loop. Sleeping is a record in
//! a table keyed by client; signalling puts the client on a work queue that the
//! dispatch loop drains at its yield point, running the wake check for each.
//! Nothing here blocks a thread.

use std::collections::{HashMap, VecDeque};
use std::fmt;

use tracing::{debug, info};

use crate::dix::Server;
use crate::dix::client::ClientState;
use crate::dix::resource::ClientId;

/// Opaque value handed back to the wake check.
pub type Closure = u64;

/// Resume predicate of a sleeping client. Two procs are the same proc when
/// their names match.
#[derive(Clone, Copy)]
pub struct WakeProc {
    pub name: &'static str,
    pub check: fn(&Server, ClientId, Closure) -> bool,
}

impl WakeProc {
    pub const fn new(name: &'static str, check: fn(&Server, ClientId, Closure) -> bool) -> Self {
        Self { name, check }
    }
}

impl PartialEq for WakeProc {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for WakeProc {}

impl fmt::Debug for WakeProc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("WakeProc").field(&self.name).finish()
    }
}

/// Filter that is either a wildcard or an exact value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Match<T> {
    Any,
    Exactly(T),
}

impl<T: PartialEq> Match<T> {
    pub fn matches(&self, value: &T) -> bool {
        match self {
            Self::Any => true,
            Self::Exactly(expected) => expected == value,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct SleepRecord {
    wake: WakeProc,
    closure: Closure,
    signaled: bool,
}

#[derive(Debug, Default)]
pub struct ClientScheduler {
    sleeping: HashMap<ClientId, SleepRecord>,
    work_queue: VecDeque<ClientId>,
}

impl ClientScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a suspension, replacing any earlier one for the client.
    pub(super) fn sleep(&mut self, client: ClientId, wake: WakeProc, closure: Closure) {
        self.work_queue.retain(|c| *c != client);
        self.sleeping.insert(
            client,
            SleepRecord {
                wake,
                closure,
                signaled: false,
            },
        );
    }

    /// Queue a sleeping client for a wake check. Returns false when the
    /// client is awake or already signalled.
    pub fn signal(&mut self, client: ClientId) -> bool {
        let Some(record) = self.sleeping.get_mut(&client) else {
            return false;
        };
        if record.signaled {
            return false;
        }
        record.signaled = true;
        self.work_queue.push_back(client);
        true
    }

    /// Signal every sleeping client matching all three filters. Returns how
    /// many registrations matched.
    pub fn signal_all(
        &mut self,
        client: Match<ClientId>,
        wake: Match<WakeProc>,
        closure: Match<Closure>,
    ) -> usize {
        let mut matched: Vec<ClientId> = self
            .sleeping
            .iter()
            .filter(|(id, record)| {
                client.matches(id) && wake.matches(&record.wake) && closure.matches(&record.closure)
            })
            .map(|(id, _)| *id)
            .collect();
        matched.sort();
        for id in &matched {
            self.signal(*id);
        }
        matched.len()
    }

    /// Suspended with no signalled work outstanding.
    pub fn is_asleep(&self, client: ClientId) -> bool {
        self.sleeping.get(&client).is_some_and(|r| !r.signaled)
    }

    pub fn is_tracking(&self, client: ClientId) -> bool {
        self.sleeping.contains_key(&client) || self.work_queue.contains(&client)
    }

    /// Clear a suspension. Returns whether there was one.
    pub(super) fn wake(&mut self, client: ClientId) -> bool {
        self.work_queue.retain(|c| *c != client);
        self.sleeping.remove(&client).is_some()
    }

    fn unsignal(&mut self, client: ClientId) {
        if let Some(record) = self.sleeping.get_mut(&client) {
            record.signaled = false;
        }
    }

    pub(super) fn forget(&mut self, client: ClientId) {
        self.wake(client);
    }

    fn take_work(&mut self) -> Vec<(ClientId, WakeProc, Closure)> {
        self.work_queue
            .drain(..)
            .filter_map(|client| {
                self.sleeping
                    .get(&client)
                    .map(|record| (client, record.wake, record.closure))
            })
            .collect()
    }
}

impl Server {
    /// Put a client to sleep until `wake` says otherwise. Fails only for a
    /// client that is closing down or unknown.
    pub fn client_sleep(&mut self, client: ClientId, wake: WakeProc, closure: Closure) -> bool {
        let Some(record) = self.directory.client_mut(client) else {
            return false;
        };
        if record.state() == ClientState::CloseDown {
            return false;
        }
        record.set_state(ClientState::Asleep);
        self.scheduler.sleep(client, wake, closure);
        info!(client = ?client, wake = wake.name, closure, "client sleeping");
        true
    }

    pub fn client_signal(&mut self, client: ClientId) -> bool {
        self.scheduler.signal(client)
    }

    pub fn client_signal_all(
        &mut self,
        client: Match<ClientId>,
        wake: Match<WakeProc>,
        closure: Match<Closure>,
    ) -> usize {
        self.scheduler.signal_all(client, wake, closure)
    }

    pub fn client_is_asleep(&self, client: ClientId) -> bool {
        self.scheduler.is_asleep(client)
    }

    /// Clear the suspension and let the dispatch loop resume the client.
    pub fn client_wakeup(&mut self, client: ClientId) -> bool {
        let woke = self.scheduler.wake(client);
        if let Some(record) = self.directory.client_mut(client) {
            if record.state() == ClientState::Asleep {
                record.set_state(ClientState::Running);
            }
        }
        if woke {
            info!(client = ?client, "client woken");
        }
        woke
    }

    /// Run the wake check of every signalled client; returns those woken.
    pub fn process_work_queue(&mut self) -> Vec<ClientId> {
        let mut woken = Vec::new();
        for (client, wake, closure) in self.scheduler.take_work() {
            if (wake.check)(self, client, closure) {
                self.client_wakeup(client);
                woken.push(client);
            } else {
                debug!(client = ?client, wake = wake.name, "wake check declined");
                self.scheduler.unsignal(client);
            }
        }
        woken
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dix::testing::{harness, Harness};

    fn always(_: &Server, _: ClientId, _: Closure) -> bool {
        true
    }

    fn never(_: &Server, _: ClientId, _: Closure) -> bool {
        false
    }

    const ALWAYS: WakeProc = WakeProc::new("always", always);
    const NEVER: WakeProc = WakeProc::new("never", never);

    #[test]
    fn signal_is_idempotent() {
        let Harness { mut server, a, .. } = harness();
        assert!(!server.client_signal(a), "awake clients ignore signals");

        assert!(server.client_sleep(a, ALWAYS, 7));
        assert!(server.client_is_asleep(a));
        assert!(server.client_signal(a));
        assert!(!server.client_signal(a));
        assert!(!server.client_is_asleep(a));

        assert_eq!(server.process_work_queue(), vec![a]);
        assert_eq!(server.process_work_queue(), Vec::<ClientId>::new());
        assert!(server.directory().client(a).unwrap().is_dispatchable());
    }

    #[test]
    fn declined_wake_check_goes_back_to_sleep() {
        let Harness { mut server, a, .. } = harness();
        server.client_sleep(a, NEVER, 0);
        server.client_signal(a);
        assert!(server.process_work_queue().is_empty());
        assert!(server.client_is_asleep(a));
        assert_eq!(
            server.directory().client(a).map(|c| c.state()),
            Some(ClientState::Asleep)
        );
    }

    #[test]
    fn signal_all_honours_every_filter() {
        let Harness { mut server, a, b, .. } = harness();
        server.client_sleep(a, ALWAYS, 1);
        server.client_sleep(b, NEVER, 1);

        assert_eq!(
            server.client_signal_all(Match::Any, Match::Exactly(ALWAYS), Match::Any),
            1
        );
        assert!(!server.client_is_asleep(a));
        assert!(server.client_is_asleep(b));
        assert_eq!(
            server.client_signal_all(Match::Any, Match::Any, Match::Exactly(2)),
            0
        );
        assert_eq!(
            server.client_signal_all(Match::Exactly(b), Match::Any, Match::Exactly(1)),
            1
        );
    }

    #[test]
    fn closing_clients_cannot_sleep() {
        let Harness { mut server, a, .. } = harness();
        server.destroy_client(a).unwrap();
        assert!(!server.client_sleep(a, ALWAYS, 0));
    }

    #[test]
    fn destroy_wakes_a_sleeping_client() {
        let Harness { mut server, a, .. } = harness();
        server.client_sleep(a, NEVER, 0);
        server.client_signal(a);
        server.destroy_client(a).unwrap();
        assert!(!server.scheduler().is_tracking(a));
        assert!(server.process_work_queue().is_empty());
    }
}
