//! Resource & Client Directory
//!
//! Single source of truth for "who owns resource id X". Grabs and event
//! selections are indexed by window/device for delivery, but they are owned
//! through this directory, and every teardown path runs through its release
//! hooks so the by-window and by-client views never drift apart.

use std::collections::{HashMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::dix::Server;
use crate::dix::client::{ByteOrder, Client, ClientState, SaveSetEntry, SaveSetMode};
use crate::dix::device::DeviceId;
use crate::dix::error::DixError;

/// Bits shared by the client index and the per-client resource space.
pub const RESOURCE_AND_CLIENT_COUNT: u32 = 29;

/// Set on ids the server allocates on a client's behalf.
pub const SERVER_BIT: u32 = 0x4000_0000;

/// Most connectable clients; with the server slot this fills 11 client bits.
pub const MAX_CLIENTS: usize = 2047;

/// Client slot index. Slot 0 is the server itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClientId(pub u16);

impl ClientId {
    pub const SERVER: ClientId = ClientId(0);
}

/// Protocol resource identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Xid(pub u32);

impl fmt::Display for Xid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08x}", self.0)
    }
}

/// Windows are named by their resource id.
pub type WindowId = Xid;

/// Partition of the 29-bit id space between client index and resource index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdSpace {
    client_bits: u32,
}

impl IdSpace {
    /// Sized so that `slots` client indices fit.
    pub fn for_slots(slots: usize) -> Self {
        let slots = slots.max(2).next_power_of_two();
        Self {
            client_bits: slots.trailing_zeros(),
        }
    }

    pub fn client_bits(&self) -> u32 {
        self.client_bits
    }

    fn offset(&self) -> u32 {
        RESOURCE_AND_CLIENT_COUNT - self.client_bits
    }

    /// Mask of the per-client resource index.
    pub fn resource_mask(&self) -> u32 {
        (1 << self.offset()) - 1
    }

    fn client_mask(&self) -> u32 {
        ((1 << self.client_bits) - 1) << self.offset()
    }

    /// Client slot encoded in an id, regardless of whether it is bound.
    pub fn client_of(&self, id: Xid) -> usize {
        ((id.0 & self.client_mask()) >> self.offset()) as usize
    }

    pub fn base(&self, client: ClientId) -> Xid {
        Xid(u32::from(client.0) << self.offset())
    }

    /// Top three bits clear: an id a client may choose itself.
    pub fn is_client_chosen(id: Xid) -> bool {
        id.0 >> RESOURCE_AND_CLIENT_COUNT == 0
    }

    /// Client-chosen, or server-allocated with only the server bit above the range.
    pub fn is_structurally_valid(id: Xid) -> bool {
        (id.0 & !SERVER_BIT) >> RESOURCE_AND_CLIENT_COUNT == 0
    }
}

/// What a bound id refers to; selects the release hook run on teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Window,
    /// A non-owner's event selection on `window`
    EventSelection { window: WindowId },
    /// A passive grab registered on `window`
    PassiveGrab { window: WindowId, device: DeviceId },
    Cursor,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceEntry {
    pub owner: ClientId,
    pub kind: ResourceKind,
}

/// What a client close-down did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Teardown {
    /// Resources the client owned when close-down started
    pub released: usize,
    /// Save-set windows reparented away from the client's windows
    pub rescued: Vec<WindowId>,
    /// Windows removed from the hierarchy, children first
    pub destroyed_windows: Vec<WindowId>,
}

pub struct ResourceDirectory {
    space: IdSpace,
    max_clients: usize,
    clients: Vec<Option<Client>>,
    resources: HashMap<Xid, ResourceEntry>,
}

impl ResourceDirectory {
    /// `max_clients` connectable clients plus the server slot. Fails with
    /// `BadValue` outside `1..=MAX_CLIENTS`.
    pub fn new(max_clients: usize) -> Result<Self, DixError> {
        if !(1..=MAX_CLIENTS).contains(&max_clients) {
            return Err(DixError::BadValue(u32::try_from(max_clients).unwrap_or(u32::MAX)));
        }
        let space = IdSpace::for_slots(max_clients + 1);
        let mut clients = Vec::with_capacity(max_clients + 1);
        clients.push(Some(Client::new(
            ClientId::SERVER,
            space.base(ClientId::SERVER),
            ByteOrder::native(),
        )));
        clients.resize_with(max_clients + 1, || None);
        Ok(Self {
            space,
            max_clients,
            clients,
            resources: HashMap::new(),
        })
    }

    pub fn id_space(&self) -> IdSpace {
        self.space
    }

    pub fn max_clients(&self) -> usize {
        self.max_clients
    }

    /// Allocate the lowest free client slot.
    pub fn register_client(&mut self, byte_order: ByteOrder) -> Result<ClientId, DixError> {
        let slot = self
            .clients
            .iter()
            .skip(1)
            .position(Option::is_none)
            .map(|i| i + 1)
            .ok_or(DixError::LimitReached)?;
        let id = ClientId(u16::try_from(slot).map_err(|_| DixError::LimitReached)?);
        self.clients[slot] = Some(Client::new(id, self.space.base(id), byte_order));
        Ok(id)
    }

    pub fn client(&self, id: ClientId) -> Option<&Client> {
        self.clients.get(usize::from(id.0)).and_then(Option::as_ref)
    }

    pub(super) fn client_mut(&mut self, id: ClientId) -> Option<&mut Client> {
        self.clients.get_mut(usize::from(id.0)).and_then(Option::as_mut)
    }

    /// Connected clients, excluding the server.
    pub fn clients(&self) -> impl Iterator<Item = &Client> {
        self.clients.iter().skip(1).flatten()
    }

    pub fn client_count(&self) -> usize {
        self.clients().count()
    }

    /// Whether `id` lies in `client`'s range and is not yet bound.
    pub fn is_legal_new_id(&self, client: ClientId, id: Xid) -> bool {
        IdSpace::is_client_chosen(id)
            && self.space.client_of(id) == usize::from(client.0)
            && !self.resources.contains_key(&id)
    }

    pub fn bind_resource(
        &mut self,
        id: Xid,
        kind: ResourceKind,
        owner: ClientId,
    ) -> Result<(), DixError> {
        if !IdSpace::is_client_chosen(id) {
            return Err(DixError::IllegalId(id));
        }
        self.bind(id, kind, owner)
    }

    fn bind(&mut self, id: Xid, kind: ResourceKind, owner: ClientId) -> Result<(), DixError> {
        if self.space.client_of(id) != usize::from(owner.0) {
            return Err(DixError::IllegalId(id));
        }
        if self.resources.contains_key(&id) {
            return Err(DixError::IdInUse(id));
        }
        let client = self
            .client_mut(owner)
            .filter(|c| c.state() != ClientState::CloseDown)
            .ok_or(DixError::UnknownClient(owner))?;
        client.owned.insert(id);
        self.resources.insert(id, ResourceEntry { owner, kind });
        Ok(())
    }

    /// Allocate and bind a server-side id inside `owner`'s range.
    pub(super) fn bind_fake(&mut self, kind: ResourceKind, owner: ClientId) -> Result<Xid, DixError> {
        let mask = self.space.resource_mask();
        let base = self.space.base(owner).0;
        for _ in 0..=mask {
            let counter = self
                .client_mut(owner)
                .ok_or(DixError::UnknownClient(owner))?
                .take_fake_counter();
            let id = Xid(SERVER_BIT | base | (counter & mask));
            if !self.resources.contains_key(&id) {
                self.bind(id, kind, owner)?;
                return Ok(id);
            }
        }
        Err(DixError::IdInUse(Xid(SERVER_BIT | base)))
    }

    /// Who would own `id`: the client occupying the slot the id encodes,
    /// whether or not the id is currently bound.
    pub fn lookup_owner(&self, id: Xid) -> Option<ClientId> {
        if !IdSpace::is_structurally_valid(id) {
            return None;
        }
        let slot = self.space.client_of(id);
        self.clients
            .get(slot)
            .and_then(Option::as_ref)
            .map(Client::id)
    }

    pub fn lookup_resource(&self, id: Xid) -> Option<ResourceEntry> {
        self.resources.get(&id).copied()
    }

    /// Owner of a bound window resource.
    pub fn client_for_window(&self, window: WindowId) -> Option<ClientId> {
        self.lookup_resource(window)
            .filter(|e| e.kind == ResourceKind::Window)
            .map(|e| e.owner)
    }

    pub fn owned_by(&self, client: ClientId) -> Vec<Xid> {
        self.client(client)
            .map(|c| c.owned().collect())
            .unwrap_or_default()
    }

    pub(super) fn unbind(&mut self, id: Xid) -> Option<ResourceEntry> {
        let entry = self.resources.remove(&id)?;
        if let Some(client) = self.client_mut(entry.owner) {
            client.owned.remove(&id);
        }
        Some(entry)
    }

    pub(super) fn free_slot(&mut self, id: ClientId) -> Option<Client> {
        if id == ClientId::SERVER {
            return None;
        }
        self.clients.get_mut(usize::from(id.0)).and_then(Option::take)
    }

    pub fn alter_save_set(
        &mut self,
        client: ClientId,
        window: WindowId,
        mode: SaveSetMode,
        to_root: bool,
        map: bool,
    ) -> Result<(), DixError> {
        let entry = self
            .lookup_resource(window)
            .filter(|e| e.kind == ResourceKind::Window)
            .ok_or(DixError::BadWindow(window))?;
        // a client cannot save its own windows from itself
        if entry.owner == client {
            return Err(DixError::BadMatch);
        }
        let record = self
            .client_mut(client)
            .ok_or(DixError::UnknownClient(client))?;
        match mode {
            SaveSetMode::Insert => record.insert_save_set(SaveSetEntry { window, to_root, map }),
            SaveSetMode::Delete => {
                record.remove_save_set(window);
            }
        }
        Ok(())
    }

    pub(super) fn delete_window_from_any_save_set(&mut self, window: WindowId) {
        for client in self.clients.iter_mut().flatten() {
            client.remove_save_set(window);
        }
    }
}

impl Server {
    pub fn register_client(&mut self, byte_order: ByteOrder) -> Result<ClientId, DixError> {
        let id = self.directory.register_client(byte_order).inspect_err(|_| {
            warn!(
                max_clients = self.directory.max_clients(),
                "refusing connection: client limit reached"
            );
        })?;
        info!(client = ?id, ?byte_order, "client registered");
        Ok(id)
    }

    pub fn bind_resource(
        &mut self,
        id: Xid,
        kind: ResourceKind,
        owner: ClientId,
    ) -> Result<(), DixError> {
        self.directory.bind_resource(id, kind, owner)
    }

    pub fn lookup_owner(&self, id: Xid) -> Option<ClientId> {
        self.directory.lookup_owner(id)
    }

    /// Release one resource, running its kind's release hook.
    pub fn free_resource(&mut self, id: Xid) -> bool {
        let Some(entry) = self.directory.unbind(id) else {
            return false;
        };
        self.release_resource(id, entry);
        true
    }

    fn release_resource(&mut self, id: Xid, entry: ResourceEntry) {
        debug!(resource = %id, owner = ?entry.owner, kind = ?entry.kind, "releasing resource");
        match entry.kind {
            ResourceKind::Window => self.window_gone(id),
            ResourceKind::EventSelection { window } => {
                self.registry.remove_selection_resource(window, id);
            }
            ResourceKind::PassiveGrab { window, .. } => {
                self.registry.remove_passive_grab(window, id);
            }
            ResourceKind::Cursor | ResourceKind::Other => {}
        }
    }

    pub fn alter_save_set(
        &mut self,
        client: ClientId,
        window: WindowId,
        mode: SaveSetMode,
        to_root: bool,
        map: bool,
    ) -> Result<(), DixError> {
        self.directory
            .alter_save_set(client, window, mode, to_root, map)
    }

    /// Flag a client for close-down at the next yield point.
    pub fn mark_client_exception(&mut self, client: ClientId) {
        let Some(record) = self.directory.client_mut(client) else {
            return;
        };
        if record.has_exception() || record.state() == ClientState::CloseDown {
            return;
        }
        record.mark_exception();
        warn!(client = ?client, "client marked for close-down");
        self.pending_close.push(client);
    }

    /// Tear down every client flagged by [`Server::mark_client_exception`].
    pub fn close_down_pending(&mut self) -> Vec<ClientId> {
        let pending = std::mem::take(&mut self.pending_close);
        let mut closed = Vec::with_capacity(pending.len());
        for client in pending {
            if self.destroy_client(client).is_ok() {
                closed.push(client);
            }
        }
        closed
    }

    /// Close a client down: wake it, rescue its save-set, release every grab
    /// and resource it owns, then free its slot.
    pub fn destroy_client(&mut self, client: ClientId) -> Result<Teardown, DixError> {
        if client == ClientId::SERVER {
            return Err(DixError::BadValue(0));
        }
        let record = self
            .directory
            .client(client)
            .filter(|c| c.state() != ClientState::CloseDown)
            .ok_or(DixError::UnknownClient(client))?;
        let owned = record.owned.len();
        info!(client = ?client, resources = owned, "closing down client");

        if self.scheduler.wake(client) {
            debug!(client = ?client, "woke sleeping client for close-down");
        }
        if let Some(record) = self.directory.client_mut(client) {
            record.set_state(ClientState::CloseDown);
        }

        let mut report = Teardown {
            released: owned,
            rescued: self.handle_save_set(client),
            destroyed_windows: Vec::new(),
        };
        self.release_active_grabs(client);

        for id in self.directory.owned_by(client) {
            // an earlier window teardown may already have taken this one
            let Some(entry) = self.directory.lookup_resource(id) else {
                continue;
            };
            if entry.kind == ResourceKind::Window && self.tree.contains(id) {
                report.destroyed_windows.extend(self.destroy_window_tree(id));
            } else {
                self.free_resource(id);
            }
        }

        self.registry.forget_client(client);
        self.devices.forget_client(client);
        self.scheduler.forget(client);
        self.pending_close.retain(|c| *c != client);
        self.directory.free_slot(client);
        debug_assert!(!self.references_client(client));

        self.replay_thawed();
        Ok(report)
    }

    /// Reparent save-set windows out of the dying client's windows. Runs once
    /// per window even if the client saved it more than once.
    fn handle_save_set(&mut self, client: ClientId) -> Vec<WindowId> {
        let entries = self
            .directory
            .client(client)
            .map(|c| c.save_set().to_vec())
            .unwrap_or_default();
        let root = self.tree.root();
        let mut seen = HashSet::new();
        let mut rescued = Vec::new();
        for entry in entries {
            if !seen.insert(entry.window) || !self.tree.contains(entry.window) {
                continue;
            }
            let Some(current) = self.tree.parent(entry.window) else {
                continue;
            };
            let target = if entry.to_root {
                Some(root)
            } else {
                let mut candidate = Some(current);
                while let Some(w) = candidate {
                    if self.directory.lookup_owner(w) != Some(client) {
                        break;
                    }
                    candidate = self.tree.parent(w);
                }
                candidate
            };
            let Some(target) = target.filter(|t| *t != current) else {
                continue;
            };
            debug!(window = %entry.window, parent = %target, "rescuing save-set window");
            self.tree.reparent(entry.window, target);
            if entry.map {
                self.tree.map(entry.window);
            }
            rescued.push(entry.window);
        }
        rescued
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_space_partitions_client_bits() {
        let space = IdSpace::for_slots(256);
        assert_eq!(space.client_bits(), 8);
        assert_eq!(space.base(ClientId(1)), Xid(0x0020_0000));
        assert_eq!(space.client_of(Xid(0x0020_0005)), 1);
        assert_eq!(space.client_of(Xid(SERVER_BIT | 0x0040_0001)), 2);
        assert_eq!(space.resource_mask(), 0x001f_ffff);
    }

    #[test]
    fn register_client_hits_the_ceiling() {
        let mut dir = ResourceDirectory::new(2).unwrap();
        assert_eq!(dir.register_client(ByteOrder::native()), Ok(ClientId(1)));
        assert_eq!(dir.register_client(ByteOrder::native()), Ok(ClientId(2)));
        assert_eq!(
            dir.register_client(ByteOrder::native()),
            Err(DixError::LimitReached)
        );
        dir.free_slot(ClientId(1));
        assert_eq!(dir.register_client(ByteOrder::native()), Ok(ClientId(1)));
    }

    #[test]
    fn client_ceiling_must_fit_the_id_space() {
        assert_eq!(ResourceDirectory::new(0).err(), Some(DixError::BadValue(0)));
        assert_eq!(
            ResourceDirectory::new(70_000).err(),
            Some(DixError::BadValue(70_000))
        );
        let dir = ResourceDirectory::new(MAX_CLIENTS).unwrap();
        assert_eq!(dir.id_space().client_bits(), 11);
        assert_eq!(dir.id_space().base(ClientId(1)), Xid(0x0004_0000));
    }

    #[test]
    fn bind_rejects_foreign_and_duplicate_ids() {
        let mut dir = ResourceDirectory::new(4).unwrap();
        let a = dir.register_client(ByteOrder::native()).unwrap();
        let b = dir.register_client(ByteOrder::native()).unwrap();
        let base_a = dir.id_space().base(a);
        let base_b = dir.id_space().base(b);

        assert!(dir.bind_resource(base_a, ResourceKind::Window, a).is_ok());
        assert_eq!(
            dir.bind_resource(base_a, ResourceKind::Window, a),
            Err(DixError::IdInUse(base_a))
        );
        assert_eq!(
            dir.bind_resource(base_b, ResourceKind::Window, a),
            Err(DixError::IllegalId(base_b))
        );
        let high = Xid(SERVER_BIT | base_a.0 | 1);
        assert_eq!(
            dir.bind_resource(high, ResourceKind::Other, a),
            Err(DixError::IllegalId(high))
        );
        assert!(dir.is_legal_new_id(a, Xid(base_a.0 + 1)));
        assert!(!dir.is_legal_new_id(a, base_a));
    }

    #[test]
    fn lookup_owner_uses_the_id_range() {
        let mut dir = ResourceDirectory::new(4).unwrap();
        let a = dir.register_client(ByteOrder::native()).unwrap();
        let unbound = Xid(dir.id_space().base(a).0 + 77);
        assert_eq!(dir.lookup_owner(unbound), Some(a));
        assert_eq!(dir.lookup_resource(unbound), None);
        let empty_slot = dir.id_space().base(ClientId(3));
        assert_eq!(dir.lookup_owner(empty_slot), None);
        assert_eq!(dir.lookup_owner(Xid(0x8000_0000)), None);
    }

    #[test]
    fn fake_ids_stay_in_range_and_are_owned() {
        let mut dir = ResourceDirectory::new(4).unwrap();
        let a = dir.register_client(ByteOrder::native()).unwrap();
        let first = dir.bind_fake(ResourceKind::Other, a).unwrap();
        let second = dir.bind_fake(ResourceKind::Other, a).unwrap();
        assert_ne!(first, second);
        assert_eq!(first.0 & SERVER_BIT, SERVER_BIT);
        assert_eq!(dir.lookup_owner(first), Some(a));
        assert_eq!(dir.owned_by(a), vec![first, second]);
        assert!(dir.unbind(first).is_some());
        assert_eq!(dir.owned_by(a), vec![second]);
    }

    #[test]
    fn save_set_requires_a_foreign_window() {
        let mut dir = ResourceDirectory::new(4).unwrap();
        let a = dir.register_client(ByteOrder::native()).unwrap();
        let b = dir.register_client(ByteOrder::native()).unwrap();
        let win = dir.id_space().base(b);
        dir.bind_resource(win, ResourceKind::Window, b).unwrap();

        assert_eq!(
            dir.alter_save_set(b, win, SaveSetMode::Insert, false, true),
            Err(DixError::BadMatch)
        );
        let missing = Xid(win.0 + 1);
        assert_eq!(
            dir.alter_save_set(a, missing, SaveSetMode::Insert, false, true),
            Err(DixError::BadWindow(missing))
        );
        dir.alter_save_set(a, win, SaveSetMode::Insert, false, true).unwrap();
        assert_eq!(dir.client(a).unwrap().save_set().len(), 1);
        dir.delete_window_from_any_save_set(win);
        assert!(dir.client(a).unwrap().save_set().is_empty());
    }
}
