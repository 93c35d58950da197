//! Device-Input Core
//!
//! The part of a display server between decoded requests and connection
//! output: who owns which resource id, which clients are suspended, who holds
//! a device grab, and where each input event goes. [`Server`] owns all of it
//! and is driven from a single dispatch task.

pub mod client;
pub mod delivery;
pub mod device;
pub mod error;
pub mod event;
pub mod flags;
pub mod grab;
pub mod registry;
pub mod resource;
pub mod scheduler;
pub mod sink;
pub mod window;

use tracing::{debug, info};

pub use client::{ByteOrder, Client, ClientState, SaveSetMode};
pub use delivery::DeliveryOutcome;
pub use device::{ContactOwner, Device, DeviceId, DeviceManager, DeviceRole, Focus, InputClass};
pub use error::DixError;
pub use event::{EventKind, EventRun, LogicalEvent, Rect, StructureKind, Timestamp, WireEvent};
pub use flags::{EventMask, ModifierMask};
pub use grab::{AllowMode, Grab, GrabError, GrabMode, GrabParams, GrabRefusal};
pub use registry::{EventRegistry, SelectionLevel};
pub use resource::{ClientId, ResourceDirectory, ResourceKind, WindowId, Xid};
pub use scheduler::{ClientScheduler, Match, WakeProc};
pub use sink::{AccessGate, AllowAll, RecordingSink, TransportSink};
pub use window::{WindowHierarchy, WindowTree};

/// Tunables of the core, filled from the `limits` and `input` config sections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoreOptions {
    /// Connectable clients, not counting the server itself
    pub max_clients: usize,
    /// Runs a frozen device may hold before new ones are dropped
    pub max_queued_events: usize,
    /// Grab the pointer for the recipient of an ungrabbed button press
    pub implicit_grabs: bool,
    /// New keyboards start with focus following the pointer
    pub focus_pointer_root: bool,
}

impl Default for CoreOptions {
    fn default() -> Self {
        Self {
            max_clients: 255,
            max_queued_events: 1024,
            implicit_grabs: true,
            focus_pointer_root: true,
        }
    }
}

pub struct Server {
    pub(crate) options: CoreOptions,
    pub(crate) directory: ResourceDirectory,
    pub(crate) scheduler: ClientScheduler,
    pub(crate) devices: DeviceManager,
    pub(crate) registry: EventRegistry,
    pub(crate) tree: Box<dyn WindowHierarchy>,
    pub(crate) sink: Box<dyn TransportSink>,
    pub(crate) gate: Box<dyn AccessGate>,
    pub(crate) now: Timestamp,
    /// Clients whose transport failed, closed at the next yield point
    pub(crate) pending_close: Vec<ClientId>,
    /// Devices whose queued runs may be processed again
    pub(crate) thawed: Vec<DeviceId>,
    pub(crate) replaying: bool,
    /// Registrations found pointing at a client slot that no longer exists
    pub(crate) inconsistencies: u64,
}

impl Server {
    /// Build a core around a hierarchy and a transport. The hierarchy's root
    /// is bound as a server-owned window.
    pub fn new(
        options: CoreOptions,
        tree: Box<dyn WindowHierarchy>,
        sink: Box<dyn TransportSink>,
    ) -> Result<Self, DixError> {
        let mut directory = ResourceDirectory::new(options.max_clients)?;
        directory.bind_resource(tree.root(), ResourceKind::Window, ClientId::SERVER)?;
        info!(
            max_clients = options.max_clients,
            root = %tree.root(),
            "input core initialized"
        );
        Ok(Self {
            options,
            directory,
            scheduler: ClientScheduler::new(),
            devices: DeviceManager::new(),
            registry: EventRegistry::new(),
            tree,
            sink,
            gate: Box::new(AllowAll),
            now: Timestamp(1),
            pending_close: Vec::new(),
            thawed: Vec::new(),
            replaying: false,
            inconsistencies: 0,
        })
    }

    pub fn with_access_gate(mut self, gate: Box<dyn AccessGate>) -> Self {
        self.gate = gate;
        self
    }

    pub fn options(&self) -> &CoreOptions {
        &self.options
    }

    pub fn now(&self) -> Timestamp {
        self.now
    }

    /// Move server time forward. Time never goes backwards.
    pub fn advance_time(&mut self, time: Timestamp) {
        self.now = self.now.max(time);
    }

    pub fn inconsistencies(&self) -> u64 {
        self.inconsistencies
    }

    pub fn root(&self) -> WindowId {
        self.tree.root()
    }

    pub fn directory(&self) -> &ResourceDirectory {
        &self.directory
    }

    pub fn registry(&self) -> &EventRegistry {
        &self.registry
    }

    pub fn devices(&self) -> &DeviceManager {
        &self.devices
    }

    pub fn scheduler(&self) -> &ClientScheduler {
        &self.scheduler
    }

    pub fn tree(&self) -> &dyn WindowHierarchy {
        self.tree.as_ref()
    }

    /// Register an input device and announce it on the root window.
    pub fn add_device(&mut self, name: &str, class: InputClass, role: DeviceRole) -> DeviceId {
        let focus = if class == InputClass::Keyboard && self.options.focus_pointer_root {
            Focus::PointerRoot
        } else {
            Focus::None
        };
        let id = self.devices.add(name, class, role, focus);
        info!(device = ?id, name, ?class, ?role, "device added");
        self.announce_device(id, true);
        id
    }

    /// Pair a pointer with a keyboard so a grab on one can freeze the other.
    pub fn pair_devices(&mut self, pointer: DeviceId, keyboard: DeviceId) -> Result<(), DixError> {
        let classes = (
            self.devices.get(pointer).map(Device::class),
            self.devices.get(keyboard).map(Device::class),
        );
        match classes {
            (None, _) => Err(DixError::BadDevice(pointer)),
            (_, None) => Err(DixError::BadDevice(keyboard)),
            (Some(InputClass::Pointer), Some(InputClass::Keyboard)) => {
                self.devices.pair(pointer, keyboard);
                Ok(())
            }
            _ => Err(DixError::BadMatch),
        }
    }

    /// Remove a device with its grabs, passive grabs and queued runs.
    pub fn remove_device(&mut self, device: DeviceId) -> Result<(), DixError> {
        if self.devices.get(device).is_none() {
            return Err(DixError::BadDevice(device));
        }
        self.deactivate_grab(device);
        for (_, resource) in self.registry.passive_grabs_for_device(device) {
            self.free_resource(resource);
        }
        if let Some(removed) = self.devices.remove(device) {
            debug!(device = ?device, dropped = removed.queued_runs(), "device removed");
        }
        self.thawed.retain(|d| *d != device);
        self.announce_device(device, false);
        self.replay_thawed();
        Ok(())
    }

    fn announce_device(&mut self, device: DeviceId, added: bool) {
        let root = self.tree.root();
        let event = LogicalEvent::new(
            root,
            EventKind::DevicePresence {
                device: device.0,
                added,
            },
        )
        .at(self.now);
        self.deliver_events_to_window(
            None,
            root,
            &EventRun::single(event),
            EventMask::DEVICE_PRESENCE,
            None,
        );
    }

    /// Whether any table of the core still mentions `client`.
    pub fn references_client(&self, client: ClientId) -> bool {
        self.directory.client(client).is_some()
            || !self.directory.owned_by(client).is_empty()
            || self.registry.references_client(client)
            || self.devices.references_client(client)
            || self.scheduler.is_tracking(client)
            || self.pending_close.contains(&client)
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{harness, Harness};
    use super::*;
    use crate::dix::grab::THAW;
    use pretty_assertions::assert_eq;

    #[test]
    fn close_down_leaves_no_trace_of_the_client() {
        let Harness { mut server, a, w, child, pointer, keyboard, .. } = harness();
        let root = server.root();
        server.select_events(w, a, EventMask::POINTER_MOTION, SelectionLevel::Core).unwrap();
        server.select_events(root, a, EventMask::DEVICE_PRESENCE, SelectionLevel::Extension).unwrap();
        server.suppress_events(child, a, EventMask::KEY_PRESS).unwrap();
        server
            .grab_button(a, pointer, 1, ModifierMask::empty(), GrabParams::new(w, EventMask::BUTTON_PRESS))
            .unwrap();
        server
            .grab_device(a, keyboard, GrabParams::new(w, EventMask::KEY_PRESS).synchronous())
            .unwrap();
        server.client_sleep(a, THAW, 0);
        assert!(server.references_client(a));

        let teardown = server.destroy_client(a).unwrap();
        assert_eq!(teardown.released, 3);
        assert!(!server.references_client(a));
        assert!(!server.devices().get(pointer).unwrap().is_frozen());
        assert!(server.registry().passive_on(w).is_empty());
        assert_eq!(server.inconsistencies(), 0);
    }

    #[test]
    fn close_down_drops_contacts_and_suppressions() {
        let Harness { mut server, a, w, child, touchpad, .. } = harness();
        server.suppress_events(child, a, EventMask::BUTTON_PRESS).unwrap();
        server
            .grab_device(a, touchpad, GrabParams::new(w, EventMask::TOUCH | EventMask::GESTURE))
            .unwrap();
        let begin = LogicalEvent::new(w, EventKind::TouchBegin { touch_id: 4 });
        server.process_input(touchpad, begin.into()).unwrap();
        let gesture = LogicalEvent::new(w, EventKind::GestureBegin { fingers: 2 });
        server.process_input(touchpad, gesture.into()).unwrap();
        assert!(server.devices().get(touchpad).unwrap().contact_owner(4).is_some());

        server.destroy_client(a).unwrap();
        let record = server.devices().get(touchpad).unwrap();
        assert_eq!(record.contact_owner(4), None);
        assert_eq!(record.gesture_owner(), None);
        let suppressed = server
            .registry()
            .window(child)
            .map(|events| events.dont_propagate_mask())
            .unwrap_or_default();
        assert_eq!(suppressed, EventMask::empty());
        assert!(!server.references_client(a));
    }

    #[test]
    fn destroying_a_window_owner_drops_foreign_selections() {
        let Harness { mut server, a, b, w, .. } = harness();
        server.select_events(w, a, EventMask::POINTER_MOTION, SelectionLevel::Core).unwrap();
        assert_eq!(server.directory().owned_by(a).len(), 1);

        let teardown = server.destroy_client(b).unwrap();
        assert!(teardown.destroyed_windows.contains(&w));
        assert!(server.directory().owned_by(a).is_empty());
        assert!(server.registry().window(w).is_none());
        assert!(!server.references_client(b));
    }

    #[test]
    fn save_set_windows_survive_their_frame() {
        let Harness { mut server, a, b, w, child, .. } = harness();
        let root = server.root();
        let frame = Xid(server.directory().id_space().base(a).0 | 1);
        server.create_window(a, frame, root).unwrap();
        server.map_window(a, frame).unwrap();
        server.reparent_window(w, frame).unwrap();
        server.alter_save_set(a, w, SaveSetMode::Insert, false, true).unwrap();
        // duplicate entries are rescued once
        server.alter_save_set(a, w, SaveSetMode::Insert, false, true).unwrap();
        assert_eq!(
            server.alter_save_set(b, w, SaveSetMode::Insert, false, true),
            Err(DixError::BadMatch)
        );

        let teardown = server.destroy_client(a).unwrap();
        assert_eq!(teardown.rescued, vec![w]);
        assert_eq!(teardown.destroyed_windows, vec![frame]);
        assert_eq!(server.tree().parent(w), Some(root));
        assert!(server.tree().contains(child));
        assert!(server.tree().is_viewable(child));
    }

    #[test]
    fn client_limit_and_id_rules() {
        let options = CoreOptions {
            max_clients: 2,
            ..CoreOptions::default()
        };
        let mut server = Server::new(
            options,
            Box::new(WindowTree::new(Xid(1))),
            Box::new(RecordingSink::new()),
        )
        .unwrap();
        let a = server.register_client(ByteOrder::LittleEndian).unwrap();
        let b = server.register_client(ByteOrder::BigEndian).unwrap();
        assert_eq!(
            server.register_client(ByteOrder::native()),
            Err(DixError::LimitReached)
        );

        let window = Xid(server.directory().id_space().base(a).0 | 1);
        server.create_window(a, window, Xid(1)).unwrap();
        assert_eq!(
            server.create_window(a, window, Xid(1)),
            Err(DixError::IdInUse(window))
        );
        assert_eq!(
            server.create_window(b, Xid(window.0 + 1), Xid(1)),
            Err(DixError::IllegalId(Xid(window.0 + 1)))
        );
        assert_eq!(server.lookup_owner(window), Some(a));

        server.destroy_client(a).unwrap();
        assert_eq!(server.lookup_owner(window), None);
        assert!(server.register_client(ByteOrder::native()).is_ok());
    }

    #[test]
    fn presence_is_announced_on_the_root() {
        let Harness { mut server, sink, a, pointer, .. } = harness();
        let root = server.root();
        server
            .select_events(root, a, EventMask::DEVICE_PRESENCE, SelectionLevel::Extension)
            .unwrap();
        let pen = server.add_device("pen", InputClass::Pointer, DeviceRole::Floating);
        server.remove_device(pen).unwrap();
        assert_eq!(server.remove_device(pen), Err(DixError::BadDevice(pen)));
        let kinds: Vec<EventKind> = sink.events(a).into_iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![
                EventKind::DevicePresence { device: pen.0, added: true },
                EventKind::DevicePresence { device: pen.0, added: false },
            ]
        );
        assert_eq!(
            server.pair_devices(pointer, pointer),
            Err(DixError::BadMatch)
        );
    }
}
