//! Input Devices
//!
//! Arena of device records indexed by [`DeviceId`]. Each record holds the
//! device's single grab slot, its freeze bookkeeping and the touch/gesture
//! contact table. Grab transitions are made by the arbiter in `grab.rs`;
//! nothing outside this module writes the grab slot directly.

use std::collections::{BTreeSet, HashMap, VecDeque};

use serde::{Deserialize, Serialize};

use crate::dix::event::{EventRun, Timestamp};
use crate::dix::flags::ModifierMask;
use crate::dix::grab::Grab;
use crate::dix::resource::{ClientId, WindowId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId(pub u16);

/// Which grab mode applies to a device's events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputClass {
    Pointer,
    Keyboard,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceRole {
    /// Generates core-compatible events
    Master,
    /// Physical device attached to a master
    Slave { master: DeviceId },
    Floating,
}

/// Keyboard focus of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Focus {
    #[default]
    None,
    PointerRoot,
    Window(WindowId),
}

/// Grab slot of a device.
#[derive(Debug, Clone, Default)]
pub enum GrabState {
    #[default]
    Ungrabbed,
    Active(Grab),
    /// Synchronous grab holding the run that froze it
    Frozen { grab: Grab, held: EventRun },
}

/// Recipient that keeps a touch or gesture stream until it ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContactOwner {
    Grab { client: ClientId, window: WindowId },
    Window(WindowId),
}

impl ContactOwner {
    pub fn window(&self) -> WindowId {
        match *self {
            Self::Grab { window, .. } | Self::Window(window) => window,
        }
    }

    pub fn client(&self) -> Option<ClientId> {
        match *self {
            Self::Grab { client, .. } => Some(client),
            Self::Window(_) => None,
        }
    }
}

#[derive(Debug)]
pub struct Device {
    id: DeviceId,
    name: String,
    class: InputClass,
    role: DeviceRole,
    pub(super) paired: Option<DeviceId>,
    pub(super) state: GrabState,
    /// Client whose grab on the paired device froze this one
    pub(super) other_freeze: Option<ClientId>,
    /// Runs that arrived while frozen, in arrival order
    pub(super) queued: VecDeque<EventRun>,
    pub(super) last_grab_time: Timestamp,
    pub(super) buttons_down: ModifierMask,
    pub(super) keys_down: BTreeSet<u8>,
    pub(super) touches: HashMap<u32, ContactOwner>,
    pub(super) gesture: Option<ContactOwner>,
    pub(super) focus: Focus,
    pub(super) focus_time: Timestamp,
}

impl Device {
    fn new(id: DeviceId, name: String, class: InputClass, role: DeviceRole, focus: Focus) -> Self {
        Self {
            id,
            name,
            class,
            role,
            paired: None,
            state: GrabState::Ungrabbed,
            other_freeze: None,
            queued: VecDeque::new(),
            last_grab_time: Timestamp::default(),
            buttons_down: ModifierMask::empty(),
            keys_down: BTreeSet::new(),
            touches: HashMap::new(),
            gesture: None,
            focus,
            focus_time: Timestamp::default(),
        }
    }

    pub fn id(&self) -> DeviceId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn class(&self) -> InputClass {
        self.class
    }

    pub fn role(&self) -> DeviceRole {
        self.role
    }

    pub fn paired(&self) -> Option<DeviceId> {
        self.paired
    }

    pub fn state(&self) -> &GrabState {
        &self.state
    }

    /// The active grab, frozen or not.
    pub fn grab(&self) -> Option<&Grab> {
        match &self.state {
            GrabState::Ungrabbed => None,
            GrabState::Active(grab) | GrabState::Frozen { grab, .. } => Some(grab),
        }
    }

    /// Frozen by its own synchronous grab or by a grab on its paired device.
    pub fn is_frozen(&self) -> bool {
        matches!(self.state, GrabState::Frozen { .. }) || self.other_freeze.is_some()
    }

    pub fn focus(&self) -> Focus {
        self.focus
    }

    pub fn queued_runs(&self) -> usize {
        self.queued.len()
    }

    pub fn buttons_down(&self) -> ModifierMask {
        self.buttons_down
    }

    pub fn contact_owner(&self, touch_id: u32) -> Option<ContactOwner> {
        self.touches.get(&touch_id).copied()
    }

    pub fn gesture_owner(&self) -> Option<ContactOwner> {
        self.gesture
    }

    fn references_client(&self, client: ClientId) -> bool {
        self.grab().is_some_and(|g| g.owner == client)
            || self.other_freeze == Some(client)
            || self.touches.values().any(|o| o.client() == Some(client))
            || self.gesture.and_then(|o| o.client()) == Some(client)
    }

    pub(super) fn forget_window(&mut self, window: WindowId) {
        self.touches.retain(|_, owner| owner.window() != window);
        if self.gesture.is_some_and(|o| o.window() == window) {
            self.gesture = None;
        }
        if self.focus == Focus::Window(window) {
            self.focus = Focus::None;
        }
    }
}

#[derive(Debug, Default)]
pub struct DeviceManager {
    devices: Vec<Option<Device>>,
}

impl DeviceManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a device in the lowest free slot. Id 0 is never handed out.
    pub(super) fn add(
        &mut self,
        name: impl Into<String>,
        class: InputClass,
        role: DeviceRole,
        focus: Focus,
    ) -> DeviceId {
        if self.devices.is_empty() {
            self.devices.push(None);
        }
        let slot = match self.devices.iter().skip(1).position(Option::is_none) {
            Some(i) => i + 1,
            None => {
                self.devices.push(None);
                self.devices.len() - 1
            }
        };
        let id = DeviceId(slot as u16);
        self.devices[slot] = Some(Device::new(id, name.into(), class, role, focus));
        id
    }

    pub(super) fn remove(&mut self, id: DeviceId) -> Option<Device> {
        let removed = self.devices.get_mut(usize::from(id.0)).and_then(Option::take)?;
        for device in self.devices.iter_mut().flatten() {
            if device.paired == Some(id) {
                device.paired = None;
            }
        }
        Some(removed)
    }

    /// Pair a master pointer with its master keyboard.
    pub(super) fn pair(&mut self, a: DeviceId, b: DeviceId) {
        if let Some(device) = self.get_mut(a) {
            device.paired = Some(b);
        }
        if let Some(device) = self.get_mut(b) {
            device.paired = Some(a);
        }
    }

    pub fn get(&self, id: DeviceId) -> Option<&Device> {
        self.devices.get(usize::from(id.0)).and_then(Option::as_ref)
    }

    pub(super) fn get_mut(&mut self, id: DeviceId) -> Option<&mut Device> {
        self.devices.get_mut(usize::from(id.0)).and_then(Option::as_mut)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Device> {
        self.devices.iter().flatten()
    }

    pub fn ids(&self) -> Vec<DeviceId> {
        self.iter().map(Device::id).collect()
    }

    pub(super) fn iter_mut(&mut self) -> impl Iterator<Item = &mut Device> {
        self.devices.iter_mut().flatten()
    }

    /// Drop contact ownership and freezes left behind by a departed client.
    pub(super) fn forget_client(&mut self, client: ClientId) {
        for device in self.iter_mut() {
            device.touches.retain(|_, owner| owner.client() != Some(client));
            if device.gesture.and_then(|o| o.client()) == Some(client) {
                device.gesture = None;
            }
            if device.other_freeze == Some(client) {
                device.other_freeze = None;
            }
        }
    }

    pub fn references_client(&self, client: ClientId) -> bool {
        self.iter().any(|d| d.references_client(client))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dix::resource::Xid;

    #[test]
    fn slots_are_reused_and_pairing_is_cleared() {
        let mut devices = DeviceManager::new();
        let pointer = devices.add("pointer", InputClass::Pointer, DeviceRole::Master, Focus::None);
        let keyboard = devices.add(
            "keyboard",
            InputClass::Keyboard,
            DeviceRole::Master,
            Focus::PointerRoot,
        );
        assert_eq!(pointer, DeviceId(1));
        assert_eq!(keyboard, DeviceId(2));
        devices.pair(pointer, keyboard);
        assert_eq!(devices.get(pointer).unwrap().paired(), Some(keyboard));

        devices.remove(pointer);
        assert_eq!(devices.get(keyboard).unwrap().paired(), None);
        let again = devices.add("pointer", InputClass::Pointer, DeviceRole::Master, Focus::None);
        assert_eq!(again, pointer);
    }

    #[test]
    fn forgetting_a_window_drops_contacts_and_focus() {
        let mut devices = DeviceManager::new();
        let id = devices.add("touch", InputClass::Pointer, DeviceRole::Floating, Focus::None);
        let device = devices.get_mut(id).unwrap();
        let w = Xid(0x0020_0001);
        device.touches.insert(1, ContactOwner::Window(w));
        device.touches.insert(
            2,
            ContactOwner::Grab {
                client: ClientId(2),
                window: Xid(0x0040_0001),
            },
        );
        device.focus = Focus::Window(w);
        device.forget_window(w);
        assert_eq!(device.contact_owner(1), None);
        assert!(device.contact_owner(2).is_some());
        assert_eq!(device.focus(), Focus::None);

        devices.forget_client(ClientId(2));
        assert!(!devices.references_client(ClientId(2)));
    }
}
