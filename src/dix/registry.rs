//! Window Event Registration
//!
//! Per-window selections, do-not-propagate masks and passive grabs. Records
//! here are indexed by window for delivery; the owning client reaches them
//! through the resource directory, never through this table.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::dix::Server;
use crate::dix::device::DeviceId;
use crate::dix::error::DixError;
use crate::dix::flags::EventMask;
use crate::dix::grab::Grab;
use crate::dix::resource::{ClientId, ResourceKind, WindowId, Xid};

/// Core selections follow the core rules (owner first, exclusive bits);
/// extension selections are filtered strictly by mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionLevel {
    #[default]
    Core,
    Extension,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub client: ClientId,
    pub mask: EventMask,
    pub level: SelectionLevel,
    /// Directory id backing a non-owner's selection
    pub resource: Option<Xid>,
}

#[derive(Debug, Clone, Default)]
pub struct WindowEvents {
    /// In registration order
    pub selections: Vec<Selection>,
    pub dont_propagate: BTreeMap<ClientId, EventMask>,
    /// Passive grabs in registration order
    pub passive: Vec<Grab>,
}

impl WindowEvents {
    /// Whether the window needs its optional record: anything beyond the
    /// owner's own selections.
    fn has_optional(&self) -> bool {
        !self.dont_propagate.is_empty()
            || !self.passive.is_empty()
            || self.selections.iter().any(|s| s.resource.is_some())
    }

    fn is_empty(&self) -> bool {
        self.selections.is_empty() && self.dont_propagate.is_empty() && self.passive.is_empty()
    }

    pub fn all_event_masks(&self) -> EventMask {
        self.selections
            .iter()
            .fold(EventMask::empty(), |acc, s| acc | s.mask)
    }

    pub fn dont_propagate_mask(&self) -> EventMask {
        self.dont_propagate
            .values()
            .fold(EventMask::empty(), |acc, m| acc | *m)
    }

    /// A client's combined mask for events of `level`.
    pub fn mask_for(&self, client: ClientId, level: SelectionLevel) -> EventMask {
        self.selections
            .iter()
            .filter(|s| s.client == client)
            .filter(|s| level == SelectionLevel::Core || s.level == SelectionLevel::Extension)
            .fold(EventMask::empty(), |acc, s| acc | s.mask)
    }

    fn references_client(&self, client: ClientId) -> bool {
        self.selections.iter().any(|s| s.client == client)
            || self.dont_propagate.contains_key(&client)
            || self.passive.iter().any(|g| g.owner == client)
    }
}

#[derive(Debug, Default)]
pub struct EventRegistry {
    windows: HashMap<WindowId, WindowEvents>,
    invalidated: BTreeSet<WindowId>,
}

impl EventRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn window(&self, window: WindowId) -> Option<&WindowEvents> {
        self.windows.get(&window)
    }

    /// Apply `change` to a window's record, queueing the window for
    /// invalidation when its optional record appears or disappears.
    fn update<R>(&mut self, window: WindowId, change: impl FnOnce(&mut WindowEvents) -> R) -> (R, bool) {
        let events = self.windows.entry(window).or_default();
        let before = events.has_optional();
        let result = change(events);
        let after = events.has_optional();
        if events.is_empty() {
            self.windows.remove(&window);
        }
        let changed = before != after;
        if changed {
            self.invalidated.insert(window);
        }
        (result, changed)
    }

    pub fn passive_on(&self, window: WindowId) -> &[Grab] {
        self.windows
            .get(&window)
            .map(|w| w.passive.as_slice())
            .unwrap_or_default()
    }

    pub(super) fn add_passive(&mut self, window: WindowId, grab: Grab) {
        self.update(window, |events| events.passive.push(grab));
    }

    pub(super) fn remove_passive_grab(&mut self, window: WindowId, resource: Xid) -> Option<Grab> {
        let (removed, _) = self.update(window, |events| {
            let index = events
                .passive
                .iter()
                .position(|g| g.resource == Some(resource))?;
            Some(events.passive.remove(index))
        });
        removed
    }

    pub(super) fn remove_selection_resource(&mut self, window: WindowId, resource: Xid) -> bool {
        let (removed, _) = self.update(window, |events| {
            let before = events.selections.len();
            events.selections.retain(|s| s.resource != Some(resource));
            before != events.selections.len()
        });
        removed
    }

    /// Passive grabs registered for `device` on any window, as (window, resource).
    pub fn passive_grabs_for_device(&self, device: DeviceId) -> Vec<(WindowId, Xid)> {
        let mut found: Vec<_> = self
            .windows
            .iter()
            .flat_map(|(window, events)| {
                events
                    .passive
                    .iter()
                    .filter(move |g| g.device == device)
                    .filter_map(move |g| g.resource.map(|r| (*window, r)))
            })
            .collect();
        found.sort();
        found
    }

    pub(super) fn remove_window(&mut self, window: WindowId) -> Option<WindowEvents> {
        self.invalidated.remove(&window);
        self.windows.remove(&window)
    }

    /// Drop the registrations of a departed client that no resource backs,
    /// such as its do-not-propagate masks. Runs after the directory's release
    /// hooks.
    pub(super) fn forget_client(&mut self, client: ClientId) {
        let windows: Vec<WindowId> = self
            .windows
            .iter()
            .filter(|(_, events)| events.references_client(client))
            .map(|(window, _)| *window)
            .collect();
        for window in windows {
            self.update(window, |events| {
                events.selections.retain(|s| s.client != client);
                events.dont_propagate.remove(&client);
                events.passive.retain(|g| g.owner != client);
            });
        }
    }

    pub fn references_client(&self, client: ClientId) -> bool {
        self.windows.values().any(|w| w.references_client(client))
    }

    /// Windows whose optional record changed since the last call.
    pub fn take_optional_invalidations(&mut self) -> Vec<WindowId> {
        std::mem::take(&mut self.invalidated).into_iter().collect()
    }
}

impl Server {
    /// Replace `client`'s selection on `window` at `level`. An empty mask
    /// removes it.
    pub fn select_events(
        &mut self,
        window: WindowId,
        client: ClientId,
        mask: EventMask,
        level: SelectionLevel,
    ) -> Result<(), DixError> {
        if !self.tree.contains(window) {
            return Err(DixError::BadWindow(window));
        }
        let current = self.registry.window(window);
        let exclusive = mask & EventMask::exclusive();
        if level == SelectionLevel::Core && !exclusive.is_empty() {
            let taken = current.is_some_and(|events| {
                events.selections.iter().any(|s| {
                    s.client != client
                        && s.level == SelectionLevel::Core
                        && s.mask.intersects(exclusive)
                })
            });
            if taken {
                return Err(DixError::BadAccess);
            }
        }

        let existing = current.and_then(|events| {
            events
                .selections
                .iter()
                .find(|s| s.client == client && s.level == level)
                .map(|s| s.resource)
        });
        match (existing, mask.is_empty()) {
            (None, true) => {}
            (Some(resource), true) => {
                if let Some(resource) = resource {
                    self.directory.unbind(resource);
                }
                self.registry.update(window, |events| {
                    events
                        .selections
                        .retain(|s| !(s.client == client && s.level == level));
                });
            }
            (Some(_), false) => {
                self.registry.update(window, |events| {
                    for s in &mut events.selections {
                        if s.client == client && s.level == level {
                            s.mask = mask;
                        }
                    }
                });
            }
            (None, false) => {
                let owner = self.directory.client_for_window(window);
                let resource = if owner == Some(client) {
                    None
                } else {
                    Some(
                        self.directory
                            .bind_fake(ResourceKind::EventSelection { window }, client)?,
                    )
                };
                self.registry.update(window, |events| {
                    events.selections.push(Selection {
                        client,
                        mask,
                        level,
                        resource,
                    });
                });
            }
        }
        debug!(window = %window, client = ?client, ?mask, ?level, "event selection updated");
        Ok(())
    }

    /// Set `client`'s do-not-propagate mask on `window`. Returns whether the
    /// window's optional record appeared or disappeared.
    pub fn suppress_events(
        &mut self,
        window: WindowId,
        client: ClientId,
        mask: EventMask,
    ) -> Result<bool, DixError> {
        if !self.tree.contains(window) {
            return Err(DixError::BadWindow(window));
        }
        let stray = mask - EventMask::propagate();
        if !stray.is_empty() {
            return Err(DixError::BadValue(stray.bits() as u32));
        }
        let (_, changed) = self.registry.update(window, |events| {
            if mask.is_empty() {
                events.dont_propagate.remove(&client);
            } else {
                events.dont_propagate.insert(client, mask);
            }
        });
        Ok(changed)
    }

    pub fn event_mask_for_client(&self, window: WindowId, client: ClientId) -> EventMask {
        self.registry
            .window(window)
            .map(|events| events.mask_for(client, SelectionLevel::Core))
            .unwrap_or_default()
    }

    pub fn take_optional_invalidations(&mut self) -> Vec<WindowId> {
        self.registry.take_optional_invalidations()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dix::testing::{harness, Harness};
    use pretty_assertions::assert_eq;

    #[test]
    fn button_press_is_exclusive_between_clients() {
        let Harness { mut server, a, b, w, .. } = harness();
        server
            .select_events(w, a, EventMask::BUTTON_PRESS, SelectionLevel::Core)
            .unwrap();
        assert_eq!(
            server.select_events(w, b, EventMask::BUTTON_PRESS | EventMask::EXPOSURE, SelectionLevel::Core),
            Err(DixError::BadAccess)
        );
        // non-exclusive bits are shared
        server
            .select_events(w, b, EventMask::EXPOSURE, SelectionLevel::Core)
            .unwrap();
        // the extension level has no exclusive bits
        server
            .select_events(w, b, EventMask::BUTTON_PRESS, SelectionLevel::Extension)
            .unwrap();
        assert_eq!(server.event_mask_for_client(w, b), EventMask::EXPOSURE | EventMask::BUTTON_PRESS);
    }

    #[test]
    fn non_owner_selection_is_a_directory_resource() {
        let Harness { mut server, a, b, w, .. } = harness();
        // b owns w, a does not
        let owned_by_b = server.directory().owned_by(b);
        server
            .select_events(w, b, EventMask::EXPOSURE, SelectionLevel::Core)
            .unwrap();
        assert_eq!(server.directory().owned_by(b), owned_by_b);
        server
            .select_events(w, a, EventMask::EXPOSURE, SelectionLevel::Core)
            .unwrap();
        let owned = server.directory().owned_by(a);
        assert_eq!(owned.len(), 1);
        assert_eq!(
            server.directory().lookup_resource(owned[0]).map(|e| e.kind),
            Some(ResourceKind::EventSelection { window: w })
        );

        server
            .select_events(w, a, EventMask::empty(), SelectionLevel::Core)
            .unwrap();
        assert!(server.directory().owned_by(a).is_empty());
        assert_eq!(server.event_mask_for_client(w, a), EventMask::empty());
    }

    #[test]
    fn suppress_reports_optional_record_changes() {
        let Harness { mut server, a, w, .. } = harness();
        server.take_optional_invalidations();
        assert_eq!(server.suppress_events(w, a, EventMask::KEY_PRESS), Ok(true));
        assert_eq!(server.suppress_events(w, a, EventMask::BUTTON_PRESS), Ok(false));
        assert_eq!(server.take_optional_invalidations(), vec![w]);
        assert_eq!(server.suppress_events(w, a, EventMask::empty()), Ok(true));
        assert_eq!(
            server.suppress_events(w, a, EventMask::EXPOSURE),
            Err(DixError::BadValue(EventMask::EXPOSURE.bits() as u32))
        );
    }

    #[test]
    fn unknown_window_is_rejected() {
        let Harness { mut server, a, .. } = harness();
        let missing = Xid(0x0030_0000);
        assert_eq!(
            server.select_events(missing, a, EventMask::EXPOSURE, SelectionLevel::Core),
            Err(DixError::BadWindow(missing))
        );
    }
}
