//! Grab Arbiter
//!
//! Per-device state machine: `Ungrabbed`, `Active(grab)`, `Frozen(grab)`.
//! Every transition goes through the functions here. Passive grabs are not a
//! device state; they are standing registrations on a window that turn into
//! an active grab when a matching press arrives.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::dix::Server;
use crate::dix::device::{Device, DeviceId, GrabState, InputClass};
use crate::dix::error::DixError;
use crate::dix::event::{EventRun, LogicalEvent, Timestamp};
use crate::dix::flags::{EventMask, ModifierMask};
use crate::dix::resource::{ClientId, ResourceKind, WindowId, Xid};
use crate::dix::scheduler::{Closure, Match, WakeProc};

/// Button or key code that matches any button or key in a passive grab.
pub const ANY_DETAIL: u8 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrabKind {
    Active,
    Passive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrabMode {
    Synchronous,
    #[default]
    Asynchronous,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrabLevel {
    #[default]
    Core,
    Extension,
}

/// How an active grab came to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrabOrigin {
    /// Requested by the client
    Explicit,
    /// Activated from a passive registration
    Passive,
    /// Automatic pointer grab after a delivered button press
    Implicit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Detail {
    Button(u8),
    Key(u8),
    TouchBegin,
}

impl Detail {
    fn overlaps(self, other: Detail) -> bool {
        match (self, other) {
            (Self::Button(a), Self::Button(b)) | (Self::Key(a), Self::Key(b)) => {
                a == b || a == ANY_DETAIL || b == ANY_DETAIL
            }
            (Self::TouchBegin, Self::TouchBegin) => true,
            _ => false,
        }
    }

    /// `self` is a request pattern covering `other`.
    fn covers(self, other: Detail) -> bool {
        match (self, other) {
            (Self::Button(a), Self::Button(b)) | (Self::Key(a), Self::Key(b)) => {
                a == b || a == ANY_DETAIL
            }
            (Self::TouchBegin, Self::TouchBegin) => true,
            _ => false,
        }
    }
}

/// Key of a passive grab: the press detail plus the modifier combination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrabTrigger {
    pub detail: Detail,
    #[serde(default)]
    pub modifiers: ModifierMask,
}

impl GrabTrigger {
    fn is_any_modifier(&self) -> bool {
        self.modifiers.contains(ModifierMask::ANY_MODIFIER)
    }

    pub fn matches(&self, event: &LogicalEvent) -> bool {
        let Some(detail) = event.kind.press_detail() else {
            return false;
        };
        if !self.detail.covers(detail) {
            return false;
        }
        self.is_any_modifier()
            || (event.state & ModifierMask::modifiers())
                == (self.modifiers & ModifierMask::modifiers())
    }

    fn overlaps(&self, other: &GrabTrigger) -> bool {
        self.detail.overlaps(other.detail)
            && (self.is_any_modifier()
                || other.is_any_modifier()
                || self.modifiers == other.modifiers)
    }

    fn covers(&self, other: &GrabTrigger) -> bool {
        self.detail.covers(other.detail)
            && (self.is_any_modifier() || self.modifiers == other.modifiers)
    }
}

/// Client-supplied grab parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrabParams {
    pub window: WindowId,
    #[serde(default)]
    pub confine_to: Option<WindowId>,
    #[serde(default)]
    pub cursor: Option<Xid>,
    #[serde(default)]
    pub event_mask: EventMask,
    #[serde(default)]
    pub owner_events: bool,
    #[serde(default)]
    pub pointer_mode: GrabMode,
    #[serde(default)]
    pub keyboard_mode: GrabMode,
    #[serde(default)]
    pub level: GrabLevel,
    #[serde(default)]
    pub time: Timestamp,
}

impl GrabParams {
    pub fn new(window: WindowId, event_mask: EventMask) -> Self {
        Self {
            window,
            confine_to: None,
            cursor: None,
            event_mask,
            owner_events: false,
            pointer_mode: GrabMode::Asynchronous,
            keyboard_mode: GrabMode::Asynchronous,
            level: GrabLevel::Core,
            time: Timestamp::CURRENT,
        }
    }

    pub fn synchronous(mut self) -> Self {
        self.pointer_mode = GrabMode::Synchronous;
        self.keyboard_mode = GrabMode::Synchronous;
        self
    }

    pub fn owner_events(mut self, owner_events: bool) -> Self {
        self.owner_events = owner_events;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Grab {
    /// Directory id of a passive registration
    pub resource: Option<Xid>,
    pub owner: ClientId,
    pub device: DeviceId,
    pub kind: GrabKind,
    pub window: WindowId,
    pub confine_to: Option<WindowId>,
    pub cursor: Option<Xid>,
    pub event_mask: EventMask,
    pub owner_events: bool,
    pub pointer_mode: GrabMode,
    pub keyboard_mode: GrabMode,
    pub level: GrabLevel,
    pub trigger: Option<GrabTrigger>,
    pub activated: Timestamp,
    pub origin: GrabOrigin,
}

impl Grab {
    pub fn from_params(owner: ClientId, device: DeviceId, params: &GrabParams) -> Self {
        Self {
            resource: None,
            owner,
            device,
            kind: GrabKind::Active,
            window: params.window,
            confine_to: params.confine_to,
            cursor: params.cursor,
            event_mask: params.event_mask,
            owner_events: params.owner_events,
            pointer_mode: params.pointer_mode,
            keyboard_mode: params.keyboard_mode,
            level: params.level,
            trigger: None,
            activated: params.time,
            origin: GrabOrigin::Explicit,
        }
    }

    /// Mode governing events of `class` on the grabbed device.
    pub fn mode_for(&self, class: InputClass) -> GrabMode {
        match class {
            InputClass::Pointer => self.pointer_mode,
            InputClass::Keyboard => self.keyboard_mode,
        }
    }

    fn set_mode_for(&mut self, class: InputClass, mode: GrabMode) {
        match class {
            InputClass::Pointer => self.pointer_mode = mode,
            InputClass::Keyboard => self.keyboard_mode = mode,
        }
    }

    fn other_mode(&self, class: InputClass) -> GrabMode {
        match class {
            InputClass::Pointer => self.keyboard_mode,
            InputClass::Keyboard => self.pointer_mode,
        }
    }

    /// Whether the grab forwards an event with this filter.
    pub fn wants(&self, filter: EventMask) -> bool {
        filter.is_empty() || self.event_mask.intersects(filter)
    }
}

/// Reply status of a refused grab request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum GrabRefusal {
    #[error("device is grabbed by another client")]
    AlreadyGrabbed,
    #[error("request time is outside the valid window")]
    InvalidTime,
    #[error("grab window is not viewable")]
    NotViewable,
    #[error("device is frozen by another client")]
    Frozen,
}

impl GrabRefusal {
    pub fn status(self) -> u8 {
        match self {
            Self::AlreadyGrabbed => 1,
            Self::InvalidTime => 2,
            Self::NotViewable => 3,
            Self::Frozen => 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GrabError {
    #[error(transparent)]
    Protocol(#[from] DixError),
    #[error("grab refused: {0}")]
    Refused(#[from] GrabRefusal),
}

/// What the grab owner decides about a frozen device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllowMode {
    /// Deliver the held run to the owner and stay synchronous
    Replay,
    /// Drop the held run
    Discard,
    /// Deliver the held run and continue asynchronously
    Async,
    /// Ungrab and deliver the held run normally
    Release,
}

fn thaw_ready(server: &Server, _client: ClientId, closure: Closure) -> bool {
    let device = DeviceId(closure as u16);
    !server.devices.get(device).is_some_and(Device::is_frozen)
}

/// Wake procedure of clients waiting for a device to thaw.
pub const THAW: WakeProc = WakeProc::new("thaw", thaw_ready);

impl Server {
    pub(super) fn resolve_time(&self, time: Timestamp) -> Timestamp {
        if time == Timestamp::CURRENT {
            self.now
        } else {
            time
        }
    }

    pub(super) fn device_or_err(&self, device: DeviceId) -> Result<&Device, DixError> {
        self.devices.get(device).ok_or(DixError::BadDevice(device))
    }

    fn check_grab_params(&self, params: &GrabParams) -> Result<(), DixError> {
        if !self.tree.contains(params.window) {
            return Err(DixError::BadWindow(params.window));
        }
        if let Some(confine) = params.confine_to {
            if !self.tree.contains(confine) {
                return Err(DixError::BadWindow(confine));
            }
        }
        if let Some(cursor) = params.cursor {
            let is_cursor = self
                .directory
                .lookup_resource(cursor)
                .is_some_and(|e| e.kind == ResourceKind::Cursor);
            if !is_cursor {
                return Err(DixError::BadCursor(cursor));
            }
        }
        Ok(())
    }

    /// Active grab request. The same client re-grabbing replaces its grab in
    /// place; anyone else is refused while the grab stands.
    pub fn grab_device(
        &mut self,
        client: ClientId,
        device: DeviceId,
        params: GrabParams,
    ) -> Result<(), GrabError> {
        if self.directory.client(client).is_none() {
            return Err(DixError::UnknownClient(client).into());
        }
        self.check_grab_params(&params)?;
        let time = self.resolve_time(params.time);
        let record = self.device_or_err(device)?;

        if time > self.now || time < record.last_grab_time {
            return Err(GrabRefusal::InvalidTime.into());
        }
        let viewable = self.tree.is_viewable(params.window)
            && params.confine_to.is_none_or(|c| self.tree.is_viewable(c));
        if !viewable {
            return Err(GrabRefusal::NotViewable.into());
        }
        if record.grab().is_some_and(|g| g.owner != client) {
            return Err(GrabRefusal::AlreadyGrabbed.into());
        }
        if record.other_freeze.is_some_and(|c| c != client) {
            return Err(GrabRefusal::Frozen.into());
        }

        let grab = Grab {
            activated: time,
            ..Grab::from_params(client, device, &params)
        };
        self.activate_grab(device, grab);
        self.replay_thawed();
        Ok(())
    }

    /// Install `grab` as the device's active grab. A frozen device stays
    /// frozen under the new grab.
    pub(crate) fn activate_grab(&mut self, device: DeviceId, grab: Grab) {
        let Some(record) = self.devices.get_mut(device) else {
            return;
        };
        let class = record.class();
        let paired = record.paired();
        let owner = grab.owner;
        let other_sync = grab.other_mode(class) == GrabMode::Synchronous;
        record.last_grab_time = grab.activated;
        debug!(
            device = ?device,
            client = ?owner,
            window = %grab.window,
            origin = ?grab.origin,
            "grab activated"
        );
        record.state = match std::mem::take(&mut record.state) {
            GrabState::Frozen { held, .. } => GrabState::Frozen { grab, held },
            _ => GrabState::Active(grab),
        };
        if let Some(other) = paired.and_then(|p| self.devices.get_mut(p)) {
            if other_sync {
                other.other_freeze = Some(owner);
            } else if other.other_freeze == Some(owner) {
                other.other_freeze = None;
                let id = other.id();
                self.mark_thawed(id);
            }
        }
    }

    /// Remove the device's active grab. A run held by a freeze goes back to
    /// the front of the queue for normal delivery.
    pub(crate) fn deactivate_grab(&mut self, device: DeviceId) -> Option<Grab> {
        let record = self.devices.get_mut(device)?;
        let paired = record.paired();
        let (grab, was_frozen) = match std::mem::take(&mut record.state) {
            GrabState::Ungrabbed => return None,
            GrabState::Active(grab) => (grab, false),
            GrabState::Frozen { grab, held } => {
                record.queued.push_front(held);
                (grab, true)
            }
        };
        debug!(device = ?device, client = ?grab.owner, "grab deactivated");
        if was_frozen {
            self.mark_thawed(device);
        }
        if let Some(other) = paired.and_then(|p| self.devices.get_mut(p)) {
            if other.other_freeze == Some(grab.owner) {
                other.other_freeze = None;
                let id = other.id();
                self.mark_thawed(id);
            }
        }
        Some(grab)
    }

    /// Hold `run` and stop the device until its grab owner allows events.
    pub(crate) fn freeze(&mut self, device: DeviceId, run: EventRun) {
        let Some(record) = self.devices.get_mut(device) else {
            return;
        };
        record.state = match std::mem::take(&mut record.state) {
            GrabState::Active(grab) => {
                debug!(device = ?device, client = ?grab.owner, "device frozen");
                GrabState::Frozen { grab, held: run }
            }
            other => other,
        };
    }

    fn mark_thawed(&mut self, device: DeviceId) {
        debug!(device = ?device, "device thawed");
        self.thawed.push(device);
        self.scheduler
            .signal_all(Match::Any, Match::Exactly(THAW), Match::Exactly(Closure::from(device.0)));
    }

    /// Explicit ungrab. Ignored unless `client` owns the grab and `time` is
    /// not stale.
    pub fn ungrab_device(
        &mut self,
        client: ClientId,
        device: DeviceId,
        time: Timestamp,
    ) -> Result<(), DixError> {
        let time = self.resolve_time(time);
        let record = self.device_or_err(device)?;
        let owned = record.grab().is_some_and(|g| g.owner == client);
        if owned && time <= self.now && time >= record.last_grab_time {
            self.deactivate_grab(device);
            self.replay_thawed();
        }
        Ok(())
    }

    /// Resolve a frozen device on behalf of its grab owner.
    pub fn allow_some(
        &mut self,
        client: ClientId,
        device: DeviceId,
        time: Timestamp,
        mode: AllowMode,
    ) -> Result<(), DixError> {
        let time = self.resolve_time(time);
        let record = self.device_or_err(device)?;
        if time > self.now || time < record.last_grab_time {
            debug!(device = ?device, client = ?client, "ignoring stale allow");
            return Ok(());
        }
        let class = record.class();
        let frozen_by_client = matches!(
            &record.state,
            GrabState::Frozen { grab, .. } if grab.owner == client
        );
        let paired_freeze = record.other_freeze == Some(client);

        if frozen_by_client {
            self.resolve_freeze(device, class, mode);
        } else if paired_freeze {
            if let Some(record) = self.devices.get_mut(device) {
                record.other_freeze = None;
            }
            self.mark_thawed(device);
        } else {
            return Ok(());
        }
        self.replay_thawed();
        Ok(())
    }

    fn resolve_freeze(&mut self, device: DeviceId, class: InputClass, mode: AllowMode) {
        let Some(record) = self.devices.get_mut(device) else {
            return;
        };
        let GrabState::Frozen { mut grab, held } = std::mem::take(&mut record.state) else {
            return;
        };
        debug!(device = ?device, client = ?grab.owner, ?mode, "allowing events");
        match mode {
            AllowMode::Replay => {
                record.state = GrabState::Active(grab.clone());
                self.deliver_to_grab(device, &grab, &held);
                self.release_after(device, &held);
            }
            AllowMode::Async => {
                grab.set_mode_for(class, GrabMode::Asynchronous);
                record.state = GrabState::Active(grab.clone());
                self.deliver_to_grab(device, &grab, &held);
                self.release_after(device, &held);
            }
            AllowMode::Discard => {
                record.state = GrabState::Active(grab);
            }
            AllowMode::Release => {
                record.state = GrabState::Active(grab);
                self.deactivate_grab(device);
                self.route_run(device, held, false);
            }
        }
        self.mark_thawed(device);
    }

    /// Deactivate every grab `client` holds and lift freezes it caused.
    pub fn release_active_grabs(&mut self, client: ClientId) {
        for device in self.devices.ids() {
            let Some(record) = self.devices.get(device) else {
                continue;
            };
            if record.grab().is_some_and(|g| g.owner == client) {
                self.deactivate_grab(device);
            }
            if let Some(record) = self.devices.get_mut(device) {
                if record.other_freeze == Some(client) {
                    record.other_freeze = None;
                    self.mark_thawed(device);
                }
            }
        }
    }

    /// Match `event` against the passive grabs on `window` in registration
    /// order. With `activate`, the first match becomes the device's active
    /// grab; the activated grab is returned.
    pub fn check_passive_grabs_on_window(
        &mut self,
        window: WindowId,
        device: DeviceId,
        event: &LogicalEvent,
        core_only: bool,
        activate: bool,
    ) -> Option<Grab> {
        let found = self
            .registry
            .passive_on(window)
            .iter()
            .filter(|g| g.device == device)
            .filter(|g| !core_only || g.level == GrabLevel::Core)
            .filter(|g| g.trigger.is_some_and(|t| t.matches(event)))
            .filter(|g| g.confine_to.is_none_or(|c| self.tree.is_viewable(c)))
            .find(|g| {
                self.directory
                    .client(g.owner)
                    .is_some_and(|c| c.can_receive())
            })
            .cloned()?;
        // the activated grab remembers the actual press so its release ends it
        let trigger = event
            .kind
            .press_detail()
            .map(|detail| GrabTrigger {
                detail,
                modifiers: event.state & ModifierMask::modifiers(),
            })
            .or(found.trigger);
        let active = Grab {
            kind: GrabKind::Active,
            origin: GrabOrigin::Passive,
            activated: event.time,
            trigger,
            ..found
        };
        if activate {
            info!(
                device = ?device,
                client = ?active.owner,
                window = %window,
                "passive grab triggered"
            );
            self.activate_grab(device, active.clone());
        }
        Some(active)
    }

    fn grab_passive(
        &mut self,
        client: ClientId,
        device: DeviceId,
        trigger: GrabTrigger,
        params: GrabParams,
    ) -> Result<Xid, DixError> {
        if self.directory.client(client).is_none() {
            return Err(DixError::UnknownClient(client));
        }
        self.check_grab_params(&params)?;
        self.device_or_err(device)?;
        let window = params.window;

        let mut replaced = Vec::new();
        for existing in self.registry.passive_on(window) {
            let Some(other) = existing.trigger else {
                continue;
            };
            if existing.device != device || !other.overlaps(&trigger) {
                continue;
            }
            if existing.owner != client {
                return Err(DixError::BadAccess);
            }
            if other == trigger {
                replaced.extend(existing.resource);
            }
        }
        for resource in replaced {
            self.free_resource(resource);
        }

        let resource = self
            .directory
            .bind_fake(ResourceKind::PassiveGrab { window, device }, client)?;
        let grab = Grab {
            resource: Some(resource),
            kind: GrabKind::Passive,
            trigger: Some(trigger),
            ..Grab::from_params(client, device, &params)
        };
        debug!(window = %window, client = ?client, ?trigger, "passive grab registered");
        self.registry.add_passive(window, grab);
        Ok(resource)
    }

    pub fn grab_button(
        &mut self,
        client: ClientId,
        device: DeviceId,
        button: u8,
        modifiers: ModifierMask,
        params: GrabParams,
    ) -> Result<Xid, DixError> {
        let trigger = GrabTrigger {
            detail: Detail::Button(button),
            modifiers,
        };
        self.grab_passive(client, device, trigger, params)
    }

    pub fn grab_key(
        &mut self,
        client: ClientId,
        device: DeviceId,
        keycode: u8,
        modifiers: ModifierMask,
        params: GrabParams,
    ) -> Result<Xid, DixError> {
        let trigger = GrabTrigger {
            detail: Detail::Key(keycode),
            modifiers,
        };
        self.grab_passive(client, device, trigger, params)
    }

    pub fn grab_touch_begin(
        &mut self,
        client: ClientId,
        device: DeviceId,
        params: GrabParams,
    ) -> Result<Xid, DixError> {
        let trigger = GrabTrigger {
            detail: Detail::TouchBegin,
            modifiers: ModifierMask::ANY_MODIFIER,
        };
        self.grab_passive(client, device, trigger, params)
    }

    /// Remove `client`'s passive grabs on `window` covered by `pattern`.
    /// Returns how many were removed.
    pub fn ungrab_passive(
        &mut self,
        client: ClientId,
        device: DeviceId,
        window: WindowId,
        pattern: GrabTrigger,
    ) -> Result<usize, DixError> {
        if !self.tree.contains(window) {
            return Err(DixError::BadWindow(window));
        }
        self.device_or_err(device)?;
        let doomed: Vec<Xid> = self
            .registry
            .passive_on(window)
            .iter()
            .filter(|g| g.owner == client && g.device == device)
            .filter(|g| g.trigger.is_some_and(|t| pattern.covers(&t)))
            .filter_map(|g| g.resource)
            .collect();
        for resource in &doomed {
            self.free_resource(*resource);
        }
        Ok(doomed.len())
    }

    pub fn ungrab_button(
        &mut self,
        client: ClientId,
        device: DeviceId,
        window: WindowId,
        button: u8,
        modifiers: ModifierMask,
    ) -> Result<usize, DixError> {
        let pattern = GrabTrigger {
            detail: Detail::Button(button),
            modifiers,
        };
        self.ungrab_passive(client, device, window, pattern)
    }

    pub fn ungrab_key(
        &mut self,
        client: ClientId,
        device: DeviceId,
        window: WindowId,
        keycode: u8,
        modifiers: ModifierMask,
    ) -> Result<usize, DixError> {
        let pattern = GrabTrigger {
            detail: Detail::Key(keycode),
            modifiers,
        };
        self.ungrab_passive(client, device, window, pattern)
    }

    /// Whether a grab by someone other than `client` stands on the device or
    /// its paired device.
    pub fn is_interfering_grab(&self, client: ClientId, device: DeviceId) -> bool {
        let Some(record) = self.devices.get(device) else {
            return false;
        };
        let foreign = |d: &Device| d.grab().is_some_and(|g| g.owner != client);
        foreign(record) || record.paired().and_then(|p| self.devices.get(p)).is_some_and(foreign)
    }

    /// Put `client` to sleep until `device` thaws. Returns false when the
    /// device is not frozen.
    pub fn wait_for_thaw(&mut self, client: ClientId, device: DeviceId) -> Result<bool, DixError> {
        if !self.device_or_err(device)?.is_frozen() {
            return Ok(false);
        }
        Ok(self.client_sleep(client, THAW, Closure::from(device.0)))
    }

    /// Process runs queued on thawed devices until each is empty or frozen again.
    pub(crate) fn replay_thawed(&mut self) {
        if self.replaying {
            return;
        }
        self.replaying = true;
        while let Some(device) = self.thawed.pop() {
            loop {
                let Some(record) = self.devices.get_mut(device) else {
                    break;
                };
                if record.is_frozen() {
                    break;
                }
                let Some(run) = record.queued.pop_front() else {
                    break;
                };
                self.route_run(device, run, true);
            }
        }
        self.replaying = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dix::event::EventKind;
    use crate::dix::testing::{harness, Harness};
    use pretty_assertions::assert_eq;

    fn press(window: WindowId, button: u8) -> LogicalEvent {
        LogicalEvent::new(window, EventKind::ButtonPress { button })
    }

    #[test]
    fn second_client_cannot_steal_an_active_grab() {
        let Harness { mut server, a, b, w, pointer, .. } = harness();
        let params = GrabParams::new(w, EventMask::BUTTON_PRESS);
        server.grab_device(a, pointer, params.clone()).unwrap();
        assert_eq!(
            server.grab_device(b, pointer, params.clone()),
            Err(GrabError::Refused(GrabRefusal::AlreadyGrabbed))
        );
        let grab = server.devices().get(pointer).and_then(|d| d.grab()).cloned().unwrap();
        assert_eq!(grab.owner, a);

        // the owner may re-grab in place
        server
            .grab_device(a, pointer, GrabParams::new(w, EventMask::POINTER_MOTION))
            .unwrap();
        let grab = server.devices().get(pointer).and_then(|d| d.grab()).cloned().unwrap();
        assert_eq!(grab.event_mask, EventMask::POINTER_MOTION);
    }

    #[test]
    fn pointer_and_keyboard_grabs_are_independent() {
        let Harness { mut server, a, w, pointer, keyboard, .. } = harness();
        server
            .grab_device(a, pointer, GrabParams::new(w, EventMask::BUTTON_PRESS))
            .unwrap();
        server
            .grab_device(a, keyboard, GrabParams::new(w, EventMask::KEY_PRESS))
            .unwrap();
        assert!(server.devices().get(pointer).unwrap().grab().is_some());
        assert!(server.devices().get(keyboard).unwrap().grab().is_some());
    }

    #[test]
    fn grab_time_and_viewability_are_checked() {
        let Harness { mut server, a, w, hidden, pointer, .. } = harness();
        server.advance_time(Timestamp(100));
        let mut params = GrabParams::new(w, EventMask::BUTTON_PRESS);
        params.time = Timestamp(200);
        assert_eq!(
            server.grab_device(a, pointer, params.clone()),
            Err(GrabError::Refused(GrabRefusal::InvalidTime))
        );
        params.time = Timestamp(50);
        server.grab_device(a, pointer, params.clone()).unwrap();
        params.time = Timestamp(40);
        assert_eq!(
            server.grab_device(a, pointer, params),
            Err(GrabError::Refused(GrabRefusal::InvalidTime))
        );
        assert_eq!(
            server.grab_device(a, pointer, GrabParams::new(hidden, EventMask::empty())),
            Err(GrabError::Refused(GrabRefusal::NotViewable))
        );
        let missing = Xid(0x0030_0000);
        assert_eq!(
            server.grab_device(a, pointer, GrabParams::new(missing, EventMask::empty())),
            Err(GrabError::Protocol(DixError::BadWindow(missing)))
        );
    }

    #[test]
    fn ungrab_ignores_non_owners() {
        let Harness { mut server, a, b, w, pointer, .. } = harness();
        server
            .grab_device(a, pointer, GrabParams::new(w, EventMask::BUTTON_PRESS))
            .unwrap();
        server.ungrab_device(b, pointer, Timestamp::CURRENT).unwrap();
        assert!(server.devices().get(pointer).unwrap().grab().is_some());
        server.ungrab_device(a, pointer, Timestamp::CURRENT).unwrap();
        assert!(server.devices().get(pointer).unwrap().grab().is_none());
    }

    #[test]
    fn passive_grabs_match_in_registration_order() {
        let Harness { mut server, a, b, w, child, pointer, .. } = harness();
        server
            .grab_button(a, pointer, 1, ModifierMask::ANY_MODIFIER, GrabParams::new(w, EventMask::BUTTON_PRESS))
            .unwrap();
        // overlapping trigger from another client is refused
        assert_eq!(
            server.grab_button(b, pointer, ANY_DETAIL, ModifierMask::SHIFT, GrabParams::new(w, EventMask::BUTTON_PRESS)),
            Err(DixError::BadAccess)
        );
        server
            .grab_button(b, pointer, 2, ModifierMask::SHIFT, GrabParams::new(w, EventMask::BUTTON_PRESS))
            .unwrap();

        let event = press(child, 2).with_state(ModifierMask::SHIFT);
        let found = server.check_passive_grabs_on_window(w, pointer, &event, false, false);
        assert_eq!(found.map(|g| g.owner), Some(b));
        assert!(server.devices().get(pointer).unwrap().grab().is_none());

        let found = server.check_passive_grabs_on_window(w, pointer, &press(child, 1), false, true);
        assert_eq!(found.as_ref().map(|g| g.origin), Some(GrabOrigin::Passive));
        let active = server.devices().get(pointer).and_then(|d| d.grab()).cloned().unwrap();
        assert_eq!(active.owner, a);
        assert_eq!(active.kind, GrabKind::Active);
    }

    #[test]
    fn ungrab_button_any_clears_every_button() {
        let Harness { mut server, a, w, pointer, .. } = harness();
        for button in 1..=3 {
            server
                .grab_button(a, pointer, button, ModifierMask::empty(), GrabParams::new(w, EventMask::BUTTON_PRESS))
                .unwrap();
        }
        assert_eq!(server.directory().owned_by(a).len(), 3);
        assert_eq!(
            server.ungrab_button(a, pointer, w, ANY_DETAIL, ModifierMask::ANY_MODIFIER),
            Ok(3)
        );
        assert!(server.registry().passive_on(w).is_empty());
        assert!(server.directory().owned_by(a).is_empty());
    }

    #[test]
    fn regrabbing_the_same_trigger_replaces_it() {
        let Harness { mut server, a, w, pointer, .. } = harness();
        let first = server
            .grab_button(a, pointer, 1, ModifierMask::empty(), GrabParams::new(w, EventMask::BUTTON_PRESS))
            .unwrap();
        let second = server
            .grab_button(a, pointer, 1, ModifierMask::empty(), GrabParams::new(w, EventMask::BUTTON_RELEASE))
            .unwrap();
        assert_ne!(first, second);
        assert_eq!(server.registry().passive_on(w).len(), 1);
        assert_eq!(server.directory().lookup_resource(first), None);
    }

    #[test]
    fn interfering_grab_includes_the_paired_device() {
        let Harness { mut server, a, b, w, pointer, keyboard, .. } = harness();
        server
            .grab_device(a, keyboard, GrabParams::new(w, EventMask::KEY_PRESS))
            .unwrap();
        assert!(server.is_interfering_grab(b, pointer));
        assert!(!server.is_interfering_grab(a, pointer));
    }

    #[test]
    fn other_class_sync_freezes_the_paired_device() {
        let Harness { mut server, a, b, w, pointer, keyboard, .. } = harness();
        let mut params = GrabParams::new(w, EventMask::BUTTON_PRESS);
        params.keyboard_mode = GrabMode::Synchronous;
        server.grab_device(a, pointer, params).unwrap();
        assert!(server.devices().get(keyboard).unwrap().is_frozen());
        assert_eq!(
            server.grab_device(b, keyboard, GrabParams::new(w, EventMask::KEY_PRESS)),
            Err(GrabError::Refused(GrabRefusal::Frozen))
        );
        server
            .allow_some(a, keyboard, Timestamp::CURRENT, AllowMode::Async)
            .unwrap();
        assert!(!server.devices().get(keyboard).unwrap().is_frozen());
    }

    #[test]
    fn waiting_client_wakes_on_thaw() {
        let Harness { mut server, a, b, w, pointer, .. } = harness();
        server
            .grab_device(a, pointer, GrabParams::new(w, EventMask::BUTTON_PRESS).synchronous())
            .unwrap();
        assert_eq!(server.wait_for_thaw(b, pointer), Ok(false));

        server.process_input(pointer, press(w, 1).into()).unwrap();
        assert!(server.devices().get(pointer).unwrap().is_frozen());
        assert_eq!(server.wait_for_thaw(b, pointer), Ok(true));
        assert!(server.client_is_asleep(b));

        server
            .allow_some(a, pointer, Timestamp::CURRENT, AllowMode::Discard)
            .unwrap();
        assert_eq!(server.process_work_queue(), vec![b]);
    }

    #[test]
    fn ungrab_key_removes_covered_registrations() {
        let Harness { mut server, a, b, w, keyboard, .. } = harness();
        let params = GrabParams::new(w, EventMask::KEY_PRESS);
        server
            .grab_key(a, keyboard, 38, ModifierMask::ANY_MODIFIER, params.clone())
            .unwrap();
        server
            .grab_key(a, keyboard, 40, ModifierMask::ANY_MODIFIER, params)
            .unwrap();
        assert_eq!(server.registry().passive_on(w).len(), 2);

        assert_eq!(
            server.ungrab_key(a, keyboard, w, 38, ModifierMask::ANY_MODIFIER),
            Ok(1)
        );
        assert_eq!(server.registry().passive_on(w).len(), 1);
        assert_eq!(
            server.ungrab_key(b, keyboard, w, ANY_DETAIL, ModifierMask::ANY_MODIFIER),
            Ok(0)
        );
        assert_eq!(
            server.ungrab_key(a, keyboard, w, ANY_DETAIL, ModifierMask::ANY_MODIFIER),
            Ok(1)
        );
        assert!(server.registry().passive_on(w).is_empty());
    }
}
