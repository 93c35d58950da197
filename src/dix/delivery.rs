//! Event Delivery Engine
//!
//! Routes a run of logical events from a device to the clients that should
//! see it: frozen devices queue, touch and gesture streams stick to their
//! owner, an active grab restricts delivery to its owner, a press may
//! activate a passive grab, and everything else propagates up the hierarchy
//! from the event window until some client takes it.

use tracing::{debug, warn};

use crate::dix::Server;
use crate::dix::device::{ContactOwner, DeviceId, Focus, InputClass};
use crate::dix::error::DixError;
use crate::dix::event::{
    EventKind, EventRun, LogicalEvent, Rect, StructureKind, Timestamp, WireBody, WireEvent,
};
use crate::dix::flags::{EventMask, ModifierMask};
use crate::dix::grab::{Detail, Grab, GrabKind, GrabLevel, GrabMode, GrabOrigin, GrabTrigger};
use crate::dix::registry::SelectionLevel;
use crate::dix::resource::{ClientId, WindowId};
use crate::dix::sink::Access;

/// Result of routing one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Number of clients that received the run
    Delivered(usize),
    /// No interested client; not an error
    NoMatch,
    /// A client with authority over the event refused it
    Rejected,
    /// Held by a synchronous grab until the owner allows events
    Frozen,
    /// The device was already frozen; the run waits its turn
    Queued,
}

impl DeliveryOutcome {
    pub fn delivered(self) -> usize {
        match self {
            Self::Delivered(count) => count,
            _ => 0,
        }
    }

    pub fn is_delivered(self) -> bool {
        self.delivered() > 0
    }
}

/// Outcome of offering a run to one client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Attempt {
    Sent,
    NoMatch,
    Rejected,
}

/// Which contact stream of a device a run belongs to.
/// Where a propagating run stopped and who it reached there.
struct Walk {
    outcome: DeliveryOutcome,
    window: Option<WindowId>,
    recipients: Vec<ClientId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Contact {
    Touch(u32),
    Gesture,
}

impl Server {
    /// Top-level entry for a device's events.
    pub fn process_input(
        &mut self,
        device: DeviceId,
        mut run: EventRun,
    ) -> Result<DeliveryOutcome, DixError> {
        if self.devices.get(device).is_none() {
            return Err(DixError::BadDevice(device));
        }
        if run.is_empty() {
            return Ok(DeliveryOutcome::NoMatch);
        }
        run.stamp(self.now);
        self.now = self.now.max(run.latest());
        // Runs still queued from an earlier freeze go out first.
        if self.devices.get(device).is_some_and(|d| d.queued_runs() > 0) {
            self.thawed.push(device);
            self.replay_thawed();
        }
        let outcome = self.route_run(device, run, true);
        self.replay_thawed();
        Ok(outcome)
    }

    /// Route one run, queueing it when the device is frozen or still holds
    /// older runs. Passive grab activation is skipped for runs released from
    /// a grab.
    pub(crate) fn route_run(
        &mut self,
        device: DeviceId,
        run: EventRun,
        allow_passive: bool,
    ) -> DeliveryOutcome {
        let Some(primary) = run.primary().cloned() else {
            return DeliveryOutcome::NoMatch;
        };
        let max_queued = self.options.max_queued_events;
        let Some(record) = self.devices.get_mut(device) else {
            return DeliveryOutcome::NoMatch;
        };
        // A run released from a freeze predates anything queued behind it.
        let backlog = allow_passive && !self.replaying && !record.queued.is_empty();
        if record.is_frozen() || backlog {
            if record.queued.len() >= max_queued {
                warn!(device = ?device, max_queued, "frozen device queue full, dropping run");
                return DeliveryOutcome::NoMatch;
            }
            record.queued.push_back(run);
            return DeliveryOutcome::Queued;
        }

        match primary.kind {
            EventKind::ButtonPress { button } => {
                record.buttons_down |= ModifierMask::for_button(button);
            }
            EventKind::ButtonRelease { button } => {
                record.buttons_down -= ModifierMask::for_button(button);
            }
            EventKind::KeyPress { keycode } => {
                record.keys_down.insert(keycode);
            }
            EventKind::KeyRelease { keycode } => {
                record.keys_down.remove(&keycode);
            }
            _ => {}
        }

        let outcome = match primary.kind {
            EventKind::TouchBegin { touch_id }
            | EventKind::TouchUpdate { touch_id }
            | EventKind::TouchEnd { touch_id } => {
                self.route_contact(device, Contact::Touch(touch_id), &run, allow_passive)
            }
            EventKind::GestureBegin { .. } | EventKind::GestureUpdate | EventKind::GestureEnd { .. } => {
                self.route_contact(device, Contact::Gesture, &run, allow_passive)
            }
            _ => self.route_device_run(device, &run, allow_passive),
        };
        if outcome != DeliveryOutcome::Frozen {
            self.release_after(device, &run);
        }
        outcome
    }

    fn route_device_run(
        &mut self,
        device: DeviceId,
        run: &EventRun,
        allow_passive: bool,
    ) -> DeliveryOutcome {
        let Some(primary) = run.primary().cloned() else {
            return DeliveryOutcome::NoMatch;
        };
        let Some(record) = self.devices.get(device) else {
            return DeliveryOutcome::NoMatch;
        };
        if let Some(grab) = record.grab().cloned() {
            return self.deliver_grabbed(device, &grab, run);
        }

        let (start, stop_at) = if record.class() == InputClass::Keyboard {
            match self.focus_target(device, &primary) {
                Some(target) => target,
                None => return DeliveryOutcome::NoMatch,
            }
        } else {
            (primary.window, None)
        };

        if allow_passive && primary.kind.is_press() {
            if let Some(grab) = self.check_device_grabs(device, &primary, start, true) {
                return self.deliver_grabbed(device, &grab, run);
            }
        }
        self.deliver_device_events(device, start, run, stop_at).0
    }

    /// Where a keyboard run starts and where its propagation stops.
    fn focus_target(
        &self,
        device: DeviceId,
        event: &LogicalEvent,
    ) -> Option<(WindowId, Option<WindowId>)> {
        match self.devices.get(device)?.focus() {
            Focus::None => None,
            Focus::PointerRoot => Some((event.window, None)),
            Focus::Window(focus) => {
                if event.window == focus || self.tree.ancestor_of(focus, event.window) {
                    Some((event.window, Some(focus)))
                } else {
                    Some((focus, Some(focus)))
                }
            }
        }
    }

    /// Search passive grabs from the root down to `target`; the outermost
    /// window's grab wins.
    fn check_device_grabs(
        &mut self,
        device: DeviceId,
        event: &LogicalEvent,
        target: WindowId,
        activate: bool,
    ) -> Option<Grab> {
        let mut chain = vec![target];
        let mut current = self.tree.parent(target);
        while let Some(w) = current {
            chain.push(w);
            current = self.tree.parent(w);
        }
        chain.into_iter().rev().find_map(|w| {
            let here = event.retarget(w);
            self.check_passive_grabs_on_window(w, device, &here, false, activate)
        })
    }

    /// Deliver through an active grab, freezing the device instead when the
    /// grab is synchronous for this device's class.
    fn deliver_grabbed(&mut self, device: DeviceId, grab: &Grab, run: &EventRun) -> DeliveryOutcome {
        let (Some(primary), Some(record)) = (run.primary(), self.devices.get(device)) else {
            return DeliveryOutcome::NoMatch;
        };
        let class = record.class();
        if grab.mode_for(class) == GrabMode::Synchronous && grab.wants(primary.filter()) {
            self.freeze(device, run.clone());
            return DeliveryOutcome::Frozen;
        }
        self.deliver_to_grab(device, grab, run)
    }

    /// Hand a run to the grab owner. With owner-events the run first takes
    /// its natural path, and the owner gets it at the grab window only if
    /// that path did not already reach it.
    pub(crate) fn deliver_to_grab(
        &mut self,
        device: DeviceId,
        grab: &Grab,
        run: &EventRun,
    ) -> DeliveryOutcome {
        let Some(primary) = run.primary() else {
            return DeliveryOutcome::NoMatch;
        };
        let filter = primary.filter();
        let mut delivered = 0;
        let mut owner_reached = false;

        if grab.owner_events {
            let walk = self.walk_device_events(device, primary.window, run, None);
            delivered += walk.outcome.delivered();
            owner_reached = walk.recipients.contains(&grab.owner);
        }

        if !owner_reached && grab.wants(filter) {
            let here = run.retarget(grab.window);
            if self.gate_allows(grab.owner, grab.window, primary) {
                let attempt = self.try_client_events(grab.owner, &here, grab.event_mask, filter, None);
                if attempt == Attempt::Sent {
                    delivered += 1;
                }
            }
        }

        if delivered > 0 {
            DeliveryOutcome::Delivered(delivered)
        } else {
            DeliveryOutcome::NoMatch
        }
    }

    /// Deactivate a passive or implicit grab whose trigger has been released.
    pub(crate) fn release_after(&mut self, device: DeviceId, run: &EventRun) {
        let Some(primary) = run.primary() else {
            return;
        };
        let Some(record) = self.devices.get(device) else {
            return;
        };
        let Some(grab) = record.grab() else {
            return;
        };
        if grab.origin == GrabOrigin::Explicit {
            return;
        }
        let done = match primary.kind {
            EventKind::ButtonRelease { .. } => !record.buttons_down.intersects(ModifierMask::buttons()),
            EventKind::KeyRelease { keycode } => {
                record.keys_down.is_empty()
                    || grab.trigger.is_some_and(|t| t.detail == Detail::Key(keycode))
            }
            _ => false,
        };
        if done {
            debug!(device = ?device, origin = ?grab.origin, "trigger released, ending grab");
            self.deactivate_grab(device);
        }
    }

    /// Walk from `start` toward the root until a window delivers or refuses
    /// the run. Returns the outcome and the window that decided it.
    pub fn deliver_device_events(
        &mut self,
        device: DeviceId,
        start: WindowId,
        run: &EventRun,
        stop_at: Option<WindowId>,
    ) -> (DeliveryOutcome, Option<WindowId>) {
        let walk = self.walk_device_events(device, start, run, stop_at);
        (walk.outcome, walk.window)
    }

    fn walk_device_events(
        &mut self,
        device: DeviceId,
        start: WindowId,
        run: &EventRun,
        stop_at: Option<WindowId>,
    ) -> Walk {
        let mut walk = Walk {
            outcome: DeliveryOutcome::NoMatch,
            window: None,
            recipients: Vec::new(),
        };
        let Some(primary) = run.primary() else {
            return walk;
        };
        let filter = primary.filter();
        let propagates = primary.propagates();
        let mut window = Some(start);
        while let Some(w) = window {
            let here = run.retarget(w);
            let (outcome, recipients) = self.offer_to_window(Some(device), w, &here, filter, None);
            if matches!(outcome, DeliveryOutcome::Delivered(_) | DeliveryOutcome::Rejected) {
                walk.outcome = outcome;
                walk.window = Some(w);
                walk.recipients = recipients;
                return walk;
            }
            if !propagates || Some(w) == stop_at {
                break;
            }
            let suppressed = self
                .registry
                .window(w)
                .is_some_and(|events| events.dont_propagate_mask().intersects(filter));
            if suppressed {
                break;
            }
            window = self.tree.parent(w);
        }
        walk
    }

    /// Candidate recipients on `window` for events of `level`: the window's
    /// owner first, then other clients in selection order.
    fn candidates(&self, window: WindowId, level: SelectionLevel) -> Vec<(ClientId, EventMask)> {
        let Some(events) = self.registry.window(window) else {
            return Vec::new();
        };
        let owner = self.directory.client_for_window(window);
        let mut found: Vec<(ClientId, EventMask)> = Vec::new();
        for selection in &events.selections {
            if found.iter().any(|(c, _)| *c == selection.client) {
                continue;
            }
            let mask = events.mask_for(selection.client, level);
            if !mask.is_empty() {
                found.push((selection.client, mask));
            }
        }
        found.sort_by_key(|(client, _)| Some(*client) != owner);
        found
    }

    /// Offer a run to every interested client on one window. With `grab`,
    /// clients other than its owner refuse.
    pub fn deliver_events_to_window(
        &mut self,
        device: Option<DeviceId>,
        window: WindowId,
        run: &EventRun,
        filter: EventMask,
        grab: Option<&Grab>,
    ) -> DeliveryOutcome {
        self.offer_to_window(device, window, run, filter, grab).0
    }

    /// Same as [`Server::deliver_events_to_window`], also naming the clients
    /// that were sent the run.
    fn offer_to_window(
        &mut self,
        device: Option<DeviceId>,
        window: WindowId,
        run: &EventRun,
        filter: EventMask,
        grab: Option<&Grab>,
    ) -> (DeliveryOutcome, Vec<ClientId>) {
        let mut recipients = Vec::new();
        let Some(primary) = run.primary() else {
            return (DeliveryOutcome::NoMatch, recipients);
        };
        let all = self
            .registry
            .window(window)
            .map(|events| events.all_event_masks())
            .unwrap_or_default();
        if !filter.is_empty() && !all.intersects(filter) {
            return (DeliveryOutcome::NoMatch, recipients);
        }

        let mut rejected = false;
        let mut first_recipient = None;
        for (client, mask) in self.candidates(window, primary.kind.level()) {
            if !filter.is_empty() && !mask.intersects(filter) {
                continue;
            }
            if !self.gate_allows(client, window, primary) {
                continue;
            }
            match self.try_client_events(client, run, mask, filter, grab) {
                Attempt::Sent => {
                    recipients.push(client);
                    if first_recipient.is_none() {
                        first_recipient = Some((client, mask));
                    }
                }
                Attempt::Rejected => rejected = true,
                Attempt::NoMatch => {}
            }
        }

        if let (Some(device), Some((client, mask)), None) = (device, first_recipient, grab) {
            self.maybe_activate_implicit_grab(device, window, primary, client, mask);
        }

        let outcome = if !recipients.is_empty() {
            DeliveryOutcome::Delivered(recipients.len())
        } else if rejected {
            DeliveryOutcome::Rejected
        } else {
            DeliveryOutcome::NoMatch
        };
        (outcome, recipients)
    }

    /// A button press delivered with no grab in place grabs the pointer for
    /// the recipient until every button is up.
    fn maybe_activate_implicit_grab(
        &mut self,
        device: DeviceId,
        window: WindowId,
        event: &LogicalEvent,
        client: ClientId,
        mask: EventMask,
    ) {
        let EventKind::ButtonPress { button } = event.kind else {
            return;
        };
        if !self.options.implicit_grabs {
            return;
        }
        let Some(record) = self.devices.get(device) else {
            return;
        };
        if record.class() != InputClass::Pointer || record.grab().is_some() {
            return;
        }
        let grab = Grab {
            resource: None,
            owner: client,
            device,
            kind: GrabKind::Active,
            window,
            confine_to: None,
            cursor: None,
            event_mask: mask,
            owner_events: mask.contains(EventMask::OWNER_GRAB_BUTTON),
            pointer_mode: GrabMode::Asynchronous,
            keyboard_mode: GrabMode::Asynchronous,
            level: GrabLevel::Core,
            trigger: Some(GrabTrigger {
                detail: Detail::Button(button),
                modifiers: event.state & ModifierMask::modifiers(),
            }),
            activated: event.time,
            origin: GrabOrigin::Implicit,
        };
        self.activate_grab(device, grab);
    }

    /// Offer a run to one client. A mask match is required unless the event
    /// cannot be filtered; a grab held by another client turns the match
    /// into a refusal.
    fn try_client_events(
        &mut self,
        client: ClientId,
        run: &EventRun,
        mask: EventMask,
        filter: EventMask,
        grab: Option<&Grab>,
    ) -> Attempt {
        let Some(record) = self.directory.client(client) else {
            self.inconsistencies += 1;
            warn!(client = ?client, "registration outlived its client");
            return Attempt::NoMatch;
        };
        if !record.can_receive() {
            return Attempt::NoMatch;
        }
        if !filter.is_empty() && !mask.intersects(filter) {
            return Attempt::NoMatch;
        }
        if grab.is_some_and(|g| g.owner != client) {
            return Attempt::Rejected;
        }
        let bodies = run.iter().cloned().map(WireBody::Event).collect();
        if self.transmit(client, bodies) {
            Attempt::Sent
        } else {
            Attempt::NoMatch
        }
    }

    fn gate_allows(&self, client: ClientId, window: WindowId, event: &LogicalEvent) -> bool {
        match self.gate.check_delivery(client, window, event) {
            Access::Allow => true,
            Access::Deny => {
                debug!(client = ?client, window = %window, "delivery denied by access gate");
                false
            }
        }
    }

    /// Stamp and hand off a run of wire items. A transport failure marks the
    /// client for close-down and leaves its sequence counter alone.
    fn transmit(&mut self, client: ClientId, bodies: Vec<WireBody>) -> bool {
        let Some(record) = self.directory.client(client) else {
            return false;
        };
        let byte_order = record.byte_order();
        let wire: Vec<WireEvent> = bodies
            .into_iter()
            .enumerate()
            .map(|(i, body)| WireEvent {
                client,
                sequence: record.sequence_for(i),
                byte_order,
                body,
            })
            .collect();
        match self.sink.send(client, &wire) {
            Ok(()) => {
                if let Some(record) = self.directory.client_mut(client) {
                    record.commit_sequence(wire.len());
                }
                true
            }
            Err(err) => {
                warn!(client = ?client, error = %err, "transport failure");
                self.mark_client_exception(client);
                false
            }
        }
    }

    fn route_contact(
        &mut self,
        device: DeviceId,
        contact: Contact,
        run: &EventRun,
        allow_passive: bool,
    ) -> DeliveryOutcome {
        let Some(primary) = run.primary().cloned() else {
            return DeliveryOutcome::NoMatch;
        };
        let begins = matches!(
            primary.kind,
            EventKind::TouchBegin { .. } | EventKind::GestureBegin { .. }
        );
        let ends = matches!(
            primary.kind,
            EventKind::TouchEnd { .. } | EventKind::GestureEnd { .. }
        );

        let outcome = if begins {
            self.begin_contact(device, contact, &primary, run, allow_passive)
        } else {
            match self.contact_owner(device, contact) {
                Some(owner) => self.deliver_to_contact_owner(device, owner, run),
                None => DeliveryOutcome::NoMatch,
            }
        };
        if ends {
            self.set_contact_owner(device, contact, None);
        }
        outcome
    }

    /// Pick the owner of a new contact: the device's grab, a passive touch
    /// grab on the ancestry, or the first window that takes the begin event.
    fn begin_contact(
        &mut self,
        device: DeviceId,
        contact: Contact,
        primary: &LogicalEvent,
        run: &EventRun,
        allow_passive: bool,
    ) -> DeliveryOutcome {
        let grabbed = self.devices.get(device).and_then(|d| d.grab()).cloned();
        let grab = match grabbed {
            Some(grab) => Some(grab),
            None if allow_passive && contact != Contact::Gesture => {
                self.check_device_grabs(device, primary, primary.window, false)
            }
            None => None,
        };
        if let Some(grab) = grab {
            let owner = ContactOwner::Grab {
                client: grab.owner,
                window: grab.window,
            };
            self.set_contact_owner(device, contact, Some(owner));
            return self.deliver_to_contact_owner(device, owner, run);
        }

        let (outcome, window) = self.deliver_device_events(device, primary.window, run, None);
        if let (DeliveryOutcome::Delivered(_), Some(window)) = (outcome, window) {
            self.set_contact_owner(device, contact, Some(ContactOwner::Window(window)));
        }
        outcome
    }

    fn deliver_to_contact_owner(
        &mut self,
        device: DeviceId,
        owner: ContactOwner,
        run: &EventRun,
    ) -> DeliveryOutcome {
        let Some(primary) = run.primary() else {
            return DeliveryOutcome::NoMatch;
        };
        let filter = primary.filter();
        match owner {
            ContactOwner::Grab { client, window } => {
                let here = run.retarget(window);
                if !self.gate_allows(client, window, primary) {
                    return DeliveryOutcome::NoMatch;
                }
                match self.try_client_events(client, &here, filter, filter, None) {
                    Attempt::Sent => DeliveryOutcome::Delivered(1),
                    _ => DeliveryOutcome::NoMatch,
                }
            }
            ContactOwner::Window(window) => {
                let here = run.retarget(window);
                self.deliver_events_to_window(Some(device), window, &here, filter, None)
            }
        }
    }

    fn contact_owner(&self, device: DeviceId, contact: Contact) -> Option<ContactOwner> {
        let record = self.devices.get(device)?;
        match contact {
            Contact::Touch(id) => record.contact_owner(id),
            Contact::Gesture => record.gesture_owner(),
        }
    }

    fn set_contact_owner(&mut self, device: DeviceId, contact: Contact, owner: Option<ContactOwner>) {
        let Some(record) = self.devices.get_mut(device) else {
            return;
        };
        match (contact, owner) {
            (Contact::Touch(id), Some(owner)) => {
                record.touches.insert(id, owner);
            }
            (Contact::Touch(id), None) => {
                record.touches.remove(&id);
            }
            (Contact::Gesture, owner) => record.gesture = owner,
        }
    }

    /// Deliver to the first client on `window` other than `skip` whose mask
    /// matches `filter`. Returns that client if the run reached it.
    pub fn maybe_deliver_event_to_client(
        &mut self,
        window: WindowId,
        run: &EventRun,
        filter: EventMask,
        skip: Option<ClientId>,
    ) -> Option<ClientId> {
        let primary = run.primary()?;
        let (client, mask) = self
            .candidates(window, primary.kind.level())
            .into_iter()
            .filter(|(client, _)| Some(*client) != skip)
            .find(|(_, mask)| mask.intersects(filter))?;
        if !self.gate_allows(client, window, primary) {
            return None;
        }
        match self.try_client_events(client, run, mask, filter, None) {
            Attempt::Sent => Some(client),
            _ => None,
        }
    }

    /// Structure notification: to the window itself, to its parent as
    /// substructure, and to the previous parent of a reparented window.
    /// Returns the number of deliveries.
    pub fn deliver_structure(
        &mut self,
        window: WindowId,
        kind: StructureKind,
        other_parent: Option<WindowId>,
    ) -> usize {
        let event = LogicalEvent::new(
            window,
            EventKind::Structure {
                kind,
                subject: window,
            },
        )
        .at(self.now);
        let run = EventRun::single(event);
        let mut count = self
            .deliver_events_to_window(None, window, &run, EventMask::STRUCTURE_NOTIFY, None)
            .delivered();
        let parent = self.tree.parent(window);
        let mut targets: Vec<WindowId> = parent.into_iter().collect();
        if kind == StructureKind::Reparent {
            targets.extend(other_parent.filter(|p| Some(*p) != parent));
        }
        for target in targets {
            count += self
                .deliver_events_to_window(
                    None,
                    target,
                    &run.retarget(target),
                    EventMask::SUBSTRUCTURE_NOTIFY,
                    None,
                )
                .delivered();
        }
        count
    }

    /// Report exposed regions of a copy. An empty or missing region sends a
    /// single `NoExpose`.
    pub fn send_graphics_expose(
        &mut self,
        client: ClientId,
        rects: Option<&[Rect]>,
        drawable: WindowId,
        major: u8,
        minor: u16,
    ) -> bool {
        let now = self.now;
        let bodies: Vec<WireBody> = match rects {
            Some(rects) if !rects.is_empty() => rects
                .iter()
                .enumerate()
                .map(|(i, area)| {
                    let count = (rects.len() - 1 - i) as u16;
                    let kind = EventKind::GraphicsExpose {
                        area: *area,
                        count,
                        major,
                        minor,
                    };
                    WireBody::Event(LogicalEvent::new(drawable, kind).at(now))
                })
                .collect(),
            _ => vec![WireBody::Event(
                LogicalEvent::new(drawable, EventKind::NoExpose { major, minor }).at(now),
            )],
        };
        self.transmit(client, bodies)
    }

    /// Transmit an error record, sequence-stamped like an event.
    pub fn send_error(&mut self, client: ClientId, major: u8, minor: u16, resource: u32, code: u8) -> bool {
        debug!(client = ?client, major, code, resource, "sending error");
        self.transmit(
            client,
            vec![WireBody::Error {
                code,
                major,
                minor,
                resource,
            }],
        )
    }

    pub fn send_dix_error(&mut self, client: ClientId, major: u8, error: &DixError) -> bool {
        self.send_error(client, major, 0, error.bad_value(), error.code())
    }

    /// Move a keyboard's focus. Ignored when `time` is stale.
    pub fn set_input_focus(
        &mut self,
        client: ClientId,
        device: DeviceId,
        focus: Focus,
        time: Timestamp,
    ) -> Result<(), DixError> {
        let time = self.resolve_time(time);
        let record = self.device_or_err(device)?;
        if record.class() != InputClass::Keyboard {
            return Err(DixError::BadMatch);
        }
        if let Focus::Window(window) = focus {
            if !self.tree.contains(window) {
                return Err(DixError::BadWindow(window));
            }
            if !self.tree.is_viewable(window) {
                return Err(DixError::BadMatch);
            }
        }
        if time > self.now || time < record.focus_time {
            debug!(device = ?device, client = ?client, "ignoring stale focus change");
            return Ok(());
        }
        if let Some(record) = self.devices.get_mut(device) {
            record.focus = focus;
            record.focus_time = time;
        }
        debug!(device = ?device, client = ?client, ?focus, "input focus set");
        Ok(())
    }
}
