//! Logical and Wire Events
//!
//! A [`LogicalEvent`] is a device- or server-originated payload not yet bound
//! to a recipient. The delivery engine switches on [`EventKind`] to pick the
//! filter mask and propagation rule, then stamps a [`WireEvent`] per recipient.

use serde::{Deserialize, Serialize};

use crate::dix::client::ByteOrder;
use crate::dix::flags::{EventMask, ModifierMask};
use crate::dix::grab::Detail;
use crate::dix::resource::{ClientId, WindowId};
use crate::dix::registry::SelectionLevel;

/// Server time in milliseconds. Zero stands for "current time" in requests.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Timestamp(pub u64);

impl Timestamp {
    pub const CURRENT: Timestamp = Timestamp(0);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rect {
    pub x: i16,
    pub y: i16,
    pub width: u16,
    pub height: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StructureKind {
    Create,
    Destroy,
    Map,
    Unmap,
    Configure,
    Reparent,
    /// Redirected map request for a window manager
    MapRequest,
}

/// Category tag the delivery engine switches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventCategory {
    Key,
    Button,
    Motion,
    Valuator,
    Touch,
    Gesture,
    Presence,
    Expose,
    Structure,
    ClientMessage,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    KeyPress { keycode: u8 },
    KeyRelease { keycode: u8 },
    ButtonPress { button: u8 },
    ButtonRelease { button: u8 },
    Motion,
    /// Axis values trailing a motion or button event in the same run
    Valuator { first: u8, values: Vec<i32> },
    TouchBegin { touch_id: u32 },
    TouchUpdate { touch_id: u32 },
    TouchEnd { touch_id: u32 },
    GestureBegin { fingers: u8 },
    GestureUpdate,
    GestureEnd {
        #[serde(default)]
        cancelled: bool,
    },
    DevicePresence { device: u16, added: bool },
    Expose { area: Rect, count: u16 },
    GraphicsExpose { area: Rect, count: u16, major: u8, minor: u16 },
    NoExpose { major: u8, minor: u16 },
    Structure { kind: StructureKind, subject: WindowId },
    ClientMessage { format: u8, data: Vec<u32> },
}

impl EventKind {
    pub fn category(&self) -> EventCategory {
        match self {
            Self::KeyPress { .. } | Self::KeyRelease { .. } => EventCategory::Key,
            Self::ButtonPress { .. } | Self::ButtonRelease { .. } => EventCategory::Button,
            Self::Motion => EventCategory::Motion,
            Self::Valuator { .. } => EventCategory::Valuator,
            Self::TouchBegin { .. } | Self::TouchUpdate { .. } | Self::TouchEnd { .. } => {
                EventCategory::Touch
            }
            Self::GestureBegin { .. } | Self::GestureUpdate | Self::GestureEnd { .. } => {
                EventCategory::Gesture
            }
            Self::DevicePresence { .. } => EventCategory::Presence,
            Self::Expose { .. } | Self::GraphicsExpose { .. } | Self::NoExpose { .. } => {
                EventCategory::Expose
            }
            Self::Structure { .. } => EventCategory::Structure,
            Self::ClientMessage { .. } => EventCategory::ClientMessage,
        }
    }

    /// Selection level a recipient needs to see this kind at all.
    pub fn level(&self) -> SelectionLevel {
        match self.category() {
            EventCategory::Valuator
            | EventCategory::Touch
            | EventCategory::Gesture
            | EventCategory::Presence => SelectionLevel::Extension,
            _ => SelectionLevel::Core,
        }
    }

    pub fn is_press(&self) -> bool {
        matches!(
            self,
            Self::KeyPress { .. } | Self::ButtonPress { .. } | Self::TouchBegin { .. }
        )
    }

    /// Passive-grab trigger detail of a press.
    pub fn press_detail(&self) -> Option<Detail> {
        match *self {
            Self::ButtonPress { button } => Some(Detail::Button(button)),
            Self::KeyPress { keycode } => Some(Detail::Key(keycode)),
            Self::TouchBegin { .. } => Some(Detail::TouchBegin),
            _ => None,
        }
    }

    fn wire_code(&self) -> u8 {
        match self {
            Self::KeyPress { .. } => 2,
            Self::KeyRelease { .. } => 3,
            Self::ButtonPress { .. } => 4,
            Self::ButtonRelease { .. } => 5,
            Self::Motion => 6,
            Self::Expose { .. } => 12,
            Self::GraphicsExpose { .. } => 13,
            Self::NoExpose { .. } => 14,
            Self::Structure { kind, .. } => match kind {
                StructureKind::Create => 16,
                StructureKind::Destroy => 17,
                StructureKind::Unmap => 18,
                StructureKind::Map => 19,
                StructureKind::MapRequest => 20,
                StructureKind::Reparent => 21,
                StructureKind::Configure => 22,
            },
            Self::ClientMessage { .. } => 33,
            // extension events travel as generic events
            _ => 35,
        }
    }

    fn wire_detail(&self) -> u8 {
        match *self {
            Self::KeyPress { keycode } | Self::KeyRelease { keycode } => keycode,
            Self::ButtonPress { button } | Self::ButtonRelease { button } => button,
            Self::ClientMessage { format, .. } => format,
            _ => 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogicalEvent {
    #[serde(default)]
    pub time: Timestamp,
    /// Event window: the natural target, rewritten per level during propagation
    pub window: WindowId,
    #[serde(default)]
    pub root_x: i16,
    #[serde(default)]
    pub root_y: i16,
    /// Modifier and button state before this event
    #[serde(default)]
    pub state: ModifierMask,
    pub kind: EventKind,
}

impl LogicalEvent {
    pub fn new(window: WindowId, kind: EventKind) -> Self {
        Self {
            time: Timestamp::CURRENT,
            window,
            root_x: 0,
            root_y: 0,
            state: ModifierMask::empty(),
            kind,
        }
    }

    pub fn with_state(mut self, state: ModifierMask) -> Self {
        self.state = state;
        self
    }

    pub fn at(mut self, time: Timestamp) -> Self {
        self.time = time;
        self
    }

    /// Selection mask a recipient needs for this event. Empty means the event
    /// cannot be filtered and only reaches the client it is addressed to.
    pub fn filter(&self) -> EventMask {
        match &self.kind {
            EventKind::KeyPress { .. } => EventMask::KEY_PRESS,
            EventKind::KeyRelease { .. } => EventMask::KEY_RELEASE,
            EventKind::ButtonPress { .. } => EventMask::BUTTON_PRESS,
            EventKind::ButtonRelease { .. } => EventMask::BUTTON_RELEASE,
            EventKind::Motion => EventMask::POINTER_MOTION | EventMask::button_motion(self.state),
            EventKind::Valuator { .. } => EventMask::DEVICE_VALUATOR,
            EventKind::TouchBegin { .. }
            | EventKind::TouchUpdate { .. }
            | EventKind::TouchEnd { .. } => EventMask::TOUCH,
            EventKind::GestureBegin { .. }
            | EventKind::GestureUpdate
            | EventKind::GestureEnd { .. } => EventMask::GESTURE,
            EventKind::DevicePresence { .. } => EventMask::DEVICE_PRESENCE,
            EventKind::Expose { .. } => EventMask::EXPOSURE,
            EventKind::Structure { kind: StructureKind::MapRequest, .. } => {
                EventMask::SUBSTRUCTURE_REDIRECT
            }
            EventKind::Structure { subject, .. } if *subject == self.window => {
                EventMask::STRUCTURE_NOTIFY
            }
            EventKind::Structure { .. } => EventMask::SUBSTRUCTURE_NOTIFY,
            EventKind::GraphicsExpose { .. }
            | EventKind::NoExpose { .. }
            | EventKind::ClientMessage { .. } => EventMask::empty(),
        }
    }

    /// Whether delivery continues to ancestors when nobody on the window takes it.
    pub fn propagates(&self) -> bool {
        matches!(
            self.kind.category(),
            EventCategory::Key
                | EventCategory::Button
                | EventCategory::Motion
                | EventCategory::Touch
                | EventCategory::Gesture
        )
    }

    pub fn retarget(&self, window: WindowId) -> Self {
        Self {
            window,
            ..self.clone()
        }
    }
}

/// Events sharing one logical origin, delivered to each client contiguously
/// or not at all. The first member decides filtering and routing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventRun(pub Vec<LogicalEvent>);

impl EventRun {
    pub fn single(event: LogicalEvent) -> Self {
        Self(vec![event])
    }

    pub fn primary(&self) -> Option<&LogicalEvent> {
        self.0.first()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &LogicalEvent> {
        self.0.iter()
    }

    pub fn retarget(&self, window: WindowId) -> Self {
        Self(self.0.iter().map(|e| e.retarget(window)).collect())
    }

    /// Fill in `CURRENT` times with `now`.
    pub(super) fn stamp(&mut self, now: Timestamp) {
        for event in &mut self.0 {
            if event.time == Timestamp::CURRENT {
                event.time = now;
            }
        }
    }

    /// Latest time carried by the run.
    pub fn latest(&self) -> Timestamp {
        self.0.iter().map(|e| e.time).max().unwrap_or_default()
    }
}

impl From<LogicalEvent> for EventRun {
    fn from(event: LogicalEvent) -> Self {
        Self::single(event)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireBody {
    Event(LogicalEvent),
    Error {
        code: u8,
        major: u8,
        minor: u16,
        resource: u32,
    },
}

/// One item sequence-stamped for one client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireEvent {
    pub client: ClientId,
    pub sequence: u16,
    pub byte_order: ByteOrder,
    pub body: WireBody,
}

impl WireEvent {
    pub fn event(&self) -> Option<&LogicalEvent> {
        match &self.body {
            WireBody::Event(event) => Some(event),
            WireBody::Error { .. } => None,
        }
    }

    /// Response type byte; zero for errors.
    pub fn response_type(&self) -> u8 {
        match &self.body {
            WireBody::Event(event) => event.kind.wire_code(),
            WireBody::Error { .. } => 0,
        }
    }

    /// First four bytes of the record in the client's byte order.
    pub fn header(&self) -> [u8; 4] {
        let detail = match &self.body {
            WireBody::Event(event) => event.kind.wire_detail(),
            WireBody::Error { code, .. } => *code,
        };
        let [lo, hi] = self.byte_order.encode_u16(self.sequence);
        [self.response_type(), detail, lo, hi]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dix::resource::Xid;

    #[test]
    fn motion_filter_follows_button_state() {
        let idle = LogicalEvent::new(Xid(1), EventKind::Motion);
        assert_eq!(idle.filter(), EventMask::POINTER_MOTION);

        let dragging = idle.clone().with_state(ModifierMask::BUTTON1);
        assert!(dragging.filter().contains(EventMask::BUTTON1_MOTION));
        assert!(dragging.filter().contains(EventMask::BUTTON_MOTION));
    }

    #[test]
    fn structure_filter_depends_on_recipient() {
        let subject = Xid(0x0020_0001);
        let event = LogicalEvent::new(
            subject,
            EventKind::Structure {
                kind: StructureKind::Map,
                subject,
            },
        );
        assert_eq!(event.filter(), EventMask::STRUCTURE_NOTIFY);
        assert_eq!(event.retarget(Xid(1)).filter(), EventMask::SUBSTRUCTURE_NOTIFY);
    }

    #[test]
    fn header_swaps_sequence_for_big_endian_clients() {
        let wire = WireEvent {
            client: ClientId(1),
            sequence: 0x0102,
            byte_order: ByteOrder::BigEndian,
            body: WireBody::Event(LogicalEvent::new(Xid(1), EventKind::ButtonPress { button: 3 })),
        };
        assert_eq!(wire.header(), [4, 3, 0x01, 0x02]);
        let error = WireEvent {
            byte_order: ByteOrder::LittleEndian,
            body: WireBody::Error {
                code: 3,
                major: 1,
                minor: 0,
                resource: 7,
            },
            ..wire
        };
        assert_eq!(error.header(), [0, 3, 0x02, 0x01]);
    }

    #[test]
    fn run_deserializes_from_script_json() {
        let json = r#"[
            {"window": 1, "kind": {"type": "button_press", "button": 1}},
            {"window": 1, "kind": {"type": "valuator", "first": 0, "values": [3, 4]}}
        ]"#;
        let run: EventRun = serde_json::from_str(json).unwrap();
        assert_eq!(run.len(), 2);
        assert_eq!(
            run.primary().map(|e| e.kind.press_detail()),
            Some(Some(Detail::Button(1)))
        );
    }
}
