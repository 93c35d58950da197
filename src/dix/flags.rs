//! Event and Modifier Flags
//!
//! Bitfield masks used for event selection, grab filtering and passive-grab
//! triggers, matching the core protocol's bit assignments.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

bitflags! {
    /// Event categories a client can select on a window or forward through a grab.
    ///
    /// Bits 0..=24 are the core protocol masks. Extension categories live above
    /// bit 31 so they can never collide with a core selection.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct EventMask: u64 {
        const KEY_PRESS             = 1 << 0;
        const KEY_RELEASE           = 1 << 1;
        const BUTTON_PRESS          = 1 << 2;
        const BUTTON_RELEASE        = 1 << 3;
        const ENTER_WINDOW          = 1 << 4;
        const LEAVE_WINDOW          = 1 << 5;
        const POINTER_MOTION        = 1 << 6;
        const POINTER_MOTION_HINT   = 1 << 7;
        const BUTTON1_MOTION        = 1 << 8;
        const BUTTON2_MOTION        = 1 << 9;
        const BUTTON3_MOTION        = 1 << 10;
        const BUTTON4_MOTION        = 1 << 11;
        const BUTTON5_MOTION        = 1 << 12;
        const BUTTON_MOTION         = 1 << 13;
        const KEYMAP_STATE          = 1 << 14;
        const EXPOSURE              = 1 << 15;
        const VISIBILITY_CHANGE     = 1 << 16;
        const STRUCTURE_NOTIFY      = 1 << 17;
        const RESIZE_REDIRECT       = 1 << 18;
        const SUBSTRUCTURE_NOTIFY   = 1 << 19;
        const SUBSTRUCTURE_REDIRECT = 1 << 20;
        const FOCUS_CHANGE          = 1 << 21;
        const PROPERTY_CHANGE       = 1 << 22;
        const COLORMAP_CHANGE       = 1 << 23;
        const OWNER_GRAB_BUTTON     = 1 << 24;

        const TOUCH                 = 1 << 32;
        const GESTURE               = 1 << 33;
        const DEVICE_PRESENCE       = 1 << 34;
        const DEVICE_VALUATOR       = 1 << 35;
    }
}

impl EventMask {
    /// Masks only one client at a time may select on a given window.
    pub fn exclusive() -> Self {
        Self::BUTTON_PRESS | Self::SUBSTRUCTURE_REDIRECT | Self::RESIZE_REDIRECT
    }

    /// Masks that may be suppressed from propagating to ancestors.
    pub fn propagate() -> Self {
        Self::KEY_PRESS
            | Self::KEY_RELEASE
            | Self::BUTTON_PRESS
            | Self::BUTTON_RELEASE
            | Self::POINTER_MOTION
            | Self::BUTTON1_MOTION
            | Self::BUTTON2_MOTION
            | Self::BUTTON3_MOTION
            | Self::BUTTON4_MOTION
            | Self::BUTTON5_MOTION
            | Self::BUTTON_MOTION
    }

    /// Motion masks that fire only while the given buttons are held.
    pub fn button_motion(buttons: ModifierMask) -> Self {
        let mut mask = Self::empty();
        if buttons.intersects(ModifierMask::buttons()) {
            mask |= Self::BUTTON_MOTION;
        }
        for (bit, motion) in [
            (ModifierMask::BUTTON1, Self::BUTTON1_MOTION),
            (ModifierMask::BUTTON2, Self::BUTTON2_MOTION),
            (ModifierMask::BUTTON3, Self::BUTTON3_MOTION),
            (ModifierMask::BUTTON4, Self::BUTTON4_MOTION),
            (ModifierMask::BUTTON5, Self::BUTTON5_MOTION),
        ] {
            if buttons.contains(bit) {
                mask |= motion;
            }
        }
        mask
    }
}

bitflags! {
    /// Key and button state carried by device events, and the modifier half
    /// of a passive grab's trigger.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct ModifierMask: u16 {
        const SHIFT        = 1 << 0;
        const LOCK         = 1 << 1;
        const CONTROL      = 1 << 2;
        const MOD1         = 1 << 3;
        const MOD2         = 1 << 4;
        const MOD3         = 1 << 5;
        const MOD4         = 1 << 6;
        const MOD5         = 1 << 7;
        const BUTTON1      = 1 << 8;
        const BUTTON2      = 1 << 9;
        const BUTTON3      = 1 << 10;
        const BUTTON4      = 1 << 11;
        const BUTTON5      = 1 << 12;
        const ANY_MODIFIER = 1 << 15;
    }
}

impl ModifierMask {
    pub fn modifiers() -> Self {
        Self::SHIFT
            | Self::LOCK
            | Self::CONTROL
            | Self::MOD1
            | Self::MOD2
            | Self::MOD3
            | Self::MOD4
            | Self::MOD5
    }

    pub fn buttons() -> Self {
        Self::BUTTON1 | Self::BUTTON2 | Self::BUTTON3 | Self::BUTTON4 | Self::BUTTON5
    }

    /// State bit for a pointer button, if the button has one.
    pub fn for_button(button: u8) -> Self {
        match button {
            1 => Self::BUTTON1,
            2 => Self::BUTTON2,
            3 => Self::BUTTON3,
            4 => Self::BUTTON4,
            5 => Self::BUTTON5,
            _ => Self::empty(),
        }
    }
}
