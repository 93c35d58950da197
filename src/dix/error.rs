//! Protocol Errors
//!
//! Failures reported synchronously to the request that caused them. None of
//! these are fatal to the server; the offending client gets an error record
//! and every other client is unaffected.

use thiserror::Error;

use crate::dix::device::DeviceId;
use crate::dix::resource::{ClientId, Xid};

/// Core protocol error codes.
pub mod code {
    pub const BAD_VALUE: u8 = 2;
    pub const BAD_WINDOW: u8 = 3;
    pub const BAD_CURSOR: u8 = 6;
    pub const BAD_MATCH: u8 = 8;
    pub const BAD_ACCESS: u8 = 10;
    pub const BAD_ALLOC: u8 = 11;
    pub const BAD_ID_CHOICE: u8 = 14;
    /// First error of the input extension's range
    pub const BAD_DEVICE: u8 = 128;
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DixError {
    #[error("client limit reached")]
    LimitReached,
    #[error("resource id {0} is already in use")]
    IdInUse(Xid),
    #[error("resource id {0} is outside the client's id range")]
    IllegalId(Xid),
    #[error("no such window: {0}")]
    BadWindow(Xid),
    #[error("no such cursor: {0}")]
    BadCursor(Xid),
    #[error("no such device: {0:?}")]
    BadDevice(DeviceId),
    #[error("bad value: {0}")]
    BadValue(u32),
    #[error("unknown client {0:?}")]
    UnknownClient(ClientId),
    #[error("parameter mismatch")]
    BadMatch,
    #[error("access denied")]
    BadAccess,
}

impl DixError {
    /// Numeric error code sent on the wire.
    pub fn code(&self) -> u8 {
        match self {
            Self::LimitReached => code::BAD_ALLOC,
            Self::IdInUse(_) | Self::IllegalId(_) => code::BAD_ID_CHOICE,
            Self::BadWindow(_) => code::BAD_WINDOW,
            Self::BadCursor(_) => code::BAD_CURSOR,
            Self::BadDevice(_) => code::BAD_DEVICE,
            Self::BadValue(_) | Self::UnknownClient(_) => code::BAD_VALUE,
            Self::BadMatch => code::BAD_MATCH,
            Self::BadAccess => code::BAD_ACCESS,
        }
    }

    /// The offending value reported alongside the code.
    pub fn bad_value(&self) -> u32 {
        match self {
            Self::IdInUse(id) | Self::IllegalId(id) | Self::BadWindow(id) | Self::BadCursor(id) => {
                id.0
            }
            Self::BadValue(value) => *value,
            Self::BadDevice(device) => u32::from(device.0),
            Self::UnknownClient(client) => u32::from(client.0),
            Self::LimitReached | Self::BadMatch | Self::BadAccess => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_conflicts_share_the_id_choice_code() {
        assert_eq!(DixError::IdInUse(Xid(5)).code(), code::BAD_ID_CHOICE);
        assert_eq!(DixError::IllegalId(Xid(5)).code(), code::BAD_ID_CHOICE);
        assert_eq!(DixError::IllegalId(Xid(5)).bad_value(), 5);
    }

    #[test]
    fn client_limit_is_an_alloc_failure() {
        assert_eq!(DixError::LimitReached.code(), code::BAD_ALLOC);
        assert_eq!(DixError::LimitReached.to_string(), "client limit reached");
    }
}
