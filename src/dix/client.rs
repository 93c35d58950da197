//! Client Records
//!
//! Per-connection state the input core needs: output sequence counter,
//! connection byte order, dispatch state, owned resources and the save-set.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::dix::resource::{ClientId, Xid};

/// Byte order negotiated at connection setup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ByteOrder {
    #[default]
    LittleEndian,
    BigEndian,
}

impl ByteOrder {
    pub fn native() -> Self {
        if cfg!(target_endian = "big") {
            Self::BigEndian
        } else {
            Self::LittleEndian
        }
    }

    /// Whether values must be swapped before they reach this connection.
    pub fn is_swapped(self) -> bool {
        self != Self::native()
    }

    pub fn encode_u16(self, value: u16) -> [u8; 2] {
        match self {
            Self::LittleEndian => value.to_le_bytes(),
            Self::BigEndian => value.to_be_bytes(),
        }
    }
}

/// Request-dispatch state of a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// Requests are dispatched normally
    Running,
    /// Suspended by the scheduler; events still queue up
    Asleep,
    /// Being torn down; never dispatched again
    CloseDown,
}

/// Whether a save-set request adds or removes a window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SaveSetMode {
    Insert,
    Delete,
}

/// One save-set membership, with what to do when the window is orphaned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SaveSetEntry {
    pub window: Xid,
    /// Reparent to the root instead of the closest surviving ancestor
    pub to_root: bool,
    /// Map the window after it is rescued
    pub map: bool,
}

#[derive(Debug)]
pub struct Client {
    id: ClientId,
    base: Xid,
    byte_order: ByteOrder,
    state: ClientState,
    exception: bool,
    /// Wire items transmitted so far
    sequence: u64,
    next_fake: u32,
    pub(super) owned: BTreeSet<Xid>,
    pub(super) save_set: Vec<SaveSetEntry>,
}

impl Client {
    pub(super) fn new(id: ClientId, base: Xid, byte_order: ByteOrder) -> Self {
        Self {
            id,
            base,
            byte_order,
            state: ClientState::Running,
            exception: false,
            sequence: 0,
            next_fake: 0,
            owned: BTreeSet::new(),
            save_set: Vec::new(),
        }
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    /// First resource id of this client's range.
    pub fn base(&self) -> Xid {
        self.base
    }

    pub fn byte_order(&self) -> ByteOrder {
        self.byte_order
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    /// Number of wire items transmitted to this client.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn save_set(&self) -> &[SaveSetEntry] {
        &self.save_set
    }

    pub fn owned(&self) -> impl Iterator<Item = Xid> + '_ {
        self.owned.iter().copied()
    }

    /// Marked for close-down after a transport failure.
    pub fn has_exception(&self) -> bool {
        self.exception
    }

    /// Whether the dispatch loop may run this client's requests.
    pub fn is_dispatchable(&self) -> bool {
        self.state == ClientState::Running && !self.exception
    }

    /// Whether events may still be written to this client.
    pub fn can_receive(&self) -> bool {
        self.state != ClientState::CloseDown && !self.exception
    }

    /// Wire sequence the `offset`-th item of the next transmission will carry.
    pub(super) fn sequence_for(&self, offset: usize) -> u16 {
        // wraps at 16 bits on the wire
        (self.sequence + 1 + offset as u64) as u16
    }

    pub(super) fn commit_sequence(&mut self, count: usize) {
        self.sequence += count as u64;
    }

    pub(super) fn set_state(&mut self, state: ClientState) {
        self.state = state;
    }

    pub(super) fn mark_exception(&mut self) {
        self.exception = true;
    }

    pub(super) fn take_fake_counter(&mut self) -> u32 {
        let value = self.next_fake;
        self.next_fake = self.next_fake.wrapping_add(1);
        value
    }

    pub(super) fn insert_save_set(&mut self, entry: SaveSetEntry) {
        match self.save_set.iter_mut().find(|e| e.window == entry.window) {
            Some(existing) => *existing = entry,
            None => self.save_set.push(entry),
        }
    }

    pub(super) fn remove_save_set(&mut self, window: Xid) -> bool {
        let before = self.save_set.len();
        self.save_set.retain(|e| e.window != window);
        before != self.save_set.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_wraps_at_sixteen_bits() {
        let mut client = Client::new(ClientId(1), Xid(0x0020_0000), ByteOrder::LittleEndian);
        client.commit_sequence(u16::MAX as usize);
        assert_eq!(client.sequence_for(0), 0);
        assert_eq!(client.sequence_for(1), 1);
        assert_eq!(client.sequence(), u16::MAX as u64);
    }

    #[test]
    fn byte_order_encoding() {
        assert_eq!(ByteOrder::LittleEndian.encode_u16(0x1234), [0x34, 0x12]);
        assert_eq!(ByteOrder::BigEndian.encode_u16(0x1234), [0x12, 0x34]);
        assert_ne!(
            ByteOrder::LittleEndian.is_swapped(),
            ByteOrder::BigEndian.is_swapped()
        );
    }

    #[test]
    fn save_set_insert_replaces_flags() {
        let mut client = Client::new(ClientId(1), Xid(0x0020_0000), ByteOrder::native());
        let window = Xid(0x0040_0001);
        client.insert_save_set(SaveSetEntry { window, to_root: false, map: false });
        client.insert_save_set(SaveSetEntry { window, to_root: true, map: true });
        assert_eq!(client.save_set().len(), 1);
        assert!(client.save_set()[0].to_root);
        assert!(client.remove_save_set(window));
        assert!(!client.remove_save_set(window));
    }
}
