#![deny(unsafe_code)]
//! Connection slot table
//!
//! One fixed table per stack instance. The slot index is the socket id.
//! A slot is free only while it is `Closed` *and* holds no TCP handle;
//! `open` reserves a slot by giving it a handle, so a freshly opened
//! socket is `Closed` but taken.

use hal_abstractions::{SocketError, SocketId};
use smoltcp::iface::SocketHandle;

use crate::config::MAX_SOCKETS;

/// Adapter-level socket state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SlotState {
    Closed,
    /// `connect` issued, waiting for the handshake
    Connecting,
    Listening,
    /// `accept` has been called; inbound connections are dispatched
    Accepting,
    /// Inbound connection parked until the server's next `accept`
    WaitingAccept,
    Connected,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Slot {
    pub state: SlotState,
    pub pcb: Option<SocketHandle>,
    /// Server a `WaitingAccept` slot belongs to
    pub parent: Option<SocketId>,
    pub local_port: u16,
    /// Most not-yet-accepted children; 0 is unbounded
    pub backlog: u32,
}

impl Slot {
    pub const EMPTY: Self = Self {
        state: SlotState::Closed,
        pcb: None,
        parent: None,
        local_port: 0,
        backlog: 0,
    };

    pub fn is_free(&self) -> bool {
        self.state == SlotState::Closed && self.pcb.is_none()
    }

    /// Listening socket, whether or not `accept` has been called yet
    pub fn is_server(&self) -> bool {
        matches!(self.state, SlotState::Listening | SlotState::Accepting)
    }
}

pub(crate) struct SlotTable {
    slots: [Slot; MAX_SOCKETS],
}

impl SlotTable {
    pub const fn new() -> Self {
        Self {
            slots: [Slot::EMPTY; MAX_SOCKETS],
        }
    }

    /// Lowest free slot
    pub fn find_free(&self) -> Result<SocketId, SocketError> {
        self.slots
            .iter()
            .position(Slot::is_free)
            .map(|idx| idx as SocketId)
            .ok_or(SocketError::NoFreeSocket)
    }

    /// Slot of a reserved socket
    pub fn get(&self, id: SocketId) -> Result<&Slot, SocketError> {
        match self.slots.get(id as usize) {
            Some(slot) if !slot.is_free() => Ok(slot),
            Some(_) => Err(SocketError::NotFound),
            None => Err(SocketError::InvalidArgument),
        }
    }

    pub fn get_mut(&mut self, id: SocketId) -> Result<&mut Slot, SocketError> {
        match self.slots.get_mut(id as usize) {
            Some(slot) if !slot.is_free() => Ok(slot),
            Some(_) => Err(SocketError::NotFound),
            None => Err(SocketError::InvalidArgument),
        }
    }

    /// Overwrite slot `id`, reserved or not
    pub fn set(&mut self, id: SocketId, slot: Slot) {
        self.slots[id as usize] = slot;
    }

    pub fn release(&mut self, id: SocketId) {
        self.slots[id as usize] = Slot::EMPTY;
    }

    pub fn iter(&self) -> impl Iterator<Item = (SocketId, &Slot)> {
        self.slots
            .iter()
            .enumerate()
            .map(|(idx, slot)| (idx as SocketId, slot))
    }

    /// Children of `server` not yet handed out by `accept`
    pub fn waiting_children(&self, server: SocketId) -> impl Iterator<Item = SocketId> + '_ {
        self.iter()
            .filter(move |(_, s)| s.state == SlotState::WaitingAccept && s.parent == Some(server))
            .map(|(id, _)| id)
    }

    /// Another server already owns `port`
    pub fn port_in_use(&self, port: u16, except: SocketId) -> bool {
        self.iter()
            .any(|(id, s)| id != except && s.is_server() && s.local_port == port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smoltcp::iface::{SocketSet, SocketStorage};
    use smoltcp::socket::tcp;

    fn handles(n: usize) -> std::vec::Vec<SocketHandle> {
        let storage = std::boxed::Box::leak(std::boxed::Box::new(
            [SocketStorage::EMPTY; MAX_SOCKETS],
        ));
        let mut set = SocketSet::new(&mut storage[..n]);
        (0..n)
            .map(|_| {
                let rx = std::boxed::Box::leak(std::vec![0u8; 64].into_boxed_slice());
                let tx = std::boxed::Box::leak(std::vec![0u8; 64].into_boxed_slice());
                set.add(tcp::Socket::new(
                    tcp::SocketBuffer::new(&mut rx[..]),
                    tcp::SocketBuffer::new(&mut tx[..]),
                ))
            })
            .collect()
    }

    #[test]
    fn test_reserved_slot_is_not_free() {
        let pcbs = handles(2);
        let mut table = SlotTable::new();
        assert_eq!(table.find_free(), Ok(0));

        table.set(
            0,
            Slot {
                pcb: Some(pcbs[0]),
                ..Slot::EMPTY
            },
        );
        assert_eq!(table.find_free(), Ok(1));
        assert_eq!(table.get(0).map(|s| s.state), Ok(SlotState::Closed));
        assert_eq!(table.get(1).err(), Some(SocketError::NotFound));
        assert_eq!(
            table.get(MAX_SOCKETS as SocketId).err(),
            Some(SocketError::InvalidArgument)
        );

        table.release(0);
        assert_eq!(table.find_free(), Ok(0));
    }

    #[test]
    fn test_table_full() {
        let pcbs = handles(MAX_SOCKETS);
        let mut table = SlotTable::new();
        for (id, pcb) in pcbs.iter().enumerate() {
            table.set(
                id as SocketId,
                Slot {
                    pcb: Some(*pcb),
                    ..Slot::EMPTY
                },
            );
        }
        assert_eq!(table.find_free(), Err(SocketError::NoFreeSocket));
    }

    #[test]
    fn test_waiting_children_and_ports() {
        let pcbs = handles(3);
        let mut table = SlotTable::new();
        table.set(
            0,
            Slot {
                state: SlotState::Accepting,
                pcb: Some(pcbs[0]),
                local_port: 10000,
                ..Slot::EMPTY
            },
        );
        for id in 1..3 {
            table.set(
                id,
                Slot {
                    state: SlotState::WaitingAccept,
                    pcb: Some(pcbs[id as usize]),
                    parent: Some(0),
                    local_port: 10000,
                    ..Slot::EMPTY
                },
            );
        }

        assert_eq!(table.waiting_children(0).count(), 2);
        assert_eq!(table.waiting_children(1).count(), 0);
        assert!(table.port_in_use(10000, 5));
        assert!(!table.port_in_use(10000, 0));
        assert!(!table.port_in_use(8080, 5));
    }
}
