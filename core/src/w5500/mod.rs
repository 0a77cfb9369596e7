#![deny(unsafe_code)]
//! W5500 offload socket backend
//!
//! The W5500 runs TCP itself and exposes a handful of physical socket
//! channels. This backend virtualises them: every open socket gets a
//! virtual id from an ever-increasing counter, and a small map table ties
//! each live virtual id to one physical channel. Ids are looked up by
//! linear scan; a stale id yields `SocketError::NotFound`.
//!
//! # Accept
//!
//! On an inbound connection the chip moves the *listening* channel itself
//! to ESTABLISHED instead of handing out a new channel. `accept` restores
//! the usual semantics: it arms a spare channel as the new listener under
//! the server's virtual id, and gives the original channel a fresh virtual
//! id as the accepted client.
//!
//! The map table and the chip sit behind one blocking mutex and every
//! operation runs inside a single lock, so the role swap is never
//! observable half-done, even with callers in interrupt context.

pub mod chip;

use core::cell::RefCell;

use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::blocking_mutex::Mutex;
use hal_abstractions::{NetworkInterface, Protocol, SocketAddress, SocketError, SocketId};

use crate::config::{W5500Config, MAX_CHANNELS};

pub use chip::{BufferSize, ChannelStatus, SocketChip};

/// What a mapped channel is used for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Role {
    /// Opened, neither connecting nor listening yet
    Unused,
    Server,
    Client,
}

#[derive(Debug, Clone, Copy)]
struct MapEntry {
    physical: u8,
    virtual_id: SocketId,
    in_use: bool,
    role: Role,
    buf: BufferSize,
    local_port: u16,
    remote: Option<SocketAddress>,
}

impl MapEntry {
    const fn free(physical: u8) -> Self {
        Self {
            physical,
            virtual_id: 0,
            in_use: false,
            role: Role::Unused,
            buf: BufferSize::Kb2,
            local_port: 0,
            remote: None,
        }
    }
}

struct Inner<C> {
    chip: C,
    map: [MapEntry; MAX_CHANNELS],
    next_id: SocketId,
}

/// Socket backend on a W5500-class offload engine
pub struct W5500Network<M: RawMutex, C> {
    inner: Mutex<M, RefCell<Inner<C>>>,
}

impl<M: RawMutex, C: SocketChip> W5500Network<M, C> {
    /// Configure the chip and build an empty map table
    pub fn new(mut chip: C, config: &W5500Config) -> Result<Self, SocketError> {
        chip.configure(config).map_err(|e| {
            error!("W5500 configuration failed: {}", e);
            e
        })?;

        let mut map = [MapEntry::free(0); MAX_CHANNELS];
        for (physical, entry) in map.iter_mut().enumerate() {
            entry.physical = physical as u8;
        }

        info!("W5500 backend ready, {} channels", MAX_CHANNELS);

        Ok(Self {
            inner: Mutex::new(RefCell::new(Inner {
                chip,
                map,
                next_id: 0,
            })),
        })
    }

    /// Tear the backend down and hand the chip back
    pub fn remove(self) -> C {
        self.inner.into_inner().into_inner().chip
    }

    pub fn link_up(&self) -> Result<bool, SocketError> {
        self.with(|inner| inner.chip.link_up())
    }

    /// Role of the channel behind `id`
    pub fn role(&self, id: SocketId) -> Result<Role, SocketError> {
        self.with(|inner| Ok(inner.map[inner.lookup(id)?].role))
    }

    /// Physical channel behind `id`
    pub fn channel(&self, id: SocketId) -> Result<u8, SocketError> {
        self.with(|inner| Ok(inner.map[inner.lookup(id)?].physical))
    }

    /// Peer of a connected or accepted socket
    pub fn remote(&self, id: SocketId) -> Result<Option<SocketAddress>, SocketError> {
        self.with(|inner| Ok(inner.map[inner.lookup(id)?].remote))
    }

    fn with<R>(
        &self,
        f: impl FnOnce(&mut Inner<C>) -> Result<R, SocketError>,
    ) -> Result<R, SocketError> {
        self.inner.lock(|cell| f(&mut cell.borrow_mut()))
    }
}

impl<C: SocketChip> Inner<C> {
    fn lookup(&self, id: SocketId) -> Result<usize, SocketError> {
        self.map
            .iter()
            .position(|e| e.in_use && e.virtual_id == id)
            .ok_or_else(|| {
                warn!("W5500: no channel mapped to socket {}", id);
                SocketError::NotFound
            })
    }

    fn free_entry(&self) -> Result<usize, SocketError> {
        self.map.iter().position(|e| !e.in_use).ok_or_else(|| {
            warn!("W5500: all {} channels in use", MAX_CHANNELS);
            SocketError::NoFreeSocket
        })
    }

    /// Next virtual id, skipping any still live after a wrap
    fn alloc_id(&mut self) -> SocketId {
        loop {
            let id = self.next_id;
            self.next_id = self.next_id.wrapping_add(1);
            if !self.map.iter().any(|e| e.in_use && e.virtual_id == id) {
                return id;
            }
        }
    }

    fn arm_listener(&mut self, channel: u8, buf: BufferSize, port: u16) -> Result<(), SocketError> {
        self.chip.open(channel, buf)?;
        self.chip.bind(channel, port)?;
        self.chip.listen(channel)
    }

    fn open(&mut self, protocol: Protocol, buff_size: u32) -> Result<SocketId, SocketError> {
        if protocol != Protocol::Tcp {
            return Err(SocketError::ProtocolNotSupported);
        }

        let idx = self.free_entry()?;
        let physical = self.map[idx].physical;
        let buf = BufferSize::for_request(buff_size);
        self.chip.open(physical, buf)?;

        let id = self.alloc_id();
        self.map[idx] = MapEntry {
            physical,
            virtual_id: id,
            in_use: true,
            role: Role::Unused,
            buf,
            local_port: 0,
            remote: None,
        };

        debug!(
            "W5500: socket {} on channel {} ({} KB)",
            id,
            physical,
            buf.kb()
        );
        Ok(id)
    }

    fn close(&mut self, id: SocketId) -> Result<(), SocketError> {
        let idx = self.lookup(id)?;
        let physical = self.map[idx].physical;
        // The mapping goes away even if the command fails
        self.map[idx] = MapEntry::free(physical);
        debug!("W5500: socket {} closed, channel {} free", id, physical);
        self.chip.close(physical)
    }

    fn accept(&mut self, id: SocketId) -> Result<SocketId, SocketError> {
        let server = self.lookup(id)?;
        let entry = self.map[server];
        if entry.role != Role::Server {
            return Err(SocketError::InvalidArgument);
        }

        match self.chip.status(entry.physical)? {
            status if status.is_connected() => self.swap_roles(server),
            ChannelStatus::Closed => {
                warn!("W5500: listener {} dropped, re-arming", id);
                self.arm_listener(entry.physical, entry.buf, entry.local_port)?;
                Err(SocketError::WouldBlock)
            }
            _ => Err(SocketError::WouldBlock),
        }
    }

    /// Move the server role to a spare channel and hand out the connected
    /// channel as a new client
    fn swap_roles(&mut self, server: usize) -> Result<SocketId, SocketError> {
        let entry = self.map[server];
        let spare = self.free_entry()?;
        let spare_channel = self.map[spare].physical;

        if let Err(e) = self.arm_listener(spare_channel, entry.buf, entry.local_port) {
            error!(
                "W5500: re-arming listener on channel {} failed: {}",
                spare_channel, e
            );
            let _ = self.chip.close(spare_channel);
            return Err(e);
        }

        let remote = self.chip.remote_endpoint(entry.physical).ok();
        let client_id = self.alloc_id();

        self.map[spare] = MapEntry {
            physical: spare_channel,
            remote: None,
            ..entry
        };
        self.map[server] = MapEntry {
            virtual_id: client_id,
            role: Role::Client,
            remote,
            ..entry
        };

        info!(
            "W5500: accepted socket {} on channel {}, listener {} moved to channel {}",
            client_id, entry.physical, entry.virtual_id, spare_channel
        );
        Ok(client_id)
    }
}

impl<M: RawMutex, C: SocketChip> NetworkInterface for W5500Network<M, C> {
    fn open(&self, protocol: Protocol, buff_size: u32) -> Result<SocketId, SocketError> {
        self.with(|inner| inner.open(protocol, buff_size))
    }

    fn close(&self, id: SocketId) -> Result<(), SocketError> {
        self.with(|inner| inner.close(id))
    }

    fn connect(&self, id: SocketId, addr: &SocketAddress) -> Result<(), SocketError> {
        self.with(|inner| {
            let idx = inner.lookup(id)?;
            inner.chip.connect(inner.map[idx].physical, addr)?;
            let entry = &mut inner.map[idx];
            entry.role = Role::Client;
            entry.remote = Some(*addr);
            Ok(())
        })
    }

    fn disconnect(&self, id: SocketId) -> Result<(), SocketError> {
        self.with(|inner| {
            let idx = inner.lookup(id)?;
            inner.chip.disconnect(inner.map[idx].physical)
        })
    }

    fn send(&self, id: SocketId, data: &[u8]) -> Result<usize, SocketError> {
        self.with(|inner| {
            let idx = inner.lookup(id)?;
            inner.chip.send(inner.map[idx].physical, data)
        })
    }

    fn recv(&self, id: SocketId, buf: &mut [u8]) -> Result<usize, SocketError> {
        self.with(|inner| {
            let idx = inner.lookup(id)?;
            if buf.is_empty() {
                return Ok(0);
            }
            inner.chip.recv(inner.map[idx].physical, buf)
        })
    }

    fn send_to(
        &self,
        _id: SocketId,
        _data: &[u8],
        _to: &SocketAddress,
    ) -> Result<usize, SocketError> {
        Err(SocketError::NotImplemented)
    }

    fn recv_from(
        &self,
        _id: SocketId,
        _buf: &mut [u8],
    ) -> Result<(usize, SocketAddress), SocketError> {
        Err(SocketError::NotImplemented)
    }

    fn bind(&self, id: SocketId, port: u16) -> Result<(), SocketError> {
        self.with(|inner| {
            let idx = inner.lookup(id)?;
            inner.chip.bind(inner.map[idx].physical, port)?;
            inner.map[idx].local_port = port;
            Ok(())
        })
    }

    fn listen(&self, id: SocketId, backlog: u32) -> Result<(), SocketError> {
        self.with(|inner| {
            let idx = inner.lookup(id)?;
            inner.chip.listen(inner.map[idx].physical)?;
            inner.map[idx].role = Role::Server;
            // One pending connection per channel, whatever the backlog
            debug!("W5500: socket {} listening (backlog {})", id, backlog);
            Ok(())
        })
    }

    fn accept(&self, id: SocketId) -> Result<SocketId, SocketError> {
        self.with(|inner| inner.accept(id))
    }
}
