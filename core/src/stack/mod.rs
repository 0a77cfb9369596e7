#![deny(unsafe_code)]
//! User-space TCP/IP stack adapter (smoltcp)
//!
//! [`IpStack`] runs a smoltcp interface on top of an Ethernet MAC driver and
//! exposes it through [`NetworkInterface`]. Sockets live in a fixed table
//! of [`MAX_SOCKETS`] slots; the slot index is the socket id.
//!
//! # Control blocks
//!
//! All TCP sockets (the "control blocks") are created up front from
//! [`StackResources`] and kept in a pool. `open` takes a fully closed one
//! from the pool, `close` starts a graceful close and returns it; smoltcp
//! finishes the close in the background and the block becomes reusable
//! once it reaches CLOSED.
//!
//! # Driving the stack
//!
//! Nothing happens unless [`IpStack::step`] (or `NetworkInterface::poll`)
//! is called from the main loop. A step services the MAC, runs the stack
//! timers and frame I/O, applies DHCP events, promotes connecting sockets
//! to `Connected` and hands inbound connections to accepting servers.
//!
//! # mDNS
//!
//! With `StackConfig::mdns` set, the stack also runs an mDNS responder
//! on UDP 5353: once the interface has an address it claims
//! `<hostname>.local` and advertises the configured DNS-SD service. See
//! [`IpStack::poll_mdns`].
//!
//! # Example
//!
//! ```ignore
//! static RESOURCES: StaticCell<StackResources> = StaticCell::new();
//!
//! let stack: IpStack<NoopRawMutex, _, _> =
//!     IpStack::new(mac, clock, &StackConfig::default(), RESOURCES.init(StackResources::new()))?;
//!
//! let deadline = stack.dhcp_deadline();
//! while stack.poll_dhcp(&deadline) == WaitStatus::Pending {}
//! ```

mod mdns;
mod slot;

use core::cell::RefCell;

use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::blocking_mutex::Mutex;
use hal_abstractions::{
    Clock, Deadline, Duration, NetworkInterface, Protocol, SocketAddress, SocketError, SocketId,
    WaitStatus,
};
use smoltcp::iface::{Config as IfaceConfig, Interface, SocketHandle, SocketSet, SocketStorage};
use smoltcp::phy::Device;
use smoltcp::socket::{dhcpv4, tcp};
use smoltcp::time::Instant as SmolInstant;
use smoltcp::wire::{EthernetAddress, HardwareAddress, IpAddress, IpCidr, Ipv4Address, Ipv4Cidr};

use crate::config::{Ipv4Mode, StackConfig, MAX_SOCKETS};

pub use mdns::HostLabel;
use mdns::{Mdns, MdnsBuffers};
pub use slot::SlotState;
use slot::{Slot, SlotTable};

/// First port of the dynamic range used for outbound connections
const EPHEMERAL_START: u16 = 49152;

/// Ethernet MAC driver usable by [`IpStack`]
///
/// Frame transmit and receive go through the `smoltcp::phy::Device`
/// tokens. `step` is called once per stack step before any frames are
/// exchanged, for drivers that need to service the hardware.
pub trait EthernetMac: Device {
    fn step(&mut self) -> Result<(), SocketError> {
        Ok(())
    }
}

/// Memory for one [`IpStack`]: socket storage plus per-socket buffers
///
/// `BUF` is the size of each TCP receive and transmit buffer in bytes.
pub struct StackResources<const BUF: usize = 2048> {
    // TCP sockets, DHCP and mDNS
    sockets: [SocketStorage<'static>; MAX_SOCKETS + 2],
    rx: [[u8; BUF]; MAX_SOCKETS],
    tx: [[u8; BUF]; MAX_SOCKETS],
    mdns: MdnsBuffers,
}

impl<const BUF: usize> StackResources<BUF> {
    pub const fn new() -> Self {
        Self {
            sockets: [SocketStorage::EMPTY; MAX_SOCKETS + 2],
            rx: [[0; BUF]; MAX_SOCKETS],
            tx: [[0; BUF]; MAX_SOCKETS],
            mdns: MdnsBuffers::new(),
        }
    }
}

impl<const BUF: usize> Default for StackResources<BUF> {
    fn default() -> Self {
        Self::new()
    }
}

struct Inner<D> {
    mac: D,
    iface: Interface,
    sockets: SocketSet<'static>,
    slots: SlotTable,
    /// Control blocks not owned by any slot
    pool: heapless::Vec<SocketHandle, MAX_SOCKETS>,
    dhcp: Option<SocketHandle>,
    mdns: Option<Mdns>,
    next_port: u16,
}

/// smoltcp-backed socket backend
pub struct IpStack<M: RawMutex, D, C> {
    inner: Mutex<M, RefCell<Inner<D>>>,
    clock: C,
    dhcp_timeout: Duration,
}

impl<M: RawMutex, D: EthernetMac, C: Clock> IpStack<M, D, C> {
    /// Bring up the interface on `mac`
    ///
    /// With `Ipv4Mode::Static` the address and default route are applied
    /// immediately. With `Ipv4Mode::Dhcp` a DHCP client is started and the
    /// interface has no address until a lease arrives (see
    /// [`poll_dhcp`](Self::poll_dhcp)).
    pub fn new<const BUF: usize>(
        mut mac: D,
        clock: C,
        config: &StackConfig,
        resources: &'static mut StackResources<BUF>,
    ) -> Result<Self, SocketError> {
        let now = timestamp(&clock);

        let mut iface_config =
            IfaceConfig::new(HardwareAddress::Ethernet(EthernetAddress(config.hwaddr)));
        iface_config.random_seed = config.seed;
        let mut iface = Interface::new(iface_config, &mut mac, now);

        let StackResources {
            sockets: storage,
            rx,
            tx,
            mdns: mdns_buffers,
        } = resources;
        let mut sockets = SocketSet::new(&mut storage[..]);
        let mut pool = heapless::Vec::new();
        for (rx, tx) in rx.iter_mut().zip(tx.iter_mut()) {
            let socket = tcp::Socket::new(
                tcp::SocketBuffer::new(&mut rx[..]),
                tcp::SocketBuffer::new(&mut tx[..]),
            );
            let handle = sockets.add(socket);
            pool.push(handle).map_err(|_| SocketError::NoMemory)?;
        }

        let dhcp = match config.ipv4 {
            Ipv4Mode::Static {
                address,
                prefix_len,
                gateway,
            } => {
                let [a, b, c, d] = address;
                let cidr = Ipv4Cidr::new(Ipv4Address::new(a, b, c, d), prefix_len);
                let gateway = gateway.map(|[a, b, c, d]| Ipv4Address::new(a, b, c, d));
                set_ipv4(&mut iface, cidr, gateway);
                info!("Static IPv4 configuration: {}", cidr);
                None
            }
            Ipv4Mode::Dhcp => {
                info!("Starting DHCP client");
                Some(sockets.add(dhcpv4::Socket::new()))
            }
        };

        let mdns = match config.mdns {
            Some(mdns_config) => {
                let mut socket = mdns_buffers.socket();
                socket
                    .bind(mdns::MDNS_PORT)
                    .map_err(|_| SocketError::InvalidArgument)?;
                socket.set_hop_limit(Some(255));
                let [a, b, c, d] = mdns::MDNS_GROUP;
                if iface
                    .join_multicast_group(Ipv4Address::new(a, b, c, d))
                    .is_err()
                {
                    warn!("mDNS: cannot join the multicast group");
                }
                info!("mDNS responder for {}.local", mdns_config.hostname);
                Some(Mdns::new(sockets.add(socket), mdns_config))
            }
            None => None,
        };

        let span = u64::from(u16::MAX - EPHEMERAL_START) + 1;
        let next_port = EPHEMERAL_START + (config.seed % span) as u16;

        info!(
            "IP stack ready: {} sockets, {} byte buffers",
            MAX_SOCKETS, BUF
        );

        Ok(Self {
            inner: Mutex::new(RefCell::new(Inner {
                mac,
                iface,
                sockets,
                slots: SlotTable::new(),
                pool,
                dhcp,
                mdns,
                next_port,
            })),
            clock,
            dhcp_timeout: config.dhcp_timeout,
        })
    }

    /// Tear the stack down and hand the MAC driver back
    pub fn remove(self) -> D {
        info!("IP stack removed");
        self.inner.into_inner().into_inner().mac
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    /// Run one iteration of the stack
    pub fn step(&self) -> Result<(), SocketError> {
        self.with(|inner, now| inner.step(now))
    }

    /// Deadline for the DHCP wait, from the configured timeout
    pub fn dhcp_deadline(&self) -> Deadline {
        Deadline::after(&self.clock, self.dhcp_timeout)
    }

    /// Step the stack and report whether an IPv4 address is configured
    pub fn poll_dhcp(&self, deadline: &Deadline) -> WaitStatus {
        if let Err(e) = self.step() {
            warn!("Stack step failed while waiting for DHCP: {}", e);
        }
        let status = WaitStatus::check(self.ipv4_address().is_some(), deadline, &self.clock);
        if status == WaitStatus::TimedOut {
            error!("DHCP timed out, no address assigned");
        }
        status
    }

    /// Current IPv4 address, if any
    pub fn ipv4_address(&self) -> Option<[u8; 4]> {
        self.inner
            .lock(|cell| cell.borrow().iface.ipv4_addr().map(|addr| addr.octets()))
    }

    /// Step the stack and report whether the mDNS host name is claimed
    ///
    /// Never ready when the stack runs without a responder.
    pub fn poll_mdns(&self, deadline: &Deadline) -> WaitStatus {
        if let Err(e) = self.step() {
            warn!("Stack step failed while claiming the mDNS name: {}", e);
        }
        WaitStatus::check(self.mdns_hostname().is_some(), deadline, &self.clock)
    }

    /// Host label claimed over mDNS, without the `.local` suffix
    pub fn mdns_hostname(&self) -> Option<HostLabel> {
        self.inner.lock(|cell| {
            cell.borrow()
                .mdns
                .as_ref()
                .and_then(|mdns| mdns.hostname().cloned())
        })
    }

    /// State of socket `id`
    pub fn state(&self, id: SocketId) -> Result<SlotState, SocketError> {
        self.with(|inner, _| inner.slots.get(id).map(|slot| slot.state))
    }

    /// Local port of socket `id`; 0 if not yet bound or connected
    pub fn local_port(&self, id: SocketId) -> Result<u16, SocketError> {
        self.with(|inner, _| inner.slots.get(id).map(|slot| slot.local_port))
    }

    fn with<R>(
        &self,
        f: impl FnOnce(&mut Inner<D>, SmolInstant) -> Result<R, SocketError>,
    ) -> Result<R, SocketError> {
        let now = timestamp(&self.clock);
        self.inner.lock(|cell| f(&mut cell.borrow_mut(), now))
    }
}

fn timestamp<C: Clock>(clock: &C) -> SmolInstant {
    let millis = i64::try_from(clock.now().ticks()).unwrap_or(i64::MAX);
    SmolInstant::from_millis(millis)
}

fn set_ipv4(iface: &mut Interface, cidr: Ipv4Cidr, gateway: Option<Ipv4Address>) {
    iface.update_ip_addrs(|addrs| {
        addrs.clear();
        let _ = addrs.push(IpCidr::Ipv4(cidr));
    });
    match gateway {
        Some(gateway) => {
            if iface.routes_mut().add_default_ipv4_route(gateway).is_err() {
                warn!("Route table full, no default gateway");
            }
        }
        None => {
            iface.routes_mut().remove_default_ipv4_route();
        }
    }
}

impl<D: EthernetMac> Inner<D> {
    fn tcp(&mut self, handle: SocketHandle) -> &mut tcp::Socket<'static> {
        self.sockets.get_mut::<tcp::Socket>(handle)
    }

    fn poll_iface(&mut self, now: SmolInstant) {
        self.iface.poll(now, &mut self.mac, &mut self.sockets);
    }

    fn step(&mut self, now: SmolInstant) -> Result<(), SocketError> {
        self.mac.step()?;
        self.poll_iface(now);
        self.apply_dhcp();
        if let Some(mdns) = self.mdns.as_mut() {
            if mdns.step(&self.iface, &mut self.sockets, now) {
                self.poll_iface(now);
            }
        }
        self.update_connecting();
        self.dispatch_inbound();
        Ok(())
    }

    fn apply_dhcp(&mut self) {
        let Some(handle) = self.dhcp else {
            return;
        };
        let lease = match self.sockets.get_mut::<dhcpv4::Socket>(handle).poll() {
            Some(dhcpv4::Event::Configured(config)) => Some((config.address, config.router)),
            Some(dhcpv4::Event::Deconfigured) => None,
            None => return,
        };

        match lease {
            Some((cidr, router)) => {
                info!("DHCP lease: {}", cidr);
                set_ipv4(&mut self.iface, cidr, router);
            }
            None => {
                warn!("DHCP lease lost");
                self.iface.update_ip_addrs(|addrs| addrs.clear());
                self.iface.routes_mut().remove_default_ipv4_route();
            }
        }
    }

    /// Established-connection events for outbound sockets
    fn update_connecting(&mut self) {
        for id in 0..MAX_SOCKETS as SocketId {
            let Ok(slot) = self.slots.get_mut(id) else {
                continue;
            };
            let (SlotState::Connecting, Some(pcb)) = (slot.state, slot.pcb) else {
                continue;
            };
            match self.sockets.get::<tcp::Socket>(pcb).state() {
                tcp::State::Established | tcp::State::CloseWait => {
                    slot.state = SlotState::Connected;
                    info!("Socket {} connected", id);
                }
                tcp::State::Closed | tcp::State::TimeWait => {
                    slot.state = SlotState::Closed;
                    warn!("Socket {} connection failed", id);
                }
                _ => {}
            }
        }
    }

    /// Accepted-connection events for servers in `Accepting`
    fn dispatch_inbound(&mut self) {
        for server in 0..MAX_SOCKETS as SocketId {
            let Ok(slot) = self.slots.get(server) else {
                continue;
            };
            let (SlotState::Accepting, Some(pcb)) = (slot.state, slot.pcb) else {
                continue;
            };
            let (port, backlog) = (slot.local_port, slot.backlog);

            match self.sockets.get::<tcp::Socket>(pcb).state() {
                tcp::State::Established | tcp::State::CloseWait => {}
                tcp::State::Closed => {
                    self.relisten(pcb, port);
                    continue;
                }
                _ => continue,
            }

            if backlog > 0 && self.slots.waiting_children(server).count() >= backlog as usize {
                continue;
            }
            self.hand_over(server, pcb, port);
        }
    }

    /// Move the connection on a server's control block into a new slot
    /// and let the server listen on a fresh block
    fn hand_over(&mut self, server: SocketId, connected: SocketHandle, port: u16) {
        let (child, fresh) = match (self.slots.find_free(), self.take_closed_pcb()) {
            (Ok(child), Some(fresh)) => (child, fresh),
            (_, fresh) => {
                if let Some(fresh) = fresh {
                    self.give_back(fresh);
                }
                warn!(
                    "No resources for inbound connection on port {}, dropping it",
                    port
                );
                self.tcp(connected).abort();
                self.relisten(connected, port);
                return;
            }
        };

        if self.tcp(fresh).listen(port).is_err() {
            error!("Cannot re-listen on port {}", port);
            self.give_back(fresh);
            return;
        }

        self.tcp(connected).set_nagle_enabled(false);
        self.slots.set(
            child,
            Slot {
                state: SlotState::WaitingAccept,
                pcb: Some(connected),
                parent: Some(server),
                local_port: port,
                backlog: 0,
            },
        );
        if let Ok(slot) = self.slots.get_mut(server) {
            slot.pcb = Some(fresh);
        }
        debug!(
            "Inbound connection on port {} parked in socket {}",
            port, child
        );
    }

    fn relisten(&mut self, pcb: SocketHandle, port: u16) {
        if self.tcp(pcb).listen(port).is_err() {
            error!("Cannot re-listen on port {}", port);
        }
    }

    fn take_closed_pcb(&mut self) -> Option<SocketHandle> {
        let idx = self
            .pool
            .iter()
            .position(|handle| !self.sockets.get::<tcp::Socket>(*handle).is_open())?;
        Some(self.pool.swap_remove(idx))
    }

    fn give_back(&mut self, pcb: SocketHandle) {
        if self.pool.push(pcb).is_err() {
            error!("TCP control block pool overflow");
        }
    }

    fn ephemeral_port(&mut self) -> u16 {
        let port = self.next_port;
        self.next_port = port.checked_add(1).unwrap_or(EPHEMERAL_START);
        port
    }

    fn open(&mut self, protocol: Protocol, buff_size: u32) -> Result<SocketId, SocketError> {
        if protocol != Protocol::Tcp {
            return Err(SocketError::ProtocolNotSupported);
        }

        let id = self.slots.find_free().map_err(|e| {
            warn!("All {} sockets in use", MAX_SOCKETS);
            e
        })?;
        let pcb = self.take_closed_pcb().ok_or_else(|| {
            warn!("No closed TCP control block available");
            SocketError::NoMemory
        })?;

        let socket = self.tcp(pcb);
        socket.set_nagle_enabled(true);
        socket.set_timeout(None);
        socket.set_keep_alive(None);
        if buff_size as usize > socket.recv_capacity() {
            debug!(
                "Socket buffers are {} bytes, {} requested",
                socket.recv_capacity(),
                buff_size
            );
        }

        self.slots.set(
            id,
            Slot {
                pcb: Some(pcb),
                ..Slot::EMPTY
            },
        );
        debug!("Socket {} opened", id);
        Ok(id)
    }

    fn close(&mut self, id: SocketId, now: SmolInstant) -> Result<(), SocketError> {
        let slot = *self.slots.get(id)?;

        if slot.is_server() {
            let orphans: heapless::Vec<SocketId, MAX_SOCKETS> =
                self.slots.waiting_children(id).collect();
            for child in orphans {
                if let Some(pcb) = self.slots.get(child).ok().and_then(|c| c.pcb) {
                    self.tcp(pcb).abort();
                    self.give_back(pcb);
                }
                self.slots.release(child);
                debug!("Released unaccepted socket {}", child);
            }
        }

        if let Some(pcb) = slot.pcb {
            self.tcp(pcb).close();
            self.give_back(pcb);
        }
        self.slots.release(id);
        self.poll_iface(now);

        debug!("Socket {} closed", id);
        Ok(())
    }

    fn connect(
        &mut self,
        id: SocketId,
        addr: &SocketAddress,
        now: SmolInstant,
    ) -> Result<(), SocketError> {
        let slot = *self.slots.get(id)?;
        if slot.state != SlotState::Closed {
            return Err(SocketError::InvalidArgument);
        }
        let pcb = slot.pcb.ok_or(SocketError::NotFound)?;
        let local_port = match slot.local_port {
            0 => self.ephemeral_port(),
            port => port,
        };

        let [a, b, c, d] = addr.octets;
        let remote = (IpAddress::v4(a, b, c, d), addr.port);
        self.sockets
            .get_mut::<tcp::Socket>(pcb)
            .connect(self.iface.context(), remote, local_port)
            .map_err(|e| {
                warn!("Socket {} cannot connect to {}", id, addr);
                match e {
                    // No local address yet
                    tcp::ConnectError::Unaddressable => SocketError::NotConnected,
                    _ => SocketError::InvalidArgument,
                }
            })?;

        let slot = self.slots.get_mut(id)?;
        slot.state = SlotState::Connecting;
        slot.local_port = local_port;
        debug!("Socket {} connecting to {} from port {}", id, addr, local_port);

        self.poll_iface(now);
        Ok(())
    }

    fn disconnect(&mut self, id: SocketId, now: SmolInstant) -> Result<(), SocketError> {
        let slot = self.slots.get_mut(id)?;
        if !matches!(slot.state, SlotState::Connected | SlotState::Connecting) {
            return Err(SocketError::NotConnected);
        }
        // The control block stays with the slot until `close`
        slot.state = SlotState::Closed;
        if let Some(pcb) = slot.pcb {
            self.tcp(pcb).close();
        }
        self.poll_iface(now);
        debug!("Socket {} disconnected", id);
        Ok(())
    }

    /// Usable control block of a connected socket
    fn connected_pcb(&self, id: SocketId) -> Result<SocketHandle, SocketError> {
        let slot = self.slots.get(id)?;
        match slot.state {
            SlotState::Connected => slot.pcb.ok_or(SocketError::NotConnected),
            SlotState::Connecting => Err(SocketError::WouldBlock),
            _ => Err(SocketError::NotConnected),
        }
    }

    fn peer_gone(&mut self, id: SocketId) -> SocketError {
        if let Ok(slot) = self.slots.get_mut(id) {
            slot.state = SlotState::Closed;
        }
        debug!("Socket {} closed by peer", id);
        SocketError::NotConnected
    }

    fn send(&mut self, id: SocketId, data: &[u8], now: SmolInstant) -> Result<usize, SocketError> {
        let pcb = self.connected_pcb(id)?;
        if data.is_empty() {
            return Ok(0);
        }

        let socket = self.tcp(pcb);
        if !socket.may_send() {
            return Err(self.peer_gone(id));
        }
        let avail = socket.send_capacity() - socket.send_queue();
        if avail == 0 {
            return Err(SocketError::WouldBlock);
        }

        let len = avail.min(data.len());
        let written = match socket.send_slice(&data[..len]) {
            Ok(n) => n,
            Err(_) => return Err(self.peer_gone(id)),
        };

        if written == data.len() {
            self.poll_iface(now);
        } else {
            // More data coming, leave it for the next step
            trace!("Socket {} partial write {}/{}", id, written, data.len());
        }
        Ok(written)
    }

    fn recv(&mut self, id: SocketId, buf: &mut [u8]) -> Result<usize, SocketError> {
        let pcb = self.connected_pcb(id)?;
        if buf.is_empty() {
            return Ok(0);
        }

        match self.tcp(pcb).recv_slice(buf) {
            Ok(0) => Err(SocketError::WouldBlock),
            Ok(n) => Ok(n),
            // Finished or reset
            Err(_) => Err(self.peer_gone(id)),
        }
    }

    fn bind(&mut self, id: SocketId, port: u16) -> Result<(), SocketError> {
        let slot = self.slots.get(id)?;
        if slot.state != SlotState::Closed {
            return Err(SocketError::InvalidArgument);
        }
        if port != 0 && self.slots.port_in_use(port, id) {
            warn!("Port {} already has a listener", port);
            return Err(SocketError::AddressInUse);
        }
        self.slots.get_mut(id)?.local_port = port;
        Ok(())
    }

    fn listen(&mut self, id: SocketId, backlog: u32) -> Result<(), SocketError> {
        let slot = *self.slots.get(id)?;
        if slot.state != SlotState::Closed || slot.local_port == 0 {
            return Err(SocketError::InvalidArgument);
        }
        let pcb = slot.pcb.ok_or(SocketError::NotFound)?;
        self.tcp(pcb)
            .listen(slot.local_port)
            .map_err(|_| SocketError::InvalidArgument)?;

        let slot = self.slots.get_mut(id)?;
        slot.state = SlotState::Listening;
        slot.backlog = backlog;
        info!("Socket {} listening on port {}", id, slot.local_port);
        Ok(())
    }

    fn accept(&mut self, id: SocketId) -> Result<SocketId, SocketError> {
        let slot = self.slots.get_mut(id)?;
        match slot.state {
            SlotState::Listening => {
                slot.state = SlotState::Accepting;
                debug!("Socket {} accepting", id);
                return Err(SocketError::WouldBlock);
            }
            SlotState::Accepting => {}
            _ => return Err(SocketError::InvalidArgument),
        }

        let child = self
            .slots
            .waiting_children(id)
            .next()
            .ok_or(SocketError::WouldBlock)?;
        let slot = self.slots.get_mut(child)?;
        slot.state = SlotState::Connected;
        slot.parent = None;
        info!("Socket {} accepted connection {}", id, child);
        Ok(child)
    }
}

impl<M: RawMutex, D: EthernetMac, C: Clock> NetworkInterface for IpStack<M, D, C> {
    fn open(&self, protocol: Protocol, buff_size: u32) -> Result<SocketId, SocketError> {
        self.with(|inner, _| inner.open(protocol, buff_size))
    }

    fn close(&self, id: SocketId) -> Result<(), SocketError> {
        self.with(|inner, now| inner.close(id, now))
    }

    fn connect(&self, id: SocketId, addr: &SocketAddress) -> Result<(), SocketError> {
        self.with(|inner, now| inner.connect(id, addr, now))
    }

    fn disconnect(&self, id: SocketId) -> Result<(), SocketError> {
        self.with(|inner, now| inner.disconnect(id, now))
    }

    fn send(&self, id: SocketId, data: &[u8]) -> Result<usize, SocketError> {
        self.with(|inner, now| inner.send(id, data, now))
    }

    fn recv(&self, id: SocketId, buf: &mut [u8]) -> Result<usize, SocketError> {
        self.with(|inner, _| inner.recv(id, buf))
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
        self.with(|inner, _| inner.bind(id, port))
    }

    fn listen(&self, id: SocketId, backlog: u32) -> Result<(), SocketError> {
        self.with(|inner, _| inner.listen(id, backlog))
    }

    fn accept(&self, id: SocketId) -> Result<SocketId, SocketError> {
        self.with(|inner, _| inner.accept(id))
    }

    fn poll(&self) -> Result<(), SocketError> {
        self.step()
    }
}
