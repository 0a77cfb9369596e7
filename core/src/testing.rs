//! Test doubles: a hand-driven clock, a fake RNG, a scripted network and
//! an in-memory Ethernet wire
//!
//! Built for the crate's own unit tests and, with feature `testing`, for
//! integration tests and downstream firmware tests on the host.

use core::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;
use std::vec::Vec;

use hal_abstractions::{
    Clock, Instant, NetworkInterface, Protocol, SocketAddress, SocketError, SocketId, Trng,
};
use smoltcp::phy::{Device, DeviceCapabilities, Medium, RxToken, TxToken};
use smoltcp::time::Instant as SmolInstant;

use crate::stack::EthernetMac;

/// Clock that only moves when told to
pub struct ManualClock {
    now: Cell<u64>,
    tick: u64,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::ticking(0)
    }

    /// Clock that also moves `tick` ms every time it is read
    pub fn ticking(tick: u64) -> Self {
        Self {
            now: Cell::new(0),
            tick,
        }
    }

    pub fn advance(&self, ms: u64) {
        self.now.set(self.now.get() + ms);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        let now = self.now.get();
        self.now.set(now + self.tick);
        Instant::from_ticks(now)
    }
}

/// Deterministic random source
#[derive(Default)]
pub struct CounterTrng {
    next: u8,
    broken: bool,
}

impl CounterTrng {
    pub fn broken() -> Self {
        Self {
            next: 0,
            broken: true,
        }
    }
}

impl Trng for CounterTrng {
    fn fill_buffer(&mut self, buf: &mut [u8]) -> Result<(), SocketError> {
        if self.broken {
            return Err(SocketError::RngFailure);
        }
        for byte in buf.iter_mut() {
            *byte = self.next;
            self.next = self.next.wrapping_add(1);
        }
        Ok(())
    }
}

#[derive(Default)]
struct PipeSocket {
    open: bool,
    connected: bool,
    listening: bool,
    peer_closed: bool,
    incoming: VecDeque<u8>,
    sent: Vec<u8>,
    /// Bytes the next sends may still queue; `None` means unlimited
    tx_space: Option<usize>,
    pending_accepts: usize,
}

/// In-memory backend; the test plays the remote peer
pub struct PipeNetwork {
    sockets: RefCell<Vec<PipeSocket>>,
    polls: Cell<usize>,
}

impl PipeNetwork {
    pub fn new() -> Self {
        Self {
            sockets: RefCell::new(Vec::new()),
            polls: Cell::new(0),
        }
    }

    fn with<R>(
        &self,
        id: SocketId,
        f: impl FnOnce(&mut PipeSocket) -> Result<R, SocketError>,
    ) -> Result<R, SocketError> {
        let mut sockets = self.sockets.borrow_mut();
        match sockets.get_mut(id as usize) {
            Some(sock) if sock.open => f(sock),
            _ => Err(SocketError::NotFound),
        }
    }

    pub fn push_incoming(&self, id: SocketId, data: &[u8]) {
        self.sockets.borrow_mut()[id as usize]
            .incoming
            .extend(data.iter().copied());
    }

    pub fn take_sent(&self, id: SocketId) -> Vec<u8> {
        core::mem::take(&mut self.sockets.borrow_mut()[id as usize].sent)
    }

    pub fn close_peer(&self, id: SocketId) {
        self.sockets.borrow_mut()[id as usize].peer_closed = true;
    }

    pub fn set_tx_space(&self, id: SocketId, space: Option<usize>) {
        self.sockets.borrow_mut()[id as usize].tx_space = space;
    }

    pub fn queue_connection(&self, listener: SocketId) {
        self.sockets.borrow_mut()[listener as usize].pending_accepts += 1;
    }

    pub fn is_open(&self, id: SocketId) -> bool {
        self.sockets
            .borrow()
            .get(id as usize)
            .is_some_and(|s| s.open)
    }

    pub fn open_count(&self) -> usize {
        self.sockets.borrow().iter().filter(|s| s.open).count()
    }

    pub fn poll_count(&self) -> usize {
        self.polls.get()
    }
}

impl NetworkInterface for PipeNetwork {
    fn open(&self, protocol: Protocol, _buff_size: u32) -> Result<SocketId, SocketError> {
        if protocol != Protocol::Tcp {
            return Err(SocketError::ProtocolNotSupported);
        }
        let mut sockets = self.sockets.borrow_mut();
        sockets.push(PipeSocket {
            open: true,
            ..PipeSocket::default()
        });
        Ok((sockets.len() - 1) as SocketId)
    }

    fn close(&self, id: SocketId) -> Result<(), SocketError> {
        self.with(id, |s| {
            s.open = false;
            Ok(())
        })
    }

    fn connect(&self, id: SocketId, _addr: &SocketAddress) -> Result<(), SocketError> {
        self.with(id, |s| {
            s.connected = true;
            Ok(())
        })
    }

    fn disconnect(&self, id: SocketId) -> Result<(), SocketError> {
        self.with(id, |s| {
            if !s.connected {
                return Err(SocketError::NotConnected);
            }
            s.connected = false;
            Ok(())
        })
    }

    fn send(&self, id: SocketId, data: &[u8]) -> Result<usize, SocketError> {
        self.with(id, |s| {
            if !s.connected || s.peer_closed {
                return Err(SocketError::NotConnected);
            }
            let n = match s.tx_space {
                Some(0) => return Err(SocketError::WouldBlock),
                Some(space) => {
                    let n = space.min(data.len());
                    s.tx_space = Some(space - n);
                    n
                }
                None => data.len(),
            };
            s.sent.extend_from_slice(&data[..n]);
            Ok(n)
        })
    }

    fn recv(&self, id: SocketId, buf: &mut [u8]) -> Result<usize, SocketError> {
        self.with(id, |s| {
            if !s.connected {
                return Err(SocketError::NotConnected);
            }
            if buf.is_empty() {
                return Ok(0);
            }
            if s.incoming.is_empty() {
                return Err(if s.peer_closed {
                    SocketError::NotConnected
                } else {
                    SocketError::WouldBlock
                });
            }
            let n = buf.len().min(s.incoming.len());
            for (slot, byte) in buf.iter_mut().zip(s.incoming.drain(..n)) {
                *slot = byte;
            }
            Ok(n)
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

    fn bind(&self, id: SocketId, _port: u16) -> Result<(), SocketError> {
        self.with(id, |_| Ok(()))
    }

    fn listen(&self, id: SocketId, _backlog: u32) -> Result<(), SocketError> {
        self.with(id, |s| {
            s.listening = true;
            Ok(())
        })
    }

    fn accept(&self, id: SocketId) -> Result<SocketId, SocketError> {
        self.with(id, |s| {
            if !s.listening {
                return Err(SocketError::InvalidArgument);
            }
            if s.pending_accepts == 0 {
                return Err(SocketError::WouldBlock);
            }
            s.pending_accepts -= 1;
            Ok(())
        })?;

        let mut sockets = self.sockets.borrow_mut();
        sockets.push(PipeSocket {
            open: true,
            connected: true,
            ..PipeSocket::default()
        });
        Ok((sockets.len() - 1) as SocketId)
    }

    fn poll(&self) -> Result<(), SocketError> {
        self.polls.set(self.polls.get() + 1);
        Ok(())
    }
}

type FrameQueue = Rc<RefCell<VecDeque<Vec<u8>>>>;

/// One end of an in-memory Ethernet cable
pub struct WireMac {
    rx: FrameQueue,
    tx: FrameQueue,
}

/// Two MACs wired back to back
pub fn wire_pair() -> (WireMac, WireMac) {
    let a: FrameQueue = Rc::default();
    let b: FrameQueue = Rc::default();
    (
        WireMac {
            rx: a.clone(),
            tx: b.clone(),
        },
        WireMac { rx: b, tx: a },
    )
}

/// MAC whose frames go nowhere
pub fn unplugged_mac() -> WireMac {
    WireMac {
        rx: Rc::default(),
        tx: Rc::default(),
    }
}

pub struct WireRx(Vec<u8>);

pub struct WireTx<'a>(&'a RefCell<VecDeque<Vec<u8>>>);

impl RxToken for WireRx {
    fn consume<R, F>(self, f: F) -> R
    where
        F: FnOnce(&[u8]) -> R,
    {
        f(&self.0)
    }
}

impl TxToken for WireTx<'_> {
    fn consume<R, F>(self, len: usize, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        let mut frame = vec![0u8; len];
        let result = f(&mut frame);
        self.0.borrow_mut().push_back(frame);
        result
    }
}

impl Device for WireMac {
    type RxToken<'a>
        = WireRx
    where
        Self: 'a;
    type TxToken<'a>
        = WireTx<'a>
    where
        Self: 'a;

    fn receive(&mut self, _timestamp: SmolInstant) -> Option<(Self::RxToken<'_>, Self::TxToken<'_>)> {
        let frame = self.rx.borrow_mut().pop_front()?;
        Some((WireRx(frame), WireTx(&self.tx)))
    }

    fn transmit(&mut self, _timestamp: SmolInstant) -> Option<Self::TxToken<'_>> {
        Some(WireTx(&self.tx))
    }

    fn capabilities(&self) -> DeviceCapabilities {
        let mut caps = DeviceCapabilities::default();
        caps.max_transmission_unit = 1514;
        caps.medium = Medium::Ethernet;
        caps
    }
}

impl EthernetMac for WireMac {}
