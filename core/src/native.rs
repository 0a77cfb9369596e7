#![deny(unsafe_code)]
//! Hosted socket backend over `std::net`
//!
//! Lets the facade and the TLS session run on a development machine
//! against real peers. Sockets are non-blocking after setup.
//!
//! # Blocking connect
//!
//! `connect` is the one call that blocks: std only offers a blocking
//! connect, so `NetworkInterface::connect` (and with it
//! `TcpSocket::connect` and `TcpSocket::start_connect`) can stall the
//! caller for up to the connect timeout, 5 s unless changed with
//! [`NativeNetwork::with_connect_timeout`]. Event loops that must stay
//! responsive should shorten it.

use core::cell::RefCell;
use std::io::{ErrorKind, Read, Write};
use std::net::{Ipv4Addr, Shutdown, SocketAddr, SocketAddrV4, TcpListener, TcpStream};
use std::time::Duration;

use hal_abstractions::{NetworkInterface, Protocol, SocketAddress, SocketError, SocketId};

use crate::config::MAX_SOCKETS;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

enum Endpoint {
    /// Opened, or disconnected
    Idle,
    Stream(TcpStream),
    Listener(TcpListener),
}

struct NativeSlot {
    endpoint: Endpoint,
    port: u16,
}

/// Socket backend on the host operating system
pub struct NativeNetwork {
    slots: RefCell<[Option<NativeSlot>; MAX_SOCKETS]>,
    connect_timeout: Duration,
}

impl NativeNetwork {
    pub fn new() -> Self {
        Self {
            slots: RefCell::new(core::array::from_fn(|_| None)),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Port a socket is bound or listening on
    pub fn local_port(&self, id: SocketId) -> Result<u16, SocketError> {
        self.with(id, |slot| Ok(slot.port))
    }

    fn with<R>(
        &self,
        id: SocketId,
        f: impl FnOnce(&mut NativeSlot) -> Result<R, SocketError>,
    ) -> Result<R, SocketError> {
        let mut slots = self.slots.borrow_mut();
        match slots.get_mut(id as usize) {
            Some(Some(slot)) => f(slot),
            Some(None) => Err(SocketError::NotFound),
            None => Err(SocketError::InvalidArgument),
        }
    }

    fn insert(&self, slot: NativeSlot) -> Result<SocketId, SocketError> {
        let mut slots = self.slots.borrow_mut();
        let idx = slots.iter().position(Option::is_none).ok_or_else(|| {
            warn!("All {} native sockets in use", MAX_SOCKETS);
            SocketError::NoFreeSocket
        })?;
        slots[idx] = Some(slot);
        Ok(idx as SocketId)
    }
}

impl Default for NativeNetwork {
    fn default() -> Self {
        Self::new()
    }
}

fn map_io(err: std::io::Error) -> SocketError {
    match err.kind() {
        ErrorKind::WouldBlock => SocketError::WouldBlock,
        ErrorKind::ConnectionRefused => SocketError::ConnectionRefused,
        ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted | ErrorKind::BrokenPipe => {
            SocketError::ConnectionReset
        }
        ErrorKind::NotConnected => SocketError::NotConnected,
        ErrorKind::AddrInUse => SocketError::AddressInUse,
        ErrorKind::TimedOut => SocketError::TimedOut,
        ErrorKind::InvalidInput => SocketError::InvalidArgument,
        _ => SocketError::Backend(err.raw_os_error().map_or(-5, |code| -code)),
    }
}

fn prepare(stream: &TcpStream) -> Result<(), SocketError> {
    stream.set_nonblocking(true).map_err(map_io)?;
    stream.set_nodelay(true).map_err(map_io)
}

impl NetworkInterface for NativeNetwork {
    fn open(&self, protocol: Protocol, _buff_size: u32) -> Result<SocketId, SocketError> {
        if protocol != Protocol::Tcp {
            return Err(SocketError::ProtocolNotSupported);
        }
        self.insert(NativeSlot {
            endpoint: Endpoint::Idle,
            port: 0,
        })
    }

    fn close(&self, id: SocketId) -> Result<(), SocketError> {
        self.with(id, |_| Ok(()))?;
        self.slots.borrow_mut()[id as usize] = None;
        debug!("Native socket {} closed", id);
        Ok(())
    }

    fn connect(&self, id: SocketId, addr: &SocketAddress) -> Result<(), SocketError> {
        let timeout = self.connect_timeout;
        self.with(id, |slot| {
            if !matches!(slot.endpoint, Endpoint::Idle) {
                return Err(SocketError::InvalidArgument);
            }
            let remote = SocketAddr::V4(SocketAddrV4::new(addr.ip(), addr.port));
            let stream = TcpStream::connect_timeout(&remote, timeout).map_err(|e| {
                warn!("Connect to {} failed", addr);
                map_io(e)
            })?;
            prepare(&stream)?;
            slot.port = stream.local_addr().map_err(map_io)?.port();
            slot.endpoint = Endpoint::Stream(stream);
            Ok(())
        })
    }

    fn disconnect(&self, id: SocketId) -> Result<(), SocketError> {
        self.with(id, |slot| {
            let Endpoint::Stream(stream) = &slot.endpoint else {
                return Err(SocketError::NotConnected);
            };
            // Already reset by the peer is fine
            let _ = stream.shutdown(Shutdown::Both);
            slot.endpoint = Endpoint::Idle;
            Ok(())
        })
    }

    fn send(&self, id: SocketId, data: &[u8]) -> Result<usize, SocketError> {
        self.with(id, |slot| {
            let Endpoint::Stream(stream) = &mut slot.endpoint else {
                return Err(SocketError::NotConnected);
            };
            if data.is_empty() {
                return Ok(0);
            }
            match stream.write(data) {
                Ok(0) => Err(SocketError::NotConnected),
                Ok(n) => Ok(n),
                Err(e) => Err(map_io(e)),
            }
        })
    }

    fn recv(&self, id: SocketId, buf: &mut [u8]) -> Result<usize, SocketError> {
        self.with(id, |slot| {
            let Endpoint::Stream(stream) = &mut slot.endpoint else {
                return Err(SocketError::NotConnected);
            };
            if buf.is_empty() {
                return Ok(0);
            }
            match stream.read(buf) {
                // End of stream
                Ok(0) => Err(SocketError::NotConnected),
                Ok(n) => Ok(n),
                Err(e) => Err(map_io(e)),
            }
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
        self.with(id, |slot| match slot.endpoint {
            Endpoint::Idle => {
                slot.port = port;
                Ok(())
            }
            _ => Err(SocketError::InvalidArgument),
        })
    }

    fn listen(&self, id: SocketId, backlog: u32) -> Result<(), SocketError> {
        self.with(id, |slot| {
            if !matches!(slot.endpoint, Endpoint::Idle) {
                return Err(SocketError::InvalidArgument);
            }
            // std picks its own backlog
            let listener =
                TcpListener::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, slot.port))
                    .map_err(map_io)?;
            listener.set_nonblocking(true).map_err(map_io)?;
            slot.port = listener.local_addr().map_err(map_io)?.port();
            info!(
                "Native socket {} listening on port {} (backlog {})",
                id, slot.port, backlog
            );
            slot.endpoint = Endpoint::Listener(listener);
            Ok(())
        })
    }

    fn accept(&self, id: SocketId) -> Result<SocketId, SocketError> {
        let (stream, port) = self.with(id, |slot| {
            let Endpoint::Listener(listener) = &slot.endpoint else {
                return Err(SocketError::InvalidArgument);
            };
            let (stream, peer) = listener.accept().map_err(map_io)?;
            debug!("Native socket {} accepted {}", id, peer.port());
            Ok((stream, slot.port))
        })?;

        prepare(&stream)?;
        self.insert(NativeSlot {
            endpoint: Endpoint::Stream(stream),
            port,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOCALHOST: [u8; 4] = [127, 0, 0, 1];

    fn retry<T>(mut f: impl FnMut() -> Result<T, SocketError>) -> Result<T, SocketError> {
        for _ in 0..1000 {
            match f() {
                Err(SocketError::WouldBlock) => std::thread::sleep(Duration::from_millis(2)),
                other => return other,
            }
        }
        Err(SocketError::TimedOut)
    }

    #[test]
    fn test_loopback_echo() {
        let net = NativeNetwork::new();

        let server = net.open(Protocol::Tcp, 0).unwrap();
        net.bind(server, 0).unwrap();
        net.listen(server, 0).unwrap();
        let port = net.local_port(server).unwrap();
        assert_ne!(port, 0);
        assert_eq!(net.accept(server), Err(SocketError::WouldBlock));

        let client = net.open(Protocol::Tcp, 0).unwrap();
        net.connect(client, &SocketAddress::new(LOCALHOST, port)).unwrap();
        let child = retry(|| net.accept(server)).unwrap();
        assert_ne!(child, server);
        assert_ne!(child, client);

        let mut buf = [0u8; 4];
        assert_eq!(net.recv(client, &mut buf), Err(SocketError::WouldBlock));

        assert_eq!(net.send(client, b"ping"), Ok(4));
        let mut got = 0;
        while got < 4 {
            got += retry(|| net.recv(child, &mut buf[got..])).unwrap();
        }
        assert_eq!(&buf, b"ping");

        net.close(child).unwrap();
        assert_eq!(
            retry(|| net.recv(client, &mut buf)),
            Err(SocketError::NotConnected)
        );

        net.disconnect(client).unwrap();
        assert_eq!(net.send(client, b"x"), Err(SocketError::NotConnected));
        net.close(client).unwrap();
        net.close(server).unwrap();
    }

    #[test]
    fn test_connect_bounded_by_timeout() {
        assert_eq!(NativeNetwork::new().connect_timeout, DEFAULT_CONNECT_TIMEOUT);

        let net = NativeNetwork::new().with_connect_timeout(Duration::from_millis(200));
        let id = net.open(Protocol::Tcp, 0).unwrap();
        // Non-routable: either dropped on the floor or rejected at once
        let started = std::time::Instant::now();
        assert!(net.connect(id, &SocketAddress::new([10, 255, 255, 1], 9)).is_err());
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(net.send(id, b"x"), Err(SocketError::NotConnected));
    }

    #[test]
    fn test_slot_limits() {
        let net = NativeNetwork::new();
        for expected in 0..MAX_SOCKETS as SocketId {
            assert_eq!(net.open(Protocol::Tcp, 0), Ok(expected));
        }
        assert_eq!(net.open(Protocol::Tcp, 0), Err(SocketError::NoFreeSocket));
        net.close(4).unwrap();
        assert_eq!(net.close(4), Err(SocketError::NotFound));
        assert_eq!(net.open(Protocol::Tcp, 0), Ok(4));
        assert_eq!(
            net.open(Protocol::Udp, 0),
            Err(SocketError::ProtocolNotSupported)
        );
    }
}
