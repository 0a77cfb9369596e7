#![deny(unsafe_code)]
//! Network interface table
//!
//! [`NetworkInterface`] is the operation table every socket backend
//! implements. Upper layers hold a `&dyn NetworkInterface` and never see
//! the backend behind it.
//!
//! All operations are non-blocking. An operation that cannot complete yet
//! returns [`SocketError::WouldBlock`] and must be polled again, after
//! giving the backend a chance to make progress with
//! [`NetworkInterface::poll`].

use core::net::Ipv4Addr;

/// Application-visible socket identifier
pub type SocketId = u32;

/// Transport protocol requested at open time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Protocol {
    Tcp,
    Udp,
}

/// IPv4 endpoint (address and port)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SocketAddress {
    /// Address octets, most significant first
    pub octets: [u8; 4],
    /// Port in host byte order
    pub port: u16,
}

impl SocketAddress {
    pub const fn new(octets: [u8; 4], port: u16) -> Self {
        Self { octets, port }
    }

    /// Parse a dotted-quad address such as `"192.168.1.10"`
    ///
    /// # Errors
    ///
    /// Returns `SocketError::InvalidArgument` for anything that is not a
    /// well-formed IPv4 address.
    ///
    /// # Example
    ///
    /// ```
    /// use hal_abstractions::SocketAddress;
    ///
    /// let addr = SocketAddress::parse("10.0.0.2", 10000).unwrap();
    /// assert_eq!(addr.octets, [10, 0, 0, 2]);
    /// ```
    pub fn parse(addr: &str, port: u16) -> Result<Self, SocketError> {
        let ip: Ipv4Addr = addr.parse().map_err(|_| SocketError::InvalidArgument)?;
        Ok(Self::new(ip.octets(), port))
    }

    pub fn ip(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.octets)
    }
}

impl core::fmt::Display for SocketAddress {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}:{}", self.ip(), self.port)
    }
}

/// Socket operation errors
///
/// One vocabulary for every backend and for the TLS layer, so callers
/// can react to `WouldBlock` and `NotConnected` the same way everywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SocketError {
    /// Bad id, malformed address or call in the wrong state
    InvalidArgument,
    /// Socket table is full
    NoFreeSocket,
    /// Backend could not allocate a connection resource
    NoMemory,
    /// Operation cannot complete yet, poll again
    WouldBlock,
    /// Socket is not connected, or the peer has closed it
    NotConnected,
    /// Connection reset while the operation was in progress
    ConnectionReset,
    /// Remote host refused the connection
    ConnectionRefused,
    /// Virtual id does not map to a live socket
    NotFound,
    /// Operation not supported by this backend or in this mode
    NotImplemented,
    /// Protocol not supported by this backend
    ProtocolNotSupported,
    /// Local port already in use
    AddressInUse,
    /// Deadline expired before the operation completed
    TimedOut,
    /// TLS handshake failed
    TlsHandshakeFailed,
    /// TLS certificate material is malformed or was rejected
    TlsCertificateError,
    /// Random source failed
    RngFailure,
    /// Backend specific fault, passed through untouched
    Backend(i32),
}

impl SocketError {
    /// Negative errno-style code for this error
    ///
    /// Backend faults keep their original code.
    pub const fn code(&self) -> i32 {
        match self {
            Self::InvalidArgument => -22,     // EINVAL
            Self::NoFreeSocket => -24,        // EMFILE
            Self::NoMemory => -12,            // ENOMEM
            Self::WouldBlock => -11,          // EAGAIN
            Self::NotConnected => -107,       // ENOTCONN
            Self::ConnectionReset => -104,    // ECONNRESET
            Self::ConnectionRefused => -111,  // ECONNREFUSED
            Self::NotFound => -2,             // ENOENT
            Self::NotImplemented => -38,      // ENOSYS
            Self::ProtocolNotSupported => -93, // EPROTONOSUPPORT
            Self::AddressInUse => -98,        // EADDRINUSE
            Self::TimedOut => -110,           // ETIMEDOUT
            Self::TlsHandshakeFailed => -71,  // EPROTO
            Self::TlsCertificateError => -74, // EBADMSG
            Self::RngFailure => -5,           // EIO
            Self::Backend(code) => *code,
        }
    }

    /// True for the non-error "retry later" status
    pub const fn is_would_block(&self) -> bool {
        matches!(self, Self::WouldBlock)
    }
}

impl core::fmt::Display for SocketError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::InvalidArgument => write!(f, "Invalid argument"),
            Self::NoFreeSocket => write!(f, "Socket table full"),
            Self::NoMemory => write!(f, "Out of connection resources"),
            Self::WouldBlock => write!(f, "Operation would block"),
            Self::NotConnected => write!(f, "Socket not connected"),
            Self::ConnectionReset => write!(f, "Connection reset"),
            Self::ConnectionRefused => write!(f, "Connection refused"),
            Self::NotFound => write!(f, "Socket not found"),
            Self::NotImplemented => write!(f, "Not implemented"),
            Self::ProtocolNotSupported => write!(f, "Protocol not supported"),
            Self::AddressInUse => write!(f, "Address in use"),
            Self::TimedOut => write!(f, "Timed out"),
            Self::TlsHandshakeFailed => write!(f, "TLS handshake failed"),
            Self::TlsCertificateError => write!(f, "TLS certificate error"),
            Self::RngFailure => write!(f, "Random source failure"),
            Self::Backend(code) => write!(f, "Backend error {}", code),
        }
    }
}

impl core::error::Error for SocketError {}

impl embedded_io::Error for SocketError {
    fn kind(&self) -> embedded_io::ErrorKind {
        match self {
            // Retry hint for transports layered on top of a socket
            Self::WouldBlock => embedded_io::ErrorKind::Interrupted,
            Self::InvalidArgument => embedded_io::ErrorKind::InvalidInput,
            Self::NoFreeSocket | Self::NoMemory => embedded_io::ErrorKind::OutOfMemory,
            Self::NotConnected => embedded_io::ErrorKind::NotConnected,
            Self::ConnectionReset => embedded_io::ErrorKind::ConnectionReset,
            Self::ConnectionRefused => embedded_io::ErrorKind::ConnectionRefused,
            Self::NotFound => embedded_io::ErrorKind::NotFound,
            Self::NotImplemented | Self::ProtocolNotSupported => {
                embedded_io::ErrorKind::Unsupported
            }
            Self::AddressInUse => embedded_io::ErrorKind::AddrInUse,
            Self::TimedOut => embedded_io::ErrorKind::TimedOut,
            Self::TlsCertificateError => embedded_io::ErrorKind::InvalidData,
            _ => embedded_io::ErrorKind::Other,
        }
    }
}

/// Socket operation table implemented by every backend
///
/// Methods take `&self` so one backend instance can serve many sockets at
/// once; backends keep their tables behind interior mutability.
///
/// Every id passed in must have been returned by [`open`](Self::open) or
/// [`accept`](Self::accept) on the same backend and not closed since.
pub trait NetworkInterface {
    /// Open a socket and return its id
    ///
    /// `buff_size` is a hint for backends with configurable buffers.
    fn open(&self, protocol: Protocol, buff_size: u32) -> Result<SocketId, SocketError>;

    /// Close a socket and release every resource tied to it
    fn close(&self, id: SocketId) -> Result<(), SocketError>;

    /// Start connecting to a remote endpoint
    ///
    /// Returns once the connection attempt is under way. `send` and `recv`
    /// report `WouldBlock` until it completes.
    fn connect(&self, id: SocketId, addr: &SocketAddress) -> Result<(), SocketError>;

    fn disconnect(&self, id: SocketId) -> Result<(), SocketError>;

    /// Queue data for transmission
    ///
    /// May accept fewer bytes than offered; the caller re-sends the tail.
    fn send(&self, id: SocketId, data: &[u8]) -> Result<usize, SocketError>;

    /// Read buffered data
    ///
    /// Returns `WouldBlock` when connected with nothing buffered and
    /// `NotConnected` once the peer has closed and all data was drained.
    fn recv(&self, id: SocketId, buf: &mut [u8]) -> Result<usize, SocketError>;

    fn send_to(&self, id: SocketId, data: &[u8], to: &SocketAddress)
        -> Result<usize, SocketError>;

    fn recv_from(&self, id: SocketId, buf: &mut [u8])
        -> Result<(usize, SocketAddress), SocketError>;

    fn bind(&self, id: SocketId, port: u16) -> Result<(), SocketError>;

    fn listen(&self, id: SocketId, backlog: u32) -> Result<(), SocketError>;

    /// Poll a listening socket for an inbound connection
    ///
    /// Returns the id of the new connection, or `WouldBlock`.
    fn accept(&self, id: SocketId) -> Result<SocketId, SocketError>;

    /// Let the backend make progress (timers, frame I/O)
    fn poll(&self) -> Result<(), SocketError> {
        Ok(())
    }
}

impl<T: NetworkInterface + ?Sized> NetworkInterface for &T {
    fn open(&self, protocol: Protocol, buff_size: u32) -> Result<SocketId, SocketError> {
        (**self).open(protocol, buff_size)
    }

    fn close(&self, id: SocketId) -> Result<(), SocketError> {
        (**self).close(id)
    }

    fn connect(&self, id: SocketId, addr: &SocketAddress) -> Result<(), SocketError> {
        (**self).connect(id, addr)
    }

    fn disconnect(&self, id: SocketId) -> Result<(), SocketError> {
        (**self).disconnect(id)
    }

    fn send(&self, id: SocketId, data: &[u8]) -> Result<usize, SocketError> {
        (**self).send(id, data)
    }

    fn recv(&self, id: SocketId, buf: &mut [u8]) -> Result<usize, SocketError> {
        (**self).recv(id, buf)
    }

    fn send_to(
        &self,
        id: SocketId,
        data: &[u8],
        to: &SocketAddress,
    ) -> Result<usize, SocketError> {
        (**self).send_to(id, data, to)
    }

    fn recv_from(
        &self,
        id: SocketId,
        buf: &mut [u8],
    ) -> Result<(usize, SocketAddress), SocketError> {
        (**self).recv_from(id, buf)
    }

    fn bind(&self, id: SocketId, port: u16) -> Result<(), SocketError> {
        (**self).bind(id, port)
    }

    fn listen(&self, id: SocketId, backlog: u32) -> Result<(), SocketError> {
        (**self).listen(id, backlog)
    }

    fn accept(&self, id: SocketId) -> Result<SocketId, SocketError> {
        (**self).accept(id)
    }

    fn poll(&self) -> Result<(), SocketError> {
        (**self).poll()
    }
}
