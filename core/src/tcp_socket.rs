#![deny(unsafe_code)]
//! TCP socket facade
//!
//! [`TcpSocket`] is the socket API applications use. It wraps one socket
//! id on a backend (`&dyn NetworkInterface`) and, optionally, a
//! [`SecureSession`]. With a session attached every send and receive goes
//! through the TLS engine; without one the calls pass straight through.
//! Either way the caller sees the same error vocabulary.
//!
//! # Example
//!
//! ```no_run
//! # use noos_net::TcpSocket;
//! # use hal_abstractions::{NetworkInterface, SocketAddress, SocketError};
//! # fn run(net: &dyn NetworkInterface) -> Result<(), SocketError> {
//! let mut socket = TcpSocket::open(net, 2048)?;
//! socket.connect(&SocketAddress::parse("192.168.1.10", 10000)?)?;
//! match socket.send(b"ping") {
//!     Ok(n) => { /* n bytes queued, re-send the tail if n < 4 */ }
//!     Err(SocketError::WouldBlock) => { /* poll the backend and retry */ }
//!     Err(e) => return Err(e),
//! }
//! socket.remove()
//! # }
//! ```

use hal_abstractions::{NetworkInterface, Protocol, SocketAddress, SocketError, SocketId, WaitStatus};

use crate::secure::{Plain, SecureParams, SecureSession, SocketIo, TlsEngine};

/// Application-facing TCP socket
///
/// Dropping a socket closes it on the backend; use [`remove`](Self::remove)
/// to observe teardown errors.
pub struct TcpSocket<'a, E: TlsEngine<'a> = Plain> {
    id: SocketId,
    net: &'a dyn NetworkInterface,
    secure: Option<SecureSession<'a, E>>,
    released: bool,
}

impl<'a> TcpSocket<'a, Plain> {
    /// Open a plain (non-TLS) socket
    pub fn open(net: &'a dyn NetworkInterface, max_buff_size: u32) -> Result<Self, SocketError> {
        Self::init(net, max_buff_size, None)
    }
}

impl<'a, E: TlsEngine<'a>> TcpSocket<'a, E> {
    /// Open a socket on `net`, optionally with a secure session
    ///
    /// # Arguments
    ///
    /// * `net` - Backend the socket lives on
    /// * `max_buff_size` - Buffer size hint passed to the backend
    /// * `secure` - TLS parameters; `None` for a plain socket
    ///
    /// # Errors
    ///
    /// Backend open errors, or session setup errors. If the session cannot
    /// be set up the backend socket is closed again before returning.
    pub fn init(
        net: &'a dyn NetworkInterface,
        max_buff_size: u32,
        secure: Option<SecureParams<'a, E::Config>>,
    ) -> Result<Self, SocketError> {
        let id = net.open(Protocol::Tcp, max_buff_size)?;

        let secure = match secure {
            None => None,
            Some(params) => match SecureSession::new(SocketIo::new(net, id), params) {
                Ok(session) => Some(session),
                Err(e) => {
                    error!("Secure session setup failed on socket {}: {}", id, e);
                    if let Err(close_err) = net.close(id) {
                        warn!("Rollback close of socket {} failed: {}", id, close_err);
                    }
                    return Err(e);
                }
            },
        };

        debug!("Socket {} initialized (secure: {})", id, secure.is_some());

        Ok(Self {
            id,
            net,
            secure,
            released: false,
        })
    }

    pub fn id(&self) -> SocketId {
        self.id
    }

    pub fn is_secure(&self) -> bool {
        self.secure.is_some()
    }

    /// Tear the socket down
    ///
    /// Alerts the TLS peer if a session is established, then closes the
    /// backend socket. Every step runs even if an earlier one failed; the
    /// first failure is returned.
    pub fn remove(mut self) -> Result<(), SocketError> {
        self.released = true;
        self.teardown()
    }

    fn teardown(&mut self) -> Result<(), SocketError> {
        let mut first_err = None;

        if let Some(mut session) = self.secure.take() {
            if let Err(e) = session.close_notify() {
                warn!("TLS close_notify on socket {} failed: {}", self.id, e);
                first_err.get_or_insert(e);
            }
        }

        if let Err(e) = self.net.close(self.id) {
            warn!("Closing socket {} failed: {}", self.id, e);
            first_err.get_or_insert(e);
        }

        debug!("Socket {} removed", self.id);

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Connect, and complete the TLS handshake if the socket is secure
    ///
    /// The handshake is driven here, polling the backend between steps,
    /// and bounded by the session's handshake timeout. Use
    /// [`start_connect`](Self::start_connect) and
    /// [`poll_handshake`](Self::poll_handshake) to drive it from an event
    /// loop instead.
    ///
    /// # Errors
    ///
    /// Backend connect errors, TLS failures, or `SocketError::TimedOut`.
    pub fn connect(&mut self, addr: &SocketAddress) -> Result<(), SocketError> {
        self.start_connect(addr)?;

        loop {
            match self.poll_handshake()? {
                WaitStatus::Ready => return Ok(()),
                WaitStatus::Pending => self.net.poll()?,
                WaitStatus::TimedOut => {
                    error!("TLS handshake on socket {} timed out", self.id);
                    return Err(SocketError::TimedOut);
                }
            }
        }
    }

    /// Start connecting without waiting for the TLS handshake
    pub fn start_connect(&mut self, addr: &SocketAddress) -> Result<(), SocketError> {
        info!("Socket {} connecting to {}", self.id, addr);
        self.net.connect(self.id, addr)?;
        if let Some(session) = self.secure.as_mut() {
            session.start_handshake();
        }
        Ok(())
    }

    /// Advance the TLS handshake; plain sockets are always `Ready`
    pub fn poll_handshake(&mut self) -> Result<WaitStatus, SocketError> {
        match self.secure.as_mut() {
            Some(session) => session.poll_handshake(),
            None => Ok(WaitStatus::Ready),
        }
    }

    pub fn disconnect(&mut self) -> Result<(), SocketError> {
        let notified = match self.secure.as_mut() {
            Some(session) => session.close_notify(),
            None => Ok(()),
        };
        let disconnected = self.net.disconnect(self.id);
        notified.and(disconnected)
    }

    /// Send data; may accept fewer bytes than offered
    pub fn send(&mut self, data: &[u8]) -> Result<usize, SocketError> {
        match self.secure.as_mut() {
            Some(session) => session.write(data),
            None => self.net.send(self.id, data),
        }
    }

    /// Receive data; `WouldBlock` when nothing is available yet
    pub fn recv(&mut self, buf: &mut [u8]) -> Result<usize, SocketError> {
        match self.secure.as_mut() {
            Some(session) => session.read(buf),
            None => self.net.recv(self.id, buf),
        }
    }

    pub fn send_to(&mut self, data: &[u8], to: &SocketAddress) -> Result<usize, SocketError> {
        self.plain_only()?;
        self.net.send_to(self.id, data, to)
    }

    pub fn recv_from(&mut self, buf: &mut [u8]) -> Result<(usize, SocketAddress), SocketError> {
        self.plain_only()?;
        self.net.recv_from(self.id, buf)
    }

    pub fn bind(&mut self, port: u16) -> Result<(), SocketError> {
        self.plain_only()?;
        self.net.bind(self.id, port)
    }

    pub fn listen(&mut self, backlog: u32) -> Result<(), SocketError> {
        self.plain_only()?;
        self.net.listen(self.id, backlog)
    }

    /// Poll for an inbound connection
    ///
    /// The accepted socket shares this socket's backend.
    pub fn accept(&mut self) -> Result<TcpSocket<'a, E>, SocketError> {
        self.plain_only()?;
        let id = self.net.accept(self.id)?;
        info!("Socket {} accepted connection as socket {}", self.id, id);
        Ok(TcpSocket {
            id,
            net: self.net,
            secure: None,
            released: false,
        })
    }

    fn plain_only(&self) -> Result<(), SocketError> {
        if self.secure.is_some() {
            return Err(SocketError::NotImplemented);
        }
        Ok(())
    }
}

impl<'a, E: TlsEngine<'a>> Drop for TcpSocket<'a, E> {
    fn drop(&mut self) {
        if !self.released {
            let _ = self.teardown();
        }
    }
}
