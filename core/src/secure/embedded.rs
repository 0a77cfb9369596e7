#![deny(unsafe_code)]
//! TLS 1.3 client engine using embedded-tls
//!
//! `embedded-tls` drives its transport through blocking `embedded-io`
//! traits. [`LinkIo`] provides them on top of a non-blocking backend
//! socket:
//!
//! - during the handshake, reads and writes wait for the backend, polling
//!   it, until the one deadline armed for the whole handshake passes
//!   (`TimedOut`)
//! - in the data phase, a read with nothing available reports
//!   `WouldBlock` immediately, which the engine surfaces as `WantRead`
//!
//! The blocking engine cannot park a half-finished handshake, so
//! `SecureSession::poll_handshake` returns `Ready` or fails within a
//! single call.
//!
//! # Limitations
//!
//! - The server certificate is not verified (`NoVerify`), so sessions
//!   given a CA certificate are refused at init
//! - Client certificates cannot be presented, so sessions given client
//!   credentials are refused at init
//! - Cipher suite: AES-128-GCM-SHA256 only
//!
//! # Memory Usage
//!
//! Record buffers are supplied by the caller through [`TlsBuffers`]
//! (18 KB read, 16 KB write by default).

use core::cell::Cell;

use embedded_io::{ErrorType, Read, Write};
use embedded_tls::blocking::TlsConnection;
use embedded_tls::{Aes128GcmSha256, CryptoProvider, NoVerify, TlsConfig, TlsContext, TlsVerifier};
use hal_abstractions::{Deadline, SocketError};

use super::{Credentials, TlsEngine, TlsError, TlsLink};

/// TLS read buffer size: 18 KB
///
/// Sized to handle maximum TLS 1.3 record (16384 bytes) plus all overhead:
/// - Record header: 5 bytes
/// - AEAD tag: 16 bytes
/// - Padding/safety: 512 bytes
pub const TLS_READ_BUF_SIZE: usize = 18 * 1024;

/// TLS write buffer size: 16 KB
pub const TLS_WRITE_BUF_SIZE: usize = 16 * 1024;

/// Which waiting policy the transport applies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkPhase {
    /// Wait for the peer, but not past the handshake deadline
    Handshake(Deadline),
    Data,
}

/// Record buffers and transport state for one TLS connection
///
/// Typically placed in a `static` cell by the board crate; one instance
/// per concurrently open TLS socket.
pub struct TlsBuffers<const R: usize = TLS_READ_BUF_SIZE, const W: usize = TLS_WRITE_BUF_SIZE> {
    read: [u8; R],
    write: [u8; W],
    phase: Cell<LinkPhase>,
}

impl<const R: usize, const W: usize> TlsBuffers<R, W> {
    pub const fn new() -> Self {
        Self {
            read: [0; R],
            write: [0; W],
            phase: Cell::new(LinkPhase::Data),
        }
    }

    /// Engine configuration borrowing these buffers
    pub fn config(&mut self) -> EmbeddedTlsConfig<'_> {
        EmbeddedTlsConfig {
            read_buf: &mut self.read,
            write_buf: &mut self.write,
            phase: &self.phase,
        }
    }
}

impl<const R: usize, const W: usize> Default for TlsBuffers<R, W> {
    fn default() -> Self {
        Self::new()
    }
}

/// Construction parameters for [`EmbeddedTls`]
pub struct EmbeddedTlsConfig<'a> {
    pub read_buf: &'a mut [u8],
    pub write_buf: &'a mut [u8],
    pub phase: &'a Cell<LinkPhase>,
}

/// Blocking `embedded-io` transport over a backend socket
pub struct LinkIo<'a> {
    link: TlsLink<'a>,
    phase: &'a Cell<LinkPhase>,
}

impl LinkIo<'_> {
    /// Poll the backend until `deadline`, or fail with `TimedOut`
    fn wait(&self, deadline: &Deadline) -> Result<(), SocketError> {
        if deadline.is_expired(self.link.clock) {
            warn!("TLS transport wait timed out on socket {}", self.link.io.id());
            return Err(SocketError::TimedOut);
        }
        self.link.io.poll()
    }
}

impl ErrorType for LinkIo<'_> {
    type Error = SocketError;
}

impl Read for LinkIo<'_> {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        loop {
            match self.link.io.recv(buf) {
                Ok(n) => return Ok(n),
                // End of stream for the engine
                Err(SocketError::NotConnected) => return Ok(0),
                Err(SocketError::WouldBlock) => match self.phase.get() {
                    LinkPhase::Handshake(deadline) => self.wait(&deadline)?,
                    LinkPhase::Data => return Err(SocketError::WouldBlock),
                },
                Err(e) => return Err(e),
            }
        }
    }
}

impl Write for LinkIo<'_> {
    fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        let deadline = match self.phase.get() {
            LinkPhase::Handshake(deadline) => deadline,
            LinkPhase::Data => Deadline::after(self.link.clock, self.link.timeout),
        };
        loop {
            match self.link.io.send(buf) {
                Ok(n) => return Ok(n),
                // A record cannot be abandoned half written, so wait in
                // every phase
                Err(SocketError::WouldBlock) => self.wait(&deadline)?,
                Err(e) => return Err(e),
            }
        }
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        self.link.io.poll()
    }
}

/// Simple crypto provider that wraps an RNG for TLS operations
struct SimpleCryptoProvider<RNG> {
    rng: RNG,
    verifier: NoVerify,
}

impl<RNG> SimpleCryptoProvider<RNG> {
    fn new(rng: RNG) -> Self {
        Self {
            rng,
            verifier: NoVerify,
        }
    }
}

impl<RNG> CryptoProvider for SimpleCryptoProvider<RNG>
where
    RNG: rand_core::CryptoRngCore,
{
    type CipherSuite = Aes128GcmSha256;
    type Signature = &'static [u8];

    fn rng(&mut self) -> impl rand_core::CryptoRngCore {
        &mut self.rng
    }

    fn verifier(
        &mut self,
    ) -> Result<&mut impl TlsVerifier<Self::CipherSuite>, embedded_tls::TlsError> {
        Ok(&mut self.verifier)
    }
}

/// TLS 1.3 client engine
pub struct EmbeddedTls<'a> {
    conn: Option<TlsConnection<'a, LinkIo<'a>, Aes128GcmSha256>>,
    phase: &'a Cell<LinkPhase>,
    server_name: &'a str,
}

impl<'a> TlsEngine<'a> for EmbeddedTls<'a> {
    type Config = EmbeddedTlsConfig<'a>;

    fn new(link: TlsLink<'a>, config: Self::Config) -> Result<Self, SocketError> {
        debug!(
            "TLS buffers: read={} bytes, write={} bytes",
            config.read_buf.len(),
            config.write_buf.len()
        );

        config.phase.set(LinkPhase::Data);
        let io = LinkIo {
            link,
            phase: config.phase,
        };

        Ok(Self {
            conn: Some(TlsConnection::new(io, config.read_buf, config.write_buf)),
            phase: config.phase,
            server_name: link.server_name,
        })
    }

    fn handshake(
        &mut self,
        _credentials: &Credentials<'_>,
        rng: &mut dyn rand_core::CryptoRngCore,
        deadline: &Deadline,
    ) -> Result<(), TlsError> {
        let conn = self.conn.as_mut().ok_or(TlsError::PeerClosed)?;
        let config = TlsConfig::new().with_server_name(self.server_name);

        info!("Initiating TLS 1.3 handshake with {}", self.server_name);
        self.phase.set(LinkPhase::Handshake(*deadline));
        let provider = SimpleCryptoProvider::new(rng);
        let result = conn.open(TlsContext::new(&config, provider));
        self.phase.set(LinkPhase::Data);

        result.map_err(|e| {
            let err = map_error(e);
            error!("TLS handshake failed: {}", SocketError::from(err));
            match err {
                // The engine cannot resume a half-done handshake
                TlsError::WantRead | TlsError::WantWrite => TlsError::HandshakeFailed,
                other => other,
            }
        })
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, TlsError> {
        let conn = self.conn.as_mut().ok_or(TlsError::PeerClosed)?;
        let written = conn.write(data).map_err(map_error)?;
        conn.flush().map_err(map_error)?;
        Ok(written)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TlsError> {
        let conn = self.conn.as_mut().ok_or(TlsError::PeerClosed)?;
        conn.read(buf).map_err(map_error)
    }

    fn close_notify(&mut self) -> Result<(), TlsError> {
        let Some(conn) = self.conn.take() else {
            return Ok(());
        };
        conn.close().map(|_io| ()).map_err(|(_io, e)| {
            warn!("TLS close returned error");
            map_error(e)
        })
    }
}

fn map_error(err: embedded_tls::TlsError) -> TlsError {
    match err {
        embedded_tls::TlsError::Io(embedded_io::ErrorKind::Interrupted) => TlsError::WantRead,
        embedded_tls::TlsError::Io(embedded_io::ErrorKind::TimedOut) => {
            TlsError::Io(SocketError::TimedOut)
        }
        embedded_tls::TlsError::Io(embedded_io::ErrorKind::NotConnected)
        | embedded_tls::TlsError::ConnectionClosed => TlsError::PeerClosed,
        embedded_tls::TlsError::Io(embedded_io::ErrorKind::ConnectionReset) => {
            TlsError::Io(SocketError::ConnectionReset)
        }
        _ => TlsError::HandshakeFailed,
    }
}
