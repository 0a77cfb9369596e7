#![deny(unsafe_code)]
//! Secure session (TLS) for the TCP socket facade
//!
//! A [`SecureSession`] sits between a [`TcpSocket`](crate::TcpSocket) and
//! its backend. The TLS engine talks to the backend through a
//! [`SocketIo`] bound to the socket's id; the session translates engine
//! conditions into the socket error vocabulary so callers see the same
//! `WouldBlock`/`NotConnected` codes with and without TLS.
//!
//! The engine is pluggable through [`TlsEngine`]. With the `embedded-tls`
//! feature, [`embedded::EmbeddedTls`] provides a TLS 1.3 client.
//!
//! Certificate material is only accepted when the engine can act on it: a
//! CA certificate needs an engine that verifies the server, a client
//! certificate needs one that presents it. Otherwise session setup fails
//! with `SocketError::NotImplemented` rather than silently connecting
//! without the requested authentication.

pub mod cert;
#[cfg(feature = "embedded-tls")]
pub mod embedded;

use hal_abstractions::{
    Clock, Deadline, Duration, NetworkInterface, SocketError, SocketId, Trng, TrngRng, WaitStatus,
};

pub use cert::{Certificate, CertificateBundle, CertificateFormat, Credentials};

/// Default bound on the TLS handshake
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_ticks(10_000);

/// Conditions reported by a TLS engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TlsError {
    /// Engine needs more bytes from the peer before it can continue
    WantRead,
    /// Engine could not flush its output yet
    WantWrite,
    /// Peer closed the connection (close_notify or transport EOF)
    PeerClosed,
    HandshakeFailed,
    Certificate,
    /// Transport error from the backend
    Io(SocketError),
}

impl From<TlsError> for SocketError {
    fn from(err: TlsError) -> Self {
        match err {
            TlsError::WantRead | TlsError::WantWrite => SocketError::WouldBlock,
            TlsError::PeerClosed => SocketError::NotConnected,
            TlsError::HandshakeFailed => SocketError::TlsHandshakeFailed,
            TlsError::Certificate => SocketError::TlsCertificateError,
            TlsError::Io(e) => e,
        }
    }
}

/// Raw socket I/O handed to a TLS engine
///
/// Routes engine reads and writes to the backend through the socket id.
#[derive(Clone, Copy)]
pub struct SocketIo<'a> {
    net: &'a dyn NetworkInterface,
    id: SocketId,
}

impl<'a> SocketIo<'a> {
    pub fn new(net: &'a dyn NetworkInterface, id: SocketId) -> Self {
        Self { net, id }
    }

    pub fn id(&self) -> SocketId {
        self.id
    }

    pub fn send(&self, data: &[u8]) -> Result<usize, SocketError> {
        self.net.send(self.id, data)
    }

    pub fn recv(&self, buf: &mut [u8]) -> Result<usize, SocketError> {
        self.net.recv(self.id, buf)
    }

    /// Let the backend make progress
    pub fn poll(&self) -> Result<(), SocketError> {
        self.net.poll()
    }
}

/// Everything an engine needs to reach the peer
#[derive(Clone, Copy)]
pub struct TlsLink<'a> {
    pub io: SocketIo<'a>,
    pub clock: &'a dyn Clock,
    /// Bound on a data-phase write waiting for transmit space
    pub timeout: Duration,
    /// Server name for SNI
    pub server_name: &'a str,
}

/// TLS client engine
///
/// Implementations must never block indefinitely. During the handshake,
/// anything that needs the peer either reports `WantRead`/`WantWrite` or
/// waits on the link's clock until the handshake deadline and fails with
/// `TlsError::Io(SocketError::TimedOut)` once it passes.
pub trait TlsEngine<'a>: Sized {
    /// Engine specific construction parameters (buffers and the like)
    type Config;

    /// Checks the server certificate chain against `Credentials::ca_cert`
    const VERIFIES_SERVER: bool = false;

    /// Presents `Credentials::client_cert` when the server asks for one
    const CLIENT_AUTH: bool = false;

    fn new(link: TlsLink<'a>, config: Self::Config) -> Result<Self, SocketError>;

    /// Advance the handshake; `Ok` once it has completed
    ///
    /// `deadline` covers the whole handshake, not just this call. Engines
    /// that cannot resume a partial handshake run it to completion here,
    /// waiting no later than `deadline`.
    fn handshake(
        &mut self,
        credentials: &Credentials<'_>,
        rng: &mut dyn rand_core::CryptoRngCore,
        deadline: &Deadline,
    ) -> Result<(), TlsError>;

    fn write(&mut self, data: &[u8]) -> Result<usize, TlsError>;

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TlsError>;

    /// Send a close_notify alert
    fn close_notify(&mut self) -> Result<(), TlsError>;
}

/// Engine type of sockets that never carry TLS
///
/// Uninhabited, so a `TcpSocket<Plain>` provably has no session.
pub enum Plain {}

impl<'a> TlsEngine<'a> for Plain {
    type Config = ();

    fn new(_link: TlsLink<'a>, _config: ()) -> Result<Self, SocketError> {
        Err(SocketError::NotImplemented)
    }

    fn handshake(
        &mut self,
        _credentials: &Credentials<'_>,
        _rng: &mut dyn rand_core::CryptoRngCore,
        _deadline: &Deadline,
    ) -> Result<(), TlsError> {
        match *self {}
    }

    fn write(&mut self, _data: &[u8]) -> Result<usize, TlsError> {
        match *self {}
    }

    fn read(&mut self, _buf: &mut [u8]) -> Result<usize, TlsError> {
        match *self {}
    }

    fn close_notify(&mut self) -> Result<(), TlsError> {
        match *self {}
    }
}

/// Secure-init parameters for [`TcpSocket::init`](crate::TcpSocket::init)
pub struct SecureParams<'a, C> {
    /// Server hostname for SNI
    pub server_name: &'a str,
    pub certificates: CertificateBundle<'a>,
    /// Randomness for the handshake, borrowed for the session's lifetime
    pub trng: &'a mut dyn Trng,
    pub clock: &'a dyn Clock,
    pub handshake_timeout: Duration,
    /// Engine specific configuration
    pub engine: C,
}

impl<'a, C> SecureParams<'a, C> {
    /// Parameters with no certificate material and the default timeout
    pub fn new(
        server_name: &'a str,
        trng: &'a mut dyn Trng,
        clock: &'a dyn Clock,
        engine: C,
    ) -> Self {
        Self {
            server_name,
            certificates: CertificateBundle::default(),
            trng,
            clock,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            engine,
        }
    }

    pub fn with_certificates(mut self, certificates: CertificateBundle<'a>) -> Self {
        self.certificates = certificates;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    /// Created, transport not connected yet
    Idle,
    Handshaking(Deadline),
    Established,
    Closed,
}

/// TLS state attached to one socket
pub struct SecureSession<'a, E> {
    engine: E,
    rng: TrngRng<'a>,
    credentials: Credentials<'a>,
    clock: &'a dyn Clock,
    handshake_timeout: Duration,
    state: SessionState,
}

impl<'a, E: TlsEngine<'a>> SecureSession<'a, E> {
    /// Parse the certificate material and set up the engine
    ///
    /// # Errors
    ///
    /// `TlsCertificateError` for malformed material, `NotImplemented` for
    /// material the engine cannot enforce, or engine setup errors.
    pub fn new(io: SocketIo<'a>, params: SecureParams<'a, E::Config>) -> Result<Self, SocketError> {
        let credentials = Credentials::parse(&params.certificates)?;
        if credentials.ca_cert.is_some() && !E::VERIFIES_SERVER {
            error!("TLS engine cannot verify server certificates, refusing CA certificate");
            return Err(SocketError::NotImplemented);
        }
        if credentials.has_client_auth() && !E::CLIENT_AUTH {
            error!("TLS engine cannot present client certificates");
            return Err(SocketError::NotImplemented);
        }
        let link = TlsLink {
            io,
            clock: params.clock,
            timeout: params.handshake_timeout,
            server_name: params.server_name,
        };
        let engine = E::new(link, params.engine)?;

        debug!("Secure session created for socket {}", io.id());

        Ok(Self {
            engine,
            rng: TrngRng::new(params.trng),
            credentials,
            clock: params.clock,
            handshake_timeout: params.handshake_timeout,
            state: SessionState::Idle,
        })
    }

    /// Arm the handshake deadline; called once the transport connect started
    pub fn start_handshake(&mut self) {
        let deadline = Deadline::after(self.clock, self.handshake_timeout);
        self.state = SessionState::Handshaking(deadline);
    }

    /// Advance the handshake by one step
    ///
    /// Blocking engines finish (or fail) the whole handshake within one
    /// call, still bounded by the handshake deadline.
    ///
    /// # Returns
    ///
    /// `Ready` once established, `Pending` while the engine waits for the
    /// peer, `TimedOut` once the handshake deadline has passed. A timed out
    /// session is closed: data calls then fail with `NotConnected`.
    ///
    /// # Errors
    ///
    /// Engine failures (which also close the session), a failed random
    /// source, or `NotConnected` if no handshake is in progress.
    pub fn poll_handshake(&mut self) -> Result<WaitStatus, SocketError> {
        let deadline = match self.state {
            SessionState::Established => return Ok(WaitStatus::Ready),
            SessionState::Handshaking(deadline) => deadline,
            SessionState::Idle | SessionState::Closed => return Err(SocketError::NotConnected),
        };

        self.rng.clear();
        let result = self
            .engine
            .handshake(&self.credentials, &mut self.rng, &deadline);
        if self.rng.failed() {
            error!("TRNG failed during TLS handshake");
            self.state = SessionState::Closed;
            return Err(SocketError::RngFailure);
        }

        match result {
            Ok(()) => {
                info!("TLS handshake complete");
                self.state = SessionState::Established;
                Ok(WaitStatus::Ready)
            }
            Err(TlsError::WantRead | TlsError::WantWrite) if !deadline.is_expired(self.clock) => {
                Ok(WaitStatus::Pending)
            }
            Err(TlsError::WantRead | TlsError::WantWrite | TlsError::Io(SocketError::TimedOut)) => {
                warn!("TLS handshake timed out");
                self.state = SessionState::Closed;
                Ok(WaitStatus::TimedOut)
            }
            Err(e) => {
                error!("TLS handshake failed: {}", SocketError::from(e));
                self.state = SessionState::Closed;
                Err(e.into())
            }
        }
    }

    pub fn is_established(&self) -> bool {
        self.state == SessionState::Established
    }

    pub fn write(&mut self, data: &[u8]) -> Result<usize, SocketError> {
        self.established()?;
        self.engine.write(data).map_err(|e| self.translate(e))
    }

    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, SocketError> {
        self.established()?;
        self.engine.read(buf).map_err(|e| self.translate(e))
    }

    /// Alert the peer if connected; the session is closed afterwards
    pub fn close_notify(&mut self) -> Result<(), SocketError> {
        let was_established = self.is_established();
        self.state = SessionState::Closed;
        if was_established {
            debug!("Sending TLS close_notify");
            self.engine.close_notify()?;
        }
        Ok(())
    }

    fn established(&self) -> Result<(), SocketError> {
        match self.state {
            SessionState::Established => Ok(()),
            SessionState::Handshaking(_) => Err(SocketError::WouldBlock),
            SessionState::Idle | SessionState::Closed => Err(SocketError::NotConnected),
        }
    }

    fn translate(&mut self, err: TlsError) -> SocketError {
        if matches!(err, TlsError::PeerClosed) {
            debug!("TLS peer closed the session");
            self.state = SessionState::Closed;
        }
        err.into()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::testing::{CounterTrng, ManualClock, PipeNetwork};
    use hal_abstractions::{Protocol, SocketAddress};

    /// Scripted engine: handshake is "HELLO" out, "WORLD" in; records are
    /// the payload XOR 0x5A. `AUTH` sets whether it claims to handle
    /// certificates.
    pub(crate) struct ScriptedEngine<'a, const AUTH: bool = true> {
        link: TlsLink<'a>,
        hello_sent: bool,
        reply: heapless::Vec<u8, 5>,
    }

    pub(crate) const KEY: u8 = 0x5A;

    impl<'a, const AUTH: bool> TlsEngine<'a> for ScriptedEngine<'a, AUTH> {
        type Config = ();
        const VERIFIES_SERVER: bool = AUTH;
        const CLIENT_AUTH: bool = AUTH;

        fn new(link: TlsLink<'a>, _config: ()) -> Result<Self, SocketError> {
            Ok(Self {
                link,
                hello_sent: false,
                reply: heapless::Vec::new(),
            })
        }

        fn handshake(
            &mut self,
            _credentials: &Credentials<'_>,
            rng: &mut dyn rand_core::CryptoRngCore,
            _deadline: &Deadline,
        ) -> Result<(), TlsError> {
            if !self.hello_sent {
                let _ = rand_core::RngCore::next_u32(rng);
                self.link.io.send(b"HELLO").map_err(io_error)?;
                self.hello_sent = true;
            }
            while self.reply.len() < 5 {
                let mut byte = [0u8; 1];
                self.link.io.recv(&mut byte).map_err(io_error)?;
                let _ = self.reply.push(byte[0]);
            }
            if &self.reply[..] == b"WORLD" {
                Ok(())
            } else {
                Err(TlsError::HandshakeFailed)
            }
        }

        fn write(&mut self, data: &[u8]) -> Result<usize, TlsError> {
            let mut record = [0u8; 64];
            let len = data.len().min(record.len());
            for (out, byte) in record.iter_mut().zip(&data[..len]) {
                *out = byte ^ KEY;
            }
            self.link.io.send(&record[..len]).map_err(io_error)
        }

        fn read(&mut self, buf: &mut [u8]) -> Result<usize, TlsError> {
            let n = self.link.io.recv(buf).map_err(io_error)?;
            for byte in &mut buf[..n] {
                *byte ^= KEY;
            }
            Ok(n)
        }

        fn close_notify(&mut self) -> Result<(), TlsError> {
            self.link.io.send(b"BYE").map(|_| ()).map_err(io_error)
        }
    }

    fn io_error(e: SocketError) -> TlsError {
        match e {
            SocketError::WouldBlock => TlsError::WantRead,
            SocketError::NotConnected => TlsError::PeerClosed,
            other => TlsError::Io(other),
        }
    }

    #[test]
    fn test_handshake_progresses_with_peer() {
        let net = PipeNetwork::new();
        let clock = ManualClock::new();
        let mut trng = CounterTrng::default();
        let id = net.open(Protocol::Tcp, 0).unwrap();
        net.connect(id, &SocketAddress::new([10, 0, 0, 2], 443)).unwrap();

        let params = SecureParams::new("example.com", &mut trng, &clock, ());
        let mut session: SecureSession<'_, ScriptedEngine<'_>> =
            SecureSession::new(SocketIo::new(&net, id), params).unwrap();

        assert_eq!(session.poll_handshake(), Err(SocketError::NotConnected));

        session.start_handshake();
        assert_eq!(session.poll_handshake(), Ok(WaitStatus::Pending));
        assert_eq!(net.take_sent(id), b"HELLO");
        assert_eq!(session.write(b"x"), Err(SocketError::WouldBlock));

        net.push_incoming(id, b"WORLD");
        assert_eq!(session.poll_handshake(), Ok(WaitStatus::Ready));
        assert!(session.is_established());
    }

    #[test]
    fn test_handshake_times_out() {
        let net = PipeNetwork::new();
        let clock = ManualClock::new();
        let mut trng = CounterTrng::default();
        let id = net.open(Protocol::Tcp, 0).unwrap();
        net.connect(id, &SocketAddress::new([10, 0, 0, 2], 443)).unwrap();

        let params = SecureParams::new("example.com", &mut trng, &clock, ())
            .with_handshake_timeout(Duration::from_ticks(100));
        let mut session: SecureSession<'_, ScriptedEngine<'_>> =
            SecureSession::new(SocketIo::new(&net, id), params).unwrap();

        session.start_handshake();
        assert_eq!(session.poll_handshake(), Ok(WaitStatus::Pending));
        clock.advance(100);
        assert_eq!(session.poll_handshake(), Ok(WaitStatus::TimedOut));

        // The session is dead, not merely slow
        assert!(!session.is_established());
        assert_eq!(session.write(b"x"), Err(SocketError::NotConnected));
        assert_eq!(session.read(&mut [0u8; 4]), Err(SocketError::NotConnected));
        assert_eq!(session.poll_handshake(), Err(SocketError::NotConnected));

        // Even if the peer shows up late
        net.push_incoming(id, b"WORLD");
        assert_eq!(session.poll_handshake(), Err(SocketError::NotConnected));
    }

    #[test]
    fn test_unenforceable_certificates_refused() {
        let net = PipeNetwork::new();
        let clock = ManualClock::new();
        let mut trng = CounterTrng::default();
        let id = net.open(Protocol::Tcp, 0).unwrap();
        let der: &[u8] = &[0x30, 0x03, 0x02, 0x01, 0x05];

        let params = SecureParams::new("example.com", &mut trng, &clock, ())
            .with_certificates(CertificateBundle::ca_der(der));
        let result: Result<SecureSession<'_, ScriptedEngine<'_, false>>, _> =
            SecureSession::new(SocketIo::new(&net, id), params);
        assert!(matches!(result, Err(SocketError::NotImplemented)));

        let mut trng = CounterTrng::default();
        let bundle = CertificateBundle {
            client_cert: Some(der),
            client_key: Some(der),
            ..CertificateBundle::default()
        };
        let params =
            SecureParams::new("example.com", &mut trng, &clock, ()).with_certificates(bundle);
        let result: Result<SecureSession<'_, ScriptedEngine<'_, false>>, _> =
            SecureSession::new(SocketIo::new(&net, id), params);
        assert!(matches!(result, Err(SocketError::NotImplemented)));

        // An engine that handles certificates takes both
        let mut trng = CounterTrng::default();
        let bundle = CertificateBundle {
            ca_cert: Some(der),
            ..bundle
        };
        let params =
            SecureParams::new("example.com", &mut trng, &clock, ()).with_certificates(bundle);
        let session: SecureSession<'_, ScriptedEngine<'_>> =
            SecureSession::new(SocketIo::new(&net, id), params).unwrap();
        assert!(!session.is_established());
    }

    #[test]
    fn test_trng_failure_fails_handshake() {
        let net = PipeNetwork::new();
        let clock = ManualClock::new();
        let mut trng = CounterTrng::broken();
        let id = net.open(Protocol::Tcp, 0).unwrap();

        let params = SecureParams::new("example.com", &mut trng, &clock, ());
        let mut session: SecureSession<'_, ScriptedEngine<'_>> =
            SecureSession::new(SocketIo::new(&net, id), params).unwrap();

        session.start_handshake();
        assert_eq!(session.poll_handshake(), Err(SocketError::RngFailure));
        assert_eq!(session.read(&mut [0u8; 4]), Err(SocketError::NotConnected));
    }

    #[test]
    fn test_malformed_certificate_rejected() {
        let net = PipeNetwork::new();
        let clock = ManualClock::new();
        let mut trng = CounterTrng::default();
        let id = net.open(Protocol::Tcp, 0).unwrap();

        let params = SecureParams::new("example.com", &mut trng, &clock, ())
            .with_certificates(CertificateBundle::ca_der(b"not a certificate"));
        let result: Result<SecureSession<'_, ScriptedEngine<'_>>, _> =
            SecureSession::new(SocketIo::new(&net, id), params);
        assert!(matches!(result, Err(SocketError::TlsCertificateError)));
    }

    #[test]
    fn test_engine_errors_translate() {
        assert_eq!(SocketError::from(TlsError::WantRead), SocketError::WouldBlock);
        assert_eq!(SocketError::from(TlsError::WantWrite), SocketError::WouldBlock);
        assert_eq!(SocketError::from(TlsError::PeerClosed), SocketError::NotConnected);
        assert_eq!(
            SocketError::from(TlsError::Io(SocketError::ConnectionReset)),
            SocketError::ConnectionReset
        );
    }
}
