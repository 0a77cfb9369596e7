//! TLS sessions over host sockets against a rustls server

use std::io::{Read, Write};
use std::net::TcpListener;
use std::sync::Arc;
use std::thread;
use std::time::{Duration as StdDuration, Instant as StdInstant};

use noos_net::native::NativeNetwork;
use noos_net::secure::embedded::{EmbeddedTls, TlsBuffers};
use noos_net::secure::CertificateBundle;
use noos_net::testing::CounterTrng;
use noos_net::{
    Clock, Duration, Instant, SecureParams, SocketAddress, SocketError, TcpSocket, WaitStatus,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::{ServerConfig, ServerConnection, StreamOwned};

struct HostClock(StdInstant);

impl HostClock {
    fn new() -> Self {
        Self(StdInstant::now())
    }
}

impl Clock for HostClock {
    fn now(&self) -> Instant {
        Instant::from_ticks(self.0.elapsed().as_millis() as u64)
    }
}

struct Identity {
    cert: Vec<u8>,
    key: Vec<u8>,
}

fn identity() -> Identity {
    let rcgen::CertifiedKey { cert, key_pair } =
        rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    Identity {
        cert: cert.der().to_vec(),
        key: key_pair.serialize_der(),
    }
}

fn server_config(identity: &Identity) -> Arc<ServerConfig> {
    let key = PrivatePkcs8KeyDer::from(identity.key.clone());
    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(
            vec![CertificateDer::from(identity.cert.clone())],
            PrivateKeyDer::Pkcs8(key),
        )
        .unwrap();
    config.send_tls13_tickets = 0;
    Arc::new(config)
}

fn local_listener() -> (TcpListener, SocketAddress) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, SocketAddress::new([127, 0, 0, 1], port))
}

/// Accept one client, echo its first message, then report whether the
/// session ended with a close_notify
fn echo_server(listener: TcpListener, config: Arc<ServerConfig>) -> thread::JoinHandle<bool> {
    thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        stream
            .set_read_timeout(Some(StdDuration::from_secs(10)))
            .unwrap();
        let mut tls = StreamOwned::new(ServerConnection::new(config).unwrap(), stream);

        let mut buf = [0u8; 64];
        let n = tls.read(&mut buf).unwrap();
        tls.write_all(&buf[..n]).unwrap();
        tls.flush().unwrap();

        // rustls reports a clean close_notify as end of stream
        matches!(tls.read(&mut buf), Ok(0))
    })
}

fn recv_exact(socket: &mut TcpSocket<'_, EmbeddedTls<'_>>, len: usize) -> Vec<u8> {
    let give_up = StdInstant::now() + StdDuration::from_secs(5);
    let mut received = Vec::new();
    let mut buf = [0u8; 64];
    while received.len() < len {
        match socket.recv(&mut buf) {
            Ok(n) => received.extend_from_slice(&buf[..n]),
            Err(SocketError::WouldBlock) => thread::sleep(StdDuration::from_millis(5)),
            Err(e) => panic!("recv: {e}"),
        }
        assert!(StdInstant::now() < give_up, "no echo from server");
    }
    received
}

#[test]
fn handshake_and_echo_with_rustls_server() {
    let identity = identity();
    let (listener, addr) = local_listener();
    let server = echo_server(listener, server_config(&identity));

    let net = NativeNetwork::new();
    let clock = HostClock::new();
    let mut trng = CounterTrng::default();
    let mut buffers: TlsBuffers = TlsBuffers::new();
    let params = SecureParams::new("localhost", &mut trng, &clock, buffers.config())
        .with_handshake_timeout(Duration::from_ticks(5_000));

    let mut socket = TcpSocket::<EmbeddedTls<'_>>::init(&net, 0, Some(params)).unwrap();
    socket.connect(&addr).unwrap();
    assert_eq!(socket.poll_handshake(), Ok(WaitStatus::Ready));

    assert_eq!(socket.send(b"ping over tls"), Ok(13));
    assert_eq!(recv_exact(&mut socket, 13), b"ping over tls");

    socket.remove().unwrap();
    assert!(server.join().unwrap(), "server saw no close_notify");
}

#[test]
fn silent_server_times_out_handshake() {
    // Connections complete in the kernel backlog but nobody answers
    let (listener, addr) = local_listener();

    let net = NativeNetwork::new();
    let clock = HostClock::new();
    let mut trng = CounterTrng::default();
    let mut buffers: TlsBuffers = TlsBuffers::new();
    let params = SecureParams::new("localhost", &mut trng, &clock, buffers.config())
        .with_handshake_timeout(Duration::from_ticks(300));

    let mut socket = TcpSocket::<EmbeddedTls<'_>>::init(&net, 0, Some(params)).unwrap();
    let started = StdInstant::now();
    assert_eq!(socket.connect(&addr), Err(SocketError::TimedOut));
    let elapsed = started.elapsed();
    assert!(elapsed >= StdDuration::from_millis(300));
    assert!(elapsed < StdDuration::from_secs(3));

    assert_eq!(socket.send(b"late"), Err(SocketError::NotConnected));
    assert_eq!(socket.recv(&mut [0u8; 4]), Err(SocketError::NotConnected));
    socket.remove().unwrap();
    drop(listener);
}

#[test]
fn trickling_server_cannot_stretch_handshake() {
    let (listener, addr) = local_listener();
    let server = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        // Handshake record header promising 256 bytes, then one byte per 100 ms
        let _ = stream.write_all(&[0x16, 0x03, 0x03, 0x01, 0x00]);
        for _ in 0..30 {
            if stream.write_all(&[0x02]).is_err() {
                break;
            }
            thread::sleep(StdDuration::from_millis(100));
        }
    });

    let net = NativeNetwork::new();
    let clock = HostClock::new();
    let mut trng = CounterTrng::default();
    let mut buffers: TlsBuffers = TlsBuffers::new();
    let params = SecureParams::new("localhost", &mut trng, &clock, buffers.config())
        .with_handshake_timeout(Duration::from_ticks(400));

    let mut socket = TcpSocket::<EmbeddedTls<'_>>::init(&net, 0, Some(params)).unwrap();
    let started = StdInstant::now();
    assert_eq!(socket.connect(&addr), Err(SocketError::TimedOut));
    // Well short of the three seconds the server would keep trickling
    assert!(started.elapsed() < StdDuration::from_millis(1500));

    socket.remove().unwrap();
    server.join().unwrap();
}

#[test]
fn trust_anchor_refused_without_verifier() {
    let identity = identity();
    let net = NativeNetwork::new();
    let clock = HostClock::new();
    let mut trng = CounterTrng::default();
    let mut buffers: TlsBuffers = TlsBuffers::new();
    let params = SecureParams::new("localhost", &mut trng, &clock, buffers.config())
        .with_certificates(CertificateBundle::ca_der(&identity.cert));

    let result = TcpSocket::<EmbeddedTls<'_>>::init(&net, 0, Some(params));
    assert!(matches!(result, Err(SocketError::NotImplemented)));

    // The backend socket was rolled back: every slot is still free
    let all: Vec<_> = (0..noos_net::MAX_SOCKETS)
        .map(|_| TcpSocket::open(&net, 0).unwrap())
        .collect();
    assert_eq!(all.len(), noos_net::MAX_SOCKETS);
}
