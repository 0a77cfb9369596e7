//! Echo server and client on two stacks joined by an in-memory Ethernet wire

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use noos_net::stack::{IpStack, StackResources};
use noos_net::testing::{unplugged_mac, wire_pair, ManualClock, WireMac};
use noos_net::{Ipv4Mode, NetworkInterface, SocketAddress, SocketError, StackConfig, TcpSocket};

type Stack<'c> = IpStack<CriticalSectionRawMutex, WireMac, &'c ManualClock>;

fn stack(mac: WireMac, clock: &ManualClock, host: u8) -> Stack<'_> {
    let config = StackConfig {
        hwaddr: [0x02, 0x00, 0x00, 0x00, 0x00, host],
        ipv4: Ipv4Mode::Static {
            address: [192, 168, 10, host],
            prefix_len: 24,
            gateway: None,
        },
        seed: u64::from(host) * 7919,
        ..StackConfig::default()
    };
    let resources = Box::leak(Box::new(StackResources::<2048>::new()));
    IpStack::new(mac, clock, &config, resources).unwrap()
}

/// Step both sides until `done`, or give up after ten simulated seconds
fn run_until(
    clock: &ManualClock,
    nets: [&Stack<'_>; 2],
    mut done: impl FnMut() -> bool,
) -> bool {
    for _ in 0..2000 {
        for net in nets {
            net.poll().unwrap();
        }
        if done() {
            return true;
        }
        clock.advance(5);
    }
    false
}

#[test]
fn echo_over_two_stacks() {
    let (a, b) = wire_pair();
    let clock = ManualClock::new();
    let server_net = stack(a, &clock, 1);
    let client_net = stack(b, &clock, 2);
    let nets = [&server_net, &client_net];

    let mut server = TcpSocket::open(&server_net, 2048).unwrap();
    server.bind(10000).unwrap();
    server.listen(0).unwrap();
    assert!(matches!(server.accept(), Err(SocketError::WouldBlock)));

    let mut client = TcpSocket::open(&client_net, 2048).unwrap();
    client
        .start_connect(&SocketAddress::new([192, 168, 10, 1], 10000))
        .unwrap();

    let mut accepted = None;
    assert!(run_until(&clock, nets, || {
        if accepted.is_none() {
            accepted = server.accept().ok();
        }
        accepted.is_some()
    }));
    let mut peer = accepted.unwrap();
    assert_ne!(peer.id(), server.id());

    let message = b"hello, echo";
    let mut sent = 0;
    let mut echoed = Vec::new();
    assert!(run_until(&clock, nets, || {
        if sent < message.len() {
            match client.send(&message[sent..]) {
                Ok(n) => sent += n,
                Err(SocketError::WouldBlock) => {}
                Err(e) => panic!("client send: {e}"),
            }
        }

        // Server echoes one byte at a time
        let mut byte = [0u8; 1];
        if let Ok(1) = peer.recv(&mut byte) {
            assert_eq!(peer.send(&byte), Ok(1));
        }

        let mut buf = [0u8; 16];
        match client.recv(&mut buf) {
            Ok(n) => echoed.extend_from_slice(&buf[..n]),
            Err(SocketError::WouldBlock) => {}
            Err(e) => panic!("client recv: {e}"),
        }
        echoed.len() == message.len()
    }));
    assert_eq!(echoed, message);

    client.disconnect().unwrap();
    let mut buf = [0u8; 4];
    assert_eq!(client.recv(&mut buf), Err(SocketError::NotConnected));

    assert!(run_until(&clock, nets, || {
        peer.recv(&mut buf) == Err(SocketError::NotConnected)
    }));

    peer.remove().unwrap();
    client.remove().unwrap();
    server.remove().unwrap();
}

#[test]
fn sockets_are_reusable_after_remove() {
    let clock = ManualClock::new();
    let net = stack(unplugged_mac(), &clock, 1);

    for _ in 0..3 * noos_net::MAX_SOCKETS {
        let socket = TcpSocket::open(&net, 1024).unwrap();
        socket.remove().unwrap();
    }

    let all: Vec<_> = (0..noos_net::MAX_SOCKETS)
        .map(|_| TcpSocket::open(&net, 1024).unwrap())
        .collect();
    assert!(matches!(
        TcpSocket::open(&net, 1024),
        Err(SocketError::NoFreeSocket)
    ));
    drop(all);
    assert!(TcpSocket::open(&net, 1024).is_ok());
}

#[test]
fn hosts_resolve_distinct_mdns_names() {
    let (a, b) = wire_pair();
    let clock = ManualClock::new();
    let first = stack(a, &clock, 1);
    let second = stack(b, &clock, 2);

    assert!(run_until(&clock, [&first, &second], || {
        first.mdns_hostname().is_some() && second.mdns_hostname().is_some()
    }));
    assert_ne!(first.mdns_hostname(), second.mdns_hostname());
}
