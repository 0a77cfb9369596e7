#![deny(unsafe_code)]
//! Network configuration structures

use hal_abstractions::Duration;

/// Slots in the stack adapter's socket table
pub const MAX_SOCKETS: usize = 10;

/// Hardware socket channels on a W5500
pub const MAX_CHANNELS: usize = 8;

/// Buffer class used when a backend is given no size hint, in KB
pub const DEFAULT_BUFFER_KB: u8 = 2;

/// IPv4 address assignment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ipv4Mode {
    /// Fixed address, prefix length and optional default gateway
    Static {
        address: [u8; 4],
        prefix_len: u8,
        gateway: Option<[u8; 4]>,
    },
    /// Lease an address from a DHCP server
    Dhcp,
}

/// Host label claimed over mDNS when nothing else is configured
pub const DEFAULT_HOSTNAME: &str = "analog";

/// Transport label of a DNS-SD service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceProtocol {
    Tcp,
    Udp,
}

impl ServiceProtocol {
    pub const fn label(self) -> &'static str {
        match self {
            ServiceProtocol::Tcp => "_tcp",
            ServiceProtocol::Udp => "_udp",
        }
    }
}

/// Service advertised over DNS-SD
///
/// Published as `<instance>.<service>.<protocol>.local` with SRV and TXT
/// records, and listed under `<service>.<protocol>.local`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DnsSdService {
    pub instance: &'static str,
    /// Service label with its leading underscore
    pub service: &'static str,
    pub protocol: ServiceProtocol,
    pub port: u16,
    /// TXT strings, `key=value`
    pub txt: &'static [&'static str],
}

impl DnsSdService {
    /// IIO daemon on its well-known port
    pub const IIO: Self = Self {
        instance: "analog",
        service: "_iio",
        protocol: ServiceProtocol::Tcp,
        port: 30431,
        txt: &["path=/"],
    };
}

/// mDNS responder settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MdnsConfig {
    /// Preferred host label; `-N` is appended on conflicts
    pub hostname: &'static str,
    pub service: Option<DnsSdService>,
}

impl Default for MdnsConfig {
    fn default() -> Self {
        Self {
            hostname: DEFAULT_HOSTNAME,
            service: Some(DnsSdService::IIO),
        }
    }
}

/// User-space IP stack configuration
#[derive(Debug, Clone)]
pub struct StackConfig {
    /// MAC address for Ethernet
    pub hwaddr: [u8; 6],
    /// Address assignment
    pub ipv4: Ipv4Mode,
    /// Random seed for network stack
    pub seed: u64,
    /// How long `IpStack::poll_dhcp` callers should wait for a lease
    pub dhcp_timeout: Duration,
    /// mDNS responder, `None` to stay silent
    pub mdns: Option<MdnsConfig>,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            hwaddr: [0x02, 0x00, 0x00, 0x12, 0x34, 0x56],
            ipv4: Ipv4Mode::Dhcp,
            seed: 0x1234_5678_u64,
            dhcp_timeout: Duration::from_ticks(20_000),
            mdns: Some(MdnsConfig::default()),
        }
    }
}

/// W5500 chip-wide configuration, applied when the backend is created
#[derive(Debug, Clone)]
pub struct W5500Config {
    pub mac_addr: [u8; 6],
    pub ip: [u8; 4],
    pub subnet: [u8; 4],
    pub gateway: [u8; 4],
    /// TCP retransmission timeout, in units of 100 us
    pub retry_time: u16,
    /// TCP retransmission attempts before the chip gives up
    pub retry_count: u8,
}

impl Default for W5500Config {
    fn default() -> Self {
        Self {
            mac_addr: [0x02, 0x00, 0x00, 0x12, 0x34, 0x57],
            ip: [192, 168, 1, 100],
            subnet: [255, 255, 255, 0],
            gateway: [192, 168, 1, 1],
            retry_time: 2000,
            retry_count: 8,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_stack_config() {
        let config = StackConfig::default();
        assert_eq!(config.ipv4, Ipv4Mode::Dhcp);
        assert_eq!(config.dhcp_timeout.ticks(), 20_000);
        // Locally administered, unicast
        assert_eq!(config.hwaddr[0] & 0x03, 0x02);
    }

    #[test]
    fn test_default_mdns_advertises_iio() {
        let mdns = StackConfig::default().mdns.unwrap();
        assert_eq!(mdns.hostname, "analog");
        let service = mdns.service.unwrap();
        assert_eq!(service.service, "_iio");
        assert_eq!(service.protocol.label(), "_tcp");
        assert_eq!(service.port, 30431);
        assert_eq!(service.txt, &["path=/"]);
    }

    #[test]
    fn test_default_w5500_config() {
        let config = W5500Config::default();
        assert_eq!(config.retry_count, 8);
        assert_eq!(config.subnet, [255, 255, 255, 0]);
    }
}
