#![deny(unsafe_code)]
//! W5500 hardware-command contract
//!
//! The offload backend drives the chip through [`SocketChip`]. A board
//! crate implements it over SPI; the register protocol stays on that
//! side. Channel numbers are physical (`0..MAX_CHANNELS`).
//!
//! Every operation is non-blocking. Where the chip would have to be
//! polled for buffer space or arriving data, the implementation returns
//! `SocketError::WouldBlock` instead of spinning.

use hal_abstractions::{SocketAddress, SocketError};

use crate::config::{W5500Config, DEFAULT_BUFFER_KB};

/// Per-channel buffer size classes supported by the chip
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BufferSize {
    Kb1 = 1,
    Kb2 = 2,
    Kb4 = 4,
    Kb8 = 8,
    Kb16 = 16,
}

impl BufferSize {
    const CLASSES: [BufferSize; 5] = [
        BufferSize::Kb1,
        BufferSize::Kb2,
        BufferSize::Kb4,
        BufferSize::Kb8,
        BufferSize::Kb16,
    ];

    /// Smallest class holding `bytes`
    ///
    /// Zero selects the 2 KB default; anything above 16 KB gets 16 KB.
    pub fn for_request(bytes: u32) -> Self {
        let kb = match bytes {
            0 => u32::from(DEFAULT_BUFFER_KB),
            _ => bytes.div_ceil(1024),
        };
        Self::CLASSES
            .into_iter()
            .find(|class| class.kb() as u32 >= kb)
            .unwrap_or(Self::Kb16)
    }

    pub const fn kb(self) -> u8 {
        self as u8
    }

    pub const fn bytes(self) -> usize {
        self as usize * 1024
    }
}

/// Channel state as reported by the chip's `Sn_SR` register
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ChannelStatus {
    Closed,
    Init,
    Listen,
    SynSent,
    SynRecv,
    Established,
    FinWait,
    Closing,
    TimeWait,
    CloseWait,
    LastAck,
    Udp,
    MacRaw,
}

impl ChannelStatus {
    pub const fn from_raw(raw: u8) -> Option<Self> {
        Some(match raw {
            0x00 => Self::Closed,
            0x13 => Self::Init,
            0x14 => Self::Listen,
            0x15 => Self::SynSent,
            0x16 => Self::SynRecv,
            0x17 => Self::Established,
            0x18 => Self::FinWait,
            0x1A => Self::Closing,
            0x1B => Self::TimeWait,
            0x1C => Self::CloseWait,
            0x1D => Self::LastAck,
            0x22 => Self::Udp,
            0x42 => Self::MacRaw,
            _ => return None,
        })
    }

    /// A connection is up (possibly half-closed by the peer)
    pub const fn is_connected(self) -> bool {
        matches!(self, Self::Established | Self::CloseWait)
    }
}

/// Hardware socket commands of a W5500-class offload engine
pub trait SocketChip {
    /// Apply addressing and TCP retry settings
    fn configure(&mut self, config: &W5500Config) -> Result<(), SocketError>;

    fn link_up(&mut self) -> Result<bool, SocketError>;

    /// Open `channel` in TCP mode with the given buffer class
    fn open(&mut self, channel: u8, buf: BufferSize) -> Result<(), SocketError>;

    fn close(&mut self, channel: u8) -> Result<(), SocketError>;

    /// Issue CONNECT; the channel must be in `Init`
    fn connect(&mut self, channel: u8, addr: &SocketAddress) -> Result<(), SocketError>;

    /// Issue DISCON; `NotConnected` unless established or close-wait
    fn disconnect(&mut self, channel: u8) -> Result<(), SocketError>;

    /// Copy as much of `data` as fits in the TX buffer and issue SEND
    ///
    /// `WouldBlock` if the buffer is full, `NotConnected` if the channel
    /// is not connected.
    fn send(&mut self, channel: u8, data: &[u8]) -> Result<usize, SocketError>;

    /// Copy received bytes out and issue RECV
    ///
    /// `WouldBlock` if connected with nothing received, `NotConnected`
    /// once the peer has closed and the buffer is empty.
    fn recv(&mut self, channel: u8, buf: &mut [u8]) -> Result<usize, SocketError>;

    fn bind(&mut self, channel: u8, port: u16) -> Result<(), SocketError>;

    /// Issue LISTEN; the channel must be in `Init`
    fn listen(&mut self, channel: u8) -> Result<(), SocketError>;

    fn status(&mut self, channel: u8) -> Result<ChannelStatus, SocketError>;

    /// Peer address of a connected channel
    fn remote_endpoint(&mut self, channel: u8) -> Result<SocketAddress, SocketError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_class_rounds_up() {
        assert_eq!(BufferSize::for_request(0), BufferSize::Kb2);
        assert_eq!(BufferSize::for_request(1), BufferSize::Kb1);
        assert_eq!(BufferSize::for_request(1024), BufferSize::Kb1);
        assert_eq!(BufferSize::for_request(1025), BufferSize::Kb2);
        assert_eq!(BufferSize::for_request(3000), BufferSize::Kb4);
        assert_eq!(BufferSize::for_request(8192), BufferSize::Kb8);
        assert_eq!(BufferSize::for_request(9000), BufferSize::Kb16);
        assert_eq!(BufferSize::for_request(100_000), BufferSize::Kb16);
        assert_eq!(BufferSize::Kb4.bytes(), 4096);
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(ChannelStatus::from_raw(0x17), Some(ChannelStatus::Established));
        assert_eq!(ChannelStatus::from_raw(0x14), Some(ChannelStatus::Listen));
        assert_eq!(ChannelStatus::from_raw(0x99), None);
        assert!(ChannelStatus::CloseWait.is_connected());
        assert!(!ChannelStatus::Listen.is_connected());
    }
}
