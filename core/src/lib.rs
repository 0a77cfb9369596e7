//! Socket layer for no-OS firmware
//!
//! Applications talk to [`TcpSocket`], which wraps one socket on any
//! [`NetworkInterface`] backend and can run TLS on top of it:
//!
//! - [`stack::IpStack`]: smoltcp TCP/IP stack on an Ethernet MAC
//! - [`w5500::W5500Network`]: W5500-class chips that run TCP themselves
//! - `native::NativeNetwork` (feature `std`): host OS sockets
//!
//! Every operation is non-blocking. Anything that has to wait returns
//! `SocketError::WouldBlock`, or is exposed as a poll function returning
//! a [`WaitStatus`] against a deadline.

#![cfg_attr(not(any(test, feature = "std")), no_std)]
#![deny(unsafe_code)]

// Must come first so the logging macros are visible to every module
#[macro_use]
mod fmt;

pub mod config;
pub mod secure;
pub mod stack;
pub mod tcp_socket;
pub mod w5500;

#[cfg(feature = "std")]
pub mod native;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use config::{Ipv4Mode, StackConfig, W5500Config, MAX_CHANNELS, MAX_SOCKETS};
pub use hal_abstractions::{
    Clock, Deadline, Duration, Instant, NetworkInterface, Protocol, SocketAddress, SocketError,
    SocketId, Trng, WaitStatus,
};
pub use secure::{SecureParams, SecureSession, TlsEngine};
pub use tcp_socket::TcpSocket;
