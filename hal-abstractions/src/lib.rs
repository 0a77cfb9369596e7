//! Hardware abstraction traits for no-OS networking
//!
//! This crate defines the contracts shared by every socket backend and
//! by the layers stacked on top of them. Backends implement these traits;
//! upper layers only ever see the traits.

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_code)]

pub mod clock;
pub mod network;
pub mod rng;

pub use clock::{Clock, Deadline, Duration, Instant, WaitStatus};
pub use network::{NetworkInterface, Protocol, SocketAddress, SocketError, SocketId};
pub use rng::{Trng, TrngRng};
