#![deny(unsafe_code)]
//! True random number generator contract
//!
//! Board support crates implement [`Trng`] for their RNG peripheral.
//! [`TrngRng`] adapts it to the `rand_core` traits expected by TLS
//! engines.

use core::num::NonZeroU32;

use rand_core::{CryptoRng, RngCore};

use crate::network::SocketError;

/// Hardware random source
pub trait Trng {
    /// Fill `buf` entirely with random bytes
    fn fill_buffer(&mut self, buf: &mut [u8]) -> Result<(), SocketError>;
}

impl<T: Trng + ?Sized> Trng for &mut T {
    fn fill_buffer(&mut self, buf: &mut [u8]) -> Result<(), SocketError> {
        (**self).fill_buffer(buf)
    }
}

/// `rand_core` view of a [`Trng`]
///
/// `RngCore::fill_bytes` cannot report errors, so a failed fill zeroes the
/// output and latches [`failed`](Self::failed). Consumers check the latch
/// once the operation that drew randomness has finished and discard its
/// result if it is set.
pub struct TrngRng<'a> {
    trng: &'a mut dyn Trng,
    failed: bool,
}

impl<'a> TrngRng<'a> {
    pub fn new(trng: &'a mut dyn Trng) -> Self {
        Self { trng, failed: false }
    }

    /// True if any fill since the last [`clear`](Self::clear) failed
    pub fn failed(&self) -> bool {
        self.failed
    }

    pub fn clear(&mut self) {
        self.failed = false;
    }
}

impl RngCore for TrngRng<'_> {
    fn next_u32(&mut self) -> u32 {
        let mut bytes = [0u8; 4];
        self.fill_bytes(&mut bytes);
        u32::from_le_bytes(bytes)
    }

    fn next_u64(&mut self) -> u64 {
        let mut bytes = [0u8; 8];
        self.fill_bytes(&mut bytes);
        u64::from_le_bytes(bytes)
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        if self.try_fill_bytes(dest).is_err() {
            dest.fill(0);
        }
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand_core::Error> {
        self.trng.fill_buffer(dest).map_err(|_| {
            self.failed = true;
            // CUSTOM_START is non-zero by definition
            match NonZeroU32::new(rand_core::Error::CUSTOM_START) {
                Some(code) => rand_core::Error::from(code),
                None => rand_core::Error::from(NonZeroU32::MIN),
            }
        })
    }
}

impl CryptoRng for TrngRng<'_> {}
