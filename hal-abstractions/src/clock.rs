#![deny(unsafe_code)]
//! Monotonic time source and the poll-with-timeout idiom
//!
//! Nothing in this workspace sleeps. Code that has to wait for something
//! (a DHCP lease, a TLS handshake) exposes a poll function returning
//! [`WaitStatus`] and checks a [`Deadline`] against a [`Clock`]; the
//! caller's event loop decides how to spend the time in between.

/// Millisecond timestamp
pub type Instant = fugit::TimerInstantU64<1_000>;

/// Millisecond duration
pub type Duration = fugit::MillisDurationU64;

/// Monotonic millisecond clock
pub trait Clock {
    fn now(&self) -> Instant;
}

impl<C: Clock + ?Sized> Clock for &C {
    fn now(&self) -> Instant {
        (**self).now()
    }
}

/// Outcome of one poll of an operation that may take a while
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum WaitStatus {
    /// The operation completed
    Ready,
    /// Not yet, poll again later
    Pending,
    /// The deadline passed before the operation completed
    TimedOut,
}

impl WaitStatus {
    /// Map a "done yet?" answer onto the tri-state, honouring `deadline`
    pub fn check<C: Clock + ?Sized>(done: bool, deadline: &Deadline, clock: &C) -> Self {
        if done {
            Self::Ready
        } else if deadline.is_expired(clock) {
            Self::TimedOut
        } else {
            Self::Pending
        }
    }
}

/// Point in time after which a wait is abandoned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    at: Instant,
}

impl Deadline {
    /// Deadline `timeout` from now
    ///
    /// # Example
    ///
    /// ```
    /// use hal_abstractions::{Clock, Deadline, Duration, Instant};
    ///
    /// struct Fixed;
    /// impl Clock for Fixed {
    ///     fn now(&self) -> Instant {
    ///         Instant::from_ticks(1_000)
    ///     }
    /// }
    ///
    /// let deadline = Deadline::after(&Fixed, Duration::from_ticks(500));
    /// assert_eq!(deadline.at(), Instant::from_ticks(1_500));
    /// ```
    pub fn after<C: Clock + ?Sized>(clock: &C, timeout: Duration) -> Self {
        Self {
            at: clock.now() + timeout,
        }
    }

    pub const fn at(&self) -> Instant {
        self.at
    }

    pub fn is_expired<C: Clock + ?Sized>(&self, clock: &C) -> bool {
        clock.now() >= self.at
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::cell::Cell;

    struct ManualClock(Cell<u64>);

    impl Clock for ManualClock {
        fn now(&self) -> Instant {
            Instant::from_ticks(self.0.get())
        }
    }

    #[test]
    fn test_deadline_expiry() {
        let clock = ManualClock(Cell::new(100));
        let deadline = Deadline::after(&clock, Duration::from_ticks(50));

        assert!(!deadline.is_expired(&clock));
        clock.0.set(149);
        assert!(!deadline.is_expired(&clock));
        clock.0.set(150);
        assert!(deadline.is_expired(&clock));
    }

    #[test]
    fn test_wait_status_check() {
        let clock = ManualClock(Cell::new(0));
        let deadline = Deadline::after(&clock, Duration::from_ticks(10));

        assert_eq!(WaitStatus::check(false, &deadline, &clock), WaitStatus::Pending);
        assert_eq!(WaitStatus::check(true, &deadline, &clock), WaitStatus::Ready);
        clock.0.set(10);
        assert_eq!(WaitStatus::check(false, &deadline, &clock), WaitStatus::TimedOut);
        // Completion wins over an expired deadline
        assert_eq!(WaitStatus::check(true, &deadline, &clock), WaitStatus::Ready);
    }
}
