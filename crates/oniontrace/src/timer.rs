//! One-shot and periodic wakeups, exposed as readable descriptors.

use std::os::fd::{AsFd, AsRawFd, RawFd};
use std::time::Duration;

use nix::sys::time::TimeSpec;
use nix::sys::timerfd::{ClockId, Expiration, TimerFd, TimerFlags, TimerSetTimeFlags};
use thiserror::Error;
use tracing::warn;

/// An error from the kernel timer interface.
#[derive(Debug, Error)]
#[non_exhaustive]
pub(crate) enum TimerError {
    /// The timer descriptor could not be created.
    #[error("unable to create timer descriptor")]
    Create(#[source] nix::Error),
    /// The timer could not be armed.
    #[error("unable to arm timer")]
    Arm(#[source] nix::Error),
}

/// A kernel timer backed by a nonblocking timer descriptor.
///
/// Register [`fd`](Timer::fd) for READ with the event manager; when it
/// reports readable, call [`check`](Timer::check) to consume the
/// expiration and learn whether the timer actually fired. Dropping the
/// timer closes the descriptor; deregister it first.
#[derive(Debug)]
pub(crate) struct Timer {
    /// The underlying timer descriptor.
    inner: TimerFd,
}

impl Timer {
    /// Return a new, unarmed timer.
    pub(crate) fn new() -> Result<Self, TimerError> {
        let inner = TimerFd::new(
            ClockId::CLOCK_MONOTONIC,
            TimerFlags::TFD_NONBLOCK | TimerFlags::TFD_CLOEXEC,
        )
        .map_err(TimerError::Create)?;
        Ok(Self { inner })
    }

    /// Arm with whole-second granularity.
    ///
    /// A `period_secs` of zero makes the timer one-shot.
    pub(crate) fn arm(&self, initial_secs: u64, period_secs: u64) -> Result<(), TimerError> {
        let period = (period_secs > 0).then(|| Duration::from_secs(period_secs));
        self.arm_granular(Duration::from_secs(initial_secs), period)
    }

    /// Arm with nanosecond granularity.
    ///
    /// A zero initial delay is adjusted to one nanosecond: an all-zero
    /// expiration would disarm the descriptor instead of firing it as soon
    /// as possible.
    pub(crate) fn arm_granular(
        &self,
        initial: Duration,
        period: Option<Duration>,
    ) -> Result<(), TimerError> {
        let initial = if initial.is_zero() {
            Duration::from_nanos(1)
        } else {
            initial
        };
        let expiration = match period {
            Some(period) if !period.is_zero() => Expiration::IntervalDelayed(
                TimeSpec::from_duration(initial),
                TimeSpec::from_duration(period),
            ),
            _ => Expiration::OneShot(TimeSpec::from_duration(initial)),
        };
        self.inner
            .set(expiration, TimerSetTimeFlags::empty())
            .map_err(TimerError::Arm)
    }

    /// Consume pending expirations; true if the timer fired at least once.
    pub(crate) fn check(&self) -> bool {
        let mut count = [0_u8; 8];
        match nix::unistd::read(self.inner.as_fd().as_raw_fd(), &mut count) {
            Ok(n) if n == count.len() => u64::from_ne_bytes(count) > 0,
            Ok(_) => false,
            Err(nix::errno::Errno::EAGAIN) => false,
            Err(e) => {
                warn!(error = %e, "unable to read timer expiration count");
                false
            }
        }
    }

    /// The timer's descriptor, for event-manager registration.
    pub(crate) fn fd(&self) -> RawFd {
        self.inner.as_fd().as_raw_fd()
    }
}

#[cfg(test)]
mod test {
    // @@ begin test lint list maintained by maint/add_warning @@
    #![allow(clippy::bool_assert_comparison)]
    #![allow(clippy::clone_on_copy)]
    #![allow(clippy::dbg_macro)]
    #![allow(clippy::mixed_attributes_style)]
    #![allow(clippy::print_stderr)]
    #![allow(clippy::print_stdout)]
    #![allow(clippy::single_char_pattern)]
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::unchecked_duration_subtraction)]
    #![allow(clippy::useless_vec)]
    #![allow(clippy::needless_pass_by_value)]
    //! <!-- @@ end test lint list maintained by maint/add_warning @@ -->
    use super::*;
    use std::thread::sleep;

    #[test]
    fn unfired_timer_reports_nothing() {
        let timer = Timer::new().unwrap();
        timer.arm(3600, 0).unwrap();
        assert!(!timer.check());
    }

    #[test]
    fn zero_delay_fires_immediately() {
        let timer = Timer::new().unwrap();
        timer.arm(0, 0).unwrap();
        sleep(Duration::from_millis(5));
        assert!(timer.check());
        // One-shot: no further expirations.
        assert!(!timer.check());
    }

    #[test]
    fn periodic_timer_keeps_firing() {
        let timer = Timer::new().unwrap();
        timer
            .arm_granular(Duration::from_millis(1), Some(Duration::from_millis(1)))
            .unwrap();
        sleep(Duration::from_millis(5));
        assert!(timer.check());
        sleep(Duration::from_millis(5));
        assert!(timer.check());
    }

    #[test]
    fn descriptor_is_valid() {
        let timer = Timer::new().unwrap();
        assert!(timer.fd() >= 0);
    }
}
