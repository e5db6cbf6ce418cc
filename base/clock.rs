// This file is part of Moonfire NVR, a security camera network video recorder.
// Copyright (C) 2018 The Moonfire NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Clock interface and implementations for testability.
//!
//! The stream worker checks elapsed wall-clock time constantly: packet
//! liveness, backoff delays, segment rotation. Routing all of that through a
//! [`Clocks`] trait rather than `std::time` directly lets tests drive hours
//! of simulated time in milliseconds of wall-clock time, without sleeping.

use std::sync::{mpsc, Mutex};
use std::time::Duration as StdDuration;
use tracing::warn;

/// Raw `clock_gettime`-style timestamp: seconds and nanoseconds since some
/// clock's epoch. Kept separate from `jiff::Timestamp` so the hot
/// `clock_gettime` path doesn't pay for jiff's range validation on every call.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SystemTime(pub nix::sys::time::TimeSpec);

impl SystemTime {
    pub fn tv_sec(&self) -> i64 {
        self.0.tv_sec()
    }

    pub fn tv_nsec(&self) -> i64 {
        self.0.tv_nsec()
    }

    /// Converts a `CLOCK_REALTIME` reading to a `jiff::Timestamp`. Clamps to
    /// jiff's representable range rather than panicking; `clock_gettime`
    /// never returns anything close to that boundary in practice.
    pub fn to_jiff(self) -> jiff::Timestamp {
        jiff::Timestamp::new(self.tv_sec(), self.tv_nsec() as i32).unwrap_or(jiff::Timestamp::MIN)
    }
}

impl std::ops::Sub for SystemTime {
    type Output = StdDuration;
    fn sub(self, rhs: SystemTime) -> StdDuration {
        let secs = self.tv_sec() - rhs.tv_sec();
        let nanos = self.tv_nsec() - rhs.tv_nsec();
        let total_nanos = secs * 1_000_000_000 + nanos;
        StdDuration::from_nanos(total_nanos.max(0) as u64)
    }
}

/// Abstract interface to the system clocks. This is for testability.
pub trait Clocks: Send + Sync + 'static {
    /// Gets the current time from `CLOCK_REALTIME`.
    fn realtime(&self) -> SystemTime;

    /// Gets the current time from a monotonic clock.
    ///
    /// On Linux, this uses `CLOCK_BOOTTIME`, which (unlike `CLOCK_MONOTONIC`)
    /// includes suspended time. On other systems it uses `CLOCK_MONOTONIC`.
    fn monotonic(&self) -> SystemTime;

    /// Causes the current thread to sleep for the specified time.
    fn sleep(&self, how_long: StdDuration);

    /// Calls `rcv.recv_timeout` or substitutes a test implementation.
    fn recv_timeout<T>(
        &self,
        rcv: &mpsc::Receiver<T>,
        timeout: StdDuration,
    ) -> Result<T, mpsc::RecvTimeoutError>;
}

#[derive(Copy, Clone, Default)]
pub struct RealClocks {}

impl RealClocks {
    fn get(&self, clock: nix::time::ClockId) -> SystemTime {
        SystemTime(
            nix::time::clock_gettime(clock)
                .expect("clock_gettime should succeed; checked at startup"),
        )
    }
}

impl Clocks for RealClocks {
    fn realtime(&self) -> SystemTime {
        self.get(nix::time::ClockId::CLOCK_REALTIME)
    }

    #[cfg(target_os = "linux")]
    fn monotonic(&self) -> SystemTime {
        self.get(nix::time::ClockId::CLOCK_BOOTTIME)
    }

    #[cfg(not(target_os = "linux"))]
    fn monotonic(&self) -> SystemTime {
        self.get(nix::time::ClockId::CLOCK_MONOTONIC)
    }

    fn sleep(&self, how_long: StdDuration) {
        std::thread::sleep(how_long)
    }

    fn recv_timeout<T>(
        &self,
        rcv: &mpsc::Receiver<T>,
        timeout: StdDuration,
    ) -> Result<T, mpsc::RecvTimeoutError> {
        rcv.recv_timeout(timeout)
    }
}

/// Logs a warning if the guarded operation takes "too long". Wrapped around
/// RTSP I/O, writer flushes, and the detection sampler's model call so a
/// single hung operation surfaces in the logs instead of silently stalling a
/// stream.
pub struct TimerGuard<'a, C: Clocks + ?Sized, S: AsRef<str>, F: FnOnce() -> S + 'a> {
    clocks: &'a C,
    label_f: Option<F>,
    start: SystemTime,
}

impl<'a, C: Clocks + ?Sized, S: AsRef<str>, F: FnOnce() -> S + 'a> TimerGuard<'a, C, S, F> {
    pub fn new(clocks: &'a C, label_f: F) -> Self {
        TimerGuard {
            clocks,
            label_f: Some(label_f),
            start: clocks.monotonic(),
        }
    }
}

impl<'a, C, S, F> Drop for TimerGuard<'a, C, S, F>
where
    C: Clocks + ?Sized,
    S: AsRef<str>,
    F: FnOnce() -> S + 'a,
{
    fn drop(&mut self) {
        let elapsed = self.clocks.monotonic() - self.start;
        if elapsed >= StdDuration::from_secs(1) {
            let label_f = self.label_f.take().unwrap();
            warn!("{} took {:?}!", label_f().as_ref(), elapsed);
        }
    }
}

/// Simulated clock for testing: `sleep` advances a counter rather than
/// actually blocking, so a test can fast-forward through backoff schedules
/// and rotation windows deterministically.
#[derive(Clone)]
pub struct SimulatedClocks(std::sync::Arc<SimulatedClocksInner>);

struct SimulatedClocksInner {
    boot: SystemTime,
    uptime: Mutex<StdDuration>,
}

impl SimulatedClocks {
    pub fn new(boot: SystemTime) -> Self {
        SimulatedClocks(std::sync::Arc::new(SimulatedClocksInner {
            boot,
            uptime: Mutex::new(StdDuration::ZERO),
        }))
    }
}

impl Clocks for SimulatedClocks {
    fn realtime(&self) -> SystemTime {
        let uptime = *self.0.uptime.lock().unwrap();
        SystemTime(nix::sys::time::TimeSpec::new(
            self.0.boot.tv_sec() + uptime.as_secs() as i64,
            self.0.boot.tv_nsec() + i64::from(uptime.subsec_nanos()),
        ))
    }

    fn monotonic(&self) -> SystemTime {
        let uptime = *self.0.uptime.lock().unwrap();
        SystemTime(nix::sys::time::TimeSpec::new(
            uptime.as_secs() as i64,
            i64::from(uptime.subsec_nanos()),
        ))
    }

    /// Advances the clock by the specified amount without actually sleeping.
    fn sleep(&self, how_long: StdDuration) {
        let mut l = self.0.uptime.lock().unwrap();
        *l += how_long;
    }

    /// Advances the clock by the specified amount if data is not immediately available.
    fn recv_timeout<T>(
        &self,
        rcv: &mpsc::Receiver<T>,
        timeout: StdDuration,
    ) -> Result<T, mpsc::RecvTimeoutError> {
        let r = rcv.recv_timeout(StdDuration::ZERO);
        if r.is_err() {
            self.sleep(timeout);
        }
        r
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simulated_clock_advances_only_on_sleep() {
        let c = SimulatedClocks::new(SystemTime(nix::sys::time::TimeSpec::new(1_000, 0)));
        assert_eq!(c.realtime().tv_sec(), 1_000);
        c.sleep(StdDuration::from_secs(5));
        assert_eq!(c.realtime().tv_sec(), 1_005);
        assert_eq!(c.monotonic().tv_sec(), 5);
    }
}
