//! Per-loop clock domain.
//!
//! Each event loop carries its own time functions so different loops can be
//! synchronized to different clocks and so tests can drive a simulated clock
//! instead of sleeping.

use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime};

/// Time source for one event loop.
///
/// `now_monotonic` is an offset from an arbitrary per-clock origin and is the
/// domain in which all timer arithmetic happens. `now` is wall-clock time and
/// only used for reporting.
pub trait Clock: Send + Sync {
    fn now(&self) -> SystemTime;
    fn now_monotonic(&self) -> Duration;
    /// Local timezone offset from UTC in seconds.
    fn utc_offset(&self) -> i64;
}

/// The default clock: `SystemTime` / `Instant` with the libc timezone.
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        SystemClock {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }

    fn now_monotonic(&self) -> Duration {
        self.origin.elapsed()
    }

    fn utc_offset(&self) -> i64 {
        local_utc_offset()
    }
}

#[cfg(unix)]
fn local_utc_offset() -> i64 {
    unsafe {
        let t = libc::time(std::ptr::null_mut());
        let mut tm: libc::tm = std::mem::zeroed();
        if libc::localtime_r(&t, &mut tm).is_null() {
            return 0;
        }
        tm.tm_gmtoff as i64
    }
}

#[cfg(not(unix))]
fn local_utc_offset() -> i64 {
    0
}

/// A simulated clock for tests. Time only moves when `advance` is called.
///
/// Wall time is `origin + monotonic`, so scenarios can reason about both
/// domains with plain offsets.
pub struct SimClock {
    origin: SystemTime,
    mono: Mutex<Duration>,
}

impl SimClock {
    /// A simulated clock starting at the UNIX epoch with monotonic time zero.
    pub fn new() -> Self {
        SimClock {
            origin: SystemTime::UNIX_EPOCH,
            mono: Mutex::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.mono.lock().unwrap() += by;
    }
}

impl Default for SimClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SimClock {
    fn now(&self) -> SystemTime {
        self.origin + *self.mono.lock().unwrap()
    }

    fn now_monotonic(&self) -> Duration {
        *self.mono.lock().unwrap()
    }

    fn utc_offset(&self) -> i64 {
        0
    }
}
