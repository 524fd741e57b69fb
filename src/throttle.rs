use core::sync::atomic::{AtomicU64, Ordering};
use core::time::Duration;

const NANOS_PER_SEC: u128 = 1_000_000_000;

/// Monotonic time source used to measure frame arrival.
pub trait Clock: Send + Sync {
    /// Time elapsed since an arbitrary, fixed origin.
    fn now(&self) -> Duration;
}

/// [`Clock`] backed by [`std::time::Instant`].
#[cfg(feature = "std")]
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: std::time::Instant,
}

#[cfg(feature = "std")]
impl MonotonicClock {
    pub fn new() -> Self {
        MonotonicClock {
            origin: std::time::Instant::now(),
        }
    }
}

#[cfg(feature = "std")]
impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "std")]
impl Clock for MonotonicClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }
}

/// A [`Clock`] that only moves when told to. Useful for hosts that drive
/// the pipeline from recorded or synthetic frames.
#[derive(Debug, Default)]
pub struct ManualClock {
    nanos: AtomicU64,
}

impl ManualClock {
    pub const fn new() -> Self {
        ManualClock {
            nanos: AtomicU64::new(0),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.nanos.fetch_add(by.as_nanos() as u64, Ordering::SeqCst);
    }

    pub fn set(&self, now: Duration) {
        self.nanos.store(now.as_nanos() as u64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        Duration::from_nanos(self.nanos.load(Ordering::SeqCst))
    }
}

/// Per-pipeline rate limiter.
///
/// Accepts a frame when at least `1 / fps` seconds have passed since the
/// last accepted one. The first frame is always accepted and rejected frames
/// leave no trace.
#[derive(Debug, Clone)]
pub struct ThrottleGate {
    fps: u32,
    last_accepted: Option<Duration>,
}

impl ThrottleGate {
    /// `fps` below 1 is treated as 1.
    pub fn new(fps: u32) -> Self {
        ThrottleGate {
            fps: fps.max(1),
            last_accepted: None,
        }
    }

    pub fn min_interval(&self) -> Duration {
        Duration::from_nanos((NANOS_PER_SEC / self.fps as u128) as u64)
    }

    /// Decide whether a frame arriving at `now` is processed.
    pub fn check(&mut self, now: Duration) -> bool {
        if let Some(last) = self.last_accepted {
            // gap < 1e9 / fps, without rounding the interval
            let gap = now.saturating_sub(last).as_nanos();
            if gap * (self.fps as u128) < NANOS_PER_SEC {
                return false;
            }
        }
        self.last_accepted = Some(now);
        true
    }

    pub fn last_accepted(&self) -> Option<Duration> {
        self.last_accepted
    }
}
