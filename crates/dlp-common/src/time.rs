use core::time::Duration;

/// An opaque monotonic timestamp, in nanoseconds since some unspecified
/// epoch fixed for the lifetime of a `Clock` implementor.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Instant {
    nanos: u64,
}

impl Instant {
    pub const fn new(nanos: u64) -> Self {
        Instant { nanos }
    }

    pub const fn nanos(self) -> u64 {
        self.nanos
    }

    /// Nanoseconds elapsed between `self` and `later`. Saturates to zero if
    /// `later` is not actually later, which can legitimately happen across a
    /// clock wraparound.
    pub fn elapsed_until(self, later: Instant) -> Duration {
        Duration::from_nanos(later.nanos.saturating_sub(self.nanos))
    }
}

/// A stored deadline, produced by `Clock::deadline_after`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Timer {
    deadline: Instant,
}

pub enum TimeDirection {
    Forward(Duration),
    Backward(Duration),
}

/// The monotonic millisecond clock external collaborator (see the Clock
/// contract). Implementors back this with whatever ticking hardware timer
/// or OS monotonic clock is available; the protocol engine only ever reads
/// `current_instant` and compares `Timer`s derived from it.
pub trait Clock {
    fn current_nanos(&self) -> u64;

    fn current_instant(&self) -> Instant {
        Instant::new(self.current_nanos())
    }

    /// Starts a down-timer that expires `duration` from now.
    fn deadline_after(&self, duration: Duration) -> Timer {
        Timer {
            deadline: Instant::new(self.current_nanos() + duration.as_nanos() as u64),
        }
    }

    /// Starts a down-timer that expires `ms` milliseconds from now. This is
    /// the direct equivalent of the source's `TimerDownTimerStartMs`.
    fn start_down_timer_ms(&self, ms: u32) -> Timer {
        self.deadline_after(Duration::from_millis(ms as u64))
    }

    fn is_expired(&self, timer: &Timer) -> bool {
        self.current_instant().nanos() >= timer.deadline.nanos()
    }

    fn elapsed_since(&self, instant: Instant) -> Duration {
        instant.elapsed_until(self.current_instant())
    }

    /// Reliably calculates the direction of time between two instants,
    /// taking into account limitations of the current clock (e.g. when the
    /// underlying counter wraps back to zero).
    fn time_direction(&self, possible_newer: Instant, possible_older: Instant) -> TimeDirection {
        if possible_newer.nanos() >= possible_older.nanos() {
            TimeDirection::Forward(possible_older.elapsed_until(possible_newer))
        } else {
            TimeDirection::Backward(possible_newer.elapsed_until(possible_older))
        }
    }
}
