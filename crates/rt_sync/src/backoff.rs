//! See <https://docs.rs/crate/crossbeam-utils/lastest>
//!
//! - Version: 0.8.21

use std::cell::Cell;
use std::fmt;

/// The maximum exponent of spin count.
const SPIN_LIMIT: u32 = 5;

/// Performs exponential backoff in spin loops.
///
/// Backing off in spin loops reduces contention and improves overall
/// performance. This is the pause-spin hint used by [`join_and_continue`]'s
/// busy-wait (spec §4.F / §9): it must never escalate to a blocking wait,
/// only to yielding the timeslice.
///
/// [`join_and_continue`]: ../rt_engine/fn.join_and_continue.html
pub struct Backoff {
    step: Cell<u32>,
}

impl Backoff {
    /// Creates a new `Backoff`.
    #[inline(always)]
    pub const fn new() -> Self {
        Self { step: Cell::new(0) }
    }

    /// Resets the backoff counter back to its initial state.
    #[inline(always)]
    pub fn reset(&self) {
        self.step.set(0);
    }

    /// Backs off in a lock-free loop.
    ///
    /// Executes the `PAUSE` instruction a number of times proportional to the
    /// number of prior calls, without ever yielding the thread to the OS.
    #[inline(always)]
    pub fn spin(&self) {
        let step: u32 = 1 << self.step.get();
        for _ in 0..step {
            std::hint::spin_loop();
        }

        if self.step.get() < SPIN_LIMIT {
            self.step.set(self.step.get() + 1);
        }
    }

    /// Backs off, eventually falling back to yielding the thread's timeslice.
    ///
    /// Use this when waiting on a condition that another thread must publish
    /// (e.g. the join busy-wait), never as a substitute for a blocking wait.
    #[inline]
    pub fn snooze(&self) {
        if self.step.get() < SPIN_LIMIT {
            let step: u32 = 1 << (self.step.get() << 1);

            for _ in 0..step {
                std::hint::spin_loop();
            }

            self.step.set(self.step.get() + 1);
        } else {
            std::thread::yield_now();
        }
    }
}

impl fmt::Debug for Backoff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Backoff").field("step", &self.step).finish()
    }
}

impl Default for Backoff {
    #[inline(always)]
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spin_does_not_panic_and_caps_step() {
        let backoff = Backoff::new();
        for _ in 0..20 {
            backoff.spin();
        }
        assert_eq!(backoff.step.get(), SPIN_LIMIT);
    }

    #[test]
    fn reset_returns_to_zero() {
        let backoff = Backoff::new();
        backoff.spin();
        backoff.spin();
        backoff.reset();
        assert_eq!(backoff.step.get(), 0);
    }
}
