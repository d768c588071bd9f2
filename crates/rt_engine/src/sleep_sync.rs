//! Component D: per-engine sleep/wake synchronization (spec §4.D).
//!
//! Each engine owns two semaphores and a state bitmask. A waker acquires
//! the wake semaphore (serializing concurrent wakers), checks the target's
//! state against an allowed mask, and if it matches, stashes an action,
//! marks the state `WOKEN`, and posts the sleep semaphore. The target
//! engine's own sleep loop is the only place that ever transitions a state
//! *into* `SLEEPING`, which is what keeps the allowed-mask check race-free:
//! by the time a waker observes `SLEEPING` under the wake lock, the target
//! is already parked on its sleep semaphore and cannot race the observation
//! away.

use std::sync::atomic::{AtomicI64, AtomicU8, Ordering};
use std::sync::Mutex;

use rt_sync::{CachePadded, Semaphore};

use crate::context::Context;
use crate::ids::EngineId;

/// Engine lifecycle/availability state (spec §4.D).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EngineState {
    /// Actively running a context or spark.
    Working = 0,
    /// Has no context/spark and is about to (or currently does) probe for
    /// work rather than sleep.
    Idle = 1,
    /// Parked on its sleep semaphore.
    Sleeping = 2,
    /// Woken (an action has been stashed) but has not yet consumed it.
    Woken = 3,
}

impl EngineState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => EngineState::Working,
            1 => EngineState::Idle,
            2 => EngineState::Sleeping,
            3 => EngineState::Woken,
            other => unreachable!("invalid engine state byte {other}"),
        }
    }

    fn matches_mask(self, mask: u8) -> bool {
        (mask >> (self as u8)) & 1 == 1
    }
}

/// A bitmask of allowed [`EngineState`]s for a wake attempt.
#[derive(Debug, Clone, Copy)]
pub struct StateMask(u8);

impl StateMask {
    pub const IDLE: StateMask = StateMask(1 << EngineState::Idle as u8);
    pub const SLEEPING: StateMask = StateMask(1 << EngineState::Sleeping as u8);

    pub const fn or(self, other: StateMask) -> StateMask {
        StateMask(self.0 | other.0)
    }
}

/// Work handed to a freshly-woken engine.
pub enum WakeAction {
    Context(Context),
    WorkSteal { victim: EngineId },
    Shutdown,
}

struct WakeSlot {
    state: AtomicU8,
    action: Mutex<Option<WakeAction>>,
    sleep_sem: Semaphore,
    wake_sem: Semaphore,
}

impl WakeSlot {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(EngineState::Working as u8),
            action: Mutex::new(None),
            sleep_sem: Semaphore::new(0),
            wake_sem: Semaphore::new(1),
        }
    }
}

/// Sleep/wake synchronizers for every engine plus the shared idle counter.
pub struct SleepSync {
    slots: Box<[CachePadded<WakeSlot>]>,
    idle_engines: AtomicI64,
}

impl SleepSync {
    pub fn new(engine_count: usize) -> Self {
        let slots = (0..engine_count).map(|_| CachePadded::new(WakeSlot::new())).collect();
        Self { slots, idle_engines: AtomicI64::new(0) }
    }

    pub fn engine_count(&self) -> usize {
        self.slots.len()
    }

    pub fn idle_engine_count(&self) -> i64 {
        self.idle_engines.load(Ordering::Relaxed)
    }

    /// Advertises that `engine` has no work and is about to probe/sleep
    /// (spec §4.D). Release-fenced so a concurrent scheduler sees the
    /// updated idle count before it decides whether a direct wake is worth
    /// attempting.
    pub fn advertise_idle(&self, engine: EngineId) {
        self.idle_engines.fetch_add(1, Ordering::Relaxed);
        std::sync::atomic::fence(Ordering::Release);
        self.slots[engine.index()].state.store(EngineState::Idle as u8, Ordering::Relaxed);
    }

    /// The inverse of [`Self::advertise_idle`], called once the engine has
    /// secured work.
    pub fn advertise_working(&self, engine: EngineId) {
        self.slots[engine.index()].state.store(EngineState::Working as u8, Ordering::Relaxed);
        std::sync::atomic::fence(Ordering::Release);
        self.idle_engines.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn state_of(&self, engine: EngineId) -> EngineState {
        EngineState::from_u8(self.slots[engine.index()].state.load(Ordering::Acquire))
    }

    /// Parks the calling engine's thread until woken, returning the action
    /// it was woken with (`None` on a spurious wake, matching
    /// `MR_ENGINE_ACTION_NONE`).
    pub fn sleep(&self, engine: EngineId) -> Option<WakeAction> {
        let slot = &self.slots[engine.index()];
        slot.state.store(EngineState::Sleeping as u8, Ordering::Relaxed);
        std::sync::atomic::fence(Ordering::Release);
        slot.sleep_sem.wait();
        std::sync::atomic::fence(Ordering::Acquire);
        slot.action.lock().unwrap_or_else(|p| p.into_inner()).take()
    }

    /// Attempts to wake exactly `engine`, only if its current state is in
    /// `allowed`. Returns the action back on failure so the caller can fall
    /// back to another delivery path (e.g. the run queue).
    pub fn try_wake_engine(
        &self,
        engine: EngineId,
        action: WakeAction,
        allowed: StateMask,
    ) -> Result<(), WakeAction> {
        let slot = &self.slots[engine.index()];
        let _wake_guard = WakeGuard::acquire(&slot.wake_sem);

        let state = EngineState::from_u8(slot.state.load(Ordering::Acquire));
        if !state.matches_mask(allowed.0) {
            return Err(action);
        }

        *slot.action.lock().unwrap_or_else(|p| p.into_inner()) = Some(action);
        slot.state.store(EngineState::Woken as u8, Ordering::Relaxed);
        std::sync::atomic::fence(Ordering::Release);
        slot.sleep_sem.post();
        Ok(())
    }

    /// Wakes the first `SLEEPING` engine found scanning from `preferred`
    /// (inclusive) around the ring, skipping none explicitly: the calling
    /// engine (if any) can never itself be observed `SLEEPING` while it is
    /// the one making this call.
    pub fn try_wake_any(&self, preferred: EngineId, action: WakeAction) -> Result<(), WakeAction> {
        let n = self.slots.len();
        let start = preferred.index();
        let mut action = Some(action);
        for offset in 0..n {
            let idx = (start + offset) % n;
            let engine = EngineId::new(idx as u32);
            if self.state_of(engine) != EngineState::Sleeping {
                continue;
            }
            match self.try_wake_engine(engine, action.take().unwrap(), StateMask::SLEEPING) {
                Ok(()) => return Ok(()),
                Err(returned) => action = Some(returned),
            }
        }
        Err(action.unwrap())
    }
}

/// Ensures the wake semaphore is released even if the body above panics.
struct WakeGuard<'a> {
    sem: &'a Semaphore,
}

impl<'a> WakeGuard<'a> {
    fn acquire(sem: &'a Semaphore) -> Self {
        sem.wait();
        Self { sem }
    }
}

impl Drop for WakeGuard<'_> {
    fn drop(&mut self) {
        self.sem.post();
    }
}
