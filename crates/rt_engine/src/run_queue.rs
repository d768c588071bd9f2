//! Component C: the affinity-aware global run queue (spec §4.C).
//!
//! A single mutex guards a plain `VecDeque`. [`RunQueue::take_for`] is an
//! O(n) scan rather than an O(1) pop because hard-affinity contexts must be
//! found regardless of their position in the queue; `n` is bounded by the
//! number of currently-queued contexts, which in practice is small (most
//! contexts are delivered directly via the sleep/wake protocol and never
//! touch the queue at all).

use std::collections::VecDeque;
use std::sync::Mutex;

use crate::context::Context;
use crate::ids::EngineId;

pub struct RunQueue {
    contexts: Mutex<VecDeque<Context>>,
}

impl Default for RunQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl RunQueue {
    pub fn new() -> Self {
        Self { contexts: Mutex::new(VecDeque::new()) }
    }

    /// Appends a context to the tail (oldest-first fallback, spec §4.C).
    pub fn push(&self, ctx: Context) {
        self.contexts.lock().unwrap_or_else(|p| p.into_inner()).push_back(ctx);
    }

    /// Finds a context for `engine_id` at call depth `c_call_depth`.
    ///
    /// Priority, matching `MR_find_ready_context`:
    /// 1. A context whose hard affinity names this exact engine at this
    ///    exact call depth (taken immediately, breaking the scan).
    /// 2. The *first* context (in queue order) whose preferred engine is
    ///    this engine and which carries no hard affinity elsewhere.
    /// 3. Failing both, the *first* context with no preference at all
    ///    (oldest-first fallback).
    ///
    /// Only one candidate is remembered per tier during the scan: the first
    /// preferred-engine match and the first no-preference match each win
    /// their tier; a hard-affinity match short-circuits the whole scan.
    pub fn take_for(&self, engine_id: EngineId, c_call_depth: u32) -> Option<Context> {
        let mut contexts = self.contexts.lock().unwrap_or_else(|p| p.into_inner());

        if let Some(pos) = contexts.iter().position(|ctx| {
            ctx.hard_affinity()
                .is_some_and(|aff| aff.engine == engine_id && aff.c_call_depth == c_call_depth)
        }) {
            return contexts.remove(pos);
        }

        let mut preferred_pos = None;
        let mut fallback_pos = None;
        for (i, ctx) in contexts.iter().enumerate() {
            if ctx.hard_affinity().is_some() {
                continue;
            }
            if preferred_pos.is_none() && ctx.preferred_engine() == Some(engine_id) {
                preferred_pos = Some(i);
            }
            if fallback_pos.is_none() && ctx.preferred_engine().is_none() {
                fallback_pos = Some(i);
            }
        }

        let pos = preferred_pos.or(fallback_pos)?;
        contexts.remove(pos)
    }

    pub fn len(&self) -> usize {
        self.contexts.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ContextPool, HardAffinity, SizeClass};

    fn noop() -> crate::context::Job {
        Box::new(|_| {})
    }

    #[test]
    fn hard_affinity_match_wins_regardless_of_queue_position() {
        let pool = ContextPool::new();
        let queue = RunQueue::new();

        let (mut plain, _) = pool.acquire(SizeClass::Regular, noop());
        plain.set_preferred_engine(Some(EngineId::new(0)));
        queue.push(plain);

        let (mut affine, _) = pool.acquire(SizeClass::Regular, noop());
        let affine_id = affine.id();
        affine.set_hard_affinity(Some(HardAffinity { engine: EngineId::new(3), c_call_depth: 2 }));
        queue.push(affine);

        let taken = queue.take_for(EngineId::new(3), 2).expect("context available");
        assert_eq!(taken.id(), affine_id);
    }

    #[test]
    fn preferred_engine_beats_oldest_no_preference_context() {
        let pool = ContextPool::new();
        let queue = RunQueue::new();

        let (plain, _) = pool.acquire(SizeClass::Regular, noop());
        let plain_id = plain.id();
        queue.push(plain);

        let (mut preferred, _) = pool.acquire(SizeClass::Regular, noop());
        preferred.set_preferred_engine(Some(EngineId::new(1)));
        let preferred_id = preferred.id();
        queue.push(preferred);

        let taken = queue.take_for(EngineId::new(1), 0).expect("context available");
        assert_eq!(taken.id(), preferred_id);
        assert_ne!(taken.id(), plain_id);
    }

    #[test]
    fn falls_back_to_oldest_unpreferenced_context() {
        let pool = ContextPool::new();
        let queue = RunQueue::new();

        let (first, _) = pool.acquire(SizeClass::Regular, noop());
        let first_id = first.id();
        queue.push(first);
        queue.push(pool.acquire(SizeClass::Regular, noop()).0);

        let taken = queue.take_for(EngineId::new(5), 0).expect("context available");
        assert_eq!(taken.id(), first_id);
    }

    #[test]
    fn empty_queue_yields_nothing() {
        let queue = RunQueue::new();
        assert!(queue.take_for(EngineId::new(0), 0).is_none());
    }
}
