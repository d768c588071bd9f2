//! Sparks and the join barrier they report back to (spec §4.B, §4.F).

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::context::{Context, Job, ParentSnapshot};
use crate::ids::ContextId;

/// A unit of stealable parallel work: a closure plus the barrier it must
/// report to when it finishes.
pub struct Spark {
    pub(crate) resume: Job,
    pub(crate) sync_term: Arc<SyncTerm>,
    pub(crate) snapshot: ParentSnapshot,
}

impl Spark {
    pub fn new(resume: Job, sync_term: Arc<SyncTerm>, snapshot: ParentSnapshot) -> Self {
        Self { resume, sync_term, snapshot }
    }

    pub fn sync_term(&self) -> &Arc<SyncTerm> {
        &self.sync_term
    }
}

/// The barrier shared by every branch of one parallel conjunction (spec
/// §4.F). `remaining` starts at the branch count and is decremented by
/// [`SyncTerm::arrive`] as each branch finishes; the branch that drives it
/// to zero continues past the join.
///
/// `origin` is the parking slot for the originating context once it goes
/// "dirty" (spec §4.E/§4.F): the original implementation reaches the
/// originating context through a raw pointer that stays valid for the
/// term's whole lifetime. Rust has no equivalent for a value that is
/// sometimes "owned by the executing engine" and sometimes "parked,
/// reachable by address". An `Arc<Mutex<Option<Context>>>` models the same
/// thing safely: the context is moved into the slot exactly when it is
/// detached from its engine, and a late-arriving foreign branch takes it
/// back out.
pub struct SyncTerm {
    remaining: AtomicUsize,
    origin_id: ContextId,
    origin: Mutex<Option<Context>>,
    /// Set (Release) once `origin`'s contents are safe to observe, so the
    /// busy-waiting foreign branch (spec §4.F step 3a) has something
    /// race-free to poll instead of repeatedly locking the mutex.
    published: AtomicBool,
}

impl SyncTerm {
    pub fn new(branch_count: usize, origin_id: ContextId) -> Arc<Self> {
        assert!(branch_count > 0, "a sync term must have at least one branch");
        Arc::new(Self {
            remaining: AtomicUsize::new(branch_count),
            origin_id,
            origin: Mutex::new(None),
            published: AtomicBool::new(false),
        })
    }

    pub fn origin_id(&self) -> ContextId {
        self.origin_id
    }

    /// Decrements the outstanding-branch count. Returns `true` if this call
    /// observed the count drop to zero, i.e. this is the branch that must
    /// continue past the join (spec invariant I4: exactly one arrival sees
    /// zero).
    pub(crate) fn arrive(&self) -> bool {
        let previous = self.remaining.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "sync term decremented past zero");
        previous == 1
    }

    /// Parks the originating context, recording `join_label` as its resume
    /// point, and publishes it for a foreign last-arriver to pick up.
    pub(crate) fn park_origin(&self, mut ctx: Context, join_label: Job) {
        debug_assert_eq!(ctx.id(), self.origin_id);
        ctx.resume = Some(join_label);
        *self.origin.lock().unwrap_or_else(|p| p.into_inner()) = Some(ctx);
        self.published.store(true, Ordering::Release);
    }

    /// Busy-wait (spec §4.F / §9: never blocks) until the originating
    /// context has been parked, then takes ownership of it.
    pub(crate) fn take_origin_spinning(&self) -> Context {
        let backoff = rt_sync::Backoff::new();
        while !self.published.load(Ordering::Acquire) {
            backoff.snooze();
        }
        self.origin
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
            .expect("sync term published but origin slot was empty")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::ContextIdGen;

    #[test]
    fn arrive_reports_zero_exactly_once() {
        let term = SyncTerm::new(3, ContextIdGen::new().next());
        assert!(!term.arrive());
        assert!(!term.arrive());
        assert!(term.arrive());
    }

    #[test]
    #[should_panic(expected = "decremented past zero")]
    fn arriving_past_zero_is_a_bug() {
        let term = SyncTerm::new(1, ContextIdGen::new().next());
        assert!(term.arrive());
        term.arrive();
    }
}
