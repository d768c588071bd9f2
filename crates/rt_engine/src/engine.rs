//! Components E/F: the idle-loop dispatcher and its three entry points
//! (spec §4.E), and the engine-local state a running engine thread owns.
//!
//! A job closure ([`Job`]) has no return value, so it cannot hand a
//! "what's next" answer back to the dispatcher directly. Instead a job
//! that wants to transition the engine (continue past a join, go dirty, go
//! clean) leaves a [`PendingTransition`] on [`EngineLocal`] through
//! [`Handle`] before returning; [`run_job`] reads it back out once the
//! closure call unwinds. This is the same "ambient state passed through the
//! handle" pattern [`Handle::current_snapshot`] uses.

use std::cell::RefCell;
use std::sync::Arc;

use tracing::trace;

use crate::context::{Context, Job, ParentSnapshot, SizeClass};
use crate::deque::Steal;
use crate::ids::{ContextId, EngineId};
use crate::lifecycle::{Handle, RuntimeInner};
use crate::sleep_sync::WakeAction;
use crate::spark::{Spark, SyncTerm};

/// What a job asked the engine to do once it returns (spec §4.F's three
/// continuation shapes, plus the plain "nothing to do" default).
pub(crate) enum PendingTransition {
    /// Run this job immediately, keeping whatever context is currently
    /// held (join_and_continue cases 2a and 3a).
    RunJobNow(Job),
    /// Park `local`'s current context against `sync_term` (once probes
    /// fail) and continue probing as dirty (case 2b).
    EnterDirty(Arc<SyncTerm>, Job),
    /// The held context (if any) has already been handled by the caller;
    /// continue probing as clean (case 3b, and the plain "job finished"
    /// default).
    EnterClean,
}

/// Per-OS-thread state owned by exactly one engine; never shared.
pub(crate) struct EngineLocal {
    pub(crate) id: EngineId,
    current: RefCell<Option<Context>>,
    snapshot: RefCell<ParentSnapshot>,
    victim_hint: RefCell<usize>,
    c_call_depth: RefCell<u32>,
    pending: RefCell<Option<PendingTransition>>,
}

impl EngineLocal {
    pub(crate) fn new(id: EngineId) -> Self {
        Self {
            id,
            current: RefCell::new(None),
            snapshot: RefCell::new(ParentSnapshot::default()),
            victim_hint: RefCell::new(id.index() + 1),
            c_call_depth: RefCell::new(0),
            pending: RefCell::new(None),
        }
    }

    pub(crate) fn current_snapshot(&self) -> ParentSnapshot {
        *self.snapshot.borrow()
    }

    pub(crate) fn c_call_depth(&self) -> u32 {
        *self.c_call_depth.borrow()
    }

    pub(crate) fn take_current(&self) -> Option<Context> {
        self.current.borrow_mut().take()
    }

    pub(crate) fn set_current(&self, ctx: Context) {
        *self.current.borrow_mut() = Some(ctx);
    }

    pub(crate) fn has_current(&self) -> bool {
        self.current.borrow().is_some()
    }

    pub(crate) fn current_id(&self) -> Option<ContextId> {
        self.current.borrow().as_ref().map(|c| c.id())
    }

    pub(crate) fn set_pending(&self, transition: PendingTransition) {
        *self.pending.borrow_mut() = Some(transition);
    }

    pub(crate) fn take_pending(&self) -> Option<PendingTransition> {
        self.pending.borrow_mut().take()
    }
}

/// Which idle loop an engine is running (spec §4.E).
pub(crate) enum IdleMode {
    /// Entered once, at engine startup.
    Initial,
    /// Entered with no context held: after a branch finishes on a foreign
    /// engine, or after any probe comes up empty with nothing dirty.
    Clean,
    /// Entered still holding the context that originated `sync_term`; it
    /// must eventually be parked before this engine can get fresh work or
    /// sleep.
    Dirty { sync_term: Arc<SyncTerm>, join_label: Job },
}

/// The engine thread's top-level loop: run [`IdleMode::Initial`], then
/// whichever mode each probe/job hands back, until `None` (shutdown).
pub(crate) fn run_engine(inner: &Arc<RuntimeInner>, id: EngineId) {
    let local = EngineLocal::new(id);
    let mut mode = Some(IdleMode::Initial);

    while let Some(current) = mode {
        mode = idle_once(inner, &local, current);
    }
}

fn idle_once(inner: &Arc<RuntimeInner>, local: &EngineLocal, mode: IdleMode) -> Option<IdleMode> {
    match mode {
        IdleMode::Initial => initial_probe(inner, local),
        IdleMode::Clean => clean_probe(inner, local),
        IdleMode::Dirty { sync_term, join_label } => dirty_probe(inner, local, sync_term, join_label),
    }
}

fn local_spark(inner: &RuntimeInner, local: &EngineLocal) -> Option<Spark> {
    let spark = inner.deques[local.id.index()].pop_bottom();
    if spark.is_some() {
        inner.profile.record_local_spark_executed();
    }
    spark
}

/// Attempts a steal, honoring the `max_outstanding_contexts` cap (spec
/// §4.E): if this engine holds no context and the pool already has as many
/// outstanding as the cap allows, stealing would force a fresh context past
/// that cap, so theft is skipped entirely rather than attempted and wasted.
fn work_steal(inner: &RuntimeInner, local: &EngineLocal) -> Option<Spark> {
    if !local.has_current()
        && let Some(cap) = inner.config.max_outstanding_contexts
        && inner.pool.outstanding() >= cap as i64
    {
        return None;
    }

    let n = inner.sleep_sync.engine_count();
    if n <= 1 {
        return None;
    }
    let start = *local.victim_hint.borrow() % n;
    for offset in 0..n - 1 {
        let victim = (start + offset) % n;
        if victim == local.id.index() {
            continue;
        }
        loop {
            match inner.deques[victim].steal_top() {
                Steal::Success(spark) => {
                    *local.victim_hint.borrow_mut() = victim;
                    inner.profile.record_stolen_spark_executed();
                    return Some(spark);
                }
                Steal::Abort => continue,
                Steal::Empty => break,
            }
        }
    }
    None
}

fn get_context(inner: &RuntimeInner, local: &EngineLocal) -> Option<Context> {
    let ctx = inner.run_queue.take_for(local.id, local.c_call_depth());
    if ctx.is_some() {
        inner.profile.record_context_resumed();
    }
    ctx
}

fn initial_probe(inner: &Arc<RuntimeInner>, local: &EngineLocal) -> Option<IdleMode> {
    if let Some(spark) = local_spark(inner, local) {
        return run_fresh_spark(inner, local, spark);
    }
    inner.sleep_sync.advertise_idle(local.id);
    if let Some(ctx) = get_context(inner, local) {
        inner.sleep_sync.advertise_working(local.id);
        return run_context(inner, local, ctx);
    }
    if let Some(spark) = work_steal(inner, local) {
        inner.sleep_sync.advertise_working(local.id);
        return run_fresh_spark(inner, local, spark);
    }
    inner.profile.record_executed_nothing();
    sleep_and_dispatch(inner, local, IdleMode::Initial)
}

fn clean_probe(inner: &Arc<RuntimeInner>, local: &EngineLocal) -> Option<IdleMode> {
    if let Some(spark) = local_spark(inner, local) {
        return run_fresh_spark(inner, local, spark);
    }
    inner.sleep_sync.advertise_idle(local.id);
    if let Some(spark) = work_steal(inner, local) {
        inner.sleep_sync.advertise_working(local.id);
        return run_fresh_spark(inner, local, spark);
    }
    if let Some(ctx) = get_context(inner, local) {
        inner.sleep_sync.advertise_working(local.id);
        return run_context(inner, local, ctx);
    }
    inner.profile.record_executed_nothing();
    sleep_and_dispatch(inner, local, IdleMode::Clean)
}

fn dirty_probe(
    inner: &Arc<RuntimeInner>,
    local: &EngineLocal,
    sync_term: Arc<SyncTerm>,
    join_label: Job,
) -> Option<IdleMode> {
    let mut join_label = Some(join_label);

    if let Some(spark) = local_spark(inner, local) {
        return run_spark_in_dirty_mode(inner, local, spark, &sync_term, &mut join_label);
    }
    inner.sleep_sync.advertise_idle(local.id);
    if let Some(spark) = work_steal(inner, local) {
        inner.sleep_sync.advertise_working(local.id);
        return run_spark_in_dirty_mode(inner, local, spark, &sync_term, &mut join_label);
    }

    // Unconditional: both probes failed, so the dirty context must be
    // parked before this engine can take fresh work or sleep (spec §4.E,
    // the dirty idle loop's final fallback).
    park_held_context(local, &sync_term, &mut join_label);

    if let Some(ctx) = get_context(inner, local) {
        inner.sleep_sync.advertise_working(local.id);
        return run_context(inner, local, ctx);
    }
    inner.profile.record_executed_nothing();
    sleep_and_dispatch(inner, local, IdleMode::Clean)
}

fn park_held_context(local: &EngineLocal, sync_term: &Arc<SyncTerm>, join_label: &mut Option<Job>) {
    if let Some(label) = join_label.take() {
        let ctx = local.take_current().expect("dirty mode must hold a context to park");
        sync_term.park_origin(ctx, label);
    }
}

/// Runs a spark pulled while the engine holds no context (Initial/Clean
/// probes never hold one): always provisions a fresh-or-reused context
/// from the pool.
fn run_fresh_spark(inner: &Arc<RuntimeInner>, local: &EngineLocal, spark: Spark) -> Option<IdleMode> {
    debug_assert!(!local.has_current());
    let (ctx, reuse) = inner.pool.acquire(SizeClass::Small, spark.resume);
    inner.profile.record_context_provisioned(SizeClass::Small, reuse);
    local.set_current(ctx);
    *local.snapshot.borrow_mut() = spark.snapshot;
    run_held_context(inner, local)
}

/// Runs a spark found while dirty: reuses the held context if the spark
/// belongs to the *same* sync term (a sibling branch of the join we're
/// already waiting on), otherwise parks the held context first (spec
/// §4.E's `prepare_engine_for_spark` compatibility check) and provisions a
/// fresh one for the spark.
fn run_spark_in_dirty_mode(
    inner: &Arc<RuntimeInner>,
    local: &EngineLocal,
    spark: Spark,
    held_sync_term: &Arc<SyncTerm>,
    join_label: &mut Option<Job>,
) -> Option<IdleMode> {
    let compatible = local.current_id() == Some(held_sync_term.origin_id())
        && spark.sync_term().origin_id() == held_sync_term.origin_id();

    if compatible {
        let mut held = local.take_current().expect("compatible reuse requires a held context");
        held.resume = Some(spark.resume);
        local.set_current(held);
    } else {
        park_held_context(local, held_sync_term, join_label);
        let (ctx, reuse) = inner.pool.acquire(SizeClass::Small, spark.resume);
        inner.profile.record_context_provisioned(SizeClass::Small, reuse);
        local.set_current(ctx);
    }

    *local.snapshot.borrow_mut() = spark.snapshot;
    run_held_context(inner, local)
}

fn run_context(inner: &Arc<RuntimeInner>, local: &EngineLocal, mut ctx: Context) -> Option<IdleMode> {
    let resume = ctx.resume.take().expect("scheduled context has no resume point");
    local.set_current(ctx);
    run_job(inner, local, resume)
}

fn run_held_context(inner: &Arc<RuntimeInner>, local: &EngineLocal) -> Option<IdleMode> {
    let resume = {
        let mut current = local.current.borrow_mut();
        current.as_mut().expect("a context was just set").resume.take()
    }
    .expect("a freshly provisioned context always carries a resume point");
    run_job(inner, local, resume)
}

/// Invokes `job`, then acts on whatever [`PendingTransition`] it left
/// behind through the [`Handle`] (spec §4.F's continuation shapes).
///
/// Note on recursion: a chain of back-to-back, non-blocking joins (cases
/// 2a/3a) recurses through this function once per link in the chain,
/// rather than trampolining through a flat loop the way the original's
/// `MR_GOTO`-based dispatch does. The assembly-level trampolining that
/// avoids native stack growth belongs to the bytecode interpreter, which is
/// out of scope here (spec §1); this recursion is bounded by how many
/// joins a single synchronous burst chains together, not by the runtime's
/// total lifetime.
fn run_job(inner: &Arc<RuntimeInner>, local: &EngineLocal, job: Job) -> Option<IdleMode> {
    let handle = Handle::new(inner, local);
    job(&handle);

    match local.take_pending() {
        Some(PendingTransition::RunJobNow(next)) => run_job(inner, local, next),
        Some(PendingTransition::EnterDirty(sync_term, join_label)) => {
            dirty_probe(inner, local, sync_term, join_label)
        }
        Some(PendingTransition::EnterClean) => clean_probe(inner, local),
        None => {
            if let Some(ctx) = local.take_current() {
                trace!(engine = %local.id, context = ?ctx.id(), "job finished without an explicit transition");
                inner.pool.release(ctx);
            }
            clean_probe(inner, local)
        }
    }
}

fn sleep_and_dispatch(inner: &Arc<RuntimeInner>, local: &EngineLocal, on_spurious: IdleMode) -> Option<IdleMode> {
    match inner.sleep_sync.sleep(local.id) {
        None => Some(on_spurious),
        Some(WakeAction::Shutdown) => None,
        Some(WakeAction::Context(ctx)) => {
            inner.profile.record_context_resumed();
            run_context(inner, local, ctx)
        }
        Some(WakeAction::WorkSteal { victim }) => {
            *local.victim_hint.borrow_mut() = victim.index();
            match work_steal(inner, local) {
                Some(spark) => run_fresh_spark(inner, local, spark),
                None => Some(on_spurious),
            }
        }
    }
}
