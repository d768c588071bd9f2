//! External interfaces: runtime configuration, startup/shutdown, and the
//! handle jobs use to call back into the scheduler (spec §4.H).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use tracing::{debug, info};

use crate::affinity;
use crate::context::{Context, ContextPool, HardAffinity, Job, ParentSnapshot, SizeClass, StackSizes};
use crate::deque::Deque;
use crate::engine::{self, EngineLocal};
use crate::error::{Result, RuntimeError};
use crate::ids::EngineId;
use crate::join;
use crate::pending_io::{IoMode, PendingIo, RawFd};
use crate::profile::{ProfileCounters, ProfileReport};
use crate::run_queue::RunQueue;
use crate::sleep_sync::{SleepSync, StateMask, WakeAction};
use crate::spark::{Spark, SyncTerm};

/// Default filename for the profiling report [`Runtime::shutdown`] writes
/// when [`RuntimeConfig::enable_profiling`] is set (spec §4.H/§6).
pub const DEFAULT_PROFILE_FILE_NAME: &str = "parallel_execution_profile.txt";

/// Configuration for [`init_runtime`] (spec §4.G/§4.H).
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Number of engine threads to start. Defaults to the platform's
    /// available parallelism.
    pub engine_count: usize,
    /// Whether to pin each engine thread to a CPU core at startup (spec
    /// §6, `enable_pinning`).
    pub pin_to_cpus: bool,
    /// CPU index the launching (primordial) thread is assumed to already
    /// occupy; engine placement skips it (spec §4.G).
    pub primordial_cpu: usize,
    /// Per-size-class stack word counts (spec §6, "per-class stack sizes":
    /// det, nondet, small-det, small-nondet, generator-det, generator-nondet,
    /// trail, gen, cut, pneg). Real stack allocation is out of scope; these
    /// only size the bookkeeping [`crate::context::Context`] carries.
    pub stack_sizes: StackSizes,
    /// Initial capacity of each engine's spark deque. Growth beyond
    /// `deque_initial_capacity * deque_length_factor` is a fatal invariant
    /// violation (spec §4.B), matching the fixed-size array the reference
    /// runtime sizes at startup.
    pub deque_initial_capacity: usize,
    /// Multiplies `deque_initial_capacity` to bound a deque's maximum
    /// buffer size (spec §6, `deque_length_factor`). `None` leaves the
    /// deque free to keep doubling.
    pub deque_length_factor: Option<usize>,
    /// Caps how many contexts may be outstanding (not on a free list) at
    /// once; work-stealing refuses to provision a fresh context past this
    /// cap (spec §4.E/§6, `max_outstanding_contexts`). `None` means
    /// unbounded.
    pub max_outstanding_contexts: Option<usize>,
    /// Whether [`Runtime::shutdown`] writes a [`ProfileReport`] to
    /// `profile_file_name` (spec §4.H/§6, `enable_profiling`).
    pub enable_profiling: bool,
    /// Path the profiling report is written to when `enable_profiling` is
    /// set. Defaults to [`DEFAULT_PROFILE_FILE_NAME`] in the current
    /// directory.
    pub profile_file_name: std::path::PathBuf,
    /// Prefix used when naming engine threads (diagnostics only).
    pub thread_name_prefix: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            engine_count: std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1),
            pin_to_cpus: true,
            primordial_cpu: 0,
            stack_sizes: StackSizes::default(),
            deque_initial_capacity: 32,
            deque_length_factor: None,
            max_outstanding_contexts: None,
            enable_profiling: false,
            profile_file_name: std::path::PathBuf::from(DEFAULT_PROFILE_FILE_NAME),
            thread_name_prefix: "rt-engine".to_string(),
        }
    }
}

pub(crate) struct RuntimeInner {
    pub(crate) deques: Box<[Deque<Spark>]>,
    pub(crate) run_queue: RunQueue,
    pub(crate) sleep_sync: SleepSync,
    pub(crate) pool: ContextPool,
    pub(crate) profile: ProfileCounters,
    pub(crate) pending_io: PendingIo,
    pub(crate) shutting_down: AtomicBool,
    pub(crate) config: RuntimeConfig,
}

impl RuntimeInner {
    fn new(config: RuntimeConfig) -> Self {
        let max_capacity =
            config.deque_length_factor.map(|factor| config.deque_initial_capacity.next_power_of_two().max(2) * factor);
        let deques = (0..config.engine_count)
            .map(|_| Deque::with_capacity_bound(config.deque_initial_capacity, max_capacity))
            .collect();
        Self {
            deques,
            run_queue: RunQueue::new(),
            sleep_sync: SleepSync::new(config.engine_count),
            pool: ContextPool::with_stack_sizes(config.stack_sizes),
            profile: ProfileCounters::default(),
            pending_io: PendingIo::new(),
            shutting_down: AtomicBool::new(false),
            config,
        }
    }

    #[cfg(test)]
    pub(crate) fn for_tests(config: RuntimeConfig) -> Self {
        Self::new(config)
    }
}

/// A running parallel execution core: `engine_count` engine threads plus
/// the shared scheduling state they coordinate through.
pub struct Runtime {
    inner: Arc<RuntimeInner>,
    engine_threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Runtime {
    pub fn profile(&self) -> ProfileReport {
        self.inner.profile.report()
    }

    pub fn engine_count(&self) -> usize {
        self.inner.config.engine_count
    }

    /// Creates a context with no affinity, backed by the shared pool.
    pub fn create_context(&self, size_class: SizeClass, resume: Job) -> Context {
        create_context_on(&self.inner, size_class, resume)
    }

    /// Delivers `ctx` to an engine (spec §4.C, `MR_schedule_context`):
    ///
    /// 1. Hard affinity set: try to wake that exact engine directly
    ///    (allowed states `IDLE | SLEEPING`); done if it works.
    /// 2. No hard affinity, and at least one engine is idle: try to wake
    ///    the preferred engine (or engine 0 absent a preference), scanning
    ///    forward for any `SLEEPING` engine; done if it works.
    /// 3. Otherwise, append to the global run queue.
    pub fn schedule_context(&self, ctx: Context) {
        if let Some(aff) = ctx.hard_affinity() {
            let action = WakeAction::Context(ctx);
            match self.inner.sleep_sync.try_wake_engine(aff.engine, action, StateMask::IDLE.or(StateMask::SLEEPING)) {
                Ok(()) => {
                    self.inner.profile.record_context_woken_directly();
                    return;
                }
                Err(WakeAction::Context(ctx)) => {
                    self.inner.profile.record_context_queued();
                    self.inner.run_queue.push(ctx);
                    return;
                }
                Err(_) => unreachable!("try_wake_engine returns back exactly the action it was given"),
            }
        }

        if self.inner.sleep_sync.idle_engine_count() > 0 {
            let preferred = ctx.preferred_engine().unwrap_or(EngineId::new(0));
            match self.inner.sleep_sync.try_wake_any(preferred, WakeAction::Context(ctx)) {
                Ok(()) => {
                    self.inner.profile.record_context_woken_directly();
                    return;
                }
                Err(WakeAction::Context(ctx)) => {
                    self.inner.profile.record_context_queued();
                    self.inner.run_queue.push(ctx);
                    return;
                }
                Err(_) => unreachable!("try_wake_any returns back exactly the action it was given"),
            }
        }

        self.inner.profile.record_context_queued();
        self.inner.run_queue.push(ctx);
    }

    /// Parks `ctx` until `fd` becomes ready for `mode` (spec §6,
    /// `register_pending_io`). The I/O subsystem itself is external; the
    /// core only hands runnable contexts back out via
    /// [`Self::poll_pending_io`].
    pub fn register_pending_io(&self, ctx: Context, fd: RawFd, mode: IoMode) {
        self.inner.pending_io.register(ctx, fd, mode);
    }

    /// Polls every registered fd once, rescheduling whichever contexts are
    /// now ready, and returns how many are still outstanding (spec §6,
    /// `poll_pending_io(blocking?) -> remaining_count`). Intended to be
    /// called from the idle loop when no other work is available.
    pub fn poll_pending_io(&self, blocking: bool) -> usize {
        let (ready, remaining) = self.inner.pending_io.poll(blocking);
        for ctx in ready {
            self.schedule_context(ctx);
        }
        remaining
    }

    /// Signals every engine to shut down and joins their threads.
    ///
    /// Idempotent: calling this twice is a no-op the second time. If
    /// [`RuntimeConfig::enable_profiling`] is set, writes the accumulated
    /// [`ProfileReport`] to `profile_file_name` before returning.
    pub fn shutdown(&self) {
        if self.inner.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(engines = self.engine_count(), "shutting down engine pool");
        for i in 0..self.engine_count() {
            let engine = EngineId::new(i as u32);
            // Retry until the wake is accepted: an engine that is
            // momentarily `Working` will soon go `Idle`/`Sleeping` and
            // accept the shutdown action.
            let mut action = WakeAction::Shutdown;
            loop {
                match self.inner.sleep_sync.try_wake_engine(
                    engine,
                    action,
                    StateMask::IDLE.or(StateMask::SLEEPING),
                ) {
                    Ok(()) => break,
                    Err(returned) => {
                        action = returned;
                        std::thread::yield_now();
                    }
                }
            }
        }
        for handle in self.engine_threads.lock().unwrap_or_else(|p| p.into_inner()).drain(..) {
            let _ = handle.join();
        }

        if self.inner.config.enable_profiling {
            let report = self.inner.profile.report();
            if let Err(err) = report.write_to(&self.inner.config.profile_file_name) {
                tracing::warn!(
                    path = %self.inner.config.profile_file_name.display(),
                    error = %err,
                    "failed to write profiling report"
                );
            }
        }
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Starts `config.engine_count` engine threads and returns the handle used
/// to submit work and eventually shut the pool down (spec §4.G/§4.H).
pub fn init_runtime(config: RuntimeConfig) -> Result<Runtime> {
    if config.engine_count == 0 {
        return Err(RuntimeError::InvalidConfig("engine_count must be at least 1".to_string()));
    }

    let inner = Arc::new(RuntimeInner::new(config));
    let mut threads = Vec::with_capacity(inner.config.engine_count);

    for i in 0..inner.config.engine_count {
        let id = EngineId::new(i as u32);
        let inner = Arc::clone(&inner);
        let thread_name = format!("{}-{i}", inner.config.thread_name_prefix);
        let pin = inner.config.pin_to_cpus;
        let primordial_cpu = inner.config.primordial_cpu;

        let handle = std::thread::Builder::new().name(thread_name).spawn(move || {
            if pin {
                let cpu = affinity::pin_thread(id, primordial_cpu);
                debug!(engine = %id, cpu, "pinned engine thread");
            }
            engine::run_engine(&inner, id);
        })?;
        threads.push(handle);
    }

    Ok(Runtime { inner, engine_threads: Mutex::new(threads) })
}

/// Borrowed, engine-thread-local interface a job closure uses to call back
/// into the scheduler (spec §4.B/§4.E/§4.F).
///
/// Only valid for the duration of the job call that received it: it holds
/// a reference to the engine's own [`EngineLocal`], which does not outlive
/// that call.
pub struct Handle<'a> {
    inner: &'a Arc<RuntimeInner>,
    local: &'a EngineLocal,
}

impl<'a> Handle<'a> {
    pub(crate) fn new(inner: &'a Arc<RuntimeInner>, local: &'a EngineLocal) -> Self {
        Self { inner, local }
    }

    pub fn engine_id(&self) -> EngineId {
        self.local.id
    }

    /// The parallel-stack-pointer/mutables snapshot loaded for the spark
    /// (or context) currently executing (spec §4.E).
    pub fn current_snapshot(&self) -> ParentSnapshot {
        self.local.current_snapshot()
    }

    pub fn create_context(&self, size_class: SizeClass, resume: Job) -> Context {
        create_context_on(self.inner, size_class, resume)
    }

    pub fn set_hard_affinity(&self, ctx: &mut Context, affinity: Option<HardAffinity>) {
        ctx.set_hard_affinity(affinity);
    }

    /// Pushes `spark` onto this engine's own deque bottom (spec §4.B).
    pub fn submit_spark(&self, spark: Spark) {
        self.inner.deques[self.local.id.index()].push_bottom(spark);
    }

    /// Hands `ctx` to the global scheduler, same delivery rules as
    /// [`Runtime::schedule_context`].
    pub fn schedule_context(&self, ctx: Context) {
        // Rebuild a `Runtime`-shaped call without requiring a `Runtime`
        // value inside a job: the delivery logic only needs `&RuntimeInner`.
        schedule_context_on(self.inner, ctx);
    }

    /// Parks `ctx` until `fd` becomes ready for `mode` (spec §6,
    /// `register_pending_io`), callable from inside a running job.
    pub fn register_pending_io(&self, ctx: Context, fd: RawFd, mode: IoMode) {
        self.inner.pending_io.register(ctx, fd, mode);
    }

    /// Reports this branch's arrival at a parallel-conjunction join (spec
    /// §4.F). See [`join::join_and_continue`] for the four-way behaviour.
    pub fn join_and_continue(&self, sync_term: Arc<SyncTerm>, join_label: Job) {
        join::join_and_continue(self.inner, self.local, sync_term, join_label);
    }
}

fn create_context_on(inner: &Arc<RuntimeInner>, size_class: SizeClass, resume: Job) -> Context {
    let (ctx, reuse) = inner.pool.acquire(size_class, resume);
    inner.profile.record_context_created();
    inner.profile.record_context_provisioned(size_class, reuse);
    ctx
}

pub(crate) fn schedule_context_on(inner: &Arc<RuntimeInner>, ctx: Context) {
    if let Some(aff) = ctx.hard_affinity() {
        let action = WakeAction::Context(ctx);
        match inner.sleep_sync.try_wake_engine(aff.engine, action, StateMask::IDLE.or(StateMask::SLEEPING)) {
            Ok(()) => {
                inner.profile.record_context_woken_directly();
                return;
            }
            Err(WakeAction::Context(ctx)) => {
                inner.profile.record_context_queued();
                inner.run_queue.push(ctx);
                return;
            }
            Err(_) => unreachable!(),
        }
    }

    if inner.sleep_sync.idle_engine_count() > 0 {
        let preferred = ctx.preferred_engine().unwrap_or(EngineId::new(0));
        match inner.sleep_sync.try_wake_any(preferred, WakeAction::Context(ctx)) {
            Ok(()) => {
                inner.profile.record_context_woken_directly();
                return;
            }
            Err(WakeAction::Context(ctx)) => {
                inner.profile.record_context_queued();
                inner.run_queue.push(ctx);
                return;
            }
            Err(_) => unreachable!(),
        }
    }

    inner.profile.record_context_queued();
    inner.run_queue.push(ctx);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::sync::Barrier;
    use std::time::Duration;

    #[test]
    fn invalid_config_is_rejected() {
        let result = init_runtime(RuntimeConfig { engine_count: 0, ..RuntimeConfig::default() });
        assert!(matches!(result, Err(RuntimeError::InvalidConfig(_))));
    }

    #[test]
    fn runtime_starts_and_shuts_down_cleanly() {
        let runtime = init_runtime(RuntimeConfig {
            engine_count: 2,
            pin_to_cpus: false,
            ..RuntimeConfig::default()
        })
        .expect("runtime should start");
        runtime.shutdown();
        // Idempotent: a second call must not hang or panic.
        runtime.shutdown();
    }

    /// Exercises the crate's `tracing` calls (engine start/stop, the
    /// shutdown broadcast) under a real subscriber rather than the default
    /// no-op one, so a regression that panics a `tracing` macro call itself
    /// (e.g. a malformed field) would show up here.
    #[test]
    fn runtime_lifecycle_under_a_real_tracing_subscriber() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::new("trace"))
            .try_init();

        let runtime = init_runtime(RuntimeConfig {
            engine_count: 2,
            pin_to_cpus: false,
            ..RuntimeConfig::default()
        })
        .expect("runtime should start");
        runtime.shutdown();
    }

    #[test]
    fn scheduled_context_runs_its_resume_job() {
        let runtime = init_runtime(RuntimeConfig {
            engine_count: 2,
            pin_to_cpus: false,
            ..RuntimeConfig::default()
        })
        .expect("runtime should start");

        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = Arc::clone(&ran);
        let ctx = runtime.create_context(SizeClass::Regular, Box::new(move |_h| ran2.store(true, Ordering::SeqCst)));
        runtime.schedule_context(ctx);

        for _ in 0..200 {
            if ran.load(Ordering::SeqCst) {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(ran.load(Ordering::SeqCst), "scheduled context should have run");
        runtime.shutdown();
    }

    /// Models spec §8 scenario S1: a context forks N-1 sparks plus itself
    /// into an N-way parallel conjunction, each branch may land on a
    /// different engine (the pool has more engines than branches), and
    /// exactly one arrival runs the join label once every branch reports in
    /// (invariant I4).
    #[test]
    fn sparks_from_one_context_run_on_multiple_engines_and_join_exactly_once() {
        let runtime = init_runtime(RuntimeConfig {
            engine_count: 4,
            pin_to_cpus: false,
            ..RuntimeConfig::default()
        })
        .expect("runtime should start");

        const BRANCHES: usize = 8;
        let completed = Arc::new(AtomicU32::new(0));
        let join_ran = Arc::new(AtomicU32::new(0));

        let origin_ctx = runtime.create_context(SizeClass::Regular, Box::new(|_h| {}));
        let origin_id = origin_ctx.id();
        let sync_term = SyncTerm::new(BRANCHES, origin_id);

        let join_label = {
            let join_ran = Arc::clone(&join_ran);
            move || -> Job { Box::new(move |_h| { join_ran.fetch_add(1, Ordering::SeqCst); }) }
        };

        let origin_job: Job = {
            let completed = Arc::clone(&completed);
            let sync_term = Arc::clone(&sync_term);
            let join_label = join_label.clone();
            Box::new(move |h: &Handle<'_>| {
                for _ in 0..BRANCHES - 1 {
                    let completed = Arc::clone(&completed);
                    let sync_term_for_resume = Arc::clone(&sync_term);
                    let sync_term_for_spark = Arc::clone(&sync_term);
                    let join_label = join_label.clone();
                    let resume: Job = Box::new(move |h: &Handle<'_>| {
                        completed.fetch_add(1, Ordering::SeqCst);
                        h.join_and_continue(sync_term_for_resume, join_label());
                    });
                    h.submit_spark(Spark::new(resume, sync_term_for_spark, h.current_snapshot()));
                }
                completed.fetch_add(1, Ordering::SeqCst);
                h.join_and_continue(sync_term, join_label());
            })
        };
        let mut origin_ctx = origin_ctx;
        origin_ctx.resume = Some(origin_job);
        runtime.schedule_context(origin_ctx);

        for _ in 0..400 {
            if join_ran.load(Ordering::SeqCst) >= 1 {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(completed.load(Ordering::SeqCst), BRANCHES as u32, "every branch should have run");
        assert_eq!(join_ran.load(Ordering::SeqCst), 1, "the join label must run exactly once (invariant I4)");
        runtime.shutdown();
    }
}
