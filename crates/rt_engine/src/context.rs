//! Component A: contexts and the two-size-class free-list pool (spec §4.A).

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

use crate::ids::{ContextId, ContextIdGen, EngineId};

/// A suspended continuation, handed back to the engine that resumes it.
///
/// The original runtime resumes a context by jumping to a saved program
/// counter inside the bytecode interpreter; that mechanism is explicitly out
/// of scope here (spec §1, "external collaborators"). An opaque `FnOnce`
/// closure is the idiomatic Rust stand-in: whatever state the resumed
/// computation needs, it captures directly rather than through an
/// interpreter stack.
pub type Job = Box<dyn FnOnce(&crate::lifecycle::Handle<'_>) + Send>;

/// Which free-list a context was (or should be) allocated from.
///
/// A `Small` request may be satisfied by a `Regular` context pulled off the
/// larger free-list (it's oversized but usable); a `Regular` request must
/// never be satisfied by a `Small` context. See [`ContextPool::acquire`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeClass {
    Regular,
    Small,
}

/// Hard engine affinity recorded on a context (spec §4.C): the context may
/// only run on `engine` while the call nesting is at least `c_call_depth`
/// deep, a leftover from a foreign-language call that does not tolerate a
/// stack switch.
#[derive(Debug, Clone, Copy)]
pub struct HardAffinity {
    pub engine: EngineId,
    pub c_call_depth: u32,
}

/// Configured sizes (in words) for every stack the original context family
/// carries (det, nondet, trail, generator (det/nondet), cut, pneg), plus the
/// `Small` size class's own det/nondet pair (spec §6, "per-class stack
/// sizes"). Real stack allocation is out of scope (spec §1 Non-goals); these
/// numbers exist only so the config surface named in §6 has somewhere to
/// land, and so [`ContextPool`] knows how to size a freshly allocated
/// context without re-deriving hardcoded constants.
#[derive(Debug, Clone, Copy)]
pub struct StackSizes {
    pub det_words: usize,
    pub nondet_words: usize,
    pub small_det_words: usize,
    pub small_nondet_words: usize,
    pub generator_det_words: usize,
    pub generator_nondet_words: usize,
    pub trail_words: usize,
    pub gen_words: usize,
    pub cut_words: usize,
    pub pneg_words: usize,
}

impl Default for StackSizes {
    fn default() -> Self {
        Self {
            det_words: 4096,
            nondet_words: 1024,
            small_det_words: 256,
            small_nondet_words: 64,
            generator_det_words: 4096,
            generator_nondet_words: 1024,
            trail_words: 1024,
            gen_words: 256,
            cut_words: 256,
            pneg_words: 256,
        }
    }
}

/// Stand-in sizes for one context's family of stacks. Real stack allocation
/// is out of scope; the pool only needs to know whether a context's stacks
/// have already been sized so it can skip re-initializing them on reuse.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Stacks {
    pub(crate) det_words: usize,
    pub(crate) nondet_words: usize,
}

/// A snapshot of the forking context's state, loaded into the engine before
/// a spark's resume closure runs (spec §4.E, "load the spark's parent
/// parallel stack pointer and thread-local mutables"). The real payload is
/// interpreter-internal and out of scope; what survives here is the
/// mechanic itself: the engine makes this available to the resume closure
/// via [`crate::lifecycle::Handle::current_snapshot`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ParentSnapshot {
    pub parent_parallel_sp: u64,
    pub mutables_generation: u64,
}

/// A unit of sequential execution state: the engine's notion of "what to run
/// next" plus the bookkeeping needed to schedule it.
pub struct Context {
    id: ContextId,
    size_class: SizeClass,
    pub(crate) resume: Option<Job>,
    pub(crate) preferred_engine: Option<EngineId>,
    pub(crate) hard_affinity: Option<HardAffinity>,
    stacks: Stacks,
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.id)
            .field("size_class", &self.size_class)
            .field("has_resume", &self.resume.is_some())
            .field("preferred_engine", &self.preferred_engine)
            .finish()
    }
}

impl Context {
    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn size_class(&self) -> SizeClass {
        self.size_class
    }

    pub fn preferred_engine(&self) -> Option<EngineId> {
        self.preferred_engine
    }

    pub fn hard_affinity(&self) -> Option<HardAffinity> {
        self.hard_affinity
    }

    pub fn set_preferred_engine(&mut self, engine: Option<EngineId>) {
        self.preferred_engine = engine;
    }

    pub fn set_hard_affinity(&mut self, affinity: Option<HardAffinity>) {
        self.hard_affinity = affinity;
    }

    fn stack_words_for(sizes: &StackSizes, size_class: SizeClass) -> Stacks {
        match size_class {
            SizeClass::Regular => Stacks { det_words: sizes.det_words, nondet_words: sizes.nondet_words },
            SizeClass::Small => Stacks { det_words: sizes.small_det_words, nondet_words: sizes.small_nondet_words },
        }
    }

    fn fresh(id: ContextId, size_class: SizeClass, resume: Job, sizes: &StackSizes) -> Self {
        Self {
            id,
            size_class,
            resume: Some(resume),
            preferred_engine: None,
            hard_affinity: None,
            stacks: Self::stack_words_for(sizes, size_class),
        }
    }

    /// Re-initializes a context pulled off the free list for reuse,
    /// matching [`ContextPool::acquire`]'s invariant that a released
    /// context carries no resume point, affinity, or stale stack sizing
    /// smaller than what's being asked for.
    fn reinitialize(&mut self, requested: SizeClass, resume: Job, sizes: &StackSizes) {
        debug_assert!(self.resume.is_none(), "reused a context that was not released cleanly");
        self.resume = Some(resume);
        self.preferred_engine = None;
        self.hard_affinity = None;
        // The size field stays whatever the context was actually allocated
        // as (S4): a Regular context reused to satisfy a Small request keeps
        // reporting Regular, it is simply oversized for the job.
        if requested == SizeClass::Regular {
            self.stacks = Self::stack_words_for(sizes, SizeClass::Regular);
        }
    }

    /// Clears a context down to free-list shape. Panics if the context is
    /// not in a releasable state (spec §4.A, "it is a fatal runtime error to
    /// release a context that still has a pending resume point or is
    /// attached to an outstanding sync term").
    fn clear_for_release(&mut self) {
        assert!(
            self.resume.is_none(),
            "fatal: released context {:?} still carries a resume point",
            self.id
        );
        self.preferred_engine = None;
        self.hard_affinity = None;
    }
}

/// Whether [`ContextPool::acquire`] handed back a free-listed context or had
/// to allocate a fresh one. Feeds the per-size-class counters in the
/// profiling report (spec §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reuse {
    Fresh,
    Kept,
}

/// Free-list pool keyed by [`SizeClass`] (spec §4.A).
///
/// A single mutex guards both lists; the critical section is a `Vec::pop`
/// or `Vec::push`, so contention is brief even though every engine shares
/// one pool.
pub struct ContextPool {
    regular: Mutex<Vec<Context>>,
    small: Mutex<Vec<Context>>,
    ids: ContextIdGen,
    /// Contexts currently not on a free list: running, queued, or parked.
    /// Read by the idle loop's work-steal probe to enforce the
    /// `max_outstanding_contexts` cap (spec §4.E).
    outstanding: AtomicI64,
    stack_sizes: StackSizes,
}

impl Default for ContextPool {
    fn default() -> Self {
        Self::new()
    }
}

impl ContextPool {
    pub fn new() -> Self {
        Self::with_stack_sizes(StackSizes::default())
    }

    /// Like [`Self::new`], sizing freshly allocated contexts from `sizes`
    /// instead of the defaults (spec §6, "per-class stack sizes").
    pub fn with_stack_sizes(sizes: StackSizes) -> Self {
        Self {
            regular: Mutex::new(Vec::new()),
            small: Mutex::new(Vec::new()),
            ids: ContextIdGen::new(),
            outstanding: AtomicI64::new(0),
            stack_sizes: sizes,
        }
    }

    /// Number of contexts currently not on a free list.
    pub fn outstanding(&self) -> i64 {
        self.outstanding.load(Ordering::Relaxed)
    }

    /// Obtains a context of at least `size_class`, reusing a free-listed one
    /// if available.
    ///
    /// Lookup order mirrors the original `prepare_engine_for_spark`/
    /// `do_get_context` free-list check: a `Small` request first tries the
    /// `Small` list, then falls back to `Regular` (oversized but valid); a
    /// `Regular` request only ever looks at the `Regular` list.
    pub fn acquire(&self, size_class: SizeClass, resume: Job) -> (Context, Reuse) {
        let reused = match size_class {
            SizeClass::Small => {
                let mut small = self.small.lock().unwrap_or_else(|p| p.into_inner());
                small.pop().or_else(|| {
                    drop(small);
                    let mut regular = self.regular.lock().unwrap_or_else(|p| p.into_inner());
                    regular.pop()
                })
            }
            SizeClass::Regular => {
                let mut regular = self.regular.lock().unwrap_or_else(|p| p.into_inner());
                regular.pop()
            }
        };

        self.outstanding.fetch_add(1, Ordering::Relaxed);

        match reused {
            Some(mut ctx) => {
                ctx.reinitialize(size_class, resume, &self.stack_sizes);
                (ctx, Reuse::Kept)
            }
            None => (Context::fresh(self.ids.next(), size_class, resume, &self.stack_sizes), Reuse::Fresh),
        }
    }

    /// Returns a context to its size class's free list.
    pub fn release(&self, mut ctx: Context) {
        ctx.clear_for_release();
        self.outstanding.fetch_sub(1, Ordering::Relaxed);
        match ctx.size_class {
            SizeClass::Regular => {
                self.regular.lock().unwrap_or_else(|p| p.into_inner()).push(ctx);
            }
            SizeClass::Small => {
                self.small.lock().unwrap_or_else(|p| p.into_inner()).push(ctx);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_job() -> Job {
        Box::new(|_handle| {})
    }

    #[test]
    fn fresh_context_gets_distinct_ids() {
        let pool = ContextPool::new();
        let (a, reuse_a) = pool.acquire(SizeClass::Regular, noop_job());
        let (b, reuse_b) = pool.acquire(SizeClass::Regular, noop_job());
        assert_ne!(a.id(), b.id());
        assert_eq!(reuse_a, Reuse::Fresh);
        assert_eq!(reuse_b, Reuse::Fresh);
        assert_eq!(pool.outstanding(), 2);
    }

    #[test]
    fn released_regular_context_is_reused() {
        let pool = ContextPool::new();
        let (ctx, _) = pool.acquire(SizeClass::Regular, noop_job());
        let id = ctx.id();
        let mut ctx = ctx;
        ctx.resume = None;
        pool.release(ctx);
        assert_eq!(pool.outstanding(), 0);

        let (reused, reuse) = pool.acquire(SizeClass::Regular, noop_job());
        assert_eq!(reused.id(), id, "expected the freed context to be reused");
        assert_eq!(reuse, Reuse::Kept);
    }

    #[test]
    fn small_request_may_reuse_a_regular_context_but_keeps_reporting_regular() {
        let pool = ContextPool::new();
        let (mut ctx, _) = pool.acquire(SizeClass::Regular, noop_job());
        ctx.resume = None;
        pool.release(ctx);

        let (reused, _) = pool.acquire(SizeClass::Small, noop_job());
        assert_eq!(reused.size_class(), SizeClass::Regular);
    }

    #[test]
    fn regular_request_never_reuses_a_small_context() {
        let pool = ContextPool::new();
        let (mut small, _) = pool.acquire(SizeClass::Small, noop_job());
        let small_id = small.id();
        small.resume = None;
        pool.release(small);

        let (reused, _) = pool.acquire(SizeClass::Regular, noop_job());
        assert_ne!(reused.id(), small_id, "a Regular request must not pull from the Small list");
    }

    #[test]
    #[should_panic(expected = "still carries a resume point")]
    fn releasing_a_context_with_a_pending_resume_is_fatal() {
        let pool = ContextPool::new();
        let (ctx, _) = pool.acquire(SizeClass::Regular, noop_job());
        pool.release(ctx);
    }
}
