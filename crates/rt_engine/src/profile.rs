//! Component H: scheduling counters and the optional plain-text profile
//! report (spec §4.H/§6).
//!
//! Every counter is a relaxed atomic: these are diagnostics, not
//! correctness-load-bearing state, so there is no ordering to get wrong.
//! The four headline counters named in spec §6 (global-sparks-executed,
//! contexts-resumed, executed-nothing, local-sparks-executed) are each
//! rendered as a plain `count K` line; this crate always samples every
//! event rather than the original's occasional `(R recorded, U unrecorded)`
//! sampling variant, so that shape is never produced here (documented as a
//! simplification in DESIGN.md: the report is diagnostic, free-form text,
//! and the spec itself only asks for *one of* the three possible shapes).

use std::sync::atomic::{AtomicU64, Ordering};

use crate::context::{Reuse, SizeClass};

#[derive(Default)]
pub struct ProfileCounters {
    global_sparks_executed: AtomicU64,
    local_sparks_executed: AtomicU64,
    sparks_stolen: AtomicU64,
    contexts_resumed: AtomicU64,
    executed_nothing: AtomicU64,
    contexts_created: AtomicU64,
    contexts_created_regular: AtomicU64,
    contexts_created_small: AtomicU64,
    contexts_kept_regular: AtomicU64,
    contexts_kept_small: AtomicU64,
    contexts_woken_directly: AtomicU64,
    contexts_queued: AtomicU64,
    joins_gone_dirty: AtomicU64,
}

impl ProfileCounters {
    /// A spark ran without being stolen (popped from the engine's own
    /// deque bottom).
    pub(crate) fn record_local_spark_executed(&self) {
        self.local_sparks_executed.fetch_add(1, Ordering::Relaxed);
        self.global_sparks_executed.fetch_add(1, Ordering::Relaxed);
    }

    /// A spark ran after being stolen from another engine's deque.
    pub(crate) fn record_stolen_spark_executed(&self) {
        self.sparks_stolen.fetch_add(1, Ordering::Relaxed);
        self.global_sparks_executed.fetch_add(1, Ordering::Relaxed);
    }

    /// A context was handed to an engine (directly woken or pulled off the
    /// run queue) and is about to run.
    pub(crate) fn record_context_resumed(&self) {
        self.contexts_resumed.fetch_add(1, Ordering::Relaxed);
    }

    /// One idle-loop pass found no local spark, no run-queue context, and
    /// nothing to steal, and is about to go idle/sleep.
    pub(crate) fn record_executed_nothing(&self) {
        self.executed_nothing.fetch_add(1, Ordering::Relaxed);
    }

    /// `schedule_context` delivered a context straight into a sleeping
    /// engine rather than via the run queue.
    pub(crate) fn record_context_woken_directly(&self) {
        self.contexts_woken_directly.fetch_add(1, Ordering::Relaxed);
    }

    /// `schedule_context` fell back to the run queue.
    pub(crate) fn record_context_queued(&self) {
        self.contexts_queued.fetch_add(1, Ordering::Relaxed);
    }

    /// `create_context` was called (spec's external `create_context`
    /// surface, independent of `ContextPool::acquire`'s reuse tracking).
    pub(crate) fn record_context_created(&self) {
        self.contexts_created.fetch_add(1, Ordering::Relaxed);
    }

    /// A context was provisioned to run a spark, broken down by size class
    /// and whether the pool reused a free-listed context or allocated one
    /// (spec §6, "contexts-created-for-sparks" and "context-reuse/kept
    /// events in each size class").
    pub(crate) fn record_context_provisioned(&self, size_class: SizeClass, reuse: Reuse) {
        match (size_class, reuse) {
            (SizeClass::Regular, Reuse::Fresh) => self.contexts_created_regular.fetch_add(1, Ordering::Relaxed),
            (SizeClass::Small, Reuse::Fresh) => self.contexts_created_small.fetch_add(1, Ordering::Relaxed),
            (SizeClass::Regular, Reuse::Kept) => self.contexts_kept_regular.fetch_add(1, Ordering::Relaxed),
            (SizeClass::Small, Reuse::Kept) => self.contexts_kept_small.fetch_add(1, Ordering::Relaxed),
        };
    }

    /// A join's arrival went dirty (the holding engine had to park its
    /// context rather than continue past the join immediately).
    pub(crate) fn record_join_gone_dirty(&self) {
        self.joins_gone_dirty.fetch_add(1, Ordering::Relaxed);
    }

    pub fn report(&self) -> ProfileReport {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        ProfileReport {
            global_sparks_executed: load(&self.global_sparks_executed),
            local_sparks_executed: load(&self.local_sparks_executed),
            sparks_stolen: load(&self.sparks_stolen),
            contexts_resumed: load(&self.contexts_resumed),
            executed_nothing: load(&self.executed_nothing),
            contexts_created: load(&self.contexts_created),
            contexts_created_regular: load(&self.contexts_created_regular),
            contexts_created_small: load(&self.contexts_created_small),
            contexts_kept_regular: load(&self.contexts_kept_regular),
            contexts_kept_small: load(&self.contexts_kept_small),
            contexts_woken_directly: load(&self.contexts_woken_directly),
            contexts_queued: load(&self.contexts_queued),
            joins_gone_dirty: load(&self.joins_gone_dirty),
        }
    }
}

/// Point-in-time snapshot of [`ProfileCounters`] (spec §6's "persisted
/// artefact").
#[derive(Debug, Clone, Copy, Default)]
pub struct ProfileReport {
    pub global_sparks_executed: u64,
    pub local_sparks_executed: u64,
    pub sparks_stolen: u64,
    pub contexts_resumed: u64,
    pub executed_nothing: u64,
    pub contexts_created: u64,
    pub contexts_created_regular: u64,
    pub contexts_created_small: u64,
    pub contexts_kept_regular: u64,
    pub contexts_kept_small: u64,
    pub contexts_woken_directly: u64,
    pub contexts_queued: u64,
    pub joins_gone_dirty: u64,
}

impl ProfileReport {
    /// Renders the plain-text shape spec §6 describes: one `count K` line
    /// per headline counter, plus the size-class create/reuse breakdown.
    /// Consumed as free-form text downstream; no format guarantee beyond
    /// this shape (spec §1 Non-goals: "profiling file output" is an
    /// external collaborator's concern beyond that).
    pub fn render(&self) -> String {
        format!(
            "global-sparks-executed: count {}\n\
             local-sparks-executed: count {}\n\
             sparks-stolen: count {}\n\
             contexts-resumed: count {}\n\
             executed-nothing: count {}\n\
             contexts-created-for-sparks: regular={} small={}\n\
             context-reuse-kept: regular={} small={}\n\
             contexts-created: count {}\n\
             contexts-woken-directly: count {}\n\
             contexts-queued: count {}\n\
             joins-gone-dirty: count {}\n",
            self.global_sparks_executed,
            self.local_sparks_executed,
            self.sparks_stolen,
            self.contexts_resumed,
            self.executed_nothing,
            self.contexts_created_regular,
            self.contexts_created_small,
            self.contexts_kept_regular,
            self.contexts_kept_small,
            self.contexts_created,
            self.contexts_woken_directly,
            self.contexts_queued,
            self.joins_gone_dirty,
        )
    }

    /// Writes [`Self::render`]'s text to `path` (spec §6: on finalize, with
    /// profiling enabled, the core writes `parallel_execution_profile.txt`).
    /// The caller picks the path; [`crate::RuntimeConfig::profile_file_name`]
    /// defaults to that exact filename.
    pub fn write_to(&self, path: &std::path::Path) -> std::io::Result<()> {
        std::fs::write(path, self.render())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_start_at_zero_and_increment() {
        let counters = ProfileCounters::default();
        assert_eq!(counters.report().local_sparks_executed, 0);
        counters.record_local_spark_executed();
        counters.record_local_spark_executed();
        assert_eq!(counters.report().local_sparks_executed, 2);
        assert_eq!(counters.report().global_sparks_executed, 2);
    }

    #[test]
    fn stolen_sparks_count_toward_global_but_not_local() {
        let counters = ProfileCounters::default();
        counters.record_stolen_spark_executed();
        let report = counters.report();
        assert_eq!(report.sparks_stolen, 1);
        assert_eq!(report.global_sparks_executed, 1);
        assert_eq!(report.local_sparks_executed, 0);
    }

    #[test]
    fn render_includes_every_headline_counter() {
        let counters = ProfileCounters::default();
        counters.record_local_spark_executed();
        counters.record_context_resumed();
        counters.record_executed_nothing();
        counters.record_context_provisioned(SizeClass::Regular, Reuse::Fresh);
        counters.record_context_provisioned(SizeClass::Small, Reuse::Kept);

        let text = counters.report().render();
        assert!(text.contains("global-sparks-executed: count 1"));
        assert!(text.contains("contexts-resumed: count 1"));
        assert!(text.contains("executed-nothing: count 1"));
        assert!(text.contains("local-sparks-executed: count 1"));
        assert!(text.contains("regular=1 small=0"));
        assert!(text.contains("context-reuse-kept: regular=0 small=1"));
    }
}
