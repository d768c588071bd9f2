//! Identity types standing in for the raw pointer comparisons the original
//! engine/context model relies on.
//!
//! Rust's ownership rules already make "a context is in exactly one place"
//! an invariant enforced by the type system rather than something we need to
//! assert: a [`crate::context::Context`] value can only live in one
//! collection (a deque, the run queue, a `SyncTerm`'s parked slot, ...) at a
//! time. What the original still needs from identity is *comparison*: "is
//! the context I'm holding the one that originated this join?". `ContextId`
//! and `EngineId` exist only for that comparison.

use std::sync::atomic::{AtomicU64, Ordering};

/// Stable identity for a [`crate::context::Context`], assigned once at
/// creation and never reused for the lifetime of the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContextId(u64);

impl ContextId {
    #[cfg(test)]
    pub(crate) fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

/// Index of an engine among the fixed-size pool created at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EngineId(u32);

impl EngineId {
    pub(crate) const fn new(index: u32) -> Self {
        Self(index)
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for EngineId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "engine#{}", self.0)
    }
}

/// Monotonic generator for [`ContextId`]s.
#[derive(Debug, Default)]
pub(crate) struct ContextIdGen(AtomicU64);

impl ContextIdGen {
    pub(crate) const fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    pub(crate) fn next(&self) -> ContextId {
        ContextId(self.0.fetch_add(1, Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_distinct_and_increasing() {
        let gen = ContextIdGen::new();
        let a = gen.next();
        let b = gen.next();
        assert_ne!(a, b);
        assert!(a < b);
    }
}
