//! The parallel execution core: contexts, work-stealing sparks, and the
//! engine pool that schedules both.
//!
//! This crate is deliberately small and low-level. It owns exactly the
//! scheduling decisions described in its design notes (which engine runs
//! which context next, when a spark gets stolen, when a parallel
//! conjunction's branches rendezvous at a join) and nothing about what the
//! code being scheduled actually computes. A "resume point" is an opaque
//! [`Job`] closure; the bytecode/term-level interpreter that would normally
//! sit behind that closure is out of scope here.
//!
//! Start with [`init_runtime`] to launch an engine pool, [`Handle`] for the
//! callback surface a running job uses to submit sparks and report joins,
//! and [`context::SizeClass`] / [`context::HardAffinity`] for the context
//! pool's two knobs.

pub mod affinity;
mod deque;
mod engine;
mod error;
mod ids;
mod join;
mod run_queue;
mod sleep_sync;

pub mod context;
pub mod pending_io;
pub mod profile;
pub mod spark;

mod lifecycle;

pub use affinity::pin_primordial_thread;
pub use context::{Context, HardAffinity, Job, SizeClass, StackSizes};
pub use error::{Result, RuntimeError};
pub use ids::{ContextId, EngineId};
pub use lifecycle::{Handle, Runtime, RuntimeConfig, init_runtime};
pub use pending_io::{IoMode, RawFd};
pub use profile::ProfileReport;
pub use spark::{Spark, SyncTerm};
