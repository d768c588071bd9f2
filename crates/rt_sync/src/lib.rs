//! Low-level synchronization primitives shared by the parallel execution core.
//!
//! This crate is the std-only counterpart of the kind of `utils` module a
//! no_std-portable sibling crate would provide: cache-line padding, spin
//! backoff, and a binary semaphore built on top of the standard library's
//! `Mutex`/`Condvar` rather than raw OS semaphores.

mod backoff;
mod cache_padded;
mod semaphore;

pub use backoff::Backoff;
pub use cache_padded::CachePadded;
pub use semaphore::Semaphore;
