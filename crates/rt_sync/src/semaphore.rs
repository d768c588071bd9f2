use std::sync::{Condvar, Mutex};

/// A counting semaphore built on [`Mutex`]/[`Condvar`].
///
/// The engine sleep/wake protocol (spec §4.D) is specified against POSIX
/// semaphores (`sem_wait`/`sem_post`, with `EINTR` retried silently). Rust's
/// standard library has no semaphore type, so this is the idiomatic
/// substitute: a `Mutex<usize>` guarding the count plus a `Condvar` to park
/// waiters. `Condvar::wait` already retries internally across spurious
/// wakeups, which is the safe equivalent of an `EINTR` retry loop. There is
/// no separate error path to handle.
///
/// Every engine owns exactly two of these: a sleep semaphore (initial count
/// `0`) and a wake semaphore (initial count `1`, serializing concurrent
/// wakers).
pub struct Semaphore {
    count: Mutex<usize>,
    condvar: Condvar,
}

impl Semaphore {
    /// Creates a semaphore with the given initial count.
    pub fn new(initial: usize) -> Self {
        Self {
            count: Mutex::new(initial),
            condvar: Condvar::new(),
        }
    }

    /// Blocks the calling thread until the count is non-zero, then
    /// decrements it.
    ///
    /// Mirrors `sem_wait`. Any spurious wakeup (the Rust analogue of
    /// `EINTR`) is retried transparently by the `while` guard below.
    pub fn wait(&self) {
        let mut count = self.count.lock().unwrap_or_else(|poison| poison.into_inner());
        while *count == 0 {
            count = self
                .condvar
                .wait(count)
                .unwrap_or_else(|poison| poison.into_inner());
        }
        *count -= 1;
    }

    /// Increments the count and wakes one waiter, if any.
    ///
    /// Mirrors `sem_post`.
    pub fn post(&self) {
        let mut count = self.count.lock().unwrap_or_else(|poison| poison.into_inner());
        *count += 1;
        self.condvar.notify_one();
    }

    /// Returns the current count without blocking.
    ///
    /// Diagnostic only: the count may change the instant after this call
    /// returns, so it must never gate correctness decisions.
    pub fn peek(&self) -> usize {
        *self.count.lock().unwrap_or_else(|poison| poison.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn wait_consumes_initial_count() {
        let sem = Semaphore::new(1);
        sem.wait();
        assert_eq!(sem.peek(), 0);
    }

    #[test]
    fn post_then_wait_does_not_block() {
        let sem = Semaphore::new(0);
        sem.post();
        sem.wait();
        assert_eq!(sem.peek(), 0);
    }

    #[test]
    fn wait_blocks_until_posted_from_another_thread() {
        let sem = Arc::new(Semaphore::new(0));
        let sem2 = Arc::clone(&sem);

        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            sem2.post();
        });

        // Would hang indefinitely if `wait` did not block correctly.
        sem.wait();
        handle.join().unwrap();
    }

    #[test]
    fn wake_semaphore_serializes_single_waker() {
        // Mirrors the es_wake_semaphore starting count of 1: exactly one
        // waker at a time may pass.
        let sem = Arc::new(Semaphore::new(1));
        sem.wait();
        assert_eq!(sem.peek(), 0);
        sem.post();
        assert_eq!(sem.peek(), 1);
    }
}
