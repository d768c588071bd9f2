//! Pending-I/O registry (spec §6, `register_pending_io`/`poll_pending_io`).
//!
//! The I/O subsystem itself (actually reading or writing a socket, the
//! interpreter-level logic that decides a call would block) is external
//! (spec §1, "external collaborators"). This module's contract is narrow:
//! park a context against a file descriptor and a readiness mode, and let
//! the idle loop call [`PendingIo::poll`] when there's nothing else to run;
//! ready contexts come back out to be handed to
//! [`crate::Runtime::schedule_context`].
//!
//! `poll` is implemented with `select(2)` (cfg(unix)), matching the
//! reference runtime. The reference's max-fd computation has a bug: it
//! keeps the *smaller* of the running maximum and each fd (`if (max_id >
//! pctxt->fd) { max_id = pctxt->fd; }`), which is backwards. The
//! comparison should keep the larger, since `select` needs `nfds` to be one
//! past the *highest* fd in any set, not the lowest. This module computes a
//! plain running maximum instead (spec §9's Open Question, resolved in
//! DESIGN.md).

#![expect(unsafe_code, reason = "select(2)/fd_set manipulation has no safe libc wrapper")]

use std::sync::Mutex;

use crate::context::Context;

#[cfg(unix)]
pub use std::os::unix::io::RawFd;
#[cfg(not(unix))]
pub type RawFd = std::os::raw::c_int;

/// Which readiness condition a parked context is waiting on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoMode {
    Read,
    Write,
    Except,
}

struct Waiter {
    fd: RawFd,
    mode: IoMode,
    ctx: Context,
}

#[derive(Default)]
pub(crate) struct PendingIo {
    waiters: Mutex<Vec<Waiter>>,
}

impl PendingIo {
    pub(crate) fn new() -> Self {
        Self { waiters: Mutex::new(Vec::new()) }
    }

    /// Parks `ctx` until `fd` becomes ready for `mode`.
    pub(crate) fn register(&self, ctx: Context, fd: RawFd, mode: IoMode) {
        self.waiters.lock().unwrap_or_else(|p| p.into_inner()).push(Waiter { fd, mode, ctx });
    }

    pub(crate) fn outstanding(&self) -> usize {
        self.waiters.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    /// Polls every registered fd once, removing and returning the contexts
    /// that are now ready. `blocking` selects between an indefinite wait (no
    /// timeout passed to `select`) and a zero-timeout poll; with nothing
    /// registered, both return immediately.
    ///
    /// Returns `(ready_contexts, remaining_count)`.
    #[cfg(unix)]
    pub(crate) fn poll(&self, blocking: bool) -> (Vec<Context>, usize) {
        let mut guard = self.waiters.lock().unwrap_or_else(|p| p.into_inner());
        if guard.is_empty() {
            return (Vec::new(), 0);
        }

        loop {
            let (rd, wr, ex, max_fd) = unsafe {
                let mut rd: libc::fd_set = std::mem::zeroed();
                let mut wr: libc::fd_set = std::mem::zeroed();
                let mut ex: libc::fd_set = std::mem::zeroed();
                libc::FD_ZERO(&mut rd);
                libc::FD_ZERO(&mut wr);
                libc::FD_ZERO(&mut ex);
                let mut max_fd: RawFd = -1;
                for waiter in guard.iter() {
                    match waiter.mode {
                        IoMode::Read => libc::FD_SET(waiter.fd, &mut rd),
                        IoMode::Write => libc::FD_SET(waiter.fd, &mut wr),
                        IoMode::Except => libc::FD_SET(waiter.fd, &mut ex),
                    }
                    max_fd = max_fd.max(waiter.fd);
                }
                (rd, wr, ex, max_fd)
            };

            let mut rd = rd;
            let mut wr = wr;
            let mut ex = ex;
            let nfds = max_fd + 1;
            let mut timeout = libc::timeval { tv_sec: 0, tv_usec: 0 };
            let timeout_ptr = if blocking { std::ptr::null_mut() } else { &mut timeout as *mut _ };

            let rc = unsafe { libc::select(nfds, &mut rd, &mut wr, &mut ex, timeout_ptr) };

            if rc < 0 {
                let err = std::io::Error::last_os_error();
                if err.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                panic!("fatal: select() failed in poll_pending_io: {err}");
            }

            let mut ready_idx = Vec::new();
            for (i, waiter) in guard.iter().enumerate() {
                let set = match waiter.mode {
                    IoMode::Read => unsafe { libc::FD_ISSET(waiter.fd, &rd) },
                    IoMode::Write => unsafe { libc::FD_ISSET(waiter.fd, &wr) },
                    IoMode::Except => unsafe { libc::FD_ISSET(waiter.fd, &ex) },
                };
                if set {
                    ready_idx.push(i);
                }
            }

            let mut ready = Vec::with_capacity(ready_idx.len());
            for &i in ready_idx.iter().rev() {
                ready.push(guard.remove(i).ctx);
            }
            let remaining = guard.len();
            return (ready, remaining);
        }
    }

    #[cfg(not(unix))]
    pub(crate) fn poll(&self, _blocking: bool) -> (Vec<Context>, usize) {
        panic!("fatal: pending I/O polling is only implemented for unix targets");
    }
}

#[cfg(test)]
#[cfg(unix)]
mod tests {
    use super::*;
    use crate::context::SizeClass;
    use crate::ids::ContextIdGen;

    fn noop_ctx(pool: &crate::context::ContextPool) -> Context {
        let _ = ContextIdGen::new();
        pool.acquire(SizeClass::Regular, Box::new(|_| {})).0
    }

    #[test]
    fn a_ready_pipe_fd_comes_back_from_poll() {
        let pool = crate::context::ContextPool::new();
        let pending = PendingIo::new();

        let mut fds = [0 as RawFd; 2];
        let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
        assert_eq!(rc, 0, "pipe() should succeed");
        let [read_fd, write_fd] = fds;

        let ctx = noop_ctx(&pool);
        let id = ctx.id();
        pending.register(ctx, read_fd, IoMode::Read);
        assert_eq!(pending.outstanding(), 1);

        // Nothing written yet: a non-blocking poll finds nothing ready.
        let (ready, remaining) = pending.poll(false);
        assert!(ready.is_empty());
        assert_eq!(remaining, 1);

        unsafe {
            libc::write(write_fd, b"x".as_ptr().cast(), 1);
        }

        let (ready, remaining) = pending.poll(false);
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].id(), id);
        assert_eq!(remaining, 0);

        unsafe {
            libc::close(read_fd);
            libc::close(write_fd);
        }
    }

    #[test]
    fn polling_with_nothing_registered_returns_immediately() {
        let pending = PendingIo::new();
        let (ready, remaining) = pending.poll(false);
        assert!(ready.is_empty());
        assert_eq!(remaining, 0);
    }
}
