//! Per-thread signal masking discipline (C5).
//!
//! Two concerns live here: the one-time process-wide installation of the
//! timer signal handler, and the per-thread mask that keeps every signal
//! except the three fatal synchronous ones blocked on worker threads so a
//! worker's own timer is the only thing that can interrupt it.

use std::cell::Cell;
use std::sync::Once;

use crate::error::RuntimeError;

/// The signal used for every per-thread timer. Chosen to match the POSIX
/// convention of `SIGALRM` for interval/one-shot timer expiry.
pub const TIMER_SIGNAL: libc::c_int = libc::SIGALRM;

static HANDLER_INSTALLED: Once = Once::new();

thread_local! {
    static CURRENT_WORKER_ID: Cell<Option<usize>> = Cell::new(None);
}

/// Records which worker owns the calling thread, so logs and engine APIs can
/// identify it without threading an id through every call.
pub fn set_current_worker_id(id: usize) {
    CURRENT_WORKER_ID.with(|slot| slot.set(Some(id)));
}

/// Returns the id of the worker that owns the calling thread, or `None` on
/// the controller thread before a worker has claimed it (or in single mode,
/// before `Worker::run` has started).
pub fn current_worker_id() -> Option<usize> {
    CURRENT_WORKER_ID.with(|slot| slot.get())
}

extern "C" fn timer_trampoline(_signum: libc::c_int) {
    crate::timer::dispatch_current_thread();
}

/// Installs the process-wide `SIGALRM` handler exactly once. Must run on the
/// controller thread before any worker is spawned (§4.5); calling it again
/// from a second `WorkerPool` in the same process is a no-op, not an error.
pub fn install_handler_once() {
    HANDLER_INSTALLED.call_once(|| {
        // SAFETY: `sa` is zero-initialized before any field is interpreted
        // by the kernel; `sigaction` validates the signal number and flags.
        unsafe {
            let mut sa: libc::sigaction = std::mem::zeroed();
            sa.sa_sigaction = timer_trampoline as usize;
            sa.sa_flags = 0;
            libc::sigemptyset(&mut sa.sa_mask);
            if libc::sigaction(TIMER_SIGNAL, &sa, std::ptr::null_mut()) != 0 {
                let err = std::io::Error::last_os_error();
                tracing::error!(error = %err, "failed to install timer signal handler");
                std::process::abort();
            }
        }
    });
}

/// Blocks every signal on the calling thread except the fatal synchronous
/// three (`SIGILL`, `SIGFPE`, `SIGSEGV`), which are left unmasked so a
/// programming error still aborts the process deterministically rather than
/// being silently swallowed.
pub fn block_all_except_fatal() -> Result<(), RuntimeError> {
    // SAFETY: `set` is a local, fully-initialized `sigset_t`; the pointers
    // passed to the mask calls are valid for the duration of the call.
    unsafe {
        let mut set: libc::sigset_t = std::mem::zeroed();
        libc::sigfillset(&mut set);
        libc::sigdelset(&mut set, libc::SIGSEGV);
        libc::sigdelset(&mut set, libc::SIGILL);
        libc::sigdelset(&mut set, libc::SIGFPE);
        if libc::pthread_sigmask(libc::SIG_BLOCK, &set, std::ptr::null_mut()) != 0 {
            let err = std::io::Error::last_os_error();
            return Err(RuntimeError::Os(format!("pthread_sigmask(SIG_BLOCK): {err}")));
        }
    }
    Ok(())
}

/// Blocks `TIMER_SIGNAL` on the calling thread. Used as a scoped critical
/// section by [`crate::timer::TimerGuard`].
pub(crate) fn guard_timer_signal() -> Result<(), RuntimeError> {
    set_timer_signal_mask(libc::SIG_BLOCK)
}

/// Unblocks `TIMER_SIGNAL` on the calling thread. Called once per worker
/// thread during startup so it can receive its own timer's expiries.
pub fn unguard_timer_signal() -> Result<(), RuntimeError> {
    set_timer_signal_mask(libc::SIG_UNBLOCK)
}

fn set_timer_signal_mask(how: libc::c_int) -> Result<(), RuntimeError> {
    // SAFETY: `set` is a local, fully-initialized `sigset_t` containing only
    // `TIMER_SIGNAL`; the pointer is valid for the duration of the call.
    unsafe {
        let mut set: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut set);
        libc::sigaddset(&mut set, TIMER_SIGNAL);
        if libc::pthread_sigmask(how, &set, std::ptr::null_mut()) != 0 {
            let err = std::io::Error::last_os_error();
            return Err(RuntimeError::Os(format!("pthread_sigmask: {err}")));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_worker_id_defaults_to_none_on_a_fresh_thread() {
        let result = std::thread::spawn(current_worker_id).join().unwrap();
        assert_eq!(result, None);
    }

    #[test]
    fn current_worker_id_round_trips_per_thread() {
        let result = std::thread::spawn(|| {
            set_current_worker_id(7);
            current_worker_id()
        })
        .join()
        .unwrap();
        assert_eq!(result, Some(7));
    }

    #[test]
    fn block_all_except_fatal_succeeds_on_a_fresh_thread() {
        let result = std::thread::spawn(block_all_except_fatal).join().unwrap();
        assert!(result.is_ok());
    }

    #[test]
    fn guard_and_unguard_round_trip() {
        let result = std::thread::spawn(|| {
            guard_timer_signal()?;
            unguard_timer_signal()
        })
        .join()
        .unwrap();
        assert!(result.is_ok());
    }
}
