//! Per-thread one-shot / periodic timers delivered via signal (C1).
//!
//! A timer is bound to the thread that creates it: arming it starts a small
//! helper thread that sleeps for the requested delay and then sends
//! `TIMER_SIGNAL` to the owning thread specifically (`pthread_kill`, not a
//! process-directed `kill`), so only that thread's handler ever runs. The
//! handler itself does the signal-safe-equivalent minimum: it reads the
//! thread-local callback slot and invokes it. Callbacks must therefore only
//! touch lock-free atomics — no allocation, no locking, no I/O.

use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::error::RuntimeError;
use crate::signal::{guard_timer_signal, unguard_timer_signal, TIMER_SIGNAL};

struct ActiveTimer {
    callback: Box<dyn FnMut(u64)>,
    overrun: Arc<AtomicU64>,
}

thread_local! {
    static ACTIVE_TIMER: RefCell<Option<ActiveTimer>> = RefCell::new(None);
}

/// Invoked from the `TIMER_SIGNAL` handler on the owning thread. Reads and
/// resets the overrun counter, then runs the callback. Installed once per
/// process by [`crate::signal::install_handler_once`].
pub(crate) fn dispatch_current_thread() {
    ACTIVE_TIMER.with(|slot| {
        if let Ok(mut guard) = slot.try_borrow_mut() {
            if let Some(active) = guard.as_mut() {
                let overrun = active.overrun.swap(0, Ordering::SeqCst);
                (active.callback)(overrun);
            }
        }
    });
}

/// Unblocks delivery of `TIMER_SIGNAL` on the calling thread. Must be called
/// once, early, on every worker thread that will own a timer (mirrors the
/// reference's `timer_init_thread`, which is itself just `timer_unguard`).
pub fn init_thread() -> Result<(), RuntimeError> {
    unguard_timer_signal()
}

/// A scoped mask: while alive, `TIMER_SIGNAL` cannot interrupt the calling
/// thread. Dropping it restores delivery. Used to bracket critical regions
/// that must not be perturbed by a timer callback firing mid-section.
#[must_use]
pub struct TimerGuard {
    _private: (),
}

/// Blocks `TIMER_SIGNAL` on the calling thread and returns a guard that
/// unblocks it again on drop.
pub fn guard() -> Result<TimerGuard, RuntimeError> {
    guard_timer_signal()?;
    Ok(TimerGuard { _private: () })
}

impl Drop for TimerGuard {
    fn drop(&mut self) {
        if let Err(err) = unguard_timer_signal() {
            tracing::error!(%err, "failed to restore timer signal delivery");
        }
    }
}

/// The capability every per-thread timer implementation exposes. The
/// reference implementation backs this with a POSIX `timer_t`; other targets
/// may back it with a time-wheel thread or a runtime-provided timer, as long
/// as the callback contract (signal-safe-equivalent) is preserved.
pub trait PerThreadTimer {
    /// Arms the timer to fire exactly once after `delay`.
    fn arm_once(&self, delay: Duration) -> Result<(), RuntimeError>;
    /// Arms the timer to fire every `interval`, starting after one interval.
    fn arm_repeating(&self, interval: Duration) -> Result<(), RuntimeError>;
    /// Disarms the timer without destroying it; it may be re-armed later.
    fn stop(&self) -> Result<(), RuntimeError>;
}

/// Signal-backed [`PerThreadTimer`]. Must be constructed on the thread that
/// will own it; `arm_once`/`arm_repeating`/`stop` may only be called from
/// that same thread.
pub struct SignalTimer {
    stop_flag: Arc<AtomicBool>,
    overrun: Arc<AtomicU64>,
    owner: libc::pthread_t,
    ticker: std::sync::Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl SignalTimer {
    /// Creates a timer bound to the calling thread. `callback` receives the
    /// overrun count observed since the previous invocation (always `0` for
    /// a one-shot timer, potentially nonzero for a repeating timer whose
    /// handler is delayed past more than one interval).
    pub fn new<F>(callback: F) -> Self
    where
        F: FnMut(u64) + 'static,
    {
        let overrun = Arc::new(AtomicU64::new(0));
        ACTIVE_TIMER.with(|slot| {
            *slot.borrow_mut() = Some(ActiveTimer {
                callback: Box::new(callback),
                overrun: Arc::clone(&overrun),
            });
        });

        SignalTimer {
            stop_flag: Arc::new(AtomicBool::new(false)),
            overrun,
            // SAFETY: `pthread_self` has no preconditions.
            owner: unsafe { libc::pthread_self() },
            ticker: std::sync::Mutex::new(None),
        }
    }

    fn spawn_ticker(&self, first_delay: Duration, interval: Option<Duration>) -> Result<(), RuntimeError> {
        self.join_previous_ticker();
        self.stop_flag.store(false, Ordering::SeqCst);

        let stop_flag = Arc::clone(&self.stop_flag);
        let overrun = Arc::clone(&self.overrun);
        let owner = self.owner;

        let handle = std::thread::Builder::new()
            .name("packetpool-timer".to_string())
            .spawn(move || {
                std::thread::sleep(first_delay);
                loop {
                    if stop_flag.load(Ordering::SeqCst) {
                        return;
                    }
                    // SAFETY: `owner` was captured via `pthread_self` on a
                    // still-live thread at timer-construction time; sending
                    // a signal to a thread that has since exited is a
                    // documented no-op/error on Linux, not undefined
                    // behavior, so no extra synchronization is required
                    // here beyond the stop flag.
                    unsafe {
                        libc::pthread_kill(owner, TIMER_SIGNAL);
                    }
                    match interval {
                        Some(interval) => std::thread::sleep(interval),
                        None => return,
                    }
                }
            })
            .map_err(|err| RuntimeError::Os(format!("spawn timer thread: {err}")))?;

        *self.ticker.lock().expect("ticker mutex poisoned") = Some(handle);
        Ok(())
    }

    fn join_previous_ticker(&self) {
        self.stop_flag.store(true, Ordering::SeqCst);
        if let Some(handle) = self.ticker.lock().expect("ticker mutex poisoned").take() {
            let _ = handle.join();
        }
    }
}

impl PerThreadTimer for SignalTimer {
    fn arm_once(&self, delay: Duration) -> Result<(), RuntimeError> {
        self.spawn_ticker(delay, None)
    }

    fn arm_repeating(&self, interval: Duration) -> Result<(), RuntimeError> {
        self.spawn_ticker(interval, Some(interval))
    }

    fn stop(&self) -> Result<(), RuntimeError> {
        self.join_previous_ticker();
        Ok(())
    }
}

impl Drop for SignalTimer {
    fn drop(&mut self) {
        self.join_previous_ticker();
        ACTIVE_TIMER.with(|slot| {
            *slot.borrow_mut() = None;
        });
    }
}
