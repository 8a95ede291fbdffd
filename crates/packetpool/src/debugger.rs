//! The interactive script debugger (§6.4): out-of-scope as a concept (a real
//! implementation would pause VM execution and expose a REPL over a socket
//! or terminal), but a bundled no-op is provided as the default so a pool
//! can be created without wiring one up.

/// Capability an interactive script debugger exposes to the worker pool. The
/// pool only ever calls `start`, always from the worker thread whose
/// `debugger_local` counter just fell behind the pool-wide generation.
pub trait Debugger: Send + Sync {
    /// Attaches the debugger to the calling thread's script engine.
    /// `break_on_entry` requests that execution pause before the next
    /// instruction rather than running to the next scripted breakpoint.
    fn start(&self, break_on_entry: bool);
}

/// A [`Debugger`] that does nothing but log the attach request. The default
/// for [`crate::pool::WorkerPool::create`] when no debugger is configured.
#[derive(Debug, Default)]
pub struct NullDebugger;

impl Debugger for NullDebugger {
    fn start(&self, break_on_entry: bool) {
        tracing::info!(break_on_entry, "debugger attach requested; no debugger configured");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_debugger_start_does_not_panic() {
        let debugger = NullDebugger;
        debugger.start(true);
        debugger.start(false);
    }
}
