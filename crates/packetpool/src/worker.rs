//! A single worker's state machine (C2) and main loop (C3).
//!
//! [`Worker`] owns everything bound to exactly one OS thread: the loaded
//! script engine, the capture state. [`WorkerControl`] is the shared half —
//! cloned into an `Arc` before the worker's thread is spawned so the
//! controller thread can observe its lifecycle state, read its thread
//! status, queue remote-launch requests, and request a debugger attach,
//! all without touching the worker's own non-`Sync` internals.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Barrier, Mutex};

use crate::backend::{Packet, PacketBackend};
use crate::debugger::Debugger;
use crate::engine::{EngineThreadHandle, PacketSource, ReceiveOutcome, ScriptEngine};
use crate::error::RuntimeError;
use crate::pool::PoolShared;
use crate::signal;
use crate::timer;
use crate::types::{ThreadStatus, Verdict, WorkerState};

/// The shared half of a worker: safe to hand to the controller thread while
/// the worker's own thread runs [`Worker::run`].
pub struct WorkerControl {
    pub id: usize,
    pub engine_thread: EngineThreadHandle,
    pub debugger_local: AtomicU64,
    pub abandoned: AtomicBool,
    state: Mutex<WorkerState>,
}

impl WorkerControl {
    fn new(id: usize) -> Self {
        WorkerControl {
            id,
            engine_thread: EngineThreadHandle::new(),
            debugger_local: AtomicU64::new(0),
            abandoned: AtomicBool::new(false),
            state: Mutex::new(WorkerState::NotStarted),
        }
    }

    pub fn state(&self) -> WorkerState {
        *self.state.lock().expect("worker state mutex poisoned")
    }

    fn set_state(&self, next: WorkerState) {
        *self.state.lock().expect("worker state mutex poisoned") = next;
    }

    /// Emulated async-cancel (§4.4, §9): marks this worker abandoned and
    /// forces its in-flight or next `receive_next` to return, without
    /// actually interrupting whatever scripted dispatch may be running.
    pub fn abandon(&self) {
        self.abandoned.store(true, Ordering::SeqCst);
        self.engine_thread.interrupt_begin();
    }
}

/// A single worker's non-shared state: the script engine it will drive and
/// the capture handle it was bound to.
///
/// `engine` is declared before `capture` deliberately: if a `Worker` is ever
/// dropped whole without `run` having been called (e.g. `Builder::spawn`
/// itself fails), field drop order destroys the engine before the capture,
/// matching the two-pass teardown invariant (§4.4, §8) even on that path.
pub struct Worker<B: PacketBackend> {
    backend: Arc<B>,
    engine: Box<dyn ScriptEngine>,
    script: PathBuf,
    grammar_debug: bool,
    capture: B::State,
    control: Arc<WorkerControl>,
}

impl<B: PacketBackend> Worker<B> {
    /// Creates the per-worker capture handle bound to `id` and holds onto
    /// the engine it will later bind a script into (C2). Does not load the
    /// script yet — see [`Worker::run`] and the pool controller's
    /// single-mode inline call to `bind_script`.
    pub fn init(
        id: usize,
        backend: Arc<B>,
        engine: Box<dyn ScriptEngine>,
        script: PathBuf,
        grammar_debug: bool,
    ) -> Result<Self, RuntimeError> {
        let capture = backend
            .init_state(id)
            .map_err(|err| RuntimeError::CaptureInit(err.to_string()))?;
        Ok(Worker {
            backend,
            engine,
            script,
            grammar_debug,
            capture,
            control: Arc::new(WorkerControl::new(id)),
        })
    }

    /// Returns a clone of this worker's shared control handle, to keep
    /// alongside the `JoinHandle` once the worker's thread is spawned.
    pub fn control(&self) -> Arc<WorkerControl> {
        Arc::clone(&self.control)
    }

    /// The bind-time debugger check plus script load (§4.2): if the pool's
    /// global debugger generation is ahead of this worker's locally observed
    /// generation, starts the debugger with `break_on_entry = false` before
    /// loading the script — mirrors the original's `init_thread_lua_state`,
    /// the only debugger check that ever runs with that literal.
    ///
    /// Runs on the controller's own thread in single-worker mode (called
    /// directly by the pool before `run`), or on the worker's own spawned
    /// thread in multi-worker mode (called from within `run`, before the
    /// `start_sync` barrier).
    pub(crate) fn bind_script(&mut self, shared: &PoolShared, debugger: &dyn Debugger) -> Result<(), RuntimeError> {
        let global = shared.debugger_global.load(Ordering::SeqCst);
        let local = self.control.debugger_local.load(Ordering::SeqCst);
        if global > local {
            debugger.start(false);
            self.control.debugger_local.store(global, Ordering::SeqCst);
        }

        if self.grammar_debug {
            tracing::debug!(worker = self.control.id, "grammar debug enabled for this worker");
        }
        self.engine.load(&self.script)?;
        self.engine.rule_summary()?;
        Ok(())
    }

    /// The worker's main loop (C3). In multi-worker mode this runs on a
    /// dedicated OS thread spawned while the pool is being built: signal
    /// masking, timer setup, and `bind_script` all happen here, on that
    /// thread, never on the controller's — the scripting engine must never
    /// cross a thread boundary once bound. `single` skips every step that
    /// only has meaning with a second party to coordinate with: in
    /// single-worker mode the controller already called `bind_script`
    /// directly before calling `run`, and both barriers are formalities of
    /// arity 1 that never block.
    ///
    /// Always returns the capture state so the pool can clean it up after
    /// every worker has both run and had its script engine shut down (§4.4
    /// two-pass teardown): this function destroys `engine` but deliberately
    /// never calls [`PacketBackend::cleanup_state`] on `capture`.
    pub fn run(
        mut self,
        shared: Arc<PoolShared>,
        debugger: Arc<dyn Debugger>,
        single: bool,
        start_barrier: &Barrier,
        proceed_barrier: &Barrier,
    ) -> B::State {
        signal::set_current_worker_id(self.control.id);

        let mut startup_err = None;
        if !single {
            startup_err = signal::block_all_except_fatal().err();
            if startup_err.is_none() {
                startup_err = timer::init_thread().err();
            }
            if startup_err.is_none() {
                startup_err = self.bind_script(&shared, &*debugger).err();
            }
        }

        // `fail` (which sets the `Error` lifecycle state) runs before the
        // controller is released from its `start_barrier.wait()`, so the
        // state it inspects right after that call is never stale.
        if let Some(err) = startup_err {
            self.fail(err);
            if !single {
                start_barrier.wait();
                proceed_barrier.wait();
            }
            return self.capture;
        }

        // Arity-2 barrier: tells the controller this thread has finished
        // signal/timer setup and script binding, before the controller
        // moves on to spawn the next worker.
        if !single {
            start_barrier.wait();
        }

        self.backend.init(&mut self.capture);
        self.engine.on_started();
        self.control.engine_thread.update_status(ThreadStatus::Waiting);
        self.control.set_state(WorkerState::Running);

        if !single {
            // Released individually by the controller once every worker's
            // startup outcome is known (§4.4): one arity-2 barrier per
            // worker rather than a single shared barrier, so a startup
            // failure on any one worker can never leave an already-healthy
            // worker wedged waiting for a party that will never arrive.
            proceed_barrier.wait();
        }

        {
            let mut handle = WorkerHandle {
                backend: &*self.backend,
                capture: &mut self.capture,
                control: &self.control,
                shared: &shared,
                debugger: &*debugger,
            };
            self.engine.run(&mut handle);
        }

        let final_state = if self.control.abandoned.load(Ordering::SeqCst) {
            WorkerState::Canceled
        } else {
            WorkerState::Finished
        };
        self.control.engine_thread.update_status(ThreadStatus::Stopped);
        self.control.set_state(final_state);
        self.engine.shutdown();

        self.capture
    }

    fn fail(&self, err: RuntimeError) {
        tracing::error!(worker = self.control.id, error = %err, "worker failed during startup");
        self.control.engine_thread.update_status(ThreadStatus::Defunc);
        self.control.set_state(WorkerState::Error);
        if err.is_fatal_at_startup() {
            std::process::abort();
        }
    }
}

/// The live [`PacketSource`] a worker builds for the duration of a single
/// `ScriptEngine::run` call (§6.3).
struct WorkerHandle<'a, B: PacketBackend> {
    backend: &'a B,
    capture: &'a mut B::State,
    control: &'a WorkerControl,
    shared: &'a PoolShared,
    debugger: &'a dyn Debugger,
}

impl<'a, B: PacketBackend> PacketSource for WorkerHandle<'a, B> {
    fn receive_next(&mut self, vm_has_pending_interrupts: bool) -> ReceiveOutcome {
        if self.shared.stop.load(Ordering::SeqCst)
            || self.control.abandoned.load(Ordering::SeqCst)
            || self.control.engine_thread.take_interrupted()
        {
            return ReceiveOutcome { packet: None, has_extra: false, stop: true };
        }

        self.control.engine_thread.update_status(ThreadStatus::Waiting);
        let received = self.backend.receive(self.capture);
        self.control.engine_thread.update_status(ThreadStatus::Running);

        match received {
            Ok(Some(pkt)) => {
                let has_extra = vm_has_pending_interrupts
                    || self.shared.debugger_global.load(Ordering::SeqCst)
                        > self.control.debugger_local.load(Ordering::SeqCst)
                    || self.control.engine_thread.has_remote_launch();
                ReceiveOutcome { packet: Some(pkt), has_extra, stop: false }
            }
            Ok(None) => ReceiveOutcome { packet: None, has_extra: false, stop: true },
            Err(err) => {
                tracing::error!(worker = self.control.id, error = %err, "capture backend error");
                ReceiveOutcome { packet: None, has_extra: false, stop: true }
            }
        }
    }

    fn run_extra(&mut self, run_vm_interrupts: &mut dyn FnMut()) {
        run_vm_interrupts();
        self.control.engine_thread.check_remote_launch();

        let global = self.shared.debugger_global.load(Ordering::SeqCst);
        let local = self.control.debugger_local.load(Ordering::SeqCst);
        if global > local {
            // Hardwired true: the only other debugger check, in
            // `bind_script`, always starts it with `false` instead.
            self.debugger.start(true);
            self.control.debugger_local.store(global, Ordering::SeqCst);
        }
    }

    fn verdict(&mut self, pkt: Packet, result: Verdict) {
        self.backend.verdict(pkt, result);
    }
}
