//! The scripting engine (§6.2) and the per-worker handle it is driven
//! through (§6.3).
//!
//! `ScriptEngine` is deliberately not generic over the capture backend: it
//! only ever sees [`Packet`], the runtime's fixed packet representation, via
//! the [`PacketSource`] trait object a worker hands it. That keeps a script
//! engine implementation reusable across any [`crate::backend::PacketBackend`]
//! and lets [`crate::pool::WorkerPool`] hold engines as `Box<dyn ScriptEngine>`
//! without a second generic parameter alongside the backend.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Mutex;

use crate::backend::Packet;
use crate::error::RuntimeError;
use crate::types::{RemoteLaunchRequest, ThreadStatus, Verdict};

/// Result of a single `receive_next` call (§4.3).
pub struct ReceiveOutcome {
    /// The packet to dispatch, or `None` if the worker should stop.
    pub packet: Option<Packet>,
    /// Whether `run_extra` has work to do before the next `receive_next`.
    pub has_extra: bool,
    /// Whether the worker's main loop should exit after this call.
    pub stop: bool,
}

/// The two operations the runtime exposes to a [`ScriptEngine`]'s `run` loop
/// (§4.3, §6.2). A worker implements this over its bound capture state and
/// engine-thread handle; the engine never sees the backend or pool directly.
pub trait PacketSource {
    /// Fetches the next packet to dispatch, or signals that the loop should
    /// stop. `vm_has_pending_interrupts` is supplied by the engine itself
    /// (only it knows whether its VM has queued interrupt work) and is
    /// folded into the returned `has_extra`.
    fn receive_next(&mut self, vm_has_pending_interrupts: bool) -> ReceiveOutcome;

    /// Drains runtime-level extra work: remote-launch requests and a
    /// pending debugger attach. `run_vm_interrupts` is invoked first so the
    /// engine's own interrupt queue runs before the runtime's.
    fn run_extra(&mut self, run_vm_interrupts: &mut dyn FnMut());

    /// Reports the verdict for a packet previously returned by `receive_next`.
    fn verdict(&mut self, pkt: Packet, result: Verdict);
}

/// A pluggable rule-dispatch engine (§6.2): owns a VM, loads a script, and
/// drives its own per-packet main loop against a [`PacketSource`].
pub trait ScriptEngine: Send {
    /// Loads and compiles the script at `path` into a fresh VM.
    fn load(&mut self, path: &Path) -> Result<(), RuntimeError>;

    /// Computes and logs a rule summary (rule count, grammar warnings). Run
    /// once after `load` succeeds, before the worker is marked `Running`.
    fn rule_summary(&mut self) -> Result<(), RuntimeError>;

    /// Called once the worker has transitioned to `Running`, before the
    /// first `run` call.
    fn on_started(&mut self) {}

    /// Whether the VM has interrupt work queued (a pending coroutine resume,
    /// a scheduled callback) that `run_interrupts` needs to drain.
    fn has_pending_interrupts(&self) -> bool {
        false
    }

    /// Drains whatever `has_pending_interrupts` reported.
    fn run_interrupts(&mut self) {}

    /// The engine's main loop: repeatedly calls `source.receive_next`,
    /// dispatches the packet against loaded rules, calls `source.verdict`,
    /// and calls `source.run_extra` whenever `has_extra` was set. Returns
    /// once `source.receive_next` reports `stop`.
    fn run(&mut self, source: &mut dyn PacketSource);

    /// Releases the VM. Called from the worker's cleanup path, always after
    /// `run` has returned and always before the capture state it was bound
    /// to is cleaned up (§4.4 two-pass teardown).
    fn shutdown(&mut self) {}
}

/// A minimal [`ScriptEngine`] that accepts every packet without consulting
/// any rule script. Used as the bundled default for the CLI and for
/// exercising the runtime's loop/interrupt/teardown behavior independent of
/// any real scripting language.
#[derive(Default)]
pub struct PassThroughEngine {
    loaded: bool,
}

impl ScriptEngine for PassThroughEngine {
    fn load(&mut self, path: &Path) -> Result<(), RuntimeError> {
        tracing::debug!(path = %path.display(), "pass-through engine: treating any path as valid");
        self.loaded = true;
        Ok(())
    }

    fn rule_summary(&mut self) -> Result<(), RuntimeError> {
        if !self.loaded {
            return Err(RuntimeError::ScriptInit("rule_summary called before load".into()));
        }
        tracing::info!(rules = 0, "pass-through engine: no rules loaded, every packet is accepted");
        Ok(())
    }

    fn run(&mut self, source: &mut dyn PacketSource) {
        let mut vm_has_pending = false;
        loop {
            let outcome = source.receive_next(vm_has_pending);
            vm_has_pending = false;

            if let Some(pkt) = outcome.packet {
                source.verdict(pkt, Verdict::Accept);
            }

            if outcome.has_extra {
                source.run_extra(&mut || {});
            }

            if outcome.stop {
                return;
            }
        }
    }
}

/// Per-worker observability and control surface (§6.3), shared between the
/// worker's own thread and the controller thread issuing remote-launch
/// requests or a debugger attach.
pub struct EngineThreadHandle {
    status: AtomicU8,
    remote_launch: Mutex<VecDeque<RemoteLaunchRequest>>,
    interrupted: AtomicBool,
}

const STATUS_WAITING: u8 = 0;
const STATUS_RUNNING: u8 = 1;
const STATUS_STOPPED: u8 = 2;
const STATUS_DEFUNC: u8 = 3;

impl EngineThreadHandle {
    pub fn new() -> Self {
        EngineThreadHandle {
            status: AtomicU8::new(STATUS_WAITING),
            remote_launch: Mutex::new(VecDeque::new()),
            interrupted: AtomicBool::new(false),
        }
    }

    pub fn update_status(&self, status: ThreadStatus) {
        let encoded = match status {
            ThreadStatus::Waiting => STATUS_WAITING,
            ThreadStatus::Running => STATUS_RUNNING,
            ThreadStatus::Stopped => STATUS_STOPPED,
            ThreadStatus::Defunc => STATUS_DEFUNC,
        };
        self.status.store(encoded, Ordering::SeqCst);
    }

    pub fn status(&self) -> ThreadStatus {
        match self.status.load(Ordering::SeqCst) {
            STATUS_WAITING => ThreadStatus::Waiting,
            STATUS_RUNNING => ThreadStatus::Running,
            STATUS_STOPPED => ThreadStatus::Stopped,
            _ => ThreadStatus::Defunc,
        }
    }

    /// Enqueues a remote-launch request for the owning worker to pick up at
    /// its next `run_extra` call.
    pub fn enqueue_remote_launch(&self, request: RemoteLaunchRequest) {
        self.remote_launch
            .lock()
            .expect("remote launch queue poisoned")
            .push_back(request);
    }

    /// Whether a remote-launch request is queued, without consuming it.
    pub fn has_remote_launch(&self) -> bool {
        !self.remote_launch.lock().expect("remote launch queue poisoned").is_empty()
    }

    /// Pops and handles one queued remote-launch request, if any. The
    /// bundled runtime only logs it; a real embedder would dispatch it to
    /// its own command table.
    pub fn check_remote_launch(&self) {
        let next = self.remote_launch.lock().expect("remote launch queue poisoned").pop_front();
        if let Some(request) = next {
            tracing::info!(command = %request.command, args = ?request.args, "remote launch request drained");
        }
    }

    /// Forces the owning worker's current or next `receive_next` call to
    /// report `stop: true`, regardless of whether the backend still has
    /// packets queued. Used by both soft and hard stop (§4.4).
    pub fn interrupt_begin(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
    }

    /// Consumes the interrupt flag set by `interrupt_begin`, if any.
    pub(crate) fn take_interrupted(&self) -> bool {
        self.interrupted.swap(false, Ordering::SeqCst)
    }
}

impl Default for EngineThreadHandle {
    fn default() -> Self {
        Self::new()
    }
}
