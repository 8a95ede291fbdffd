//! Error kinds produced by the worker-pool runtime.
//!
//! One variant per failure kind distinguished by the design (memory, OS,
//! capture-init, script-init, script-runtime, backend-EOF, refused). Callers
//! that only care whether an operation succeeded can match on the coarse
//! variant; the inner `String` carries whatever detail the underlying
//! collaborator (capture backend, script engine, OS syscall) reported.

/// Errors raised anywhere in the worker-pool runtime.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// Allocation failed while constructing a worker or the pool.
    #[error("memory allocation failed")]
    Memory,

    /// A signal-mask, timer, or thread syscall failed.
    #[error("OS error: {0}")]
    Os(String),

    /// The OS refused to hand out a new per-thread timer.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// `PacketBackend::init_state` failed.
    #[error("capture backend init failed: {0}")]
    CaptureInit(String),

    /// Loading the script, or computing its rule summary, failed.
    #[error("script init failed: {0}")]
    ScriptInit(String),

    /// A script raised an error while dispatching a packet.
    #[error("script runtime error: {0}")]
    ScriptRuntime(String),

    /// The capture backend reported end-of-stream.
    #[error("capture backend reached EOF")]
    BackendEof,

    /// The requested operation does not apply in the current pool mode
    /// (e.g. a hard stop of a single-worker pool).
    #[error("operation refused")]
    Refused,
}

impl RuntimeError {
    /// True for the two kinds that, when raised during worker startup, call
    /// for an immediate process abort rather than an `Error` lifecycle
    /// transition (see §7: a runtime whose signal discipline is broken
    /// cannot be trusted to run safely).
    pub fn is_fatal_at_startup(&self) -> bool {
        matches!(self, RuntimeError::Os(_) | RuntimeError::ResourceExhausted(_))
    }
}
