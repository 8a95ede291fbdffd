//! Foundational public types for the packetpool runtime.
//!
//! Mirrors the shape of a reference crate's `types.rs`: plain data, `serde`
//! derives where the value crosses a process boundary (config, verdicts
//! reported to a control plane), and a `Default` impl for anything with
//! sensible defaults.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// The accept/drop decision the scripting engine hands back to the capture
/// backend for a single packet. The runtime never inspects packet contents;
/// it only ever moves this value around.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Verdict {
    Accept,
    Drop,
}

/// Lifecycle state of a single worker. Transitions are monotonic along one
/// of two paths:
/// `NotStarted -> Running -> {Finished | Error} -> Joined`, or
/// `Running -> Canceled -> Joined`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    NotStarted,
    Running,
    Error,
    Finished,
    Canceled,
    Joined,
}

impl WorkerState {
    /// Whether this state is one `thread_pool_wait`-equivalent code needs to
    /// join: neither never-started nor already-joined.
    pub fn needs_join(self) -> bool {
        !matches!(self, WorkerState::NotStarted | WorkerState::Joined)
    }
}

/// Observability status reported through the engine-thread handle. Distinct
/// from [`WorkerState`]: a worker can be `Running` (lifecycle) while its
/// thread status toggles between `Waiting` (blocked in capture) and
/// `Running` (dispatching a packet) many times.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadStatus {
    Waiting,
    Running,
    Stopped,
    Defunc,
}

/// The two supported shutdown modes (§4.4).
///
/// An external control protocol that still speaks the reference's numeric
/// `force` argument should map `1 -> Soft`, `2 -> Hard`, and any other value
/// to a no-op at that boundary rather than smuggling a third variant into
/// this enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopMode {
    /// Cooperative: set the stop flag and force blocked receives to return.
    Soft,
    /// Emulated async cancel: abandon every worker and force its receive to
    /// return. Refused in single-worker mode.
    Hard,
}

/// A remote-launch control message delivered out-of-band (e.g. from an
/// operator console) and drained by a worker at its next interrupt check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteLaunchRequest {
    pub command: String,
    pub args: Vec<String>,
}

/// Pool/worker configuration, loadable from a TOML file and overridable by
/// CLI flags (CLI wins over file, file wins over these defaults).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Number of workers to create. `1` runs in single mode (no OS thread).
    #[serde(default = "PoolConfig::default_workers")]
    pub workers: usize,

    /// Path to the rule script each worker loads during `bind_script`.
    pub script: PathBuf,

    /// Value assigned to both `haka.grammar.debug` and
    /// `haka.state_machine.debug` equivalents exposed to the script engine.
    #[serde(default)]
    pub grammar_debug: bool,

    /// Start the interactive debugger the moment the pool is created.
    #[serde(default)]
    pub attach_debugger: bool,

    /// `tracing_subscriber::EnvFilter` directive string, e.g. `"info"`.
    #[serde(default = "PoolConfig::default_log_filter")]
    pub log_filter: String,
}

impl PoolConfig {
    fn default_workers() -> usize {
        1
    }

    fn default_log_filter() -> String {
        "info".to_string()
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: Self::default_workers(),
            script: PathBuf::new(),
            grammar_debug: false,
            attach_debugger: false,
            log_filter: Self::default_log_filter(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_state_needs_join() {
        assert!(!WorkerState::NotStarted.needs_join());
        assert!(!WorkerState::Joined.needs_join());
        assert!(WorkerState::Running.needs_join());
        assert!(WorkerState::Finished.needs_join());
        assert!(WorkerState::Error.needs_join());
        assert!(WorkerState::Canceled.needs_join());
    }

    #[test]
    fn pool_config_default_is_single_worker() {
        let config = PoolConfig::default();
        assert_eq!(config.workers, 1);
        assert!(!config.grammar_debug);
        assert!(!config.attach_debugger);
        assert_eq!(config.log_filter, "info");
    }

    #[test]
    fn pool_config_deserializes_with_defaults_for_missing_fields() {
        let toml_src = r#"script = "rules/main.lua""#;
        let config: PoolConfig = toml::from_str(toml_src).expect("parse minimal config");
        assert_eq!(config.workers, 1);
        assert_eq!(config.script, PathBuf::from("rules/main.lua"));
        assert!(!config.grammar_debug);
    }

    #[test]
    fn pool_config_deserializes_full() {
        let toml_src = r#"
            workers = 4
            script = "rules/main.lua"
            grammar_debug = true
            attach_debugger = true
            log_filter = "debug"
        "#;
        let config: PoolConfig = toml::from_str(toml_src).expect("parse full config");
        assert_eq!(config.workers, 4);
        assert!(config.grammar_debug);
        assert!(config.attach_debugger);
        assert_eq!(config.log_filter, "debug");
    }
}
