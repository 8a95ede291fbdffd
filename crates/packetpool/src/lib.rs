//! A worker-pool runtime for packet-filtering engines: spawn `N` workers
//! against a pluggable [`PacketBackend`], each driving a pluggable
//! [`ScriptEngine`] over the packets it receives, with cooperative
//! (`stop`) and emulated-async-cancel (`cancel`) shutdown and a two-pass
//! teardown that always destroys every script engine before any capture
//! handle.
//!
//! ```no_run
//! use std::sync::Arc;
//! use packetpool::{OfflineCapture, PassThroughEngine, PoolConfig, WorkerPool};
//!
//! let backend = Arc::new(OfflineCapture::new(vec![(1, vec![0xff])], 1, "raw"));
//! let config = PoolConfig { workers: 1, ..PoolConfig::default() };
//! let mut pool = WorkerPool::create(backend, &config, Box::new(|| Box::new(PassThroughEngine::default())))
//!     .expect("create pool");
//! pool.start().expect("start pool");
//! pool.wait().expect("wait for workers");
//! ```

pub mod backend;
pub mod debugger;
pub mod engine;
pub mod error;
pub mod pool;
pub mod signal;
pub mod timer;
pub mod types;
pub mod worker;

pub use backend::{OfflineCapture, Packet, PacketBackend, SingleThreadedCapture};
pub use debugger::{Debugger, NullDebugger};
pub use engine::{EngineThreadHandle, PacketSource, PassThroughEngine, ReceiveOutcome, ScriptEngine};
pub use error::RuntimeError;
pub use pool::{EngineFactory, WorkerPool};
pub use timer::{PerThreadTimer, SignalTimer, TimerGuard};
pub use types::{PoolConfig, RemoteLaunchRequest, StopMode, ThreadStatus, Verdict, WorkerState};
pub use worker::{Worker, WorkerControl};
