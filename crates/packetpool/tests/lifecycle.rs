//! End-to-end lifecycle scenarios against the public API.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use packetpool::{
    Debugger, EngineFactory, OfflineCapture, PacketSource, PassThroughEngine, PoolConfig, RuntimeError,
    ScriptEngine, SingleThreadedCapture, Verdict, WorkerPool, WorkerState,
};

fn config(workers: usize) -> PoolConfig {
    PoolConfig {
        workers,
        script: PathBuf::from("rules/main.lua"),
        grammar_debug: false,
        attach_debugger: false,
        log_filter: "info".to_string(),
    }
}

fn pass_through_factory() -> EngineFactory {
    Box::new(|| Box::new(PassThroughEngine::default()))
}

#[test]
fn happy_path_two_workers_three_packets_each() {
    let packets = (1..=6u64).map(|id| (id, vec![])).collect();
    let backend = Arc::new(OfflineCapture::new(packets, 2, "raw"));
    let mut pool = WorkerPool::create(Arc::clone(&backend), &config(2), pass_through_factory()).unwrap();

    pool.start().unwrap();
    pool.wait().unwrap();

    assert_eq!(pool.worker_states(), vec![WorkerState::Finished, WorkerState::Finished]);
    let mut accepted = backend.accepts();
    accepted.sort_unstable();
    assert_eq!(accepted, vec![1, 2, 3, 4, 5, 6]);
    // Every packet gets exactly one verdict: none dropped, none double-counted.
    assert!(backend.drops().is_empty());
}

/// An engine that sleeps between packets so a `stop`/`cancel` call issued
/// from the test thread has a real window to land mid-run instead of racing
/// a loop that always finishes first.
struct SlowEngine;

impl ScriptEngine for SlowEngine {
    fn load(&mut self, _path: &Path) -> Result<(), RuntimeError> {
        Ok(())
    }

    fn rule_summary(&mut self) -> Result<(), RuntimeError> {
        Ok(())
    }

    fn run(&mut self, source: &mut dyn PacketSource) {
        loop {
            let outcome = source.receive_next(false);
            if let Some(pkt) = outcome.packet {
                std::thread::sleep(Duration::from_millis(20));
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

#[test]
fn soft_stop_mid_run_joins_cleanly_without_error_states() {
    let packets = (1..=500u64).map(|id| (id, vec![])).collect();
    let backend = Arc::new(OfflineCapture::new(packets, 2, "raw"));
    let mut pool = WorkerPool::create(
        Arc::clone(&backend),
        &config(2),
        Box::new(|| Box::new(SlowEngine)),
    )
    .unwrap();

    pool.start().unwrap();
    std::thread::sleep(Duration::from_millis(50));
    pool.stop().unwrap();
    pool.wait().unwrap();

    for state in pool.worker_states() {
        assert!(matches!(state, WorkerState::Finished | WorkerState::Canceled));
    }
    // Soft stop is cooperative: it never abandons a worker.
    assert!(!pool.worker_states().contains(&WorkerState::Error));
    assert!(backend.accepts().len() < 500);
}

#[test]
fn hard_stop_marks_workers_canceled_in_multi_worker_mode() {
    let packets = (1..=500u64).map(|id| (id, vec![])).collect();
    let backend = Arc::new(OfflineCapture::new(packets, 2, "raw"));
    let mut pool = WorkerPool::create(
        Arc::clone(&backend),
        &config(2),
        Box::new(|| Box::new(SlowEngine)),
    )
    .unwrap();

    pool.start().unwrap();
    std::thread::sleep(Duration::from_millis(50));
    pool.cancel().unwrap();
    pool.wait().unwrap();

    assert!(pool.worker_states().iter().any(|s| *s == WorkerState::Canceled));
}

#[test]
fn hard_stop_is_refused_in_single_worker_mode() {
    let backend = Arc::new(SingleThreadedCapture::new(vec![], "raw"));
    let pool = WorkerPool::create(Arc::clone(&backend), &config(1), pass_through_factory()).unwrap();

    assert!(matches!(pool.cancel(), Err(RuntimeError::Refused)));
}

struct RecordingDebugger {
    starts: std::sync::Mutex<Vec<bool>>,
}

impl Debugger for RecordingDebugger {
    fn start(&self, break_on_entry: bool) {
        self.starts.lock().unwrap().push(break_on_entry);
    }
}

#[test]
fn attaching_a_debugger_mid_run_invokes_it_exactly_once_per_worker() {
    // Needs a genuinely concurrent pool: a single-worker pool's `start`
    // blocks until that one worker's entire loop has finished, leaving no
    // window for a mid-run `attach_debugger` call to land.
    let packets = (1..=400u64).map(|id| (id, vec![])).collect();
    let backend = Arc::new(OfflineCapture::new(packets, 2, "raw"));
    let debugger = Arc::new(RecordingDebugger { starts: std::sync::Mutex::new(Vec::new()) });

    let mut pool = WorkerPool::create(
        Arc::clone(&backend),
        &config(2),
        Box::new(|| Box::new(SlowEngine)),
    )
    .unwrap()
    .with_debugger(Arc::clone(&debugger));

    pool.start().unwrap();
    std::thread::sleep(Duration::from_millis(30));
    pool.attach_debugger();
    pool.stop().unwrap();
    pool.wait().unwrap();

    // Each worker observes the generation bump exactly once and starts the
    // debugger with break_on_entry=true, the literal `run_extra` hardcodes.
    let starts = debugger.starts.lock().unwrap();
    assert_eq!(starts.len(), 2);
    assert!(starts.iter().all(|&b| b));
}

struct FailsToLoad;

impl ScriptEngine for FailsToLoad {
    fn load(&mut self, _path: &Path) -> Result<(), RuntimeError> {
        Err(RuntimeError::ScriptInit("syntax error".to_string()))
    }

    fn rule_summary(&mut self) -> Result<(), RuntimeError> {
        Ok(())
    }

    fn run(&mut self, _source: &mut dyn PacketSource) {}
}

#[test]
fn script_init_failure_on_one_worker_aborts_pool_creation() {
    let counter = Arc::new(AtomicUsize::new(0));
    let backend = Arc::new(OfflineCapture::new(vec![(1, vec![]), (2, vec![]), (3, vec![])], 3, "raw"));

    let result = WorkerPool::create(
        Arc::clone(&backend),
        &config(3),
        Box::new(move || {
            let index = counter.fetch_add(1, Ordering::SeqCst);
            if index == 1 {
                Box::new(FailsToLoad) as Box<dyn ScriptEngine>
            } else {
                Box::new(PassThroughEngine::default())
            }
        }),
    );

    assert!(matches!(result, Err(RuntimeError::ScriptInit(_))));
}
