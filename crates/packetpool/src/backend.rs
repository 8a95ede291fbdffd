//! The packet-capture backend (§6.1): out-of-scope as a concept (a raw
//! socket, a netlink queue, a DPDK ring are all real implementations), but a
//! bundled in-memory [`OfflineCapture`] backend is provided so the runtime
//! is independently testable and so the CLI has a default without external
//! dependencies.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::RuntimeError;
use crate::types::Verdict;

/// A packet handed from a capture backend to the runtime and back. Fixed and
/// concrete (not an associated type) so a [`crate::engine::ScriptEngine`] can
/// be implemented once against any backend, without itself becoming generic.
#[derive(Debug, Clone)]
pub struct Packet {
    pub id: u64,
    pub data: Vec<u8>,
    pub dissector: &'static str,
}

impl Packet {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn make_modifiable(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn resize(&mut self, size: usize) {
        self.data.resize(size, 0);
    }
}

/// Capability set a packet-capture backend must expose to the worker pool.
/// `State` is the per-worker capture handle.
pub trait PacketBackend: Send + Sync {
    type State: Send;

    /// Whether the backend can serve independent per-worker states. If
    /// `false`, [`crate::pool::WorkerPool::create`] must be called with
    /// `count == 1`.
    fn multi_threaded(&self) -> bool;

    /// Creates the per-worker capture handle bound to `thread_id`.
    fn init_state(&self, thread_id: usize) -> Result<Self::State, RuntimeError>;

    /// Tears down a capture handle created by `init_state`.
    fn cleanup_state(&self, state: Self::State);

    /// Lightweight post-attach hook, called once the worker's OS thread (or,
    /// in single mode, the controller thread) is ready to receive. Most
    /// backends have nothing to do here.
    fn init(&self, _state: &mut Self::State) {}

    /// Blocks until a packet is available, the backend is forced to return
    /// by the runtime's interrupt mechanism (§6.3), or the stream ends.
    /// `Ok(None)` means end-of-stream/fatal capture error, not "no packet
    /// yet" — the runtime treats both identically (§4.3).
    fn receive(&self, state: &mut Self::State) -> Result<Option<Packet>, RuntimeError>;

    /// Reports the verdict for a packet previously returned by `receive`.
    fn verdict(&self, pkt: Packet, result: Verdict);
}

struct OfflineStream {
    packets: Vec<Packet>,
    cursor: AtomicUsize,
}

/// Per-worker capture handle for [`OfflineCapture`]: an independent cursor
/// into a shared, read-only, already-partitioned packet list.
pub struct OfflineCaptureState {
    stream: Arc<OfflineStream>,
}

/// An in-memory, replay-once packet source: every worker gets its own cursor
/// over a shared packet list, partitioned round-robin by worker id so each
/// worker sees a disjoint, capture-ordered subset (mirrors how a real
/// multi-queue NIC driver would hand packets to worker threads).
pub struct OfflineCapture {
    packets: Vec<(u64, Vec<u8>)>,
    worker_count: usize,
    dissector: &'static str,
    drops: Mutex<Vec<u64>>,
    accepts: Mutex<Vec<u64>>,
}

impl OfflineCapture {
    /// Builds a backend that will partition `packets` round-robin across
    /// `worker_count` workers by packet index modulo worker id.
    pub fn new(packets: Vec<(u64, Vec<u8>)>, worker_count: usize, dissector: &'static str) -> Self {
        OfflineCapture {
            packets,
            worker_count: worker_count.max(1),
            dissector,
            drops: Mutex::new(Vec::new()),
            accepts: Mutex::new(Vec::new()),
        }
    }

    /// Ids verdicted `Drop` so far, in report order. Test/CLI convenience.
    pub fn drops(&self) -> Vec<u64> {
        self.drops.lock().expect("drops mutex poisoned").clone()
    }

    /// Ids verdicted `Accept` so far, in report order. Test/CLI convenience.
    pub fn accepts(&self) -> Vec<u64> {
        self.accepts.lock().expect("accepts mutex poisoned").clone()
    }
}

impl PacketBackend for OfflineCapture {
    type State = OfflineCaptureState;

    fn multi_threaded(&self) -> bool {
        true
    }

    fn init_state(&self, thread_id: usize) -> Result<Self::State, RuntimeError> {
        let mine = self
            .packets
            .iter()
            .enumerate()
            .filter(|(i, _)| i % self.worker_count == thread_id)
            .map(|(_, (id, data))| Packet {
                id: *id,
                data: data.clone(),
                dissector: self.dissector,
            })
            .collect();

        Ok(OfflineCaptureState {
            stream: Arc::new(OfflineStream {
                packets: mine,
                cursor: AtomicUsize::new(0),
            }),
        })
    }

    fn cleanup_state(&self, _state: Self::State) {}

    fn receive(&self, state: &mut Self::State) -> Result<Option<Packet>, RuntimeError> {
        let idx = state.stream.cursor.fetch_add(1, Ordering::SeqCst);
        Ok(state.stream.packets.get(idx).cloned())
    }

    fn verdict(&self, pkt: Packet, result: Verdict) {
        match result {
            Verdict::Accept => self.accepts.lock().expect("accepts mutex poisoned").push(pkt.id),
            Verdict::Drop => self.drops.lock().expect("drops mutex poisoned").push(pkt.id),
        }
    }
}

/// A backend with `multi_threaded() == false`, used to exercise the
/// constraint in §6.1 that such a backend forces single-worker mode.
pub struct SingleThreadedCapture {
    inner: Mutex<Vec<Packet>>,
    exhausted: AtomicBool,
}

impl SingleThreadedCapture {
    pub fn new(packets: Vec<(u64, Vec<u8>)>, dissector: &'static str) -> Self {
        let mut queue: Vec<Packet> = packets
            .into_iter()
            .map(|(id, data)| Packet { id, data, dissector })
            .collect();
        queue.reverse();
        SingleThreadedCapture {
            inner: Mutex::new(queue),
            exhausted: AtomicBool::new(false),
        }
    }
}

impl PacketBackend for SingleThreadedCapture {
    type State = ();

    fn multi_threaded(&self) -> bool {
        false
    }

    fn init_state(&self, _thread_id: usize) -> Result<Self::State, RuntimeError> {
        Ok(())
    }

    fn cleanup_state(&self, _state: Self::State) {}

    fn receive(&self, _state: &mut Self::State) -> Result<Option<Packet>, RuntimeError> {
        if self.exhausted.load(Ordering::SeqCst) {
            return Ok(None);
        }
        let next = self.inner.lock().expect("capture mutex poisoned").pop();
        if next.is_none() {
            self.exhausted.store(true, Ordering::SeqCst);
        }
        Ok(next)
    }

    fn verdict(&self, _pkt: Packet, _result: Verdict) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offline_capture_partitions_round_robin() {
        let packets = (1..=6u64).map(|id| (id, vec![])).collect();
        let backend = OfflineCapture::new(packets, 2, "raw");

        let mut worker0 = backend.init_state(0).unwrap();
        let mut worker1 = backend.init_state(1).unwrap();

        let mut ids0 = Vec::new();
        while let Some(pkt) = backend.receive(&mut worker0).unwrap() {
            ids0.push(pkt.id);
        }
        let mut ids1 = Vec::new();
        while let Some(pkt) = backend.receive(&mut worker1).unwrap() {
            ids1.push(pkt.id);
        }

        assert_eq!(ids0, vec![1, 3, 5]);
        assert_eq!(ids1, vec![2, 4, 6]);
    }

    #[test]
    fn offline_capture_eof_returns_none() {
        let backend = OfflineCapture::new(vec![(1, vec![])], 1, "raw");
        let mut state = backend.init_state(0).unwrap();
        assert!(backend.receive(&mut state).unwrap().is_some());
        assert!(backend.receive(&mut state).unwrap().is_none());
    }

    #[test]
    fn offline_capture_records_verdicts_by_id() {
        let backend = OfflineCapture::new(vec![(1, vec![]), (2, vec![])], 1, "raw");
        backend.verdict(Packet { id: 1, data: vec![], dissector: "raw" }, Verdict::Accept);
        backend.verdict(Packet { id: 2, data: vec![], dissector: "raw" }, Verdict::Drop);
        assert_eq!(backend.accepts(), vec![1]);
        assert_eq!(backend.drops(), vec![2]);
    }

    #[test]
    fn single_threaded_capture_reports_not_multi_threaded() {
        let backend = SingleThreadedCapture::new(vec![], "raw");
        assert!(!backend.multi_threaded());
    }

    #[test]
    fn single_threaded_capture_drains_in_fifo_order() {
        let backend = SingleThreadedCapture::new(vec![(1, vec![]), (2, vec![])], "raw");
        let mut state = backend.init_state(0).unwrap();
        assert_eq!(backend.receive(&mut state).unwrap().unwrap().id, 1);
        assert_eq!(backend.receive(&mut state).unwrap().unwrap().id, 2);
        assert!(backend.receive(&mut state).unwrap().is_none());
    }
}
