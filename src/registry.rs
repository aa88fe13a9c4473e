//! Shared server state, passed by reference to every component.
//!
//! One `ServerContext` is built at startup and holds the processor slots,
//! the camera map and the per-capability result stores. Readers copy values
//! out from under the store locks instead of holding references into shared
//! storage.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::camera::Camera;
use crate::error::ProcessError;
use crate::pool::WorkerPool;
use crate::processor::{Capability, Processor};
use crate::recognizer::{FaceResult, PoseResult};
use std::sync::Arc;

/// Latest result per camera id for one capability.
///
/// `wait_take_all` blocks (condvar, bounded timeout) until *every* requested
/// camera has published since the last take, then drains those entries so the
/// next cycle waits for fresh data again.
pub struct ResultStore<T> {
    inner: Mutex<HashMap<String, T>>,
    cond: Condvar,
}

impl<T: Clone> ResultStore<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            cond: Condvar::new(),
        }
    }

    pub fn publish(&self, camera_id: &str, value: T) {
        let mut map = self.inner.lock().unwrap();
        map.insert(camera_id.to_string(), value);
        self.cond.notify_all();
    }

    /// Copy of the latest result for one camera, if any.
    pub fn latest(&self, camera_id: &str) -> Option<T> {
        self.inner.lock().unwrap().get(camera_id).cloned()
    }

    pub fn wait_take_all(
        &self,
        camera_ids: &[String],
        timeout: Duration,
    ) -> Result<HashMap<String, T>, ProcessError> {
        let deadline = Instant::now() + timeout;
        let mut map = self.inner.lock().unwrap();
        loop {
            if camera_ids.iter().all(|id| map.contains_key(id)) {
                let mut out = HashMap::with_capacity(camera_ids.len());
                for id in camera_ids {
                    if let Some(v) = map.remove(id) {
                        out.insert(id.clone(), v);
                    }
                }
                return Ok(out);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(ProcessError::Timeout);
            }
            let (guard, _) = self.cond.wait_timeout(map, deadline - now).unwrap();
            map = guard;
        }
    }
}

impl<T: Clone> Default for ResultStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Wakes the send loops when some processor turns Pending. Replaces the
/// original tight polling with a condvar and a bounded wait.
pub struct PendingSignal {
    seq: Mutex<u64>,
    cond: Condvar,
}

impl PendingSignal {
    pub fn new() -> Self {
        Self {
            seq: Mutex::new(0),
            cond: Condvar::new(),
        }
    }

    pub fn notify(&self) {
        let mut seq = self.seq.lock().unwrap();
        *seq += 1;
        self.cond.notify_all();
    }

    /// Block until the sequence moves past `seen` or the timeout elapses.
    /// Returns the current sequence either way.
    pub fn wait_for_change(&self, seen: u64, timeout: Duration) -> u64 {
        let deadline = Instant::now() + timeout;
        let mut seq = self.seq.lock().unwrap();
        while *seq == seen {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let (guard, _) = self.cond.wait_timeout(seq, deadline - now).unwrap();
            seq = guard;
        }
        *seq
    }
}

impl Default for PendingSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything the intake, dispatch and send loops share.
pub struct ServerContext {
    pub processors: Vec<Arc<Processor>>,
    pub cameras: BTreeMap<String, Camera>,
    pub face_results: ResultStore<FaceResult>,
    pub pose_results: ResultStore<PoseResult>,
    pub pending: PendingSignal,
    pub pool: WorkerPool,
}

impl ServerContext {
    pub fn new(
        processors: Vec<Arc<Processor>>,
        cameras: BTreeMap<String, Camera>,
        pool: WorkerPool,
    ) -> Self {
        Self {
            processors,
            cameras,
            face_results: ResultStore::new(),
            pose_results: ResultStore::new(),
            pending: PendingSignal::new(),
            pool,
        }
    }

    pub fn has_capability(&self, capability: Capability) -> bool {
        self.processors.iter().any(|p| p.capability() == capability)
    }

    /// Configured camera ids, in stable order.
    pub fn camera_ids(&self) -> Vec<String> {
        self.cameras.keys().cloned().collect()
    }
}
