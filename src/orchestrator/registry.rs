//! Run bookkeeping and the one-active-run-per-device rule.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use tracing::debug;

use super::run::{RunId, RunState, TestRun};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Finished runs kept queryable before the oldest are forgotten.
pub const DEFAULT_RUN_HISTORY: usize = 256;

/// Runs started by this process, plus the set of devices currently held.
/// Active runs are always kept; at most `history` finished runs are.
#[derive(Debug)]
pub struct RunRegistry {
    runs: RwLock<HashMap<RunId, Arc<TestRun>>>,
    busy: Arc<Mutex<HashSet<String>>>,
    history: usize,
}

impl Default for RunRegistry {
    fn default() -> Self {
        Self::with_history(DEFAULT_RUN_HISTORY)
    }
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_history(history: usize) -> Self {
        Self {
            runs: RwLock::new(HashMap::new()),
            busy: Arc::new(Mutex::new(HashSet::new())),
            history,
        }
    }

    /// Reserve `device` for a new run. Returns `None` while another run holds it.
    pub fn reserve(&self, device: &str) -> Option<DeviceLease> {
        let mut busy = lock(&self.busy);
        if !busy.insert(device.to_string()) {
            return None;
        }
        debug!(device = %device, "device reserved");
        Some(DeviceLease {
            device: device.to_string(),
            busy: Arc::clone(&self.busy),
            released: false,
        })
    }

    pub fn is_busy(&self, device: &str) -> bool {
        lock(&self.busy).contains(device)
    }

    /// Track `run`, forgetting the oldest finished runs beyond the history.
    pub fn insert(&self, run: Arc<TestRun>) {
        let mut runs = self.runs.write().unwrap_or_else(|p| p.into_inner());
        runs.insert(run.id(), run);

        let mut finished: Vec<_> = runs
            .values()
            .filter(|r| r.state().is_terminal())
            .map(|r| (r.started_at(), r.id()))
            .collect();
        if finished.len() <= self.history {
            return;
        }
        finished.sort();
        let excess = finished.len() - self.history;
        for (_, id) in finished.into_iter().take(excess) {
            runs.remove(&id);
            debug!(run = %id, "finished run evicted from history");
        }
    }

    pub fn get(&self, id: RunId) -> Option<Arc<TestRun>> {
        self.runs
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(&id)
            .cloned()
    }

    /// Every run, oldest first.
    pub fn all(&self) -> Vec<Arc<TestRun>> {
        let mut runs: Vec<_> = self
            .runs
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .cloned()
            .collect();
        runs.sort_by_key(|r| r.started_at());
        runs
    }

    /// Runs not yet in a terminal state.
    pub fn active(&self) -> Vec<Arc<TestRun>> {
        self.all().into_iter().filter(|r| !r.state().is_terminal()).collect()
    }
}

/// Exclusive hold on one device. Released on drop.
#[derive(Debug)]
pub struct DeviceLease {
    device: String,
    busy: Arc<Mutex<HashSet<String>>>,
    released: bool,
}

impl DeviceLease {
    /// Put `run` in its terminal state and release the device in one step,
    /// so nobody can observe the run terminal while the device is still held.
    pub fn finish(mut self, run: &TestRun, terminal: RunState) {
        let mut busy = lock(&self.busy);
        run.finish(terminal);
        busy.remove(&self.device);
        self.released = true;
        debug!(device = %self.device, "device released");
    }
}

impl Drop for DeviceLease {
    fn drop(&mut self) {
        if !self.released {
            lock(&self.busy).remove(&self.device);
            debug!(device = %self.device, "device released");
        }
    }
}
