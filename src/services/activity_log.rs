use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tracing::info;

use crate::clock::Clock;

pub const CAPACITY: usize = 1000;

/// Bounded in-memory log that operators can read back.
/// Every line is also emitted through `tracing`.
#[derive(Clone)]
pub struct ActivityLog {
    clock: Arc<dyn Clock>,
    entries: Arc<Mutex<VecDeque<String>>>,
}

impl ActivityLog {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            entries: Arc::new(Mutex::new(VecDeque::with_capacity(CAPACITY))),
        }
    }

    pub fn push(&self, msg: impl AsRef<str>) {
        let msg = msg.as_ref();
        info!(target: "canteen::activity", "{msg}");
        let line = format!("[{}] {msg}", self.clock.now().format("%Y-%m-%d %H:%M:%S"));
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if entries.len() == CAPACITY {
            entries.pop_front();
        }
        entries.push_back(line);
    }

    /// Oldest first.
    pub fn snapshot(&self) -> Vec<String> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.iter().cloned().collect()
    }

    pub fn clear(&self) {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}
