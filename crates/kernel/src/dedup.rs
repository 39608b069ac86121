//! TTL-bounded dedup sets.
//!
//! Used for `processing_messages` (a retried ingress inside the window is
//! dropped) and `delegated_messages` (a second `delegate` for the same
//! message spawns no worker). Entries expire after the window; a
//! background sweeper bounds memory instead of per-entry timers.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

pub struct DedupSet {
    seen: Mutex<HashMap<String, Instant>>,
    ttl: Duration,
}

impl DedupSet {
    pub fn new(ttl: Duration) -> Self {
        Self {
            seen: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Atomic check-then-insert. Returns `true` when the id was absent (or
    /// expired) and has now been recorded; `false` for a live duplicate.
    pub fn insert_if_absent(&self, id: &str) -> bool {
        let mut seen = self.seen.lock();
        let now = Instant::now();
        if let Some(at) = seen.get(id) {
            if now.duration_since(*at) < self.ttl {
                return false;
            }
        }
        seen.insert(id.to_string(), now);
        true
    }

    pub fn contains(&self, id: &str) -> bool {
        let seen = self.seen.lock();
        match seen.get(id) {
            Some(at) => at.elapsed() < self.ttl,
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.seen.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.lock().is_empty()
    }

    /// Drop expired entries.
    pub fn sweep(&self) {
        let mut seen = self.seen.lock();
        let ttl = self.ttl;
        seen.retain(|_, at| at.elapsed() < ttl);
    }

    /// Spawn a ticker that sweeps expired entries. The task runs for the
    /// process lifetime; hosts may abort the handle on shutdown.
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) -> tokio::task::JoinHandle<()> {
        let set = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                set.sweep();
            }
        })
    }
}
