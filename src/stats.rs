//! Hit/miss accounting exposed through the cache facade (vdsm's
//! `CacheStats` class, lvm.py:187-226).

use std::sync::Mutex;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub hits: u64,
    pub misses: u64,
}

impl StatsSnapshot {
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Default)]
pub struct Stats {
    inner: Mutex<StatsSnapshot>,
}

impl Stats {
    pub fn new() -> Self {
        Stats::default()
    }

    pub fn hit(&self) {
        self.inner.lock().unwrap().hits += 1;
    }

    pub fn miss(&self) {
        self.inner.lock().unwrap().misses += 1;
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        *self.inner.lock().unwrap()
    }

    pub fn clear(&self) {
        *self.inner.lock().unwrap() = StatsSnapshot::default();
    }
}
