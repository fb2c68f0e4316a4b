//! Bounded memoization of window statistics.
//!
//! Entries are keyed by the exact window bounds and the sorted asset list, so a
//! lookup for a different universe or window is always a miss. Storage is a
//! fixed-capacity arena of slots; when full, the least-recently-used slot is
//! overwritten in place. Cached values are the same `Arc` a fresh computation
//! would have produced, so enabling the cache changes latency only.
//!
//! A cache instance must only ever see windows drawn from one [`PriceHistory`].
//!
//! [`PriceHistory`]: crate::data::PriceHistory

use crate::data::ReturnWindow;
use crate::error::{Result, SimulationError};
use crate::stats::{compute_statistics, WindowStatistics};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Exact identity of a statistics window.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub window_start: NaiveDate,
    pub window_end: NaiveDate,
    /// Alphabetically ordered asset identifiers.
    pub symbols: Vec<String>,
}

impl CacheKey {
    /// Key for a materialized window, `None` for an empty window.
    pub fn for_window(window: &ReturnWindow) -> Option<Self> {
        Some(Self {
            window_start: window.start()?,
            window_end: window.end()?,
            symbols: window.symbols().to_vec(),
        })
    }
}

/// Hit/miss counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub entries: usize,
}

#[derive(Debug)]
struct Slot {
    key: CacheKey,
    value: Arc<WindowStatistics>,
    last_used: u64,
}

/// Fixed-capacity LRU cache of [`WindowStatistics`].
#[derive(Debug)]
pub struct StatisticsCache {
    capacity: usize,
    slots: Vec<Slot>,
    index: HashMap<CacheKey, usize>,
    clock: u64,
    stats: CacheStats,
}

impl StatisticsCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            slots: Vec::with_capacity(capacity),
            index: HashMap::with_capacity(capacity),
            clock: 0,
            stats: CacheStats::default(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.slots.len(),
            ..self.stats
        }
    }

    /// Look up an entry, refreshing its recency.
    pub fn get(&mut self, key: &CacheKey) -> Option<Arc<WindowStatistics>> {
        self.clock += 1;
        match self.index.get(key) {
            Some(&slot) => {
                self.slots[slot].last_used = self.clock;
                self.stats.hits += 1;
                Some(Arc::clone(&self.slots[slot].value))
            }
            None => {
                self.stats.misses += 1;
                None
            }
        }
    }

    /// Store an entry, evicting the least-recently-used slot when full.
    pub fn insert(&mut self, key: CacheKey, value: Arc<WindowStatistics>) {
        self.clock += 1;
        if let Some(&slot) = self.index.get(&key) {
            self.slots[slot].value = value;
            self.slots[slot].last_used = self.clock;
            return;
        }

        if self.slots.len() < self.capacity {
            self.index.insert(key.clone(), self.slots.len());
            self.slots.push(Slot {
                key,
                value,
                last_used: self.clock,
            });
            return;
        }

        let victim = self
            .slots
            .iter()
            .enumerate()
            .min_by_key(|(_, s)| s.last_used)
            .map(|(i, _)| i)
            .unwrap_or(0);
        let old = std::mem::replace(
            &mut self.slots[victim],
            Slot {
                key: key.clone(),
                value,
                last_used: self.clock,
            },
        );
        self.index.remove(&old.key);
        self.index.insert(key, victim);
        self.stats.evictions += 1;
        debug!(
            "Evicted statistics for {} assets [{} .. {}]",
            old.key.symbols.len(),
            old.key.window_start,
            old.key.window_end
        );
    }

    /// Return the cached value or compute, store and return it.
    ///
    /// Failed computations are not cached.
    pub fn get_or_compute<F>(&mut self, key: CacheKey, compute: F) -> Result<Arc<WindowStatistics>>
    where
        F: FnOnce() -> Result<WindowStatistics>,
    {
        if let Some(hit) = self.get(&key) {
            return Ok(hit);
        }
        let value = Arc::new(compute()?);
        self.insert(key, Arc::clone(&value));
        Ok(value)
    }

    pub fn clear(&mut self) {
        self.slots.clear();
        self.index.clear();
    }
}

/// Thread-safe handle to one [`StatisticsCache`], cloneable across runs.
#[derive(Debug, Clone)]
pub struct SharedStatisticsCache {
    inner: Arc<Mutex<StatisticsCache>>,
}

impl SharedStatisticsCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(StatisticsCache::new(capacity))),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, StatisticsCache>> {
        self.inner
            .lock()
            .map_err(|_| SimulationError::Data("statistics cache lock poisoned".to_string()))
    }

    pub fn stats(&self) -> Result<CacheStats> {
        Ok(self.lock()?.stats())
    }
}

/// Source of window statistics for the simulation loop.
pub trait StatisticsProvider: Send {
    fn statistics(&mut self, window: &ReturnWindow) -> Result<Arc<WindowStatistics>>;

    fn cache_stats(&self) -> CacheStats;
}

/// Computes every request from scratch.
#[derive(Debug, Default)]
pub struct Uncached {
    computed: u64,
}

impl StatisticsProvider for Uncached {
    fn statistics(&mut self, window: &ReturnWindow) -> Result<Arc<WindowStatistics>> {
        self.computed += 1;
        Ok(Arc::new(compute_statistics(window)?))
    }

    fn cache_stats(&self) -> CacheStats {
        CacheStats {
            misses: self.computed,
            ..Default::default()
        }
    }
}

impl StatisticsProvider for StatisticsCache {
    fn statistics(&mut self, window: &ReturnWindow) -> Result<Arc<WindowStatistics>> {
        match CacheKey::for_window(window) {
            Some(key) => self.get_or_compute(key, || compute_statistics(window)),
            None => Ok(Arc::new(compute_statistics(window)?)),
        }
    }

    fn cache_stats(&self) -> CacheStats {
        self.stats()
    }
}

impl StatisticsProvider for SharedStatisticsCache {
    fn statistics(&mut self, window: &ReturnWindow) -> Result<Arc<WindowStatistics>> {
        let Some(key) = CacheKey::for_window(window) else {
            return Ok(Arc::new(compute_statistics(window)?));
        };
        if let Some(hit) = self.lock()?.get(&key) {
            return Ok(hit);
        }
        // Compute outside the lock; concurrent misses on one key produce equal values.
        let value = Arc::new(compute_statistics(window)?);
        self.lock()?.insert(key, Arc::clone(&value));
        Ok(value)
    }

    fn cache_stats(&self) -> CacheStats {
        self.stats().unwrap_or_default()
    }
}
