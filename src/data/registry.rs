/// Run-scoped shared state: the clock and per-timeframe bar counters.
/// One registry per backtest or live run.
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::time::VirtualClock;
use crate::types::RunMode;

#[derive(Debug)]
pub struct FeedRegistry {
    clock: VirtualClock,
    /// timeframe -> symbol -> bars received
    tf_pair_hits: Mutex<HashMap<String, HashMap<String, usize>>>,
}

impl FeedRegistry {
    pub fn new(clock: VirtualClock) -> Arc<Self> {
        Arc::new(FeedRegistry {
            clock,
            tf_pair_hits: Mutex::new(HashMap::new()),
        })
    }

    pub fn for_mode(mode: RunMode, start_ms: i64) -> Arc<Self> {
        match mode {
            RunMode::Backtest => Self::new(VirtualClock::backtest(start_ms)),
            RunMode::Live => Self::new(VirtualClock::live()),
        }
    }

    pub fn clock(&self) -> &VirtualClock {
        &self.clock
    }

    fn hits_map(&self) -> MutexGuard<'_, HashMap<String, HashMap<String, usize>>> {
        // counters are advisory; a poisoned lock still holds usable data
        self.tf_pair_hits.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add_hits(&self, timeframe: &str, symbol: &str, num: usize) {
        let mut hits = self.hits_map();
        *hits
            .entry(timeframe.to_string())
            .or_default()
            .entry(symbol.to_string())
            .or_insert(0) += num;
    }

    pub fn hits(&self, timeframe: &str, symbol: &str) -> usize {
        self.hits_map()
            .get(timeframe)
            .and_then(|m| m.get(symbol))
            .copied()
            .unwrap_or(0)
    }

    /// Read and reset the counters for one timeframe
    pub fn take_hits(&self, timeframe: &str) -> HashMap<String, usize> {
        self.hits_map().remove(timeframe).unwrap_or_default()
    }
}
