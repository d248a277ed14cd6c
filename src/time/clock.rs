/// Run clock: wall time when live, bar-driven virtual time in backtests
use std::sync::atomic::{AtomicI64, Ordering};

use chrono::Utc;

use crate::types::RunMode;

#[derive(Debug)]
pub struct VirtualClock {
    mode: RunMode,
    cur_ms: AtomicI64,
}

impl VirtualClock {
    pub fn new(mode: RunMode) -> Self {
        VirtualClock {
            mode,
            cur_ms: AtomicI64::new(0),
        }
    }

    pub fn backtest(start_ms: i64) -> Self {
        VirtualClock {
            mode: RunMode::Backtest,
            cur_ms: AtomicI64::new(start_ms),
        }
    }

    pub fn live() -> Self {
        Self::new(RunMode::Live)
    }

    pub fn mode(&self) -> RunMode {
        self.mode
    }

    pub fn is_live(&self) -> bool {
        self.mode == RunMode::Live
    }

    pub fn now_ms(&self) -> i64 {
        match self.mode {
            RunMode::Live => Utc::now().timestamp_millis(),
            RunMode::Backtest => self.cur_ms.load(Ordering::Acquire),
        }
    }

    /// Move the virtual clock forward to `time_ms`.
    /// Never moves backwards; a no-op in live mode.
    pub fn advance_to(&self, time_ms: i64) -> bool {
        if self.is_live() {
            return false;
        }
        self.cur_ms.fetch_max(time_ms, Ordering::AcqRel) < time_ms
    }
}
