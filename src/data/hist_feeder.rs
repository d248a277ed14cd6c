/// Historical replay cursor paging bars out of storage for backtests
use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::data::feeder::{FeedContext, TimeframeState};
use crate::data::kline_feeder::KlineFeeder;
use crate::error::{FeedError, Result};
use crate::events::{BarSink, BarSource};
use crate::types::{ExSymbol, Kline, TimeRange};
use crate::utils::{get_down_tf, MS_MIN_STAMP};

/// Replay page size
pub const DEFAULT_BATCH_SIZE: usize = 3000;

/// Sequential single-direction cursor over one instrument's stored bars.
///
/// Bars are paged `batch_size` at a time inside `time_range` and fed one by
/// one through the live aggregation path.
pub struct DbKlineFeeder {
    feeder: KlineFeeder,
    time_range: TimeRange,
    batch_size: usize,
    caches: Vec<Kline>,
    row_idx: usize,
    /// Start of the bar under the cursor; `i64::MAX` once exhausted
    next_ms: i64,
    /// Start of the next storage page
    offset_ms: i64,
    /// Smallest gap between bars of the current page
    min_gap_ms: i64,
    stop: Option<watch::Receiver<bool>>,
}

impl DbKlineFeeder {
    pub async fn new(
        symbol: ExSymbol,
        ctx: FeedContext,
        sink: Box<dyn BarSink>,
        time_range: TimeRange,
    ) -> Result<Self> {
        let feeder = KlineFeeder::new(symbol, ctx, sink).await?;
        Ok(Self::from_feeder(feeder, time_range))
    }

    pub fn from_feeder(feeder: KlineFeeder, time_range: TimeRange) -> Self {
        DbKlineFeeder {
            feeder,
            time_range,
            batch_size: DEFAULT_BATCH_SIZE,
            caches: Vec::new(),
            row_idx: 0,
            next_ms: 0,
            offset_ms: 0,
            min_gap_ms: 0,
            stop: None,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Abort advancing once `stop` turns true
    pub fn with_stop(mut self, stop: watch::Receiver<bool>) -> Self {
        self.stop = Some(stop);
        self
    }

    pub fn feeder(&self) -> &KlineFeeder {
        &self.feeder
    }

    pub fn feeder_mut(&mut self) -> &mut KlineFeeder {
        &mut self.feeder
    }

    pub fn states(&self) -> &[TimeframeState] {
        self.feeder.states()
    }

    pub fn min_gap_ms(&self) -> i64 {
        self.min_gap_ms
    }

    pub fn is_exhausted(&self) -> bool {
        self.next_ms == i64::MAX
    }

    pub fn sub_tfs<S: AsRef<str>>(&mut self, timeframes: &[S], del_other: bool) -> Result<Vec<String>> {
        self.feeder.sub_tfs(timeframes, del_other)
    }

    pub async fn warm_tfs(&mut self, cur_ms: i64, tf_nums: Option<HashMap<String, usize>>) -> Result<i64> {
        self.feeder.warm_tfs(cur_ms, tf_nums).await
    }

    /// Backfill the whole replay range into storage. Must run before `seek`.
    /// Delisted instruments are skipped.
    pub async fn ensure_downloaded(&self) -> Result<()> {
        let core = self.feeder.core();
        let Some(base) = core.states().first() else {
            return Ok(());
        };
        let symbol = core.symbol().symbol.clone();
        if core.symbol().delist_ms > 0 {
            debug!("Skip download for delisted {}", symbol);
            return Ok(());
        }
        let down_tf = get_down_tf(&base.timeframe)?;
        let ctx = core.ctx.clone();
        let what = format!("download {} {}", symbol, down_tf);
        let range = self.time_range;
        ctx.timed(
            &what,
            ctx.storage.ensure_downloaded(&symbol, down_tf, range.start_ms, range.end_ms),
        )
        .await
    }

    /// Reset the cursor to `since_ms` and load the first page.
    /// `0` would read backwards from the end, so it starts at the earliest stamp instead.
    pub async fn seek(&mut self, since_ms: i64) -> Result<()> {
        let since_ms = if since_ms == 0 { MS_MIN_STAMP } else { since_ms };
        self.caches.clear();
        self.row_idx = 0;
        self.next_ms = 0;
        self.offset_ms = since_ms;
        self.load_page().await
    }

    fn exhaust(&mut self) {
        self.caches.clear();
        self.row_idx = 0;
        self.next_ms = i64::MAX;
    }

    fn current_bar(&self) -> Option<Kline> {
        if self.is_exhausted() {
            return None;
        }
        self.caches.get(self.row_idx).copied()
    }

    async fn next_row(&mut self) -> Result<()> {
        if self.is_exhausted() {
            return Ok(());
        }
        if self.stop.as_ref().is_some_and(|rx| *rx.borrow()) {
            info!("Stop replay of {}", self.feeder.symbol());
            self.exhaust();
            return Err(FeedError::Cancelled(self.feeder.symbol().to_string()));
        }
        if self.row_idx + 1 < self.caches.len() {
            let prev = self.caches[self.row_idx];
            self.row_idx += 1;
            self.next_ms = self.caches[self.row_idx].time;
            self.check_adj_boundary(prev).await;
            return Ok(());
        }
        self.load_page().await
    }

    async fn load_page(&mut self) -> Result<()> {
        let prev = self.current_bar();
        let core = self.feeder.core();
        let Some(base) = core.states().first() else {
            self.exhaust();
            return Err(FeedError::NoTimeframes(self.feeder.symbol().to_string()));
        };
        let timeframe = base.timeframe.clone();
        let tf_ms = base.tf_msecs();
        let end_ms = self.time_range.end_ms;
        if end_ms > 0 && self.next_ms + tf_ms >= end_ms {
            self.exhaust();
            return Ok(());
        }

        let symbol = core.symbol().symbol.clone();
        let ctx = core.ctx.clone();
        let what = format!("load {} {} from {}", symbol, timeframe, self.offset_ms);
        let fetched = ctx
            .timed(
                &what,
                ctx.storage.fetch_bars(&symbol, &timeframe, self.offset_ms, end_ms, self.batch_size),
            )
            .await;
        let bars = match fetched {
            Ok(bars) => bars,
            Err(e) => {
                error!("Load bars for {} failed: {}", symbol, e);
                self.exhaust();
                return Err(e);
            }
        };
        let (Some(first), Some(last)) = (bars.first().copied(), bars.last().copied()) else {
            debug!("No more bars for {} {}", symbol, timeframe);
            self.exhaust();
            return Ok(());
        };

        let min_gap = bars
            .windows(2)
            .map(|w| w[1].time - w[0].time)
            .min()
            .unwrap_or(tf_ms);
        self.min_gap_ms = min_gap.clamp(1, tf_ms);
        self.caches = bars;
        self.row_idx = 0;
        self.next_ms = first.time;
        self.offset_ms = last.time + tf_ms;
        debug!(
            "Loaded {} bars for {} {}, gap {}ms",
            self.caches.len(),
            symbol,
            timeframe,
            self.min_gap_ms
        );

        match prev {
            Some(prev) => self.check_adj_boundary(prev).await,
            None => {
                self.feeder.core.roll_adj(self.next_ms);
            }
        }
        Ok(())
    }

    /// On entering a new adjustment range: close the old one with the last
    /// bar seen under it, re-warm every timeframe, then roll the index
    async fn check_adj_boundary(&mut self, prev: Kline) {
        let Some(adj) = self.feeder.core.adj else {
            return;
        };
        if self.next_ms < adj.stop_ms {
            return;
        }
        let Some(base) = self.feeder.states().first() else {
            return;
        };
        let (timeframe, tf_ms) = (base.timeframe.clone(), base.tf_msecs());
        self.feeder.core.fire_env_end(&timeframe, tf_ms, prev, &adj);
        if let Err(e) = self.feeder.warm_tfs(self.next_ms, None).await {
            error!("Re-warm {} at {} failed: {}", self.feeder.symbol(), self.next_ms, e);
        }
        self.feeder.core.roll_adj(self.next_ms);
    }
}

impl BarSource for DbKlineFeeder {
    fn symbol(&self) -> &str {
        self.feeder.symbol()
    }

    fn next_ms(&self) -> i64 {
        self.next_ms
    }

    fn current(&self) -> Option<Kline> {
        self.current_bar()
    }

    fn run_bar(&mut self, bar: Kline) -> Result<bool> {
        self.feeder.on_new_bars(self.min_gap_ms, &[bar])
    }

    fn advance(&mut self) -> BoxFuture<'_, Result<()>> {
        Box::pin(self.next_row())
    }
}
