/// Per-instrument feeder core: timeframe states, raw bar cache, adjustment
/// tracking and callback delivery
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::data::adjust::{apply_adj, apply_opt, validate_adjs};
use crate::data::bar_store::BarStorage;
use crate::data::registry::FeedRegistry;
use crate::error::{FeedError, Result};
use crate::events::BarSink;
use crate::market::MarketMeta;
use crate::types::{AdjInfo, ExSymbol, FeedConfig, InfoKline, Kline, PairTfKline};
use crate::utils::{gcd_ints, secs_to_tf, tf_to_secs};

/// Tracking state of one subscribed timeframe
#[derive(Debug, Clone, PartialEq)]
pub struct TimeframeState {
    pub timeframe: String,
    pub tf_secs: i64,
    /// Expected start of the next bar
    pub next_ms: i64,
    /// Bar still accumulating; `None` once it closed
    pub wait_bar: Option<Kline>,
    /// Most recent bar seen, open or closed
    pub latest: Option<Kline>,
    pub align_off_ms: i64,
}

impl TimeframeState {
    pub fn new(timeframe: &str, tf_secs: i64, align_off_ms: i64) -> Self {
        TimeframeState {
            timeframe: timeframe.to_string(),
            tf_secs,
            next_ms: 0,
            wait_bar: None,
            latest: None,
            align_off_ms,
        }
    }

    pub fn tf_msecs(&self) -> i64 {
        self.tf_secs * 1000
    }
}

/// Collaborators and settings shared by every feeder of one run
#[derive(Clone)]
pub struct FeedContext {
    pub registry: Arc<FeedRegistry>,
    pub meta: Arc<dyn MarketMeta>,
    pub storage: Arc<dyn BarStorage>,
    pub pre_fire: f64,
    pub num_ta_cache: usize,
    pub show_log: bool,
    pub io_timeout: Duration,
}

impl FeedContext {
    pub fn new(
        registry: Arc<FeedRegistry>,
        meta: Arc<dyn MarketMeta>,
        storage: Arc<dyn BarStorage>,
    ) -> Self {
        let defaults = FeedConfig::default();
        FeedContext {
            registry,
            meta,
            storage,
            pre_fire: defaults.pre_fire,
            num_ta_cache: defaults.num_ta_cache,
            show_log: defaults.show_log,
            io_timeout: Duration::from_secs(defaults.io_timeout_secs),
        }
    }

    pub fn from_config(
        config: &FeedConfig,
        registry: Arc<FeedRegistry>,
        meta: Arc<dyn MarketMeta>,
        storage: Arc<dyn BarStorage>,
    ) -> Self {
        FeedContext {
            pre_fire: config.pre_fire,
            num_ta_cache: config.num_ta_cache,
            show_log: config.show_log,
            io_timeout: Duration::from_secs(config.io_timeout_secs),
            ..Self::new(registry, meta, storage)
        }
    }

    /// Run a storage call under the configured deadline
    pub(crate) async fn timed<T, F>(&self, what: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match tokio::time::timeout(self.io_timeout, fut).await {
            Ok(res) => res,
            Err(_) => Err(FeedError::StorageTimeout(format!(
                "{} after {:?}",
                what, self.io_timeout
            ))),
        }
    }
}

/// One instrument, any number of timeframes.
/// Not `Sync`: callers serialize access per instrument.
pub struct Feeder {
    pub(crate) symbol: ExSymbol,
    pub(crate) states: Vec<TimeframeState>,
    /// Raw (unadjusted) finished bars per timeframe
    tf_bars: HashMap<String, Vec<Kline>>,
    pub(crate) adjs: Vec<AdjInfo>,
    adj_idx: usize,
    pub(crate) adj: Option<AdjInfo>,
    pub(crate) is_warm_up: bool,
    pub(crate) sink: Box<dyn BarSink>,
    pub(crate) ctx: FeedContext,
}

impl Feeder {
    pub fn new(
        symbol: ExSymbol,
        ctx: FeedContext,
        sink: Box<dyn BarSink>,
        adjs: Vec<AdjInfo>,
    ) -> Result<Self> {
        validate_adjs(&adjs)?;
        Ok(Feeder {
            symbol,
            states: Vec::new(),
            tf_bars: HashMap::new(),
            adjs,
            adj_idx: 0,
            adj: None,
            is_warm_up: false,
            sink,
            ctx,
        })
    }

    pub fn symbol(&self) -> &ExSymbol {
        &self.symbol
    }

    /// Tracked states, finest (the base) first
    pub fn states(&self) -> &[TimeframeState] {
        &self.states
    }

    pub fn timeframes(&self) -> Vec<String> {
        self.states.iter().map(|s| s.timeframe.clone()).collect()
    }

    pub fn adj(&self) -> Option<&AdjInfo> {
        self.adj.as_ref()
    }

    pub fn is_warm_up(&self) -> bool {
        self.is_warm_up
    }

    pub fn cached_bars(&self, timeframe: &str) -> usize {
        self.tf_bars.get(timeframe).map_or(0, |b| b.len())
    }

    fn align_off_ms(&self, tf_secs: i64) -> Result<i64> {
        let off = self
            .ctx
            .meta
            .align_off_secs(&self.symbol.exchange, &self.symbol.market, tf_secs)?;
        Ok(off * 1000)
    }

    /// Subscribe to `timeframes`, returning the ones newly added.
    ///
    /// With `del_other`, states not named are removed; the smallest one
    /// survives as the base when nothing of equal size replaces it. The base
    /// is always the GCD of every tracked interval and comes first.
    ///
    /// A malformed timeframe is an error. Unresolvable exchange metadata is
    /// logged and leaves the subscription unchanged.
    pub fn sub_tfs<S: AsRef<str>>(&mut self, timeframes: &[S], del_other: bool) -> Result<Vec<String>> {
        let wanted: Vec<(String, i64)> = timeframes
            .iter()
            .map(|tf| tf_to_secs(tf.as_ref()).map(|secs| (tf.as_ref().to_string(), secs)))
            .collect::<Result<_>>()?;

        let mut old_tfs: HashSet<String> = self.states.iter().map(|s| s.timeframe.clone()).collect();
        let mut state_map: HashMap<String, TimeframeState> = self
            .states
            .iter()
            .map(|s| (s.timeframe.clone(), s.clone()))
            .collect();
        let mut min_secs = self.states.iter().map(|s| s.tf_secs).min().unwrap_or(0);

        let mut adds = Vec::with_capacity(wanted.len());
        for (tf, secs) in wanted {
            if old_tfs.remove(&tf) || state_map.contains_key(&tf) {
                continue;
            }
            let off_ms = match self.align_off_ms(secs) {
                Ok(off) => off,
                Err(e) => {
                    warn!(
                        "Skip subscribe {} {}: exchange {} unresolved: {}",
                        self.symbol.symbol, tf, self.symbol.exchange, e
                    );
                    return Ok(Vec::new());
                }
            };
            state_map.insert(tf.clone(), TimeframeState::new(&tf, secs, off_ms));
            if min_secs == 0 || secs < min_secs {
                min_secs = secs;
            }
            adds.push(tf);
        }

        let mut min_del: Option<TimeframeState> = None;
        if del_other {
            for tf in &old_tfs {
                if let Some(sta) = state_map.remove(tf) {
                    if sta.tf_secs == min_secs {
                        min_del = Some(sta);
                    }
                }
            }
        }

        let mut new_states: Vec<TimeframeState> = state_map.into_values().collect();
        new_states.sort_by(|a, b| a.tf_secs.cmp(&b.tf_secs).then_with(|| a.timeframe.cmp(&b.timeframe)));

        // the removed base keeps its accumulated state while it still divides everything
        if let Some(base) = min_del.take() {
            let secs: Vec<i64> = new_states.iter().map(|s| s.tf_secs).collect();
            let replaced = secs.contains(&base.tf_secs);
            if !replaced && gcd_ints(&secs) % base.tf_secs == 0 {
                debug!("Keep base {} for {}", base.timeframe, self.symbol.symbol);
                new_states.insert(0, base);
            } else {
                min_del = Some(base);
            }
        }

        if !new_states.is_empty() {
            let secs: Vec<i64> = new_states.iter().map(|s| s.tf_secs).collect();
            let gcd_secs = gcd_ints(&secs);
            if gcd_secs != new_states[0].tf_secs {
                let base = match min_del {
                    Some(sta) if sta.tf_secs == gcd_secs => sta,
                    _ => {
                        let off_ms = match self.align_off_ms(gcd_secs) {
                            Ok(off) => off,
                            Err(e) => {
                                warn!(
                                    "Skip subscribe for {}: exchange {} unresolved: {}",
                                    self.symbol.symbol, self.symbol.exchange, e
                                );
                                return Ok(Vec::new());
                            }
                        };
                        TimeframeState::new(&secs_to_tf(gcd_secs), gcd_secs, off_ms)
                    }
                };
                debug!("Base timeframe {} for {}", base.timeframe, self.symbol.symbol);
                new_states.insert(0, base);
            }
        }

        self.states = new_states;
        Ok(adds)
    }

    /// Record `bars` for the state at `idx` and deliver the finished ones.
    /// `bars` comes from the aggregator; only its last bar may be open
    /// (`last_ok == false`). Returns the finished bars, raw.
    pub(crate) fn on_state_ohlcvs(&mut self, idx: usize, bars: Vec<Kline>, last_ok: bool) -> Vec<Kline> {
        let Some(&last) = bars.last() else {
            return Vec::new();
        };
        let state = &mut self.states[idx];
        let mut finished: Vec<Kline> = if last_ok {
            bars.clone()
        } else {
            bars[..bars.len() - 1].to_vec()
        };
        if let Some(wait) = state.wait_bar {
            if wait.time < bars[0].time {
                finished.insert(0, wait);
            }
        }
        // already delivered, either early-fired or by a warm-up
        let next_ms = state.next_ms;
        finished.retain(|b| b.time >= next_ms);

        state.latest = Some(last);
        state.wait_bar = if last_ok { None } else { Some(last) };

        let tf_ms = state.tf_msecs();
        let timeframe = state.timeframe.clone();
        if let Some(done) = finished.last() {
            state.next_ms = done.time + tf_ms;
            self.add_tf_klines(&timeframe, &finished);
            let adj = self.adj;
            let adjusted = apply_opt(adj.as_ref(), &finished);
            self.fire_callbacks(&timeframe, tf_ms, &adjusted, adj);
        }
        finished
    }

    /// Deliver `bars` (already adjusted) to the sink
    pub(crate) fn fire_callbacks(&mut self, timeframe: &str, tf_ms: i64, bars: &[Kline], adj: Option<AdjInfo>) {
        let registry = Arc::clone(&self.ctx.registry);
        let clock = registry.clock();
        let is_live = clock.is_live();
        for bar in bars {
            if !is_live && !self.is_warm_up {
                clock.advance_to(bar.time + tf_ms);
            }
            self.sink.on_bar(InfoKline {
                bar: PairTfKline {
                    symbol: self.symbol.symbol.clone(),
                    timeframe: timeframe.to_string(),
                    tf_msecs: tf_ms,
                    kline: *bar,
                },
                adj,
                is_warm_up: self.is_warm_up,
            });
        }
        if !is_live || self.is_warm_up {
            return;
        }
        let Some(last) = bars.last() else {
            return;
        };
        registry.add_hits(timeframe, &self.symbol.symbol, bars.len());
        let delay = clock.now_ms() - (last.time + tf_ms);
        if delay > tf_ms && tf_ms >= 60_000 {
            warn!(
                "{}/{} bar too late, delay {} bars, {}",
                self.symbol.symbol,
                timeframe,
                delay / tf_ms,
                last.time
            );
        }
    }

    /// Append raw finished bars to the cache, trimming it once it doubles
    pub(crate) fn add_tf_klines(&mut self, timeframe: &str, bars: &[Kline]) {
        let cap = self.ctx.num_ta_cache;
        let olds = self.tf_bars.entry(timeframe.to_string()).or_default();
        if olds.len() > cap * 2 {
            let keep = cap * 3 / 2;
            olds.drain(..olds.len() - keep);
        }
        olds.extend_from_slice(bars);
    }

    /// The last `limit` adjusted bars of `timeframe` before `end_ms`, from
    /// the cache when it holds any, otherwise from storage
    pub async fn get_tf_klines(&mut self, timeframe: &str, end_ms: i64, limit: usize) -> Result<Vec<Kline>> {
        if let Some(bars) = self.tf_bars.get(timeframe).filter(|b| !b.is_empty()) {
            return Ok(apply_adj(&self.adjs, bars, end_ms, limit));
        }
        let storage = Arc::clone(&self.ctx.storage);
        let what = format!("fetch {} {}", self.symbol.symbol, timeframe);
        let bars = self
            .ctx
            .timed(&what, storage.fetch_bars(&self.symbol.symbol, timeframe, 0, end_ms, limit))
            .await?;
        let adjusted = apply_adj(&self.adjs, &bars, 0, 0);
        self.tf_bars.insert(timeframe.to_string(), bars);
        Ok(adjusted)
    }

    /// Move the adjustment index forward to the range containing `time_ms`.
    /// Returns whether the active range changed.
    pub(crate) fn roll_adj(&mut self, time_ms: i64) -> bool {
        let old = self.adj;
        while self.adj_idx < self.adjs.len() && time_ms >= self.adjs[self.adj_idx].stop_ms {
            self.adj_idx += 1;
        }
        self.adj = self.adjs.get(self.adj_idx).copied();
        self.adj != old
    }

    /// Tell the sink the active range ended, `last` being the final bar seen under it
    pub(crate) fn fire_env_end(&mut self, timeframe: &str, tf_ms: i64, last: Kline, adj: &AdjInfo) {
        let bar = PairTfKline {
            symbol: self.symbol.symbol.clone(),
            timeframe: timeframe.to_string(),
            tf_msecs: tf_ms,
            kline: last,
        };
        debug!(
            "Adjustment range {}-{} of {} ended at {}",
            adj.start_ms, adj.stop_ms, bar.symbol, last.time
        );
        self.sink.on_env_end(&bar, adj);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::bar_store::MemoryBarStore;
    use crate::events::{ChannelSink, FeedEvent};
    use crate::market::StaticMarketMeta;
    use crate::types::{ExchangeConfig, RunMode};
    use tokio::sync::mpsc::UnboundedReceiver;

    const MIN: i64 = 60_000;

    fn context(mode: RunMode, storage: Arc<MemoryBarStore>) -> FeedContext {
        let meta = StaticMarketMeta::new(&[ExchangeConfig {
            id: "binance".to_string(),
            week_align_off_days: 4,
        }]);
        FeedContext::new(FeedRegistry::for_mode(mode, 0), Arc::new(meta), storage)
    }

    fn feeder(exchange: &str) -> (Feeder, UnboundedReceiver<FeedEvent>) {
        let (sink, rx) = ChannelSink::channel();
        let ctx = context(RunMode::Backtest, Arc::new(MemoryBarStore::new()));
        let symbol = ExSymbol::new(exchange, "spot", "BTC/USDT");
        (Feeder::new(symbol, ctx, Box::new(sink), Vec::new()).unwrap(), rx)
    }

    fn bars_of(rx: &mut UnboundedReceiver<FeedEvent>) -> Vec<InfoKline> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let FeedEvent::Bar(bar) = event {
                out.push(bar);
            }
        }
        out
    }

    #[test]
    fn test_sub_tfs_synthesizes_and_keeps_base() {
        let (mut feeder, _rx) = feeder("binance");

        let adds = feeder.sub_tfs(&["5m", "15m"], false).unwrap();
        assert_eq!(adds, vec!["5m", "15m"]);
        assert_eq!(feeder.timeframes(), vec!["5m", "15m"]);

        // base state survives the drop
        feeder.states[0].next_ms = 42;
        let adds = feeder.sub_tfs(&["15m"], true).unwrap();
        assert!(adds.is_empty());
        assert_eq!(feeder.timeframes(), vec!["5m", "15m"]);
        assert_eq!(feeder.states[0].next_ms, 42);

        let adds = feeder.sub_tfs(&["1h", "15m"], true).unwrap();
        assert_eq!(adds, vec!["1h"]);
        assert_eq!(feeder.timeframes(), vec!["5m", "15m", "1h"]);
    }

    #[test]
    fn test_sub_tfs_gcd_base() {
        let (mut feeder, _rx) = feeder("binance");
        let adds = feeder.sub_tfs(&["15m", "10m"], false).unwrap();
        assert_eq!(adds, vec!["15m", "10m"]);
        assert_eq!(feeder.timeframes(), vec!["5m", "10m", "15m"]);

        let (mut feeder, _rx) = self::feeder("binance");
        feeder.sub_tfs(&["1w"], false).unwrap();
        assert_eq!(feeder.states[0].align_off_ms, 4 * 86_400_000);
    }

    #[test]
    fn test_sub_tfs_errors() {
        let (mut feeder, _rx) = feeder("nowhere");
        // unresolved exchange: nothing subscribed, no error
        assert!(feeder.sub_tfs(&["5m"], false).unwrap().is_empty());
        assert!(feeder.states().is_empty());

        let err = feeder.sub_tfs(&["5x"], false).unwrap_err();
        assert!(err.is_structural());
    }

    #[test]
    fn test_on_state_ohlcvs_delivers_finished_only() {
        let (mut feeder, mut rx) = feeder("binance");
        feeder.sub_tfs(&["5m"], false).unwrap();

        let open = Kline::new(5 * MIN, 2.0, 3.0, 1.0, 2.5, 4.0);
        let done = Kline::new(0, 1.0, 2.0, 0.5, 1.5, 10.0);
        let finished = feeder.on_state_ohlcvs(0, vec![done, open], false);
        assert_eq!(finished, vec![done]);
        assert_eq!(feeder.states[0].wait_bar, Some(open));
        assert_eq!(feeder.states[0].next_ms, 5 * MIN);
        assert_eq!(feeder.cached_bars("5m"), 1);

        let got = bars_of(&mut rx);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].bar.kline, done);
        assert_eq!(got[0].bar.end_ms(), 5 * MIN);
        assert!(!got[0].is_warm_up);
        assert_eq!(feeder.ctx.registry.clock().now_ms(), 5 * MIN);

        // re-delivery of an already finished bar is dropped
        assert!(feeder.on_state_ohlcvs(0, vec![done], true).is_empty());
        assert!(bars_of(&mut rx).is_empty());
    }

    #[test]
    fn test_adjusted_delivery_and_raw_cache() {
        let (sink, mut rx) = ChannelSink::channel();
        let adjs = vec![AdjInfo { start_ms: 0, stop_ms: i64::MAX, factor: 0.5 }];
        let ctx = context(RunMode::Backtest, Arc::new(MemoryBarStore::new()));
        let mut feeder =
            Feeder::new(ExSymbol::new("binance", "spot", "AAPL"), ctx, Box::new(sink), adjs).unwrap();
        feeder.sub_tfs(&["1m"], false).unwrap();
        assert!(feeder.roll_adj(0));

        let bar = Kline::new(0, 10.0, 12.0, 8.0, 11.0, 7.0);
        feeder.on_state_ohlcvs(0, vec![bar], true);
        let got = bars_of(&mut rx);
        assert_eq!(got[0].bar.kline.close, 5.5);
        assert_eq!(got[0].bar.kline.volume, 7.0);
        assert_eq!(got[0].adj.map(|a| a.factor), Some(0.5));
        assert_eq!(feeder.tf_bars["1m"][0].close, 11.0);
    }

    #[test]
    fn test_cache_is_bounded() {
        let (mut feeder, _rx) = feeder("binance");
        feeder.ctx.num_ta_cache = 10;
        for i in 0..30 {
            feeder.add_tf_klines("1m", &[Kline::new(i * MIN, 1.0, 1.0, 1.0, 1.0, 1.0)]);
        }
        assert!(feeder.cached_bars("1m") <= 21);
        assert_eq!(feeder.tf_bars["1m"].last().map(|b| b.time), Some(29 * MIN));
    }

    #[test]
    fn test_invalid_adjustments_rejected() {
        let (sink, _rx) = ChannelSink::channel();
        let ctx = context(RunMode::Backtest, Arc::new(MemoryBarStore::new()));
        let adjs = vec![
            AdjInfo { start_ms: 0, stop_ms: 100, factor: 1.0 },
            AdjInfo { start_ms: 50, stop_ms: 200, factor: 1.0 },
        ];
        let res = Feeder::new(ExSymbol::new("binance", "spot", "AAPL"), ctx, Box::new(sink), adjs);
        assert!(matches!(res, Err(FeedError::InvalidAdjustments(_))));
    }

    #[test]
    fn test_roll_adj_is_monotonic() {
        let (sink, _rx) = ChannelSink::channel();
        let ctx = context(RunMode::Backtest, Arc::new(MemoryBarStore::new()));
        let adjs = vec![
            AdjInfo { start_ms: 0, stop_ms: 1000, factor: 1.0 },
            AdjInfo { start_ms: 1000, stop_ms: 2000, factor: 0.5 },
        ];
        let mut feeder =
            Feeder::new(ExSymbol::new("binance", "spot", "AAPL"), ctx, Box::new(sink), adjs).unwrap();
        assert!(feeder.roll_adj(500));
        assert_eq!(feeder.adj().map(|a| a.factor), Some(1.0));
        assert!(feeder.roll_adj(1500));
        assert!(!feeder.roll_adj(200));
        assert_eq!(feeder.adj().map(|a| a.factor), Some(0.5));
        assert!(feeder.roll_adj(2500));
        assert!(feeder.adj().is_none());
    }

    #[tokio::test]
    async fn test_get_tf_klines_prefers_cache() {
        let store = Arc::new(MemoryBarStore::new());
        let stored: Vec<Kline> = (0..10).map(|i| Kline::new(i * MIN, 1.0, 2.0, 0.5, 1.5, 1.0)).collect();
        store.insert_bars("BTC/USDT", "1m", stored).await;
        let (sink, _rx) = ChannelSink::channel();
        let ctx = context(RunMode::Backtest, Arc::clone(&store));
        let mut feeder =
            Feeder::new(ExSymbol::new("binance", "spot", "BTC/USDT"), ctx, Box::new(sink), Vec::new()).unwrap();

        let bars = feeder.get_tf_klines("1m", 6 * MIN, 3).await.unwrap();
        assert_eq!(bars.iter().map(|b| b.time / MIN).collect::<Vec<_>>(), vec![3, 4, 5]);
        assert_eq!(feeder.cached_bars("1m"), 3);

        // later storage writes are not seen once cached
        store
            .insert_bars("BTC/USDT", "1m", vec![Kline::new(2 * MIN, 9.0, 9.0, 9.0, 9.0, 9.0)])
            .await;
        let bars = feeder.get_tf_klines("1m", 0, 0).await.unwrap();
        assert_eq!(bars.len(), 3);
    }
}
