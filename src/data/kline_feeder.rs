/// Live feeder: warm-up priming and incremental bar ingestion
use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info};

use crate::data::bar_aggregator::build_ohlcv;
use crate::data::feeder::{FeedContext, Feeder, TimeframeState};
use crate::error::{FeedError, Result};
use crate::events::BarSink;
use crate::types::{AdjInfo, ExSymbol, Kline};
use crate::utils::{align_tf_msecs, secs_to_tf, tf_to_secs};

/// Feeder for one instrument driven by pushed bars.
///
/// Every strategy+instrument pair warms up on its own feeder; warm state is
/// never shared between pairs.
pub struct KlineFeeder {
    pub(crate) core: Feeder,
    /// Bars to prime per timeframe, reused by later re-warms
    warm_nums: HashMap<String, usize>,
}

impl KlineFeeder {
    /// Build a feeder, loading the instrument's adjustment ranges from storage
    pub async fn new(symbol: ExSymbol, ctx: FeedContext, sink: Box<dyn BarSink>) -> Result<Self> {
        let storage = Arc::clone(&ctx.storage);
        let what = format!("fetch adjustments {}", symbol.symbol);
        let adjs = ctx.timed(&what, storage.fetch_adjustments(&symbol.symbol)).await?;
        Self::with_adjs(symbol, ctx, sink, adjs)
    }

    pub fn with_adjs(
        symbol: ExSymbol,
        ctx: FeedContext,
        sink: Box<dyn BarSink>,
        adjs: Vec<AdjInfo>,
    ) -> Result<Self> {
        if !adjs.is_empty() {
            debug!("{} adjustment ranges for {}", adjs.len(), symbol.symbol);
        }
        Ok(KlineFeeder {
            core: Feeder::new(symbol, ctx, sink, adjs)?,
            warm_nums: HashMap::new(),
        })
    }

    pub fn core(&self) -> &Feeder {
        &self.core
    }

    pub fn symbol(&self) -> &str {
        &self.core.symbol.symbol
    }

    pub fn states(&self) -> &[TimeframeState] {
        self.core.states()
    }

    pub fn sub_tfs<S: AsRef<str>>(&mut self, timeframes: &[S], del_other: bool) -> Result<Vec<String>> {
        self.core.sub_tfs(timeframes, del_other)
    }

    /// Prime timeframes with `tf_nums[tf]` bars each, ending at `cur_ms`.
    /// `None` reuses the counts of the previous call. Intervals under a
    /// minute and zero counts are skipped. Returns the latest warm end.
    pub async fn warm_tfs(&mut self, cur_ms: i64, tf_nums: Option<HashMap<String, usize>>) -> Result<i64> {
        let nums = match tf_nums {
            Some(nums) if !nums.is_empty() => {
                self.warm_nums = nums.clone();
                nums
            }
            _ => self.warm_nums.clone(),
        };
        if nums.is_empty() {
            return Ok(0);
        }

        let mut ordered: Vec<(String, i64, usize)> = nums
            .into_iter()
            .map(|(tf, num)| tf_to_secs(&tf).map(|secs| (tf, secs, num)))
            .collect::<Result<_>>()?;
        ordered.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));

        let show_log = self.core.ctx.show_log;
        let mut max_end_ms = 0;
        for (tf, secs, warm_num) in ordered {
            let tf_ms = secs * 1000;
            if tf_ms < 60_000 || warm_num == 0 {
                continue;
            }
            let end_ms = align_tf_msecs(cur_ms, tf_ms);
            let bars = self.core.get_tf_klines(&tf, end_ms, warm_num).await?;
            let (Some(first), Some(last)) = (bars.first(), bars.last()) else {
                if show_log {
                    info!(
                        "Skip warm {} {} as empty, want {} before {}",
                        self.symbol(),
                        tf,
                        warm_num,
                        end_ms
                    );
                }
                continue;
            };
            if bars.len() != warm_num && show_log {
                info!(
                    "Warm {}/{} lack {} bars, expect: {}, range: {}-{}",
                    self.symbol(),
                    tf,
                    warm_num.saturating_sub(bars.len()),
                    warm_num,
                    first.time,
                    last.time + tf_ms
                );
            }
            let cur_end = self.warm_tf(&tf, &bars)?;
            max_end_ms = max_end_ms.max(cur_end);
        }
        Ok(max_end_ms)
    }

    /// Replay already adjusted `bars` of `timeframe` as warm-up data.
    ///
    /// Bars are delivered in one batch per adjustment range, and the sink is
    /// told each time a range ends. Bars past the last known range go out
    /// untagged. Returns the end of the window, which becomes the state's
    /// next expected bar.
    pub fn warm_tf(&mut self, timeframe: &str, bars: &[Kline]) -> Result<i64> {
        let tf_ms = match self.core.states.iter().find(|s| s.timeframe == timeframe) {
            Some(state) => state.tf_msecs(),
            None => tf_to_secs(timeframe)? * 1000,
        };
        let Some(last) = bars.last() else {
            return Ok(0);
        };
        let last_ms = last.time + tf_ms;

        let core = &mut self.core;
        core.is_warm_up = true;
        core.sink.reset_env(&core.symbol.symbol, timeframe);

        if core.adjs.is_empty() {
            core.fire_callbacks(timeframe, tf_ms, bars, None);
        } else {
            let adjs = core.adjs.clone();
            let mut cache: Vec<Kline> = Vec::with_capacity(bars.len());
            let mut p_adj: Option<AdjInfo> = Some(adjs[0]);
            let mut pi = 1;
            let mut rest_from: Option<usize> = None;
            'bars: for (i, bar) in bars.iter().enumerate() {
                while let Some(adj) = p_adj {
                    if bar.time < adj.stop_ms {
                        break;
                    }
                    if let Some(&prev) = cache.last() {
                        core.fire_callbacks(timeframe, tf_ms, &cache, Some(adj));
                        cache.clear();
                        core.fire_env_end(timeframe, tf_ms, prev, &adj);
                    }
                    if pi >= adjs.len() {
                        rest_from = Some(i);
                        break 'bars;
                    }
                    p_adj = Some(adjs[pi]);
                    pi += 1;
                }
                cache.push(*bar);
            }
            if let Some(i) = rest_from {
                core.fire_callbacks(timeframe, tf_ms, &bars[i..], None);
            } else if !cache.is_empty() {
                core.fire_callbacks(timeframe, tf_ms, &cache, p_adj);
            }
        }

        if let Some(state) = core.states.iter_mut().find(|s| s.timeframe == timeframe) {
            state.next_ms = last_ms;
        }
        core.is_warm_up = false;
        Ok(last_ms)
    }

    /// Ingest freshly closed bars of interval `bar_tf_ms`.
    ///
    /// Coarser timeframes are updated first, coarsest down, and the base
    /// last. Returns whether any timeframe produced a finished bar.
    pub fn on_new_bars(&mut self, bar_tf_ms: i64, bars: &[Kline]) -> Result<bool> {
        let core = &mut self.core;
        let Some(base) = core.states.first() else {
            return Err(FeedError::NoTimeframes(core.symbol.symbol.clone()));
        };
        let sta_ms = base.tf_msecs();
        let sta_off = base.align_off_ms;
        let pre_fire = core.ctx.pre_fire;

        let (ohlcvs, last_ok) = if bar_tf_ms < sta_ms {
            build_ohlcv(bars, sta_ms, pre_fire, base.wait_bar.as_ref(), bar_tf_ms, sta_off, true)
        } else if bar_tf_ms == sta_ms {
            (bars.to_vec(), true)
        } else {
            return Err(FeedError::InvalidInterval(format!(
                "expect {}, cur: {}",
                base.timeframe,
                secs_to_tf(bar_tf_ms / 1000)
            )));
        };
        if ohlcvs.is_empty() {
            return Ok(false);
        }

        if core.ctx.registry.clock().is_live() {
            if let Some(first) = bars.first() {
                Self::roll_live_adj(core, first.time);
            }
        }

        let mut any_done = false;
        if core.states.len() > 1 {
            // base pieces of this input only, so an open base bar still feeds
            // the coarser levels exactly once; they never fire early
            let (pieces, pieces_ok) = if bar_tf_ms < sta_ms {
                build_ohlcv(bars, sta_ms, 0.0, None, bar_tf_ms, sta_off, true)
            } else {
                (bars.to_vec(), true)
            };
            for i in (1..core.states.len()).rev() {
                let state = &core.states[i];
                let (cur, ok) = build_ohlcv(
                    &pieces,
                    state.tf_msecs(),
                    0.0,
                    state.wait_bar.as_ref(),
                    sta_ms,
                    state.align_off_ms,
                    pieces_ok,
                );
                any_done |= !core.on_state_ohlcvs(i, cur, ok).is_empty();
            }
        }

        let done = core.on_state_ohlcvs(0, ohlcvs, last_ok);
        Ok(any_done || !done.is_empty())
    }

    /// Live streams cross adjustment boundaries without a cursor; the
    /// caller re-warms after the sink has seen the range end.
    fn roll_live_adj(core: &mut Feeder, time_ms: i64) {
        let old = core.adj;
        if !core.roll_adj(time_ms) {
            return;
        }
        let Some(base) = core.states.first() else {
            return;
        };
        let (timeframe, tf_ms) = (base.timeframe.clone(), base.tf_msecs());
        if let (Some(old), Some(last)) = (old, base.latest) {
            core.fire_env_end(&timeframe, tf_ms, last, &old);
        }
    }
}
