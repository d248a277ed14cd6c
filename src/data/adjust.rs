/// Forward price adjustment over contiguous time ranges
use crate::error::{FeedError, Result};
use crate::types::{AdjInfo, Kline};

impl AdjInfo {
    pub fn contains(&self, time_ms: i64) -> bool {
        time_ms >= self.start_ms && time_ms < self.stop_ms
    }

    /// Multiply price fields by the factor; volume is left as is
    pub fn apply_one(&self, bar: &Kline) -> Kline {
        Kline {
            open: bar.open * self.factor,
            high: bar.high * self.factor,
            low: bar.low * self.factor,
            close: bar.close * self.factor,
            ..*bar
        }
    }

    pub fn apply(&self, bars: &[Kline]) -> Vec<Kline> {
        bars.iter().map(|b| self.apply_one(b)).collect()
    }
}

/// Apply an optional range: no range means no adjustment
pub fn apply_opt(adj: Option<&AdjInfo>, bars: &[Kline]) -> Vec<Kline> {
    match adj {
        Some(adj) => adj.apply(bars),
        None => bars.to_vec(),
    }
}

/// Check ranges are ordered, non-empty, contiguous and carry usable factors
pub fn validate_adjs(adjs: &[AdjInfo]) -> Result<()> {
    for (i, adj) in adjs.iter().enumerate() {
        if adj.start_ms >= adj.stop_ms {
            return Err(FeedError::InvalidAdjustments(format!(
                "range {} is empty: {}-{}",
                i, adj.start_ms, adj.stop_ms
            )));
        }
        if !adj.factor.is_finite() || adj.factor <= 0.0 {
            return Err(FeedError::InvalidAdjustments(format!(
                "range {} has factor {}",
                i, adj.factor
            )));
        }
        if i > 0 && adjs[i - 1].stop_ms != adj.start_ms {
            return Err(FeedError::InvalidAdjustments(format!(
                "range {} starts at {} but previous stops at {}",
                i,
                adj.start_ms,
                adjs[i - 1].stop_ms
            )));
        }
    }
    Ok(())
}

pub fn find_adj(adjs: &[AdjInfo], time_ms: i64) -> Option<&AdjInfo> {
    let idx = adjs.partition_point(|a| a.stop_ms <= time_ms);
    adjs.get(idx).filter(|a| a.contains(time_ms))
}

/// Keep bars starting before `end_ms` (0: all), then the last `limit` of
/// them (0: all), each adjusted by the range containing it. Bars outside
/// every known range stay raw.
pub fn apply_adj(adjs: &[AdjInfo], bars: &[Kline], end_ms: i64, limit: usize) -> Vec<Kline> {
    let stop = if end_ms > 0 {
        bars.partition_point(|b| b.time < end_ms)
    } else {
        bars.len()
    };
    let start = if limit > 0 { stop.saturating_sub(limit) } else { 0 };
    bars[start..stop]
        .iter()
        .map(|bar| match find_adj(adjs, bar.time) {
            Some(adj) => adj.apply_one(bar),
            None => *bar,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adjs() -> Vec<AdjInfo> {
        vec![
            AdjInfo { start_ms: 0, stop_ms: 1000, factor: 1.0 },
            AdjInfo { start_ms: 1000, stop_ms: 2000, factor: 0.5 },
        ]
    }

    fn bars() -> Vec<Kline> {
        (0..6)
            .map(|i| Kline::new(500 + i * 200, 10.0, 12.0, 8.0, 11.0, 100.0))
            .collect()
    }

    #[test]
    fn test_apply_scales_prices_not_volume() {
        let adj = AdjInfo { start_ms: 0, stop_ms: 10, factor: 0.5 };
        let bar = adj.apply_one(&Kline::new(0, 10.0, 12.0, 8.0, 11.0, 100.0));
        assert_eq!((bar.open, bar.high, bar.low, bar.close), (5.0, 6.0, 4.0, 5.5));
        assert_eq!(bar.volume, 100.0);
        assert_eq!(apply_opt(None, &[bar]), vec![bar]);
    }

    #[test]
    fn test_validate() {
        assert!(validate_adjs(&adjs()).is_ok());
        assert!(validate_adjs(&[]).is_ok());

        let mut gap = adjs();
        gap[1].start_ms = 1200;
        assert!(matches!(validate_adjs(&gap), Err(FeedError::InvalidAdjustments(_))));

        let mut empty = adjs();
        empty[0].stop_ms = 0;
        assert!(validate_adjs(&empty).is_err());

        let mut bad = adjs();
        bad[1].factor = f64::NAN;
        assert!(validate_adjs(&bad).unwrap_err().is_structural());
    }

    #[test]
    fn test_apply_adj_per_range() {
        let adjs = adjs();
        let bars = bars(); // 500, 700, 900, 1100, 1300, 1500
        let res = apply_adj(&adjs, &bars, 0, 0);
        for (raw, adjusted) in bars.iter().zip(&res) {
            let factor = find_adj(&adjs, raw.time).map(|a| a.factor).unwrap();
            assert_eq!(adjusted.close, raw.close * factor);
        }
        assert_eq!(res[2].close, 11.0);
        assert_eq!(res[3].close, 5.5);
    }

    #[test]
    fn test_apply_adj_end_and_limit() {
        let res = apply_adj(&adjs(), &bars(), 1300, 2);
        assert_eq!(res.iter().map(|b| b.time).collect::<Vec<_>>(), vec![900, 1100]);

        // beyond the last range: untouched
        let late = vec![Kline::new(2500, 10.0, 12.0, 8.0, 11.0, 1.0)];
        assert_eq!(apply_adj(&adjs(), &late, 0, 0), late);
        assert!(find_adj(&adjs(), -1).is_none());
    }
}
