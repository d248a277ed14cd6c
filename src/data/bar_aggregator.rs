/// Fold finer bars into coarser timeframe bars
use crate::types::Kline;
use crate::utils::align_tf_msecs_offset;

fn merge_into(big: &mut Kline, bar: &Kline) {
    big.high = big.high.max(bar.high);
    big.low = big.low.min(bar.low);
    big.close = bar.close;
    big.volume += bar.volume;
    big.info = bar.info;
}

fn start_from(bar: &Kline, time: i64) -> Kline {
    Kline { time, ..*bar }
}

/// Aggregate `arr` (ascending, contiguous bars of `from_tf_msecs` each) into
/// `to_tf_msecs` bars whose boundaries are shifted by `off_ms`.
///
/// `resume` is the still-open target bar returned by the previous call; new
/// data sharing its boundary is folded into a copy of it. Returns the target
/// bars and whether the last one is finished. Every bar but the last is
/// always finished.
///
/// `last_finish` tells whether the last source bar is itself closed. An open
/// source bar never closes the target bar. Otherwise the last bar is finished
/// once the source data covers its whole interval, or, with `pre_fire > 0`,
/// once it covers `1 - pre_fire` of it. Coverage is only known when the
/// source interval is known (`from_tf_msecs > 0`).
///
/// Pure: the same inputs always produce the same output.
pub fn build_ohlcv(
    arr: &[Kline],
    to_tf_msecs: i64,
    pre_fire: f64,
    resume: Option<&Kline>,
    from_tf_msecs: i64,
    off_ms: i64,
    last_finish: bool,
) -> (Vec<Kline>, bool) {
    let mut res: Vec<Kline> = Vec::with_capacity(arr.len() / 2 + 1);
    if let Some(open_bar) = resume {
        res.push(*open_bar);
    }
    for bar in arr {
        let time_align = align_tf_msecs_offset(bar.time, to_tf_msecs, off_ms);
        match res.last_mut() {
            Some(big) if big.time == time_align => merge_into(big, bar),
            // already folded into a later bar
            Some(big) if big.time > time_align => continue,
            _ => res.push(start_from(bar, time_align)),
        }
    }

    let (Some(last_src), Some(big)) = (arr.last(), res.last()) else {
        return (res, false);
    };
    if from_tf_msecs <= 0 || !last_finish {
        return (res, false);
    }
    let covered = last_src.time + from_tf_msecs - big.time;
    let mut finished = covered >= to_tf_msecs;
    if !finished && pre_fire > 0.0 {
        let early_ms = (to_tf_msecs as f64 * pre_fire).round() as i64;
        finished = covered >= to_tf_msecs - early_ms;
    }
    (res, finished)
}
