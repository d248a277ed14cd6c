/// Backtest loop merging many cursors by their next bar time
use serde::Serialize;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::error::{FeedError, Result};
use crate::events::BarSource;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReplayReport {
    /// Bars fed through the aggregation path
    pub bars: usize,
    /// Steps that closed at least one base bar
    pub fired: usize,
    pub errors: Vec<String>,
    pub cancelled: bool,
    /// Start of the last bar replayed
    pub last_ms: i64,
}

/// Replay every source in time order until all are exhausted or `stop`
/// turns true. Partial bars are never flushed on stop.
///
/// Structural errors abort the run; anything else is recorded and the
/// failing source is left to exhaust itself.
pub async fn run_replay(sources: &mut [Box<dyn BarSource>], stop: watch::Receiver<bool>) -> Result<ReplayReport> {
    let mut report = ReplayReport::default();
    loop {
        if *stop.borrow() {
            info!("Replay stopped after {} bars", report.bars);
            report.cancelled = true;
            break;
        }
        let next = sources
            .iter()
            .enumerate()
            .filter(|(_, src)| src.next_ms() < i64::MAX)
            .min_by_key(|(_, src)| src.next_ms())
            .map(|(idx, _)| idx);
        let Some(idx) = next else {
            break;
        };
        let source = &mut sources[idx];

        if let Some(bar) = source.current() {
            match source.run_bar(bar) {
                Ok(true) => report.fired += 1,
                Ok(false) => {}
                Err(e) if e.is_fatal() => {
                    error!("Replay of {} aborted: {}", source.symbol(), e);
                    return Err(e);
                }
                Err(e) => {
                    warn!("Bar {} of {} failed: {}", bar.time, source.symbol(), e);
                    report.errors.push(format!("{}: {}", source.symbol(), e));
                }
            }
            report.bars += 1;
            report.last_ms = bar.time;
        }

        match source.advance().await {
            Ok(()) => {}
            Err(FeedError::Cancelled(_)) => {
                report.cancelled = true;
                break;
            }
            Err(e) => {
                warn!("Advance {} failed: {}", source.symbol(), e);
                report.errors.push(format!("{}: {}", source.symbol(), e));
            }
        }
    }
    Ok(report)
}
