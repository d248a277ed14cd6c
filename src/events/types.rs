/// Events delivered from a feeder to the strategy runtime
use crate::types::{AdjInfo, InfoKline, PairTfKline};

#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    /// A finished bar
    Bar(InfoKline),

    /// The adjustment range `adj` ended; `bar` is the last bar seen under it
    EnvEnd { bar: PairTfKline, adj: AdjInfo },

    /// Indicator state for this symbol+timeframe must be rebuilt from scratch
    EnvReset { symbol: String, timeframe: String },
}

impl FeedEvent {
    pub fn as_str(&self) -> &str {
        match self {
            FeedEvent::Bar(_) => "BAR",
            FeedEvent::EnvEnd { .. } => "ENV_END",
            FeedEvent::EnvReset { .. } => "ENV_RESET",
        }
    }
}
