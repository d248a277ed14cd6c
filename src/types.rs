/// Core type definitions for the bar feed
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// OHLCV bar. `time` is the interval start in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Kline {
    pub time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    #[serde(default)]
    pub info: f64,
}

impl Kline {
    pub fn new(time: i64, open: f64, high: f64, low: f64, close: f64, volume: f64) -> Self {
        Kline {
            time,
            open,
            high,
            low,
            close,
            volume,
            info: 0.0,
        }
    }
}

/// A bar tagged with the instrument and timeframe it belongs to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairTfKline {
    pub symbol: String,
    pub timeframe: String,
    pub tf_msecs: i64,
    pub kline: Kline,
}

impl PairTfKline {
    /// Close time of the bar (exclusive end of its interval)
    pub fn end_ms(&self) -> i64 {
        self.kline.time + self.tf_msecs
    }
}

/// Price adjustment range: `[start_ms, stop_ms)` with a multiplicative factor
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AdjInfo {
    pub start_ms: i64,
    pub stop_ms: i64,
    pub factor: f64,
}

/// What a strategy receives for every finished bar
#[derive(Debug, Clone, PartialEq)]
pub struct InfoKline {
    pub bar: PairTfKline,
    pub adj: Option<AdjInfo>,
    pub is_warm_up: bool,
}

/// Instrument identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExSymbol {
    pub exchange: String,
    #[serde(default)]
    pub market: String,
    pub symbol: String,
    /// Delisting timestamp; 0 while still listed
    #[serde(default)]
    pub delist_ms: i64,
}

impl ExSymbol {
    pub fn new(exchange: &str, market: &str, symbol: &str) -> Self {
        ExSymbol {
            exchange: exchange.to_string(),
            market: market.to_string(),
            symbol: symbol.to_string(),
            delist_ms: 0,
        }
    }
}

/// Execution mode of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    #[default]
    Backtest,
    Live,
}

impl RunMode {
    pub fn as_str(&self) -> &str {
        match self {
            RunMode::Backtest => "backtest",
            RunMode::Live => "live",
        }
    }
}

/// Time range in milliseconds; `end_ms == 0` means unbounded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimeRange {
    pub start_ms: i64,
    pub end_ms: i64,
}

/// A time given either as milliseconds or as a date string
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum TimeValue {
    Millis(i64),
    Text(String),
}

impl Default for TimeValue {
    fn default() -> Self {
        TimeValue::Millis(0)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TimeRangeConfig {
    #[serde(default)]
    pub start: TimeValue,
    #[serde(default)]
    pub end: TimeValue,
}

/// Alignment rules for one exchange
#[derive(Debug, Clone, Deserialize)]
pub struct ExchangeConfig {
    pub id: String,
    /// Weekly bars start this many days after the epoch weekday (Thursday)
    #[serde(default)]
    pub week_align_off_days: i64,
}

/// Configuration for the bar feed
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    pub run_mode: RunMode,

    // Bar Processing
    pub pre_fire: f64,
    pub num_ta_cache: usize,

    // Replay
    pub batch_size: usize,
    pub io_timeout_secs: u64,
    pub time_range: TimeRangeConfig,
    pub time_zone: String,

    // Subscriptions
    pub warm_nums: HashMap<String, usize>,
    pub timeframes: Vec<String>,
    pub symbols: Vec<ExSymbol>,
    pub exchanges: Vec<ExchangeConfig>,

    // Storage
    pub data_dir: String,

    // Logging
    pub log_level: String,
    pub show_log: bool,
}

impl Default for FeedConfig {
    fn default() -> Self {
        FeedConfig {
            run_mode: RunMode::Backtest,
            pre_fire: 0.0,
            num_ta_cache: 1000,
            batch_size: 3000,
            io_timeout_secs: 30,
            time_range: TimeRangeConfig::default(),
            time_zone: "UTC".to_string(),
            warm_nums: HashMap::new(),
            timeframes: Vec::new(),
            symbols: Vec::new(),
            exchanges: Vec::new(),
            data_dir: "data/bars".to_string(),
            log_level: "info".to_string(),
            show_log: true,
        }
    }
}
