pub mod adjust;
pub mod bar_aggregator;
pub mod bar_store;
pub mod feeder;
pub mod hist_feeder;
pub mod kline_feeder;
pub mod registry;
pub mod replay;

pub use adjust::{apply_adj, find_adj, validate_adjs};
pub use bar_aggregator::build_ohlcv;
pub use bar_store::{write_csv_file, BarStorage, MemoryBarStore};
pub use feeder::{FeedContext, Feeder, TimeframeState};
pub use hist_feeder::{DbKlineFeeder, DEFAULT_BATCH_SIZE};
pub use kline_feeder::KlineFeeder;
pub use registry::FeedRegistry;
pub use replay::{run_replay, ReplayReport};
