pub mod meta;

pub use meta::{MarketMeta, StaticMarketMeta};
