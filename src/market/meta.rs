/// Exchange metadata used to keep interval boundaries consistent
use std::collections::HashMap;

use tracing::info;

use crate::error::{FeedError, Result};
use crate::types::ExchangeConfig;
use crate::utils::SECS_WEEK;

pub trait MarketMeta: Send + Sync {
    /// Seconds by which `tf_secs` intervals on this exchange are shifted
    /// away from epoch alignment
    fn align_off_secs(&self, exchange: &str, market: &str, tf_secs: i64) -> Result<i64>;
}

/// Metadata provider backed by configuration
#[derive(Debug, Clone, Default)]
pub struct StaticMarketMeta {
    exchanges: HashMap<String, ExchangeConfig>,
}

impl StaticMarketMeta {
    pub fn new(exchanges: &[ExchangeConfig]) -> Self {
        let exchanges: HashMap<String, ExchangeConfig> = exchanges
            .iter()
            .map(|ex| (ex.id.clone(), ex.clone()))
            .collect();
        info!("Loaded metadata for {} exchanges", exchanges.len());
        StaticMarketMeta { exchanges }
    }

    pub fn insert(&mut self, exchange: ExchangeConfig) {
        self.exchanges.insert(exchange.id.clone(), exchange);
    }

    pub fn get(&self, exchange: &str) -> Option<&ExchangeConfig> {
        self.exchanges.get(exchange)
    }
}

impl MarketMeta for StaticMarketMeta {
    fn align_off_secs(&self, exchange: &str, _market: &str, tf_secs: i64) -> Result<i64> {
        let ex = self
            .exchanges
            .get(exchange)
            .ok_or_else(|| FeedError::ExchangeNotFound(exchange.to_string()))?;
        if tf_secs == SECS_WEEK {
            return Ok(ex.week_align_off_days * 86_400);
        }
        Ok(0)
    }
}
