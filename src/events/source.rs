/// Pull side of a replay: a cursor the backtest loop merges by `next_ms`
use futures_util::future::BoxFuture;

use crate::error::Result;
use crate::types::Kline;

pub trait BarSource: Send {
    fn symbol(&self) -> &str;

    /// Start time of the bar under the cursor; `i64::MAX` once exhausted
    fn next_ms(&self) -> i64;

    /// Bar under the cursor, if any
    fn current(&self) -> Option<Kline>;

    /// Feed `bar` through the aggregation path
    fn run_bar(&mut self, bar: Kline) -> Result<bool>;

    /// Move to the next bar, paging storage when the cache runs out
    fn advance(&mut self) -> BoxFuture<'_, Result<()>>;
}
