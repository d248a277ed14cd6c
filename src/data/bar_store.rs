/// Bar storage: the query interface feeders page through, plus an
/// in-memory store that can lazily load CSV files from a data directory
use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use chrono_tz::Tz;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use futures_util::future::BoxFuture;
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::data::adjust::validate_adjs;
use crate::data::bar_aggregator::build_ohlcv;
use crate::error::{FeedError, Result};
use crate::types::{AdjInfo, Kline};
use crate::utils::{ms_to_string, tf_to_secs};

/// Storage of bars and adjustment ranges, keyed by symbol and timeframe.
/// Safe for concurrent reads.
pub trait BarStorage: Send + Sync {
    /// Bars of `timeframe` with `time < end_ms` (`end_ms <= 0`: unbounded).
    /// `start_ms > 0` reads forward from `start_ms`; `start_ms <= 0` reads the
    /// last `limit` bars before `end_ms`. `limit == 0` means no limit.
    fn fetch_bars<'a>(
        &'a self,
        symbol: &'a str,
        timeframe: &'a str,
        start_ms: i64,
        end_ms: i64,
        limit: usize,
    ) -> BoxFuture<'a, Result<Vec<Kline>>>;

    fn fetch_adjustments<'a>(&'a self, symbol: &'a str) -> BoxFuture<'a, Result<Vec<AdjInfo>>>;

    /// Make sure `[start_ms, end_ms)` is present; idempotent
    fn ensure_downloaded<'a>(
        &'a self,
        symbol: &'a str,
        timeframe: &'a str,
        start_ms: i64,
        end_ms: i64,
    ) -> BoxFuture<'a, Result<()>>;
}

type SeriesKey = (String, String);

/// In-memory bar store
pub struct MemoryBarStore {
    bars: RwLock<HashMap<SeriesKey, Vec<Kline>>>,
    adjs: RwLock<HashMap<String, Vec<AdjInfo>>>,
    loaded: RwLock<HashSet<SeriesKey>>,
    data_dir: Option<PathBuf>,
}

impl Default for MemoryBarStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBarStore {
    pub fn new() -> Self {
        MemoryBarStore {
            bars: RwLock::new(HashMap::new()),
            adjs: RwLock::new(HashMap::new()),
            loaded: RwLock::new(HashSet::new()),
            data_dir: None,
        }
    }

    /// Store that loads `{symbol}_{tf}.csv[.gz]` from `dir` on first use
    pub fn with_data_dir<P: AsRef<Path>>(dir: P) -> Self {
        MemoryBarStore {
            data_dir: Some(dir.as_ref().to_path_buf()),
            ..Self::new()
        }
    }

    /// Merge bars into a series, keeping it sorted and unique by time
    pub async fn insert_bars(&self, symbol: &str, timeframe: &str, bars: Vec<Kline>) {
        let mut store = self.bars.write().await;
        let series = store
            .entry((symbol.to_string(), timeframe.to_string()))
            .or_default();
        let added = bars.len();
        // later rows win on duplicate times
        let mut merged: Vec<Kline> = bars;
        merged.extend(series.drain(..));
        merged.sort_by_key(|b| b.time);
        merged.dedup_by_key(|b| b.time);
        *series = merged;
        debug!(
            "Stored {} bars for {} {} - total: {}",
            added,
            symbol,
            timeframe,
            series.len()
        );
    }

    pub async fn set_adjustments(&self, symbol: &str, adjs: Vec<AdjInfo>) -> Result<()> {
        validate_adjs(&adjs)?;
        self.adjs.write().await.insert(symbol.to_string(), adjs);
        Ok(())
    }

    pub async fn bar_count(&self, symbol: &str, timeframe: &str) -> usize {
        let store = self.bars.read().await;
        store
            .get(&(symbol.to_string(), timeframe.to_string()))
            .map_or(0, |s| s.len())
    }

    /// Stored series for `timeframe`, or one derived from the coarsest stored
    /// timeframe that divides it. A trailing partial bar of a derived series
    /// is dropped.
    async fn series(&self, symbol: &str, timeframe: &str) -> Result<Vec<Kline>> {
        let store = self.bars.read().await;
        if let Some(series) = store.get(&(symbol.to_string(), timeframe.to_string())) {
            return Ok(series.clone());
        }
        let to_ms = tf_to_secs(timeframe)? * 1000;
        let source = store
            .iter()
            .filter(|((sym, _), series)| sym == symbol && !series.is_empty())
            .filter_map(|((_, tf), series)| {
                let from_ms = tf_to_secs(tf).ok()? * 1000;
                (from_ms < to_ms && to_ms % from_ms == 0).then_some((from_ms, series))
            })
            .max_by_key(|(from_ms, _)| *from_ms);
        let Some((from_ms, src)) = source else {
            return Ok(Vec::new());
        };
        let (mut bars, finished) = build_ohlcv(src, to_ms, 0.0, None, from_ms, 0, true);
        if !finished {
            bars.pop();
        }
        debug!("Derived {} {} bars of {} from {}ms", bars.len(), timeframe, symbol, from_ms);
        Ok(bars)
    }

    async fn load_files(&self, symbol: &str, timeframe: &str) -> Result<()> {
        let key = (symbol.to_string(), timeframe.to_string());
        let Some(dir) = self.data_dir.clone() else {
            return Ok(());
        };
        if self.loaded.read().await.contains(&key) {
            return Ok(());
        }

        let stem = file_stem(symbol);
        let csv_path = dir.join(format!("{}_{}.csv", stem, timeframe));
        let gz_path = dir.join(format!("{}_{}.csv.gz", stem, timeframe));
        let path = if csv_path.exists() {
            Some(csv_path)
        } else if gz_path.exists() {
            Some(gz_path)
        } else {
            None
        };
        if let Some(path) = path {
            let shown = path.display().to_string();
            let bars = tokio::task::spawn_blocking(move || read_csv_file(&path))
                .await
                .map_err(|e| FeedError::InternalError(format!("CSV loader panicked: {}", e)))??;
            info!("Loaded {} bars from {}", bars.len(), shown);
            self.insert_bars(symbol, timeframe, bars).await;
        }

        let adj_path = dir.join(format!("{}_adj.csv", stem));
        if adj_path.exists() && !self.adjs.read().await.contains_key(symbol) {
            let adjs = tokio::task::spawn_blocking(move || read_adj_file(&adj_path))
                .await
                .map_err(|e| FeedError::InternalError(format!("CSV loader panicked: {}", e)))??;
            self.set_adjustments(symbol, adjs).await?;
        }

        self.loaded.write().await.insert(key);
        Ok(())
    }
}

impl BarStorage for MemoryBarStore {
    fn fetch_bars<'a>(
        &'a self,
        symbol: &'a str,
        timeframe: &'a str,
        start_ms: i64,
        end_ms: i64,
        limit: usize,
    ) -> BoxFuture<'a, Result<Vec<Kline>>> {
        Box::pin(async move {
            let series = self.series(symbol, timeframe).await?;
            let stop = if end_ms > 0 {
                series.partition_point(|b| b.time < end_ms)
            } else {
                series.len()
            };
            let (start, stop) = if start_ms > 0 {
                let start = series.partition_point(|b| b.time < start_ms).min(stop);
                let stop = if limit > 0 { stop.min(start + limit) } else { stop };
                (start, stop)
            } else {
                let start = if limit > 0 { stop.saturating_sub(limit) } else { 0 };
                (start, stop)
            };
            Ok(series[start..stop].to_vec())
        })
    }

    fn fetch_adjustments<'a>(&'a self, symbol: &'a str) -> BoxFuture<'a, Result<Vec<AdjInfo>>> {
        Box::pin(async move {
            let adjs = self.adjs.read().await;
            Ok(adjs.get(symbol).cloned().unwrap_or_default())
        })
    }

    fn ensure_downloaded<'a>(
        &'a self,
        symbol: &'a str,
        timeframe: &'a str,
        start_ms: i64,
        end_ms: i64,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.load_files(symbol, timeframe).await?;
            let series = self.series(symbol, timeframe).await?;
            let first = series.iter().find(|b| b.time >= start_ms);
            match first {
                Some(bar) if end_ms <= 0 || bar.time < end_ms => {
                    let last = series.last().map_or(0, |b| b.time);
                    if end_ms > 0 && last + tf_to_secs(timeframe)? * 1000 < end_ms {
                        warn!(
                            "Stored {} {} ends at {}, before requested end {}",
                            symbol, timeframe, last, end_ms
                        );
                    }
                }
                _ => warn!(
                    "No stored bars for {} {} in {}-{}",
                    symbol, timeframe, start_ms, end_ms
                ),
            }
            Ok(())
        })
    }
}

fn file_stem(symbol: &str) -> String {
    symbol.replace(['/', ':'], "_")
}

fn open_reader(path: &Path) -> Result<Box<dyn Read>> {
    let file = File::open(path)?;
    if path.extension().is_some_and(|ext| ext == "gz") {
        Ok(Box::new(GzDecoder::new(file)))
    } else {
        Ok(Box::new(file))
    }
}

/// Read bars from a CSV file with a `time,open,high,low,close,volume[,info]`
/// header; other columns are ignored. `.gz` files are decompressed.
pub fn read_csv_file(path: &Path) -> Result<Vec<Kline>> {
    let mut reader = csv::Reader::from_reader(open_reader(path)?);
    let mut bars = Vec::new();
    for row in reader.deserialize::<Kline>() {
        bars.push(row?);
    }
    bars.sort_by_key(|b| b.time);
    Ok(bars)
}

pub fn read_adj_file(path: &Path) -> Result<Vec<AdjInfo>> {
    let mut reader = csv::Reader::from_reader(open_reader(path)?);
    let mut adjs = Vec::new();
    for row in reader.deserialize::<AdjInfo>() {
        adjs.push(row?);
    }
    Ok(adjs)
}

#[derive(Serialize)]
struct CsvRow {
    date: String,
    time: i64,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: f64,
    info: f64,
}

/// Export bars as CSV with a readable `date` column in `tz`
pub fn write_csv_file(path: &Path, bars: &[Kline], tz: Tz, compress: bool) -> Result<()> {
    let file = File::create(path)?;
    if compress {
        let encoder = write_rows(GzEncoder::new(file, Compression::default()), bars, tz)?;
        encoder.finish()?;
    } else {
        write_rows(file, bars, tz)?;
    }
    Ok(())
}

fn write_rows<W: Write>(out: W, bars: &[Kline], tz: Tz) -> Result<W> {
    let mut writer = csv::Writer::from_writer(out);
    for bar in bars {
        writer.serialize(CsvRow {
            date: ms_to_string(bar.time, tz),
            time: bar.time,
            open: bar.open,
            high: bar.high,
            low: bar.low,
            close: bar.close,
            volume: bar.volume,
            info: bar.info,
        })?;
    }
    writer
        .into_inner()
        .map_err(|e| FeedError::FileError(e.into_error()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::parse_time_zone;

    const MIN: i64 = 60_000;

    fn bars(start_min: i64, count: i64) -> Vec<Kline> {
        (start_min..start_min + count)
            .map(|i| Kline::new(i * MIN, 10.0 + i as f64, 11.0 + i as f64, 9.0, 10.5, 1.0))
            .collect()
    }

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("barfeed_{}_{}", name, std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[tokio::test]
    async fn test_fetch_forward_and_backward() {
        let store = MemoryBarStore::new();
        store.insert_bars("BTC/USDT", "1m", bars(1, 20)).await;

        let fwd = store.fetch_bars("BTC/USDT", "1m", 5 * MIN, 0, 3).await.unwrap();
        assert_eq!(fwd.iter().map(|b| b.time / MIN).collect::<Vec<_>>(), vec![5, 6, 7]);

        let bounded = store.fetch_bars("BTC/USDT", "1m", 18 * MIN, 19 * MIN, 10).await.unwrap();
        assert_eq!(bounded.len(), 1);

        let back = store.fetch_bars("BTC/USDT", "1m", 0, 10 * MIN, 4).await.unwrap();
        assert_eq!(back.iter().map(|b| b.time / MIN).collect::<Vec<_>>(), vec![6, 7, 8, 9]);

        let none = store.fetch_bars("ETH/USDT", "1m", 0, 0, 0).await.unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn test_insert_dedups() {
        let store = MemoryBarStore::new();
        store.insert_bars("BTC/USDT", "1m", bars(0, 5)).await;
        let mut newer = bars(3, 4);
        newer[0].close = 99.0;
        store.insert_bars("BTC/USDT", "1m", newer).await;

        assert_eq!(store.bar_count("BTC/USDT", "1m").await, 7);
        let all = store.fetch_bars("BTC/USDT", "1m", 0, 0, 0).await.unwrap();
        assert_eq!(all[3].close, 99.0);
    }

    #[tokio::test]
    async fn test_derived_series() {
        let store = MemoryBarStore::new();
        store.insert_bars("BTC/USDT", "1m", bars(0, 12)).await;

        let five = store.fetch_bars("BTC/USDT", "5m", 0, 0, 0).await.unwrap();
        // 10..12 is still open and not returned
        assert_eq!(five.iter().map(|b| b.time / MIN).collect::<Vec<_>>(), vec![0, 5]);
        assert_eq!(five[0].open, 10.0);
        assert_eq!(five[0].volume, 5.0);
        assert!(store.fetch_bars("BTC/USDT", "1h", 0, 0, 0).await.unwrap().is_empty());

        // the coarsest stored divisor wins
        let stored_five: Vec<Kline> = (0..6)
            .map(|i| Kline::new(i * 5 * MIN, 1.0, 2.0, 0.5, 1.5, 7.0))
            .collect();
        store.insert_bars("BTC/USDT", "5m", stored_five).await;
        let fifteen = store.fetch_bars("BTC/USDT", "15m", 0, 0, 0).await.unwrap();
        assert_eq!(fifteen.iter().map(|b| b.time / MIN).collect::<Vec<_>>(), vec![0, 15]);
        assert_eq!(fifteen[0].volume, 21.0);
    }

    #[tokio::test]
    async fn test_adjustments() {
        let store = MemoryBarStore::new();
        let adjs = vec![
            AdjInfo { start_ms: 0, stop_ms: 1000, factor: 2.0 },
            AdjInfo { start_ms: 1000, stop_ms: 5000, factor: 1.0 },
        ];
        store.set_adjustments("AAPL", adjs.clone()).await.unwrap();
        assert_eq!(store.fetch_adjustments("AAPL").await.unwrap(), adjs);
        assert!(store.fetch_adjustments("MSFT").await.unwrap().is_empty());

        let broken = vec![AdjInfo { start_ms: 10, stop_ms: 0, factor: 1.0 }];
        assert!(store.set_adjustments("AAPL", broken).await.is_err());
    }

    #[tokio::test]
    async fn test_csv_files_load_once() {
        let dir = temp_dir("csv");
        let tz = parse_time_zone("UTC").unwrap();
        write_csv_file(&dir.join("BTC_USDT_1m.csv"), &bars(0, 10), tz, false).unwrap();
        write_csv_file(&dir.join("ETH_USDT_1m.csv.gz"), &bars(0, 4), tz, true).unwrap();
        std::fs::write(
            dir.join("BTC_USDT_adj.csv"),
            "start_ms,stop_ms,factor\n0,300000,0.5\n300000,900000,1.0\n",
        )
        .unwrap();

        let store = MemoryBarStore::with_data_dir(&dir);
        store.ensure_downloaded("BTC/USDT", "1m", 0, 10 * MIN).await.unwrap();
        store.ensure_downloaded("BTC/USDT", "1m", 0, 10 * MIN).await.unwrap();
        store.ensure_downloaded("ETH/USDT", "1m", 0, 0).await.unwrap();

        assert_eq!(store.bar_count("BTC/USDT", "1m").await, 10);
        assert_eq!(store.bar_count("ETH/USDT", "1m").await, 4);
        assert_eq!(store.fetch_adjustments("BTC/USDT").await.unwrap().len(), 2);

        let text = std::fs::read_to_string(dir.join("BTC_USDT_1m.csv")).unwrap();
        assert!(text.starts_with("date,time,open"));
        assert!(text.contains("1970-01-01 00:01:00"));

        let _ = std::fs::remove_dir_all(dir);
    }
}
