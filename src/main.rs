/// Main entry point for the backtest replay
use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Context};
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use barfeed::{
    config::{load_config, resolve_time_range},
    data::{run_replay, DbKlineFeeder, FeedContext, FeedRegistry, MemoryBarStore},
    events::{BarSource, ChannelSink, FeedEvent},
    market::StaticMarketMeta,
    utils::{ms_to_string, parse_time_zone},
    FeedConfig, RunMode,
};

/// What the consumer side saw during a run
#[derive(Debug, Default)]
struct BarTally {
    per_timeframe: HashMap<String, usize>,
    warm_up: usize,
    env_ends: usize,
}

fn init_logging(config: &FeedConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("barfeed={},warn", config.log_level)));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Stand-in for the strategy runtime: counts what the feeders deliver
fn spawn_consumer(mut rx: mpsc::UnboundedReceiver<FeedEvent>) -> tokio::task::JoinHandle<BarTally> {
    tokio::spawn(async move {
        let mut tally = BarTally::default();
        while let Some(event) = rx.recv().await {
            match event {
                FeedEvent::Bar(bar) if bar.is_warm_up => tally.warm_up += 1,
                FeedEvent::Bar(bar) => {
                    *tally.per_timeframe.entry(bar.bar.timeframe).or_insert(0) += 1;
                }
                FeedEvent::EnvEnd { .. } => tally.env_ends += 1,
                FeedEvent::EnvReset { .. } => {}
            }
        }
        tally
    })
}

fn spawn_shutdown_handler(tx: watch::Sender<bool>) {
    tokio::spawn(async move {
        // Wait for Ctrl+C
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl+C received - stopping replay");
            let _ = tx.send(true);
        }
    });
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let config = load_config(&config_path).with_context(|| format!("loading {}", config_path))?;
    init_logging(&config);

    if config.run_mode == RunMode::Live {
        bail!("run_mode live needs an exchange stream; this binary only replays stored bars");
    }
    if config.symbols.is_empty() || config.timeframes.is_empty() {
        bail!("nothing to replay: configure symbols and timeframes");
    }

    let tz = parse_time_zone(&config.time_zone)?;
    let range = resolve_time_range(&config)?;
    info!(
        "Replaying {} symbols {:?} from {} to {}",
        config.symbols.len(),
        config.timeframes,
        ms_to_string(range.start_ms, tz),
        if range.end_ms > 0 { ms_to_string(range.end_ms, tz) } else { "end".to_string() }
    );

    let registry = FeedRegistry::for_mode(RunMode::Backtest, range.start_ms);
    let storage = Arc::new(MemoryBarStore::with_data_dir(&config.data_dir));
    let meta = Arc::new(StaticMarketMeta::new(&config.exchanges));
    let ctx = FeedContext::from_config(&config, Arc::clone(&registry), meta, storage);

    let (stop_tx, stop_rx) = watch::channel(false);
    spawn_shutdown_handler(stop_tx);

    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let consumer = spawn_consumer(event_rx);

    let mut sources: Vec<Box<dyn BarSource>> = Vec::with_capacity(config.symbols.len());
    for symbol in &config.symbols {
        let sink = Box::new(ChannelSink::new(event_tx.clone()));
        let mut feeder = DbKlineFeeder::new(symbol.clone(), ctx.clone(), sink, range)
            .await?
            .with_batch_size(config.batch_size)
            .with_stop(stop_rx.clone());
        let adds = feeder.sub_tfs(config.timeframes.as_slice(), false)?;
        if adds.is_empty() {
            warn!("No timeframes subscribed for {}, skipping", symbol.symbol);
            continue;
        }
        if let Err(e) = feeder.ensure_downloaded().await {
            if e.is_recoverable() {
                warn!("Skip {}: {} ({})", symbol.symbol, e, e.error_code());
                continue;
            }
            return Err(e.into());
        }
        let warm_end = feeder.warm_tfs(range.start_ms, Some(config.warm_nums.clone())).await?;
        if warm_end > 0 {
            info!("Warmed {} up to {}", symbol.symbol, ms_to_string(warm_end, tz));
        }
        if let Err(e) = feeder.seek(range.start_ms).await {
            warn!("Seek {} failed: {} ({})", symbol.symbol, e, e.error_code());
            continue;
        }
        sources.push(Box::new(feeder));
    }
    drop(event_tx);

    let report = run_replay(&mut sources, stop_rx).await?;
    drop(sources);
    let tally = consumer.await.context("bar consumer panicked")?;

    info!(
        "Replay {}: {} bars, {} base closes, clock at {}",
        if report.cancelled { "cancelled" } else { "completed" },
        report.bars,
        report.fired,
        ms_to_string(registry.clock().now_ms(), tz)
    );
    let mut per_tf: Vec<_> = tally.per_timeframe.iter().collect();
    per_tf.sort();
    for (tf, count) in per_tf {
        info!("   {}: {} bars", tf, count);
    }
    info!("   warm-up bars: {}, adjustment ends: {}", tally.warm_up, tally.env_ends);
    if !report.errors.is_empty() {
        warn!("{} errors during replay", report.errors.len());
    }
    info!("{}", serde_json::to_string(&report)?);

    Ok(())
}
