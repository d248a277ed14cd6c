/// Delivery side of a feeder
use tokio::sync::mpsc;
use tracing::warn;

use super::types::FeedEvent;
use crate::types::{AdjInfo, InfoKline, PairTfKline};

pub type FnPairKline = Box<dyn FnMut(InfoKline) + Send>;
pub type FuncEnvEnd = Box<dyn FnMut(&PairTfKline, &AdjInfo) + Send>;

/// Receives finished bars, in non-decreasing time order per instrument.
/// Calls never overlap for a single feeder.
pub trait BarSink: Send {
    fn on_bar(&mut self, bar: InfoKline);

    /// The adjustment range `adj` ended; positions priced under it should be closed
    fn on_env_end(&mut self, _bar: &PairTfKline, _adj: &AdjInfo) {}

    /// Called before a warm-up replays history for `symbol`/`timeframe`
    fn reset_env(&mut self, _symbol: &str, _timeframe: &str) {}
}

/// Sink built from plain closures
pub struct CallbackSink {
    on_bar: FnPairKline,
    on_env_end: Option<FuncEnvEnd>,
}

impl CallbackSink {
    pub fn new(on_bar: FnPairKline) -> Self {
        CallbackSink {
            on_bar,
            on_env_end: None,
        }
    }

    pub fn with_env_end(mut self, on_env_end: FuncEnvEnd) -> Self {
        self.on_env_end = Some(on_env_end);
        self
    }
}

impl BarSink for CallbackSink {
    fn on_bar(&mut self, bar: InfoKline) {
        (self.on_bar)(bar);
    }

    fn on_env_end(&mut self, bar: &PairTfKline, adj: &AdjInfo) {
        if let Some(cb) = self.on_env_end.as_mut() {
            cb(bar, adj);
        }
    }
}

/// Sink forwarding everything into an unbounded channel
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<FeedEvent>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::UnboundedSender<FeedEvent>) -> Self {
        ChannelSink { tx }
    }

    pub fn channel() -> (Self, mpsc::UnboundedReceiver<FeedEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ChannelSink { tx }, rx)
    }

    fn send(&self, event: FeedEvent) {
        let kind = event.as_str().to_string();
        if self.tx.send(event).is_err() {
            warn!("Feed event receiver dropped, discarding {}", kind);
        }
    }
}

impl BarSink for ChannelSink {
    fn on_bar(&mut self, bar: InfoKline) {
        self.send(FeedEvent::Bar(bar));
    }

    fn on_env_end(&mut self, bar: &PairTfKline, adj: &AdjInfo) {
        self.send(FeedEvent::EnvEnd {
            bar: bar.clone(),
            adj: *adj,
        });
    }

    fn reset_env(&mut self, symbol: &str, timeframe: &str) {
        self.send(FeedEvent::EnvReset {
            symbol: symbol.to_string(),
            timeframe: timeframe.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Kline;
    use std::sync::{Arc, Mutex};

    fn info_bar(time: i64) -> InfoKline {
        InfoKline {
            bar: PairTfKline {
                symbol: "BTC/USDT".to_string(),
                timeframe: "1m".to_string(),
                tf_msecs: 60_000,
                kline: Kline::new(time, 1.0, 2.0, 0.5, 1.5, 10.0),
            },
            adj: None,
            is_warm_up: false,
        }
    }

    #[test]
    fn test_callback_sink() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let ends = Arc::new(Mutex::new(0));
        let seen_cb = Arc::clone(&seen);
        let ends_cb = Arc::clone(&ends);
        let mut sink = CallbackSink::new(Box::new(move |bar: InfoKline| {
            seen_cb.lock().unwrap().push(bar.bar.kline.time);
        }))
        .with_env_end(Box::new(move |_bar: &PairTfKline, _adj: &AdjInfo| {
            *ends_cb.lock().unwrap() += 1;
        }));

        sink.on_bar(info_bar(0));
        sink.on_bar(info_bar(60_000));
        let adj = AdjInfo { start_ms: 0, stop_ms: 60_000, factor: 1.0 };
        sink.on_env_end(&info_bar(0).bar, &adj);
        sink.reset_env("BTC/USDT", "1m");

        assert_eq!(*seen.lock().unwrap(), vec![0, 60_000]);
        assert_eq!(*ends.lock().unwrap(), 1);
    }

    #[test]
    fn test_channel_sink() {
        let (mut sink, mut rx) = ChannelSink::channel();
        sink.reset_env("BTC/USDT", "1m");
        sink.on_bar(info_bar(0));

        assert_eq!(rx.try_recv().unwrap().as_str(), "ENV_RESET");
        match rx.try_recv().unwrap() {
            FeedEvent::Bar(bar) => assert_eq!(bar.bar.kline.time, 0),
            other => panic!("unexpected event {:?}", other),
        }

        drop(rx);
        // receiver gone: delivery is dropped without panicking
        sink.on_bar(info_bar(60_000));
    }
}
