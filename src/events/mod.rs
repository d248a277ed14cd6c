pub mod types;
pub mod sink;
pub mod source;

pub use types::FeedEvent;
pub use sink::{BarSink, CallbackSink, ChannelSink, FnPairKline, FuncEnvEnd};
pub use source::BarSource;
