pub mod types;
pub mod error;
pub mod events;
pub mod data;
pub mod market;
pub mod time;
pub mod config;
pub mod utils;

pub use types::*;
pub use error::{FeedError, Result};
