pub mod loader;

pub use loader::{load_config, parse_config, resolve_time_range, validate_config};
