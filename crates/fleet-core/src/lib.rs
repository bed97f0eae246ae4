pub mod config;
pub mod time;

pub use config::{
    FleetConfig, LoggingConfig, RolloutConfig, RoundingSetting, SchedulerConfig, StoreConfig,
};
pub use time::{DurationError, epoch_secs, parse_duration};
