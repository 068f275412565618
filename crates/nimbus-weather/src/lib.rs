//! Weather lookups for Nimbus
//!
//! Averages the current temperature reported by several sources, records
//! every fetch in a query log and coalesces concurrent lookups for the same
//! location through `nimbus-batch`.

pub mod aggregator;
pub mod query_log;
pub mod retry;
pub mod service;
pub mod source;
pub mod types;

pub use aggregator::WeatherAggregator;
pub use query_log::{QueryLog, QueryRecord};
pub use retry::{with_retry, RetryConfig};
pub use service::WeatherService;
pub use source::TemperatureSource;
pub use types::*;
