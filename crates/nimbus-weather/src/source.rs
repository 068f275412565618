//! Temperature source abstraction.
//!
//! Concrete providers (HTTP APIs, sensors, caches) live in the host; the
//! aggregator only needs a name and a current temperature.

use async_trait::async_trait;

use crate::types::SourceError;

#[async_trait]
pub trait TemperatureSource: Send + Sync {
    /// Short identifier used in logs and query records
    fn name(&self) -> &str;

    /// Current temperature at `location`, in degrees Celsius
    async fn current_temperature(&self, location: &str) -> Result<f64, SourceError>;
}
