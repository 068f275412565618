//! Multi-source temperature aggregation.

use std::sync::Arc;

use futures::future::join_all;

use crate::query_log::QueryLog;
use crate::retry::{with_retry, RetryConfig};
use crate::source::TemperatureSource;
use crate::types::{SourceError, SourceReading, WeatherError, WeatherReport};

/// Queries every source concurrently and averages the readings.
///
/// A location that any source reports as unknown fails the whole fetch.
/// Other source failures are tolerated as long as one source succeeds.
pub struct WeatherAggregator {
    sources: Vec<Arc<dyn TemperatureSource>>,
    log: Arc<QueryLog>,
    retry: RetryConfig,
}

impl WeatherAggregator {
    pub fn new(
        sources: Vec<Arc<dyn TemperatureSource>>,
        log: Arc<QueryLog>,
        retry: RetryConfig,
    ) -> Self {
        Self {
            sources,
            log,
            retry,
        }
    }

    pub fn source_count(&self) -> usize {
        self.sources.len()
    }

    /// Fetch and average the current temperature at `location`, then
    /// record the fetch in the query log.
    pub async fn fetch(&self, location: &str) -> Result<WeatherReport, WeatherError> {
        if self.sources.is_empty() {
            return Err(WeatherError::NoSources);
        }

        tracing::debug!(location, sources = self.sources.len(), "Fetching temperature");

        let results = join_all(self.sources.iter().map(|source| async move {
            let result =
                with_retry(&self.retry, || source.current_temperature(location)).await;
            (source.name().to_string(), result)
        }))
        .await;

        let mut readings = Vec::with_capacity(results.len());
        for (source, result) in results {
            match result {
                Ok(temperature) => readings.push(SourceReading {
                    source,
                    temperature,
                }),
                Err(SourceError::LocationNotFound(_)) => {
                    tracing::info!(location, %source, "Source does not know location");
                    return Err(WeatherError::LocationNotFound(location.to_string()));
                }
                Err(e) => {
                    tracing::warn!(location, %source, "Source failed: {}", e);
                }
            }
        }

        if readings.is_empty() {
            tracing::error!(location, "No source returned a temperature");
            return Err(WeatherError::AllSourcesUnavailable {
                location: location.to_string(),
            });
        }

        let temperature =
            readings.iter().map(|r| r.temperature).sum::<f64>() / readings.len() as f64;
        let log_id = self.log.record(location, temperature, readings.clone());

        tracing::info!(
            location,
            temperature,
            succeeded = readings.len(),
            total = self.sources.len(),
            "Aggregated temperature"
        );

        Ok(WeatherReport {
            location: location.to_string(),
            temperature,
            readings,
            log_id: log_id.to_string(),
        })
    }
}
