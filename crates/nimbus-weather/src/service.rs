//! Weather lookup service with request coalescing.

use std::sync::Arc;

use nimbus_batch::{BatchScheduler, SchedulerConfig};
use nimbus_core::{BatchSettings, Config, ConfigError};
use tokio::time::Instant;

use crate::aggregator::WeatherAggregator;
use crate::query_log::QueryLog;
use crate::retry::RetryConfig;
use crate::source::TemperatureSource;
use crate::types::{WeatherError, WeatherReport, WeatherResponse};

/// Entry point for weather lookups.
///
/// Lookups for the same location (ignoring case and surrounding whitespace)
/// that arrive within one batch window share a single aggregated fetch.
/// When the batch settles, the fetch's query log record is updated with the
/// number of callers it served.
pub struct WeatherService {
    scheduler: BatchScheduler<WeatherReport, WeatherError>,
    aggregator: Arc<WeatherAggregator>,
    log: Arc<QueryLog>,
    settings: BatchSettings,
    epoch: Instant,
}

impl WeatherService {
    /// Build a service from validated configuration.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Invalid`] if `config` fails validation.
    pub fn new(
        config: &Config,
        sources: Vec<Arc<dyn TemperatureSource>>,
    ) -> Result<Self, ConfigError> {
        let validation = config.validate();
        if !validation.is_valid() {
            return Err(ConfigError::Invalid(validation.error_summary()));
        }
        for warning in &validation.warnings {
            tracing::warn!("Config warning: {}", warning);
        }

        let log = Arc::new(QueryLog::new());
        let aggregator = Arc::new(WeatherAggregator::new(
            sources,
            log.clone(),
            RetryConfig::from(&config.retry),
        ));

        let scheduler = BatchScheduler::new(SchedulerConfig {
            retention_multiplier: config.batch.retention_multiplier,
            settle_timeout_ms: config.batch.settle_timeout_ms,
        });

        let notifier_log = log.clone();
        scheduler.set_completion_notifier(move |completed| {
            if let Err(e) =
                notifier_log.update_request_count(&completed.id, completed.participant_count)
            {
                tracing::warn!(id = %completed.id, "Failed to update request count: {}", e);
            }
        });

        tracing::info!(
            window_ms = config.batch.window_ms,
            max_batch_size = config.batch.max_batch_size,
            sources = aggregator.source_count(),
            "Weather service ready"
        );

        Ok(Self {
            scheduler,
            aggregator,
            log,
            settings: config.batch.clone(),
            epoch: Instant::now(),
        })
    }

    /// Current temperature at `location`, averaged over all sources.
    ///
    /// # Errors
    ///
    /// [`WeatherError::InvalidLocation`] for blank input; otherwise whatever
    /// the shared fetch failed with.
    pub async fn get_weather(&self, location: &str) -> Result<WeatherResponse, WeatherError> {
        let location = location.trim();
        if location.is_empty() {
            return Err(WeatherError::InvalidLocation);
        }
        let key = location.to_lowercase();

        let now = i64::try_from(self.epoch.elapsed().as_millis()).unwrap_or(i64::MAX);
        let window_ms = i64::try_from(self.settings.window_ms).unwrap_or(i64::MAX);

        let aggregator = self.aggregator.clone();
        let requested = location.to_string();
        let report = self
            .scheduler
            .execute_coalesced(
                &key,
                now,
                window_ms,
                self.settings.max_batch_size,
                move || async move { aggregator.fetch(&requested).await },
            )
            .await?;

        Ok(WeatherResponse {
            location: report.location,
            temperature: report.temperature,
        })
    }

    pub fn query_log(&self) -> &Arc<QueryLog> {
        &self.log
    }

    pub fn scheduler(&self) -> &BatchScheduler<WeatherReport, WeatherError> {
        &self.scheduler
    }

    /// Flush open batches. Returns how many were settled early.
    pub fn shutdown(&self) -> usize {
        self.scheduler.shutdown()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_rejects_invalid_config() {
        let mut config = Config::default();
        config.batch.window_ms = 0;

        let result = WeatherService::new(&config, Vec::new());
        assert!(matches!(result, Err(ConfigError::Invalid(msg)) if msg.contains("window")));
    }

    #[tokio::test]
    async fn test_blank_location_is_rejected() {
        let service = WeatherService::new(&Config::default(), Vec::new()).unwrap();

        assert_eq!(
            service.get_weather("   ").await,
            Err(WeatherError::InvalidLocation)
        );
        assert_eq!(service.scheduler().pending_batches(), 0);
    }

    #[tokio::test]
    async fn test_no_sources_surfaces_through_batch() {
        let mut config = Config::default();
        config.batch.max_batch_size = 1;
        let service = WeatherService::new(&config, Vec::new()).unwrap();

        assert_eq!(
            service.get_weather("Lima").await,
            Err(WeatherError::NoSources)
        );
    }
}
