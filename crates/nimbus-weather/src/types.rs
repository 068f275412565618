use nimbus_batch::{BatchError, Identifiable};
use serde::{Deserialize, Serialize};

/// One source's contribution to a weather report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceReading {
    pub source: String,
    pub temperature: f64,
}

/// Result of one aggregated fetch, shared by every coalesced caller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeatherReport {
    pub location: String,
    /// Mean of all successful readings, in degrees Celsius
    pub temperature: f64,
    pub readings: Vec<SourceReading>,
    /// Id of the query log record written for this fetch
    pub log_id: String,
}

impl Identifiable for WeatherReport {
    fn batch_id(&self) -> Option<&str> {
        Some(&self.log_id)
    }
}

/// What a caller of [`WeatherService`](crate::WeatherService) gets back
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeatherResponse {
    pub location: String,
    pub temperature: f64,
}

/// Errors raised by a single temperature source
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SourceError {
    #[error("Location not found: {0}")]
    LocationNotFound(String),
    #[error("Source unavailable: {0}")]
    Unavailable(String),
    #[error("Rate limited")]
    RateLimited,
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

/// Weather lookup errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum WeatherError {
    #[error("Location must not be empty")]
    InvalidLocation,
    #[error("Location not found: {0}")]
    LocationNotFound(String),
    #[error("All weather sources are unavailable for {location}")]
    AllSourcesUnavailable { location: String },
    #[error("No weather sources configured")]
    NoSources,
    #[error("Query log record not found: {0}")]
    LogNotFound(String),
    #[error("Request coalescing failed: {0}")]
    Coalescing(String),
}

impl WeatherError {
    pub fn user_message(&self) -> &'static str {
        match self {
            WeatherError::InvalidLocation => "Please enter a location.",
            WeatherError::LocationNotFound(_) => "Location not found. Check and try again.",
            WeatherError::AllSourcesUnavailable { .. } => {
                "Weather services are unavailable. Please try again later."
            }
            WeatherError::NoSources => "No weather services are configured.",
            WeatherError::LogNotFound(_) => "Weather history could not be updated.",
            WeatherError::Coalescing(_) => "Weather request failed. Please try again.",
        }
    }
}

impl From<BatchError<WeatherError>> for WeatherError {
    fn from(err: BatchError<WeatherError>) -> Self {
        match err.factory_error() {
            Some(inner) => inner.clone(),
            None => WeatherError::Coalescing(err.to_string()),
        }
    }
}
