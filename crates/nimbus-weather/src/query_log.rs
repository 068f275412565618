//! In-memory log of weather fetches.
//!
//! Every aggregated fetch writes one record. Once the batch that produced it
//! settles, the record's request count is set to the number of callers that
//! shared the fetch.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{SourceReading, WeatherError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryRecord {
    pub id: Uuid,
    pub location: String,
    pub temperature: f64,
    pub readings: Vec<SourceReading>,
    /// Callers served by this fetch; 0 until the batch settles
    pub request_count: u32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct QueryLog {
    records: RwLock<HashMap<Uuid, QueryRecord>>,
}

impl QueryLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a new record and return its id
    pub fn record(&self, location: &str, temperature: f64, readings: Vec<SourceReading>) -> Uuid {
        let record = QueryRecord {
            id: Uuid::new_v4(),
            location: location.to_string(),
            temperature,
            readings,
            request_count: 0,
            created_at: Utc::now(),
        };
        let id = record.id;

        tracing::debug!(%id, location, temperature, "Recorded weather query");
        self.records.write().insert(id, record);
        id
    }

    /// Set how many callers were served by the record's fetch.
    ///
    /// # Errors
    ///
    /// [`WeatherError::LogNotFound`] if `id` is malformed or unknown.
    pub fn update_request_count(&self, id: &str, count: u32) -> Result<(), WeatherError> {
        let uuid = Uuid::parse_str(id).map_err(|_| WeatherError::LogNotFound(id.to_string()))?;

        let mut records = self.records.write();
        let record = records
            .get_mut(&uuid)
            .ok_or_else(|| WeatherError::LogNotFound(id.to_string()))?;
        record.request_count = count;

        tracing::debug!(%uuid, count, "Updated query request count");
        Ok(())
    }

    pub fn get(&self, id: &Uuid) -> Option<QueryRecord> {
        self.records.read().get(id).cloned()
    }

    /// All records, oldest first
    pub fn records(&self) -> Vec<QueryRecord> {
        let mut records: Vec<_> = self.records.read().values().cloned().collect();
        records.sort_by_key(|r| r.created_at);
        records
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}
