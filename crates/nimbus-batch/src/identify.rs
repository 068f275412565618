//! Completion reporting types.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Optional capability on a batch result: an identifier that lets the
/// completion notifier tie the batch back to a record elsewhere.
///
/// Batching never looks at the id. Results that return `None` settle
/// normally but are never reported.
pub trait Identifiable {
    fn batch_id(&self) -> Option<&str> {
        None
    }
}

impl<T: Identifiable> Identifiable for Arc<T> {
    fn batch_id(&self) -> Option<&str> {
        (**self).batch_id()
    }
}

/// What settled a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchTrigger {
    /// Participant count reached the batch's maximum size
    SizeReached,
    /// The batch window elapsed
    WindowElapsed,
    /// The scheduler was shut down while the batch was open
    Shutdown,
}

/// Reported once per settled batch whose result carries an id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchCompleted {
    pub id: String,
    pub participant_count: u32,
    pub trigger: BatchTrigger,
}

/// Callback invoked with every [`BatchCompleted`] report.
pub type CompletionNotifier = Arc<dyn Fn(BatchCompleted) + Send + Sync>;
