//! Request coalescing for Nimbus
//!
//! Concurrent calls that share a key are grouped into one batch within a
//! time window. A batch runs its factory once, settles when the window
//! elapses or when enough participants have joined, and hands the same
//! outcome to every participant.

pub mod config;
pub mod error;
pub mod identify;
pub mod scheduler;
pub mod timer;

pub use config::SchedulerConfig;
pub use error::BatchError;
pub use identify::{BatchCompleted, BatchTrigger, Identifiable};
pub use scheduler::{BatchScheduler, SchedulerStats};
pub use timer::{Timer, TimerCallback, TimerHandle, TokioTimer};
