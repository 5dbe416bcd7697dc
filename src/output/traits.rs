//! Event sink trait and output errors
//!
//! A sink receives every change event the coordinator emits, in emission
//! order. Sinks run on the event consumer task, never on the coordinator.

use crate::storage::ChangeEvent;
use thiserror::Error;

/// Errors that can occur during output operations
#[derive(Debug, Error)]
pub enum OutputError {
    #[error("Failed to serialize event: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for output operations
pub type OutputResult<T> = Result<T, OutputError>;

/// Trait for consumers of change events
pub trait EventSink: Send {
    /// Short name used in log messages
    fn name(&self) -> &'static str;

    /// Records a single change event
    fn record_event(&mut self, event: &ChangeEvent) -> OutputResult<()>;

    /// Flushes buffered output
    ///
    /// Called when the event stream pauses and when it closes.
    fn flush(&mut self) -> OutputResult<()> {
        Ok(())
    }
}
