//! Output module for change events and store reports
//!
//! This module handles:
//! - Delivering change events to sinks (log lines, JSON-lines files)
//! - Running the event consumer task that drains the coordinator's channel
//! - Printing store statistics and cycle reports

mod jsonl;
pub mod stats;
mod traits;

pub use jsonl::JsonLinesSink;
pub use stats::{load_statistics, print_cycle_report, print_statistics, StoreStatistics};
pub use traits::{EventSink, OutputError, OutputResult};

use crate::storage::ChangeEvent;
use tokio::sync::mpsc;

/// Logs every change event except `Unchanged` at info level
#[derive(Debug, Default)]
pub struct LogSink;

impl EventSink for LogSink {
    fn name(&self) -> &'static str {
        "log"
    }

    fn record_event(&mut self, event: &ChangeEvent) -> OutputResult<()> {
        match event {
            ChangeEvent::New(record) => tracing::info!(
                source_id = %record.source_id,
                price = record.current_price,
                currency = %record.currency,
                "New listing"
            ),
            ChangeEvent::PriceChanged {
                old_price,
                new_price,
                record,
            } => tracing::info!(
                source_id = %record.source_id,
                old_price,
                new_price,
                "Price changed"
            ),
            ChangeEvent::FieldsChanged { diff, record } => {
                let fields: Vec<&str> = diff.iter().map(|change| change.field.as_str()).collect();
                tracing::info!(
                    source_id = %record.source_id,
                    fields = %fields.join(","),
                    "Listing fields changed"
                )
            }
            ChangeEvent::Unchanged { source_id } => {
                tracing::trace!(source_id = %source_id, "Listing unchanged")
            }
            ChangeEvent::Removed { source_id } => {
                tracing::info!(source_id = %source_id, "Listing removed")
            }
        }
        Ok(())
    }
}

/// Drains the event channel into every sink until all senders are dropped
///
/// A sink that fails is logged and skipped for that event; the others still
/// receive it. Sinks are flushed whenever the channel runs dry.
///
/// # Returns
///
/// The number of events consumed
pub async fn consume_events(
    mut events: mpsc::Receiver<ChangeEvent>,
    mut sinks: Vec<Box<dyn EventSink>>,
) -> u64 {
    let mut consumed = 0;

    while let Some(event) = events.recv().await {
        deliver(&mut sinks, &event);
        consumed += 1;

        // Drain whatever is already buffered before flushing
        while let Ok(event) = events.try_recv() {
            deliver(&mut sinks, &event);
            consumed += 1;
        }
        flush_all(&mut sinks);
    }

    flush_all(&mut sinks);
    tracing::debug!(consumed, "Event consumer finished");
    consumed
}

fn deliver(sinks: &mut [Box<dyn EventSink>], event: &ChangeEvent) {
    for sink in sinks.iter_mut() {
        if let Err(e) = sink.record_event(event) {
            tracing::error!(
                sink = sink.name(),
                source_id = event.source_id(),
                error = %e,
                "Failed to record change event"
            );
        }
    }
}

fn flush_all(sinks: &mut [Box<dyn EventSink>]) {
    for sink in sinks.iter_mut() {
        if let Err(e) = sink.flush() {
            tracing::error!(sink = sink.name(), error = %e, "Failed to flush event sink");
        }
    }
}
