//! Write-only telemetry sink.
//!
//! One [`TelemetryEvent`] is emitted per dispatched item. Emitting never
//! blocks and never fails: the JSON-lines sink hands events to a bounded
//! channel drained by a background writer and drops (with a warning) when
//! the channel is full or the writer is gone.

use crate::models::{ExtractionMethod, ItemId, Stage};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Default capacity of the JSON-lines sink's channel.
pub const DEFAULT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetryEvent {
    pub at: DateTime<Utc>,
    pub stage: Stage,
    pub item_id: ItemId,
    pub domain: String,
    /// Disposition or extraction status, snake_case.
    pub outcome: String,
    pub response_bytes: usize,
    pub elapsed_ms: u64,
    /// Extraction strategy that contributed the body, when there was one.
    pub strategy: Option<ExtractionMethod>,
}

pub trait TelemetrySink: Send + Sync {
    fn emit(&self, event: TelemetryEvent);
}

/// Logs events at debug level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl TelemetrySink for TracingSink {
    fn emit(&self, event: TelemetryEvent) {
        tracing::debug!(
            target: "telemetry",
            stage = %event.stage,
            item_id = event.item_id,
            domain = %event.domain,
            outcome = %event.outcome,
            response_bytes = event.response_bytes,
            elapsed_ms = event.elapsed_ms,
            strategy = ?event.strategy,
            "Item dispatched"
        );
    }
}

/// Appends events as JSON lines through a background writer.
#[derive(Debug)]
pub struct JsonLinesSink {
    tx: mpsc::Sender<TelemetryEvent>,
    dropped: AtomicU64,
}

impl JsonLinesSink {
    /// A sink and the receiving end its writer drains.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<TelemetryEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx,
                dropped: AtomicU64::new(0),
            },
            rx,
        )
    }

    /// A sink appending to `path`, with its writer task already running.
    /// The writer exits once the sink is dropped and the channel is drained.
    pub async fn spawn(path: &str, capacity: usize) -> std::io::Result<(Self, JoinHandle<()>)> {
        let file = OpenOptions::new().create(true).append(true).open(path).await?;
        let (sink, rx) = Self::new(capacity);
        info!(path, capacity, "Writing telemetry as JSON lines");
        Ok((sink, tokio::spawn(write_lines(file, rx))))
    }

    /// Events dropped because the channel was full or closed.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl TelemetrySink for JsonLinesSink {
    fn emit(&self, event: TelemetryEvent) {
        if let Err(e) = self.tx.try_send(event) {
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            warn!(dropped, error = %e, "Telemetry event dropped");
        }
    }
}

async fn write_lines(mut file: tokio::fs::File, mut rx: mpsc::Receiver<TelemetryEvent>) {
    while let Some(event) = rx.recv().await {
        let mut line = match serde_json::to_string(&event) {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "Failed to serialise telemetry event");
                continue;
            }
        };
        line.push('\n');
        if let Err(e) = file.write_all(line.as_bytes()).await {
            warn!(error = %e, "Failed to write telemetry event");
        }
    }
    if let Err(e) = file.flush().await {
        warn!(error = %e, "Failed to flush telemetry file");
    }
}

/// Keeps events in memory.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct MemorySink {
    pub events: parking_lot::Mutex<Vec<TelemetryEvent>>,
}

#[cfg(test)]
impl TelemetrySink for MemorySink {
    fn emit(&self, event: TelemetryEvent) {
        self.events.lock().push(event);
    }
}
