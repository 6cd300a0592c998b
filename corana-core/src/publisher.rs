//! The viewer's publish sink (§6). Out of scope as a feature (no HDF5 or
//! plotting transport is implemented), but the trait boundary and a
//! reference implementation are provided so the demo binary and the
//! integration tests have somewhere real to send results.

use async_trait::async_trait;
use corana_types::{Counter, EventId};
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;

use crate::error::{CoranaError, Result};

/// One delay's normalized result, ready for a sink: the per-color scalar
/// curve value for this delay, plus the pair count it was normalized by.
#[derive(Debug, Clone, serde::Serialize)]
pub struct DelayPoint {
    pub delay: i64,
    pub counts: i64,
    pub per_color_curve: Vec<(i32, f32)>,
}

/// Everything the viewer hands a sink at one UPDATE.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PublishedUpdate {
    pub counter: Counter,
    pub latest_event: EventId,
    pub points: Vec<DelayPoint>,
    pub newly_retired_colors: usize,
    pub newly_retired_pixels: usize,
}

/// Absorbs published updates and persists or displays them. The source's
/// counterpart writes HDF5 and feeds a psmon plot; this crate's reference
/// implementation logs a human-readable summary and optionally appends a
/// JSON-lines record, standing in for that persistence layer.
#[async_trait]
pub trait Publisher: Send {
    async fn publish(&mut self, update: PublishedUpdate) -> Result<()>;

    /// Called once when the viewer receives END; default is a no-op.
    async fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Logs each update at `info` level and, if configured with a path,
/// appends one JSON object per line to a file.
pub struct TracingPublisher {
    jsonl_path: Option<PathBuf>,
    file: Option<tokio::fs::File>,
}

impl TracingPublisher {
    pub fn new(jsonl_path: Option<PathBuf>) -> Self {
        Self { jsonl_path, file: None }
    }

    async fn ensure_file(&mut self) -> Result<()> {
        if self.file.is_some() {
            return Ok(());
        }
        if let Some(path) = &self.jsonl_path {
            let file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .await
                .map_err(|e| CoranaError::Data(format!("failed to open publish sink {path:?}: {e}")))?;
            self.file = Some(file);
        }
        Ok(())
    }
}

#[async_trait]
impl Publisher for TracingPublisher {
    async fn publish(&mut self, update: PublishedUpdate) -> Result<()> {
        tracing::info!(
            counter = update.counter,
            event = ?update.latest_event,
            points = update.points.len(),
            retired_colors = update.newly_retired_colors,
            retired_pixels = update.newly_retired_pixels,
            "published update"
        );

        self.ensure_file().await?;
        if let Some(file) = &mut self.file {
            let line = serde_json::to_string(&update)
                .map_err(|e| CoranaError::Data(format!("failed to serialize update: {e}")))?;
            file.write_all(line.as_bytes())
                .await
                .map_err(|e| CoranaError::Data(format!("failed to append to publish sink: {e}")))?;
            file.write_all(b"\n")
                .await
                .map_err(|e| CoranaError::Data(format!("failed to append to publish sink: {e}")))?;
        }
        Ok(())
    }

    async fn finish(&mut self) -> Result<()> {
        tracing::info!("publish sink closing");
        Ok(())
    }
}
