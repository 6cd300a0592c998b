//! main.rs — corana entry point
//!
//! Reads a run configuration and one newline-delimited JSON frame file per
//! server rank, runs the full rank topology to completion, and logs
//! published updates. The NDJSON reader stands in for the real detector
//! I/O adapter (§6 `DataSource` is out of scope); it exists so this binary
//! is runnable end to end without a specific facility's acquisition stack.

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use clap::Parser;
use corana_core::colors::Colors;
use corana_core::config::RunConfig;
use corana_core::datasource::{DataSource, Frame};
use corana_core::error::{CoranaError, Result};
use corana_core::publisher::{Publisher, TracingPublisher};
use corana_core::runtime::{self, RunInputs};
use corana_types::EventId;
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Parser, Debug)]
#[command(name = "corana", about = "Distributed 120 Hz detector-frame correlation pipeline")]
struct Args {
    /// Path to the run configuration JSON document.
    #[arg(long)]
    config: PathBuf,
    /// One NDJSON frame file per server rank, in rank order. Each line is
    /// `{"sec":i32,"nsec":i32,"fid":i32,"data":[f32,...]}`.
    #[arg(long, num_args = 1.., required = true)]
    frames: Vec<PathBuf>,
    /// Append published updates to this JSONL file in addition to logging them.
    #[arg(long)]
    jsonl_out: Option<PathBuf>,
}

/// Reads frames from one NDJSON file, one line at a time, exhausting to
/// `None` at EOF. Malformed lines are a hard configuration error rather
/// than being skipped, since a detector file truncated mid-record usually
/// means something upstream already failed.
struct JsonlFrameSource {
    lines: tokio::io::Lines<BufReader<tokio::fs::File>>,
}

impl JsonlFrameSource {
    async fn open(path: &PathBuf) -> Result<Self> {
        let file = tokio::fs::File::open(path)
            .await
            .map_err(|e| CoranaError::Data(format!("failed to open frame file {path:?}: {e}")))?;
        Ok(Self { lines: BufReader::new(file).lines() })
    }
}

#[derive(serde::Deserialize)]
struct FrameRecord {
    sec: i32,
    nsec: i32,
    fid: i32,
    data: Vec<f32>,
}

#[async_trait]
impl DataSource for JsonlFrameSource {
    async fn next_frame(&mut self) -> Result<Option<Frame>> {
        loop {
            let line = self
                .lines
                .next_line()
                .await
                .map_err(|e| CoranaError::Data(format!("failed to read frame file: {e}")))?;
            let Some(line) = line else { return Ok(None) };
            if line.trim().is_empty() {
                continue;
            }
            let record: FrameRecord = serde_json::from_str(&line)
                .map_err(|e| CoranaError::Data(format!("malformed frame record: {e}")))?;
            return Ok(Some(Frame {
                event: EventId::new(record.sec, record.nsec, record.fid),
                data: record.data,
            }));
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "corana_core=info".into()))
        .init();

    let args = Args::parse();

    let raw = tokio::fs::read_to_string(&args.config).await?;
    let raw_json: serde_json::Value = serde_json::from_str(&raw)?;
    let config = RunConfig::from_json(&raw_json)?;
    config.validate()?;

    if args.frames.len() != config.num_servers {
        anyhow::bail!(
            "got {} frame files but numServers={} in config",
            args.frames.len(),
            config.num_servers
        );
    }

    // One worker per server plus the fixed master/viewer ranks; a real
    // deployment's host/rank map decides this instead of a CLI binary.
    let world_size = (config.num_servers * 2 + 2) as i32;
    let mut hosts = BTreeMap::new();
    hosts.insert("localhost".to_string(), (0..world_size).collect());
    let layout = runtime::build_layout(world_size, &hosts, &config, false)?;

    let mut sources: Vec<Box<dyn DataSource>> = Vec::with_capacity(args.frames.len());
    for path in &args.frames {
        sources.push(Box::new(JsonlFrameSource::open(path).await?));
    }

    let colors = Colors::new(
        vec![1; config.mask_ndarray_coords.len()],
        vec![1; config.mask_ndarray_coords.len()],
        1,
        1,
    )?;

    let publisher: Box<dyn Publisher> = Box::new(TracingPublisher::new(args.jsonl_out));

    let inputs = RunInputs { sources, colors, publisher };

    tracing::info!(world_size, num_servers = config.num_servers, "starting run");
    runtime::run(layout, config, inputs).await?;
    tracing::info!("run complete");
    Ok(())
}
