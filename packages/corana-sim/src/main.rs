//! main.rs — corana-sim demo entry point
//!
//! Runs a complete, single-process correlation pipeline against synthetic
//! 120 Hz detector frames: builds a rank layout on one fake host, spawns
//! `num_servers` [`SyntheticSource`]s, and drives `corana_core::runtime::run`
//! to completion, logging published updates as they arrive.

use std::collections::BTreeMap;

use clap::Parser;
use corana_core::colors::Colors;
use corana_core::config::RunConfig;
use corana_core::publisher::{Publisher, TracingPublisher};
use corana_core::runtime::{self, RunInputs};
use corana_sim::{SimConfig, SyntheticSource};

#[derive(Parser, Debug)]
#[command(name = "corana-sim", about = "Synthetic demo run of the corana correlation pipeline")]
struct Args {
    /// Number of server ranks generating synthetic frames.
    #[arg(long, default_value_t = 2)]
    num_servers: usize,
    /// Number of worker ranks the mask is partitioned across.
    #[arg(long, default_value_t = 2)]
    num_workers: usize,
    /// Flattened detector length.
    #[arg(long, default_value_t = 64)]
    detector_len: usize,
    /// Ring buffer capacity (frames retained per worker).
    #[arg(long, default_value_t = 32)]
    times: usize,
    /// Total 120 Hz ticks to generate before stopping.
    #[arg(long, default_value_t = 600)]
    total_ticks: usize,
    /// Events between UPDATE broadcasts.
    #[arg(long, default_value_t = 50)]
    update: u64,
    /// Append published updates to this JSONL file in addition to logging them.
    #[arg(long)]
    jsonl_out: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "corana_sim=info,corana_core=info".into()),
        )
        .init();

    let args = Args::parse();
    let world_size = (args.num_servers + args.num_workers + 2) as i32; // +master +viewer

    let config_json = serde_json::json!({
        "dataset": "corana-sim", "src": "synthetic", "psanaType": "ndarray",
        "ndarrayProducerOutKey": "calib", "ndarrayCalibOutKey": "calib",
        "psanaOptions": {}, "outputArrayType": "float32", "workerStoreDtype": "float32",
        "maskNdarrayCoords": (0..args.detector_len).collect::<Vec<_>>(),
        "testMaskNdarrayCoords": (0..args.detector_len).collect::<Vec<_>>(),
        "numServers": args.num_servers, "serverHosts": [],
        "times": args.times, "update": args.update,
        "delays": [1, 2, 3, 5, 8],
        "h5output": "/dev/null", "testH5output": "/dev/null", "overwrite": true,
        "verbosity": "info", "numEvents": 0, "testNumEvents": 0,
        "userClass": "IncrementalAccumulator", "detectorLen": args.detector_len,
    });
    let config = RunConfig::from_json(&config_json)?;
    config.validate()?;

    let mut hosts = BTreeMap::new();
    hosts.insert("localhost".to_string(), (0..world_size).collect());
    let layout = runtime::build_layout(world_size, &hosts, &config, false)?;

    tracing::info!(
        world_size,
        num_servers = args.num_servers,
        num_workers = layout.num_workers(),
        "starting synthetic run"
    );

    let sources: Vec<Box<dyn corana_core::datasource::DataSource>> = SimConfig::split(
        args.num_servers,
        args.detector_len,
        args.total_ticks,
        None,
        42,
    )
    .into_iter()
    .map(|c| Box::new(SyntheticSource::new(c)) as Box<dyn corana_core::datasource::DataSource>)
    .collect();

    let colors = Colors::new(
        vec![1; args.detector_len],
        vec![1; args.detector_len],
        1,
        1,
    )?;

    let publisher: Box<dyn Publisher> = match args.jsonl_out {
        Some(path) => Box::new(TracingPublisher::new(Some(path.into()))),
        None => Box::new(TracingPublisher::new(None)),
    };

    let inputs = RunInputs { sources, colors, publisher };
    runtime::run(layout, config, inputs).await?;

    tracing::info!("synthetic run complete");
    Ok(())
}
