//! Run orchestration: wires a [`crate::topology::CommLayout`], a set of
//! channel endpoints, and the four role loops together into one run, and
//! owns the shared world-abort primitive (§4.3 Abort, §5 Cancellation).
//!
//! Grounded on the teacher's `main.rs` startup sequence (logging init,
//! spawn every long-running task, await them all) generalized from "one
//! HTTP server plus a handful of background loops" to "one task per rank
//! in a fixed topology".

use std::collections::BTreeMap;

use tokio_util::sync::CancellationToken;

use crate::channels::build_channels;
use crate::colors::Colors;
use crate::config::RunConfig;
use crate::counter::UniformStride;
use crate::datasource::DataSource;
use crate::error::{CoranaError, Result};
use crate::g2::build_engine;
use crate::master::{run_master, MasterConfig, SelectionMode};
use crate::publisher::Publisher;
use crate::server::{run_server, ServerConfig};
use crate::topology::{identify_server_ranks, CommLayout, Rank};
use crate::viewer::{run_viewer, ViewerConfig};
use crate::worker::{run_worker, WorkerConfig};

/// The shared cancellation primitive every task's `select!` observes
/// alongside its normal channel operations (§5 Cancellation). Cancelling
/// it is this crate's equivalent of the source's world-abort: every rank
/// unwinds on its next poll rather than being torn down by the runtime.
#[derive(Clone)]
pub struct WorldAbort(CancellationToken);

impl WorldAbort {
    pub fn new() -> Self { Self(CancellationToken::new()) }

    /// Cancels the token, logging `reason` once at `error` level — the
    /// single place a catastrophic failure becomes visible before every
    /// task unwinds on its next `select!` poll.
    pub fn trigger(&self, reason: impl std::fmt::Display) {
        tracing::error!(%reason, "world abort triggered");
        self.0.cancel();
    }

    pub fn token(&self) -> CancellationToken { self.0.clone() }
    pub fn is_cancelled(&self) -> bool { self.0.is_cancelled() }
}

impl Default for WorldAbort {
    fn default() -> Self { Self::new() }
}

/// Derives the full rank layout (§4.1) from a reported host→ranks map and
/// a run configuration: selects server ranks by host-aware round robin,
/// then assigns viewer/master/worker from what remains.
pub fn build_layout(
    world_size: i32,
    ranks_by_host: &BTreeMap<String, Vec<Rank>>,
    config: &RunConfig,
    exclude_rank0: bool,
) -> Result<CommLayout> {
    let server_ranks = identify_server_ranks(
        ranks_by_host,
        config.num_servers,
        &config.server_hosts,
        exclude_rank0,
    )?;
    CommLayout::new(world_size, server_ranks)
}

/// Everything [`run`] needs beyond the layout and config: one data
/// source per server (same order as `layout.server_ranks`), the loaded
/// color labelings, and where the viewer publishes to.
pub struct RunInputs {
    pub sources: Vec<Box<dyn DataSource>>,
    pub colors: Colors,
    pub publisher: Box<dyn Publisher>,
}

/// Spawns every rank's task from `layout`/`config`/`inputs` and runs the
/// whole topology to completion (every server's data exhausted, or an
/// abort). Returns the first error any rank hit, if any.
pub async fn run(layout: CommLayout, config: RunConfig, inputs: RunInputs) -> Result<()> {
    if inputs.sources.len() != layout.server_ranks.len() {
        return Err(CoranaError::Configuration(format!(
            "{} data sources supplied but layout has {} server ranks",
            inputs.sources.len(),
            layout.server_ranks.len()
        )));
    }

    let masked_len = config.mask_ndarray_coords.len();
    let partition = layout.mask_partition(masked_len)?;
    let abort = WorldAbort::new();

    let mut channels = build_channels(&layout);

    let mut tasks = tokio::task::JoinSet::new();

    let selection_mode = if config.servers_round_robin {
        SelectionMode::RoundRobin
    } else {
        SelectionMode::StrictTimeOrder
    };
    let master_config = MasterConfig {
        selection_mode,
        update_interval: config.update,
        data_rate_log_interval: config.data_rate_log_interval,
    };
    let master_endpoints = channels.master;
    let master_rank = layout.master_rank;
    let master_abort = abort.token();
    let schedule: UniformStride = UniformStride { stride: 3 };
    tasks.spawn(run_role("master", master_rank, run_master(master_endpoints, master_config, schedule, master_abort)));

    for (server_endpoints, source) in channels.servers.drain(..).zip(inputs.sources) {
        let rank = server_endpoints.rank;
        let server_config = ServerConfig { mask_coords: config.mask_ndarray_coords.clone(), partition: partition.clone() };
        let server_abort = abort.token();
        tasks.spawn(run_role("server", rank, run_server(server_endpoints, source, server_config, server_abort)));
    }

    for (idx, worker_endpoints) in channels.workers.drain(..).enumerate() {
        let rank = worker_endpoints.rank;
        let m_w = partition.counts[idx];
        let engine = build_engine(config.user_class, config.delays.clone(), m_w);
        let worker_config = WorkerConfig {
            m_w,
            ring_capacity: config.times,
            saturated_value: config.saturated_value,
            notzero: config.notzero,
        };
        let worker_abort = abort.token();
        tasks.spawn(run_role("worker", rank, run_worker(worker_endpoints, worker_config, engine, worker_abort)));
    }

    let viewer_rank = layout.viewer_rank;
    let viewer_config = ViewerConfig {
        delays: config.delays.clone(),
        partition: partition.clone(),
        worker_ranks: layout.worker_ranks.clone(),
        masked_len,
    };
    let viewer_abort = abort.token();
    tasks.spawn(run_role(
        "viewer",
        viewer_rank,
        run_viewer(channels.viewer, viewer_config, inputs.colors, inputs.publisher, viewer_abort),
    ));

    let mut first_error: Option<CoranaError> = None;
    while let Some(outcome) = tasks.join_next().await {
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                abort.trigger(&err);
                first_error.get_or_insert(err);
            }
            Err(join_err) => {
                let err = CoranaError::Invariant(format!("rank task panicked: {join_err}"));
                abort.trigger(&err);
                first_error.get_or_insert(err);
            }
        }
    }

    match first_error {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// Runs a role's task under a span carrying `role`/`rank` for its full
/// lifetime, mirroring the source's per-role logger prefix (`master-
/// rnk:N`, `worker-rnk:N`, ...).
async fn run_role(role: &'static str, rank: Rank, fut: impl std::future::Future<Output = Result<()>>) -> Result<()> {
    use tracing::Instrument;
    fut.instrument(tracing::info_span!("rank", role, rank)).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_layout_selects_servers_then_derives_roles() {
        let mut hosts = BTreeMap::new();
        hosts.insert("host-a".to_string(), vec![0, 1, 2, 3, 4, 5]);
        let config_json = serde_json::json!({
            "dataset": "x", "src": "x", "psanaType": "x", "ndarrayProducerOutKey": "x",
            "ndarrayCalibOutKey": "x", "psanaOptions": {}, "outputArrayType": "x",
            "workerStoreDtype": "x", "maskNdarrayCoords": [0,1,2,3], "testMaskNdarrayCoords": [],
            "numServers": 2, "serverHosts": [], "times": 10, "update": 0, "delays": [1],
            "h5output": "x", "testH5output": "x", "overwrite": false, "verbosity": "info",
            "numEvents": 0, "testNumEvents": 0, "userClass": "AtEnd", "detectorLen": 4,
        });
        let config = RunConfig::from_json(&config_json).unwrap();
        let layout = build_layout(6, &hosts, &config, false).unwrap();
        assert_eq!(layout.server_ranks.len(), 2);
        assert_eq!(layout.num_workers(), 2);
    }
}
