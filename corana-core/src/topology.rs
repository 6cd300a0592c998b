//! Rank and communicator layout (§4.1): host-aware placement of server
//! ranks, derivation of the viewer/master/worker ranks from what's left,
//! and construction of the channel-based communicator equivalents each
//! role needs.
//!
//! Grounded on `CommSystem.identifyServerRanks` / `roundRobin` /
//! `identifyCommSubsystems`. Where the source does an MPI allgather of
//! hostnames and a `Group.Excl` to build sub-communicators, this crate
//! takes the host list as an input (the caller already knows its
//! deployment topology) and builds channel bundles instead of MPI groups.

use std::collections::BTreeMap;

use crate::error::{CoranaError, Result};
use crate::mask::Partition;

/// One rank's host, as reported at startup. In the source this comes from
/// an MPI allgather; here it is supplied by whatever assigns ranks to
/// hosts (a config file, a scheduler, or — in tests — a fixture).
pub type Rank = i32;

/// Round-robins over the sorted keys of `dict_data`, collecting up to `n`
/// values total (one per key per pass), wrapping until `n` are collected
/// or every key is exhausted. Mirrors `CommSystem.roundRobin`.
pub fn round_robin<K: Ord + Clone, V: Clone>(
    n: usize,
    dict_data: &BTreeMap<K, Vec<V>>,
) -> Vec<V> {
    let mut cursors: BTreeMap<K, usize> = dict_data.keys().cloned().map(|k| (k, 0)).collect();
    let mut out = Vec::with_capacity(n);
    let mut stalled = false;
    while out.len() < n && !stalled {
        stalled = true;
        for (key, values) in dict_data {
            if out.len() >= n {
                break;
            }
            let cursor = cursors.get_mut(key).unwrap();
            if *cursor < values.len() {
                out.push(values[*cursor].clone());
                *cursor += 1;
                stalled = false;
            }
        }
    }
    out
}

/// Selects `num_servers` ranks by host-aware round robin.
///
/// `ranks_by_host` maps host name to the ranks running on it. `preferred`
/// is an optional priority host list (non-empty restricts candidates to
/// those hosts, warning about any preferred host that is absent). Rank 0
/// is dropped from consideration when `exclude_rank0` is set.
pub fn identify_server_ranks(
    ranks_by_host: &BTreeMap<String, Vec<Rank>>,
    num_servers: usize,
    preferred: &[String],
    exclude_rank0: bool,
) -> Result<Vec<Rank>> {
    let mut candidates: BTreeMap<String, Vec<Rank>> = if preferred.is_empty() {
        ranks_by_host.clone()
    } else {
        let mut m = BTreeMap::new();
        for host in preferred {
            match ranks_by_host.get(host) {
                Some(ranks) => { m.insert(host.clone(), ranks.clone()); }
                None => tracing::warn!("preferred server host {host:?} not present in this run"),
            }
        }
        m
    };

    if exclude_rank0 {
        for ranks in candidates.values_mut() {
            ranks.retain(|&r| r != 0);
        }
        candidates.retain(|_, ranks| !ranks.is_empty());
    }

    let total_available: usize = candidates.values().map(|v| v.len()).sum();
    if total_available < num_servers {
        return Err(CoranaError::Topology(format!(
            "requested {num_servers} server ranks but only {total_available} candidate ranks available"
        )));
    }

    let chosen = round_robin(num_servers, &candidates);
    if chosen.len() != num_servers {
        return Err(CoranaError::Topology(
            "server rank selection stalled before reaching the requested count".into(),
        ));
    }
    Ok(chosen)
}

/// The full rank layout for a run: which ranks are servers, which is the
/// viewer, which is the master, and which are workers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommLayout {
    pub world_size: i32,
    pub server_ranks: Vec<Rank>,
    pub viewer_rank: Rank,
    pub master_rank: Rank,
    pub worker_ranks: Vec<Rank>,
}

impl CommLayout {
    /// From a fixed world size and a chosen set of server ranks: the
    /// lowest remaining rank becomes viewer, the next lowest becomes
    /// master, the rest become workers. Mirrors
    /// `identifyCommSubsystems`.
    pub fn new(world_size: i32, server_ranks: Vec<Rank>) -> Result<Self> {
        if world_size < 4 {
            return Err(CoranaError::Topology(format!(
                "world size {world_size} < 4 (need at least server+master+viewer+worker)"
            )));
        }
        let num_servers = server_ranks.len();
        if (world_size as usize) < num_servers + 3 {
            return Err(CoranaError::Topology(format!(
                "world size {world_size} minus {num_servers} servers leaves fewer than 3 ranks for master+viewer+worker"
            )));
        }
        let server_set: std::collections::HashSet<Rank> = server_ranks.iter().copied().collect();
        if server_set.len() != server_ranks.len() {
            return Err(CoranaError::Topology("duplicate server rank requested".into()));
        }

        let mut remaining: Vec<Rank> = (0..world_size).filter(|r| !server_set.contains(r)).collect();
        remaining.sort_unstable();

        let viewer_rank = remaining[0];
        let master_rank = remaining[1];
        let worker_ranks = remaining[2..].to_vec();

        Ok(Self { world_size, server_ranks, viewer_rank, master_rank, worker_ranks })
    }

    pub fn num_workers(&self) -> usize { self.worker_ranks.len() }

    /// The mask partition across the worker ranks, in rank order.
    pub fn mask_partition(&self, masked_len: usize) -> Result<Partition> {
        Partition::balanced(masked_len, self.num_workers())
    }
}
