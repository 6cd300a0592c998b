//! Channel topology (§4.1 communicators, §5 transport). Builds the fixed
//! set of `tokio` channel endpoints every rank needs, once at startup,
//! from a [`crate::topology::CommLayout`]. A "communicator" in the
//! original design becomes a bundle of channel endpoints handed to one
//! role's task; there is no runtime membership negotiation.

use std::collections::HashMap;

use tokio::sync::{broadcast, mpsc};

use corana_types::{MasterBroadcastMessage, MasterToServerMessage, ServerToMasterMessage};

use crate::topology::{CommLayout, Rank};

/// Bounded capacity used for every point-to-point channel in this crate.
/// Generous enough that a server's one-event keep-ahead (§4.2) never
/// blocks on a slow consumer under normal operation.
pub const CHANNEL_CAPACITY: usize = 64;

/// One server's scattered slice, addressed to a single worker. Carries no
/// counter: FIFO ordering on both the broadcast channel and this channel
/// guarantees a worker's next scatter arrival corresponds to the most
/// recently received NEW_EVENT broadcast, which is what carries the
/// counter (§5 ordering guarantees). `sender_rank` is included purely as
/// a protocol sanity check against that broadcast.
#[derive(Debug, Clone)]
pub struct ScatterChunk {
    pub sender_rank: Rank,
    pub data: Vec<f32>,
}

/// One worker's contribution to a gather, addressed to the viewer.
#[derive(Debug, Clone)]
pub struct GatherPayload {
    pub worker_rank: Rank,
    pub g2: Vec<f32>,
    pub if_: Vec<f32>,
    pub ip: Vec<f32>,
    pub counts: Vec<i64>,
    pub saturated: Vec<i8>,
}

pub struct MasterEndpoints {
    pub layout: CommLayout,
    pub broadcast_tx: broadcast::Sender<MasterBroadcastMessage>,
    pub from_servers_rx: mpsc::Receiver<ServerToMasterMessage>,
    /// Indexed the same as `layout.server_ranks`.
    pub to_servers_txs: Vec<mpsc::Sender<MasterToServerMessage>>,
    pub to_viewer_tx: mpsc::Sender<MasterBroadcastMessage>,
}

pub struct ServerEndpoints {
    pub rank: Rank,
    pub to_master_tx: mpsc::Sender<ServerToMasterMessage>,
    pub from_master_rx: mpsc::Receiver<MasterToServerMessage>,
    /// Indexed the same as `layout.worker_ranks`.
    pub scatter_txs: Vec<mpsc::Sender<ScatterChunk>>,
}

pub struct WorkerEndpoints {
    pub rank: Rank,
    pub broadcast_rx: broadcast::Receiver<MasterBroadcastMessage>,
    /// One dedicated receiver per server, keyed by the server's world
    /// rank. Each server-worker pair gets its own channel rather than a
    /// shared one: the master does not wait for one server's scatter to
    /// complete before dispatching the next server's SEND decision, so
    /// two servers can be scattering concurrently, and a shared channel
    /// would let their chunks interleave out of the order the matching
    /// NEW_EVENT broadcasts implied. Mirrors §4.1's "one per-server
    /// communicator: that server plus all workers".
    pub scatter_rxs: HashMap<Rank, mpsc::Receiver<ScatterChunk>>,
    pub gather_tx: mpsc::Sender<GatherPayload>,
}

pub struct ViewerEndpoints {
    pub rank: Rank,
    pub from_master_rx: mpsc::Receiver<MasterBroadcastMessage>,
    pub gather_rx: mpsc::Receiver<GatherPayload>,
}

pub struct ChannelSet {
    pub master: MasterEndpoints,
    pub servers: Vec<ServerEndpoints>,
    pub workers: Vec<WorkerEndpoints>,
    pub viewer: ViewerEndpoints,
}

/// Builds every channel a run needs from the rank layout. Called once at
/// startup by [`crate::runtime`].
pub fn build_channels(layout: &CommLayout) -> ChannelSet {
    let (broadcast_tx, _) = broadcast::channel(CHANNEL_CAPACITY.max(layout.worker_ranks.len() * 4));

    let (from_servers_tx, from_servers_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (to_viewer_tx, viewer_from_master_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (gather_tx, gather_rx) = mpsc::channel(CHANNEL_CAPACITY);

    let mut to_servers_txs = Vec::with_capacity(layout.server_ranks.len());
    let mut servers = Vec::with_capacity(layout.server_ranks.len());
    let mut per_server_from_master_rx = Vec::with_capacity(layout.server_ranks.len());
    for _ in &layout.server_ranks {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        to_servers_txs.push(tx);
        per_server_from_master_rx.push(rx);
    }

    // One dedicated channel per (server, worker) pair: `scatter_txs[s][w]`
    // feeds `scatter_rxs_by_worker[w][s]`. A server's `scatter_txs` is a
    // row of this matrix; a worker's `scatter_rxs` is a column, keyed by
    // server rank rather than position since a worker only ever looks up
    // the one channel named by the broadcast it just saw.
    let mut scatter_txs_by_server: Vec<Vec<mpsc::Sender<ScatterChunk>>> =
        Vec::with_capacity(layout.server_ranks.len());
    let mut scatter_rxs_by_worker: Vec<HashMap<Rank, mpsc::Receiver<ScatterChunk>>> =
        layout.worker_ranks.iter().map(|_| HashMap::with_capacity(layout.server_ranks.len())).collect();
    for &server_rank in &layout.server_ranks {
        let mut row = Vec::with_capacity(layout.worker_ranks.len());
        for rxs in &mut scatter_rxs_by_worker {
            let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
            row.push(tx);
            rxs.insert(server_rank, rx);
        }
        scatter_txs_by_server.push(row);
    }

    for ((rank, from_master_rx), scatter_txs) in
        layout.server_ranks.iter().zip(per_server_from_master_rx).zip(scatter_txs_by_server)
    {
        servers.push(ServerEndpoints {
            rank: *rank,
            to_master_tx: from_servers_tx.clone(),
            from_master_rx,
            scatter_txs,
        });
    }

    let mut workers = Vec::with_capacity(layout.worker_ranks.len());
    for (rank, scatter_rxs) in layout.worker_ranks.iter().zip(scatter_rxs_by_worker) {
        workers.push(WorkerEndpoints {
            rank: *rank,
            broadcast_rx: broadcast_tx.subscribe(),
            scatter_rxs,
            gather_tx: gather_tx.clone(),
        });
    }

    let viewer = ViewerEndpoints {
        rank: layout.viewer_rank,
        from_master_rx: viewer_from_master_rx,
        gather_rx,
    };

    let master = MasterEndpoints {
        layout: layout.clone(),
        broadcast_tx,
        from_servers_rx,
        to_servers_txs,
        to_viewer_tx,
    };

    ChannelSet { master, servers, workers, viewer }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_one_endpoint_set_per_rank() {
        let layout = CommLayout::new(6, vec![0, 1]).unwrap();
        let channels = build_channels(&layout);
        assert_eq!(channels.servers.len(), 2);
        assert_eq!(channels.workers.len(), 2);
        assert_eq!(channels.master.to_servers_txs.len(), 2);
        assert_eq!(channels.servers[0].scatter_txs.len(), 2);
        assert_eq!(channels.workers[0].scatter_rxs.len(), 2);
    }
}
