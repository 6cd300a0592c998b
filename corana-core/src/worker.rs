//! Worker role loop (§4.4): ring buffer + correlation engine, driven by
//! the master's broadcast and the assigned server's scatter.

use corana_types::{MasterBroadcastMessage, MasterBroadcastTag};
use tokio_util::sync::CancellationToken;

use crate::channels::WorkerEndpoints;
use crate::error::{CoranaError, Result};
use crate::g2::{worker_adjust_data, G2Engine};
use crate::ring::RingBuffer;
use crate::topology::Rank;

/// Static per-worker configuration, fixed once the mask partition and
/// variant selection are known.
pub struct WorkerConfig {
    pub m_w: usize,
    pub ring_capacity: usize,
    pub saturated_value: f32,
    pub notzero: f32,
}

/// Runs one worker's loop until it observes `END` on the master
/// broadcast, or until `abort` is cancelled.
pub async fn run_worker(
    mut endpoints: WorkerEndpoints,
    config: WorkerConfig,
    mut engine: Box<dyn G2Engine>,
    abort: CancellationToken,
) -> Result<()> {
    let rank = endpoints.rank;
    let mut ring = RingBuffer::new(config.ring_capacity, config.m_w);

    loop {
        let msg = tokio::select! {
            biased;
            _ = abort.cancelled() => return Ok(()),
            msg = endpoints.broadcast_rx.recv() => msg,
        };
        let msg = match msg {
            Ok(msg) => msg,
            Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                return Err(CoranaError::protocol(
                    "worker",
                    rank,
                    "master broadcast channel closed before END",
                ));
            }
            Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                return Err(CoranaError::protocol(
                    "worker",
                    rank,
                    format!("fell behind master broadcast by {skipped} messages"),
                ));
            }
        };

        match msg.tag {
            MasterBroadcastTag::Evt => on_new_event(&mut endpoints, &config, &mut ring, &mut *engine, msg, &abort).await?,
            MasterBroadcastTag::Update => {
                let result = engine.publish(&ring);
                let payload = crate::channels::GatherPayload {
                    worker_rank: rank,
                    g2: result.g2,
                    if_: result.if_,
                    ip: result.ip,
                    counts: result.counts,
                    saturated: result.saturated_elements,
                };
                tokio::select! {
                    biased;
                    _ = abort.cancelled() => return Ok(()),
                    sent = endpoints.gather_tx.send(payload) => {
                        sent.map_err(|_| CoranaError::protocol("worker", rank, "gather channel to viewer closed"))?;
                    }
                }
            }
            MasterBroadcastTag::End => return Ok(()),
        }
    }
}

async fn on_new_event(
    endpoints: &mut WorkerEndpoints,
    config: &WorkerConfig,
    ring: &mut RingBuffer,
    engine: &mut dyn G2Engine,
    msg: MasterBroadcastMessage,
    abort: &CancellationToken,
) -> Result<()> {
    let rank: Rank = endpoints.rank;
    let scatter_rx = endpoints.scatter_rxs.get_mut(&msg.sender_rank).ok_or_else(|| {
        CoranaError::protocol(
            "worker",
            rank,
            format!("broadcast named sender {} with no scatter channel to it", msg.sender_rank),
        )
    })?;
    let chunk = tokio::select! {
        biased;
        _ = abort.cancelled() => return Ok(()),
        chunk = scatter_rx.recv() => chunk,
    };
    let chunk = chunk.ok_or_else(|| CoranaError::protocol("worker", rank, "scatter channel closed"))?;
    if chunk.sender_rank != msg.sender_rank {
        return Err(CoranaError::protocol(
            "worker",
            rank,
            format!(
                "scatter arrived from rank {} but broadcast named sender {}",
                chunk.sender_rank, msg.sender_rank
            ),
        ));
    }
    if chunk.data.len() != config.m_w {
        return Err(CoranaError::protocol(
            "worker",
            rank,
            format!("scatter chunk length {} != expected m_w {}", chunk.data.len(), config.m_w),
        ));
    }

    let (adjusted, saturated) = worker_adjust_data(&chunk.data, config.saturated_value, config.notzero);

    if let Some(eviction) = ring.pending_eviction() {
        let evicted_row = ring.row(eviction.slot).to_vec();
        engine.on_remove(ring, eviction.counter, &evicted_row);
    }
    ring.insert(msg.counter, &adjusted);
    engine.on_insert(ring, msg.counter, &adjusted, &saturated);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::{build_channels, ScatterChunk};
    use crate::g2::{build_engine, G2Kind};
    use crate::topology::CommLayout;
    use corana_types::EventId;

    #[tokio::test]
    async fn worker_updates_ring_and_gathers_on_update() {
        let layout = CommLayout::new(4, vec![0]).unwrap();
        let mut channels = build_channels(&layout);
        let worker = channels.workers.remove(0);
        let worker_rank = worker.rank;

        let server = &channels.servers[0];
        let scatter_tx = server.scatter_txs[0].clone();

        let config = WorkerConfig { m_w: 2, ring_capacity: 4, saturated_value: 1e6, notzero: 1e-6 };
        let engine = build_engine(G2Kind::AtEnd, vec![1], 2);
        let abort = CancellationToken::new();

        let handle = tokio::spawn(run_worker(worker, config, engine, abort.clone()));

        channels
            .master
            .broadcast_tx
            .send(MasterBroadcastMessage::evt(0, EventId::new(1, 0, 0), 0))
            .unwrap();
        scatter_tx.send(ScatterChunk { sender_rank: 0, data: vec![1.0, 2.0] }).await.unwrap();

        channels
            .master
            .broadcast_tx
            .send(MasterBroadcastMessage::evt(0, EventId::new(1, 0, 3), 1))
            .unwrap();
        scatter_tx.send(ScatterChunk { sender_rank: 0, data: vec![3.0, 4.0] }).await.unwrap();

        channels.master.broadcast_tx.send(MasterBroadcastMessage::update(EventId::new(1, 0, 3), 1)).unwrap();
        let gathered = channels.viewer.gather_rx.recv().await.unwrap();
        assert_eq!(gathered.worker_rank, worker_rank);
        assert_eq!(gathered.counts, vec![1]);
        // pair (counter 0, counter 1) at delay 1: G2 = [1*3, 2*4] = [3, 8]
        assert_eq!(gathered.g2, vec![3.0, 8.0]);

        channels.master.broadcast_tx.send(MasterBroadcastMessage::end()).unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn worker_errors_on_scatter_sender_mismatch() {
        let layout = CommLayout::new(4, vec![0]).unwrap();
        let mut channels = build_channels(&layout);
        let worker = channels.workers.remove(0);
        let scatter_tx = channels.servers[0].scatter_txs[0].clone();

        let config = WorkerConfig { m_w: 1, ring_capacity: 2, saturated_value: 1e6, notzero: 1e-6 };
        let engine = build_engine(G2Kind::AtEnd, vec![1], 1);
        let abort = CancellationToken::new();

        let handle = tokio::spawn(run_worker(worker, config, engine, abort.clone()));

        channels
            .master
            .broadcast_tx
            .send(MasterBroadcastMessage::evt(7, EventId::new(1, 0, 0), 0))
            .unwrap();
        scatter_tx.send(ScatterChunk { sender_rank: 0, data: vec![1.0] }).await.unwrap();

        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, CoranaError::Protocol { .. }));
    }
}
