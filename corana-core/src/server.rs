//! Server role loop (§4.2): own a data generator, keep one frame
//! prefetched ahead of what's been offered to the master, and scatter on
//! command.

use std::collections::VecDeque;

use corana_types::{EventId, MasterToServerTag, ServerToMasterMessage, ServerToMasterTag};
use tokio_util::sync::CancellationToken;

use crate::channels::{ScatterChunk, ServerEndpoints};
use crate::datasource::{DataSource, Frame};
use crate::error::{CoranaError, Result};
use crate::mask::Partition;

/// Static per-server scatter configuration, fixed for the run once the
/// mask and worker partition are known.
pub struct ServerConfig {
    /// Ascending indices into a raw frame's flat data that the mask
    /// selects, already in the order the partition expects.
    pub mask_coords: Vec<usize>,
    pub partition: Partition,
}

/// Runs one server's main sequence until its data source is exhausted
/// and its queue drains, or until `abort` is cancelled.
pub async fn run_server(
    endpoints: ServerEndpoints,
    mut source: Box<dyn DataSource>,
    config: ServerConfig,
    abort: CancellationToken,
) -> Result<()> {
    let ServerEndpoints { rank, to_master_tx, mut from_master_rx, scatter_txs } = endpoints;
    // Keep-ahead of one frame (§4.2): the queue normally holds the head
    // already offered to the master plus one prefetched frame.
    let mut queue: VecDeque<Frame> = VecDeque::with_capacity(2);

    if let Some(frame) = fetch_next(&mut source, &abort, rank).await? {
        queue.push_back(frame);
    }

    while let Some(head) = queue.front() {
        let ready = ServerToMasterMessage {
            tag: ServerToMasterTag::EvtReady,
            sender_rank: rank,
            event: head.event,
        };
        tokio::select! {
            biased;
            _ = abort.cancelled() => return Ok(()),
            result = to_master_tx.send(ready) => {
                result.map_err(|_| CoranaError::protocol("server", rank, "master READY channel closed"))?;
            }
        }

        if let Some(frame) = fetch_next(&mut source, &abort, rank).await? {
            queue.push_back(frame);
        }

        let decision = tokio::select! {
            biased;
            _ = abort.cancelled() => return Ok(()),
            msg = from_master_rx.recv() => msg,
        };
        let decision = decision
            .ok_or_else(|| CoranaError::protocol("server", rank, "master decision channel closed"))?;

        match decision.tag {
            MasterToServerTag::SendToWorkers => {
                let frame = queue.pop_front().expect("head was just peeked non-empty");
                scatter(&scatter_txs, rank, &frame, &config).await?;
            }
            MasterToServerTag::Abort => {
                source.abort().await;
                return Ok(());
            }
        }
    }

    let end = ServerToMasterMessage {
        tag: ServerToMasterTag::End,
        sender_rank: rank,
        event: EventId::new(0, 0, 0),
    };
    to_master_tx.send(end).await.ok();
    Ok(())
}

async fn fetch_next(
    source: &mut Box<dyn DataSource>,
    abort: &CancellationToken,
    rank: i32,
) -> Result<Option<Frame>> {
    tokio::select! {
        biased;
        _ = abort.cancelled() => Ok(None),
        result = source.next_frame() => result.map_err(|e| {
            tracing::error!(rank, error = %e, "data source failed, triggering world abort");
            abort.cancel();
            e
        }),
    }
}

async fn scatter(
    scatter_txs: &[tokio::sync::mpsc::Sender<ScatterChunk>],
    rank: i32,
    frame: &Frame,
    config: &ServerConfig,
) -> Result<()> {
    let masked: Vec<f32> = config.mask_coords.iter().map(|&c| frame.data[c]).collect();
    for (w, tx) in scatter_txs.iter().enumerate() {
        let range = config.partition.range(w);
        let chunk = ScatterChunk { sender_rank: rank, data: masked[range].to_vec() };
        tx.send(chunk)
            .await
            .map_err(|_| CoranaError::protocol("server", rank, "scatter channel to worker closed"))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::build_channels;
    use crate::topology::CommLayout;
    use async_trait::async_trait;

    struct FixedSource {
        frames: std::collections::VecDeque<Frame>,
    }

    #[async_trait]
    impl DataSource for FixedSource {
        async fn next_frame(&mut self) -> Result<Option<Frame>> {
            Ok(self.frames.pop_front())
        }
    }

    #[tokio::test]
    async fn server_sends_ready_then_scatters_on_send_decision() {
        let layout = CommLayout::new(4, vec![0]).unwrap();
        let mut channels = build_channels(&layout);
        let endpoints = channels.servers.remove(0);
        let rank = endpoints.rank;

        let frames: std::collections::VecDeque<Frame> = [(1, 10), (1, 13)]
            .into_iter()
            .map(|(sec, fid)| Frame { event: EventId::new(sec, 0, fid), data: vec![1.0, 2.0, 3.0, 4.0] })
            .collect();
        let source = Box::new(FixedSource { frames });
        let config = ServerConfig {
            mask_coords: vec![0, 1, 2, 3],
            partition: Partition::balanced(4, 1).unwrap(),
        };
        let abort = CancellationToken::new();

        let mut from_servers_rx = channels.master.from_servers_rx;
        let to_server_tx = channels.master.to_servers_txs.remove(0);
        let mut scatter_rx = channels.workers.remove(0).scatter_rxs.remove(&rank).unwrap();

        let handle = tokio::spawn(run_server(endpoints, source, config, abort));

        let ready = from_servers_rx.recv().await.unwrap();
        assert_eq!(ready.tag, ServerToMasterTag::EvtReady);
        assert_eq!(ready.sender_rank, rank);

        to_server_tx
            .send(corana_types::MasterToServerMessage { tag: MasterToServerTag::SendToWorkers })
            .await
            .unwrap();

        let chunk = scatter_rx.recv().await.unwrap();
        assert_eq!(chunk.data, vec![1.0, 2.0, 3.0, 4.0]);

        let ready2 = from_servers_rx.recv().await.unwrap();
        assert_eq!(ready2.event.fid, 13);
        to_server_tx
            .send(corana_types::MasterToServerMessage { tag: MasterToServerTag::Abort })
            .await
            .unwrap();

        handle.await.unwrap().unwrap();
    }
}
