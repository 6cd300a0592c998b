//! Viewer role loop (§4.5): gather discipline, saturated-pixel color
//! retirement, per-delay normalization, and publish.

use std::collections::HashMap;

use corana_types::{Counter, MasterBroadcastTag, EventId};
use tokio_util::sync::CancellationToken;

use crate::channels::{GatherPayload, ViewerEndpoints};
use crate::colors::Colors;
use crate::error::{CoranaError, Result};
use crate::mask::Partition;
use crate::publisher::{DelayPoint, Publisher, PublishedUpdate};
use crate::topology::Rank;

/// Static per-viewer configuration, fixed once the mask partition and
/// delay list are known.
pub struct ViewerConfig {
    pub delays: Vec<i64>,
    pub partition: Partition,
    /// World ranks of the workers, in the same order as `partition`'s
    /// per-worker ranges.
    pub worker_ranks: Vec<Rank>,
    pub masked_len: usize,
}

/// Runs the viewer's loop until `END` arrives from the master, or until
/// `abort` is cancelled.
pub async fn run_viewer(
    mut endpoints: ViewerEndpoints,
    config: ViewerConfig,
    mut colors: Colors,
    mut publisher: Box<dyn Publisher>,
    abort: CancellationToken,
) -> Result<()> {
    let rank = endpoints.rank;
    let num_workers = config.worker_ranks.len();
    let worker_index: HashMap<Rank, usize> =
        config.worker_ranks.iter().enumerate().map(|(i, &r)| (r, i)).collect();
    let mut latest_event = EventId::new(0, 0, 0);

    loop {
        let msg = tokio::select! {
            biased;
            _ = abort.cancelled() => return Ok(()),
            msg = endpoints.from_master_rx.recv() => msg,
        };
        let msg = msg.ok_or_else(|| CoranaError::protocol("viewer", rank, "master channel closed"))?;
        latest_event = msg.event;

        match msg.tag {
            MasterBroadcastTag::End => {
                publisher.finish().await?;
                return Ok(());
            }
            MasterBroadcastTag::Evt => {
                return Err(CoranaError::protocol(
                    "viewer",
                    rank,
                    "received EVT on the master->viewer channel; only UPDATE/END are valid here",
                ));
            }
            MasterBroadcastTag::Update => {
                let gathered = gather(&mut endpoints, &worker_index, num_workers, &abort).await?;
                let Some(gathered) = gathered else { return Ok(()) };
                let update = build_update(&config, &mut colors, gathered, msg.counter, latest_event);
                publisher.publish(update).await?;
            }
        }
    }
}

struct Gathered {
    g2: Vec<f32>,
    if_: Vec<f32>,
    ip: Vec<f32>,
    counts: Vec<i64>,
    saturated: Vec<i8>,
}

/// Gathers one `GatherPayload` per worker and stitches them into
/// `(K * masked_len)` matrices plus a full-length saturation vector
/// (§4.6). Counts are taken from the lowest-ranked worker; all workers
/// are expected to hold identical counts.
async fn gather(
    endpoints: &mut ViewerEndpoints,
    worker_index: &HashMap<Rank, usize>,
    num_workers: usize,
    abort: &CancellationToken,
) -> Result<Option<Gathered>> {
    let mut received: HashMap<Rank, GatherPayload> = HashMap::with_capacity(num_workers);
    while received.len() < num_workers {
        let payload = tokio::select! {
            biased;
            _ = abort.cancelled() => return Ok(None),
            payload = endpoints.gather_rx.recv() => payload,
        };
        let payload = payload.ok_or_else(|| {
            CoranaError::protocol("viewer", endpoints.rank, "gather channel closed before all workers reported")
        })?;
        received.insert(payload.worker_rank, payload);
    }

    let k = received.values().next().map(|p| p.counts.len()).unwrap_or(0);
    let masked_len: usize = received.values().map(|p| p.saturated.len()).sum();

    let mut g2 = vec![0.0f32; k * masked_len];
    let mut if_ = vec![0.0f32; k * masked_len];
    let mut ip = vec![0.0f32; k * masked_len];
    let mut saturated = vec![0i8; masked_len];
    let mut counts: Option<Vec<i64>> = None;

    let mut offset = 0usize;
    let mut ranks_in_order: Vec<Rank> = worker_index.keys().copied().collect();
    ranks_in_order.sort_unstable();
    for rank in ranks_in_order {
        let payload = received
            .remove(&rank)
            .ok_or_else(|| CoranaError::protocol("viewer", endpoints.rank, format!("missing gather payload from worker rank {rank}")))?;
        let m_w = payload.saturated.len();

        for delay_idx in 0..k {
            let src_base = delay_idx * m_w;
            let dst_base = delay_idx * masked_len + offset;
            g2[dst_base..dst_base + m_w].copy_from_slice(&payload.g2[src_base..src_base + m_w]);
            if_[dst_base..dst_base + m_w].copy_from_slice(&payload.if_[src_base..src_base + m_w]);
            ip[dst_base..dst_base + m_w].copy_from_slice(&payload.ip[src_base..src_base + m_w]);
        }
        saturated[offset..offset + m_w].copy_from_slice(&payload.saturated);

        if counts.is_none() {
            counts = Some(payload.counts.clone());
        }
        offset += m_w;
    }

    let counts = counts.unwrap_or_default();
    Ok(Some(Gathered { g2, if_, ip, counts, saturated }))
}

fn build_update(
    config: &ViewerConfig,
    colors: &mut Colors,
    mut gathered: Gathered,
    counter: Counter,
    latest_event: EventId,
) -> PublishedUpdate {
    let stats = colors.retire_saturated(&gathered.saturated);
    let masked_len = config.masked_len;

    let mut points = Vec::new();
    for (k, &delay) in config.delays.iter().enumerate() {
        let count = gathered.counts[k];
        if count <= 0 {
            continue;
        }
        let base = k * masked_len;
        let g2_row = &mut gathered.g2[base..base + masked_len];
        let if_row = &mut gathered.if_[base..base + masked_len];
        let ip_row = &mut gathered.ip[base..base + masked_len];

        let inv = 1.0 / count as f32;
        for v in g2_row.iter_mut() { *v *= inv; }
        for v in if_row.iter_mut() { *v *= inv; }
        for v in ip_row.iter_mut() { *v *= inv; }

        let avg_if = colors.finecolor_averages(if_row);
        let avg_ip = colors.finecolor_averages(ip_row);
        let broadcast_if = colors.broadcast_finecolor(&avg_if);
        let broadcast_ip = colors.broadcast_finecolor(&avg_ip);

        let final_row: Vec<f32> = (0..masked_len)
            .map(|i| {
                let denom = broadcast_if[i] * broadcast_ip[i];
                if denom == 0.0 { 0.0 } else { g2_row[i] / denom }
            })
            .collect();

        let mut per_color_curve: Vec<(i32, f32)> = colors
            .active_colors()
            .filter_map(|c| colors.color_mean(&final_row, c).map(|mean| (c, mean)))
            .collect();
        per_color_curve.sort_unstable_by_key(|(c, _)| *c);

        points.push(DelayPoint { delay, counts: count, per_color_curve });
    }

    PublishedUpdate {
        counter,
        latest_event,
        points,
        newly_retired_colors: stats.newly_retired_colors,
        newly_retired_pixels: stats.newly_retired_pixels,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::build_channels;
    use crate::publisher::TracingPublisher;
    use crate::topology::CommLayout;
    use corana_types::MasterBroadcastMessage;

    fn colors_fixture(m: usize) -> Colors {
        Colors::new(vec![1; m], vec![1; m], 10, 10).unwrap()
    }

    #[tokio::test]
    async fn viewer_stitches_gathered_payloads_and_publishes() {
        let layout = CommLayout::new(5, vec![0]).unwrap(); // 2 workers
        let mut channels = build_channels(&layout);
        let viewer = channels.viewer;
        let partition = layout.mask_partition(4).unwrap();

        let config = ViewerConfig {
            delays: vec![1],
            partition,
            worker_ranks: layout.worker_ranks.clone(),
            masked_len: 4,
        };
        let colors = colors_fixture(4);
        let publisher = Box::new(TracingPublisher::new(None));
        let abort = CancellationToken::new();

        let handle = tokio::spawn(run_viewer(viewer, config, colors, publisher, abort.clone()));

        channels
            .master
            .to_viewer_tx
            .send(MasterBroadcastMessage::update(EventId::new(1, 0, 3), 5))
            .await
            .unwrap();

        for (i, w) in channels.workers.iter().enumerate() {
            let payload = GatherPayload {
                worker_rank: w.rank,
                g2: vec![(i + 1) as f32, (i + 2) as f32],
                if_: vec![1.0, 1.0],
                ip: vec![1.0, 1.0],
                counts: vec![2],
                saturated: vec![0, 0],
            };
            w.gather_tx.send(payload).await.unwrap();
        }

        channels.master.to_viewer_tx.send(MasterBroadcastMessage::end()).await.unwrap();
        handle.await.unwrap().unwrap();
    }
}
