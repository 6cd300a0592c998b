//! Master sequencer (§4.3): merges READY events streaming from the
//! servers into one globally ordered sequence, assigns each a counter,
//! and drives the UPDATE/END cadence.

use std::collections::{HashMap, HashSet};

use corana_types::{
    EventId, MasterBroadcastMessage, MasterToServerMessage, MasterToServerTag, ServerToMasterTag,
};
use tokio_util::sync::CancellationToken;

use crate::channels::MasterEndpoints;
use crate::counter::{CounterAssigner, FidSchedule};
use crate::error::{CoranaError, Result};
use crate::topology::Rank;

/// Selection policy between ready servers each loop iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionMode {
    StrictTimeOrder,
    RoundRobin,
}

pub struct MasterConfig {
    pub selection_mode: SelectionMode,
    /// Events between UPDATE broadcasts; 0 disables mid-run updates.
    pub update_interval: u64,
    /// Events between data-rate log lines; 0 disables the log.
    pub data_rate_log_interval: u64,
}

struct ReadyEntry {
    event: EventId,
}

/// Runs the master loop to completion: every server reaches `finished`,
/// or `abort` is cancelled.
pub async fn run_master<S: FidSchedule>(
    mut endpoints: MasterEndpoints,
    config: MasterConfig,
    schedule: S,
    abort: CancellationToken,
) -> Result<()> {
    let server_ranks = endpoints.layout.server_ranks.clone();
    let num_servers = server_ranks.len();
    let rank_index: HashMap<Rank, usize> =
        server_ranks.iter().enumerate().map(|(i, &r)| (r, i)).collect();

    let mut ready: HashMap<Rank, ReadyEntry> = HashMap::new();
    let mut finished: HashSet<Rank> = HashSet::new();
    let mut last_selected: Option<Rank> = None;
    let mut assigner = CounterAssigner::new(schedule);
    let mut latest_event = EventId::new(0, 0, 0);
    let mut latest_counter: i64 = -1;
    let mut num_events: u64 = 0;
    let mut last_update_mark: u64 = 0;
    let mut last_rate_mark: u64 = 0;

    while finished.len() < num_servers {
        if ready.is_empty() {
            let msg = tokio::select! {
                biased;
                _ = abort.cancelled() => return abort_servers(&endpoints, &server_ranks).await,
                msg = endpoints.from_servers_rx.recv() => msg,
            };
            let msg = msg.ok_or_else(|| CoranaError::protocol("master", -1, "all server channels closed"))?;
            classify(msg.tag, msg.sender_rank, msg.event, &mut ready, &mut finished)?;
        } else {
            while let Ok(msg) = endpoints.from_servers_rx.try_recv() {
                classify(msg.tag, msg.sender_rank, msg.event, &mut ready, &mut finished)?;
            }
        }

        if ready.is_empty() {
            continue;
        }

        let selected = select_server(config.selection_mode, &ready, &server_ranks, last_selected);
        let event = ready.remove(&selected).expect("selected rank must be in ready").event;
        last_selected = Some(selected);

        let counter = assigner.assign(event);
        if counter > latest_counter {
            latest_counter = counter;
            latest_event = event;
        }

        endpoints
            .broadcast_tx
            .send(MasterBroadcastMessage::evt(selected, event, counter))
            .map_err(|_| CoranaError::protocol("master", -1, "broadcast channel has no subscribers"))?;

        let idx = rank_index[&selected];
        endpoints.to_servers_txs[idx]
            .send(MasterToServerMessage { tag: MasterToServerTag::SendToWorkers })
            .await
            .map_err(|_| CoranaError::protocol("master", -1, "server decision channel closed"))?;

        num_events += 1;

        if config.update_interval > 0 && num_events - last_update_mark >= config.update_interval {
            send_update(&endpoints, latest_event, latest_counter).await?;
            last_update_mark = num_events;
        }

        if config.data_rate_log_interval > 0 && num_events - last_rate_mark >= config.data_rate_log_interval {
            tracing::info!(num_events, "master processed {} events so far", num_events);
            last_rate_mark = num_events;
        }
    }

    send_update(&endpoints, latest_event, latest_counter).await?;
    endpoints
        .broadcast_tx
        .send(MasterBroadcastMessage::end())
        .map_err(|_| CoranaError::protocol("master", -1, "broadcast channel has no subscribers"))?;
    endpoints
        .to_viewer_tx
        .send(MasterBroadcastMessage::end())
        .await
        .map_err(|_| CoranaError::protocol("master", -1, "viewer channel closed"))?;

    Ok(())
}

fn classify(
    tag: ServerToMasterTag,
    sender_rank: Rank,
    event: EventId,
    ready: &mut HashMap<Rank, ReadyEntry>,
    finished: &mut HashSet<Rank>,
) -> Result<()> {
    match tag {
        ServerToMasterTag::EvtReady => {
            ready.insert(sender_rank, ReadyEntry { event });
        }
        ServerToMasterTag::End => {
            ready.remove(&sender_rank);
            finished.insert(sender_rank);
        }
    }
    Ok(())
}

fn select_server(
    mode: SelectionMode,
    ready: &HashMap<Rank, ReadyEntry>,
    server_ranks: &[Rank],
    last_selected: Option<Rank>,
) -> Rank {
    match mode {
        SelectionMode::StrictTimeOrder => *ready
            .iter()
            .min_by_key(|(&rank, entry)| (entry.event.sec, entry.event.nsec, rank, entry.event.fid))
            .map(|(rank, _)| rank)
            .expect("caller guarantees ready is non-empty"),
        SelectionMode::RoundRobin => {
            let mut ranks_sorted: Vec<Rank> = server_ranks.iter().copied().filter(|r| ready.contains_key(r)).collect();
            ranks_sorted.sort_unstable();
            let smallest = *ranks_sorted.first().expect("caller guarantees ready is non-empty");
            match last_selected {
                None => smallest,
                Some(last) if !ready.contains_key(&last) => smallest,
                Some(last) => ranks_sorted
                    .iter()
                    .copied()
                    .find(|&r| r > last)
                    .unwrap_or(smallest),
            }
        }
    }
}

async fn send_update(endpoints: &MasterEndpoints, latest_event: EventId, latest_counter: i64) -> Result<()> {
    endpoints
        .broadcast_tx
        .send(MasterBroadcastMessage::update(latest_event, latest_counter))
        .map_err(|_| CoranaError::protocol("master", -1, "broadcast channel has no subscribers"))?;
    endpoints
        .to_viewer_tx
        .send(MasterBroadcastMessage::update(latest_event, latest_counter))
        .await
        .map_err(|_| CoranaError::protocol("master", -1, "viewer channel closed"))
}

async fn abort_servers(endpoints: &MasterEndpoints, server_ranks: &[Rank]) -> Result<()> {
    for (idx, _rank) in server_ranks.iter().enumerate() {
        endpoints.to_servers_txs[idx]
            .send(MasterToServerMessage { tag: MasterToServerTag::Abort })
            .await
            .ok();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(sec: i32, nsec: i32, fid: i32) -> ReadyEntry {
        ReadyEntry { event: EventId::new(sec, nsec, fid) }
    }

    #[test]
    fn strict_time_order_picks_minimum_sec_nsec_then_rank_then_fid() {
        let mut ready = HashMap::new();
        ready.insert(2, entry(100, 5, 10));
        ready.insert(1, entry(100, 5, 3));
        ready.insert(3, entry(99, 999, 0));
        let selected = select_server(SelectionMode::StrictTimeOrder, &ready, &[1, 2, 3], None);
        assert_eq!(selected, 3);
    }

    #[test]
    fn strict_time_order_breaks_rank_tie_by_ascending_fid() {
        // sec/nsec/rank all equal; only fid differs. The lower fid wins.
        let mut ready = HashMap::new();
        ready.insert(1, entry(100, 5, 9));
        ready.insert(1, entry(100, 5, 3));
        let selected = select_server(SelectionMode::StrictTimeOrder, &ready, &[1], None);
        assert_eq!(selected, 1);

        let mut two_entries_same_key = HashMap::new();
        two_entries_same_key.insert(2, entry(100, 5, 9));
        two_entries_same_key.insert(3, entry(100, 5, 9));
        // equal sec/nsec/fid: rank is the tiebreak ahead of fid, so the
        // lower rank wins even though both fids match.
        let selected = select_server(SelectionMode::StrictTimeOrder, &two_entries_same_key, &[2, 3], None);
        assert_eq!(selected, 2);
    }

    #[test]
    fn round_robin_picks_rank_after_last_selected_with_wraparound() {
        let mut ready = HashMap::new();
        ready.insert(1, entry(0, 0, 0));
        ready.insert(3, entry(0, 0, 0));
        let selected = select_server(SelectionMode::RoundRobin, &ready, &[1, 2, 3], Some(1));
        assert_eq!(selected, 3);
        let wrapped = select_server(SelectionMode::RoundRobin, &ready, &[1, 2, 3], Some(3));
        assert_eq!(wrapped, 1);
    }

    #[test]
    fn round_robin_falls_back_to_smallest_rank_when_last_selected_not_ready() {
        let mut ready = HashMap::new();
        ready.insert(1, entry(0, 0, 0));
        ready.insert(2, entry(0, 0, 0));
        let selected = select_server(SelectionMode::RoundRobin, &ready, &[1, 2, 3], Some(3));
        assert_eq!(selected, 1);
    }

    #[test]
    fn round_robin_falls_back_to_smallest_rank_even_when_a_larger_ready_rank_exists() {
        // last_selected=1 is not currently ready; a ready rank greater than
        // it (2) exists alongside a ready rank below it (0). The fallback
        // must be the smallest ready rank (0), not the next one above last.
        let mut ready = HashMap::new();
        ready.insert(0, entry(0, 0, 0));
        ready.insert(2, entry(0, 0, 0));
        let selected = select_server(SelectionMode::RoundRobin, &ready, &[0, 1, 2], Some(1));
        assert_eq!(selected, 0);
    }
}
