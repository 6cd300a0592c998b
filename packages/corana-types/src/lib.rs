//! # corana-types
//!
//! Shared wire types for the corana distributed correlation pipeline.
//!
//! These types are used by:
//! - `corana-core`: the server/master/worker/viewer rank implementations
//! - `corana-sim`: the synthetic detector-frame generator used for demos
//!   and integration tests
//!
//! ## Conventions
//!
//! - **Event ID**: `(sec, nsec, fid)` uniquely identifies one 120 Hz
//!   acquisition cycle. `fid` is a 17-bit fiducial, so it wraps at 131072.
//! - **Counter**: a monotonically increasing `i64` assigned once by the
//!   master from an event's `(sec, fid)` relative to the first event seen
//!   in the run. Workers never recompute it.
//! - **Tags**: small enums identifying what kind of message is carried on
//!   a given channel, mirroring the MPI tag field of the system this
//!   crate's protocol is modeled on.

use serde::{Deserialize, Serialize};

// ── Event identity ────────────────────────────────────────────────────────────

/// A 17-bit cyclic fiducial. Values are taken modulo `FID_MODULUS`.
pub const FID_MODULUS: i32 = 1 << 17;

/// Wall-clock-anchored identity of one acquisition cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventId {
    pub sec: i32,
    pub nsec: i32,
    pub fid: i32,
}

impl EventId {
    pub fn new(sec: i32, nsec: i32, fid: i32) -> Self {
        Self { sec, nsec, fid }
    }
}

/// Monotonic integer identity for one cycle, assigned by the master.
/// Counter equality is the unique key for a frame; workers consume it
/// rather than deriving it themselves.
pub type Counter = i64;

// ── Message tags ──────────────────────────────────────────────────────────────

/// Tag on a Server→Master message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerToMasterTag {
    EvtReady,
    End,
}

/// Tag on a Master→Server message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MasterToServerTag {
    SendToWorkers,
    Abort,
}

/// Tag on a Master→Workers/Viewer broadcast message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MasterBroadcastTag {
    Evt,
    Update,
    End,
}

// ── Wire envelopes (see corana-core's protocol design notes) ──────────────────

/// Server→Master SM message: `{tag, senderRank, sec, nsec, fid}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerToMasterMessage {
    pub tag: ServerToMasterTag,
    pub sender_rank: i32,
    pub event: EventId,
}

/// Master→Server SM message: `{tag}` (no payload beyond the decision itself).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasterToServerMessage {
    pub tag: MasterToServerTag,
}

/// Master→Workers/Viewer MVW message:
/// `{tag, senderRank, sec, nsec, fid, counter}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasterBroadcastMessage {
    pub tag: MasterBroadcastTag,
    pub sender_rank: i32,
    pub event: EventId,
    pub counter: Counter,
}

impl MasterBroadcastMessage {
    pub fn evt(sender_rank: i32, event: EventId, counter: Counter) -> Self {
        Self { tag: MasterBroadcastTag::Evt, sender_rank, event, counter }
    }

    /// `latest_event`/`latest_counter` are the master's `latestEventId`
    /// (§4.3 step 4, §8 invariant 6): the event with the highest counter
    /// seen so far, not necessarily the one that triggered this UPDATE.
    pub fn update(latest_event: EventId, latest_counter: Counter) -> Self {
        Self {
            tag: MasterBroadcastTag::Update,
            sender_rank: -1,
            event: latest_event,
            counter: latest_counter,
        }
    }

    pub fn end() -> Self {
        Self {
            tag: MasterBroadcastTag::End,
            sender_rank: -1,
            event: EventId::new(0, 0, 0),
            counter: -1,
        }
    }
}

// ── Rank roles ────────────────────────────────────────────────────────────────

/// The four fixed roles a rank may play, per the rank/communicator layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Server,
    Master,
    Viewer,
    Worker,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Role::Server => "server",
            Role::Master => "master",
            Role::Viewer => "viewer",
            Role::Worker => "worker",
        };
        write!(f, "{s}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broadcast_update_carries_latest_event_and_counter() {
        let msg = MasterBroadcastMessage::update(EventId::new(1, 2, 3), 42);
        assert_eq!(msg.tag, MasterBroadcastTag::Update);
        assert_eq!(msg.event, EventId::new(1, 2, 3));
        assert_eq!(msg.counter, 42);
    }

    #[test]
    fn role_display_matches_protocol_naming() {
        assert_eq!(Role::Worker.to_string(), "worker");
        assert_eq!(Role::Master.to_string(), "master");
    }
}
