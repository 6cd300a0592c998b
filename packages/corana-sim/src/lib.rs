//! # corana-sim
//!
//! Synthetic 120 Hz detector-frame generator standing in for the
//! detector I/O adapter `corana-core` declares out of scope (§6
//! `DataSource`). Used by the `corana-sim` demo binary and by
//! `corana-core`'s integration tests.
//!
//! Grounded on the teacher's `boat_sim.rs`: a deterministic physics/shape
//! model advanced one tick at a time, with `rand`/`rand_distr` supplying
//! the only nondeterminism (intensity noise), gated behind a seeded RNG
//! so a test run is reproducible.

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};

use corana_core::datasource::{DataSource, Frame};
use corana_core::error::Result;

/// How one [`SyntheticSource`] advances through the shared 120 Hz
/// fiducial schedule. Mirrors the source's own test fixtures
/// (`unitTestsParCorAna.py`): `fid` advances by `fid_stride` per tick,
/// wrapping within `FID_MODULUS`, and a configured run can omit one
/// fiducial per second to exercise the "skipped frame" scenarios (§8
/// scenario a/b).
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Flattened detector length D (frames are dense, D-long vectors).
    pub detector_len: usize,
    /// First event's wall-clock second.
    pub start_sec: i32,
    /// First event's fiducial.
    pub start_fid: i32,
    /// Fiducial stride per 120 Hz tick (3, matching the source's fixtures).
    pub fid_stride: i32,
    /// This generator emits every `stride`-th tick starting at `offset`
    /// (tick index `i` is emitted iff `i % stride == offset`) — how a
    /// run's total 120 Hz event rate is split across `S` servers.
    pub stride: usize,
    pub offset: usize,
    /// Total number of 120 Hz ticks to consider emitting (servers
    /// running a shared schedule agree on this bound even though each
    /// only emits its own subset).
    pub total_ticks: usize,
    /// If set, the tick at this index-within-second (0-based, before
    /// stride-splitting) is skipped entirely — never produced by any
    /// server — reproducing the source's "one missing fiducial per
    /// second" scenario.
    pub skip_index_in_second: Option<i32>,
    /// Baseline intensity and per-pixel Gaussian noise standard
    /// deviation; values are clamped non-negative.
    pub baseline: f32,
    pub noise_std: f32,
    pub rng_seed: u64,
}

impl SimConfig {
    /// Splits a `total_ticks`-tick, `detector_len`-wide run evenly across
    /// `num_servers` generators, one [`SimConfig`] per server.
    pub fn split(
        num_servers: usize,
        detector_len: usize,
        total_ticks: usize,
        skip_index_in_second: Option<i32>,
        rng_seed: u64,
    ) -> Vec<SimConfig> {
        (0..num_servers)
            .map(|offset| SimConfig {
                detector_len,
                start_sec: 0,
                start_fid: 0,
                fid_stride: 3,
                stride: num_servers,
                offset,
                total_ticks,
                skip_index_in_second,
                baseline: 10.0,
                noise_std: 1.0,
                rng_seed: rng_seed.wrapping_add(offset as u64),
            })
            .collect()
    }
}

/// 120 ticks per second at `fid_stride` apart; `FID_MODULUS / fid_stride`
/// rounded down is how many distinct fiducials exist, but this crate
/// only ever needs 120 per second (the schedule the source's timing
/// system actually runs).
const TICKS_PER_SECOND: i32 = 120;

/// The in-process reference [`DataSource`]: advances a tick counter,
/// skips the configured fiducial (if any) and every tick not assigned to
/// this generator's stride offset, and emits a frame with deterministic
/// shape plus seeded Gaussian noise.
pub struct SyntheticSource {
    config: SimConfig,
    next_tick: usize,
    rng: StdRng,
}

impl SyntheticSource {
    pub fn new(config: SimConfig) -> Self {
        let rng = StdRng::seed_from_u64(config.rng_seed);
        Self { config, next_tick: 0, rng }
    }

    fn tick_to_event(&self, tick: usize) -> (i32, i32) {
        let sec = self.config.start_sec + (tick as i32) / TICKS_PER_SECOND;
        let index_in_second = (tick as i32) % TICKS_PER_SECOND;
        let fid = (self.config.start_fid + index_in_second * self.config.fid_stride)
            % corana_types::FID_MODULUS;
        (sec, fid)
    }
}

#[async_trait]
impl DataSource for SyntheticSource {
    async fn next_frame(&mut self) -> Result<Option<Frame>> {
        loop {
            if self.next_tick >= self.config.total_ticks {
                return Ok(None);
            }
            let tick = self.next_tick;
            self.next_tick += 1;

            let index_in_second = (tick as i32) % TICKS_PER_SECOND;
            if Some(index_in_second) == self.config.skip_index_in_second {
                continue;
            }
            if tick % self.config.stride != self.config.offset {
                continue;
            }

            let (sec, fid) = self.tick_to_event(tick);
            let normal = Normal::new(self.config.baseline, self.config.noise_std)
                .expect("noise_std must be finite and non-negative");
            let data: Vec<f32> = (0..self.config.detector_len)
                .map(|_| normal.sample(&mut self.rng).max(0.0))
                .collect();

            return Ok(Some(Frame {
                event: corana_types::EventId::new(sec, 0, fid),
                data,
            }));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn emits_only_ticks_assigned_to_its_stride_offset() {
        let configs = SimConfig::split(2, 4, 6, None, 1);
        let mut even = SyntheticSource::new(configs[0].clone());
        let mut odd = SyntheticSource::new(configs[1].clone());

        let mut even_fids = Vec::new();
        while let Some(frame) = even.next_frame().await.unwrap() {
            even_fids.push(frame.event.fid);
        }
        let mut odd_fids = Vec::new();
        while let Some(frame) = odd.next_frame().await.unwrap() {
            odd_fids.push(frame.event.fid);
        }

        assert_eq!(even_fids, vec![0, 6, 12]);
        assert_eq!(odd_fids, vec![3, 9, 15]);
    }

    #[tokio::test]
    async fn skipped_index_in_second_is_never_emitted_by_either_offset() {
        let configs = SimConfig::split(2, 4, 8, Some(2), 1);
        let mut sources: Vec<SyntheticSource> =
            configs.into_iter().map(SyntheticSource::new).collect();

        let mut all_fids = Vec::new();
        for source in &mut sources {
            while let Some(frame) = source.next_frame().await.unwrap() {
                all_fids.push(frame.event.fid);
            }
        }
        all_fids.sort_unstable();
        // tick 2 (index_in_second=2, fid=6) is skipped entirely.
        assert_eq!(all_fids, vec![0, 3, 9, 12, 15, 18, 21]);
    }

    #[tokio::test]
    async fn frame_data_has_configured_length_and_is_non_negative() {
        let config = SimConfig::split(1, 16, 3, None, 7).remove(0);
        let mut source = SyntheticSource::new(config);
        let frame = source.next_frame().await.unwrap().unwrap();
        assert_eq!(frame.data.len(), 16);
        assert!(frame.data.iter().all(|&v| v >= 0.0));
    }
}
