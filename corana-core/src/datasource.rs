//! External collaborator interfaces (§6): the detector I/O adapter and
//! mask/color file reader. Both are out of scope — this crate only
//! defines the trait boundary a real deployment plugs into; `corana-sim`
//! is the in-process reference implementation used by the demo binary
//! and the test suite.

use async_trait::async_trait;
use corana_types::EventId;

use crate::error::Result;

/// One acquisition cycle as handed to a server by its data source: the
/// event identity plus the dense, unmasked detector frame.
#[derive(Debug, Clone)]
pub struct Frame {
    pub event: EventId,
    pub data: Vec<f32>,
}

/// A lazy, finite sequence of frames. A server owns exactly one of these.
/// Mirrors the source's generator protocol (`next` raises `StopIteration`
/// at exhaustion; here that is `Ok(None)`).
#[async_trait]
pub trait DataSource: Send {
    /// The next frame, or `None` once the source is exhausted.
    async fn next_frame(&mut self) -> Result<Option<Frame>>;

    /// Releases any underlying handles. Called on normal exhaustion and
    /// on abort; the default no-op suits sources with nothing to release.
    async fn abort(&mut self) {}
}

/// Loads the boolean mask (and, separately, the test mask) of shape D.
/// Only the positions of `true` entries matter to the rest of this crate;
/// they arrive pre-flattened as ascending indices.
#[async_trait]
pub trait MaskLoader: Send {
    async fn load_mask(&self) -> Result<Vec<bool>>;
    async fn load_test_mask(&self) -> Result<Vec<bool>>;
}

/// A `MaskLoader` backed by the coordinate lists already present in
/// [`crate::config::RunConfig`] — the common case where the mask was
/// decided ahead of time rather than read from a file at startup.
pub struct StaticMaskLoader {
    pub detector_len: usize,
    pub mask_coords: Vec<usize>,
    pub test_mask_coords: Vec<usize>,
}

#[async_trait]
impl MaskLoader for StaticMaskLoader {
    async fn load_mask(&self) -> Result<Vec<bool>> {
        Ok(coords_to_mask(self.detector_len, &self.mask_coords))
    }

    async fn load_test_mask(&self) -> Result<Vec<bool>> {
        Ok(coords_to_mask(self.detector_len, &self.test_mask_coords))
    }
}

fn coords_to_mask(detector_len: usize, coords: &[usize]) -> Vec<bool> {
    let mut mask = vec![false; detector_len];
    for &c in coords {
        mask[c] = true;
    }
    mask
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_mask_loader_sets_only_given_coordinates() {
        let loader = StaticMaskLoader {
            detector_len: 6,
            mask_coords: vec![1, 3, 4],
            test_mask_coords: vec![0],
        };
        let mask = loader.load_mask().await.unwrap();
        assert_eq!(mask, vec![false, true, false, true, true, false]);
        let test_mask = loader.load_test_mask().await.unwrap();
        assert_eq!(test_mask, vec![true, false, false, false, false, false]);
    }
}
