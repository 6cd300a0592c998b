//! Color and finecolor labeling (§3 Colors, §4.5 step 3): two integer
//! partitions of the masked index space used at the viewer to normalize
//! and group the published G2 curves.
//!
//! Grounded on `UserG2.loadColorFile` / `sumColoredPixels` /
//! `changeColorDataIfNewSaturated`. The source loads both labelings from
//! `.npy` files at viewer init and keeps them in sync as saturated pixels
//! accumulate over the run; this crate takes the labelings as already
//! loaded (§6 `MaskLoader`/color file reading is out of scope) and owns
//! only the retirement and averaging logic.

use std::collections::BTreeMap;

use crate::error::{CoranaError, Result};

/// The two label arrays over the `M`-length masked index space, plus the
/// derived per-color pixel totals the viewer needs to average and group
/// delay curves. `color == 0` / `finecolor == 0` both mean "excluded from
/// every curve" (retired or never colored).
#[derive(Debug, Clone)]
pub struct Colors {
    color: Vec<i32>,
    finecolor: Vec<i32>,
    color_totals: BTreeMap<i32, usize>,
    finecolor_totals: BTreeMap<i32, usize>,
}

/// How many pixels/colors a call to [`Colors::retire_saturated`] removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetireStats {
    pub newly_retired_pixels: usize,
    pub newly_retired_colors: usize,
}

impl Colors {
    /// Loads and validates a `(color, finecolor)` pair already restricted
    /// to the masked index space (length `M`). Mirrors the assertions in
    /// `loadColorFile` plus the color/finecolor pixel-count cross-check
    /// `UserG2.viewerInit` performs right after loading both files:
    /// every pixel with a positive color must also have a positive
    /// finecolor.
    pub fn new(color: Vec<i32>, finecolor: Vec<i32>, max_color: i32, max_finecolor: i32) -> Result<Self> {
        if color.len() != finecolor.len() {
            return Err(CoranaError::Data(format!(
                "color.len()={} != finecolor.len()={}",
                color.len(),
                finecolor.len()
            )));
        }
        if color.iter().any(|&c| c < 0) {
            return Err(CoranaError::Data("negative values found in color file".into()));
        }
        if finecolor.iter().any(|&c| c < 0) {
            return Err(CoranaError::Data("negative values found in finecolor file".into()));
        }
        if color.iter().any(|&c| c > max_color) {
            return Err(CoranaError::Data(format!(
                "color file has values exceeding {max_color}, is color file corrupt?"
            )));
        }
        if finecolor.iter().any(|&c| c > max_finecolor) {
            return Err(CoranaError::Data(format!(
                "finecolor file has values exceeding {max_finecolor}, is finecolor file corrupt?"
            )));
        }
        let mismatched = color.iter().zip(&finecolor).filter(|(&c, &fc)| c > 0 && fc == 0).count();
        if mismatched > 0 {
            return Err(CoranaError::Data(format!(
                "{mismatched} pixels have color>0 but finecolor==0; all valid colored pixels \
                 must have a valid finecolor"
            )));
        }

        let color_totals = sum_colored_pixels(&color);
        let finecolor_totals = sum_colored_pixels(&finecolor);
        Ok(Self { color, finecolor, color_totals, finecolor_totals })
    }

    pub fn len(&self) -> usize { self.color.len() }
    pub fn is_empty(&self) -> bool { self.color.is_empty() }
    pub fn color_at(&self, i: usize) -> i32 { self.color[i] }
    pub fn finecolor_at(&self, i: usize) -> i32 { self.finecolor[i] }

    /// Colors (finecolors) that currently still have at least one pixel,
    /// in ascending order.
    pub fn active_colors(&self) -> impl Iterator<Item = i32> + '_ { self.color_totals.keys().copied() }
    pub fn color_total(&self, color: i32) -> Option<usize> { self.color_totals.get(&color).copied() }
    pub fn finecolor_total(&self, finecolor: i32) -> Option<usize> { self.finecolor_totals.get(&finecolor).copied() }

    /// Zeroes both labelings at every position the sticky saturation
    /// vector flags, recomputes the per-color/finecolor totals, and
    /// drops any color/finecolor whose total fell to zero. `saturated`
    /// is the full, cumulative (OR-ed) vector gathered from the workers
    /// this update, not just the newly-flagged positions — re-applying
    /// it to already-zeroed pixels is a no-op, matching
    /// `changeColorDataIfNewSaturated`'s re-derivation from the full
    /// saturated set every call.
    pub fn retire_saturated(&mut self, saturated: &[i8]) -> RetireStats {
        assert_eq!(saturated.len(), self.color.len(), "saturation vector shape mismatch");

        if saturated.iter().all(|&s| s == 0) {
            return RetireStats::default();
        }

        let mut new_color = self.color.clone();
        let mut new_finecolor = self.finecolor.clone();
        for (i, &s) in saturated.iter().enumerate() {
            if s != 0 {
                new_color[i] = 0;
                new_finecolor[i] = 0;
            }
        }

        let new_color_totals = sum_colored_pixels(&new_color);
        let new_finecolor_totals = sum_colored_pixels(&new_finecolor);

        let mut newly_retired_pixels = 0usize;
        let mut newly_retired_colors = 0usize;
        for (&color, &old_total) in &self.color_totals {
            let new_total = new_color_totals.get(&color).copied().unwrap_or(0);
            newly_retired_pixels += old_total.saturating_sub(new_total);
            if new_total == 0 {
                newly_retired_colors += 1;
            }
        }

        if newly_retired_pixels == 0 {
            return RetireStats::default();
        }

        self.color = new_color;
        self.finecolor = new_finecolor;
        self.color_totals = new_color_totals;
        self.finecolor_totals = new_finecolor_totals;

        tracing::warn!(
            newly_retired_pixels,
            newly_retired_colors,
            "new saturated pixels removed from color labeling"
        );

        RetireStats { newly_retired_pixels, newly_retired_colors }
    }

    /// Mean of `values` within each finecolor class, restricted to
    /// currently-valid pixels (`finecolor != 0`). Mirrors
    /// `ParCorAna.replaceSubsetsWithAverage` as used on `IF`/`IP`.
    pub fn finecolor_averages(&self, values: &[f32]) -> BTreeMap<i32, f32> {
        let mut sums: BTreeMap<i32, f32> = BTreeMap::new();
        for (i, &fc) in self.finecolor.iter().enumerate() {
            if fc == 0 {
                continue;
            }
            *sums.entry(fc).or_insert(0.0) += values[i];
        }
        sums.into_iter()
            .map(|(fc, sum)| (fc, sum / self.finecolor_totals[&fc] as f32))
            .collect()
    }

    /// Broadcasts a per-finecolor average back out to the full `M`-length
    /// pixel vector (0.0 at positions whose finecolor has no average,
    /// i.e. retired/never-colored pixels).
    pub fn broadcast_finecolor(&self, averages: &BTreeMap<i32, f32>) -> Vec<f32> {
        self.finecolor.iter().map(|&fc| averages.get(&fc).copied().unwrap_or(0.0)).collect()
    }

    /// Mean of `values` over pixels labeled `color`, or `None` if that
    /// color has no pixels left.
    pub fn color_mean(&self, values: &[f32], color: i32) -> Option<f32> {
        let total = self.color_totals.get(&color).copied()?;
        if total == 0 {
            return None;
        }
        let sum: f32 = self
            .color
            .iter()
            .zip(values)
            .filter(|(&c, _)| c == color)
            .map(|(_, &v)| v)
            .sum();
        Some(sum / total as f32)
    }
}

/// `sumColoredPixels`: per-label pixel totals, excluding label 0.
fn sum_colored_pixels(labels: &[i32]) -> BTreeMap<i32, usize> {
    let mut totals = BTreeMap::new();
    for &label in labels {
        if label == 0 {
            continue;
        }
        *totals.entry(label).or_insert(0) += 1;
    }
    totals
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_color_finecolor_mismatch() {
        let err = Colors::new(vec![1, 0], vec![0, 0], 10, 10).unwrap_err();
        assert!(matches!(err, CoranaError::Data(_)));
    }

    #[test]
    fn rejects_negative_color() {
        let err = Colors::new(vec![-1], vec![1], 10, 10).unwrap_err();
        assert!(matches!(err, CoranaError::Data(_)));
    }

    #[test]
    fn rejects_color_exceeding_max() {
        let err = Colors::new(vec![11], vec![1], 10, 10).unwrap_err();
        assert!(matches!(err, CoranaError::Data(_)));
    }

    #[test]
    fn loads_totals_excluding_zero_label() {
        let colors = Colors::new(vec![1, 1, 2, 0], vec![1, 1, 1, 0], 10, 10).unwrap();
        assert_eq!(colors.color_total(1), Some(2));
        assert_eq!(colors.color_total(2), Some(1));
        assert_eq!(colors.color_total(0), None);
    }

    #[test]
    fn retire_saturated_is_noop_when_nothing_flagged() {
        let mut colors = Colors::new(vec![1, 1], vec![1, 1], 10, 10).unwrap();
        let stats = colors.retire_saturated(&[0, 0]);
        assert_eq!(stats, RetireStats::default());
    }

    #[test]
    fn retire_saturated_drops_pixels_and_empty_colors() {
        let mut colors = Colors::new(vec![1, 2], vec![1, 2], 10, 10).unwrap();
        let stats = colors.retire_saturated(&[1, 0]);
        assert_eq!(stats.newly_retired_pixels, 1);
        assert_eq!(stats.newly_retired_colors, 1);
        assert_eq!(colors.color_total(1), None);
        assert_eq!(colors.color_total(2), Some(1));
    }

    #[test]
    fn retire_saturated_is_idempotent_on_repeat() {
        let mut colors = Colors::new(vec![1, 2], vec![1, 2], 10, 10).unwrap();
        colors.retire_saturated(&[1, 0]);
        let stats = colors.retire_saturated(&[1, 0]);
        assert_eq!(stats, RetireStats::default());
    }

    #[test]
    fn finecolor_averages_restricted_to_valid_pixels() {
        let colors = Colors::new(vec![1, 1, 0], vec![1, 1, 0], 10, 10).unwrap();
        let averages = colors.finecolor_averages(&[2.0, 4.0, 100.0]);
        assert_eq!(averages.get(&1), Some(&3.0));
        assert_eq!(averages.get(&0), None);
    }

    #[test]
    fn color_mean_matches_manual_average() {
        let colors = Colors::new(vec![1, 1, 2], vec![1, 1, 1], 10, 10).unwrap();
        assert_eq!(colors.color_mean(&[1.0, 3.0, 10.0], 1), Some(2.0));
        assert_eq!(colors.color_mean(&[1.0, 3.0, 10.0], 2), Some(10.0));
    }
}
