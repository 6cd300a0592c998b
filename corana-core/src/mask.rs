//! Mask partitioning: splitting the M masked detector elements as evenly
//! as possible among W workers, and verifying the resulting counts/offsets
//! partition M exactly.
//!
//! Grounded directly on `CommSystemUtil.divideAmongWorkers` /
//! `checkCountsOffsets`: floor-division with the remainder spread over the
//! first `r` workers.

use crate::error::{CoranaError, Result};

/// The balanced split of `M` elements across `num_workers` workers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    pub offsets: Vec<usize>,
    pub counts: Vec<usize>,
}

impl Partition {
    /// `divideAmongWorkers(dataLength, numWorkers)`: `k = dataLength /
    /// numWorkers` (floor), `r = dataLength % numWorkers`; the first `r`
    /// workers get `k + 1`, the rest get `k`.
    pub fn balanced(data_length: usize, num_workers: usize) -> Result<Self> {
        if num_workers == 0 {
            return Err(CoranaError::Topology("num_workers must be >= 1".into()));
        }
        let k = data_length / num_workers;
        let mut r = data_length % num_workers;

        let mut offsets = Vec::with_capacity(num_workers);
        let mut counts = Vec::with_capacity(num_workers);
        let mut next_offset = 0usize;
        for _ in 0..num_workers {
            offsets.push(next_offset);
            let mut count = k;
            if r > 0 {
                count += 1;
                r -= 1;
            }
            counts.push(count);
            next_offset += count;
        }

        let partition = Partition { offsets, counts };
        partition.check(data_length)?;
        Ok(partition)
    }

    /// Verifies `counts`/`offsets` partition `n` exactly: `sum(counts) ==
    /// n`, `offsets[0] == 0`, `offsets[i] == offsets[i-1] + counts[i-1]`,
    /// `offsets[-1] + counts[-1] == n`. Mirrors `checkCountsOffsets`.
    pub fn check(&self, n: usize) -> Result<()> {
        let bad = |detail: String| {
            CoranaError::Invariant(format!(
                "counts={:?} offsets={:?} do not partition n={}: {}",
                self.counts, self.offsets, n, detail
            ))
        };

        if self.counts.len() != self.offsets.len() {
            return Err(bad("length mismatch".into()));
        }
        let sum: usize = self.counts.iter().sum();
        if sum != n {
            return Err(bad(format!("sum(counts)={sum} != n")));
        }
        if self.offsets.first() != Some(&0) {
            return Err(bad("offsets[0] != 0".into()));
        }
        for i in 1..self.offsets.len() {
            let expected = self.offsets[i - 1] + self.counts[i - 1];
            if self.offsets[i] != expected {
                return Err(bad(format!("offsets[{i}] != offsets[{}]+counts[{}]", i - 1, i - 1)));
            }
        }
        let last = self.offsets.len() - 1;
        if self.offsets[last] + self.counts[last] != n {
            return Err(bad("offsets[-1]+counts[-1] != n".into()));
        }
        Ok(())
    }

    pub fn num_workers(&self) -> usize { self.counts.len() }

    /// The contiguous `[start, end)` range of the flattened masked index
    /// space owned by worker `w`.
    pub fn range(&self, w: usize) -> std::ops::Range<usize> {
        self.offsets[w]..self.offsets[w] + self.counts[w]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evenly_divisible_case() {
        let p = Partition::balanced(6, 3).unwrap();
        assert_eq!(p.counts, vec![2, 2, 2]);
        assert_eq!(p.offsets, vec![0, 2, 4]);
    }

    #[test]
    fn remainder_spread_over_first_workers() {
        // divideAmongWorkers(11, 3) -> offsets=[0,4,8], counts=[4,4,3]
        let p = Partition::balanced(11, 3).unwrap();
        assert_eq!(p.offsets, vec![0, 4, 8]);
        assert_eq!(p.counts, vec![4, 4, 3]);
    }

    #[test]
    fn single_worker_takes_everything() {
        let p = Partition::balanced(7, 1).unwrap();
        assert_eq!(p.counts, vec![7]);
        assert_eq!(p.offsets, vec![0]);
    }

    #[test]
    fn check_rejects_bad_offsets() {
        let bad = Partition { counts: vec![2, 2, 2], offsets: vec![2, 4, 6] };
        assert!(bad.check(6).is_err());
    }

    #[test]
    fn check_rejects_wrong_total() {
        let bad = Partition { counts: vec![2, 2, 2], offsets: vec![0, 2, 4] };
        assert!(bad.check(7).is_err());
    }

    #[test]
    fn range_matches_offsets_and_counts() {
        let p = Partition::balanced(11, 3).unwrap();
        assert_eq!(p.range(0), 0..4);
        assert_eq!(p.range(2), 8..11);
    }
}
