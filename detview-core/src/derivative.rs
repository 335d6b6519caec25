//! Discrete derivative over per-record detection counts.
//!
//! Reports every `k` with `seq[k] != seq[k + 1]`. The sequence is laid out
//! twice in aligned scratch, once as-is (`a`) and once shifted left by one
//! (`b`), and `b - a` is checked for non-zero lanes 32 at a time.
//!
//! # Boundary
//!
//! `b[len - 1]` has no successor to copy. It is filled with `seq[len - 1]`
//! itself so the last comparison reads as "equal", and every lane past
//! `len - 1` is zero in both buffers.

use crate::counter::{CHUNK_SIZE, Lane, resize_scratch};
use crate::error::RecordError;

/// Reusable change-point detector with aligned scratch space
#[derive(Default)]
pub struct ChangePointDetector {
    current: Vec<Lane>,
    shifted: Vec<Lane>,
}

impl ChangePointDetector {
    /// Creates a detector with empty scratch
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the ascending indices `k` where `seq[k] != seq[k + 1]`
    ///
    /// # Errors
    ///
    /// Returns [`RecordError::Allocation`] if scratch space cannot grow.
    pub fn change_points(&mut self, seq: &[i8]) -> Result<Vec<u32>, RecordError> {
        let len = seq.len();
        if len < 2 {
            return Ok(Vec::new());
        }

        let chunks = len.div_ceil(CHUNK_SIZE);
        if chunks != self.current.len() {
            resize_scratch(&mut self.current, chunks)?;
            resize_scratch(&mut self.shifted, chunks)?;
        }
        self.layout(seq);

        let mut out = Vec::new();
        out.try_reserve(len / 8)?;
        for (n, (a, b)) in self.current.iter().zip(&self.shifted).enumerate() {
            let mut mask = diff_mask(a, b);
            while mask != 0 {
                let lane = mask.trailing_zeros() as usize;
                out.push((n * CHUNK_SIZE + lane) as u32);
                mask &= mask - 1;
            }
        }
        Ok(out)
    }

    fn layout(&mut self, seq: &[i8]) {
        let len = seq.len();
        let lanes = self.current.iter_mut().flat_map(|lane| lane.0.iter_mut());
        for (i, dst) in lanes.enumerate() {
            *dst = seq.get(i).copied().unwrap_or(0);
        }
        let lanes = self.shifted.iter_mut().flat_map(|lane| lane.0.iter_mut());
        for (i, dst) in lanes.enumerate() {
            *dst = match i {
                i if i + 1 < len => seq[i + 1],
                i if i + 1 == len => seq[i],
                _ => 0,
            };
        }
    }
}

/// Bitmask of lanes where `a` and `b` differ
#[inline]
fn diff_mask(a: &Lane, b: &Lane) -> u32 {
    #[cfg(target_arch = "x86_64")]
    {
        if is_x86_feature_detected!("avx2") {
            return unsafe { diff_mask_avx2(a, b) };
        }
    }

    diff_mask_scalar(a, b)
}

fn diff_mask_scalar(a: &Lane, b: &Lane) -> u32 {
    a.0.iter()
        .zip(b.0.iter())
        .enumerate()
        .filter(|(_, (x, y))| x != y)
        .fold(0u32, |mask, (i, _)| mask | (1 << i))
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2")]
unsafe fn diff_mask_avx2(a: &Lane, b: &Lane) -> u32 {
    use std::arch::x86_64::*;

    let a8 = unsafe { _mm256_load_si256(a.0.as_ptr().cast::<__m256i>()) };
    let b8 = unsafe { _mm256_load_si256(b.0.as_ptr().cast::<__m256i>()) };
    let delta = _mm256_sub_epi8(b8, a8);
    let zero_lanes = _mm256_cmpeq_epi8(delta, _mm256_setzero_si256());

    !(_mm256_movemask_epi8(zero_lanes) as u32)
}

/// Scalar implementation (portable fallback and test oracle)
pub fn change_points_scalar(seq: &[i8]) -> Vec<u32> {
    seq.windows(2)
        .enumerate()
        .filter(|(_, w)| w[0] != w[1])
        .map(|(k, _)| k as u32)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_sequence() {
        let mut detector = ChangePointDetector::new();
        let points = detector.change_points(&[0, 0, 1, 1, 0, 0, 0, 2, 0]).unwrap();
        assert_eq!(points, vec![1, 3, 6, 7]);
    }

    #[test]
    fn test_short_sequences() {
        let mut detector = ChangePointDetector::new();
        assert!(detector.change_points(&[]).unwrap().is_empty());
        assert!(detector.change_points(&[5]).unwrap().is_empty());
        assert_eq!(detector.change_points(&[5, 6]).unwrap(), vec![0]);
    }

    #[test]
    fn test_non_zero_tail_is_not_a_change() {
        // The last real element is non-zero; padding must not report len - 1
        let mut detector = ChangePointDetector::new();
        assert!(detector.change_points(&[3; 32]).unwrap().is_empty());
        assert!(detector.change_points(&[3; 33]).unwrap().is_empty());
        assert_eq!(detector.change_points(&[0, 0, 4]).unwrap(), vec![1]);
    }

    #[test]
    fn test_changes_across_chunk_boundary() {
        let mut seq = vec![0i8; 70];
        seq[31] = 1;
        seq[32] = 2;
        seq[64] = -1;
        let mut detector = ChangePointDetector::new();
        assert_eq!(detector.change_points(&seq).unwrap(), vec![30, 31, 32, 63, 64]);
        assert_eq!(detector.change_points(&seq).unwrap(), change_points_scalar(&seq));
    }

    #[test]
    fn test_wrapping_difference_still_detected() {
        // 127 - (-128) wraps to -1, which is still non-zero
        let mut detector = ChangePointDetector::new();
        assert_eq!(detector.change_points(&[-128, 127, 127]).unwrap(), vec![0]);
    }

    #[test]
    fn test_long_mixed_sequence() {
        let seq: Vec<i8> = vec![
            0, 0, 1, 1, 0, 0, 0, 0, 2, 0, 2, 2, 2, 2, 2, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1, 1, 1,
            2, 0, 0, 0, 1, 0, 0, 0, 0, 0, 0, 0, 1, 0,
        ];
        let mut detector = ChangePointDetector::new();
        assert_eq!(detector.change_points(&seq).unwrap(), change_points_scalar(&seq));
    }
}
