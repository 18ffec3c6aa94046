//! Segment sampling for long queries.
//!
//! Probing every hash of an hour-long fingerprint is wasteful; a handful of
//! evenly spaced windows recalls the same sources. Window count and size
//! scale with fingerprint length through piecewise-linear interpolation over
//! an anchor table.

use serde::Serialize;

use crate::config::SegmentAnchor;
use crate::dsp::Fingerprint;

/// How a query was cut out of the full fingerprint. `query_len` is the
/// flattened query length and the denominator of the match score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SegmentPlan {
    pub query_len: usize,
    pub num_segments: usize,
    pub hashes_per_segment: usize,
}

/// Interpolate `(num_segments, hashes_per_segment)` for a fingerprint of
/// `len` hashes. Linear between anchors, rounded to nearest, clamped to the
/// first/last anchor outside the table range.
pub fn interpolate(len: usize, anchors: &[SegmentAnchor]) -> (usize, usize) {
    assert!(!anchors.is_empty(), "segment anchor table must not be empty");

    let first = &anchors[0];
    if len <= first.length {
        return (first.num_segments, first.hashes_per_segment);
    }
    let last = &anchors[anchors.len() - 1];
    if len >= last.length {
        return (last.num_segments, last.hashes_per_segment);
    }

    for pair in anchors.windows(2) {
        let (a, b) = (&pair[0], &pair[1]);
        if len < b.length {
            let t = (len - a.length) as f64 / (b.length - a.length) as f64;
            let lerp = |lo: usize, hi: usize| -> usize {
                (lo as f64 + t * (hi as f64 - lo as f64)).round() as usize
            };
            return (
                lerp(a.num_segments, b.num_segments),
                lerp(a.hashes_per_segment, b.hashes_per_segment),
            );
        }
    }
    unreachable!("anchors are ascending by length");
}

/// Cut evenly spaced contiguous windows out of `fingerprint` and flatten
/// them into the query list, preserving every entry's `t_ref`.
pub fn sample(fingerprint: &[Fingerprint], anchors: &[SegmentAnchor]) -> (Vec<Fingerprint>, SegmentPlan) {
    let len = fingerprint.len();
    let (num_segments, hashes_per_segment) = interpolate(len, anchors);
    let hashes_per_segment = hashes_per_segment.min(len);

    let mut query = Vec::with_capacity(num_segments * hashes_per_segment);
    if num_segments <= 1 {
        query.extend_from_slice(&fingerprint[..hashes_per_segment]);
    } else {
        let span = len - hashes_per_segment;
        for k in 0..num_segments {
            let start = k * span / (num_segments - 1);
            query.extend_from_slice(&fingerprint[start..start + hashes_per_segment]);
        }
    }

    let plan = SegmentPlan {
        query_len: query.len(),
        num_segments,
        hashes_per_segment,
    };
    (query, plan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SamplingConfig;
    use crate::dsp::HashToken;

    fn default_anchors() -> Vec<SegmentAnchor> {
        SamplingConfig::default().anchors
    }

    fn fake_fingerprint(len: usize) -> Vec<Fingerprint> {
        (0..len)
            .map(|i| Fingerprint {
                hash: HashToken::pack(i % 1024, (i * 3) % 1024, (i % 200 + 1) as u32),
                t_ref: i as u32,
            })
            .collect()
    }

    #[test]
    fn anchor_lengths_map_exactly() {
        let anchors = default_anchors();
        assert_eq!(interpolate(10_000, &anchors), (3, 1_000));
        assert_eq!(interpolate(50_000, &anchors), (5, 1_500));
        assert_eq!(interpolate(200_000, &anchors), (8, 2_000));
        assert_eq!(interpolate(1_000_000, &anchors), (12, 3_000));
    }

    #[test]
    fn interpolation_is_linear_between_anchors() {
        let anchors = default_anchors();
        // Midway between the first two anchors.
        assert_eq!(interpolate(30_000, &anchors), (4, 1_250));
        // Midway between the last two anchors.
        assert_eq!(interpolate(600_000, &anchors), (10, 2_500));
    }

    #[test]
    fn lengths_outside_the_table_clamp() {
        let anchors = default_anchors();
        assert_eq!(interpolate(1, &anchors), (3, 1_000));
        assert_eq!(interpolate(50_000_000, &anchors), (12, 3_000));
    }

    #[test]
    fn windows_are_evenly_spaced_and_preserve_t_ref() {
        let fp = fake_fingerprint(10_000);
        let (query, plan) = sample(&fp, &default_anchors());

        assert_eq!(plan.num_segments, 3);
        assert_eq!(plan.hashes_per_segment, 1_000);
        assert_eq!(plan.query_len, 3_000);
        assert_eq!(query.len(), 3_000);

        // Segment k starts at floor(k * (L - hps) / (n - 1)).
        assert_eq!(query[0], fp[0]);
        assert_eq!(query[1_000], fp[4_500]);
        assert_eq!(query[2_000], fp[9_000]);
        assert_eq!(query[2_999], fp[9_999]);
    }

    #[test]
    fn short_list_collapses_to_one_window() {
        let anchors = vec![SegmentAnchor { length: 100, num_segments: 1, hashes_per_segment: 50 }];
        let fp = fake_fingerprint(40);
        let (query, plan) = sample(&fp, &anchors);
        assert_eq!(plan.query_len, 40);
        assert_eq!(query, fp);
    }
}
