//! Landmark extraction.
//!
//! Picks spectral peaks, pairs each anchor peak with nearby targets and
//! packs every pair into a fixed-width hash token. The token is a pure
//! function of `(f_anchor, f_target, dt)`, so shifting the audio in time
//! moves `t_ref` but leaves the hashes untouched.

use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::config::{PairingConfig, PeakConfig};
use crate::error::EngineError;

const FREQ_BITS: u32 = 13;
const DT_BITS: u32 = 14;
const TOKEN_HEX_WIDTH: usize = 10;

/// Fixed-width landmark hash.
///
/// Bit layout, low to high: `dt` (14 bits), `f_target` (13 bits),
/// `f_anchor` (13 bits). Rendered as ten lowercase hex characters, which
/// round-trip through text transports unchanged on every platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HashToken(u64);

impl HashToken {
    pub fn pack(f_anchor: usize, f_target: usize, dt: u32) -> Self {
        let fa = (f_anchor as u64) & ((1 << FREQ_BITS) - 1);
        let fb = (f_target as u64) & ((1 << FREQ_BITS) - 1);
        let dt = u64::from(dt) & ((1 << DT_BITS) - 1);
        HashToken((fa << (FREQ_BITS + DT_BITS)) | (fb << DT_BITS) | dt)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for HashToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:010x}", self.0)
    }
}

impl FromStr for HashToken {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != TOKEN_HEX_WIDTH || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(EngineError::MalformedHash(s.to_string()));
        }
        u64::from_str_radix(s, 16)
            .map(HashToken)
            .map_err(|_| EngineError::MalformedHash(s.to_string()))
    }
}

impl Serialize for HashToken {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for HashToken {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// One landmark emission: a hash anchored at frame `t_ref`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint {
    pub hash: HashToken,
    pub t_ref: u32,
}

/// Find spectral peaks in a time-major magnitude spectrogram.
///
/// A point is a peak iff it is a strict local maximum within a rectangle of
/// radius `(neighborhood_time, neighborhood_freq)` and exceeds the
/// percentile magnitude floor. Plateau ties go to the lexicographically
/// smallest `(t, f)`. Returned peaks are sorted by `(t, f)` ascending.
pub fn find_peaks(spectrogram: &[Vec<f32>], cfg: &PeakConfig) -> Vec<(usize, usize)> {
    if spectrogram.is_empty() {
        return Vec::new();
    }
    let frames = spectrogram.len();
    let bins = spectrogram[0].len();

    let floor = percentile_floor(spectrogram, cfg.percentile_floor);

    // Separable 2D maximum filter: time pass per bin, then frequency pass
    // per frame.
    let mut time_max = vec![vec![0.0f32; bins]; frames];
    let mut column = vec![0.0f32; frames];
    for f in 0..bins {
        for t in 0..frames {
            column[t] = spectrogram[t][f];
        }
        let maxed = sliding_max(&column, cfg.neighborhood_time);
        for t in 0..frames {
            time_max[t][f] = maxed[t];
        }
    }

    let mut peaks = Vec::new();
    for t in 0..frames {
        let window_max = sliding_max(&time_max[t], cfg.neighborhood_freq);
        for f in 0..bins {
            let val = spectrogram[t][f];
            if val > floor && val == window_max[f] && wins_ties(spectrogram, t, f, cfg) {
                peaks.push((t, f));
            }
        }
    }
    peaks
}

/// Reject a candidate whose magnitude is tied with an earlier `(t, f)` point
/// inside its neighborhood. Only runs on filter survivors, so the exact scan
/// stays cheap.
fn wins_ties(spectrogram: &[Vec<f32>], t: usize, f: usize, cfg: &PeakConfig) -> bool {
    let frames = spectrogram.len();
    let bins = spectrogram[0].len();
    let val = spectrogram[t][f];

    let t_lo = t.saturating_sub(cfg.neighborhood_time);
    let t_hi = (t + cfg.neighborhood_time).min(frames - 1);
    for tn in t_lo..=t_hi {
        let f_lo = f.saturating_sub(cfg.neighborhood_freq);
        let f_hi = (f + cfg.neighborhood_freq).min(bins - 1);
        for fn_ in f_lo..=f_hi {
            if (tn, fn_) < (t, f) && spectrogram[tn][fn_] == val {
                return false;
            }
        }
    }
    true
}

/// Nearest-rank percentile of the whole spectrogram.
fn percentile_floor(spectrogram: &[Vec<f32>], percentile: f64) -> f32 {
    let mut flat: Vec<f32> = spectrogram.iter().flatten().copied().collect();
    if flat.is_empty() {
        return 0.0;
    }
    let idx = ((flat.len() - 1) as f64 * percentile.clamp(0.0, 1.0)).round() as usize;
    let (_, floor, _) = flat.select_nth_unstable_by(idx, f32::total_cmp);
    *floor
}

/// Sliding-window maximum with the given radius, via a monotonic deque.
fn sliding_max(values: &[f32], radius: usize) -> Vec<f32> {
    let n = values.len();
    let mut out = vec![0.0f32; n];
    let mut deque: VecDeque<usize> = VecDeque::new();
    let mut next = 0usize;

    for i in 0..n {
        let right = (i + radius).min(n - 1);
        while next <= right {
            while let Some(&back) = deque.back() {
                if values[back] < values[next] {
                    deque.pop_back();
                } else {
                    break;
                }
            }
            deque.push_back(next);
            next += 1;
        }
        while let Some(&front) = deque.front() {
            if front + radius < i {
                deque.pop_front();
            } else {
                break;
            }
        }
        out[i] = values[*deque.front().expect("window never empty")];
    }
    out
}

/// Pair anchors with later targets and emit hashes in anchor-major,
/// fan-minor order.
///
/// `peaks` must be sorted by `(t, f)` ascending, as produced by
/// [`find_peaks`]. Duplicate emissions are allowed; the ingest path
/// coalesces them.
pub fn generate_hashes(peaks: &[(usize, usize)], cfg: &PairingConfig) -> Vec<Fingerprint> {
    let mut fingerprints = Vec::new();

    for (i, &(t1, f1)) in peaks.iter().enumerate() {
        let mut taken = 0usize;
        for &(t2, f2) in &peaks[i + 1..] {
            let dt = (t2 - t1) as u32;
            if dt == 0 {
                continue;
            }
            if dt > cfg.max_delta_t {
                break;
            }
            if f1.abs_diff(f2) as u32 > cfg.max_delta_f {
                continue;
            }

            fingerprints.push(Fingerprint {
                hash: HashToken::pack(f1, f2, dt),
                t_ref: t1 as u32,
            });
            taken += 1;
            if taken >= cfg.fan_out {
                break;
            }
        }
    }

    fingerprints
}

/// Cap emissions to `max_per_window` in any rolling window of
/// `window_frames` frames. Relies on `t_ref` being non-decreasing, which the
/// anchor-major emission order guarantees.
pub fn rate_limit(
    fingerprints: Vec<Fingerprint>,
    max_per_window: u32,
    window_frames: u32,
) -> Vec<Fingerprint> {
    if max_per_window == 0 {
        return fingerprints;
    }

    let mut kept = Vec::with_capacity(fingerprints.len());
    let mut recent: VecDeque<u32> = VecDeque::new();

    for fp in fingerprints {
        while let Some(&t) = recent.front() {
            if fp.t_ref - t >= window_frames {
                recent.pop_front();
            } else {
                break;
            }
        }
        if (recent.len() as u32) < max_per_window {
            recent.push_back(fp.t_ref);
            kept.push(fp);
        }
    }
    kept
}
