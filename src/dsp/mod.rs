//! DSP pipeline glue.
//!
//! Wires decoding, spectral analysis and landmark hashing together to
//! produce the fingerprint of an audio input.

use crate::config::EngineConfig;
use crate::error::Result;

pub mod decode;
pub mod landmarks;
pub mod spectrogram;

pub use landmarks::{Fingerprint, HashToken};

/// Fingerprint mono PCM already at the engine sample rate.
///
/// Inputs shorter than one FFT window yield an empty fingerprint.
pub fn fingerprint_pcm(pcm: &[f32], config: &EngineConfig) -> Vec<Fingerprint> {
    let spec = spectrogram::spectrogram(pcm, config.audio.n_fft, config.audio.hop);
    let peaks = landmarks::find_peaks(&spec, &config.peaks);
    let fingerprints = landmarks::generate_hashes(&peaks, &config.pairing);

    match config.pairing.max_hashes_per_second {
        Some(cap) => landmarks::rate_limit(fingerprints, cap, config.audio.frames_per_second()),
        None => fingerprints,
    }
}

/// Full pipeline for a compressed blob: decode, down-mix, resample,
/// fingerprint.
pub fn fingerprint_bytes(bytes: &[u8], config: &EngineConfig) -> Result<Vec<Fingerprint>> {
    let pcm = decode::ingest(bytes, config.audio.sample_rate)?;
    Ok(fingerprint_pcm(&pcm, config))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Multi-tone test signal with tone changes every `step` samples, so the
    /// spectrogram has distinct peaks spread over time.
    pub(crate) fn synth_music(seconds: f32, sample_rate: u32, seed: u32) -> Vec<f32> {
        use std::f32::consts::PI;

        let total = (seconds * sample_rate as f32) as usize;
        let step = sample_rate as usize / 4;
        (0..total)
            .map(|i| {
                let segment = (i / step) as u32;
                let f1 = 220.0 + ((segment.wrapping_mul(7).wrapping_add(seed)) % 40) as f32 * 55.0;
                let f2 = 330.0 + ((segment.wrapping_mul(13).wrapping_add(seed)) % 30) as f32 * 70.0;
                let t = i as f32 / sample_rate as f32;
                0.5 * (2.0 * PI * f1 * t).sin() + 0.3 * (2.0 * PI * f2 * t).sin()
            })
            .collect()
    }

    #[test]
    fn empty_pcm_yields_zero_hashes() {
        let config = EngineConfig::default();
        assert!(fingerprint_pcm(&[], &config).is_empty());
        assert!(fingerprint_pcm(&vec![0.0; 100], &config).is_empty());
    }

    #[test]
    fn fingerprints_are_byte_identical_across_runs() {
        let config = EngineConfig::default();
        let pcm = synth_music(4.0, config.audio.sample_rate, 3);
        let a = fingerprint_pcm(&pcm, &config);
        let b = fingerprint_pcm(&pcm, &config);
        assert!(!a.is_empty());
        assert_eq!(a, b);
    }

    #[test]
    fn silence_prefix_shifts_t_refs_uniformly() {
        let config = EngineConfig::default();
        let sr = config.audio.sample_rate;
        let hop = config.audio.hop;
        let shift_frames = 8u32;

        let pcm = synth_music(15.0, sr, 11);
        let mut shifted = vec![0.0f32; hop * shift_frames as usize];
        shifted.extend_from_slice(&pcm);

        let base = fingerprint_pcm(&pcm, &config);
        let moved = fingerprint_pcm(&shifted, &config);
        assert!(!base.is_empty());

        // Hashes anchored well inside the signal appear in both runs with
        // t_ref offset by exactly the prepended frame count; boundary
        // anchors may differ.
        let margin = config.pairing.max_delta_t + shift_frames;
        let interior: Vec<_> = base
            .iter()
            .filter(|fp| fp.t_ref > margin && fp.t_ref < base.last().unwrap().t_ref - margin)
            .collect();
        assert!(!interior.is_empty());

        let moved_set: std::collections::HashSet<_> = moved
            .iter()
            .map(|fp| (fp.hash, fp.t_ref))
            .collect();
        let preserved = interior
            .iter()
            .filter(|fp| moved_set.contains(&(fp.hash, fp.t_ref + shift_frames)))
            .count();
        assert!(
            preserved * 10 >= interior.len() * 8,
            "only {preserved} of {} interior landmarks survived the shift",
            interior.len()
        );
    }
}
