//! Shared fixtures: synthetic audio, WAV encoding and a scaled-down engine
//! configuration so scenarios run on seconds of audio instead of minutes.
#![allow(dead_code)]

use std::f32::consts::PI;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use sonicgen::config::{EngineConfig, RetryConfig, SegmentAnchor};

/// Multi-tone "music": the tone pair changes four times a second, so the
/// spectrogram carries distinct peaks spread over time.
pub fn synth_music(seconds: f32, sample_rate: u32, seed: u32) -> Vec<f32> {
    let total = (seconds * sample_rate as f32) as usize;
    let step = sample_rate as usize / 4;
    (0..total)
        .map(|i| {
            let segment = (i / step) as u32;
            // Moduli 40 and 29 are coprime, so the tone-pair sequence only
            // repeats after 290 s and excerpts stay unambiguous.
            let f1 = 220.0 + ((segment.wrapping_mul(7).wrapping_add(seed)) % 40) as f32 * 55.0;
            let f2 = 330.0 + ((segment.wrapping_mul(13).wrapping_add(seed)) % 29) as f32 * 70.0;
            let t = i as f32 / sample_rate as f32;
            0.5 * (2.0 * PI * f1 * t).sin() + 0.3 * (2.0 * PI * f2 * t).sin()
        })
        .collect()
}

pub fn white_noise(seconds: f32, sample_rate: u32, seed: u64) -> Vec<f32> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..(seconds * sample_rate as f32) as usize)
        .map(|_| rng.gen_range(-0.8..0.8))
        .collect()
}

/// Minimal 16-bit mono PCM WAV container.
pub fn wav_bytes(pcm: &[f32], sample_rate: u32) -> Vec<u8> {
    let data_len = (pcm.len() * 2) as u32;
    let mut out = Vec::with_capacity(44 + pcm.len() * 2);

    out.extend_from_slice(b"RIFF");
    out.extend_from_slice(&(36 + data_len).to_le_bytes());
    out.extend_from_slice(b"WAVE");
    out.extend_from_slice(b"fmt ");
    out.extend_from_slice(&16u32.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes()); // PCM
    out.extend_from_slice(&1u16.to_le_bytes()); // mono
    out.extend_from_slice(&sample_rate.to_le_bytes());
    out.extend_from_slice(&(sample_rate * 2).to_le_bytes());
    out.extend_from_slice(&2u16.to_le_bytes());
    out.extend_from_slice(&16u16.to_le_bytes());
    out.extend_from_slice(b"data");
    out.extend_from_slice(&data_len.to_le_bytes());
    for &sample in pcm {
        let v = (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

/// Engine defaults with the length thresholds shrunk to test scale. DSP
/// parameters stay at their production values.
pub fn scaled_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.sampling.min_fingerprint_count = 40;
    config.sampling.min_matchable = 150;
    config.sampling.anchors = vec![
        SegmentAnchor { length: 150, num_segments: 3, hashes_per_segment: 40 },
        SegmentAnchor { length: 2_000, num_segments: 5, hashes_per_segment: 80 },
    ];
    config.search.min_matches = 4;
    config.service.retry = RetryConfig { attempts: 2, base_delay_ms: 1 };
    config
}
