//! Spectral front-end.
//!
//! Turns mono PCM into a magnitude spectrogram: Hann-windowed frames,
//! forward FFT, magnitude of the first `n_fft / 2` linear bins. All later
//! stages work in integer `(frame, bin)` coordinates, so the output carries
//! no unit conversions.

use std::f32::consts::PI;

use rayon::prelude::*;
use rustfft::{num_complex::Complex, FftPlanner};

/// Split a PCM buffer into Hann-windowed frames of `n_fft` samples spaced
/// `hop` apart. Frames are taken without padding: input shorter than one
/// window yields no frames, and a trailing partial window is dropped.
pub fn frame(pcm: &[f32], n_fft: usize, hop: usize) -> Vec<Vec<f32>> {
    if pcm.len() < n_fft {
        return Vec::new();
    }

    let window = hann_window(n_fft);
    let count = (pcm.len() - n_fft) / hop + 1;

    (0..count)
        .map(|i| {
            let start = i * hop;
            pcm[start..start + n_fft]
                .iter()
                .zip(window.iter())
                .map(|(&s, &w)| s * w)
                .collect()
        })
        .collect()
}

/// Compute FFT magnitude spectra for each frame in `frames`.
///
/// Returns one magnitude vector of `n / 2` bins per frame, in frame order.
pub fn fft_magnitude(frames: Vec<Vec<f32>>) -> Vec<Vec<f32>> {
    if frames.is_empty() {
        return Vec::new();
    }

    let n = frames[0].len();
    let mut planner = FftPlanner::<f32>::new();
    let fft = planner.plan_fft_forward(n);

    frames
        .into_par_iter()
        .map(|frame| {
            let mut buffer: Vec<Complex<f32>> =
                frame.iter().map(|&v| Complex { re: v, im: 0.0 }).collect();
            fft.process(&mut buffer);

            buffer[..n / 2]
                .iter()
                .map(|c| (c.re * c.re + c.im * c.im).sqrt())
                .collect()
        })
        .collect()
}

/// Full front-end: windowed framing followed by magnitude FFT.
///
/// The result is time-major: `out[t][f]` is the magnitude of bin `f` in
/// frame `t`. Empty when `pcm.len() < n_fft`.
pub fn spectrogram(pcm: &[f32], n_fft: usize, hop: usize) -> Vec<Vec<f32>> {
    fft_magnitude(frame(pcm, n_fft, hop))
}

fn hann_window(size: usize) -> Vec<f32> {
    let n = size as f32;
    (0..size)
        .map(|i| 0.5 * (1.0 - (2.0 * PI * i as f32 / (n - 1.0)).cos()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_input_yields_empty_spectrogram() {
        let pcm = vec![0.5; 2047];
        assert!(spectrogram(&pcm, 2048, 512).is_empty());
    }

    #[test]
    fn frame_count_matches_hop_arithmetic() {
        // 2048 + 3 * 512 samples -> exactly 4 full windows.
        let pcm = vec![0.1; 2048 + 3 * 512];
        let frames = frame(&pcm, 2048, 512);
        assert_eq!(frames.len(), 4);
        assert!(frames.iter().all(|f| f.len() == 2048));

        // One sample short of the next hop boundary changes nothing.
        let pcm = vec![0.1; 2048 + 3 * 512 + 511];
        assert_eq!(frame(&pcm, 2048, 512).len(), 4);
    }

    #[test]
    fn pure_tone_peaks_in_expected_bin() {
        let sr = 22_050.0_f32;
        let n_fft = 2048;
        let freq = 1_000.0_f32;
        let pcm: Vec<f32> = (0..n_fft * 4)
            .map(|i| (2.0 * PI * freq * i as f32 / sr).sin())
            .collect();

        let spec = spectrogram(&pcm, n_fft, 512);
        assert!(!spec.is_empty());

        let expected_bin = (freq / sr * n_fft as f32).round() as usize;
        let (max_bin, _) = spec[0]
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .unwrap();
        assert!((max_bin as isize - expected_bin as isize).abs() <= 1);
    }

    #[test]
    fn output_is_deterministic() {
        let pcm: Vec<f32> = (0..10_000).map(|i| ((i * 37) % 97) as f32 / 97.0).collect();
        let a = spectrogram(&pcm, 2048, 512);
        let b = spectrogram(&pcm, 2048, 512);
        assert_eq!(a, b);
    }
}
