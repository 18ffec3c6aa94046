//! Audio decoding and resampling.
//!
//! Accepts a compressed audio blob, decodes it with symphonia, down-mixes
//! to mono by arithmetic mean and resamples to the engine sample rate.

use std::io::Cursor;

use rayon::{iter::ParallelIterator, slice::ParallelSlice};
use rubato::{Resampler, SincFixedIn, SincInterpolationParameters, WindowFunction};
use symphonia::core::{
    audio::SampleBuffer,
    codecs::{Decoder, DecoderOptions},
    formats::{FormatOptions, FormatReader, Track},
    io::MediaSourceStream,
    meta::MetadataOptions,
    probe::Hint,
};

use crate::error::{EngineError, Result};

/// Decode a compressed blob into mono PCM at `target_rate`.
pub fn ingest(bytes: &[u8], target_rate: u32) -> Result<Vec<f32>> {
    let (samples, rate, channels) = decode_audio(bytes)?;
    let mono = to_mono(&samples, channels);
    resample(&mono, rate, target_rate)
}

fn resample(input: &[f32], input_rate: u32, output_rate: u32) -> Result<Vec<f32>> {
    if input_rate == output_rate {
        return Ok(input.to_vec());
    }

    let chunk_size = 1024;
    let thread_batch_size = chunk_size * 100;

    let batches: Vec<Vec<f32>> = input
        .par_chunks(thread_batch_size)
        .map(|segment| resample_segment(segment, chunk_size, input_rate, output_rate))
        .collect::<Result<_>>()?;

    Ok(batches.into_iter().flatten().collect())
}

fn resample_segment(
    segment: &[f32],
    chunk_size: usize,
    input_rate: u32,
    output_rate: u32,
) -> Result<Vec<f32>> {
    let params = SincInterpolationParameters {
        sinc_len: 128,
        f_cutoff: 0.95,
        oversampling_factor: 64,
        interpolation: rubato::SincInterpolationType::Linear,
        window: WindowFunction::BlackmanHarris2,
    };

    let mut resampler = SincFixedIn::<f32>::new(
        output_rate as f64 / input_rate as f64,
        2.0,
        params,
        chunk_size,
        1,
    )
    .map_err(|e| EngineError::Decode(format!("resampler init: {e}")))?;

    let mut output = Vec::new();
    let mut position = 0;

    while position + chunk_size <= segment.len() {
        let chunk = vec![segment[position..position + chunk_size].to_vec()];
        let result = resampler
            .process(&chunk, None)
            .map_err(|e| EngineError::Decode(format!("resample: {e}")))?;
        output.extend_from_slice(&result[0]);
        position += chunk_size;
    }

    let remaining = segment.len() - position;
    if remaining > 0 {
        let mut padded = vec![0.0; chunk_size];
        padded[..remaining].copy_from_slice(&segment[position..]);
        let result = resampler
            .process(&[padded], None)
            .map_err(|e| EngineError::Decode(format!("resample tail: {e}")))?;
        output.extend_from_slice(&result[0]);
    }

    Ok(output)
}

/// Down-mix interleaved samples to mono by arithmetic mean across channels.
fn to_mono(input: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return input.to_vec();
    }
    input
        .par_chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

fn decode_audio(bytes: &[u8]) -> Result<(Vec<f32>, u32, usize)> {
    let cursor = Cursor::new(bytes.to_vec());
    let media_source_stream = MediaSourceStream::new(Box::new(cursor), Default::default());

    let mut format = probe_format(media_source_stream)?;
    let track = format
        .default_track()
        .ok_or_else(|| EngineError::Decode("no default audio track".into()))?;

    let sample_rate = track
        .codec_params
        .sample_rate
        .ok_or_else(|| EngineError::Decode("unknown sample rate".into()))?;
    let channels = track
        .codec_params
        .channels
        .ok_or_else(|| EngineError::Decode("unknown channel layout".into()))?
        .count();
    let track_id = track.id;

    let mut decoder = make_decoder(track)?;
    let mut samples = Vec::new();

    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(_) => break,
        };
        if packet.track_id() != track_id {
            continue;
        }

        // Corrupt packets are skipped rather than failing the whole blob.
        let decoded = match decoder.decode(&packet) {
            Ok(decoded) => decoded,
            Err(_) => continue,
        };

        let mut buffer = SampleBuffer::<f32>::new(decoded.capacity() as u64, *decoded.spec());
        buffer.copy_interleaved_ref(decoded);
        samples.extend_from_slice(buffer.samples());
    }

    if samples.is_empty() {
        return Err(EngineError::Decode("no decodable audio packets".into()));
    }

    Ok((samples, sample_rate, channels))
}

fn probe_format(media_source_stream: MediaSourceStream) -> Result<Box<dyn FormatReader>> {
    let hint = Hint::new();
    let probed = symphonia::default::get_probe()
        .format(
            &hint,
            media_source_stream,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|e| EngineError::Decode(format!("unsupported format: {e}")))?;

    Ok(probed.format)
}

fn make_decoder(track: &Track) -> Result<Box<dyn Decoder>> {
    symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .map_err(|e| EngineError::Decode(format!("no decoder for track: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn garbage_bytes_fail_with_decode_error() {
        let err = ingest(&[0u8; 64], 22_050).unwrap_err();
        assert!(matches!(err, EngineError::Decode(_)));
    }

    #[test]
    fn mono_mixdown_averages_channels() {
        let interleaved = [1.0, 3.0, -1.0, 1.0, 0.0, 2.0];
        assert_eq!(to_mono(&interleaved, 2), vec![2.0, 0.0, 1.0]);
    }

    #[test]
    fn resample_is_identity_at_equal_rates() {
        let pcm = vec![0.25f32; 4096];
        assert_eq!(resample(&pcm, 22_050, 22_050).unwrap(), pcm);
    }
}
