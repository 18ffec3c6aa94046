//! Engine configuration.
//!
//! Every tunable of the pipeline lives here with its default value. Values
//! can be overridden through an optional `sonicgen.toml` next to the binary
//! or through `SONICGEN_*` environment variables (`__` separates sections,
//! e.g. `SONICGEN__SEARCH__MIN_MATCHES=8`).

use std::time::Duration;

use config::{Config, ConfigError, Environment, File as ConfigFile};
use serde::Deserialize;

/// Sample-rate and STFT geometry shared by every DSP stage.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Target sample rate; input audio is resampled to this.
    pub sample_rate: u32,
    /// STFT window length in samples.
    pub n_fft: usize,
    /// STFT hop in samples. Frame index `t` maps to `t * hop / sample_rate` seconds.
    pub hop: usize,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 22_050,
            n_fft: 2048,
            hop: 512,
        }
    }
}

impl AudioConfig {
    /// Number of spectrogram frames covering roughly one second of audio.
    pub fn frames_per_second(&self) -> u32 {
        self.sample_rate / self.hop as u32
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PeakConfig {
    /// Neighborhood radius in frequency bins.
    pub neighborhood_freq: usize,
    /// Neighborhood radius in time frames.
    pub neighborhood_time: usize,
    /// Magnitude floor as a percentile of the whole spectrogram, in `0..=1`.
    pub percentile_floor: f64,
}

impl Default for PeakConfig {
    fn default() -> Self {
        Self {
            neighborhood_freq: 20,
            neighborhood_time: 20,
            percentile_floor: 0.75,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PairingConfig {
    /// Maximum number of targets paired with one anchor.
    pub fan_out: usize,
    /// Targets must lie within this many frames after the anchor.
    pub max_delta_t: u32,
    /// Targets must lie within this many bins of the anchor frequency.
    pub max_delta_f: u32,
    /// Optional cap on emitted pairs per rolling one-second window.
    /// Disabled when absent.
    pub max_hashes_per_second: Option<u32>,
}

impl Default for PairingConfig {
    fn default() -> Self {
        Self {
            fan_out: 10,
            max_delta_t: 200,
            max_delta_f: 100,
            max_hashes_per_second: None,
        }
    }
}

/// One point of the segment-sampling interpolation table.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct SegmentAnchor {
    pub length: usize,
    pub num_segments: usize,
    pub hashes_per_segment: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
    /// Sources producing fewer hashes than this are marked too short and
    /// nothing is persisted for them.
    pub min_fingerprint_count: usize,
    /// Fingerprints shorter than this are stored without attempting a match.
    pub min_matchable: usize,
    /// Interpolation anchors, ascending by `length`.
    pub anchors: Vec<SegmentAnchor>,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            min_fingerprint_count: 10_000,
            min_matchable: 10_000,
            anchors: vec![
                SegmentAnchor { length: 10_000, num_segments: 3, hashes_per_segment: 1_000 },
                SegmentAnchor { length: 50_000, num_segments: 5, hashes_per_segment: 1_500 },
                SegmentAnchor { length: 200_000, num_segments: 8, hashes_per_segment: 2_000 },
                SegmentAnchor { length: 1_000_000, num_segments: 12, hashes_per_segment: 3_000 },
            ],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// Fraction of distinct hashes (ranked by total count) treated as
    /// stop-words and excluded from probing.
    pub ignore_fraction: f64,
    /// Buckets with fewer contributing query hashes are dropped.
    pub min_matches: i64,
    /// Per-hash cap on probed occurrences, ordered by `(source_id, t_ref)`.
    pub max_hits_per_hash: i64,
    /// Maximum number of ranked candidates returned.
    pub limit_candidates: i64,
    /// Buckets within this many frames of a source's best delta are merged
    /// into it.
    pub delta_tolerance: i64,
    /// Minimum `matched_count / |query|` ratio for a match decision.
    pub match_threshold: f64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            ignore_fraction: 0.01,
            min_matches: 6,
            max_hits_per_hash: 1_000,
            limit_candidates: 50,
            delta_tolerance: 1,
            match_threshold: 0.10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Maximum occurrence rows per insert transaction.
    pub insert_chunk: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self { insert_chunk: 10_000 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts for a retried index call, including the first.
    pub attempts: u32,
    /// Backoff starts here and doubles per attempt.
    pub base_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self { attempts: 4, base_delay_ms: 250 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub bind_addr: String,
    /// Number of concurrent pipeline workers.
    pub workers: usize,
    /// Sources claimed per `claim_next` call.
    pub claim_batch: i64,
    /// A source not finished within this window is flagged and skipped.
    pub per_source_timeout_secs: u64,
    /// Idle sleep between empty claim batches.
    pub idle_poll_secs: u64,
    pub retry: RetryConfig,
    pub database_url: String,
    pub s3_bucket: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".into(),
            workers: 4,
            claim_batch: 8,
            per_source_timeout_secs: 900,
            idle_poll_secs: 30,
            retry: RetryConfig::default(),
            database_url: "postgres://localhost/sonicgen".into(),
            s3_bucket: "sonicgen-audio".into(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub audio: AudioConfig,
    pub peaks: PeakConfig,
    pub pairing: PairingConfig,
    pub sampling: SamplingConfig,
    pub search: SearchConfig,
    pub ingest: IngestConfig,
    pub service: ServiceConfig,
}

impl EngineConfig {
    pub fn load() -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(ConfigFile::with_name("sonicgen").required(false))
            .add_source(Environment::with_prefix("SONICGEN").separator("__"))
            .build()?
            .try_deserialize()
    }

    pub fn per_source_timeout(&self) -> Duration {
        Duration::from_secs(self.service.per_source_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.audio.sample_rate, 22_050);
        assert_eq!(cfg.audio.n_fft, 2048);
        assert_eq!(cfg.audio.hop, 512);
        assert_eq!(cfg.audio.frames_per_second(), 43);
        assert_eq!(cfg.pairing.fan_out, 10);
        assert_eq!(cfg.sampling.anchors.len(), 4);
        assert_eq!(cfg.search.min_matches, 6);
        assert!((cfg.search.match_threshold - 0.10).abs() < f64::EPSILON);
        assert_eq!(cfg.ingest.insert_chunk, 10_000);
    }
}
