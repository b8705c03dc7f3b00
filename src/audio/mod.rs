//! # Audio Processing Module
//!
//! The audio capabilities the conversion pipeline is built on. The pipeline
//! treats them as opaque operations and only talks to them through the
//! [`AudioBackend`] trait plus the pure sample transforms in [`normalize`].
//!
//! ## Key Components:
//! - **decode**: symphonia-based probing and full decoding of uploaded media
//! - **normalize**: channel mixing, resampling (rubato) and requantization
//! - **encode**: RIFF/WAVE writer with explicit parameters, plus an
//!   independent read-back used for verification
//! - **fingerprint**: SHA-256 content digests
//!
//! ## Canonical Output Format (defaults):
//! - **Channels**: Mono (1 channel)
//! - **Sample Rate**: 8kHz (8,000 Hz)
//! - **Bit Depth**: 16-bit linear PCM, little-endian

pub mod decode;       // Probe and decode via symphonia
pub mod encode;       // WAV writer and verification reader
pub mod fingerprint;  // SHA-256 file digests
pub mod normalize;    // Channel mix, resample, requantize

use serde::{Deserialize, Serialize};
use std::path::Path;

pub use decode::SymphoniaBackend;

/// Shape of an audio stream: what the "original_format" of a task reports
/// and what the configured target profile is expressed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioFormat {
    pub channels: u16,
    pub sample_rate: u32,
    /// Bits per sample
    pub bit_depth: u16,
}

impl AudioFormat {
    /// True when `self` has the same channel count and bit depth as
    /// `target` and a sample rate within `rate_tolerance` Hz of it.
    pub fn conforms_to(&self, target: &AudioFormat, rate_tolerance: u32) -> bool {
        self.channels == target.channels
            && self.bit_depth == target.bit_depth
            && self.sample_rate.abs_diff(target.sample_rate) <= rate_tolerance
    }
}

/// What a probe learns about an input without decoding it.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamInfo {
    pub codec: String,
    pub sample_rate: u32,
    pub channels: Option<u16>,
    pub bit_depth: Option<u16>,
}

/// Fully decoded audio held in memory.
///
/// Samples are interleaved 32-bit floats in [-1.0, 1.0]; `bit_depth`
/// records the resolution the samples represent, which is what
/// requantization changes.
#[derive(Debug, Clone, PartialEq)]
pub struct PcmAudio {
    pub samples: Vec<f32>,
    pub channels: u16,
    pub sample_rate: u32,
    pub bit_depth: u16,
}

impl PcmAudio {
    pub fn format(&self) -> AudioFormat {
        AudioFormat {
            channels: self.channels,
            sample_rate: self.sample_rate,
            bit_depth: self.bit_depth,
        }
    }

    /// Number of sample frames (one sample per channel).
    pub fn frames(&self) -> usize {
        if self.channels == 0 {
            0
        } else {
            self.samples.len() / self.channels as usize
        }
    }
}

/// Decode/encode capability consumed by the conversion pipeline.
///
/// Errors are returned as `anyhow::Error` with full context for the log;
/// the pipeline translates them into client-safe task errors.
pub trait AudioBackend: Send + Sync {
    /// Inspect container and track metadata without decoding packets.
    fn probe(&self, path: &Path) -> anyhow::Result<StreamInfo>;

    /// Decode the whole input into memory.
    fn decode(&self, path: &Path) -> anyhow::Result<PcmAudio>;

    /// Write `audio` to `path` using exactly the `target` parameters.
    /// `comment` is stamped into the file's INFO chunk.
    fn encode(
        &self,
        audio: &PcmAudio,
        target: &AudioFormat,
        comment: &str,
        path: &Path,
    ) -> anyhow::Result<()>;

    /// Read back the format of an encoded output file.
    fn inspect(&self, path: &Path) -> anyhow::Result<AudioFormat>;
}

#[cfg(test)]
pub(crate) mod test_support {
    //! WAV fixture generation shared by the tests of several modules.

    use std::path::{Path, PathBuf};

    /// Write a WAV file holding a 440Hz tone with the given shape.
    pub fn write_tone_wav(
        path: &Path,
        channels: u16,
        sample_rate: u32,
        bit_depth: u16,
        duration_seconds: f64,
    ) -> PathBuf {
        let frames = (duration_seconds * sample_rate as f64) as usize;
        let mut tone = Vec::with_capacity(frames * channels as usize);
        for i in 0..frames {
            let t = i as f32 / sample_rate as f32;
            let value = 0.3 * (2.0 * std::f32::consts::PI * 440.0 * t).sin();
            for _ in 0..channels {
                tone.push(value);
            }
        }

        let spec = hound::WavSpec {
            channels,
            sample_rate,
            bits_per_sample: bit_depth,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec).unwrap();
        for s in tone {
            match bit_depth {
                8 => writer.write_sample((s * 127.0) as i8).unwrap(),
                16 => writer.write_sample((s * 32767.0) as i16).unwrap(),
                24 => writer.write_sample((s * 8388607.0) as i32).unwrap(),
                other => panic!("unsupported fixture bit depth {}", other),
            }
        }
        writer.finalize().unwrap();
        path.to_path_buf()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conforms_to_uses_rate_tolerance() {
        let target = AudioFormat { channels: 1, sample_rate: 8000, bit_depth: 16 };
        let close = AudioFormat { channels: 1, sample_rate: 8007, bit_depth: 16 };
        let far = AudioFormat { channels: 1, sample_rate: 8011, bit_depth: 16 };
        let stereo = AudioFormat { channels: 2, sample_rate: 8000, bit_depth: 16 };

        assert!(close.conforms_to(&target, 10));
        assert!(!far.conforms_to(&target, 10));
        assert!(!stereo.conforms_to(&target, 10));
        assert!(!close.conforms_to(&target, 0));
    }

    #[test]
    fn test_frames() {
        let audio = PcmAudio { samples: vec![0.0; 10], channels: 2, sample_rate: 8000, bit_depth: 16 };
        assert_eq!(audio.frames(), 5);
    }
}
