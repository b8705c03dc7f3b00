//! Sample transforms applied between decode and encode.
//!
//! Each step takes the audio by value and returns it together with a
//! [`StepOutcome`], so the caller can observe whether the step actually
//! changed anything. A step whose property already matches the target is a
//! `Skipped` no-op.

use super::PcmAudio;
use anyhow::{anyhow, Result};
use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use serde::Serialize;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NormalizeStep {
    ChannelMix,
    Resample,
    Requantize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    Applied,
    Skipped,
}

/// Remix to `target_channels`.
///
/// Downmixing to mono averages every channel. Other downmixes fold source
/// channel `n` into output channel `n % target`; upmixing repeats the
/// source channels.
pub fn mix_channels(audio: PcmAudio, target_channels: u16) -> (PcmAudio, StepOutcome) {
    if audio.channels == target_channels || audio.channels == 0 || target_channels == 0 {
        return (audio, StepOutcome::Skipped);
    }

    let src = audio.channels as usize;
    let dst = target_channels as usize;
    let frames = audio.frames();
    let mut mixed = Vec::with_capacity(frames * dst);

    for frame in audio.samples.chunks_exact(src) {
        if src > dst {
            let mut sums = vec![0.0f32; dst];
            let mut counts = vec![0u32; dst];
            for (ch, sample) in frame.iter().enumerate() {
                sums[ch % dst] += sample;
                counts[ch % dst] += 1;
            }
            mixed.extend(sums.iter().zip(&counts).map(|(sum, n)| sum / *n as f32));
        } else {
            mixed.extend((0..dst).map(|ch| frame[ch % src]));
        }
    }

    debug!(from = src, to = dst, frames, "Remixed channels");

    (
        PcmAudio {
            samples: mixed,
            channels: target_channels,
            ..audio
        },
        StepOutcome::Applied,
    )
}

/// Resample to `target_rate` with rubato's polynomial resampler.
pub fn resample(audio: PcmAudio, target_rate: u32) -> Result<(PcmAudio, StepOutcome)> {
    if audio.sample_rate == target_rate {
        return Ok((audio, StepOutcome::Skipped));
    }

    let channels = audio.channels as usize;
    let frames = audio.frames();

    if frames == 0 {
        return Ok((
            PcmAudio {
                sample_rate: target_rate,
                ..audio
            },
            StepOutcome::Applied,
        ));
    }

    let planar_input = deinterleave(&audio.samples, channels);

    // The whole signal goes through as a single chunk
    let mut resampler = FastFixedIn::<f32>::new(
        target_rate as f64 / audio.sample_rate as f64,
        1.0,
        PolynomialDegree::Septic,
        frames,
        channels,
    )
    .map_err(|e| anyhow!("Failed to create resampler: {}", e))?;

    let planar_output = resampler
        .process(&planar_input, None)
        .map_err(|e| anyhow!("Resampling failed: {}", e))?;

    let samples = interleave(planar_output);

    debug!(
        from = audio.sample_rate,
        to = target_rate,
        input_frames = frames,
        output_frames = samples.len() / channels,
        "Resampled audio"
    );

    Ok((
        PcmAudio {
            samples,
            sample_rate: target_rate,
            ..audio
        },
        StepOutcome::Applied,
    ))
}

/// Snap every sample onto the grid of a `target_bits` integer format.
pub fn requantize(audio: PcmAudio, target_bits: u16) -> (PcmAudio, StepOutcome) {
    if audio.bit_depth == target_bits {
        return (audio, StepOutcome::Skipped);
    }

    let scale = full_scale(target_bits);
    let samples = audio
        .samples
        .iter()
        .map(|s| (s * scale).round().clamp(-scale, scale - 1.0) / scale)
        .collect();

    debug!(from = audio.bit_depth, to = target_bits, "Requantized samples");

    (
        PcmAudio {
            samples,
            bit_depth: target_bits,
            ..audio
        },
        StepOutcome::Applied,
    )
}

/// 2^(bits-1): the magnitude of the most negative integer sample.
pub fn full_scale(bits: u16) -> f32 {
    (1u64 << (bits.clamp(2, 32) - 1)) as f32
}

/// [L, R, L, R, ...] -> [[L, L, ...], [R, R, ...]]
fn deinterleave(samples: &[f32], channels: usize) -> Vec<Vec<f32>> {
    let frames = samples.len() / channels;
    let mut planar = vec![Vec::with_capacity(frames); channels];

    for frame in samples.chunks_exact(channels) {
        for (ch, sample) in frame.iter().enumerate() {
            planar[ch].push(*sample);
        }
    }

    planar
}

/// [[L, L, ...], [R, R, ...]] -> [L, R, L, R, ...]
fn interleave(planar: Vec<Vec<f32>>) -> Vec<f32> {
    if planar.is_empty() {
        return Vec::new();
    }

    let frames = planar[0].len();
    let mut interleaved = Vec::with_capacity(frames * planar.len());
    for frame in 0..frames {
        for channel in &planar {
            interleaved.push(channel[frame]);
        }
    }

    interleaved
}
