//! Audio probing and decoding
//!
//! Uses symphonia for format-agnostic decoding (MP3, FLAC, AAC, WAV, OGG, ...).
//! [`SymphoniaBackend`] is the production [`AudioBackend`]: probing and
//! decoding go through symphonia, encoding and read-back through
//! [`super::encode`].

use super::{encode, AudioBackend, AudioFormat, PcmAudio, StreamInfo};
use anyhow::{Context, Result};
use std::fs::File;
use std::path::Path;
use symphonia::core::audio::{AudioBufferRef, SampleBuffer};
use symphonia::core::codecs::{CodecParameters, DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use tracing::debug;

/// Production audio backend.
#[derive(Debug, Default, Clone, Copy)]
pub struct SymphoniaBackend;

impl AudioBackend for SymphoniaBackend {
    fn probe(&self, path: &Path) -> Result<StreamInfo> {
        probe_file(path)
    }

    fn decode(&self, path: &Path) -> Result<PcmAudio> {
        decode_file(path)
    }

    fn encode(&self, audio: &PcmAudio, target: &AudioFormat, comment: &str, path: &Path) -> Result<()> {
        encode::write_wav_file(audio, target, comment, path)
    }

    fn inspect(&self, path: &Path) -> Result<AudioFormat> {
        encode::read_wav_format(path)
    }
}

/// Open a file and let symphonia pick a demuxer for it.
fn open_format(path: &Path) -> Result<Box<dyn FormatReader>> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open audio file: {}", path.display()))?;
    let mss = MediaSourceStream::new(Box::new(file), Default::default());

    // Extension is only a hint, symphonia still sniffs the content
    let mut hint = Hint::new();
    if let Some(extension) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(extension);
    }

    let probed = symphonia::default::get_probe()
        .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
        .with_context(|| format!("Failed to probe audio file: {}", path.display()))?;

    Ok(probed.format)
}

fn default_audio_track(format: &dyn FormatReader) -> Result<(u32, CodecParameters)> {
    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .context("No audio track found in file")?;
    Ok((track.id, track.codec_params.clone()))
}

/// Cheap rejection path: read container metadata only.
///
/// Fails when there is no audio track, no sample rate, or no decoder for the
/// track's codec.
pub fn probe_file(path: &Path) -> Result<StreamInfo> {
    let format = open_format(path)?;
    let (_, params) = default_audio_track(format.as_ref())?;

    let sample_rate = params.sample_rate.context("Sample rate unknown")?;
    let codec = symphonia::default::get_codecs()
        .get_codec(params.codec)
        .map(|descriptor| descriptor.short_name.to_string())
        .context("No decoder available for codec")?;

    let info = StreamInfo {
        codec,
        sample_rate,
        channels: params.channels.map(|c| c.count() as u16),
        bit_depth: params.bits_per_sample.map(|b| b as u16),
    };

    debug!(
        path = %path.display(),
        codec = %info.codec,
        sample_rate = info.sample_rate,
        channels = ?info.channels,
        bit_depth = ?info.bit_depth,
        "Probed input"
    );

    Ok(info)
}

/// Decode an entire file into interleaved f32 samples.
///
/// The channel count, sample rate and sample width of the source are kept on
/// the returned [`PcmAudio`]; the width comes from the codec parameters when
/// the container declares it, otherwise from the decoder's native sample
/// format, with float output counted as 16-bit.
pub fn decode_file(path: &Path) -> Result<PcmAudio> {
    let mut format = open_format(path)?;
    let (track_id, params) = default_audio_track(format.as_ref())?;

    let sample_rate = params.sample_rate.context("Sample rate unknown")?;
    let mut channels = params.channels.map(|c| c.count() as u16);
    let mut bit_depth = params.bits_per_sample.map(|b| b as u16);

    let mut decoder = symphonia::default::get_codecs()
        .make(&params, &DecoderOptions::default())
        .with_context(|| format!("Failed to create decoder for: {}", path.display()))?;

    let mut samples: Vec<f32> = Vec::new();

    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                break;
            }
            Err(SymphoniaError::ResetRequired) => break,
            Err(e) => return Err(anyhow::anyhow!("Error reading packet: {}", e)),
        };

        if packet.track_id() != track_id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(decoded) => decoded,
            Err(SymphoniaError::DecodeError(reason)) => {
                // A corrupt frame is skipped, the rest of the stream is still usable
                debug!(path = %path.display(), reason, "Skipping undecodable packet");
                continue;
            }
            Err(e) => {
                return Err(anyhow::Error::new(e)
                    .context(format!("Failed to decode packet in: {}", path.display())));
            }
        };

        if bit_depth.is_none() {
            bit_depth = Some(native_bit_depth(&decoded));
        }

        let spec = *decoded.spec();
        if channels.is_none() {
            channels = Some(spec.channels.count() as u16);
        }

        let mut buffer = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
        buffer.copy_interleaved_ref(decoded);
        samples.extend_from_slice(buffer.samples());
    }

    let channels = channels.context("Channel count unknown")?;
    let bit_depth = bit_depth.context("Sample width unknown")?;

    debug!(
        path = %path.display(),
        total_samples = samples.len(),
        channels,
        sample_rate,
        bit_depth,
        "Audio decoding complete"
    );

    Ok(PcmAudio {
        samples,
        channels,
        sample_rate,
        bit_depth,
    })
}

/// Width reported for sources whose decoder only yields float samples
/// (MP3, AAC, Vorbis and other lossy codecs).
const LOSSY_SOURCE_BIT_DEPTH: u16 = 16;

/// Resolution of the decoder's output buffer. Float buffers carry no
/// source width of their own.
fn native_bit_depth(buffer: &AudioBufferRef) -> u16 {
    match buffer {
        AudioBufferRef::U8(_) | AudioBufferRef::S8(_) => 8,
        AudioBufferRef::U16(_) | AudioBufferRef::S16(_) => 16,
        AudioBufferRef::U24(_) | AudioBufferRef::S24(_) => 24,
        AudioBufferRef::U32(_) | AudioBufferRef::S32(_) => 32,
        AudioBufferRef::F32(_) | AudioBufferRef::F64(_) => LOSSY_SOURCE_BIT_DEPTH,
    }
}
