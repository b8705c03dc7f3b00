//! RIFF/WAVE output.
//!
//! The writer never relies on defaults: channel count, sample rate and bit
//! depth all come from the target profile, and the audio handed in must
//! already have that shape. Besides `fmt ` and `data` every file carries a
//! `LIST`/`INFO` chunk with the software name (`ISFT`) and a caller supplied
//! comment (`ICMT`).
//!
//! Read-back for verification uses `hound`, a reader independent of both
//! the writer here and the symphonia decoder.

use super::normalize::full_scale;
use super::{AudioFormat, PcmAudio};
use anyhow::{bail, Context, Result};
use byteorder::{LittleEndian, WriteBytesExt};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

const WAVE_FORMAT_PCM: u16 = 1;

/// Value written into the `ISFT` INFO field.
pub const SOFTWARE_TAG: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// Encode `audio` as linear PCM WAV at `path`.
pub fn write_wav_file(audio: &PcmAudio, target: &AudioFormat, comment: &str, path: &Path) -> Result<()> {
    let file = File::create(path)
        .with_context(|| format!("Failed to create output file: {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    write_wav(&mut writer, audio, target, comment)
        .with_context(|| format!("Failed to write WAV data: {}", path.display()))?;
    writer
        .flush()
        .with_context(|| format!("Failed to flush output file: {}", path.display()))?;
    Ok(())
}

/// Serialize `audio` into `writer`, returning the number of bytes written.
pub fn write_wav<W: Write>(writer: &mut W, audio: &PcmAudio, target: &AudioFormat, comment: &str) -> Result<u64> {
    if audio.channels != target.channels {
        bail!(
            "Encoder expects {} channel(s), audio has {}",
            target.channels,
            audio.channels
        );
    }
    if audio.sample_rate != target.sample_rate {
        bail!(
            "Encoder expects {}Hz, audio is {}Hz",
            target.sample_rate,
            audio.sample_rate
        );
    }

    let data = encode_samples(&audio.samples, target.bit_depth)?;
    let info = info_chunk(&[(b"ISFT", SOFTWARE_TAG), (b"ICMT", comment)]);

    let block_align = target.channels as u32 * (target.bit_depth as u32 / 8);
    let byte_rate = target.sample_rate * block_align;

    let data_len = data.len() as u32;
    let data_pad = data_len % 2;
    let riff_len = 4 + (8 + 16) + (8 + info.len() as u32) + (8 + data_len + data_pad);

    writer.write_all(b"RIFF")?;
    writer.write_u32::<LittleEndian>(riff_len)?;
    writer.write_all(b"WAVE")?;

    writer.write_all(b"fmt ")?;
    writer.write_u32::<LittleEndian>(16)?;
    writer.write_u16::<LittleEndian>(WAVE_FORMAT_PCM)?;
    writer.write_u16::<LittleEndian>(target.channels)?;
    writer.write_u32::<LittleEndian>(target.sample_rate)?;
    writer.write_u32::<LittleEndian>(byte_rate)?;
    writer.write_u16::<LittleEndian>(block_align as u16)?;
    writer.write_u16::<LittleEndian>(target.bit_depth)?;

    writer.write_all(b"LIST")?;
    writer.write_u32::<LittleEndian>(info.len() as u32)?;
    writer.write_all(&info)?;

    writer.write_all(b"data")?;
    writer.write_u32::<LittleEndian>(data_len)?;
    writer.write_all(&data)?;
    if data_pad == 1 {
        writer.write_u8(0)?;
    }

    Ok(8 + riff_len as u64)
}

/// Quantize float samples into little-endian PCM bytes.
fn encode_samples(samples: &[f32], bit_depth: u16) -> Result<Vec<u8>> {
    let scale = full_scale(bit_depth);
    let quantize = |s: f32| (s * scale).round().clamp(-scale, scale - 1.0) as i32;

    let mut out = Vec::with_capacity(samples.len() * (bit_depth as usize / 8));
    match bit_depth {
        // 8-bit WAV is unsigned with a 128 midpoint
        8 => {
            for s in samples {
                out.write_u8((quantize(*s) + 128) as u8)?;
            }
        }
        16 => {
            for s in samples {
                out.write_i16::<LittleEndian>(quantize(*s) as i16)?;
            }
        }
        24 => {
            for s in samples {
                out.write_i24::<LittleEndian>(quantize(*s))?;
            }
        }
        other => bail!("Unsupported output bit depth: {}", other),
    }
    Ok(out)
}

/// Build the body of a `LIST` chunk of type `INFO`.
fn info_chunk(fields: &[(&[u8; 4], &str)]) -> Vec<u8> {
    let mut chunk = b"INFO".to_vec();
    for (id, value) in fields {
        let mut text = value.as_bytes().to_vec();
        text.push(0);
        let len = text.len() as u32;
        chunk.extend_from_slice(*id);
        chunk.extend_from_slice(&len.to_le_bytes());
        chunk.extend_from_slice(&text);
        if len % 2 == 1 {
            chunk.push(0);
        }
    }
    chunk
}

/// Read the format of an existing WAV file, decoding every sample so a
/// truncated or corrupt data chunk is reported too.
pub fn read_wav_format(path: &Path) -> Result<AudioFormat> {
    let mut reader = hound::WavReader::open(path)
        .with_context(|| format!("Failed to parse WAV file: {}", path.display()))?;
    let spec = reader.spec();

    if spec.sample_format != hound::SampleFormat::Int {
        bail!("Output is not linear PCM");
    }

    for sample in reader.samples::<i32>() {
        sample.with_context(|| format!("Corrupt sample data in {}", path.display()))?;
    }

    Ok(AudioFormat {
        channels: spec.channels,
        sample_rate: spec.sample_rate,
        bit_depth: spec.bits_per_sample,
    })
}
