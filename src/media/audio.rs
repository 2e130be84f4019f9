//! WAV decoding and G.711 u-law conversion
//!
//! Playback sources are RIFF/WAVE files containing linear PCM (format 1),
//! mono or stereo at any sample rate. Decoding produces the media plane's
//! one working format: 8 kHz mono 16-bit PCM, which is then companded to
//! u-law for the wire.

use bytes::{Buf, Bytes};

use crate::{Error, Result};

pub const TARGET_SAMPLE_RATE: u32 = 8000;

const BIAS: i32 = 0x84;
const CLIP: i32 = 32635;

/// Decoded audio ready for u-law framing.
#[derive(Debug, Clone)]
pub struct PcmAudio {
    pub samples: Vec<i16>,
    pub sample_rate: u32,
}

/// Parse a RIFF/WAVE file and normalise to 8 kHz mono.
pub fn decode_wav(data: &[u8]) -> Result<PcmAudio> {
    let mut buf = Bytes::copy_from_slice(data);

    if buf.remaining() < 12 {
        return Err(Error::parse("WAV file truncated"));
    }
    let riff = buf.copy_to_bytes(4);
    let _file_size = buf.get_u32_le();
    let wave = buf.copy_to_bytes(4);
    if &riff[..] != b"RIFF" || &wave[..] != b"WAVE" {
        return Err(Error::parse("Not a RIFF/WAVE file"));
    }

    let mut format: Option<WavFormat> = None;
    let mut pcm_data: Option<Bytes> = None;

    while buf.remaining() >= 8 {
        let chunk_id = buf.copy_to_bytes(4);
        let chunk_size = buf.get_u32_le() as usize;
        if buf.remaining() < chunk_size {
            return Err(Error::parse("WAV chunk truncated"));
        }
        let chunk = buf.copy_to_bytes(chunk_size);
        // chunks are word-aligned
        if chunk_size % 2 == 1 && buf.remaining() >= 1 {
            buf.advance(1);
        }

        match &chunk_id[..] {
            b"fmt " => format = Some(parse_fmt(chunk)?),
            b"data" => pcm_data = Some(chunk),
            other => {
                return Err(Error::parse(format!(
                    "Unsupported WAV chunk: {}",
                    String::from_utf8_lossy(other)
                )));
            }
        }
    }

    let format = format.ok_or_else(|| Error::parse("WAV file has no fmt chunk"))?;
    let pcm_data = pcm_data.ok_or_else(|| Error::parse("WAV file has no data chunk"))?;

    let mut samples = bytes_to_samples(&pcm_data);
    if format.channels == 2 {
        samples = downmix_stereo(&samples);
    }
    let samples = resample(&samples, format.sample_rate, TARGET_SAMPLE_RATE);

    Ok(PcmAudio {
        samples,
        sample_rate: TARGET_SAMPLE_RATE,
    })
}

#[derive(Debug, Clone, Copy)]
struct WavFormat {
    channels: u16,
    sample_rate: u32,
}

fn parse_fmt(mut chunk: Bytes) -> Result<WavFormat> {
    if chunk.remaining() < 16 {
        return Err(Error::parse("WAV fmt chunk too short"));
    }
    let format_code = chunk.get_u16_le();
    let channels = chunk.get_u16_le();
    let sample_rate = chunk.get_u32_le();
    let _byte_rate = chunk.get_u32_le();
    let _block_align = chunk.get_u16_le();
    let bits_per_sample = chunk.get_u16_le();

    if format_code != 1 {
        return Err(Error::parse(format!(
            "Unsupported WAV format code: {} (PCM only)",
            format_code
        )));
    }
    if bits_per_sample != 16 {
        return Err(Error::parse(format!(
            "Unsupported WAV bit depth: {} (16-bit only)",
            bits_per_sample
        )));
    }
    if channels == 0 || channels > 2 {
        return Err(Error::parse(format!(
            "Unsupported WAV channel count: {}",
            channels
        )));
    }
    if sample_rate == 0 {
        return Err(Error::parse("WAV sample rate is zero"));
    }

    Ok(WavFormat {
        channels,
        sample_rate,
    })
}

fn bytes_to_samples(data: &[u8]) -> Vec<i16> {
    data.chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}

fn downmix_stereo(samples: &[i16]) -> Vec<i16> {
    samples
        .chunks_exact(2)
        .map(|lr| (((lr[0] as i32) + (lr[1] as i32)) / 2) as i16)
        .collect()
}

/// Linear-interpolation resampler. Identity when the rates already match.
fn resample(samples: &[i16], from_rate: u32, to_rate: u32) -> Vec<i16> {
    if from_rate == to_rate || samples.is_empty() {
        return samples.to_vec();
    }

    let out_len = (samples.len() as u64 * to_rate as u64 / from_rate as u64) as usize;
    let mut out = Vec::with_capacity(out_len);
    let step = from_rate as f64 / to_rate as f64;

    for i in 0..out_len {
        let pos = i as f64 * step;
        let idx = pos as usize;
        let frac = pos - idx as f64;
        let a = samples[idx.min(samples.len() - 1)] as f64;
        let b = samples[(idx + 1).min(samples.len() - 1)] as f64;
        out.push((a + (b - a) * frac) as i16);
    }

    out
}

/// G.711 u-law compression of one linear sample.
pub fn linear_to_ulaw(sample: i16) -> u8 {
    let mut pcm = sample as i32;
    let sign: u8 = if pcm < 0 {
        pcm = -pcm;
        0x80
    } else {
        0x00
    };
    if pcm > CLIP {
        pcm = CLIP;
    }
    pcm += BIAS;

    let mut exponent: u8 = 7;
    let mut mask = 0x4000;
    while exponent > 0 && pcm & mask == 0 {
        exponent -= 1;
        mask >>= 1;
    }

    let mantissa = ((pcm >> (exponent + 3)) & 0x0F) as u8;
    !(sign | (exponent << 4) | mantissa)
}

/// G.711 u-law expansion back to linear.
pub fn ulaw_to_linear(ulaw: u8) -> i16 {
    let ulaw = !ulaw;
    let sign = ulaw & 0x80;
    let exponent = (ulaw >> 4) & 0x07;
    let mantissa = ulaw & 0x0F;
    let mut sample = ((mantissa as i32) << 3) + BIAS;
    sample <<= exponent;
    sample -= BIAS;
    if sign != 0 {
        (-sample) as i16
    } else {
        sample as i16
    }
}

/// Compand a full PCM buffer to u-law bytes.
pub fn pcm_to_ulaw(samples: &[i16]) -> Vec<u8> {
    samples.iter().map(|&s| linear_to_ulaw(s)).collect()
}
