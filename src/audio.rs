//! Audio containers for synthesized samples.
//!
//! All encoders take mono `f32` samples in `[-1.0, 1.0]` and write 16-bit
//! output.  `mp3` and `flac` are behind the cargo features of the same name;
//! asking for one that was not compiled in is a synthesis failure.

use std::{fmt, io::Cursor, str::FromStr};

use anyhow::Context;

use crate::error::{Result, TtsError};

/// Output container requested by the client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum AudioFormat {
    #[default]
    Wav,
    Mp3,
    Flac,
}

impl AudioFormat {
    /// File extension, also the subtype in the `audio/{ext}` media type.
    pub const fn extension(self) -> &'static str {
        match self {
            Self::Wav => "wav",
            Self::Mp3 => "mp3",
            Self::Flac => "flac",
        }
    }

    pub fn media_type(self) -> String {
        format!("audio/{}", self.extension())
    }
}

impl fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for AudioFormat {
    type Err = TtsError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "wav" => Ok(Self::Wav),
            "mp3" => Ok(Self::Mp3),
            "flac" => Ok(Self::Flac),
            other => Err(TtsError::Validation(format!(
                "unsupported format '{other}' (expected wav, mp3 or flac)"
            ))),
        }
    }
}

/// Convert f32 [-1.0, 1.0] → i16 [-32768, 32767].
fn to_i16(s: f32) -> i16 {
    (s * i16::MAX as f32).clamp(i16::MIN as f32, i16::MAX as f32) as i16
}

/// Encode `samples` at `sample_rate` into `format`.
pub fn encode(samples: &[f32], sample_rate: u32, format: AudioFormat) -> Result<Vec<u8>> {
    match format {
        AudioFormat::Wav => encode_wav(samples, sample_rate).map_err(TtsError::synthesis),
        AudioFormat::Mp3 => encode_mp3(samples, sample_rate),
        AudioFormat::Flac => encode_flac(samples, sample_rate),
    }
}

fn encode_wav(samples: &[f32], sample_rate: u32) -> anyhow::Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut buf = Cursor::new(Vec::with_capacity(44 + samples.len() * 2));
    let mut writer = hound::WavWriter::new(&mut buf, spec).context("cannot start WAV stream")?;
    for &s in samples {
        writer.write_sample(to_i16(s)).context("WAV write error")?;
    }
    writer.finalize().context("WAV finalise error")?;
    Ok(buf.into_inner())
}

#[cfg(feature = "mp3")]
fn encode_mp3(samples: &[f32], sample_rate: u32) -> Result<Vec<u8>> {
    use mp3lame_encoder::{Bitrate, Builder, FlushNoGap, MonoPcm, Quality};

    let lame = |what: &str, e: &dyn fmt::Debug| {
        TtsError::synthesis(anyhow::anyhow!("mp3 {what}: {e:?}"))
    };

    let mut builder = Builder::new()
        .ok_or_else(|| TtsError::synthesis(anyhow::anyhow!("cannot create LAME encoder")))?;
    builder.set_num_channels(1).map_err(|e| lame("channels", &e))?;
    builder.set_sample_rate(sample_rate).map_err(|e| lame("sample rate", &e))?;
    builder.set_brate(Bitrate::Kbps64).map_err(|e| lame("bitrate", &e))?;
    builder.set_quality(Quality::Good).map_err(|e| lame("quality", &e))?;
    let mut encoder = builder.build().map_err(|e| lame("init", &e))?;

    let pcm: Vec<i16> = samples.iter().map(|&s| to_i16(s)).collect();
    let mut out = Vec::with_capacity(mp3lame_encoder::max_required_buffer_size(pcm.len()));
    encoder
        .encode_to_vec(MonoPcm(&pcm), &mut out)
        .map_err(|e| lame("encode", &e))?;
    encoder
        .flush_to_vec::<FlushNoGap>(&mut out)
        .map_err(|e| lame("flush", &e))?;
    Ok(out)
}

#[cfg(not(feature = "mp3"))]
fn encode_mp3(_samples: &[f32], _sample_rate: u32) -> Result<Vec<u8>> {
    Err(TtsError::synthesis(anyhow::anyhow!(
        "mp3 output is not available in this build"
    )))
}

#[cfg(feature = "flac")]
fn encode_flac(samples: &[f32], sample_rate: u32) -> Result<Vec<u8>> {
    use flacenc::{component::BitRepr, error::Verify};

    let flac = |what: &str, e: &dyn fmt::Debug| {
        TtsError::synthesis(anyhow::anyhow!("flac {what}: {e:?}"))
    };

    let config = flacenc::config::Encoder::default()
        .into_verified()
        .map_err(|(_, e)| flac("config", &e))?;
    let pcm: Vec<i32> = samples.iter().map(|&s| i32::from(to_i16(s))).collect();
    let source = flacenc::source::MemSource::from_samples(&pcm, 1, 16, sample_rate as usize);
    let stream = flacenc::encode_with_fixed_block_size(&config, source, config.block_size)
        .map_err(|e| flac("encode", &e))?;

    let mut sink = flacenc::bitsink::ByteSink::new();
    stream.write(&mut sink).map_err(|e| flac("write", &e))?;
    Ok(sink.as_slice().to_vec())
}

#[cfg(not(feature = "flac"))]
fn encode_flac(_samples: &[f32], _sample_rate: u32) -> Result<Vec<u8>> {
    Err(TtsError::synthesis(anyhow::anyhow!(
        "flac output is not available in this build"
    )))
}

/// Decode a 16-bit PCM WAV buffer back to `f32` samples and its rate.
pub fn decode_wav(bytes: &[u8]) -> anyhow::Result<(Vec<f32>, u32)> {
    let mut reader = hound::WavReader::new(Cursor::new(bytes)).context("not a WAV stream")?;
    let spec = reader.spec();
    anyhow::ensure!(
        spec.sample_format == hound::SampleFormat::Int && spec.bits_per_sample == 16,
        "expected 16-bit PCM, got {:?} {}-bit",
        spec.sample_format,
        spec.bits_per_sample
    );
    let samples = reader
        .samples::<i16>()
        .map(|s| s.map(|v| v as f32 / i16::MAX as f32))
        .collect::<std::result::Result<Vec<_>, _>>()
        .context("WAV read error")?;
    Ok((samples, spec.sample_rate))
}
