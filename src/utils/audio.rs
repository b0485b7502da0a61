use anyhow::{anyhow, Context, Result};
use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use std::io::Cursor;

/// Mono waveform with samples in [-1.0, 1.0].
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffer {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl AudioBuffer {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    /// Duration in seconds
    pub fn duration(&self) -> f32 {
        self.samples.len() as f32 / self.sample_rate as f32
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Decodes WAV bytes, downmixing to mono.
    pub fn from_wav_bytes(bytes: &[u8]) -> Result<Self> {
        let reader = WavReader::new(Cursor::new(bytes)).context("Invalid WAV data")?;
        let spec = reader.spec();
        let channels = spec.channels.max(1) as usize;

        let samples: Vec<f32> = match spec.sample_format {
            SampleFormat::Float => reader.into_samples::<f32>().collect::<Result<Vec<_>, _>>()?,
            SampleFormat::Int => {
                let max_val = (1i64 << (spec.bits_per_sample - 1)) as f32;
                reader
                    .into_samples::<i32>()
                    .map(|s| s.map(|v| v as f32 / max_val))
                    .collect::<Result<Vec<_>, _>>()?
            }
        };

        let mono = if channels > 1 {
            samples
                .chunks(channels)
                .map(|frame| frame.iter().sum::<f32>() / channels as f32)
                .collect()
        } else {
            samples
        };

        Ok(Self::new(mono, spec.sample_rate))
    }

    /// Encodes as 16-bit PCM mono WAV.
    pub fn to_wav_bytes(&self) -> Result<Vec<u8>> {
        let spec = WavSpec {
            channels: 1,
            sample_rate: self.sample_rate,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let mut bytes = Vec::new();
        {
            let mut writer = WavWriter::new(Cursor::new(&mut bytes), spec)?;
            for &sample in &self.samples {
                writer.write_sample((sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16)?;
            }
            writer.finalize()?;
        }
        Ok(bytes)
    }
}

/// Joins clips end to end in the given order. All clips must share a sample
/// rate.
pub fn concat(clips: &[AudioBuffer]) -> Result<AudioBuffer> {
    let first = clips.first().ok_or_else(|| anyhow!("No audio clips to merge"))?;
    let sample_rate = first.sample_rate;

    let mut samples = Vec::with_capacity(clips.iter().map(AudioBuffer::len).sum());
    for (i, clip) in clips.iter().enumerate() {
        if clip.sample_rate != sample_rate {
            return Err(anyhow!(
                "Sample rate mismatch in clip {}: {} Hz, expected {} Hz",
                i,
                clip.sample_rate,
                sample_rate
            ));
        }
        samples.extend_from_slice(&clip.samples);
    }

    Ok(AudioBuffer::new(samples, sample_rate))
}
