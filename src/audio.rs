//! Audio segment loading and bandpass filtering
//!
//! Localization only needs two things from the audio layer: pull a window of
//! mono samples out of a synchronized recording, and optionally bandpass it
//! to a class-specific frequency range before cross-correlation. The
//! [`AudioLoader`] trait is the seam to whatever audio backend the
//! surrounding toolkit uses; [`WavLoader`] is the built-in WAV-file
//! implementation.

use std::path::{Path, PathBuf};

use biquad::{Biquad, Coefficients, DirectForm2Transposed, ToHertz, Type, Q_BUTTERWORTH_F32};
use snafu::{ensure, ResultExt, Snafu};

/// Bandpass filter order used before cross-correlation
pub const DEFAULT_BANDPASS_ORDER: usize = 9;

#[derive(Debug, Snafu)]
pub enum AudioError {
    #[snafu(display("failed to open '{}': {source}", path.display()))]
    Open { path: PathBuf, source: hound::Error },

    #[snafu(display("failed to decode samples from '{}': {source}", path.display()))]
    Decode { path: PathBuf, source: hound::Error },

    #[snafu(display("unsupported sample format in '{}': {bits}-bit", path.display()))]
    UnsupportedFormat { path: PathBuf, bits: u16 },

    #[snafu(display(
        "no samples in requested window of '{}' (offset {offset}s, duration {duration:?})",
        path.display()
    ))]
    EmptySegment {
        path: PathBuf,
        offset: f64,
        duration: Option<f64>,
    },

    #[snafu(display(
        "invalid bandpass range [{low_hz}, {high_hz}] Hz at sample rate {sample_rate}"
    ))]
    InvalidBandpass {
        low_hz: f32,
        high_hz: f32,
        sample_rate: u32,
    },
}

/// A window of mono audio samples at a known sample rate
#[derive(Debug, Clone)]
pub struct AudioSegment {
    /// Samples normalized to [-1.0, 1.0]
    pub samples: Vec<f32>,
    /// Sample rate in Hz
    pub sample_rate: u32,
}

impl AudioSegment {
    /// Segment length in seconds
    pub fn duration(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate as f64
    }

    /// Return a bandpassed copy of this segment
    pub fn bandpass(&self, low_hz: f32, high_hz: f32, order: usize) -> Result<AudioSegment, AudioError> {
        Ok(AudioSegment {
            samples: bandpass_filter(&self.samples, self.sample_rate, low_hz, high_hz, order)?,
            sample_rate: self.sample_rate,
        })
    }
}

/// Source of synchronized receiver audio
///
/// `offset` and `duration` are in seconds and may be fractional; `duration`
/// of `None` reads to the end of the recording. Implementations must be
/// `Sync` so events can be processed in parallel.
pub trait AudioLoader: Sync {
    fn load(&self, path: &Path, offset: f64, duration: Option<f64>) -> Result<AudioSegment, AudioError>;
}

/// WAV-file loader backed by `hound`
///
/// Handles 16/24/32-bit integer and 32-bit float PCM; multi-channel files
/// contribute only their first channel.
#[derive(Debug, Clone, Copy, Default)]
pub struct WavLoader;

impl AudioLoader for WavLoader {
    fn load(&self, path: &Path, offset: f64, duration: Option<f64>) -> Result<AudioSegment, AudioError> {
        let mut reader = hound::WavReader::open(path).context(OpenSnafu { path })?;
        let spec = reader.spec();
        let channels = spec.channels.max(1) as usize;

        let skip_frames = (offset * spec.sample_rate as f64).round() as usize;
        let take_frames = duration.map(|d| (d * spec.sample_rate as f64).round() as usize);

        let samples = match spec.sample_format {
            hound::SampleFormat::Int => {
                ensure!(
                    matches!(spec.bits_per_sample, 16 | 24 | 32),
                    UnsupportedFormatSnafu {
                        path,
                        bits: spec.bits_per_sample
                    }
                );
                let full_scale = (1i64 << (spec.bits_per_sample - 1)) as f32;
                first_channel(
                    reader.samples::<i32>(),
                    channels,
                    skip_frames,
                    take_frames,
                    |v| v as f32 / full_scale,
                )
                .context(DecodeSnafu { path })?
            }
            hound::SampleFormat::Float => first_channel(
                reader.samples::<f32>(),
                channels,
                skip_frames,
                take_frames,
                |v| v,
            )
            .context(DecodeSnafu { path })?,
        };

        ensure!(
            !samples.is_empty(),
            EmptySegmentSnafu {
                path,
                offset,
                duration
            }
        );

        Ok(AudioSegment {
            samples,
            sample_rate: spec.sample_rate,
        })
    }
}

/// Collect channel 0 of an interleaved sample stream with frame skip/take
fn first_channel<S, F>(
    iter: impl Iterator<Item = Result<S, hound::Error>>,
    channels: usize,
    skip_frames: usize,
    take_frames: Option<usize>,
    convert: F,
) -> Result<Vec<f32>, hound::Error>
where
    F: Fn(S) -> f32,
{
    let frames = iter.skip(skip_frames * channels).step_by(channels);
    let mut out = Vec::new();
    match take_frames {
        Some(n) => {
            for sample in frames.take(n) {
                out.push(convert(sample?));
            }
        }
        None => {
            for sample in frames {
                out.push(convert(sample?));
            }
        }
    }
    Ok(out)
}

/// Bandpass a signal to [low_hz, high_hz]
///
/// Cascades `ceil(order / 2)` Butterworth high-pass sections at `low_hz`
/// with the same number of low-pass sections at `high_hz`, approximating an
/// order-`order` bandpass.
pub fn bandpass_filter(
    samples: &[f32],
    sample_rate: u32,
    low_hz: f32,
    high_hz: f32,
    order: usize,
) -> Result<Vec<f32>, AudioError> {
    let nyquist = sample_rate as f32 / 2.0;
    ensure!(
        low_hz > 0.0 && low_hz < high_hz && high_hz < nyquist,
        InvalidBandpassSnafu {
            low_hz,
            high_hz,
            sample_rate
        }
    );

    let fs = (sample_rate as f32).hz();
    let high_pass = Coefficients::<f32>::from_params(Type::HighPass, fs, low_hz.hz(), Q_BUTTERWORTH_F32)
        .map_err(|_| AudioError::InvalidBandpass {
            low_hz,
            high_hz,
            sample_rate,
        })?;
    let low_pass = Coefficients::<f32>::from_params(Type::LowPass, fs, high_hz.hz(), Q_BUTTERWORTH_F32)
        .map_err(|_| AudioError::InvalidBandpass {
            low_hz,
            high_hz,
            sample_rate,
        })?;

    let sections = order.div_ceil(2).max(1);
    let mut stages: Vec<DirectForm2Transposed<f32>> = Vec::with_capacity(2 * sections);
    for _ in 0..sections {
        stages.push(DirectForm2Transposed::new(high_pass));
        stages.push(DirectForm2Transposed::new(low_pass));
    }

    Ok(samples
        .iter()
        .map(|&x| stages.iter_mut().fold(x, |acc, stage| stage.run(acc)))
        .collect())
}
