//! Generalized cross-correlation time-delay estimation
//!
//! Estimates how far one receiver's recording lags another's by correlating
//! the two signals in the frequency domain. The PHAT weighting normalizes
//! the cross-spectrum to unit magnitude before the inverse transform, which
//! keeps the peak sharp in reverberant or noisy recordings; plain `Cc` is
//! the unweighted cross-correlation, normalized by the signal energies so a
//! self-correlation peaks at exactly 1.
//!
//! Sign convention: a positive delay means `signal` lags `reference`.

use std::str::FromStr;

use rustfft::{num_complex::Complex, FftPlanner};
use snafu::{ensure, ResultExt, Snafu};

use crate::audio::{AudioError, AudioSegment, DEFAULT_BANDPASS_ORDER};

#[derive(Debug, Snafu)]
pub enum GccError {
    #[snafu(display("unknown cross-correlation filter '{name}' (expected 'phat' or 'cc')"))]
    UnknownFilter { name: String },

    #[snafu(display("cannot cross-correlate zero-length audio"))]
    EmptySignal,

    #[snafu(display("sample rates differ: signal {signal} Hz vs reference {reference} Hz"))]
    SampleRateMismatch { signal: u32, reference: u32 },

    #[snafu(display("bandpass before cross-correlation failed: {source}"))]
    Bandpass { source: AudioError },
}

/// Frequency-domain weighting applied to the cross-spectrum
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CcFilter {
    /// Phase transform: divide the cross-spectrum by its magnitude
    Phat,
    /// Unweighted cross-correlation
    Cc,
}

impl Default for CcFilter {
    fn default() -> Self {
        CcFilter::Phat
    }
}

impl FromStr for CcFilter {
    type Err = GccError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "phat" => Ok(CcFilter::Phat),
            "cc" => Ok(CcFilter::Cc),
            other => UnknownFilterSnafu { name: other }.fail(),
        }
    }
}

/// Options for [`estimate_delay`]
#[derive(Debug, Clone)]
pub struct DelayOptions {
    pub cc_filter: CcFilter,
    /// Restrict the reported peak to lags within ±max_delay seconds
    pub max_delay: Option<f64>,
    /// Bandpass both signals to [low, high] Hz before correlating
    pub bandpass_range: Option<(f32, f32)>,
    /// Skip bandpassing the reference (caller already filtered it once)
    pub skip_ref_bandpass: bool,
}

impl Default for DelayOptions {
    fn default() -> Self {
        Self {
            cc_filter: CcFilter::Phat,
            max_delay: None,
            bandpass_range: None,
            skip_ref_bandpass: false,
        }
    }
}

/// Full-length generalized cross-correlation of `a` against `b`
///
/// Returns `len(a) + len(b) - 1` values; index `i` holds the correlation at
/// lag `i - (len(b) - 1)`, so lags run from `-(len(b)-1)` to `len(a)-1`.
pub fn gcc(a: &[f32], b: &[f32], filter: CcFilter) -> Result<Vec<f32>, GccError> {
    ensure!(!a.is_empty() && !b.is_empty(), EmptySignalSnafu);

    let n = a.len() + b.len() - 1;
    let nfft = n.next_power_of_two();

    let mut fa: Vec<Complex<f32>> = a.iter().map(|&x| Complex::new(x, 0.0)).collect();
    fa.resize(nfft, Complex::new(0.0, 0.0));
    let mut fb: Vec<Complex<f32>> = b.iter().map(|&x| Complex::new(x, 0.0)).collect();
    fb.resize(nfft, Complex::new(0.0, 0.0));

    let mut planner = FftPlanner::new();
    let fft = planner.plan_fft_forward(nfft);
    fft.process(&mut fa);
    fft.process(&mut fb);

    // cross-spectrum of a against b; IFFT of this is the linear
    // cross-correlation thanks to the zero padding above
    let mut spectrum: Vec<Complex<f32>> = fa
        .iter()
        .zip(&fb)
        .map(|(x, y)| x * y.conj())
        .collect();

    if filter == CcFilter::Phat {
        for v in spectrum.iter_mut() {
            let magnitude = v.norm();
            if magnitude > f32::EPSILON {
                *v /= magnitude;
            }
        }
    }

    let ifft = planner.plan_fft_inverse(nfft);
    ifft.process(&mut spectrum);
    let scale = match filter {
        CcFilter::Phat => 1.0 / nfft as f32,
        CcFilter::Cc => {
            let energy_a: f32 = a.iter().map(|x| x * x).sum();
            let energy_b: f32 = b.iter().map(|x| x * x).sum();
            let norm = (energy_a * energy_b).sqrt();
            if norm > f32::EPSILON {
                1.0 / (nfft as f32 * norm)
            } else {
                1.0 / nfft as f32
            }
        }
    };

    // unwrap circular layout: negative lags are at the end of the buffer
    let lag_floor = -(b.len() as isize - 1);
    Ok((0..n)
        .map(|i| {
            let lag = lag_floor + i as isize;
            let idx = lag.rem_euclid(nfft as isize) as usize;
            spectrum[idx].re * scale
        })
        .collect())
}

/// Estimate the delay of `signal` relative to `reference`
///
/// Returns `(delay_seconds, peak_correlation)`. A positive delay means the
/// sound reached `signal`'s receiver after it reached `reference`'s.
pub fn estimate_delay(
    signal: &AudioSegment,
    reference: &AudioSegment,
    opts: &DelayOptions,
) -> Result<(f64, f64), GccError> {
    ensure!(
        !signal.samples.is_empty() && !reference.samples.is_empty(),
        EmptySignalSnafu
    );
    ensure!(
        signal.sample_rate == reference.sample_rate,
        SampleRateMismatchSnafu {
            signal: signal.sample_rate,
            reference: reference.sample_rate
        }
    );
    let sample_rate = signal.sample_rate as f64;

    let filtered_signal;
    let signal_samples: &[f32] = match opts.bandpass_range {
        Some((low, high)) => {
            filtered_signal = signal
                .bandpass(low, high, DEFAULT_BANDPASS_ORDER)
                .context(BandpassSnafu)?;
            &filtered_signal.samples
        }
        None => &signal.samples,
    };

    let filtered_reference;
    let reference_samples: &[f32] = match opts.bandpass_range {
        Some((low, high)) if !opts.skip_ref_bandpass => {
            filtered_reference = reference
                .bandpass(low, high, DEFAULT_BANDPASS_ORDER)
                .context(BandpassSnafu)?;
            &filtered_reference.samples
        }
        _ => &reference.samples,
    };

    let correlation = gcc(signal_samples, reference_samples, opts.cc_filter)?;
    let lag_floor = -(reference_samples.len() as isize - 1);
    let max_lag = opts
        .max_delay
        .map(|d| (d * sample_rate).round() as isize);

    let mut best_index = 0;
    let mut best_value = f32::NEG_INFINITY;
    for (i, &value) in correlation.iter().enumerate() {
        let lag = lag_floor + i as isize;
        if let Some(limit) = max_lag {
            if lag.abs() > limit {
                continue;
            }
        }
        if value > best_value {
            best_value = value;
            best_index = i;
        }
    }

    let delay = (lag_floor + best_index as isize) as f64 / sample_rate;
    Ok((delay, best_value as f64))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segment(samples: Vec<f32>, sample_rate: u32) -> AudioSegment {
        AudioSegment {
            samples,
            sample_rate,
        }
    }

    fn impulse(len: usize, at: usize) -> Vec<f32> {
        let mut v = vec![0.0f32; len];
        v[at] = 1.0;
        v
    }

    /// LCG noise, reproducible across runs
    fn deterministic_noise(len: usize, amplitude: f32, seed: u32) -> Vec<f32> {
        let mut state = seed;
        (0..len)
            .map(|_| {
                state = state.wrapping_mul(1664525).wrapping_add(1013904223);
                (((state >> 9) as f32 / (1u32 << 23) as f32) * 2.0 - 1.0) * amplitude
            })
            .collect()
    }

    #[test]
    fn test_impulse_delay_positive() {
        let reference = segment(impulse(256, 50), 1000);
        let signal = segment(impulse(256, 53), 1000);

        let (delay, peak) = estimate_delay(&signal, &reference, &DelayOptions::default()).unwrap();
        assert!((delay - 0.003).abs() < 1e-9, "delay {}", delay);
        assert!(peak > 0.0);
    }

    #[test]
    fn test_impulse_delay_negative() {
        let reference = segment(impulse(256, 50), 1000);
        let signal = segment(impulse(256, 42), 1000);

        let (delay, _) = estimate_delay(&signal, &reference, &DelayOptions::default()).unwrap();
        assert!((delay + 0.008).abs() < 1e-9, "delay {}", delay);
    }

    #[test]
    fn test_self_correlation_cc_peaks_at_one() {
        let noise = deterministic_noise(512, 0.5, 7);
        let a = segment(noise.clone(), 8000);
        let opts = DelayOptions {
            cc_filter: CcFilter::Cc,
            ..DelayOptions::default()
        };

        let (delay, peak) = estimate_delay(&a, &a, &opts).unwrap();
        assert_eq!(delay, 0.0);
        assert!((peak - 1.0).abs() < 1e-3, "peak {}", peak);
    }

    #[test]
    fn test_delay_tracks_offsets_in_noise() {
        let sample_rate = 8000;
        let len = 4 * sample_rate as usize;
        let tone: Vec<f32> = (0..800)
            .map(|i| {
                let t = i as f32 / sample_rate as f32;
                (2.0 * std::f32::consts::PI * (600.0 + 4000.0 * t) * t).sin() * 0.5
            })
            .collect();

        for &offset in &[-900isize, -64, 0, 64, 900] {
            let base = len / 2;
            let mut ref_samples = deterministic_noise(len, 0.05, 11);
            let mut sig_samples = deterministic_noise(len, 0.05, 23);
            for (i, &s) in tone.iter().enumerate() {
                ref_samples[base + i] += s;
                sig_samples[(base as isize + offset) as usize + i] += s;
            }

            let reference = segment(ref_samples, sample_rate);
            let signal = segment(sig_samples, sample_rate);
            let (delay, _) = estimate_delay(&signal, &reference, &DelayOptions::default()).unwrap();
            let detected = (delay * sample_rate as f64).round() as isize;
            assert!(
                (detected - offset).abs() <= 2,
                "offset {} detected {}",
                offset,
                detected
            );
        }
    }

    #[test]
    fn test_max_delay_restricts_peak() {
        // strong peak at lag +40, weaker one at +2; the window keeps only +2
        let mut reference = vec![0.0f32; 256];
        reference[100] = 1.0;
        let mut signal = vec![0.0f32; 256];
        signal[140] = 1.0;
        signal[102] = 0.4;

        let unrestricted = estimate_delay(
            &segment(signal.clone(), 1000),
            &segment(reference.clone(), 1000),
            &DelayOptions {
                cc_filter: CcFilter::Cc,
                ..DelayOptions::default()
            },
        )
        .unwrap();
        assert_eq!((unrestricted.0 * 1000.0).round() as i64, 40);

        let restricted = estimate_delay(
            &segment(signal, 1000),
            &segment(reference, 1000),
            &DelayOptions {
                cc_filter: CcFilter::Cc,
                max_delay: Some(0.01),
                ..DelayOptions::default()
            },
        )
        .unwrap();
        assert_eq!((restricted.0 * 1000.0).round() as i64, 2);
    }

    #[test]
    fn test_different_lengths() {
        let reference = segment(impulse(100, 20), 1000);
        let signal = segment(impulse(150, 25), 1000);

        let correlation = gcc(&signal.samples, &reference.samples, CcFilter::Cc).unwrap();
        assert_eq!(correlation.len(), 150 + 100 - 1);

        let (delay, _) = estimate_delay(&signal, &reference, &DelayOptions::default()).unwrap();
        assert!((delay - 0.005).abs() < 1e-9);
    }

    #[test]
    fn test_empty_signal_is_error() {
        let empty = segment(vec![], 1000);
        let ok = segment(impulse(16, 4), 1000);
        assert!(matches!(
            estimate_delay(&empty, &ok, &DelayOptions::default()),
            Err(GccError::EmptySignal)
        ));
    }

    #[test]
    fn test_sample_rate_mismatch_is_error() {
        let a = segment(impulse(16, 4), 1000);
        let b = segment(impulse(16, 4), 2000);
        assert!(matches!(
            estimate_delay(&a, &b, &DelayOptions::default()),
            Err(GccError::SampleRateMismatch { .. })
        ));
    }

    #[test]
    fn test_cc_filter_parsing() {
        assert_eq!("phat".parse::<CcFilter>().unwrap(), CcFilter::Phat);
        assert_eq!("cc".parse::<CcFilter>().unwrap(), CcFilter::Cc);
        assert!(matches!(
            "hann".parse::<CcFilter>(),
            Err(GccError::UnknownFilter { .. })
        ));
    }
}
