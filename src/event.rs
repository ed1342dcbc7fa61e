//! Per-event localization pipeline
//!
//! A candidate event moves through a one-directional progression: delays
//! are estimated by cross-correlating each receiver against the reference,
//! then a position is solved from the surviving delays, then the residual
//! check accepts or rejects the estimate. Each stage consumes the previous
//! stage's record and returns the next, so a stage's inputs are statically
//! guaranteed present. There are no retries; re-attempting with different
//! thresholds means starting from a fresh [`CandidateEvent`].

use std::path::PathBuf;

use snafu::Snafu;

use crate::audio::{AudioError, AudioLoader, DEFAULT_BANDPASS_ORDER};
use crate::gcc::{self, CcFilter, DelayOptions, GccError};
use crate::geometry;
use crate::solver::{self, Algorithm, SolverError};

/// A hypothesized single sound event observed at a cluster of receivers
///
/// `receiver_files[0]` is the reference receiver; positions are parallel to
/// the file list. Produced by the grouper, before any audio is touched.
#[derive(Debug, Clone)]
pub struct CandidateEvent {
    pub receiver_files: Vec<PathBuf>,
    pub receiver_positions: Vec<Vec<f64>>,
    /// Start of the detection window, seconds from the synchronized origin
    pub start_time: f64,
    /// Length of the detection window in seconds
    pub duration: f64,
    pub class_name: String,
}

/// A candidate event with estimated arrival delays
///
/// `tdoas[0]` is exactly 0 and `cc_maxs[0]` exactly 1: the reference aligns
/// perfectly with itself by definition. Both vectors are parallel to the
/// event's receiver list.
#[derive(Debug, Clone)]
pub struct EventDelays {
    pub event: CandidateEvent,
    pub tdoas: Vec<f64>,
    pub cc_maxs: Vec<f64>,
}

/// A successfully localized event
#[derive(Debug, Clone)]
pub struct LocalizedEvent {
    pub event: CandidateEvent,
    pub tdoas: Vec<f64>,
    pub cc_maxs: Vec<f64>,
    /// Estimated source position, meters, same dimensionality as receivers
    pub position_estimate: Vec<f64>,
    /// Per-receiver residual in meters; index 0 is 0 by construction
    pub distance_residuals: Vec<f64>,
    pub residual_rms: f64,
}

/// Why an event failed to localize
#[derive(Debug, Clone)]
pub enum RejectionReason {
    /// Too few receivers survived the cross-correlation threshold
    InsufficientReceivers { retained: usize, required: usize },
    /// The position estimate's residual exceeded the acceptance threshold
    ResidualTooHigh { residual_rms: f64, threshold: f64 },
    /// Audio could not be loaded or cross-correlated
    PreprocessingFailed { message: String },
    /// The solver rejected the surviving delay/position data
    SolverFailed { message: String },
}

/// A candidate event that did not localize, with its rejection reason
#[derive(Debug, Clone)]
pub struct UnlocalizedEvent {
    pub event: CandidateEvent,
    pub reason: RejectionReason,
}

/// Terminal state of a candidate event
#[derive(Debug, Clone)]
pub enum EventOutcome {
    Localized(LocalizedEvent),
    Unlocalized(UnlocalizedEvent),
}

#[derive(Debug, Snafu)]
pub enum DelayError {
    #[snafu(context(false), display("{source}"))]
    Audio { source: AudioError },
    #[snafu(context(false), display("{source}"))]
    Gcc { source: GccError },
}

#[derive(Debug, Snafu)]
pub enum PositionError {
    #[snafu(display(
        "only {retained} of {total} receivers exceeded the cross-correlation threshold; \
         {required} required"
    ))]
    InsufficientReceivers {
        retained: usize,
        total: usize,
        required: usize,
    },

    #[snafu(display("{source}"))]
    Solver { source: SolverError },

    #[snafu(display("{source}"))]
    Residuals { source: geometry::DimensionError },
}

/// Parameters for the delay-estimation stage
#[derive(Debug, Clone, Default)]
pub struct DelayParams {
    /// Bandpass both signals to [low, high] Hz before correlating
    pub bandpass_range: Option<(f32, f32)>,
    pub cc_filter: CcFilter,
    /// Restrict candidate delays to ±max_delay seconds
    pub max_delay: Option<f64>,
}

/// Parameters for the position-estimation stage
#[derive(Debug, Clone)]
pub struct PositionParams {
    pub algorithm: Algorithm,
    /// Receivers are kept only when cc_max is strictly above this value
    pub cc_threshold: f64,
    pub min_receivers: usize,
    pub speed_of_sound: f64,
}

/// Everything needed to drive one event through the full pipeline
pub struct EventContext<'a> {
    pub loader: &'a dyn AudioLoader,
    pub delay: DelayParams,
    pub position: PositionParams,
    /// Accept the estimate when residual_rms is at or below this value
    pub residual_threshold: f64,
}

impl CandidateEvent {
    /// Estimate each receiver's arrival delay relative to the reference
    ///
    /// Loads the reference segment once and, when a bandpass range is set,
    /// filters it once and reuses it across all receiver pairs.
    pub fn estimate_delays(
        &self,
        loader: &dyn AudioLoader,
        params: &DelayParams,
    ) -> Result<EventDelays, DelayError> {
        let start = self.start_time;
        let duration = Some(self.duration);

        let mut reference = loader.load(&self.receiver_files[0], start, duration)?;
        if let Some((low, high)) = params.bandpass_range {
            reference = reference.bandpass(low, high, DEFAULT_BANDPASS_ORDER)?;
        }

        let opts = DelayOptions {
            cc_filter: params.cc_filter,
            max_delay: params.max_delay,
            bandpass_range: params.bandpass_range,
            skip_ref_bandpass: true,
        };

        // the reference's delay to itself is zero with perfect correlation
        let mut tdoas = vec![0.0];
        let mut cc_maxs = vec![1.0];
        for file in &self.receiver_files[1..] {
            let audio = loader.load(file, start, duration)?;
            let (tdoa, cc_max) = gcc::estimate_delay(&audio, &reference, &opts)?;
            tdoas.push(tdoa);
            cc_maxs.push(cc_max);
        }

        Ok(EventDelays {
            event: self.clone(),
            tdoas,
            cc_maxs,
        })
    }
}

impl EventDelays {
    /// Solve for the source position from the surviving delays
    ///
    /// Receivers whose cc_max does not exceed `cc_threshold` are dropped
    /// before solving; if fewer than `min_receivers` remain the event is
    /// rejected. Residuals are computed over the full receiver list so
    /// dropped receivers still contribute to the error estimate.
    pub fn estimate_position(&self, params: &PositionParams) -> Result<LocalizedEvent, PositionError> {
        let total = self.tdoas.len();
        let keep: Vec<usize> = (0..total)
            .filter(|&i| self.cc_maxs[i] > params.cc_threshold)
            .collect();

        if keep.len() < params.min_receivers {
            return InsufficientReceiversSnafu {
                retained: keep.len(),
                total,
                required: params.min_receivers,
            }
            .fail();
        }

        let positions: Vec<Vec<f64>> = keep
            .iter()
            .map(|&i| self.event.receiver_positions[i].clone())
            .collect();
        let tdoas: Vec<f64> = keep.iter().map(|&i| self.tdoas[i]).collect();

        let position_estimate = solver::localize(
            &positions,
            &tdoas,
            params.algorithm,
            params.speed_of_sound,
        )
        .map_err(|source| PositionError::Solver { source })?;

        let distance_residuals = geometry::tdoa_residuals(
            &self.event.receiver_positions,
            &self.tdoas,
            &position_estimate,
            params.speed_of_sound,
        )
        .map_err(|source| PositionError::Residuals { source })?;
        let residual_rms = geometry::residual_rms(&distance_residuals);

        Ok(LocalizedEvent {
            event: self.event.clone(),
            tdoas: self.tdoas.clone(),
            cc_maxs: self.cc_maxs.clone(),
            position_estimate,
            distance_residuals,
            residual_rms,
        })
    }
}

/// Drive one candidate event to its terminal state
///
/// Every failure mode is folded into an [`UnlocalizedEvent`]; nothing here
/// aborts a batch run.
pub fn localize_event(event: &CandidateEvent, ctx: &EventContext) -> EventOutcome {
    let delays = match event.estimate_delays(ctx.loader, &ctx.delay) {
        Ok(delays) => delays,
        Err(error) => {
            return EventOutcome::Unlocalized(UnlocalizedEvent {
                event: event.clone(),
                reason: RejectionReason::PreprocessingFailed {
                    message: error.to_string(),
                },
            })
        }
    };

    let localized = match delays.estimate_position(&ctx.position) {
        Ok(localized) => localized,
        Err(PositionError::InsufficientReceivers {
            retained, required, ..
        }) => {
            return EventOutcome::Unlocalized(UnlocalizedEvent {
                event: event.clone(),
                reason: RejectionReason::InsufficientReceivers { retained, required },
            })
        }
        Err(error) => {
            return EventOutcome::Unlocalized(UnlocalizedEvent {
                event: event.clone(),
                reason: RejectionReason::SolverFailed {
                    message: error.to_string(),
                },
            })
        }
    };

    // NaN residuals (degenerate solver output) fail this comparison and are
    // rejected along with genuinely large residuals
    if localized.residual_rms <= ctx.residual_threshold {
        EventOutcome::Localized(localized)
    } else {
        EventOutcome::Unlocalized(UnlocalizedEvent {
            event: event.clone(),
            reason: RejectionReason::ResidualTooHigh {
                residual_rms: localized.residual_rms,
                threshold: ctx.residual_threshold,
            },
        })
    }
}
