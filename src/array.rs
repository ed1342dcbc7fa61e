//! Top-level localization over a synchronized recorder array
//!
//! [`RecorderArray`] holds the receiver coordinate table and drives the
//! whole run: validate inputs, group detections into candidate events,
//! attempt to localize each event, and partition the outcomes. Candidate
//! events are mutually independent, so they can be processed by a rayon
//! pool; results are index-tagged and re-sorted so the output order always
//! matches the sequential (class, time-window, reference-receiver) order.

use std::collections::HashMap;

use rayon::prelude::*;
use snafu::{ensure, Snafu};
use tracing::{debug, info, warn};

use crate::audio::{AudioLoader, WavLoader};
use crate::event::{
    localize_event, CandidateEvent, DelayParams, EventContext, EventOutcome, LocalizedEvent,
    PositionParams, UnlocalizedEvent,
};
use crate::gcc::CcFilter;
use crate::geometry::DEFAULT_SPEED_OF_SOUND;
use crate::grouper::{
    build_nearby_index, create_candidate_events, files_missing_coordinates, DetectionTable,
    GroupingError, ReceiverCoords,
};
use crate::solver::Algorithm;

#[derive(Debug, Snafu)]
pub enum LocalizeError {
    #[snafu(context(false), display("{source}"))]
    Grouping { source: GroupingError },

    #[snafu(display("min_receivers must be at least 1, got {got}"))]
    InvalidMinReceivers { got: usize },
}

/// Configuration for [`RecorderArray::localize_detections`]
///
/// [`LocalizeConfig::new`] fills every optional knob with the documented
/// default; override fields as needed.
#[derive(Debug, Clone)]
pub struct LocalizeConfig {
    /// Radius in meters around a detecting receiver within which other
    /// receivers participate in the same candidate event
    pub max_receiver_dist: f64,
    /// Minimum receivers per event, before and after cc filtering [3]
    pub min_receivers: usize,
    /// Position-estimation algorithm [Gillette]
    pub algorithm: Algorithm,
    /// Discard delays whose peak correlation is not above this value [0.0]
    pub cc_threshold: f64,
    /// Cross-correlation weighting [Phat]
    pub cc_filter: CcFilter,
    /// Restrict delay search to ±max_delay seconds [unrestricted]
    pub max_delay: Option<f64>,
    /// Per-class [low, high] Hz bandpass applied before correlation [none]
    pub bandpass_ranges: Option<HashMap<String, (f32, f32)>>,
    /// Reject events whose residual RMS exceeds this, meters [unbounded]
    pub residual_threshold: f64,
    /// Speed of sound in m/s [343]
    pub speed_of_sound: f64,
    /// Process candidate events on a rayon pool [true]
    pub parallel: bool,
}

impl LocalizeConfig {
    pub fn new(max_receiver_dist: f64) -> Self {
        Self {
            max_receiver_dist,
            min_receivers: 3,
            algorithm: Algorithm::Gillette,
            cc_threshold: 0.0,
            cc_filter: CcFilter::Phat,
            max_delay: None,
            bandpass_ranges: None,
            residual_threshold: f64::INFINITY,
            speed_of_sound: DEFAULT_SPEED_OF_SOUND,
            parallel: true,
        }
    }
}

/// A fixed array of synchronized receivers with known positions
pub struct RecorderArray {
    coords: ReceiverCoords,
}

impl RecorderArray {
    pub fn new(coords: ReceiverCoords) -> Self {
        Self { coords }
    }

    pub fn coords(&self) -> &ReceiverCoords {
        &self.coords
    }

    /// Attempt to localize every detection, reading audio from WAV files
    pub fn localize_detections(
        &self,
        detections: &DetectionTable,
        config: &LocalizeConfig,
    ) -> Result<(Vec<LocalizedEvent>, Vec<UnlocalizedEvent>), LocalizeError> {
        self.localize_detections_with(detections, config, &WavLoader)
    }

    /// Attempt to localize every detection using the given audio loader
    ///
    /// Configuration problems (missing coordinates, bad min_receivers) fail
    /// the whole call before any audio is read. Per-event failures land in
    /// the unlocalized list with their reasons; they never abort the run.
    /// The two output lists preserve candidate-event order.
    pub fn localize_detections_with(
        &self,
        detections: &DetectionTable,
        config: &LocalizeConfig,
        loader: &dyn AudioLoader,
    ) -> Result<(Vec<LocalizedEvent>, Vec<UnlocalizedEvent>), LocalizeError> {
        ensure!(
            config.min_receivers >= 1,
            InvalidMinReceiversSnafu {
                got: config.min_receivers
            }
        );

        let missing = files_missing_coordinates(detections, &self.coords);
        if !missing.is_empty() {
            return Err(GroupingError::MissingCoordinates { files: missing }.into());
        }

        if let Some(ranges) = &config.bandpass_ranges {
            for class in &detections.classes {
                if !ranges.contains_key(class) {
                    warn!(
                        class = %class,
                        "no bandpass range for class; cross-correlating unfiltered audio"
                    );
                }
            }
        }

        let nearby = build_nearby_index(&self.coords, config.max_receiver_dist);
        let events =
            create_candidate_events(detections, &self.coords, &nearby, config.min_receivers)?;
        info!(
            candidate_events = events.len(),
            algorithm = ?config.algorithm,
            "attempting localization"
        );

        let run = |event: &CandidateEvent| -> EventOutcome {
            let bandpass_range = config
                .bandpass_ranges
                .as_ref()
                .and_then(|ranges| ranges.get(&event.class_name).copied());
            let ctx = EventContext {
                loader,
                delay: DelayParams {
                    bandpass_range,
                    cc_filter: config.cc_filter,
                    max_delay: config.max_delay,
                },
                position: PositionParams {
                    algorithm: config.algorithm,
                    cc_threshold: config.cc_threshold,
                    min_receivers: config.min_receivers,
                    speed_of_sound: config.speed_of_sound,
                },
                residual_threshold: config.residual_threshold,
            };
            localize_event(event, &ctx)
        };

        // tag with the candidate index and re-sort after the parallel pass
        // so output order is independent of scheduling
        let mut outcomes: Vec<(usize, EventOutcome)> = if config.parallel {
            events
                .par_iter()
                .enumerate()
                .map(|(index, event)| (index, run(event)))
                .collect()
        } else {
            events
                .iter()
                .enumerate()
                .map(|(index, event)| (index, run(event)))
                .collect()
        };
        outcomes.sort_by_key(|(index, _)| *index);

        let mut localized = Vec::new();
        let mut unlocalized = Vec::new();
        for (_, outcome) in outcomes {
            match outcome {
                EventOutcome::Localized(event) => localized.push(event),
                EventOutcome::Unlocalized(event) => unlocalized.push(event),
            }
        }
        debug!(
            localized = localized.len(),
            unlocalized = unlocalized.len(),
            "localization finished"
        );

        Ok((localized, unlocalized))
    }
}
