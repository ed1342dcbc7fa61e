//! Grouping simultaneous, spatially-clustered detections into candidate events
//!
//! Detections arrive as a table of audio clips (file, start, end) with one
//! 0/1 flag per class, produced by an upstream classifier. For every
//! detection, the detecting receiver is treated as a reference and combined
//! with nearby receivers that detected the same class in the same time
//! window. The result is a deliberately redundant list of candidate events:
//! one real-world sound can appear once per reference receiver.
//! Deduplication is left to downstream analysis.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use snafu::{ensure, Snafu};

use crate::event::CandidateEvent;
use crate::geometry;

#[derive(Debug, Snafu)]
pub enum GroupingError {
    #[snafu(display(
        "receiver position for '{}' has dimension {dim}; expected 2 or 3",
        file.display()
    ))]
    BadDimension { file: PathBuf, dim: usize },

    #[snafu(display(
        "receiver position for '{}' has dimension {dim}, but the table is {table_dim}-dimensional",
        file.display()
    ))]
    MixedDimensions {
        file: PathBuf,
        dim: usize,
        table_dim: usize,
    },

    #[snafu(display("duplicate coordinate entry for '{}'", file.display()))]
    DuplicateFile { file: PathBuf },

    #[snafu(display("clip for '{}' has {got} class flags, table has {expected} classes", file.display()))]
    FlagCount {
        file: PathBuf,
        expected: usize,
        got: usize,
    },

    #[snafu(display("detections reference files with no coordinate entry: {files:?}"))]
    MissingCoordinates { files: Vec<PathBuf> },
}

/// Receiver positions keyed by audio file, in insertion order
///
/// All positions must share a dimensionality of 2 or 3. Iteration order is
/// insertion order so downstream grouping is deterministic.
#[derive(Debug, Clone, Default)]
pub struct ReceiverCoords {
    files: Vec<PathBuf>,
    positions: Vec<Vec<f64>>,
    index: HashMap<PathBuf, usize>,
}

impl ReceiverCoords {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a table from (file, position) pairs
    pub fn from_entries(
        entries: impl IntoIterator<Item = (PathBuf, Vec<f64>)>,
    ) -> Result<Self, GroupingError> {
        let mut coords = Self::new();
        for (file, position) in entries {
            coords.insert(file, position)?;
        }
        Ok(coords)
    }

    pub fn insert(&mut self, file: PathBuf, position: Vec<f64>) -> Result<(), GroupingError> {
        ensure!(
            position.len() == 2 || position.len() == 3,
            BadDimensionSnafu {
                file,
                dim: position.len()
            }
        );
        if let Some(first) = self.positions.first() {
            ensure!(
                position.len() == first.len(),
                MixedDimensionsSnafu {
                    file,
                    dim: position.len(),
                    table_dim: first.len()
                }
            );
        }
        ensure!(!self.index.contains_key(&file), DuplicateFileSnafu { file });

        self.index.insert(file.clone(), self.files.len());
        self.files.push(file);
        self.positions.push(position);
        Ok(())
    }

    pub fn position(&self, file: &Path) -> Option<&[f64]> {
        self.index.get(file).map(|&i| self.positions[i].as_slice())
    }

    pub fn contains(&self, file: &Path) -> bool {
        self.index.contains_key(file)
    }

    /// Files in insertion order
    pub fn files(&self) -> impl Iterator<Item = &Path> {
        self.files.iter().map(PathBuf::as_path)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Dimensionality of the table (2 or 3), or None if empty
    pub fn dim(&self) -> Option<usize> {
        self.positions.first().map(Vec::len)
    }
}

/// One classified audio clip: a file and time window with per-class flags
#[derive(Debug, Clone)]
pub struct Clip {
    pub file: PathBuf,
    pub start_time: f64,
    pub end_time: f64,
    /// Parallel to the table's class list; true = detection present
    pub detected: Vec<bool>,
}

/// Detections across all receivers, one row per clip
///
/// Clips with the same start_time are assumed to cover the same real-world
/// time across files (synchronized recordings). Row order and class order
/// drive the deterministic ordering of candidate events.
#[derive(Debug, Clone)]
pub struct DetectionTable {
    pub classes: Vec<String>,
    pub clips: Vec<Clip>,
}

impl DetectionTable {
    pub fn new(classes: Vec<String>) -> Self {
        Self {
            classes,
            clips: Vec::new(),
        }
    }

    pub fn push_clip(
        &mut self,
        file: PathBuf,
        start_time: f64,
        end_time: f64,
        detected: Vec<bool>,
    ) -> Result<(), GroupingError> {
        ensure!(
            detected.len() == self.classes.len(),
            FlagCountSnafu {
                file,
                expected: self.classes.len(),
                got: detected.len()
            }
        );
        self.clips.push(Clip {
            file,
            start_time,
            end_time,
            detected,
        });
        Ok(())
    }

    /// Unique files referenced by any clip, in first-appearance order
    pub fn files(&self) -> Vec<&Path> {
        let mut seen = HashSet::new();
        self.clips
            .iter()
            .filter(|clip| seen.insert(clip.file.as_path()))
            .map(|clip| clip.file.as_path())
            .collect()
    }
}

/// For each receiver, the other receivers within `max_distance` meters
pub type NearbyReceiverIndex = HashMap<PathBuf, Vec<PathBuf>>;

/// Build the nearby-receiver lookup once per run
///
/// O(n²) in the number of receivers; reused for every candidate event.
pub fn build_nearby_index(coords: &ReceiverCoords, max_distance: f64) -> NearbyReceiverIndex {
    let mut nearby = NearbyReceiverIndex::new();
    for file in coords.files() {
        let position = coords.position(file).unwrap_or(&[]);
        let close: Vec<PathBuf> = coords
            .files()
            .filter(|other| *other != file)
            .filter(|other| {
                coords
                    .position(other)
                    .and_then(|p| geometry::distance(position, p).ok())
                    .is_some_and(|d| d <= max_distance)
            })
            .map(PathBuf::from)
            .collect();
        nearby.insert(file.to_path_buf(), close);
    }
    nearby
}

/// Files in `detections` that have no coordinate entry
pub fn files_missing_coordinates(
    detections: &DetectionTable,
    coords: &ReceiverCoords,
) -> Vec<PathBuf> {
    detections
        .files()
        .into_iter()
        .filter(|file| !coords.contains(file))
        .map(PathBuf::from)
        .collect()
}

/// Group detections into candidate events for localization
///
/// For each class and each distinct start time, every detecting receiver is
/// taken in turn as reference; the co-detecting receivers within its nearby
/// list become the event's remaining receivers. Events with fewer than
/// `min_receivers` total are discarded. Fails fast if any detection file is
/// missing from the coordinate table.
pub fn create_candidate_events(
    detections: &DetectionTable,
    coords: &ReceiverCoords,
    nearby: &NearbyReceiverIndex,
    min_receivers: usize,
) -> Result<Vec<CandidateEvent>, GroupingError> {
    let missing = files_missing_coordinates(detections, coords);
    ensure!(missing.is_empty(), MissingCoordinatesSnafu { files: missing });

    let mut events = Vec::new();
    for (class_index, class_name) in detections.classes.iter().enumerate() {
        let class_clips: Vec<&Clip> = detections
            .clips
            .iter()
            .filter(|clip| clip.detected[class_index])
            .collect();

        // distinct start times in first-appearance order; same-start clips
        // are simultaneous by the synchronized-recording invariant
        let mut start_times = Vec::new();
        let mut seen_times = HashSet::new();
        for clip in &class_clips {
            if seen_times.insert(clip.start_time.to_bits()) {
                start_times.push(clip.start_time);
            }
        }

        for start_time in start_times {
            let at_time: Vec<&Clip> = class_clips
                .iter()
                .filter(|clip| clip.start_time.to_bits() == start_time.to_bits())
                .copied()
                .collect();

            let mut files_with_dets = Vec::new();
            let mut seen_files = HashSet::new();
            for clip in &at_time {
                if seen_files.insert(clip.file.as_path()) {
                    files_with_dets.push(clip.file.as_path());
                }
            }

            for &reference in &files_with_dets {
                let close = nearby.get(reference).map_or(&[][..], Vec::as_slice);
                let matches: Vec<&Path> = files_with_dets
                    .iter()
                    .filter(|f| close.iter().any(|c| c.as_path() == **f))
                    .copied()
                    .collect();

                // +1 counts the reference receiver itself
                if matches.len() + 1 < min_receivers {
                    continue;
                }

                let Some(reference_clip) = at_time.iter().find(|c| c.file == reference) else {
                    continue;
                };

                let receiver_files: Vec<PathBuf> = std::iter::once(reference)
                    .chain(matches)
                    .map(PathBuf::from)
                    .collect();
                let receiver_positions: Vec<Vec<f64>> = receiver_files
                    .iter()
                    .filter_map(|f| coords.position(f).map(<[f64]>::to_vec))
                    .collect();

                events.push(CandidateEvent {
                    receiver_files,
                    receiver_positions,
                    start_time,
                    duration: reference_clip.end_time - start_time,
                    class_name: class_name.clone(),
                });
            }
        }
    }

    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coords_square() -> ReceiverCoords {
        ReceiverCoords::from_entries([
            (PathBuf::from("a.wav"), vec![0.0, 0.0]),
            (PathBuf::from("b.wav"), vec![10.0, 0.0]),
            (PathBuf::from("c.wav"), vec![0.0, 10.0]),
            (PathBuf::from("d.wav"), vec![10.0, 10.0]),
        ])
        .unwrap()
    }

    fn all_detecting(classes: &[&str]) -> DetectionTable {
        let mut table = DetectionTable::new(classes.iter().map(|s| s.to_string()).collect());
        for file in ["a.wav", "b.wav", "c.wav", "d.wav"] {
            table
                .push_clip(
                    PathBuf::from(file),
                    0.0,
                    3.0,
                    vec![true; classes.len()],
                )
                .unwrap();
        }
        table
    }

    #[test]
    fn test_nearby_index_radius() {
        let coords = coords_square();
        let nearby = build_nearby_index(&coords, 10.0);

        // 10 m radius catches the two adjacent corners but not the diagonal
        let close = &nearby[Path::new("a.wav")];
        assert_eq!(close.len(), 2);
        assert!(close.contains(&PathBuf::from("b.wav")));
        assert!(close.contains(&PathBuf::from("c.wav")));

        let wide = build_nearby_index(&coords, 20.0);
        assert_eq!(wide[Path::new("a.wav")].len(), 3);
    }

    #[test]
    fn test_grouping_redundancy() {
        // four in-range receivers all detecting: one event per choice of
        // reference, each listing the other three
        let coords = coords_square();
        let nearby = build_nearby_index(&coords, 20.0);
        let detections = all_detecting(&["song"]);

        let events = create_candidate_events(&detections, &coords, &nearby, 3).unwrap();
        assert_eq!(events.len(), 4);
        for (i, event) in events.iter().enumerate() {
            assert_eq!(event.receiver_files.len(), 4);
            assert_eq!(event.receiver_positions.len(), 4);
            assert_eq!(event.class_name, "song");
            assert_eq!(event.duration, 3.0);
            // reference order follows clip row order
            let expected_ref = ["a.wav", "b.wav", "c.wav", "d.wav"][i];
            assert_eq!(event.receiver_files[0], PathBuf::from(expected_ref));
        }
    }

    #[test]
    fn test_min_receivers_discards_small_clusters() {
        let coords = coords_square();
        // radius only reaches adjacent corners, so each cluster is 3 strong
        let nearby = build_nearby_index(&coords, 10.0);
        let detections = all_detecting(&["song"]);

        let events = create_candidate_events(&detections, &coords, &nearby, 4).unwrap();
        assert!(events.is_empty());

        let events = create_candidate_events(&detections, &coords, &nearby, 3).unwrap();
        assert_eq!(events.len(), 4);
        for event in &events {
            assert_eq!(event.receiver_files.len(), 3);
        }
    }

    #[test]
    fn test_only_detecting_receivers_grouped() {
        let coords = coords_square();
        let nearby = build_nearby_index(&coords, 20.0);

        let mut detections = DetectionTable::new(vec!["song".into()]);
        for (file, det) in [("a.wav", true), ("b.wav", true), ("c.wav", true), ("d.wav", false)] {
            detections
                .push_clip(PathBuf::from(file), 0.0, 3.0, vec![det])
                .unwrap();
        }

        let events = create_candidate_events(&detections, &coords, &nearby, 3).unwrap();
        assert_eq!(events.len(), 3);
        for event in &events {
            assert_eq!(event.receiver_files.len(), 3);
            assert!(!event.receiver_files.contains(&PathBuf::from("d.wav")));
        }
    }

    #[test]
    fn test_separate_time_windows_are_separate_events() {
        let coords = coords_square();
        let nearby = build_nearby_index(&coords, 20.0);

        let mut detections = DetectionTable::new(vec!["song".into()]);
        for file in ["a.wav", "b.wav", "c.wav"] {
            detections
                .push_clip(PathBuf::from(file), 0.0, 3.0, vec![true])
                .unwrap();
        }
        for file in ["a.wav", "b.wav", "d.wav"] {
            detections
                .push_clip(PathBuf::from(file), 3.0, 6.0, vec![true])
                .unwrap();
        }

        let events = create_candidate_events(&detections, &coords, &nearby, 3).unwrap();
        assert_eq!(events.len(), 6);
        assert!(events[..3].iter().all(|e| e.start_time == 0.0));
        assert!(events[3..].iter().all(|e| e.start_time == 3.0));
    }

    #[test]
    fn test_classes_grouped_independently() {
        let coords = coords_square();
        let nearby = build_nearby_index(&coords, 20.0);
        let detections = all_detecting(&["song", "call"]);

        let events = create_candidate_events(&detections, &coords, &nearby, 3).unwrap();
        assert_eq!(events.len(), 8);
        assert!(events[..4].iter().all(|e| e.class_name == "song"));
        assert!(events[4..].iter().all(|e| e.class_name == "call"));
    }

    #[test]
    fn test_missing_coordinates_fail_fast() {
        let coords = coords_square();
        let nearby = build_nearby_index(&coords, 20.0);

        let mut detections = all_detecting(&["song"]);
        detections
            .push_clip(PathBuf::from("rogue.wav"), 0.0, 3.0, vec![true])
            .unwrap();

        let result = create_candidate_events(&detections, &coords, &nearby, 3);
        match result {
            Err(GroupingError::MissingCoordinates { files }) => {
                assert_eq!(files, vec![PathBuf::from("rogue.wav")]);
            }
            other => panic!("expected MissingCoordinates, got {:?}", other.map(|e| e.len())),
        }
    }

    #[test]
    fn test_coords_reject_mixed_dimensions() {
        let mut coords = ReceiverCoords::new();
        coords.insert(PathBuf::from("a.wav"), vec![0.0, 0.0]).unwrap();
        let result = coords.insert(PathBuf::from("b.wav"), vec![1.0, 2.0, 3.0]);
        assert!(matches!(result, Err(GroupingError::MixedDimensions { .. })));
    }

    #[test]
    fn test_coords_reject_bad_dimension() {
        let mut coords = ReceiverCoords::new();
        let result = coords.insert(PathBuf::from("a.wav"), vec![1.0]);
        assert!(matches!(result, Err(GroupingError::BadDimension { .. })));
    }

    #[test]
    fn test_coords_reject_duplicates() {
        let mut coords = ReceiverCoords::new();
        coords.insert(PathBuf::from("a.wav"), vec![0.0, 0.0]).unwrap();
        let result = coords.insert(PathBuf::from("a.wav"), vec![1.0, 1.0]);
        assert!(matches!(result, Err(GroupingError::DuplicateFile { .. })));
    }
}
