pub mod array;
pub mod audio;
pub mod event;
pub mod gcc;
pub mod geometry;
pub mod grouper;
pub mod simulate;
pub mod solver;

pub use array::{LocalizeConfig, LocalizeError, RecorderArray};
pub use audio::{AudioLoader, AudioSegment, WavLoader};
pub use event::{CandidateEvent, EventDelays, EventOutcome, LocalizedEvent, RejectionReason, UnlocalizedEvent};
pub use gcc::CcFilter;
pub use grouper::{DetectionTable, ReceiverCoords};
pub use solver::Algorithm;
