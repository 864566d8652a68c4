//! A prelude for building on the preprocessing pipeline piecewise.

pub use crate::align::{RtCorrectionModel, SpanningTree, SpanningTreeAligner};
pub use crate::feature::{Feature, FeatureAssembler};
pub use crate::grid::{MassGrid, MassGridBuilder};
pub use crate::mass_error::Tolerance;
pub use crate::params::{WorkflowMode, WorkflowParams};
pub use crate::peak::{Peak, PeakDetector};
pub use crate::sample::{Sample, Scan};
pub use crate::track::{MassTrack, MassTrackExtractor, TrackSet};
pub use crate::workflow::{Workflow, WorkflowOutput};
