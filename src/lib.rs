//! `mztrack` implements untargeted LC-MS and GC-MS preprocessing around
//! composable mass tracks: per-sample extraction of m/z-resolved intensity
//! profiles, prominence-based chromatographic peak detection, a cross-sample
//! m/z reference grid, spanning tree retention time alignment, and assembly
//! of the aligned peaks into a quantified feature table.
//!
//! Per-sample stages are shared-nothing and run on a bounded worker pool;
//! cross-sample stages run sequentially once every sample has completed.
//! Each sample's extraction output is persisted as a compressed artifact
//! keyed by a parameter fingerprint, so an interrupted run resumes without
//! repeating finished work.
//!
//! ```no_run
//! use std::path::PathBuf;
//! use mztrack::{Workflow, WorkflowMode, WorkflowParams};
//!
//! # fn main() -> Result<(), mztrack::WorkflowError> {
//! let params = WorkflowParams::for_mode(WorkflowMode::LC);
//! let workflow = Workflow::new(params, "out")?;
//! let output = workflow.run_paths(&[
//!     PathBuf::from("run1.mzML"),
//!     PathBuf::from("run2.mzML"),
//! ])?;
//! println!("{} features", output.features.len());
//! # Ok(())
//! # }
//! ```

pub mod align;
pub mod feature;
pub mod grid;
pub mod mass_error;
pub mod params;
pub mod peak;
pub mod prelude;
pub mod sample;
pub mod track;
pub mod workflow;

pub use crate::mass_error::Tolerance;
pub use crate::params::{ParamsError, WorkflowMode, WorkflowParams};
pub use crate::sample::{IngestError, Sample, Scan};
pub use crate::track::{MassTrack, MassTrackExtractor, TrackSet};
pub use crate::peak::{Peak, PeakDetector};
pub use crate::grid::{MassGrid, MassGridBuilder};
pub use crate::align::{AlignError, RtCorrectionModel, SpanningTree, SpanningTreeAligner};
pub use crate::feature::{Feature, FeatureAssembler, FeatureValue};
pub use crate::workflow::{
    RunReport, Workflow, WorkflowError, WorkflowOutput, WorkerPool,
};
