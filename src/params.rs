//! The unified configuration record consumed by every stage of the workflow.
//!
//! All tunable behavior flows through [`WorkflowParams`]. There is deliberately
//! no second path by which a stage can derive its own parameter values, so a
//! caller invoking a component directly and a caller going through an outer
//! command surface see identical behavior.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::mass_error::Tolerance;

/// Chromatography mode, selecting a parameter preset. The preset changes
/// tolerances and peak-shape assumptions only, never algorithm structure.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkflowMode {
    /// Liquid chromatography: broader peaks, tighter mass accuracy.
    #[default]
    LC,
    /// Gas chromatography: narrow peaks, wider effective mass windows.
    GC,
}

/// Errors raised while validating a [`WorkflowParams`] record. All of these
/// are fatal at startup, before any worker is spawned.
#[derive(Debug, Clone, Error)]
pub enum ParamsError {
    #[error("The m/z tolerance {0} must be a positive value no greater than 100 ppm")]
    InvalidMzTolerance(f64),
    #[error("The minimum intensity threshold {0} may not be negative")]
    InvalidMinIntensity(f32),
    #[error("The minimum prominence threshold {0} must be positive")]
    InvalidMinProminence(f32),
    #[error("The smoothing iteration count {0} is outside the supported range 0..=10")]
    InvalidSmoothingIterations(usize),
    #[error("The retention time tolerance {0} must be a positive number of minutes")]
    InvalidRtTolerance(f64),
    #[error("The alignment quality floor {0} may not be negative")]
    InvalidQualityFloor(f64),
    #[error("The worker limit {0} exceeds the supported maximum of 1024")]
    InvalidWorkerLimit(usize),
}

/// The complete configuration surface of the preprocessing engine.
///
/// Values, not mechanism: how these numbers were obtained (CLI flags, a
/// parameter file, test fixtures) is a concern of the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowParams {
    /// Chromatography preset the defaults were drawn from.
    pub mode: WorkflowMode,
    /// Mass tolerance for grouping points into tracks and tracks into grid bins.
    pub mz_tolerance: Tolerance,
    /// Minimum apex intensity for a mass track to be retained.
    pub min_intensity: f32,
    /// Minimum prominence for a local maximum to be reported as a peak.
    pub min_prominence: f32,
    /// Number of locally weighted smoothing passes applied before peak picking.
    pub smoothing_iterations: usize,
    /// Minimum number of consecutive non-zero timepoints for a track region
    /// to be considered signal rather than spike noise.
    pub min_timepoints: usize,
    /// Retention time window (minutes) for clustering aligned peaks into features.
    pub rt_tolerance: f64,
    /// Minimum pairwise alignment quality for a spanning tree edge; samples
    /// with no edge at or above this floor are left unaligned.
    pub alignment_quality_floor: f64,
    /// Maximum number of concurrently active extraction workers; 0 means all
    /// available cores.
    pub worker_limit: usize,
    /// Reuse previously persisted per-sample artifacts when they match the
    /// current parameter fingerprint.
    pub restart: bool,
}

impl Default for WorkflowParams {
    fn default() -> Self {
        Self::for_mode(WorkflowMode::LC)
    }
}

impl WorkflowParams {
    /// The preset for a chromatography mode. GC peaks are sharp enough that
    /// heavy smoothing erodes them, and GC instruments are commonly run at
    /// lower mass resolution, hence the wider window.
    pub fn for_mode(mode: WorkflowMode) -> Self {
        match mode {
            WorkflowMode::LC => Self {
                mode,
                mz_tolerance: Tolerance::PPM(5.0),
                min_intensity: 10_000.0,
                min_prominence: 3_300.0,
                smoothing_iterations: 2,
                min_timepoints: 5,
                rt_tolerance: 0.25,
                alignment_quality_floor: 3.0,
                worker_limit: 0,
                restart: false,
            },
            WorkflowMode::GC => Self {
                mode,
                mz_tolerance: Tolerance::PPM(25.0),
                min_intensity: 5_000.0,
                min_prominence: 1_650.0,
                smoothing_iterations: 1,
                min_timepoints: 3,
                rt_tolerance: 0.05,
                alignment_quality_floor: 3.0,
                worker_limit: 0,
                restart: false,
            },
        }
    }

    /// Check every field against its valid range. Must be called before a run
    /// starts; all violations are fatal configuration errors.
    pub fn validate(&self) -> Result<(), ParamsError> {
        let ppm_equivalent = match self.mz_tolerance {
            Tolerance::PPM(v) => v,
            // An absolute window is converted at m/z 100, the low edge of
            // the usual small molecule range.
            Tolerance::Da(v) => v / 100.0 * 1e6,
        };
        if !(ppm_equivalent > 0.0 && ppm_equivalent <= 100.0) {
            return Err(ParamsError::InvalidMzTolerance(ppm_equivalent));
        }
        if self.min_intensity < 0.0 || !self.min_intensity.is_finite() {
            return Err(ParamsError::InvalidMinIntensity(self.min_intensity));
        }
        if self.min_prominence <= 0.0 || !self.min_prominence.is_finite() {
            return Err(ParamsError::InvalidMinProminence(self.min_prominence));
        }
        if self.smoothing_iterations > 10 {
            return Err(ParamsError::InvalidSmoothingIterations(
                self.smoothing_iterations,
            ));
        }
        if self.rt_tolerance <= 0.0 || !self.rt_tolerance.is_finite() {
            return Err(ParamsError::InvalidRtTolerance(self.rt_tolerance));
        }
        if self.alignment_quality_floor < 0.0 {
            return Err(ParamsError::InvalidQualityFloor(self.alignment_quality_floor));
        }
        if self.worker_limit > 1024 {
            return Err(ParamsError::InvalidWorkerLimit(self.worker_limit));
        }
        Ok(())
    }

    /// The number of workers the pool will actually run with.
    pub fn resolved_workers(&self) -> usize {
        if self.worker_limit == 0 {
            num_cpus::get()
        } else {
            self.worker_limit
        }
    }

    /// A digest over the parameters that influence per-sample extraction.
    ///
    /// Persisted alongside each per-sample artifact; an artifact whose
    /// fingerprint differs from the current configuration is stale and must
    /// be re-extracted rather than reused. Parameters that only affect the
    /// cross-sample stages are intentionally not part of the digest.
    pub fn extraction_fingerprint(&self) -> String {
        let mut ctx = md5::Context::new();
        ctx.consume(format!(
            "{:?}|{}|{}|{}|{}|{}",
            self.mode,
            self.mz_tolerance,
            self.min_intensity,
            self.min_prominence,
            self.smoothing_iterations,
            self.min_timepoints,
        ));
        base16ct::lower::encode_string(ctx.compute().as_ref())
    }
}
