//! Run orchestration: the parallel per-sample stage, the persisted restart
//! cache, and the sequential cross-sample stages.
//!
//! Per-sample extraction is embarrassingly parallel and shares nothing:
//! every worker reads one immutable [`Sample`] and writes one artifact file
//! it alone owns. The cross-sample stages (grid, alignment, assembly) run
//! single-threaded after every submitted sample has completed, failed, or
//! been reused from cache.

use std::fs;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::align::{AlignError, SpanningTree, SpanningTreeAligner};
use crate::feature::{write_feature_table_path, Feature, FeatureAssembler};
use crate::grid::{GridCollision, MassGrid, MassGridBuilder};
use crate::params::{ParamsError, WorkflowParams};
use crate::peak::{Peak, PeakDetector};
use crate::sample::{IngestError, Sample};
use crate::track::{MassTrackExtractor, TrackSet};

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("Invalid configuration: {0}")]
    Params(#[from] ParamsError),
    #[error("Failed to ingest input: {0}")]
    Ingest(#[from] IngestError),
    #[error("Alignment failed: {0}")]
    Align(#[from] AlignError),
    #[error("I/O failure: {0}")]
    Io(#[from] io::Error),
    #[error("Malformed artifact: {0}")]
    Artifact(#[from] serde_json::Error),
    #[error("Failed to build the worker pool: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),
    #[error("No sample completed extraction; nothing to align")]
    NoUsableSamples,
}

/// Quality summary of one sample's extraction, embedded in its artifact and
/// surfaced in the run report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionAudit {
    pub sample_id: String,
    pub scan_count: usize,
    pub point_count: usize,
    pub track_count: usize,
    /// Zero-signal runs recorded across all tracks.
    pub gap_count: usize,
    /// Points merged into an existing channel within one scan or discarded
    /// as zero intensity.
    pub merged_points: usize,
    pub peak_count: usize,
    pub extracted_at: DateTime<Utc>,
}

/// The restart unit: one sample's extraction output plus the parameter
/// fingerprint it was produced under. An artifact whose fingerprint does not
/// match the current configuration is stale and is never reused.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SampleArtifact {
    pub fingerprint: String,
    pub audit: ExtractionAudit,
    pub tracks: TrackSet,
    pub peaks: Vec<Peak>,
}

/// A sample whose extraction task failed twice.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedSample {
    pub sample_id: String,
    pub error: String,
}

/// What happened during a run, for reporting and QC.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunReport {
    pub audits: Vec<ExtractionAudit>,
    /// Samples whose artifacts were reused from the restart cache.
    pub reused: Vec<String>,
    pub failed: Vec<FailedSample>,
    pub collisions: Vec<GridCollision>,
    /// Samples excluded from the spanning tree.
    pub isolated: Vec<String>,
    pub feature_count: usize,
}

/// Reproducibility record persisted next to the feature table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectSummary {
    pub fingerprint: String,
    pub grid: MassGrid,
    pub tree: SpanningTree,
    pub report: RunReport,
    pub completed_at: DateTime<Utc>,
}

/// Everything a run produces in memory.
#[derive(Debug)]
pub struct WorkflowOutput {
    pub features: Vec<Feature>,
    pub grid: MassGrid,
    pub tree: SpanningTree,
    pub report: RunReport,
}

/// A fixed-size pool of OS-level workers. The configured limit is enforced
/// here and nowhere else; every parallel code path in the crate runs inside
/// this pool, so no call site can exceed it.
pub struct WorkerPool {
    pool: rayon::ThreadPool,
    limit: usize,
}

impl WorkerPool {
    pub fn new(limit: usize) -> Result<Self, rayon::ThreadPoolBuildError> {
        let limit = limit.max(1);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(limit)
            .thread_name(|i| format!("mztrack-worker-{i}"))
            .build()?;
        Ok(Self { pool, limit })
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Run independent tasks on the pool, preserving input order in the
    /// returned results.
    pub fn run_tasks<T, F>(&self, tasks: Vec<F>) -> Vec<T>
    where
        F: FnOnce() -> T + Send,
        T: Send,
    {
        self.pool
            .install(|| tasks.into_par_iter().map(|task| task()).collect())
    }
}

/// The full preprocessing run over one batch of samples.
#[derive(Debug)]
pub struct Workflow {
    params: WorkflowParams,
    output_dir: PathBuf,
}

impl Workflow {
    /// Validates the configuration up front; all parameter violations are
    /// fatal here, before any worker exists.
    pub fn new(params: WorkflowParams, output_dir: impl Into<PathBuf>) -> Result<Self, WorkflowError> {
        params.validate()?;
        Ok(Self {
            params,
            output_dir: output_dir.into(),
        })
    }

    pub fn params(&self) -> &WorkflowParams {
        &self.params
    }

    /// Directory holding the per-sample restart artifacts.
    pub fn tracks_dir(&self) -> PathBuf {
        self.output_dir.join("tracks")
    }

    pub fn feature_table_path(&self) -> PathBuf {
        self.output_dir.join("feature_table.tsv")
    }

    pub fn project_summary_path(&self) -> PathBuf {
        self.output_dir.join("project.mztrack.json.gz")
    }

    fn artifact_path(&self, sample_id: &str) -> PathBuf {
        self.tracks_dir().join(format!("{sample_id}.mztrack.json.gz"))
    }

    /// Ingest and process a list of input files. Paths are sorted by name so
    /// sample ingestion order is reproducible regardless of how the caller
    /// collected them. Unreadable or uncentroided files abort here, before
    /// the worker pool is built.
    pub fn run_paths(&self, inputs: &[PathBuf]) -> Result<WorkflowOutput, WorkflowError> {
        let mut inputs: Vec<&PathBuf> = inputs.iter().collect();
        inputs.sort();
        let mut samples = Vec::with_capacity(inputs.len());
        for path in inputs {
            samples.push(Sample::from_mzml_path(path)?);
        }
        self.run_samples(samples)
    }

    /// Process already ingested samples; their order defines ingestion order.
    pub fn run_samples(&self, samples: Vec<Sample>) -> Result<WorkflowOutput, WorkflowError> {
        if samples.is_empty() {
            return Err(WorkflowError::NoUsableSamples);
        }
        fs::create_dir_all(self.tracks_dir())?;
        let fingerprint = self.params.extraction_fingerprint();

        // The pool lives for the duration of this call and is torn down on
        // every exit path when it drops.
        let pool = WorkerPool::new(self.params.resolved_workers())?;
        info!(
            "Processing {} samples on {} workers (restart {})",
            samples.len(),
            pool.limit(),
            if self.params.restart { "on" } else { "off" }
        );

        let tasks: Vec<_> = samples
            .into_iter()
            .map(|sample| {
                let params = self.params.clone();
                let fingerprint = fingerprint.clone();
                let artifact_path = self.artifact_path(&sample.id);
                move || process_sample(sample, &params, &fingerprint, &artifact_path)
            })
            .collect();
        let outcomes = pool.run_tasks(tasks);
        drop(pool);

        // Barrier: everything past this point is strictly sequential and
        // sees the complete joined set.
        let mut report = RunReport::default();
        let mut track_sets = Vec::new();
        let mut peaks = Vec::new();
        for outcome in outcomes {
            match outcome {
                Ok(done) => {
                    if done.reused {
                        report.reused.push(done.artifact.audit.sample_id.clone());
                    }
                    report.audits.push(done.artifact.audit);
                    track_sets.push(done.artifact.tracks);
                    peaks.push(done.artifact.peaks);
                }
                Err(failed) => {
                    warn!(
                        "Sample {} failed extraction after retry: {}",
                        failed.sample_id, failed.error
                    );
                    report.failed.push(failed);
                }
            }
        }
        if track_sets.is_empty() {
            return Err(WorkflowError::NoUsableSamples);
        }

        let (grid, collisions) = MassGridBuilder::new(&self.params).build(&track_sets);
        report.collisions = collisions;

        let tree = SpanningTreeAligner::new(&self.params).align(&grid, &peaks)?;
        report.isolated = tree
            .isolated
            .iter()
            .map(|&i| grid.sample_ids[i].clone())
            .collect();

        let features = FeatureAssembler::new(&self.params).assemble(&grid, &tree, &peaks);
        report.feature_count = features.len();

        write_feature_table_path(&features, &grid.sample_ids, &self.feature_table_path())?;
        let summary = ProjectSummary {
            fingerprint,
            grid: grid.clone(),
            tree: tree.clone(),
            report: report.clone(),
            completed_at: Utc::now(),
        };
        write_gzipped_json(&self.project_summary_path(), &summary)?;
        info!(
            "Run complete: {} features, {} samples ({} reused, {} failed, {} isolated)",
            report.feature_count,
            grid.sample_ids.len(),
            report.reused.len(),
            report.failed.len(),
            report.isolated.len()
        );

        Ok(WorkflowOutput {
            features,
            grid,
            tree,
            report,
        })
    }
}

#[derive(Debug)]
struct SampleDone {
    artifact: SampleArtifact,
    reused: bool,
}

/// One worker task: reuse a valid cached artifact or extract from scratch,
/// retrying a crashed or failed attempt once before giving up on the sample.
fn process_sample(
    sample: Sample,
    params: &WorkflowParams,
    fingerprint: &str,
    artifact_path: &Path,
) -> Result<SampleDone, FailedSample> {
    if params.restart {
        if let Some(artifact) = load_cached_artifact(artifact_path, fingerprint) {
            debug!("Reusing cached extraction for sample {}", artifact.audit.sample_id);
            return Ok(SampleDone {
                artifact,
                reused: true,
            });
        }
    }

    let sample_id = sample.id.clone();
    let attempt = || -> Result<SampleArtifact, String> {
        panic::catch_unwind(AssertUnwindSafe(|| {
            extract_sample(&sample, params, fingerprint, artifact_path)
        }))
        .map_err(|cause| {
            let detail = cause
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| cause.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "worker panicked".to_string());
            format!("worker crashed: {detail}")
        })?
        .map_err(|e| e.to_string())
    };

    attempt()
        .or_else(|first| {
            warn!("Sample {sample_id} extraction failed ({first}); retrying once");
            attempt()
        })
        .map(|artifact| SampleDone {
            artifact,
            reused: false,
        })
        .map_err(|error| FailedSample { sample_id, error })
}

/// Extract tracks and peaks for one sample and persist its artifact.
fn extract_sample(
    sample: &Sample,
    params: &WorkflowParams,
    fingerprint: &str,
    artifact_path: &Path,
) -> Result<SampleArtifact, WorkflowError> {
    let tracks = MassTrackExtractor::new(params).extract(sample);
    let peaks = PeakDetector::new(params).detect(&tracks);

    let audit = ExtractionAudit {
        sample_id: sample.id.clone(),
        scan_count: sample.scans.len(),
        point_count: sample.point_count(),
        track_count: tracks.len(),
        gap_count: tracks.gap_count(),
        merged_points: tracks.merged_points,
        peak_count: peaks.len(),
        extracted_at: Utc::now(),
    };
    let artifact = SampleArtifact {
        fingerprint: fingerprint.to_string(),
        audit,
        tracks,
        peaks,
    };
    write_gzipped_json(artifact_path, &artifact)?;
    Ok(artifact)
}

/// Read a cached artifact, discarding it when it is unreadable, malformed,
/// or was produced under different extraction parameters.
fn load_cached_artifact(path: &Path, fingerprint: &str) -> Option<SampleArtifact> {
    if !path.is_file() {
        return None;
    }
    match read_gzipped_json::<SampleArtifact>(path) {
        Ok(artifact) if artifact.fingerprint == fingerprint => Some(artifact),
        Ok(artifact) => {
            warn!(
                "Cached artifact {} was built with different parameters (fingerprint {} != {}); re-extracting",
                path.display(),
                artifact.fingerprint,
                fingerprint
            );
            None
        }
        Err(e) => {
            warn!("Cached artifact {} is unreadable ({e}); re-extracting", path.display());
            None
        }
    }
}

fn write_gzipped_json<T: Serialize>(path: &Path, value: &T) -> Result<(), WorkflowError> {
    let handle = fs::File::create(path)?;
    let mut encoder = flate2::write::GzEncoder::new(handle, flate2::Compression::default());
    serde_json::to_writer(&mut encoder, value)?;
    encoder.finish()?;
    Ok(())
}

fn read_gzipped_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, WorkflowError> {
    let handle = fs::File::open(path)?;
    let decoder = flate2::read::GzDecoder::new(handle);
    Ok(serde_json::from_reader(decoder)?)
}
