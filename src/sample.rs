//! Ingestion of one centroided run into an immutable [`Sample`].
//!
//! Conversion from vendor formats is an external collaborator; this module
//! reads the intermediate open format (mzML) through [`mzdata`] and validates
//! the preconditions the rest of the engine depends on.

use std::io;
use std::path::{Path, PathBuf};

use log::debug;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use mzdata::prelude::*;
use mzdata::spectrum::bindata::ArrayRetrievalError;
use mzdata::spectrum::SignalContinuity;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("Failed to read spectral file: {0}")]
    Io(#[from] io::Error),
    #[error("Failed to decode data arrays: {0}")]
    ArrayRetrieval(#[from] ArrayRetrievalError),
    #[error("Sample {sample} contains profile mode spectra (first seen in scan {scan_id}); centroiding is a hard precondition")]
    NotCentroided { sample: String, scan_id: String },
    #[error("Spectrum {scan_id} of sample {sample} carries no m/z or intensity arrays")]
    MissingArrays { sample: String, scan_id: String },
    #[error("Sample {0} contains no MS1 spectra")]
    EmptyRun(String),
}

/// One centroided MS1 scan: an acquisition time in minutes and parallel
/// m/z and intensity arrays sorted by m/z.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct Scan {
    pub time: f64,
    pub mz: Vec<f64>,
    pub intensity: Vec<f32>,
}

impl Scan {
    pub fn new(time: f64, mz: Vec<f64>, intensity: Vec<f32>) -> Self {
        Self { time, mz, intensity }
    }

    pub fn len(&self) -> usize {
        self.mz.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mz.is_empty()
    }
}

/// One input run. Immutable once ingested: every downstream product
/// references it, nothing writes back into it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sample {
    /// Short identifier, the stem of the input file name.
    pub id: String,
    /// The file this run was read from, if it came from disk.
    pub path: Option<PathBuf>,
    /// MS1 scans in acquisition order.
    pub scans: Vec<Scan>,
}

impl Sample {
    /// Build a sample from already decoded scans. Scans are sorted by time;
    /// points within each scan are assumed sorted by m/z, as they are in
    /// centroided mzML output.
    pub fn from_scans(id: impl Into<String>, mut scans: Vec<Scan>) -> Self {
        scans.sort_by(|a, b| a.time.total_cmp(&b.time));
        Self {
            id: id.into(),
            path: None,
            scans,
        }
    }

    /// Read the MS1 scans of a centroided mzML file.
    ///
    /// Profile mode MS1 data is rejected outright rather than silently
    /// centroided; resampling the caller's data would change its meaning.
    pub fn from_mzml_path(path: &Path) -> Result<Self, IngestError> {
        let id = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.to_string_lossy().into_owned());

        let reader = mzdata::MZReader::open_path(path)?;
        let mut scans = Vec::new();
        for spectrum in reader {
            if spectrum.ms_level() != 1 {
                continue;
            }
            if spectrum.signal_continuity() == SignalContinuity::Profile {
                return Err(IngestError::NotCentroided {
                    sample: id,
                    scan_id: spectrum.id().to_string(),
                });
            }
            let arrays = spectrum.raw_arrays().ok_or_else(|| IngestError::MissingArrays {
                sample: id.clone(),
                scan_id: spectrum.id().to_string(),
            })?;
            let mz = arrays.mzs()?.into_owned();
            let intensity = arrays.intensities()?.into_owned();
            scans.push(Scan::new(spectrum.start_time(), mz, intensity));
        }
        if scans.is_empty() {
            return Err(IngestError::EmptyRun(id));
        }
        debug!("Ingested {} MS1 scans from sample {}", scans.len(), id);

        scans.sort_by(|a, b| a.time.total_cmp(&b.time));
        Ok(Self {
            id,
            path: Some(path.to_path_buf()),
            scans,
        })
    }

    /// The acquisition time axis shared by this sample's mass tracks.
    pub fn time_axis(&self) -> Vec<f64> {
        self.scans.iter().map(|s| s.time).collect()
    }

    pub fn point_count(&self) -> usize {
        self.scans.iter().map(|s| s.len()).sum()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_from_scans_orders_by_time() {
        let sample = Sample::from_scans(
            "run1",
            vec![
                Scan::new(2.0, vec![100.0], vec![5.0]),
                Scan::new(1.0, vec![100.0], vec![4.0]),
                Scan::new(3.0, vec![100.0], vec![6.0]),
            ],
        );
        assert_eq!(sample.time_axis(), vec![1.0, 2.0, 3.0]);
        assert_eq!(sample.point_count(), 3);
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = Sample::from_mzml_path(Path::new("/definitely/not/here.mzML")).unwrap_err();
        assert!(matches!(err, IngestError::Io(_)));
    }
}
