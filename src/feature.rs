//! Cross-sample feature assembly and the feature table.
//!
//! After alignment, each mass grid bin holds peaks whose corrected retention
//! times are mutually comparable. Peaks are clustered along the corrected RT
//! axis with the same nearest-neighbor sweep used for m/z, one cluster per
//! co-eluting species, and each cluster becomes one quantified feature row.

use std::fs;
use std::io;
use std::path::Path;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::align::SpanningTree;
use crate::grid::MassGrid;
use crate::params::WorkflowParams;
use crate::peak::Peak;

/// One sample's quantitation of a feature.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FeatureValue {
    pub area: f64,
    pub height: f32,
}

/// A cross-sample correspondence: one m/z bin, one corrected elution window,
/// and per-sample quantitation. A sample that did not yield a peak here is
/// explicitly absent, never zero.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Feature {
    pub id: String,
    /// Consensus m/z, the grid bin center.
    pub mz: f64,
    /// Median corrected apex time of the member peaks, minutes.
    pub rt: f64,
    pub rt_min: f64,
    pub rt_max: f64,
    /// Quantitation per sample, in sample ingestion order.
    pub values: Vec<Option<FeatureValue>>,
}

impl Feature {
    pub fn detected_count(&self) -> usize {
        self.values.iter().filter(|v| v.is_some()).count()
    }
}

#[derive(Debug, Clone)]
struct MemberPeak {
    sample_index: usize,
    corrected_rt: f64,
    area: f64,
    height: f32,
}

#[derive(Debug, Clone)]
pub struct FeatureAssembler {
    rt_tolerance: f64,
}

impl FeatureAssembler {
    pub fn new(params: &WorkflowParams) -> Self {
        Self {
            rt_tolerance: params.rt_tolerance,
        }
    }

    /// Merge aligned peaks into features, ordered by m/z and then RT.
    /// `peaks[i]` belongs to the sample at ingestion index `i`. Peaks of
    /// isolated samples are skipped; their columns stay absent throughout.
    pub fn assemble(
        &self,
        grid: &MassGrid,
        tree: &SpanningTree,
        peaks: &[Vec<Peak>],
    ) -> Vec<Feature> {
        let n_samples = grid.sample_ids.len();
        let mut features = Vec::new();

        for bin in &grid.bins {
            let mut members: Vec<MemberPeak> = Vec::new();
            for (sample_index, sample_id) in grid.sample_ids.iter().enumerate() {
                let Some(track) = bin.members.get(sample_id.as_str()).copied() else {
                    continue;
                };
                if !tree.is_aligned(sample_index) {
                    continue;
                }
                for peak in peaks[sample_index].iter().filter(|p| p.track_index == track) {
                    let corrected_rt = tree
                        .corrected_time(sample_index, peak.apex_time)
                        .expect("aligned sample has a correction model");
                    members.push(MemberPeak {
                        sample_index,
                        corrected_rt,
                        area: peak.area,
                        height: peak.height,
                    });
                }
            }
            if members.is_empty() {
                continue;
            }
            for cluster in self.cluster_by_rt(members) {
                features.push(self.finish_cluster(bin.mz, cluster, n_samples));
            }
        }

        features.sort_by(|a, b| a.mz.total_cmp(&b.mz).then(a.rt.total_cmp(&b.rt)));
        for (index, feature) in features.iter_mut().enumerate() {
            feature.id = format!("F{}", index + 1);
        }
        debug!("Assembled {} features over {} bins", features.len(), grid.len());
        features
    }

    /// Sorted sweep along the corrected RT axis; a peak joins the current
    /// cluster while it stays within the RT tolerance of the running mean.
    fn cluster_by_rt(&self, mut members: Vec<MemberPeak>) -> Vec<Vec<MemberPeak>> {
        members.sort_by(|a, b| a.corrected_rt.total_cmp(&b.corrected_rt));

        let mut clusters: Vec<Vec<MemberPeak>> = Vec::new();
        let mut current: Vec<MemberPeak> = Vec::new();
        let mut center = 0.0f64;
        for member in members {
            if current.is_empty() {
                center = member.corrected_rt;
                current.push(member);
                continue;
            }
            if (member.corrected_rt - center).abs() <= self.rt_tolerance {
                center = (center * current.len() as f64 + member.corrected_rt)
                    / (current.len() as f64 + 1.0);
                current.push(member);
            } else {
                clusters.push(std::mem::take(&mut current));
                center = member.corrected_rt;
                current.push(member);
            }
        }
        if !current.is_empty() {
            clusters.push(current);
        }
        clusters
    }

    fn finish_cluster(&self, mz: f64, cluster: Vec<MemberPeak>, n_samples: usize) -> Feature {
        let mut times: Vec<f64> = cluster.iter().map(|m| m.corrected_rt).collect();
        times.sort_by(|a, b| a.total_cmp(b));
        let rt = if times.len() % 2 == 1 {
            times[times.len() / 2]
        } else {
            (times[times.len() / 2 - 1] + times[times.len() / 2]) / 2.0
        };

        let mut values: Vec<Option<FeatureValue>> = vec![None; n_samples];
        for member in &cluster {
            let slot = &mut values[member.sample_index];
            // Two co-eluting peaks from one sample in one cluster: the
            // larger area wins.
            if slot.map_or(true, |v| member.area > v.area) {
                *slot = Some(FeatureValue {
                    area: member.area,
                    height: member.height,
                });
            }
        }

        Feature {
            id: String::new(),
            mz,
            rt,
            rt_min: *times.first().unwrap(),
            rt_max: *times.last().unwrap(),
            values,
        }
    }
}

/// Write the feature table as tab-separated text: one row per feature,
/// one area column per sample, empty cells for absent values.
pub fn write_feature_table<W: io::Write>(
    features: &[Feature],
    sample_ids: &[String],
    writer: W,
) -> csv::Result<()> {
    let mut table = csv::WriterBuilder::new().delimiter(b'\t').from_writer(writer);

    let mut header = vec![
        "feature_id".to_string(),
        "mz".to_string(),
        "rtime".to_string(),
        "rt_min".to_string(),
        "rt_max".to_string(),
        "detected".to_string(),
    ];
    header.extend(sample_ids.iter().cloned());
    table.write_record(&header)?;

    for feature in features {
        let mut row = vec![
            feature.id.clone(),
            format!("{:.6}", feature.mz),
            format!("{:.3}", feature.rt),
            format!("{:.3}", feature.rt_min),
            format!("{:.3}", feature.rt_max),
            feature.detected_count().to_string(),
        ];
        for value in &feature.values {
            row.push(match value {
                Some(v) => format!("{:.1}", v.area),
                None => String::new(),
            });
        }
        table.write_record(&row)?;
    }
    table.flush()?;
    Ok(())
}

pub fn write_feature_table_path(
    features: &[Feature],
    sample_ids: &[String],
    path: &Path,
) -> io::Result<()> {
    let handle = fs::File::create(path)?;
    write_feature_table(features, sample_ids, handle)
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::align::SpanningTreeAligner;
    use crate::grid::MassGridBuilder;
    use crate::params::{WorkflowMode, WorkflowParams};
    use crate::track::{MassTrack, TrackSet};

    fn params() -> WorkflowParams {
        let mut params = WorkflowParams::for_mode(WorkflowMode::LC);
        params.alignment_quality_floor = 0.5;
        params.rt_tolerance = 0.25;
        params
    }

    fn track_set(sample_id: &str, mz: f64) -> TrackSet {
        TrackSet {
            sample_id: sample_id.to_string(),
            time_axis: vec![0.0],
            tracks: vec![MassTrack {
                mz,
                intensity: vec![1000.0],
                gaps: Vec::new(),
            }],
            merged_points: 0,
        }
    }

    fn peak_at(apex_time: f64, area: f64) -> Peak {
        Peak {
            track_index: 0,
            mz: 500.0,
            apex_time,
            left_time: apex_time - 0.1,
            right_time: apex_time + 0.1,
            apex_index: 0,
            height: 1000.0,
            prominence: 900.0,
            area,
            quality: 0.9,
        }
    }

    #[test]
    fn test_three_samples_one_feature() {
        let sets = vec![
            track_set("a", 500.0000),
            track_set("b", 500.0004),
            track_set("c", 499.9996),
        ];
        let (grid, _) = MassGridBuilder::new(&params()).build(&sets);
        let peaks = vec![
            vec![peak_at(10.0, 100.0)],
            vec![peak_at(10.2, 110.0)],
            vec![peak_at(9.8, 90.0)],
        ];
        let tree = SpanningTreeAligner::new(&params()).align(&grid, &peaks).unwrap();
        let features = FeatureAssembler::new(&params()).assemble(&grid, &tree, &peaks);

        assert_eq!(features.len(), 1);
        assert_eq!(features[0].detected_count(), 3);
        assert_eq!(features[0].id, "F1");
    }

    #[test]
    fn test_co_eluting_species_split_into_two_features() {
        let sets = vec![track_set("a", 500.0), track_set("b", 500.0004)];
        let (grid, _) = MassGridBuilder::new(&params()).build(&sets);
        // Each sample shows two well separated elutions on the same track.
        let peaks = vec![
            vec![peak_at(5.0, 100.0), peak_at(9.0, 50.0)],
            vec![peak_at(5.1, 120.0), peak_at(9.1, 60.0)],
        ];
        let tree = SpanningTreeAligner::new(&params()).align(&grid, &peaks).unwrap();
        let features = FeatureAssembler::new(&params()).assemble(&grid, &tree, &peaks);

        assert_eq!(features.len(), 2);
        assert!(features[0].rt < features[1].rt);
        assert_eq!(features[0].detected_count(), 2);
        assert_eq!(features[1].detected_count(), 2);
    }

    #[test]
    fn test_isolated_sample_column_is_absent() {
        let sets = vec![
            track_set("a", 500.0000),
            track_set("b", 500.0004),
            track_set("c", 499.9996),
        ];
        let (grid, _) = MassGridBuilder::new(&params()).build(&sets);
        let peaks = vec![
            vec![peak_at(10.0, 100.0)],
            vec![peak_at(10.1, 110.0)],
            Vec::new(),
        ];
        let tree = SpanningTreeAligner::new(&params()).align(&grid, &peaks).unwrap();
        assert_eq!(tree.isolated, vec![2]);

        let features = FeatureAssembler::new(&params()).assemble(&grid, &tree, &peaks);
        assert_eq!(features.len(), 1);
        for feature in &features {
            assert!(feature.values[2].is_none());
        }
        assert_eq!(features[0].detected_count(), 2);
    }

    #[test]
    fn test_table_output_shape() {
        let features = vec![Feature {
            id: "F1".to_string(),
            mz: 500.1234,
            rt: 10.0,
            rt_min: 9.9,
            rt_max: 10.1,
            values: vec![
                Some(FeatureValue {
                    area: 1234.5,
                    height: 900.0,
                }),
                None,
            ],
        }];
        let sample_ids = vec!["a".to_string(), "b".to_string()];
        let mut buffer = Vec::new();
        write_feature_table(&features, &sample_ids, &mut buffer).unwrap();
        let text = String::from_utf8(buffer).unwrap();
        let mut lines = text.lines();
        assert_eq!(
            lines.next().unwrap(),
            "feature_id\tmz\trtime\trt_min\trt_max\tdetected\ta\tb"
        );
        let row = lines.next().unwrap();
        assert!(row.starts_with("F1\t500.123400\t10.000\t"));
        assert!(row.ends_with("\t1234.5\t"), "row was {row:?}");
    }
}
