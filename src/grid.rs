//! The cross-sample m/z reference grid.
//!
//! After every sample has been extracted, the per-sample track m/z values are
//! merged into one shared, ordered set of bins. The merge is the same sorted
//! nearest-neighbor sweep used during track extraction, applied at the
//! cross-sample scale; it requires the complete track set and is therefore a
//! sequential stage.

use indexmap::IndexMap;
use itertools::Itertools;
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::mass_error::Tolerance;
use crate::params::WorkflowParams;
use crate::track::TrackSet;

/// One m/z bin: a reference center and the track each sample contributed.
/// At most one track per sample per bin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridBin {
    /// Intensity-weighted mean m/z of the member tracks.
    pub mz: f64,
    /// Sample id to track index within that sample's [`TrackSet`], in
    /// sample ingestion order.
    pub members: IndexMap<String, usize>,
}

/// The reference bin set shared by all samples. Built once, read-only after.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MassGrid {
    /// Bins in ascending m/z order, non-overlapping under the tolerance.
    pub bins: Vec<GridBin>,
    /// Sample ids in ingestion order.
    pub sample_ids: Vec<String>,
}

impl MassGrid {
    pub fn len(&self) -> usize {
        self.bins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bins.is_empty()
    }

    /// The track a sample contributed to a bin, if any.
    pub fn track_of(&self, bin_index: usize, sample_id: &str) -> Option<usize> {
        self.bins[bin_index].members.get(sample_id).copied()
    }
}

/// A sample contributed two tracks that merged into one bin; the higher
/// intensity track was kept.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridCollision {
    pub sample_id: String,
    pub bin_index: usize,
    pub kept_track: usize,
    pub dropped_track: usize,
}

#[derive(Debug, Clone)]
struct Entry {
    mz: f64,
    sample_index: usize,
    track_index: usize,
    intensity: f64,
}

#[derive(Debug, Clone)]
pub struct MassGridBuilder {
    mz_tolerance: Tolerance,
}

impl MassGridBuilder {
    pub fn new(params: &WorkflowParams) -> Self {
        Self {
            mz_tolerance: params.mz_tolerance,
        }
    }

    /// Merge the complete per-sample track sets into a [`MassGrid`].
    ///
    /// Two passes: a sorted sweep fixes the bin centers, then every track is
    /// assigned to its nearest center. Assignment runs in sample ingestion
    /// order so the membership tie-break is deterministic.
    pub fn build(&self, track_sets: &[TrackSet]) -> (MassGrid, Vec<GridCollision>) {
        let mut entries: Vec<Entry> = track_sets
            .iter()
            .enumerate()
            .flat_map(|(sample_index, ts)| {
                ts.tracks.iter().enumerate().map(move |(track_index, t)| Entry {
                    mz: t.mz,
                    sample_index,
                    track_index,
                    intensity: t.total_intensity(),
                })
            })
            .collect();

        let sample_ids: Vec<String> = track_sets.iter().map(|ts| ts.sample_id.clone()).collect();
        if entries.is_empty() {
            return (
                MassGrid {
                    bins: Vec::new(),
                    sample_ids,
                },
                Vec::new(),
            );
        }

        let centers = self.merge_centers(&mut entries);
        let mut bins: Vec<GridBin> = centers
            .into_iter()
            .map(|mz| GridBin {
                mz,
                members: IndexMap::new(),
            })
            .collect();

        // Assignment order: ingestion order first, then m/z, so that earlier
        // samples populate memberships before later ones consult them.
        entries.sort_by(|a, b| {
            a.sample_index
                .cmp(&b.sample_index)
                .then(a.mz.total_cmp(&b.mz))
        });

        let mut collisions = Vec::new();
        let mut kept_intensity: Vec<IndexMap<usize, f64>> = vec![IndexMap::new(); bins.len()];
        for entry in &entries {
            let Some(bin_index) = nearest_bin(&bins, entry.mz, self.mz_tolerance) else {
                warn!(
                    "Track m/z {:.4} of sample {} drifted outside every bin; skipped",
                    entry.mz, sample_ids[entry.sample_index]
                );
                continue;
            };
            let sample_id = &sample_ids[entry.sample_index];
            let bin = &mut bins[bin_index];
            match bin.members.get(sample_id.as_str()).copied() {
                None => {
                    bin.members.insert(sample_id.clone(), entry.track_index);
                    kept_intensity[bin_index].insert(entry.sample_index, entry.intensity);
                }
                Some(existing) => {
                    let existing_intensity = kept_intensity[bin_index]
                        .get(&entry.sample_index)
                        .copied()
                        .unwrap_or(0.0);
                    if entry.intensity > existing_intensity {
                        bin.members.insert(sample_id.clone(), entry.track_index);
                        kept_intensity[bin_index].insert(entry.sample_index, entry.intensity);
                        collisions.push(GridCollision {
                            sample_id: sample_id.clone(),
                            bin_index,
                            kept_track: entry.track_index,
                            dropped_track: existing,
                        });
                    } else {
                        collisions.push(GridCollision {
                            sample_id: sample_id.clone(),
                            bin_index,
                            kept_track: existing,
                            dropped_track: entry.track_index,
                        });
                    }
                }
            }
        }

        bins.retain(|b| !b.members.is_empty());
        debug!(
            "Mass grid built: {} bins over {} samples, {} collisions",
            bins.len(),
            sample_ids.len(),
            collisions.len()
        );
        (MassGrid { bins, sample_ids }, collisions)
    }

    /// Sorted sweep over all entry m/z values: a value joins the current bin
    /// while it stays inside the tolerance window of the running
    /// intensity-weighted center, otherwise it opens a new bin. Center-based
    /// rather than single-linkage: admission is always tested against the
    /// weighted center, which keeps drift bounded by the mean, though two
    /// borderline members on opposite flanks can still end up slightly more
    /// than one tolerance width apart.
    fn merge_centers(&self, entries: &mut [Entry]) -> Vec<f64> {
        entries.sort_by(|a, b| a.mz.total_cmp(&b.mz));

        let mut centers = Vec::new();
        let mut center = entries[0].mz;
        let mut weight = entries[0].intensity.max(1.0);
        for entry in &entries[1..] {
            if self.mz_tolerance.test(center, entry.mz) {
                let w = entry.intensity.max(1.0);
                center = (center * weight + entry.mz * w) / (weight + w);
                weight += w;
            } else {
                centers.push(center);
                center = entry.mz;
                weight = entry.intensity.max(1.0);
            }
        }
        centers.push(center);
        centers
    }
}

/// Nearest bin center within tolerance. When a query is equidistant between
/// two candidate centers, the bin with the larger current membership wins,
/// which keeps assignment stable under sample reordering.
pub(crate) fn nearest_bin(bins: &[GridBin], mz: f64, tolerance: Tolerance) -> Option<usize> {
    if bins.is_empty() {
        return None;
    }
    let at = bins.partition_point(|b| b.mz < mz);
    let candidates = [at.checked_sub(1), (at < bins.len()).then_some(at)]
        .into_iter()
        .flatten()
        .filter(|&i| tolerance.test(bins[i].mz, mz))
        .collect_vec();

    match candidates.as_slice() {
        [] => None,
        [only] => Some(*only),
        [a, b] => {
            let da = (bins[*a].mz - mz).abs();
            let db = (bins[*b].mz - mz).abs();
            if (da - db).abs() < 1e-9 {
                if bins[*b].members.len() > bins[*a].members.len() {
                    Some(*b)
                } else {
                    Some(*a)
                }
            } else if da < db {
                Some(*a)
            } else {
                Some(*b)
            }
        }
        _ => unreachable!("at most two neighboring candidates"),
    }
}
