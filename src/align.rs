//! Spanning tree alignment of retention time (START).
//!
//! Exhaustive pairwise RT alignment is quadratic in the number of samples and
//! unstable for chemically dissimilar pairs. Instead, pairwise alignment
//! *quality* is scored for a set of candidate pairs, a maximum-quality
//! spanning tree is extracted over those scores, and a per-sample correction
//! model is propagated breadth-first outward from the most representative
//! sample. Every child is fitted against its parent's already corrected
//! times, so corrections compose transitively no matter how deep the tree.

use std::collections::{HashMap, VecDeque};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::grid::MassGrid;
use crate::params::WorkflowParams;
use crate::peak::Peak;

/// Candidate pairs are restricted to an ingestion-order window beyond this
/// many samples, keeping the pairwise stage near-linear on large studies.
const EXHAUSTIVE_PAIR_LIMIT: usize = 64;
const NEIGHBOR_WINDOW: usize = 8;

#[derive(Debug, Error)]
pub enum AlignError {
    #[error("No samples were provided to the aligner")]
    NoSamples,
    #[error("The mass grid is empty; nothing to align across samples")]
    EmptyGrid,
    #[error("The alignment graph is disconnected: no sample pair reached the quality floor {floor}; offending samples: {samples:?}")]
    DisconnectedGraph { floor: f64, samples: Vec<String> },
}

/// A monotone piecewise-linear mapping from raw to aligned retention time.
///
/// Inside the anchored range the model interpolates between matched peak
/// correspondences; outside it, it extrapolates with unit slope from the
/// nearest anchor, which keeps the mapping continuous and monotone over the
/// whole RT axis. An empty model is the identity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RtCorrectionModel {
    /// (raw, aligned) anchor points, strictly increasing in both coordinates.
    anchors: Vec<(f64, f64)>,
}

impl RtCorrectionModel {
    pub fn identity() -> Self {
        Self::default()
    }

    pub fn is_identity(&self) -> bool {
        self.anchors.is_empty()
    }

    /// Build a model from matched (raw, aligned) pairs. Pairs are sorted by
    /// the raw coordinate, duplicate raw values are averaged, and the aligned
    /// coordinate is clamped to be non-decreasing so the model can never fold
    /// the time axis back on itself.
    pub fn from_anchors(mut pairs: Vec<(f64, f64)>) -> Self {
        if pairs.is_empty() {
            return Self::identity();
        }
        pairs.sort_by(|a, b| a.0.total_cmp(&b.0));

        let mut anchors: Vec<(f64, f64)> = Vec::with_capacity(pairs.len());
        for (x, y) in pairs {
            match anchors.last_mut() {
                Some((last_x, last_y)) if (x - *last_x).abs() < 1e-9 => {
                    *last_y = (*last_y + y) / 2.0;
                }
                _ => anchors.push((x, y)),
            }
        }
        for i in 1..anchors.len() {
            if anchors[i].1 < anchors[i - 1].1 {
                anchors[i].1 = anchors[i - 1].1;
            }
        }
        Self { anchors }
    }

    /// Map a raw retention time to its aligned value.
    pub fn apply(&self, rt: f64) -> f64 {
        let anchors = &self.anchors;
        match anchors.len() {
            0 => rt,
            1 => rt + (anchors[0].1 - anchors[0].0),
            _ => {
                let (first, last) = (anchors[0], anchors[anchors.len() - 1]);
                if rt <= first.0 {
                    return rt + (first.1 - first.0);
                }
                if rt >= last.0 {
                    return rt + (last.1 - last.0);
                }
                let at = anchors.partition_point(|(x, _)| *x < rt);
                let (x0, y0) = anchors[at - 1];
                let (x1, y1) = anchors[at];
                if x1 - x0 < 1e-12 {
                    return y0;
                }
                y0 + (rt - x0) / (x1 - x0) * (y1 - y0)
            }
        }
    }
}

/// One sample's position in the spanning tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SampleAlignmentNode {
    pub sample_index: usize,
    pub sample_id: String,
    /// Ingestion index of the parent sample; `None` only for the root.
    pub parent: Option<usize>,
    /// Quality of the edge to the parent; the root carries the maximum.
    pub edge_quality: f64,
    /// Number of matched peak correspondences on the parent edge.
    pub matched_peaks: usize,
    pub model: RtCorrectionModel,
}

/// The resolved alignment: a connected, acyclic set of nodes rooted at the
/// most representative sample, plus the samples that could not be aligned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpanningTree {
    /// Ingestion index of the root sample (identity correction).
    pub root: usize,
    /// Aligned samples in breadth-first discovery order, root first.
    pub nodes: Vec<SampleAlignmentNode>,
    /// Ingestion indices of samples with no edge at or above the quality
    /// floor; they stay in the run, unaligned and flagged.
    pub isolated: Vec<usize>,
}

impl SpanningTree {
    pub fn node(&self, sample_index: usize) -> Option<&SampleAlignmentNode> {
        self.nodes.iter().find(|n| n.sample_index == sample_index)
    }

    pub fn is_aligned(&self, sample_index: usize) -> bool {
        self.node(sample_index).is_some()
    }

    /// Aligned retention time for a raw time of the given sample, or `None`
    /// when the sample is isolated.
    pub fn corrected_time(&self, sample_index: usize, rt: f64) -> Option<f64> {
        self.node(sample_index).map(|n| n.model.apply(rt))
    }

    pub fn edge_count(&self) -> usize {
        self.nodes.len().saturating_sub(1)
    }
}

/// Pairwise correspondence between two samples: matched apex time pairs and
/// the quality score derived from them.
#[derive(Debug, Clone, Default)]
struct PairScore {
    /// (rt in lower-indexed sample, rt in higher-indexed sample).
    matches: Vec<(f64, f64)>,
    quality: f64,
}

#[derive(Debug, Clone)]
pub struct SpanningTreeAligner {
    rt_match_window: f64,
    quality_floor: f64,
}

impl SpanningTreeAligner {
    pub fn new(params: &WorkflowParams) -> Self {
        Self {
            // Raw, uncorrected drift between a sample pair can exceed the
            // post-alignment feature window; match generously and let the
            // quality score discount sloppy pairs.
            rt_match_window: params.rt_tolerance * 2.0,
            quality_floor: params.alignment_quality_floor,
        }
    }

    /// Align all samples. `peaks[i]` are the detected peaks of the sample at
    /// ingestion index `i`, in the same order as `grid.sample_ids`.
    pub fn align(&self, grid: &MassGrid, peaks: &[Vec<Peak>]) -> Result<SpanningTree, AlignError> {
        let n_samples = peaks.len();
        if n_samples == 0 {
            return Err(AlignError::NoSamples);
        }
        if grid.is_empty() {
            return Err(AlignError::EmptyGrid);
        }
        if n_samples == 1 {
            return Ok(SpanningTree {
                root: 0,
                nodes: vec![SampleAlignmentNode {
                    sample_index: 0,
                    sample_id: grid.sample_ids[0].clone(),
                    parent: None,
                    edge_quality: 0.0,
                    matched_peaks: 0,
                    model: RtCorrectionModel::identity(),
                }],
                isolated: Vec::new(),
            });
        }

        let by_track = index_peaks_by_track(peaks);
        let pair_scores = self.score_candidate_pairs(grid, &by_track, n_samples);

        let root = self.select_root(&pair_scores, n_samples);
        let (parents, isolated) = self.grow_tree(&pair_scores, root, n_samples);

        if isolated.len() == n_samples - 1 {
            return Err(AlignError::DisconnectedGraph {
                floor: self.quality_floor,
                samples: grid.sample_ids.clone(),
            });
        }
        for &index in &isolated {
            warn!(
                "Sample {} has no alignment edge at or above quality {}; kept unaligned",
                grid.sample_ids[index], self.quality_floor
            );
        }

        let tree = self.propagate(grid, &pair_scores, root, &parents, isolated);
        info!(
            "Spanning tree alignment: root {} ({} edges, {} isolated samples)",
            grid.sample_ids[tree.root],
            tree.edge_count(),
            tree.isolated.len()
        );
        Ok(tree)
    }

    /// Score matched peak correspondences for every candidate pair. Quality
    /// is the match count discounted by the median absolute RT shift.
    fn score_candidate_pairs(
        &self,
        grid: &MassGrid,
        by_track: &[HashMap<usize, Vec<f64>>],
        n_samples: usize,
    ) -> HashMap<(usize, usize), PairScore> {
        let mut scores: HashMap<(usize, usize), PairScore> = HashMap::new();
        for i in 0..n_samples {
            for j in (i + 1)..n_samples {
                if n_samples > EXHAUSTIVE_PAIR_LIMIT && j - i > NEIGHBOR_WINDOW {
                    continue;
                }
                scores.insert((i, j), PairScore::default());
            }
        }

        for bin in &grid.bins {
            let members: Vec<(usize, usize)> = bin
                .members
                .iter()
                .filter_map(|(sample_id, track)| {
                    grid.sample_ids
                        .iter()
                        .position(|id| id == sample_id)
                        .map(|si| (si, *track))
                })
                .collect();
            for (a, &(si, ti)) in members.iter().enumerate() {
                let Some(times_i) = by_track[si].get(&ti) else {
                    continue;
                };
                for &(sj, tj) in &members[a + 1..] {
                    let Some(times_j) = by_track[sj].get(&tj) else {
                        continue;
                    };
                    let key = if si < sj { (si, sj) } else { (sj, si) };
                    let Some(score) = scores.get_mut(&key) else {
                        continue;
                    };
                    let (lo, hi) = if si < sj {
                        (times_i, times_j)
                    } else {
                        (times_j, times_i)
                    };
                    match_apexes(lo, hi, self.rt_match_window, &mut score.matches);
                }
            }
        }

        for score in scores.values_mut() {
            if score.matches.is_empty() {
                continue;
            }
            let mut shifts: Vec<f64> =
                score.matches.iter().map(|(a, b)| (a - b).abs()).collect();
            let med = median(&mut shifts);
            score.quality = score.matches.len() as f64 / (1.0 + med);
        }
        scores
    }

    /// The root is the sample with the highest total quality over its
    /// candidate edges; ties resolve to the earliest ingested sample.
    fn select_root(&self, scores: &HashMap<(usize, usize), PairScore>, n_samples: usize) -> usize {
        let mut totals = vec![0.0f64; n_samples];
        for ((i, j), score) in scores {
            totals[*i] += score.quality;
            totals[*j] += score.quality;
        }
        let mut root = 0;
        for (index, &total) in totals.iter().enumerate() {
            if total > totals[root] {
                root = index;
            }
        }
        debug!("Alignment root: sample index {root} (total quality {:.3})", totals[root]);
        root
    }

    /// Prim's algorithm over negated quality, starting at the root. Edges
    /// below the quality floor are never taken; unreached samples are
    /// isolated. Ties break toward the earliest ingested child.
    fn grow_tree(
        &self,
        scores: &HashMap<(usize, usize), PairScore>,
        root: usize,
        n_samples: usize,
    ) -> (Vec<Option<usize>>, Vec<usize>) {
        let mut parents: Vec<Option<usize>> = vec![None; n_samples];
        let mut in_tree = vec![false; n_samples];
        in_tree[root] = true;

        for _ in 1..n_samples {
            let mut best: Option<(f64, usize, usize)> = None;
            for ((i, j), score) in scores {
                if score.quality < self.quality_floor || score.matches.is_empty() {
                    continue;
                }
                let (inside, outside) = match (in_tree[*i], in_tree[*j]) {
                    (true, false) => (*i, *j),
                    (false, true) => (*j, *i),
                    _ => continue,
                };
                let better = match best {
                    None => true,
                    Some((q, parent, child)) => {
                        score.quality > q
                            || (score.quality == q
                                && (outside < child || (outside == child && inside < parent)))
                    }
                };
                if better {
                    best = Some((score.quality, inside, outside));
                }
            }
            match best {
                Some((_, parent, child)) => {
                    parents[child] = Some(parent);
                    in_tree[child] = true;
                }
                None => break,
            }
        }

        let isolated = (0..n_samples).filter(|&s| !in_tree[s]).collect();
        (parents, isolated)
    }

    /// Breadth-first model propagation from the root. Children are fitted
    /// against the parent's corrected times, never its raw times, which is
    /// what makes corrections transitive across the tree.
    fn propagate(
        &self,
        grid: &MassGrid,
        scores: &HashMap<(usize, usize), PairScore>,
        root: usize,
        parents: &[Option<usize>],
        isolated: Vec<usize>,
    ) -> SpanningTree {
        let n_samples = parents.len();
        let mut children: Vec<Vec<usize>> = vec![Vec::new(); n_samples];
        for (child, parent) in parents.iter().enumerate() {
            if let Some(p) = parent {
                children[*p].push(child);
            }
        }

        let mut models: Vec<Option<RtCorrectionModel>> = vec![None; n_samples];
        models[root] = Some(RtCorrectionModel::identity());

        let mut nodes = vec![SampleAlignmentNode {
            sample_index: root,
            sample_id: grid.sample_ids[root].clone(),
            parent: None,
            edge_quality: 0.0,
            matched_peaks: 0,
            model: RtCorrectionModel::identity(),
        }];

        let mut queue = VecDeque::from([root]);
        while let Some(parent) = queue.pop_front() {
            let parent_model = models[parent].clone().expect("parent visited before child");
            for &child in &children[parent] {
                let key = if child < parent {
                    (child, parent)
                } else {
                    (parent, child)
                };
                let score = &scores[&key];
                let anchors: Vec<(f64, f64)> = score
                    .matches
                    .iter()
                    .map(|&(a, b)| {
                        // Orient each correspondence as (child raw, parent raw).
                        let (child_rt, parent_rt) = if child < parent { (a, b) } else { (b, a) };
                        (child_rt, parent_model.apply(parent_rt))
                    })
                    .collect();
                let model = RtCorrectionModel::from_anchors(anchors);
                models[child] = Some(model.clone());
                nodes.push(SampleAlignmentNode {
                    sample_index: child,
                    sample_id: grid.sample_ids[child].clone(),
                    parent: Some(parent),
                    edge_quality: score.quality,
                    matched_peaks: score.matches.len(),
                    model,
                });
                queue.push_back(child);
            }
        }

        SpanningTree {
            root,
            nodes,
            isolated,
        }
    }
}

/// Index each sample's peak apex times by parent track.
fn index_peaks_by_track(peaks: &[Vec<Peak>]) -> Vec<HashMap<usize, Vec<f64>>> {
    peaks
        .iter()
        .map(|sample_peaks| {
            let mut by_track: HashMap<usize, Vec<f64>> = HashMap::new();
            for peak in sample_peaks {
                by_track.entry(peak.track_index).or_default().push(peak.apex_time);
            }
            for times in by_track.values_mut() {
                times.sort_by(|a, b| a.total_cmp(b));
            }
            by_track
        })
        .collect()
}

/// Greedy one-to-one nearest matching between two sorted apex time lists.
fn match_apexes(lo: &[f64], hi: &[f64], window: f64, out: &mut Vec<(f64, f64)>) {
    let mut taken = vec![false; hi.len()];
    for &t in lo {
        let mut best: Option<(usize, f64)> = None;
        for (j, &u) in hi.iter().enumerate() {
            if taken[j] {
                continue;
            }
            let delta = (t - u).abs();
            if delta <= window && best.map_or(true, |(_, d)| delta < d) {
                best = Some((j, delta));
            }
            if u - t > window {
                break;
            }
        }
        if let Some((j, _)) = best {
            taken[j] = true;
            out.push((t, hi[j]));
        }
    }
}

fn median(values: &mut [f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.sort_by(|a, b| a.total_cmp(b));
    let mid = values.len() / 2;
    if values.len() % 2 == 1 {
        values[mid]
    } else {
        (values[mid - 1] + values[mid]) / 2.0
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::grid::MassGridBuilder;
    use crate::params::{WorkflowMode, WorkflowParams};
    use crate::track::{MassTrack, TrackSet};

    fn params() -> WorkflowParams {
        let mut params = WorkflowParams::for_mode(WorkflowMode::LC);
        params.alignment_quality_floor = 0.5;
        params.rt_tolerance = 0.25;
        params.min_intensity = 0.0;
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

    fn single_peak(apex_time: f64) -> Vec<Peak> {
        vec![Peak {
            track_index: 0,
            mz: 500.0,
            apex_time,
            left_time: apex_time - 0.1,
            right_time: apex_time + 0.1,
            apex_index: 0,
            height: 1000.0,
            prominence: 900.0,
            area: 120.0,
            quality: 0.95,
        }]
    }

    #[test]
    fn test_model_interpolation_and_extrapolation() {
        let model =
            RtCorrectionModel::from_anchors(vec![(1.0, 1.1), (2.0, 2.3), (3.0, 3.3)]);
        assert!((model.apply(1.5) - 1.7).abs() < 1e-9);
        assert!((model.apply(2.0) - 2.3).abs() < 1e-9);
        // Unit-slope extrapolation from the nearest anchor.
        assert!((model.apply(0.5) - 0.6).abs() < 1e-9);
        assert!((model.apply(4.0) - 4.3).abs() < 1e-9);
    }

    #[test]
    fn test_model_is_monotone_after_clamping() {
        let model = RtCorrectionModel::from_anchors(vec![(1.0, 1.5), (2.0, 1.2), (3.0, 3.0)]);
        let mut last = f64::MIN;
        for step in 0..40 {
            let t = step as f64 * 0.1;
            let mapped = model.apply(t);
            assert!(mapped >= last, "model folded time back at t={t}");
            last = mapped;
        }
    }

    #[test_log::test]
    fn test_three_sample_scenario() {
        // One matched peak per sample at raw RTs 10.0, 10.2, 9.8 minutes.
        let sets = vec![
            track_set("a", 500.0000),
            track_set("b", 500.0004),
            track_set("c", 499.9996),
        ];
        let (grid, _) = MassGridBuilder::new(&params()).build(&sets);
        assert_eq!(grid.len(), 1);
        assert_eq!(grid.bins[0].members.len(), 3);

        let peaks = vec![single_peak(10.0), single_peak(10.2), single_peak(9.8)];
        let tree = SpanningTreeAligner::new(&params()).align(&grid, &peaks).unwrap();

        assert_eq!(tree.edge_count(), 2);
        assert!(tree.isolated.is_empty());
        let corrected: Vec<f64> = (0..3)
            .map(|s| tree.corrected_time(s, peaks[s][0].apex_time).unwrap())
            .collect();
        let spread = corrected
            .iter()
            .fold(f64::MIN, |m, &v| m.max(v))
            - corrected.iter().fold(f64::MAX, |m, &v| m.min(v));
        assert!(spread < 0.05, "corrected RTs spread {spread} min: {corrected:?}");
    }

    #[test]
    fn test_root_has_identity_model() {
        let sets = vec![track_set("a", 500.0), track_set("b", 500.0004)];
        let (grid, _) = MassGridBuilder::new(&params()).build(&sets);
        let peaks = vec![single_peak(10.0), single_peak(10.1)];
        let tree = SpanningTreeAligner::new(&params()).align(&grid, &peaks).unwrap();
        let root_node = tree.node(tree.root).unwrap();
        assert!(root_node.model.is_identity());
        assert!(root_node.parent.is_none());
        assert_eq!(tree.nodes.iter().filter(|n| n.parent.is_none()).count(), 1);
    }

    #[test]
    fn test_sample_without_matches_is_isolated() {
        let sets = vec![
            track_set("a", 500.0000),
            track_set("b", 500.0004),
            // Same bin, but this sample has no detected peaks at all.
            track_set("c", 499.9996),
        ];
        let (grid, _) = MassGridBuilder::new(&params()).build(&sets);
        let peaks = vec![single_peak(10.0), single_peak(10.1), Vec::new()];
        let tree = SpanningTreeAligner::new(&params()).align(&grid, &peaks).unwrap();
        assert_eq!(tree.isolated, vec![2]);
        assert!(!tree.is_aligned(2));
        assert_eq!(tree.corrected_time(2, 10.0), None);
        assert_eq!(tree.edge_count(), 1);
    }

    #[test]
    fn test_fully_disconnected_graph_is_fatal() {
        let sets = vec![track_set("a", 500.0), track_set("b", 600.0)];
        let (grid, _) = MassGridBuilder::new(&params()).build(&sets);
        let peaks = vec![single_peak(10.0), single_peak(10.1)];
        let err = SpanningTreeAligner::new(&params()).align(&grid, &peaks).unwrap_err();
        assert!(matches!(err, AlignError::DisconnectedGraph { .. }));
    }

    #[test]
    fn test_propagation_consistency_on_a_chain() {
        // a-b and b-c are rich pairs; a-c shares nothing, so the tree must
        // chain through b and c's model must compose with b's.
        let mut sets = Vec::new();
        let mut peaks: Vec<Vec<Peak>> = vec![Vec::new(); 3];
        for base_mz in [400.0, 500.0, 600.0] {
            for sample in 0..3usize {
                if sample == 0 && base_mz == 600.0 {
                    continue;
                }
                if sample == 2 && base_mz == 400.0 {
                    continue;
                }
                let rt = 5.0 + base_mz / 100.0 + sample as f64 * 0.15;
                let track_index = peaks[sample].len();
                peaks[sample].push(Peak {
                    track_index,
                    mz: base_mz,
                    apex_time: rt,
                    left_time: rt - 0.1,
                    right_time: rt + 0.1,
                    apex_index: 0,
                    height: 1000.0,
                    prominence: 900.0,
                    area: 100.0,
                    quality: 0.9,
                });
            }
        }
        for (i, id) in ["a", "b", "c"].iter().enumerate() {
            let tracks = peaks[i]
                .iter()
                .map(|p| MassTrack {
                    mz: p.mz,
                    intensity: vec![1000.0],
                    gaps: Vec::new(),
                })
                .collect();
            sets.push(TrackSet {
                sample_id: id.to_string(),
                time_axis: vec![0.0],
                tracks,
                merged_points: 0,
            });
        }

        let (grid, _) = MassGridBuilder::new(&params()).build(&sets);
        let tree = SpanningTreeAligner::new(&params()).align(&grid, &peaks).unwrap();
        assert_eq!(tree.edge_count(), 2);

        // Matched features across any aligned pair land within the feature
        // window after correction.
        for bin in &grid.bins {
            let corrected: Vec<f64> = (0..3)
                .filter_map(|s| {
                    let sample_id = &grid.sample_ids[s];
                    let track = bin.members.get(sample_id.as_str())?;
                    let peak = peaks[s].iter().find(|p| p.track_index == *track)?;
                    tree.corrected_time(s, peak.apex_time)
                })
                .collect();
            if corrected.len() > 1 {
                let spread = corrected.iter().fold(f64::MIN, |m, &v| m.max(v))
                    - corrected.iter().fold(f64::MAX, |m, &v| m.min(v));
                assert!(spread <= 0.25, "spread {spread} in bin {:.1}", bin.mz);
            }
        }
    }
}
