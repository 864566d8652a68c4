//! Per-sample mass track extraction.
//!
//! A mass track is the extracted intensity profile of one resolved m/z
//! channel over the run's full retention time axis, zero-filled where the
//! channel had no signal. Extraction is a sorted sweep: every incoming point
//! is matched against the nearest existing channel center found by binary
//! search, never against the whole channel list.

use log::debug;
use serde::{Deserialize, Serialize};

use crate::params::WorkflowParams;
use crate::sample::Sample;

/// A maximal run of zero-signal scans interior to a track's extent,
/// `start..end` as scan indices. Real chromatographic gaps must not be
/// mistaken for peak flanks downstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GapRun {
    pub start: usize,
    pub end: usize,
}

impl GapRun {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    pub fn contains(&self, scan_index: usize) -> bool {
        (self.start..self.end).contains(&scan_index)
    }
}

/// One extracted ion profile. The retention time axis lives on the owning
/// [`TrackSet`]; tracks of one sample all share it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MassTrack {
    /// Intensity-weighted mean m/z of the channel.
    pub mz: f64,
    /// Dense intensity profile, one entry per scan, zero-filled.
    pub intensity: Vec<f32>,
    /// Zero-signal runs between the first and last non-zero scan.
    pub gaps: Vec<GapRun>,
}

impl MassTrack {
    pub fn apex_intensity(&self) -> f32 {
        self.intensity.iter().copied().fold(0.0, f32::max)
    }

    pub fn total_intensity(&self) -> f64 {
        self.intensity.iter().map(|i| *i as f64).sum()
    }

    /// Scan index range spanning the first through last non-zero point.
    pub fn extent(&self) -> Option<(usize, usize)> {
        let first = self.intensity.iter().position(|i| *i > 0.0)?;
        let last = self.intensity.iter().rposition(|i| *i > 0.0)?;
        Some((first, last))
    }

    pub fn in_gap(&self, scan_index: usize) -> bool {
        self.gaps.iter().any(|g| g.contains(scan_index))
    }
}

/// All mass tracks of one sample, sharing one retention time axis.
/// Created once per sample and never mutated afterwards; this is the unit
/// that gets persisted for restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackSet {
    pub sample_id: String,
    /// Retention times (minutes) of the sample's scans, in order.
    pub time_axis: Vec<f64>,
    /// Tracks ordered by ascending m/z.
    pub tracks: Vec<MassTrack>,
    /// Points below the intensity floor or merged into an existing channel
    /// within the same scan, kept for the extraction audit.
    pub merged_points: usize,
}

impl TrackSet {
    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn gap_count(&self) -> usize {
        self.tracks.iter().map(|t| t.gaps.len()).sum()
    }

    pub fn mz_values(&self) -> impl Iterator<Item = f64> + '_ {
        self.tracks.iter().map(|t| t.mz)
    }
}

/// Accumulator for one provisional m/z channel during the sweep.
#[derive(Debug, Clone)]
struct Channel {
    center: f64,
    weight: f64,
    /// Sparse (scan index, intensity) pairs in scan order.
    points: Vec<(usize, f32)>,
}

impl Channel {
    fn new(mz: f64, scan_index: usize, intensity: f32) -> Self {
        Self {
            center: mz,
            weight: intensity.max(1.0) as f64,
            points: vec![(scan_index, intensity)],
        }
    }

    /// Fold a point into the channel, moving the center to the
    /// intensity-weighted running mean. Returns `true` when the point landed
    /// on a scan the channel already covered.
    fn add(&mut self, mz: f64, scan_index: usize, intensity: f32) -> bool {
        let w = intensity.max(1.0) as f64;
        self.center = (self.center * self.weight + mz * w) / (self.weight + w);
        self.weight += w;
        match self.points.last_mut() {
            Some((last, acc)) if *last == scan_index => {
                *acc += intensity;
                true
            }
            _ => {
                self.points.push((scan_index, intensity));
                false
            }
        }
    }
}

/// Converts one sample's centroided scans into a [`TrackSet`].
#[derive(Debug, Clone)]
pub struct MassTrackExtractor {
    mz_tolerance: crate::mass_error::Tolerance,
    min_intensity: f32,
    min_timepoints: usize,
}

impl MassTrackExtractor {
    pub fn new(params: &WorkflowParams) -> Self {
        Self {
            mz_tolerance: params.mz_tolerance,
            min_intensity: params.min_intensity,
            min_timepoints: params.min_timepoints.max(1),
        }
    }

    pub fn extract(&self, sample: &Sample) -> TrackSet {
        let mut channels: Vec<Channel> = Vec::new();
        let mut merged_points = 0usize;

        for (scan_index, scan) in sample.scans.iter().enumerate() {
            for (&mz, &intensity) in scan.mz.iter().zip(scan.intensity.iter()) {
                if intensity <= 0.0 {
                    merged_points += 1;
                    continue;
                }
                match self.nearest_channel(&channels, mz) {
                    Some(at) => {
                        if channels[at].add(mz, scan_index, intensity) {
                            merged_points += 1;
                        }
                        self.restore_order(&mut channels, at);
                    }
                    None => {
                        let at = channels.partition_point(|c| c.center < mz);
                        channels.insert(at, Channel::new(mz, scan_index, intensity));
                    }
                }
            }
        }

        let n_scans = sample.scans.len();
        let mut tracks: Vec<MassTrack> = channels
            .into_iter()
            .filter_map(|c| self.finish_channel(c, n_scans))
            .collect();
        tracks.sort_by(|a, b| a.mz.total_cmp(&b.mz));

        debug!(
            "Extracted {} mass tracks from sample {} ({} scans, {} merged/discarded points)",
            tracks.len(),
            sample.id,
            n_scans,
            merged_points
        );
        TrackSet {
            sample_id: sample.id.clone(),
            time_axis: sample.time_axis(),
            tracks,
            merged_points,
        }
    }

    /// Binary search for the channel whose center is nearest to `mz`,
    /// accepting it only when it falls inside the tolerance window.
    fn nearest_channel(&self, channels: &[Channel], mz: f64) -> Option<usize> {
        if channels.is_empty() {
            return None;
        }
        let at = channels.partition_point(|c| c.center < mz);
        let candidates = [at.checked_sub(1), (at < channels.len()).then_some(at)];
        let best = candidates
            .into_iter()
            .flatten()
            .min_by(|&a, &b| {
                let da = (channels[a].center - mz).abs();
                let db = (channels[b].center - mz).abs();
                da.total_cmp(&db)
            })?;
        self.mz_tolerance.test(channels[best].center, mz).then_some(best)
    }

    /// A weighted-mean update can nudge a center past a neighbor; bubble the
    /// channel back into sorted position so binary search stays valid.
    fn restore_order(&self, channels: &mut [Channel], mut at: usize) {
        while at > 0 && channels[at - 1].center > channels[at].center {
            channels.swap(at - 1, at);
            at -= 1;
        }
        while at + 1 < channels.len() && channels[at].center > channels[at + 1].center {
            channels.swap(at, at + 1);
            at += 1;
        }
    }

    fn finish_channel(&self, channel: Channel, n_scans: usize) -> Option<MassTrack> {
        let mut intensity = vec![0.0f32; n_scans];
        for (scan_index, value) in &channel.points {
            intensity[*scan_index] = *value;
        }

        let apex = intensity.iter().copied().fold(0.0, f32::max);
        if apex < self.min_intensity {
            return None;
        }
        if longest_signal_run(&intensity) < self.min_timepoints {
            return None;
        }

        let gaps = detect_gaps(&intensity);
        Some(MassTrack {
            mz: channel.center,
            intensity,
            gaps,
        })
    }
}

/// The length of the longest run of consecutive non-zero points.
fn longest_signal_run(intensity: &[f32]) -> usize {
    let mut best = 0usize;
    let mut run = 0usize;
    for &i in intensity {
        if i > 0.0 {
            run += 1;
            best = best.max(run);
        } else {
            run = 0;
        }
    }
    best
}

/// Locate maximal zero runs strictly inside the track's non-zero extent in a
/// single pass over the profile.
pub fn detect_gaps(intensity: &[f32]) -> Vec<GapRun> {
    let Some(first) = intensity.iter().position(|i| *i > 0.0) else {
        return Vec::new();
    };
    let last = intensity.iter().rposition(|i| *i > 0.0).unwrap();

    let mut gaps = Vec::new();
    let mut run_start: Option<usize> = None;
    for (offset, &value) in intensity[first..=last].iter().enumerate() {
        let index = first + offset;
        if value <= 0.0 {
            run_start.get_or_insert(index);
        } else if let Some(start) = run_start.take() {
            gaps.push(GapRun { start, end: index });
        }
    }
    gaps
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::params::{WorkflowMode, WorkflowParams};
    use crate::sample::Scan;

    fn params() -> WorkflowParams {
        let mut params = WorkflowParams::for_mode(WorkflowMode::LC);
        params.min_intensity = 100.0;
        params.min_timepoints = 2;
        params
    }

    fn sample_from_points(points: &[(f64, Vec<(f64, f32)>)]) -> Sample {
        let scans = points
            .iter()
            .map(|(time, pts)| {
                let mut pts = pts.clone();
                pts.sort_by(|a, b| a.0.total_cmp(&b.0));
                Scan::new(
                    *time,
                    pts.iter().map(|p| p.0).collect(),
                    pts.iter().map(|p| p.1).collect(),
                )
            })
            .collect();
        Sample::from_scans("test", scans)
    }

    #[test]
    fn test_points_within_tolerance_share_a_track() {
        // 5 ppm of 500 is 0.0025; these jitter by < 1 ppm.
        let sample = sample_from_points(&[
            (1.0, vec![(500.0000, 500.0)]),
            (2.0, vec![(500.0004, 800.0)]),
            (3.0, vec![(499.9998, 600.0)]),
        ]);
        let tracks = MassTrackExtractor::new(&params()).extract(&sample);
        assert_eq!(tracks.len(), 1);
        assert_eq!(tracks.tracks[0].intensity, vec![500.0, 800.0, 600.0]);
        assert!((tracks.tracks[0].mz - 500.0).abs() < 0.001);
    }

    #[test]
    fn test_points_beyond_tolerance_never_merge() {
        // 0.01 apart at m/z 500 is 20 ppm, four times the window.
        let sample = sample_from_points(&[
            (1.0, vec![(500.00, 500.0), (500.01, 700.0)]),
            (2.0, vec![(500.00, 600.0), (500.01, 800.0)]),
        ]);
        let tracks = MassTrackExtractor::new(&params()).extract(&sample);
        assert_eq!(tracks.len(), 2);
        assert!(tracks.tracks[0].mz < tracks.tracks[1].mz);
    }

    #[test]
    fn test_channel_assignment_is_order_invariant() {
        let forward = sample_from_points(&[
            (1.0, vec![(200.0, 300.0), (200.0008, 400.0), (201.0, 500.0)]),
            (2.0, vec![(200.0004, 350.0), (201.0002, 450.0)]),
        ]);
        let reversed = sample_from_points(&[
            (1.0, vec![(201.0, 500.0), (200.0008, 400.0), (200.0, 300.0)]),
            (2.0, vec![(201.0002, 450.0), (200.0004, 350.0)]),
        ]);
        let extractor = MassTrackExtractor::new(&params());
        let a = extractor.extract(&forward);
        let b = extractor.extract(&reversed);
        assert_eq!(a.len(), b.len());
        for (ta, tb) in a.tracks.iter().zip(b.tracks.iter()) {
            assert!((ta.mz - tb.mz).abs() < 1e-6);
            assert_eq!(ta.intensity, tb.intensity);
        }
    }

    #[test]
    fn test_gap_detection() {
        let intensity = [0.0, 0.0, 5.0, 6.0, 0.0, 0.0, 0.0, 7.0, 5.0, 0.0];
        let gaps = detect_gaps(&intensity);
        assert_eq!(gaps, vec![GapRun { start: 4, end: 7 }]);

        // Leading and trailing zeros are outside the extent, not gaps.
        assert!(detect_gaps(&[0.0, 1.0, 2.0, 0.0]).is_empty());
        assert!(detect_gaps(&[0.0; 4]).is_empty());
    }

    #[test]
    fn test_low_intensity_tracks_dropped() {
        let sample = sample_from_points(&[
            (1.0, vec![(300.0, 10.0)]),
            (2.0, vec![(300.0, 20.0)]),
        ]);
        let tracks = MassTrackExtractor::new(&params()).extract(&sample);
        assert!(tracks.is_empty());
    }

    #[test]
    fn test_same_scan_duplicates_are_merged() {
        let sample = sample_from_points(&[
            (1.0, vec![(400.0, 200.0), (400.0002, 300.0)]),
            (2.0, vec![(400.0001, 250.0)]),
        ]);
        let tracks = MassTrackExtractor::new(&params()).extract(&sample);
        assert_eq!(tracks.len(), 1);
        assert_eq!(tracks.tracks[0].intensity[0], 500.0);
        assert_eq!(tracks.merged_points, 1);
    }
}
