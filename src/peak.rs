//! Chromatographic peak detection within a single mass track.
//!
//! Tracks are smoothed with a configurable number of locally weighted passes,
//! then local maxima are picked by prominence: the apex height above the
//! higher of its two flanking minima. Both knobs come exclusively from
//! [`WorkflowParams`], so every entry point resolves them identically.

use serde::{Deserialize, Serialize};

use crate::params::WorkflowParams;
use crate::track::{MassTrack, TrackSet};

/// A detected chromatographic peak. Holds the index of its parent track in
/// the owning [`TrackSet`] for lookup, not ownership.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Peak {
    /// Index of the parent mass track within its sample's track set.
    pub track_index: usize,
    /// m/z of the parent track at detection time.
    pub mz: f64,
    /// Retention time (minutes) of the apex.
    pub apex_time: f64,
    /// Retention times of the flanking minima bounding the peak.
    pub left_time: f64,
    pub right_time: f64,
    /// Scan index of the apex.
    pub apex_index: usize,
    /// Raw apex intensity.
    pub height: f32,
    /// Apex height above the higher flanking minimum, from the smoothed profile.
    pub prominence: f32,
    /// Trapezoidal integral of the raw profile between the boundaries.
    pub area: f64,
    /// Gaussian shape score in `[0, 1]`; R-squared of a moment-fitted
    /// Gaussian against the raw profile.
    pub quality: f64,
}

/// Finds peaks in mass tracks under a fixed parameter record.
#[derive(Debug, Clone)]
pub struct PeakDetector {
    smoothing_iterations: usize,
    min_prominence: f32,
    min_intensity: f32,
    min_timepoints: usize,
}

impl PeakDetector {
    pub fn new(params: &WorkflowParams) -> Self {
        Self {
            smoothing_iterations: params.smoothing_iterations,
            min_prominence: params.min_prominence,
            min_intensity: params.min_intensity,
            min_timepoints: params.min_timepoints.max(1),
        }
    }

    /// Detect peaks across every track of a sample, ordered by track then
    /// apex time.
    pub fn detect(&self, tracks: &TrackSet) -> Vec<Peak> {
        let mut peaks = Vec::new();
        for (track_index, track) in tracks.tracks.iter().enumerate() {
            self.detect_in_track(track, track_index, &tracks.time_axis, &mut peaks);
        }
        peaks
    }

    pub fn detect_in_track(
        &self,
        track: &MassTrack,
        track_index: usize,
        time_axis: &[f64],
        out: &mut Vec<Peak>,
    ) {
        let n = track.intensity.len();
        if n < 3 || time_axis.len() != n {
            return;
        }
        let smoothed = smooth(&track.intensity, self.smoothing_iterations);

        for apex in 1..n - 1 {
            if !is_local_maximum(&smoothed, apex) {
                continue;
            }
            // A gap scan carries no signal by construction, but an apex
            // adjacent to a gap edge can ride on interpolation artifacts
            // introduced by smoothing.
            if track.intensity[apex] <= 0.0 || track.in_gap(apex) {
                continue;
            }
            let (left, right, prominence) = prominence_bounds(&smoothed, apex);
            if prominence < self.min_prominence {
                continue;
            }
            if track.intensity[apex] < self.min_intensity {
                continue;
            }
            // Boundaries must not reach across a recorded gap; clip them to
            // the enclosing contiguous signal segment.
            let left = clip_to_segment(track, apex, left, true);
            let right = clip_to_segment(track, apex, right, false);
            if right - left + 1 < self.min_timepoints {
                continue;
            }

            let area = trapezoid_area(&track.intensity, time_axis, left, right);
            let quality = gaussian_shape_score(&track.intensity, time_axis, apex, left, right);
            out.push(Peak {
                track_index,
                mz: track.mz,
                apex_time: time_axis[apex],
                left_time: time_axis[left],
                right_time: time_axis[right],
                apex_index: apex,
                height: track.intensity[apex],
                prominence,
                area,
                quality,
            });
        }
    }
}

/// One pass of the locally weighted 1-2-1 smoother, repeated `iterations`
/// times. Endpoints are preserved; the kernel is symmetric, so apex positions
/// shift by at most the quantization of neighboring ties.
pub fn smooth(intensity: &[f32], iterations: usize) -> Vec<f32> {
    let mut current = intensity.to_vec();
    if current.len() < 3 {
        return current;
    }
    for _ in 0..iterations {
        let mut next = current.clone();
        for i in 1..current.len() - 1 {
            next[i] = (current[i - 1] + 2.0 * current[i] + current[i + 1]) / 4.0;
        }
        current = next;
    }
    current
}

fn is_local_maximum(y: &[f32], i: usize) -> bool {
    // A plateau resolves to its leftmost sample.
    y[i] > y[i - 1] && y[i] >= y[i + 1]
}

/// Walk outward from the apex until a higher point or the profile edge, and
/// return the flanking minima and the prominence over the higher of the two.
/// Both walks stop at the first sample reaching the minimal value, so a flat
/// baseline does not drag a boundary away from the signal.
fn prominence_bounds(y: &[f32], apex: usize) -> (usize, usize, f32) {
    let apex_height = y[apex];

    let mut left = apex;
    let mut left_min = apex_height;
    let mut i = apex;
    while i > 0 {
        i -= 1;
        if y[i] > apex_height {
            break;
        }
        if y[i] < left_min {
            left_min = y[i];
            left = i;
        }
    }

    let mut right = apex;
    let mut right_min = apex_height;
    let mut i = apex;
    while i + 1 < y.len() {
        i += 1;
        if y[i] > apex_height {
            break;
        }
        if y[i] < right_min {
            right_min = y[i];
            right = i;
        }
    }

    (left, right, apex_height - left_min.max(right_min))
}

/// Pull a boundary inward so the peak never spans a recorded gap run.
fn clip_to_segment(track: &MassTrack, apex: usize, boundary: usize, leftward: bool) -> usize {
    if leftward {
        for gap in track.gaps.iter().rev() {
            if gap.end <= apex && gap.end > boundary {
                return gap.end;
            }
        }
    } else {
        for gap in &track.gaps {
            if gap.start > apex && gap.start <= boundary {
                return gap.start.saturating_sub(1).max(apex);
            }
        }
    }
    boundary
}

fn trapezoid_area(y: &[f32], t: &[f64], left: usize, right: usize) -> f64 {
    (left..right)
        .map(|i| {
            let dt = t[i + 1] - t[i];
            dt * (y[i] as f64 + y[i + 1] as f64) / 2.0
        })
        .sum()
}

/// R-squared of a moment-estimated Gaussian against the raw segment.
/// Uses the apex for amplitude and center and the intensity-weighted spread
/// for sigma; a proper least squares fit buys little for scoring.
fn gaussian_shape_score(y: &[f32], t: &[f64], apex: usize, left: usize, right: usize) -> f64 {
    if right <= left + 1 {
        return 0.0;
    }
    let segment = &y[left..=right];
    let times = &t[left..=right];

    let total: f64 = segment.iter().map(|v| *v as f64).sum();
    if total <= 0.0 {
        return 0.0;
    }
    let mu = t[apex];
    let variance: f64 = segment
        .iter()
        .zip(times.iter())
        .map(|(v, ti)| *v as f64 * (ti - mu).powi(2))
        .sum::<f64>()
        / total;
    let sigma = variance.sqrt().max(1e-6);
    let amplitude = y[apex] as f64;

    let mean: f64 = total / segment.len() as f64;
    let mut ss_res = 0.0;
    let mut ss_tot = 0.0;
    for (v, ti) in segment.iter().zip(times.iter()) {
        let fitted = amplitude * (-(ti - mu).powi(2) / (2.0 * sigma * sigma)).exp();
        ss_res += (*v as f64 - fitted).powi(2);
        ss_tot += (*v as f64 - mean).powi(2);
    }
    if ss_tot <= 0.0 {
        return 0.0;
    }
    (1.0 - ss_res / ss_tot).clamp(0.0, 1.0)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::params::{WorkflowMode, WorkflowParams};
    use crate::track::detect_gaps;

    fn detector(min_prominence: f32) -> PeakDetector {
        let mut params = WorkflowParams::for_mode(WorkflowMode::LC);
        params.min_prominence = min_prominence;
        params.min_intensity = 10.0;
        params.min_timepoints = 3;
        params.smoothing_iterations = 1;
        PeakDetector::new(&params)
    }

    fn track_from(intensity: Vec<f32>) -> (MassTrack, Vec<f64>) {
        let time_axis: Vec<f64> = (0..intensity.len()).map(|i| i as f64 * 0.1).collect();
        let gaps = detect_gaps(&intensity);
        (
            MassTrack {
                mz: 400.0,
                intensity,
                gaps,
            },
            time_axis,
        )
    }

    #[test]
    fn test_single_gaussian_peak() {
        let (track, axis) = track_from(vec![
            0.0, 10.0, 80.0, 400.0, 1000.0, 400.0, 80.0, 10.0, 0.0,
        ]);
        let mut peaks = Vec::new();
        detector(50.0).detect_in_track(&track, 0, &axis, &mut peaks);
        assert_eq!(peaks.len(), 1);
        let peak = &peaks[0];
        assert_eq!(peak.apex_index, 4);
        assert!((peak.apex_time - 0.4).abs() < 1e-9);
        assert!(peak.left_time < peak.apex_time && peak.apex_time < peak.right_time);
        assert!(peak.area > 0.0);
        assert!(peak.quality > 0.8, "shape score was {}", peak.quality);
    }

    #[test]
    fn test_two_resolved_peaks() {
        let (track, axis) = track_from(vec![
            0.0, 20.0, 900.0, 2000.0, 900.0, 100.0, 800.0, 1800.0, 800.0, 20.0, 0.0,
        ]);
        let mut peaks = Vec::new();
        detector(100.0).detect_in_track(&track, 0, &axis, &mut peaks);
        assert_eq!(peaks.len(), 2);
        assert_eq!(peaks[0].apex_index, 3);
        assert_eq!(peaks[1].apex_index, 7);
    }

    #[test]
    fn test_prominence_threshold_suppresses_shoulder() {
        let (track, axis) = track_from(vec![
            0.0, 20.0, 900.0, 2000.0, 1900.0, 1950.0, 900.0, 100.0, 0.0,
        ]);
        let mut peaks = Vec::new();
        detector(500.0).detect_in_track(&track, 0, &axis, &mut peaks);
        // The bump at index 5 has tiny prominence and must not survive the
        // threshold; only the main apex region remains.
        assert_eq!(peaks.len(), 1);
        assert!(peaks[0].apex_index == 3 || peaks[0].apex_index == 4);
    }

    #[test]
    fn test_gap_runs_produce_no_peaks() {
        let (track, axis) = track_from(vec![
            0.0, 50.0, 1500.0, 50.0, 0.0, 0.0, 0.0, 50.0, 1400.0, 50.0, 0.0,
        ]);
        let mut peaks = Vec::new();
        detector(100.0).detect_in_track(&track, 0, &axis, &mut peaks);
        assert_eq!(peaks.len(), 2);
        for peak in &peaks {
            assert!(!track.in_gap(peak.apex_index));
            // Boundaries stay within the apex's own signal segment.
            assert!(!(peak.left_time < axis[4] && peak.right_time > axis[6]));
        }
    }

    #[test]
    fn test_detection_is_deterministic() {
        let (track, axis) = track_from(vec![
            0.0, 10.0, 80.0, 400.0, 1000.0, 400.0, 80.0, 10.0, 0.0,
        ]);
        let det = detector(50.0);
        let mut first = Vec::new();
        let mut second = Vec::new();
        det.detect_in_track(&track, 0, &axis, &mut first);
        det.detect_in_track(&track, 0, &axis, &mut second);
        assert_eq!(first, second);
    }

    #[test]
    fn test_flat_baseline_boundaries_are_symmetric() {
        let (track, axis) = track_from(vec![
            0.0, 0.0, 0.0, 10.0, 400.0, 1000.0, 400.0, 10.0, 0.0, 0.0, 0.0,
        ]);
        let mut peaks = Vec::new();
        detector(50.0).detect_in_track(&track, 0, &axis, &mut peaks);
        assert_eq!(peaks.len(), 1);
        let peak = &peaks[0];
        // Boundaries stop at the nearest flanking minimum on both sides
        // rather than sliding along the zero baseline.
        let left_span = peak.apex_time - peak.left_time;
        let right_span = peak.right_time - peak.apex_time;
        assert!((left_span - right_span).abs() < 1e-9, "{left_span} vs {right_span}");
        assert!(peak.left_time >= axis[1]);
    }

    #[test]
    fn test_smoothing_preserves_apex_location() {
        let raw = vec![0.0, 10.0, 80.0, 400.0, 1000.0, 400.0, 80.0, 10.0, 0.0];
        for iterations in 0..4 {
            let smoothed = smooth(&raw, iterations);
            let apex = smoothed
                .iter()
                .enumerate()
                .max_by(|a, b| a.1.total_cmp(b.1))
                .map(|(i, _)| i)
                .unwrap();
            assert_eq!(apex, 4, "apex drifted with {iterations} iterations");
        }
    }
}
