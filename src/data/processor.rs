//! Frame projection and averaging.
//!
//! A raw [`StreamFrame`] holds interleaved `(shaker position, signal)` pairs.
//! Projection bins the samples on the shaker step they were taken at and
//! labels each bin with its delay time, producing a [`ProcessedCurve`].
//! Curves are keyed by integer bin, so curves from different frames align
//! exactly even when they cover different parts of the shaker range.

use crate::error::{AppResult, DaqError};
use std::collections::{BTreeMap, VecDeque};

/// One raw frame as delivered by the producer.
#[derive(Debug, Clone)]
pub struct StreamFrame {
    /// Acquisition order, assigned when the frame is queued
    pub seq: u64,
    /// Interleaved `(position, signal)` samples
    pub samples: Vec<f64>,
}

/// Calibration constants used to project a frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProjectionParams {
    /// Pairs alternate pumped/unpumped; the curve is their difference
    pub dark_control: bool,
    /// Position signal per shaker step
    pub position_step: f64,
    /// Delay time per shaker step
    pub time_step: f64,
}

/// A time-labelled curve: mean signal per shaker bin.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessedCurve {
    /// Sequence number of the source frame (latest frame for averages)
    pub seq: u64,
    /// Delay time per bin
    pub time_step: f64,
    /// Bin index → value
    pub bins: BTreeMap<i64, f64>,
}

impl ProcessedCurve {
    /// Curve from explicit bins
    pub fn new(seq: u64, time_step: f64, bins: BTreeMap<i64, f64>) -> Self {
        Self {
            seq,
            time_step,
            bins,
        }
    }

    /// Delay time of every bin, ascending
    pub fn time_axis(&self) -> Vec<f64> {
        self.bins
            .keys()
            .map(|&bin| bin as f64 * self.time_step)
            .collect()
    }

    /// Values in time-axis order
    pub fn values(&self) -> Vec<f64> {
        self.bins.values().copied().collect()
    }

    /// Number of bins
    pub fn len(&self) -> usize {
        self.bins.len()
    }

    /// True if no bin has data
    pub fn is_empty(&self) -> bool {
        self.bins.is_empty()
    }

    /// Value of `bin`, if present
    pub fn value_at_bin(&self, bin: i64) -> Option<f64> {
        self.bins.get(&bin).copied()
    }
}

/// Project a raw frame onto the delay axis.
pub fn project(frame: &StreamFrame, params: &ProjectionParams) -> AppResult<ProcessedCurve> {
    if frame.samples.len() % 2 != 0 {
        return Err(DaqError::Processing(format!(
            "frame {} has an odd number of values ({})",
            frame.seq,
            frame.samples.len()
        )));
    }
    if !(params.position_step > 0.0 && params.time_step > 0.0) {
        return Err(DaqError::Validation(
            "position_step and time_step must be positive".into(),
        ));
    }

    let pairs: Vec<(f64, f64)> = frame
        .samples
        .chunks_exact(2)
        .map(|pair| (pair[0], pair[1]))
        .collect();

    // (position, value) after optional dark subtraction
    let points: Vec<(f64, f64)> = if params.dark_control {
        pairs
            .chunks_exact(2)
            .map(|pp| (0.5 * (pp[0].0 + pp[1].0), pp[0].1 - pp[1].1))
            .collect()
    } else {
        pairs
    };

    let mut sums: BTreeMap<i64, (f64, usize)> = BTreeMap::new();
    for (position, value) in points {
        if !(position.is_finite() && value.is_finite()) {
            continue;
        }
        let bin = (position / params.position_step).round() as i64;
        let entry = sums.entry(bin).or_insert((0.0, 0));
        entry.0 += value;
        entry.1 += 1;
    }
    if sums.is_empty() {
        return Err(DaqError::Processing(format!(
            "frame {} contains no usable samples",
            frame.seq
        )));
    }

    Ok(ProcessedCurve {
        seq: frame.seq,
        time_step: params.time_step,
        bins: sums
            .into_iter()
            .map(|(bin, (sum, n))| (bin, sum / n as f64))
            .collect(),
    })
}

/// Sliding-window mean of the most recent curves.
///
/// The mean is recomputed from the retained window on every change, so
/// shrinking the window takes effect immediately. Bins missing from any
/// retained curve are dropped from the result.
#[derive(Debug, Clone)]
pub struct RunningAverage {
    window: usize,
    history: VecDeque<ProcessedCurve>,
    current: Option<ProcessedCurve>,
}

impl RunningAverage {
    /// Empty average over `window` curves (at least one)
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            history: VecDeque::with_capacity(window.max(1)),
            current: None,
        }
    }

    /// Append a curve and recompute
    pub fn push(&mut self, curve: ProcessedCurve) -> Option<&ProcessedCurve> {
        self.history.push_back(curve);
        while self.history.len() > self.window {
            self.history.pop_front();
        }
        self.recompute();
        self.current.as_ref()
    }

    /// Change the window size, dropping the oldest curves if it shrinks
    pub fn set_window(&mut self, window: usize) -> Option<&ProcessedCurve> {
        self.window = window.max(1);
        while self.history.len() > self.window {
            self.history.pop_front();
        }
        self.recompute();
        self.current.as_ref()
    }

    /// Window size
    pub fn window(&self) -> usize {
        self.window
    }

    /// Retained curves, oldest first
    pub fn history(&self) -> &VecDeque<ProcessedCurve> {
        &self.history
    }

    /// Latest mean, if any bin is shared by all retained curves
    pub fn current(&self) -> Option<&ProcessedCurve> {
        self.current.as_ref()
    }

    /// Forget everything
    pub fn clear(&mut self) {
        self.history.clear();
        self.current = None;
    }

    fn recompute(&mut self) {
        let Some(latest) = self.history.back() else {
            self.current = None;
            return;
        };
        let n = self.history.len() as f64;
        let bins: BTreeMap<i64, f64> = latest
            .bins
            .keys()
            .filter_map(|&bin| {
                self.history
                    .iter()
                    .map(|curve| curve.value_at_bin(bin))
                    .sum::<Option<f64>>()
                    .map(|sum| (bin, sum / n))
            })
            .collect();

        self.current = if bins.is_empty() {
            None
        } else {
            Some(ProcessedCurve::new(latest.seq, latest.time_step, bins))
        };
    }
}

/// Incremental per-sample mean of raw frames.
#[derive(Debug, Clone, Default)]
pub struct RawAverage {
    mean: Vec<f64>,
    count: usize,
}

impl RawAverage {
    /// Fold one frame into the mean. A frame of different length restarts it.
    pub fn update(&mut self, samples: &[f64]) {
        if samples.len() != self.mean.len() {
            self.mean = samples.to_vec();
            self.count = 1;
            return;
        }
        self.count += 1;
        let n = self.count as f64;
        for (m, &x) in self.mean.iter_mut().zip(samples) {
            *m += (x - *m) / n;
        }
    }

    /// Current mean (empty before the first frame)
    pub fn mean(&self) -> &[f64] {
        &self.mean
    }

    /// Frames folded in
    pub fn count(&self) -> usize {
        self.count
    }

    /// Forget everything
    pub fn clear(&mut self) {
        self.mean.clear();
        self.count = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn curve(seq: u64, points: &[(i64, f64)]) -> ProcessedCurve {
        ProcessedCurve::new(seq, 0.5, points.iter().copied().collect())
    }

    const PARAMS: ProjectionParams = ProjectionParams {
        dark_control: false,
        position_step: 0.1,
        time_step: 0.5,
    };

    #[test]
    fn projection_bins_and_labels_samples() {
        let frame = StreamFrame {
            seq: 3,
            samples: vec![0.0, 1.0, 0.101, 3.0, 0.099, 5.0, -0.2, 7.0],
        };
        let curve = project(&frame, &PARAMS).unwrap();
        assert_eq!(curve.seq, 3);
        assert_eq!(curve.time_axis(), vec![-1.0, 0.0, 0.5]);
        assert_eq!(curve.values(), vec![7.0, 1.0, 4.0]);
    }

    #[test]
    fn dark_control_subtracts_unpumped_pairs() {
        let frame = StreamFrame {
            seq: 0,
            samples: vec![0.1, 5.0, 0.1, 2.0, 0.2, 4.0, 0.2, 4.5],
        };
        let params = ProjectionParams {
            dark_control: true,
            ..PARAMS
        };
        let curve = project(&frame, &params).unwrap();
        assert_eq!(curve.bins[&1], 3.0);
        assert_eq!(curve.bins[&2], -0.5);
    }

    #[test]
    fn malformed_frames_are_processing_errors() {
        let odd = StreamFrame {
            seq: 1,
            samples: vec![0.0, 1.0, 2.0],
        };
        assert!(matches!(project(&odd, &PARAMS), Err(DaqError::Processing(_))));

        let nan = StreamFrame {
            seq: 2,
            samples: vec![f64::NAN, 1.0],
        };
        assert!(project(&nan, &PARAMS).is_err());
    }

    #[test]
    fn average_covers_only_the_last_window() {
        let mut avg = RunningAverage::new(3);
        for i in 0..5 {
            avg.push(curve(i, &[(0, i as f64), (1, 10.0 * i as f64)]));
        }
        let current = avg.current().unwrap();
        // curves 2, 3, 4
        assert_eq!(current.bins[&0], 3.0);
        assert_eq!(current.bins[&1], 30.0);
        assert_eq!(current.seq, 4);
        assert_eq!(avg.history().len(), 3);
    }

    #[test]
    fn average_drops_bins_missing_from_any_curve() {
        let mut avg = RunningAverage::new(2);
        avg.push(curve(0, &[(0, 1.0), (1, 1.0), (2, 1.0)]));
        avg.push(curve(1, &[(1, 3.0), (2, 3.0), (3, 3.0)]));
        let current = avg.current().unwrap();
        assert_eq!(current.bins.keys().copied().collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(current.bins[&1], 2.0);
    }

    #[test]
    fn shrinking_window_recomputes_from_retained_curves() {
        let mut avg = RunningAverage::new(4);
        for i in 0..4 {
            avg.push(curve(i, &[(0, i as f64)]));
        }
        assert_eq!(avg.current().unwrap().bins[&0], 1.5);
        let current = avg.set_window(2).unwrap();
        assert_eq!(current.bins[&0], 2.5);
    }

    #[test]
    fn disjoint_window_has_no_average() {
        let mut avg = RunningAverage::new(2);
        avg.push(curve(0, &[(0, 1.0)]));
        assert!(avg.push(curve(1, &[(5, 1.0)])).is_none());
    }

    #[test]
    fn raw_average_is_incremental_mean() {
        let mut raw = RawAverage::default();
        raw.update(&[1.0, 2.0]);
        raw.update(&[3.0, 6.0]);
        raw.update(&[5.0, 10.0]);
        assert_eq!(raw.count(), 3);
        assert_eq!(raw.mean(), &[3.0, 6.0]);

        raw.update(&[1.0]);
        assert_eq!(raw.count(), 1);
    }
}
