//! Shaker Calibration Procedure
//!
//! Derives the delay per shaker step by moving the delay stage through a set
//! of known positions and watching the autocorrelation peak move along the
//! shaker axis:
//!
//! 1. One single shot gives the current delay window; probe positions span
//!    `range_fraction` of it, forward then in reverse (exposes backlash).
//! 2. At every probe position: move, single shot, project with unit step,
//!    fit the peak center (in shaker steps).
//! 3. Pairwise slopes `|Δposition| / |Δcenter|`; slopes further than 2σ from
//!    their mean are dropped.
//! 4. Least-squares line `position = slope * center + intercept`; points
//!    with a residual beyond 1.2σ are dropped and the line is refit.
//!
//! Both the robust mean slope and the refit slope are reported; the caller
//! decides which one becomes the new `shaker_ps_per_step`.
//!
//! The mean pairwise slope averages `Δposition / Δcenter` directly and
//! applies the 2σ cut to those values. This is not the reciprocal of the
//! mean `Δcenter / Δposition` (center steps per unit delay); the two
//! estimators agree for a linear response without noise and drift apart as
//! the scatter of the centers grows, so a value from a tool reporting
//! `1 / mean(Δcenter / Δposition)` will not match it digit for digit.
//!
//! # Configuration
//!
//! ```toml
//! [calibration]
//! iterations = 20
//! integration = 1
//! range_fraction = 0.7
//! ```

use crate::acquisition::producer::SharedSource;
use crate::config::{CalibrationConfig, FastScanConfig};
use crate::data::fit::fit_autocorrelation;
use crate::data::processor::{project, ProjectionParams, StreamFrame};
use crate::error::{AppResult, DaqError};
use crate::hardware::capabilities::Movable;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

// Rounding noise below this relative size never counts as an outlier.
const NOISE_FLOOR: f64 = 1e-9;

/// Stage position and the fitted peak center measured there.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationPoint {
    /// Commanded stage position
    pub stage_position: f64,
    /// Fitted autocorrelation center, in shaker steps
    pub center: f64,
}

/// Outcome of the calibration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationResult {
    /// All measured points, in probe order
    pub points: Vec<CalibrationPoint>,
    /// Mean of the pairwise slopes kept by the 2σ pass
    pub mean_pairwise_slope: f64,
    /// Slope of the refit line
    pub slope: f64,
    /// Intercept of the refit line
    pub intercept: f64,
    /// Pairwise slopes kept by the first pass
    pub first_pass_kept: usize,
    /// Points kept by the second pass
    pub second_pass_kept: usize,
    /// Indices into `points` excluded by the second pass
    pub rejected: Vec<usize>,
}

/// `iterations / 2` evenly spaced positions from `min` to `max`, followed by
/// the same positions in reverse.
pub fn probe_positions(min: f64, max: f64, iterations: usize) -> Vec<f64> {
    let half = iterations / 2;
    let forward: Vec<f64> = match half {
        0 => Vec::new(),
        1 => vec![min],
        n => (0..n)
            .map(|i| min + (max - min) * i as f64 / (n - 1) as f64)
            .collect(),
    };
    forward
        .iter()
        .copied()
        .chain(forward.iter().rev().copied())
        .collect()
}

fn mean_and_std(values: &[f64]) -> (f64, f64) {
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    (mean, var.sqrt())
}

/// Least-squares line through `(x, y)`: returns `(slope, intercept)`.
pub fn linear_fit(x: &[f64], y: &[f64]) -> AppResult<(f64, f64)> {
    if x.len() != y.len() || x.len() < 2 {
        return Err(DaqError::Processing(format!(
            "linear fit needs at least two paired points (got {} and {})",
            x.len(),
            y.len()
        )));
    }
    let (mx, _) = mean_and_std(x);
    let (my, _) = mean_and_std(y);
    let sxx: f64 = x.iter().map(|v| (v - mx).powi(2)).sum();
    if sxx == 0.0 {
        return Err(DaqError::Processing("all x values are identical".into()));
    }
    let sxy: f64 = x.iter().zip(y).map(|(a, b)| (a - mx) * (b - my)).sum();
    let slope = sxy / sxx;
    Ok((slope, my - slope * mx))
}

/// Two-pass robust analysis of measured calibration points.
pub fn analyze(points: Vec<CalibrationPoint>) -> AppResult<CalibrationResult> {
    if points.len() < 2 {
        return Err(DaqError::Processing(format!(
            "calibration needs at least two points, got {}",
            points.len()
        )));
    }

    let slopes: Vec<f64> = points
        .windows(2)
        .filter_map(|pair| {
            let d_pos = (pair[1].stage_position - pair[0].stage_position).abs();
            let d_center = (pair[1].center - pair[0].center).abs();
            (d_pos > 0.0 && d_center > 0.0).then(|| d_pos / d_center)
        })
        .collect();
    if slopes.is_empty() {
        return Err(DaqError::Processing("no usable position pairs".into()));
    }
    let (mean, std) = mean_and_std(&slopes);
    let slope_limit = 2.0 * std + NOISE_FLOOR * mean.abs();
    let good: Vec<f64> = slopes
        .iter()
        .copied()
        .filter(|s| (s - mean).abs() <= slope_limit)
        .collect();
    let (mean_pairwise_slope, _) = mean_and_std(&good);
    debug!(
        slopes = slopes.len(),
        kept = good.len(),
        mean_pairwise_slope,
        "first pass"
    );

    let centers: Vec<f64> = points.iter().map(|p| p.center).collect();
    let positions: Vec<f64> = points.iter().map(|p| p.stage_position).collect();
    let (a, b) = linear_fit(&centers, &positions)?;
    let residuals: Vec<f64> = points
        .iter()
        .map(|p| p.stage_position - (a * p.center + b))
        .collect();
    let (_, residual_std) = mean_and_std(&residuals);
    let scale = positions.iter().fold(1.0_f64, |m, p| m.max(p.abs()));
    let residual_limit = 1.2 * residual_std + NOISE_FLOOR * scale;

    let (kept, rejected): (Vec<usize>, Vec<usize>) = (0..points.len())
        .partition(|&i| residuals[i].abs() <= residual_limit);
    let kept_centers: Vec<f64> = kept.iter().map(|&i| centers[i]).collect();
    let kept_positions: Vec<f64> = kept.iter().map(|&i| positions[i]).collect();
    let (slope, intercept) = linear_fit(&kept_centers, &kept_positions)?;
    debug!(kept = kept.len(), rejected = ?rejected, slope, "second pass");

    Ok(CalibrationResult {
        first_pass_kept: good.len(),
        second_pass_kept: kept.len(),
        points,
        mean_pairwise_slope,
        slope,
        intercept,
        rejected,
    })
}

async fn single_shot(source: &SharedSource, n_samples: usize, dark: bool, integration: usize) -> AppResult<Vec<f64>> {
    let source = source.clone();
    tokio::task::spawn_blocking(move || source.lock().single_shot(n_samples, dark, integration))
        .await
        .map_err(|e| DaqError::Processing(format!("single shot task aborted: {e}")))?
        .map_err(DaqError::from_hardware)
}

/// Measure and analyse. The caller must hold the hardware.
pub async fn run(
    stage: &Arc<dyn Movable>,
    source: &SharedSource,
    fastscan: &FastScanConfig,
    config: &CalibrationConfig,
) -> AppResult<CalibrationResult> {
    config.validate()?;
    let n_samples = fastscan.n_samples;
    let dark = fastscan.dark_control;

    let frame = StreamFrame {
        seq: 0,
        samples: single_shot(source, n_samples, dark, config.integration).await?,
    };
    let window = project(
        &frame,
        &ProjectionParams {
            dark_control: dark,
            position_step: fastscan.shaker_position_step,
            time_step: fastscan.shaker_ps_per_step,
        },
    )?;
    let axis = window.time_axis();
    let lo = axis.first().copied().unwrap_or_default() * config.range_fraction;
    let hi = axis.last().copied().unwrap_or_default() * config.range_fraction;
    let positions = probe_positions(lo, hi, config.iterations);
    info!(lo, hi, probes = positions.len(), "shaker calibration started");

    let unit = ProjectionParams {
        dark_control: dark,
        position_step: fastscan.shaker_position_step,
        time_step: 1.0,
    };
    let expected_width = fastscan.expected_pulse_duration / fastscan.shaker_ps_per_step;

    let mut points = Vec::with_capacity(positions.len());
    for (i, &position) in positions.iter().enumerate() {
        stage
            .move_abs(position)
            .await
            .map_err(DaqError::from_hardware)?;
        let frame = StreamFrame {
            seq: i as u64 + 1,
            samples: single_shot(source, n_samples, dark, config.integration).await?,
        };
        let curve = project(&frame, &unit)?;
        match fit_autocorrelation(&curve, expected_width) {
            Ok(fit) => {
                debug!(position, center = fit.center, "calibration point");
                points.push(CalibrationPoint {
                    stage_position: position,
                    center: fit.center,
                });
            }
            Err(err @ DaqError::FitNotConverged(_)) => {
                warn!(position, "skipping calibration point: {err}");
            }
            Err(err) => return Err(err),
        }
    }

    let result = analyze(points)?;
    info!(
        mean_pairwise_slope = result.mean_pairwise_slope,
        slope = result.slope,
        rejected = result.rejected.len(),
        "shaker calibration finished"
    );
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_positions_go_forward_then_back() {
        let positions = probe_positions(-1.0, 1.0, 6);
        assert_eq!(positions, vec![-1.0, 0.0, 1.0, 1.0, 0.0, -1.0]);
        assert!(probe_positions(0.0, 1.0, 1).is_empty());
    }

    #[test]
    fn exact_line_is_recovered() {
        let points: Vec<CalibrationPoint> = (0..10)
            .map(|i| CalibrationPoint {
                stage_position: 0.05 * i as f64 - 0.3,
                center: i as f64,
            })
            .collect();
        let result = analyze(points).unwrap();
        assert!((result.slope - 0.05).abs() < 1e-12);
        assert!((result.intercept + 0.3).abs() < 1e-12);
        assert!((result.mean_pairwise_slope - 0.05).abs() < 1e-12);
        assert!(result.rejected.is_empty());
    }

    #[test]
    fn both_passes_drop_an_injected_outlier() {
        let mut points: Vec<CalibrationPoint> = (0..40)
            .map(|i| CalibrationPoint {
                stage_position: 0.05 * i as f64 + 1.0,
                center: i as f64,
            })
            .collect();
        points[17].stage_position += 2.0;

        let result = analyze(points).unwrap();
        // the two slopes touching point 17 fall outside 2σ
        assert_eq!(result.first_pass_kept, 37);
        assert!((result.mean_pairwise_slope - 0.05).abs() < 1e-9);
        assert_eq!(result.rejected, vec![17]);
        assert_eq!(result.second_pass_kept, 39);
        assert!((result.slope - 0.05).abs() < 1e-9);
        assert!((result.intercept - 1.0).abs() < 1e-9);
    }

    #[test]
    fn too_few_points_is_an_error() {
        let one = vec![CalibrationPoint {
            stage_position: 0.0,
            center: 0.0,
        }];
        assert!(analyze(one).is_err());
    }
}
