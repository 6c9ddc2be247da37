//! Autocorrelation peak fit.
//!
//! Fits `amplitude * exp(-(t - center)^2 / (2 sigma^2)) + offset` with a
//! Levenberg-Marquardt iteration. Non-convergence is reported as
//! [`DaqError::FitNotConverged`], which callers treat as recoverable.

use crate::data::processor::ProcessedCurve;
use crate::error::{AppResult, DaqError};
use serde::{Deserialize, Serialize};

/// FWHM of a Gaussian in units of sigma: 2 * sqrt(2 ln 2)
pub const FWHM_PER_SIGMA: f64 = 2.354_820_045_030_949;

const MAX_ITERATIONS: usize = 200;
const MAX_LAMBDA: f64 = 1e12;
const RELATIVE_TOLERANCE: f64 = 1e-10;

/// Result of a successful peak fit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PeakFit {
    /// Peak height above the offset
    pub amplitude: f64,
    /// Peak position
    pub center: f64,
    /// Gaussian width
    pub sigma: f64,
    /// Constant background
    pub offset: f64,
    /// Full width at half maximum
    pub fwhm: f64,
    /// Root-mean-square residual
    pub rms_residual: f64,
    /// Accepted iterations
    pub iterations: usize,
}

type Params = [f64; 4];

fn model(p: &Params, x: f64) -> (f64, [f64; 4]) {
    let [amplitude, center, sigma, offset] = *p;
    let d = x - center;
    let e = (-0.5 * d * d / (sigma * sigma)).exp();
    let value = amplitude * e + offset;
    let jac = [
        e,
        amplitude * e * d / (sigma * sigma),
        amplitude * e * d * d / (sigma * sigma * sigma),
        1.0,
    ];
    (value, jac)
}

fn cost(p: &Params, x: &[f64], y: &[f64]) -> f64 {
    x.iter()
        .zip(y)
        .map(|(&xi, &yi)| {
            let r = yi - model(p, xi).0;
            r * r
        })
        .sum()
}

/// Solve the 4x4 system `a * x = b` by Gaussian elimination with partial pivoting.
fn solve4(mut a: [[f64; 4]; 4], mut b: [f64; 4]) -> Option<[f64; 4]> {
    for col in 0..4 {
        let pivot = (col..4).max_by(|&i, &j| a[i][col].abs().total_cmp(&a[j][col].abs()))?;
        if a[pivot][col].abs() < 1e-300 {
            return None;
        }
        a.swap(col, pivot);
        b.swap(col, pivot);
        for row in col + 1..4 {
            let factor = a[row][col] / a[col][col];
            for k in col..4 {
                a[row][k] -= factor * a[col][k];
            }
            b[row] -= factor * b[col];
        }
    }
    let mut x = [0.0; 4];
    for row in (0..4).rev() {
        let tail: f64 = (row + 1..4).map(|k| a[row][k] * x[k]).sum();
        x[row] = (b[row] - tail) / a[row][row];
    }
    x.iter().all(|v| v.is_finite()).then_some(x)
}

/// Half-maximum width around the highest sample, converted to sigma.
fn estimate_sigma(x: &[f64], y: &[f64], peak: usize, offset: f64, fallback: f64) -> f64 {
    let half = offset + 0.5 * (y[peak] - offset);
    let left = (0..peak).rev().find(|&i| y[i] < half).unwrap_or(0);
    let right = (peak + 1..y.len()).find(|&i| y[i] < half).unwrap_or(y.len() - 1);
    let width = (x[right] - x[left]).abs();
    if width > 0.0 {
        width / FWHM_PER_SIGMA
    } else {
        fallback
    }
}

/// Fit a Gaussian peak to `(x, y)`.
///
/// `expected_width` (FWHM) is used when the data does not allow a width
/// estimate.
pub fn fit_gaussian(x: &[f64], y: &[f64], expected_width: f64) -> AppResult<PeakFit> {
    if x.len() != y.len() {
        return Err(DaqError::Validation(format!(
            "x and y differ in length ({} != {})",
            x.len(),
            y.len()
        )));
    }
    if x.len() < 5 {
        return Err(DaqError::FitNotConverged(format!(
            "{} points are not enough for a 4-parameter fit",
            x.len()
        )));
    }
    if x.iter().chain(y).any(|v| !v.is_finite()) {
        return Err(DaqError::FitNotConverged("data contains non-finite values".into()));
    }

    let (peak, &y_max) = y
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(b.1))
        .ok_or_else(|| DaqError::FitNotConverged("empty data".into()))?;
    let y_min = y.iter().copied().fold(f64::INFINITY, f64::min);
    if y_max - y_min <= f64::EPSILON * y_max.abs().max(1.0) {
        return Err(DaqError::FitNotConverged("data has no peak".into()));
    }

    let fallback_sigma = (expected_width / FWHM_PER_SIGMA).max(f64::MIN_POSITIVE);
    let mut p: Params = [
        y_max - y_min,
        x[peak],
        estimate_sigma(x, y, peak, y_min, fallback_sigma),
        y_min,
    ];

    let mut current = cost(&p, x, y);
    let scale = y.iter().map(|v| v * v).sum::<f64>().max(f64::MIN_POSITIVE);
    let mut lambda = 1e-3;
    let mut accepted = 0;
    let mut converged = false;

    for _ in 0..MAX_ITERATIONS {
        if current <= scale * 1e-28 {
            converged = true;
            break;
        }

        let mut jtj = [[0.0; 4]; 4];
        let mut jtr = [0.0; 4];
        for (&xi, &yi) in x.iter().zip(y) {
            let (value, jac) = model(&p, xi);
            let r = yi - value;
            for i in 0..4 {
                jtr[i] += jac[i] * r;
                for j in 0..4 {
                    jtj[i][j] += jac[i] * jac[j];
                }
            }
        }

        let mut improved = false;
        while lambda <= MAX_LAMBDA {
            let mut damped = jtj;
            for (i, row) in damped.iter_mut().enumerate() {
                row[i] += lambda * jtj[i][i].max(1e-12);
            }
            let Some(step) = solve4(damped, jtr) else {
                lambda *= 10.0;
                continue;
            };
            let mut trial = p;
            trial.iter_mut().zip(step).for_each(|(t, s)| *t += s);
            let trial_cost = cost(&trial, x, y);
            if trial_cost.is_finite() && trial_cost < current {
                let relative = (current - trial_cost) / current;
                p = trial;
                current = trial_cost;
                lambda = (lambda / 10.0).max(1e-12);
                accepted += 1;
                improved = true;
                if relative < RELATIVE_TOLERANCE {
                    converged = true;
                }
                break;
            }
            lambda *= 10.0;
        }

        if converged {
            break;
        }
        if !improved {
            // No downhill step left: a minimum, provided we moved at all.
            converged = accepted > 0;
            break;
        }
    }

    if !converged {
        return Err(DaqError::FitNotConverged(format!(
            "no convergence after {accepted} accepted steps"
        )));
    }

    let [amplitude, center, sigma, offset] = p;
    let sigma = sigma.abs();
    let (x_lo, x_hi) = x
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
    if !(sigma > 0.0 && sigma.is_finite()) || !(x_lo..=x_hi).contains(&center) || amplitude <= 0.0 {
        return Err(DaqError::FitNotConverged(format!(
            "unphysical result: amplitude {amplitude}, center {center}, sigma {sigma}"
        )));
    }

    Ok(PeakFit {
        amplitude,
        center,
        sigma,
        offset,
        fwhm: sigma * FWHM_PER_SIGMA,
        rms_residual: (current / x.len() as f64).sqrt(),
        iterations: accepted,
    })
}

/// Fit the autocorrelation peak of a processed curve.
pub fn fit_autocorrelation(curve: &ProcessedCurve, expected_pulse_duration: f64) -> AppResult<PeakFit> {
    fit_gaussian(&curve.time_axis(), &curve.values(), expected_pulse_duration)
}
